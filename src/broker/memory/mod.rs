// src/broker/memory/mod.rs

//! In-memory brokers.
//!
//! Pure in-process implementations of both broker families. They are used by
//! the test suite and the demos, and they serve as the reference for broker
//! semantics: the Kafka and AMQP bindings approximate this behavior as
//! closely as their underlying systems allow.
//!
//! ## Reference Semantics
//!
//! - A shared "server" value ([`MemoryLogCluster`], [`MemoryQueueServer`])
//!   holds the topics. Each bus gets its own broker handle from it, so two
//!   buses in one process talk exactly as two processes would over a real
//!   broker.
//! - Messages sent before anyone consumes are retained.
//! - No messages are dropped due to timing or scheduling.
//! - Closing a handle wakes any blocked `consume`, which returns `Ok(None)`.
//!
//! ## Non-Goals
//!
//! Persistence, partitions beyond a single one per topic, and network
//! failure simulation.

mod log_broker;
mod queue_broker;

pub use log_broker::{MemoryLogBroker, MemoryLogCluster};
pub use queue_broker::{MemoryQueueBroker, MemoryQueueServer};

use crate::{BusError, Result};

/// Connection lifecycle shared by both memory brokers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Session {
    Idle,
    Connected,
    Closed,
}

impl Session {
    fn ensure_connected(self) -> Result<()> {
        // ---
        match self {
            Session::Connected => Ok(()),
            Session::Idle => Err(BusError::BrokerNotConnected),
            Session::Closed => Err(BusError::BrokerClosed),
        }
    }
}
