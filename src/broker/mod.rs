// src/broker/mod.rs

//! Broker port.
//!
//! This module defines the minimal capability set buses consume from a
//! message broker. It intentionally avoids any reference to concrete client
//! libraries; bindings live in submodules and are hidden behind feature
//! flags.
//!
//! A broker is responsible only for moving opaque payloads between topics
//! and tracking acknowledgement. Envelope encoding, handler dispatch and
//! reply correlation are handled by the buses.
//!
//! # Families
//!
//! Two acknowledgement models exist, each with its own token type:
//!
//! - [`LogBroker`]: partitioned, offset-addressed logs read by a consumer
//!   group. Acking commits progress for the whole partition up to that
//!   offset; rejecting does nothing, the position simply moves past.
//! - [`QueueBroker`]: durable queues with per-message ack and
//!   negative-ack. A rejected message with `requeue = true` is redelivered.
//!
//! # Lifecycle
//!
//! `connect` must succeed before `send`, `consume` or `poll`; otherwise they
//! fail with [`BusError::BrokerNotConnected`](crate::BusError::BrokerNotConnected).
//! `close` is idempotent and terminal.

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::Result;

pub mod memory;

#[cfg(feature = "broker_kafka")]
pub mod kafka;

#[cfg(feature = "broker_lapin")]
pub mod amqp;

/// Identity of one reply reader on a shared broker handle.
///
/// Every query bus polls with its own reader. On log brokers each reader
/// keeps a private cursor, so two buses sharing a handle both see every
/// reply. Queue brokers ignore it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReaderId(Arc<str>);

impl ReaderId {
    /// A fresh, process-unique reader.
    pub fn generate() -> Self {
        // ---
        Self(uuid::Uuid::new_v4().simple().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        // ---
        &self.0
    }
}

impl From<&str> for ReaderId {
    fn from(value: &str) -> Self {
        // ---
        Self(value.into())
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which consumer handle produced a delivery.
///
/// Request consumption (`consume`) and reply polling (`poll`) run on
/// separate handles so a listen loop and concurrent reply waiters never
/// share a cursor or channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    Requests,
    Replies(ReaderId),
}

/// Position of a record in a partitioned log.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LogOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub lane: Lane,
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Per-message acknowledgement handle of a queue delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub queue: String,
    pub tag: u64,
    pub lane: Lane,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.queue, self.tag)
    }
}

/// One message pulled from a broker.
#[derive(Clone, Debug)]
pub struct Delivery<T> {
    pub topic: String,
    pub payload: Bytes,
    pub token: T,
}

/// Broker capability set consumed by buses.
///
/// Implementations must tolerate concurrent `send`, `consume` and `poll`
/// from different tasks.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    // ---
    /// Acknowledgement handle carried by each delivery.
    type Token: Clone + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Identifier used as the log prefix.
    fn broker_id(&self) -> &str;

    /// Establish the session and declare interest in `topics`.
    ///
    /// Idempotent. Calling again with an empty list or a superset is safe.
    async fn connect(&self, topics: &[String]) -> Result<()>;

    /// At-least-once publish.
    async fn send(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Blocking pull of the next message on any of `topics`.
    ///
    /// Returns `Ok(None)` once the session has been closed.
    async fn consume(&self, topics: &[String]) -> Result<Option<Delivery<Self::Token>>>;

    /// Non-blocking pull from a single topic on behalf of `reader`.
    async fn poll(&self, reader: &ReaderId, topic: &str) -> Result<Option<Delivery<Self::Token>>>;

    /// Acknowledge a delivery.
    async fn ack(&self, token: &Self::Token) -> Result<()>;

    /// Negatively acknowledge a delivery.
    async fn reject(&self, token: &Self::Token, requeue: bool) -> Result<()>;

    /// Release every broker handle. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Partitioned-log broker with monotonic offset commit.
pub trait LogBroker: Broker<Token = LogOffset> {}

impl<B> LogBroker for B where B: Broker<Token = LogOffset> {}

/// Queue broker with per-message ack and requeue.
pub trait QueueBroker: Broker<Token = DeliveryTag> {}

impl<B> QueueBroker for B where B: Broker<Token = DeliveryTag> {}

/// Per-broker operation counters, exposed by the in-memory brokers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub sends: u64,
    pub consumed: u64,
    pub polled: u64,
    pub acks: u64,
    pub rejects: u64,
    pub closes: u64,
}
