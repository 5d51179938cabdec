//! Command and query buses over message brokers, with envelope-based
//! request/response correlation
//!
//! This library dispatches typed commands and queries to registered handlers,
//! either in-process or across a broker. It handles envelope encoding, type
//! reconstruction, correlation id generation, reply matching over shared
//! reply topics, and cooperative cancellation.
//!
//! Two broker families are supported:
//! - partitioned logs with offset commit (Kafka, feature `broker_kafka`)
//! - durable queues with per-message ack (AMQP, feature `broker_lapin`)
//!
//! Both have in-memory implementations that are always available.
//!

// Macros first so every module below can use them.
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod lock;

mod bus_config;
mod correlation;
mod envelope;
mod error;
mod handler;
mod message;
mod registry;
mod shutdown;

pub mod broker;
pub mod bus;

// Re-export main types
pub use bus::local::{LocalCommandBus, LocalQueryBus};
pub use bus::log::{LogCommandBus, LogQueryBus};
pub use bus::queue::{QueueCommandBus, QueueQueryBus};
pub use bus::{CommandBus, QueryBus};

pub use bus_config::BusConfig;

pub use correlation::CorrelationId;
pub use error::{BusError, Result};

// --- public re-exports
pub use broker::{
    //
    Broker,
    BrokerStats,
    Delivery,
    DeliveryTag,
    Lane,
    LogBroker,
    LogOffset,
    QueueBroker,
    ReaderId,
};
pub use envelope::{Envelope, Parameters};
pub use message::{Command, Message, Query, TypeTag, REPLY_SUFFIX};
pub use registry::{AnyMessage, TypeRegistry};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
