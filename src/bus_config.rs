//! Public, broker-agnostic bus configuration.
//!
//! This type intentionally contains no broker-specific concepts; the
//! Kafka and AMQP bindings carry their own connection settings.

use std::time::Duration;

use crate::Shutdown;

/// Bus configuration and reply-wait tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    // ---
    /// Identifier for this bus instance, used as the log prefix.
    pub bus_id: String,

    /// Backoff between reply polls when the reply topic is empty.
    ///
    /// Default: 100ms
    pub poll_interval: Duration,

    /// Optional upper bound on the reply wait of a query `execute`.
    ///
    /// `None` waits until a matching reply arrives or the bus is shut down.
    ///
    /// Default: `None`
    pub reply_timeout: Option<Duration>,

    /// Maximum number of replies held in-process for other local waiters.
    ///
    /// Default: 1024
    pub park_capacity: usize,

    /// Signal observed by `listen` and by query reply waits.
    pub shutdown: Shutdown,
}

impl BusConfig {
    /// Create a config with defaults and the given bus id.
    pub fn new(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            poll_interval: Duration::from_millis(100),
            reply_timeout: None,
            park_capacity: 1024,
            shutdown: Shutdown::never(),
        }
    }

    /// Set the reply poll backoff.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bound every query's reply wait.
    ///
    /// # Example
    ///
    /// ```
    /// use mom_cqrs::BusConfig;
    /// use std::time::Duration;
    ///
    /// let config = BusConfig::new("orders").with_reply_timeout(Duration::from_secs(10));
    /// assert_eq!(config.reply_timeout, Some(Duration::from_secs(10)));
    /// ```
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// Set the in-process parked reply bound.
    pub fn with_park_capacity(mut self, capacity: usize) -> Self {
        self.park_capacity = capacity;
        self
    }

    /// Attach a shutdown signal.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new("bus")
    }
}
