// src/bus/queue.rs

//! Buses over a queue broker (AMQP and the in-memory queues).
//!
//! Every request queue is durable. A request is acked once its handler
//! finishes (and, for queries, once the reply is published); a failed
//! handler rejects it without requeue, so a poison request is not
//! redelivered forever. A request arriving on a queue this bus has no
//! handler for is rejected with requeue before the loop aborts, leaving it
//! for a correctly configured consumer.
//!
//! ## Reply queues
//!
//! All query buses for one query type share its reply queue. A waiter holds
//! replies that belong to other processes only until it reaches the end of
//! the queue, then requeues them, so they stay available to their owners
//! between scans.

use std::future::Future;
use std::sync::Arc;

use crate::broker::QueueBroker;
use crate::bus::correlator::{send_query, Correlator};
use crate::bus::{listen, send_command, BusCore, CommandBus, Family, QueryBus};
use crate::{
    // ---
    log_info,
    BusConfig,
    Command,
    CorrelationId,
    Query,
    Result,
};

/// Command bus over a queue broker.
pub struct QueueCommandBus<B: QueueBroker> {
    core: BusCore,
    broker: Arc<B>,
}

impl<B: QueueBroker> QueueCommandBus<B> {
    pub fn new(broker: Arc<B>, config: BusConfig) -> Self {
        Self {
            core: BusCore::new(config),
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Open the broker session and declare a request queue for every
    /// registered command, so commands sent before a listener starts are
    /// retained.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let queues: Vec<String> = self
            .core
            .handlers
            .tags()
            .iter()
            .map(|tag| tag.as_str().to_string())
            .collect();
        self.broker.connect(&queues).await?;
        log_info!(self.core.id() => "connected via {}, declared {:?}", self.broker.broker_id(), queues);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B: QueueBroker> CommandBus for QueueCommandBus<B> {
    // ---
    fn register_handler<C, F, Fut>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.core.register_command(handler)
    }

    async fn execute<C: Command>(&self, command: C) -> Result<CorrelationId> {
        send_command(&self.core, &*self.broker, command).await
    }

    async fn listen(&self) -> Result<()> {
        listen(&self.core, &*self.broker, Family::Queue).await
    }
}

/// Query bus over a queue broker.
pub struct QueueQueryBus<B: QueueBroker> {
    core: BusCore,
    broker: Arc<B>,
    correlator: Correlator<B::Token>,
}

impl<B: QueueBroker> QueueQueryBus<B> {
    pub fn new(broker: Arc<B>, config: BusConfig) -> Self {
        Self {
            core: BusCore::new(config),
            broker,
            correlator: Correlator::default(),
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Open the broker session and declare the reply queue of every
    /// registered query.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let reply_queues = self.core.reply_topics();
        self.broker.connect(&reply_queues).await?;
        log_info!(self.core.id() => "connected via {}, replies on {:?}", self.broker.broker_id(), reply_queues);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B: QueueBroker> QueryBus for QueueQueryBus<B> {
    // ---
    fn register_handler<Q, F, Fut>(&self, handler: F) -> Result<()>
    where
        Q: Query,
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Q::Response>> + Send + 'static,
    {
        self.core.register_query(handler)
    }

    async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Response> {
        send_query(&self.core, &*self.broker, &self.correlator, query).await
    }

    async fn listen(&self) -> Result<()> {
        listen(&self.core, &*self.broker, Family::Queue).await
    }
}
