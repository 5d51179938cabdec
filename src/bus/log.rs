// src/bus/log.rs

//! Buses over a partitioned-log broker (Kafka and the in-memory log).
//!
//! Requests are consumed through the broker's consumer group, so several
//! listening instances split the load. Offsets are committed after the
//! handler finishes (and, for queries, after the reply is published), so a
//! crash mid-handler replays the request.
//!
//! A failed handler commits past its record; an undecodable record is
//! committed past as well before the loop aborts, so a restart does not trip
//! over it again.

use std::future::Future;
use std::sync::Arc;

use crate::broker::LogBroker;
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

/// Command bus over a log broker.
pub struct LogCommandBus<B: LogBroker> {
    core: BusCore,
    broker: Arc<B>,
}

impl<B: LogBroker> LogCommandBus<B> {
    pub fn new(broker: Arc<B>, config: BusConfig) -> Self {
        Self {
            core: BusCore::new(config),
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Open the broker session so `execute` can publish.
    pub async fn connect(&self) -> Result<()> {
        // ---
        self.broker.connect(&[]).await?;
        log_info!(self.core.id() => "connected via {}", self.broker.broker_id());
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B: LogBroker> CommandBus for LogCommandBus<B> {
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
        listen(&self.core, &*self.broker, Family::Log).await
    }
}

/// Query bus over a log broker.
///
/// Replies are read through this bus's own reply reader, so every query
/// bus instance sees every reply and keeps only its own, even when several
/// buses share one broker handle.
pub struct LogQueryBus<B: LogBroker> {
    core: BusCore,
    broker: Arc<B>,
    correlator: Correlator<B::Token>,
}

impl<B: LogBroker> LogQueryBus<B> {
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

    /// Open the broker session and declare the reply topics of every
    /// registered query.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let reply_topics = self.core.reply_topics();
        self.broker.connect(&reply_topics).await?;
        log_info!(self.core.id() => "connected via {}, replies on {:?}", self.broker.broker_id(), reply_topics);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<B: LogBroker> QueryBus for LogQueryBus<B> {
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
        listen(&self.core, &*self.broker, Family::Log).await
    }
}
