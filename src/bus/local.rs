// src/bus/local.rs

//! In-process buses.
//!
//! Same registration and dispatch contract as the broker-backed buses, with
//! no broker in between: `execute` runs the handler directly and awaits it.
//! Requests and replies still go through the wire encoding, so a type that
//! works locally works across a broker unchanged.
//!
//! Unlike the broker-backed command buses, a local command `execute` only
//! returns after the handler has finished, and a handler error is returned
//! to the caller.

use std::future::Future;

use crate::bus::{BusCore, CommandBus, QueryBus};
use crate::{
    // ---
    log_debug,
    log_info,
    BusConfig,
    BusError,
    Command,
    CorrelationId,
    Envelope,
    Message,
    Query,
    Result,
};

/// Pass `message` through the wire format, as a broker would.
fn over_the_wire<M: Message>(message: &M) -> Result<Envelope> {
    // ---
    Envelope::decode(&Envelope::encode(message, None)?.serialize()?)
}

/// Wait for shutdown after sealing the registry; there is nothing to consume.
async fn idle(core: &BusCore) -> Result<()> {
    // ---
    core.begin_listen()?;
    log_info!(core.id() => "listening in-process");
    core.config.shutdown.triggered().await;
    Err(BusError::Cancelled)
}

/// Command bus dispatching in the calling task.
pub struct LocalCommandBus {
    core: BusCore,
}

impl LocalCommandBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            core: BusCore::new(config),
        }
    }
}

impl Default for LocalCommandBus {
    fn default() -> Self {
        Self::new(BusConfig::new("local-commands"))
    }
}

#[async_trait::async_trait]
impl CommandBus for LocalCommandBus {
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
        // ---
        self.core.ensure_registered(&C::type_tag())?;

        let envelope = over_the_wire(&command)?;
        log_debug!(self.core.id() => "dispatching {} as {}", C::TYPE_TAG, envelope.correlation_id());
        self.core.dispatch(C::TYPE_TAG, &envelope).await?;
        Ok(envelope.correlation_id().clone())
    }

    async fn listen(&self) -> Result<()> {
        idle(&self.core).await
    }
}

/// Query bus dispatching in the calling task.
pub struct LocalQueryBus {
    core: BusCore,
}

impl LocalQueryBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            core: BusCore::new(config),
        }
    }
}

impl Default for LocalQueryBus {
    fn default() -> Self {
        Self::new(BusConfig::new("local-queries"))
    }
}

#[async_trait::async_trait]
impl QueryBus for LocalQueryBus {
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
        // ---
        self.core.ensure_registered(&Q::type_tag())?;

        let envelope = over_the_wire(&query)?;
        let reply = self
            .core
            .dispatch(Q::TYPE_TAG, &envelope)
            .await?
            .ok_or_else(|| BusError::handler(format!("`{}` produced no reply", Q::TYPE_TAG)))?;

        let reply = Envelope::decode(&reply.serialize()?)?;
        self.core.types.to_typed::<Q::Response>(&reply)
    }

    async fn listen(&self) -> Result<()> {
        idle(&self.core).await
    }
}
