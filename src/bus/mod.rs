// src/bus/mod.rs

//! Command and query buses.
//!
//! A bus binds handlers to message types and moves envelopes between
//! callers and handlers. Every bus follows the same lifecycle:
//!
//! ```text
//! Registering ──listen()──▶ Listening (sealed, terminal, cancellable)
//! ```
//!
//! Handlers may only be registered while the bus is `Registering`.
//! `execute` may be called in either state, but broker-backed buses need a
//! successful `connect()` (or a running `listen`) first.
//!
//! Broker-backed buses come in pairs per broker family ([`log`], [`queue`]).
//! They share the listen loop and envelope handling defined here, and the
//! reply wait in [`correlator`].

use std::future::Future;
use std::sync::Mutex;

use crate::broker::{Broker, Delivery};
use crate::handler::{
    // ---
    wrap_command_handler,
    wrap_query_handler,
    BoxedHandler,
    HandlerRegistry,
};
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    BusConfig,
    BusError,
    Command,
    CorrelationId,
    Envelope,
    Query,
    Result,
    TypeRegistry,
    TypeTag,
};

pub(crate) mod correlator;
pub mod local;
pub mod log;
pub mod queue;

/// Fire-and-forget dispatch of commands.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait CommandBus: Send + Sync {
    // ---
    /// Bind the handler for commands of type `C`.
    ///
    /// # Errors
    ///
    /// [`BusError::AlreadyRegistered`] if `C` already has a handler on this
    /// bus, [`BusError::RegistrySealed`] once the bus is listening.
    fn register_handler<C, F, Fut>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static;

    /// Publish a command and return its correlation id without waiting for
    /// it to be processed.
    ///
    /// # Errors
    ///
    /// [`BusError::HandlerNotFound`] if `C` has no local handler; nothing is
    /// sent in that case.
    async fn execute<C: Command>(&self, command: C) -> Result<CorrelationId>;

    /// Consume and dispatch until cancelled or a fatal fault occurs.
    async fn listen(&self) -> Result<()>;
}

/// Request/response dispatch of queries.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait QueryBus: Send + Sync {
    // ---
    /// Bind the handler for queries of type `Q`.
    ///
    /// Registers both `Q` and `Q::Response` with the bus's type registry.
    fn register_handler<Q, F, Fut>(&self, handler: F) -> Result<()>
    where
        Q: Query,
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Q::Response>> + Send + 'static;

    /// Publish a query and wait for the reply bearing its correlation id.
    async fn execute<Q: Query>(&self, query: Q) -> Result<Q::Response>;

    /// Consume, dispatch and reply until cancelled or a fatal fault occurs.
    async fn listen(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BusState {
    Registering,
    Listening,
}

/// State shared by every bus kind: config, registries, lifecycle.
pub(crate) struct BusCore {
    pub config: BusConfig,
    pub types: TypeRegistry,
    pub handlers: HandlerRegistry,
    state: Mutex<BusState>,
}

impl BusCore {
    pub fn new(config: BusConfig) -> Self {
        // ---
        Self {
            config,
            types: TypeRegistry::new(),
            handlers: HandlerRegistry::default(),
            state: Mutex::new(BusState::Registering),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.bus_id
    }

    /// Bind `handler` and its message types in one step.
    ///
    /// The state lock is held throughout, so a concurrent `begin_listen`
    /// either sees the whole registration in its snapshot or seals first.
    fn register(
        &self,
        tag: TypeTag,
        handler: BoxedHandler,
        types: impl FnOnce(&TypeRegistry),
    ) -> Result<()> {
        // ---
        let state = lock_ignore_poison(&self.state);
        if *state == BusState::Listening {
            return Err(BusError::RegistrySealed);
        }
        self.handlers.insert(tag.clone(), handler)?;
        types(&self.types);
        drop(state);

        log_debug!(self.id() => "registered handler for {tag}");
        Ok(())
    }

    pub fn register_command<C, F, Fut>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // ---
        self.register(C::type_tag(), wrap_command_handler(handler), |types| {
            types.register::<C>();
        })
    }

    pub fn register_query<Q, F, Fut>(&self, handler: F) -> Result<()>
    where
        Q: Query,
        F: Fn(Q) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Q::Response>> + Send + 'static,
    {
        // ---
        self.register(Q::type_tag(), wrap_query_handler(handler), |types| {
            types.register::<Q>();
            types.register::<Q::Response>();
        })
    }

    /// Fail with `HandlerNotFound` unless `tag` has a local handler.
    pub fn ensure_registered(&self, tag: &TypeTag) -> Result<()> {
        // ---
        if self.handlers.contains(tag) {
            Ok(())
        } else {
            Err(BusError::HandlerNotFound(tag.clone()))
        }
    }

    /// Seal the registry and return the topics to consume.
    pub fn begin_listen(&self) -> Result<Vec<String>> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if *state == BusState::Listening {
            return Err(BusError::AlreadyListening);
        }
        *state = BusState::Listening;

        Ok(self
            .handlers
            .tags()
            .into_iter()
            .map(|tag| tag.as_str().to_string())
            .collect())
    }

    /// Reply topics of every registered query type.
    pub fn reply_topics(&self) -> Vec<String> {
        // ---
        self.handlers
            .tags()
            .iter()
            .map(TypeTag::reply_topic)
            .collect()
    }

    /// Run the handler bound to `topic` on an inbound envelope.
    pub async fn dispatch(&self, topic: &str, envelope: &Envelope) -> Result<Option<Envelope>> {
        // ---
        let handler = self
            .handlers
            .get(topic)
            .ok_or_else(|| BusError::HandlerNotFound(TypeTag::from(topic)))?;
        let request = self.types.to_request(envelope)?;
        handler(request, envelope).await
    }
}

/// Acknowledgement model of the broker behind a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Family {
    /// Offset commit; a rejected record is simply skipped.
    Log,
    /// Per-message ack; a rejected message can be requeued.
    Queue,
}

/// Settle a delivery that must never be redelivered.
async fn discard<B: Broker>(broker: &B, token: &B::Token, family: Family) -> Result<()> {
    // ---
    match family {
        Family::Log => broker.ack(token).await,
        Family::Queue => broker.reject(token, false).await,
    }
}

/// Publish a command envelope after the local handler check.
pub(crate) async fn send_command<B: Broker, C: Command>(
    core: &BusCore,
    broker: &B,
    command: C,
) -> Result<CorrelationId> {
    // ---
    core.ensure_registered(&C::type_tag())?;

    let envelope = Envelope::encode(&command, None)?;
    broker.send(C::TYPE_TAG, envelope.serialize()?).await?;

    log_debug!(core.id() => "sent {} as {}", C::TYPE_TAG, envelope.correlation_id());
    Ok(envelope.correlation_id().clone())
}

/// The listen loop shared by every broker-backed bus.
///
/// Connects the registered topics, then consumes until the shutdown signal
/// fires or a fatal fault occurs. The broker is closed exactly once on every
/// exit path.
pub(crate) async fn listen<B: Broker>(core: &BusCore, broker: &B, family: Family) -> Result<()> {
    // ---
    let topics = core.begin_listen()?;

    let result = serve(core, broker, &topics, family).await;

    if let Err(e) = broker.close().await {
        log_warn!(core.id() => "closing broker failed: {e}");
    }

    match &result {
        Err(BusError::Cancelled) => {
            log_info!(core.id() => "listen cancelled");
        }
        Err(e) => {
            log_error!(core.id() => "listen aborted: {e}");
        }
        Ok(()) => {}
    }
    result
}

async fn serve<B: Broker>(
    core: &BusCore,
    broker: &B,
    topics: &[String],
    family: Family,
) -> Result<()> {
    // ---
    broker.connect(topics).await?;
    log_info!(core.id() => "listening on {:?}", topics);

    let shutdown = &core.config.shutdown;
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.triggered() => return Err(BusError::Cancelled),
            next = broker.consume(topics) => next?,
        };

        let Some(delivery) = next else {
            return Err(BusError::BrokerClosed);
        };
        handle_delivery(core, broker, delivery, family).await?;
    }
}

/// Process one inbound delivery.
///
/// Returns `Err` only for faults that must stop the loop: an unroutable
/// topic, an undecodable envelope, an unknown type, or a broker failure.
async fn handle_delivery<B: Broker>(
    core: &BusCore,
    broker: &B,
    delivery: Delivery<B::Token>,
    family: Family,
) -> Result<()> {
    // ---
    let Delivery {
        topic,
        payload,
        token,
    } = delivery;

    let tag = TypeTag::from(topic.as_str());
    if !core.handlers.contains(&tag) {
        log_error!(core.id() => "no handler for {topic}, returning {token}");
        broker.reject(&token, true).await?;
        return Err(BusError::HandlerNotFound(tag));
    }

    let envelope = match Envelope::decode(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            log_error!(core.id() => "dropping {token}: {e}");
            discard(broker, &token, family).await?;
            return Err(e);
        }
    };

    match core.dispatch(&topic, &envelope).await {
        Ok(reply) => {
            if let Some(reply) = reply {
                let reply_topic = envelope.type_tag().reply_topic();
                broker.send(&reply_topic, reply.serialize()?).await?;
                log_debug!(core.id() => "replied on {reply_topic} to {}", reply.correlation_id());
            }
            broker.ack(&token).await
        }
        Err(e @ BusError::UnknownType(_)) => {
            log_error!(core.id() => "dropping {token}: {e}");
            discard(broker, &token, family).await?;
            Err(e)
        }
        Err(e) => {
            log_error!(
                core.id() => "handler for {topic} failed on {}: {e}",
                envelope.correlation_id()
            );
            discard(broker, &token, family).await
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Noop;

    impl crate::Message for Noop {
        const TYPE_TAG: &'static str = "test.Noop";
    }

    impl Command for Noop {}

    #[test]
    fn test_registry_sealed_after_listen() {
        // ---
        let core = BusCore::new(BusConfig::new("core"));
        core.register_command(|_: Noop| async { Ok(()) }).unwrap();

        assert_eq!(core.begin_listen().unwrap(), vec!["test.Noop".to_string()]);
        assert!(matches!(
            core.begin_listen().unwrap_err(),
            BusError::AlreadyListening
        ));
        assert!(matches!(
            core.register_command(|_: Noop| async { Ok(()) }).unwrap_err(),
            BusError::RegistrySealed
        ));
    }

    #[test]
    fn test_reply_topics_follow_registered_tags() {
        // ---
        let core = BusCore::new(BusConfig::default());
        core.register_command(|_: Noop| async { Ok(()) }).unwrap();
        assert_eq!(core.reply_topics(), vec!["test.Noop-Response".to_string()]);
    }

    #[test]
    fn test_registration_racing_listen_lands_in_snapshot_or_fails() {
        // ---
        let core = BusCore::new(BusConfig::new("core"));

        let (registered, topics) = std::thread::scope(|scope| {
            let registrar = scope.spawn(|| {
                let mut registered = 0;
                for i in 0..500 {
                    let tag = TypeTag::from(format!("test.Noop{i}"));
                    let handler = wrap_command_handler(|_: Noop| async { Ok(()) });
                    match core.register(tag, handler, |types| types.register::<Noop>()) {
                        Ok(()) => registered += 1,
                        Err(e) => assert!(matches!(e, BusError::RegistrySealed)),
                    }
                }
                registered
            });
            std::thread::yield_now();
            let topics = core.begin_listen().unwrap();
            (registrar.join().unwrap(), topics)
        });

        assert_eq!(topics.len(), registered);
        assert_eq!(core.handlers.tags().len(), registered);
    }
}
