// src/bus/correlator.rs

//! Reply correlation shared by every broker-backed query bus.
//!
//! A query `execute` publishes its request, then polls the derived reply
//! topic until an envelope carrying its correlation id shows up. Several
//! queries of one bus may wait on the same reply topic at once, and other
//! processes may be waiting there too, so a reply that does not match is
//! never dropped:
//!
//! - a reply for another waiter of this bus is parked in-process, still
//!   unacked, and the owner acks it when it picks it up;
//! - a reply nobody here waits for is held unacked for the rest of the
//!   current scan and released with requeue as soon as the reply topic runs
//!   dry, the match is found, or the wait ends. Releasing per pass, rather
//!   than per message, keeps a stale reply at the head of a queue from
//!   hiding the replies behind it.
//!
//! On a log broker releasing is a no-op: the record stays in the log for
//! every other reply reader. Each correlator polls as its own
//! [`ReaderId`], so buses sharing one broker handle never share a reply
//! cursor.
//!
//! A parked reply whose waiter gives up (timeout or cancellation) becomes an
//! orphan. The next scan on this bus discards it with `reject(false)`.
//!
//! Waiters register before their request is sent, so a reply that races
//! ahead of its own waiter is still recognised as local.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::time::Instant;

use crate::broker::{Broker, Delivery, ReaderId};
use crate::bus::BusCore;
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_warn,
    BusError,
    CorrelationId,
    Envelope,
    Query,
    Result,
};

/// In-process bookkeeping of pending replies for one bus.
pub(crate) struct Correlator<T> {
    reader: ReaderId,
    waiting: Mutex<HashSet<CorrelationId>>,
    parked: Mutex<HashMap<CorrelationId, (Envelope, T)>>,
    /// Tokens of parked replies whose waiter is gone.
    orphans: Mutex<Vec<T>>,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self {
            reader: ReaderId::generate(),
            waiting: Mutex::new(HashSet::new()),
            parked: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }
}

/// Deregisters a waiter when its `execute` ends, however it ends.
pub(crate) struct Waiter<'a, T> {
    correlator: &'a Correlator<T>,
    correlation_id: CorrelationId,
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        // ---
        let mut waiting = lock_ignore_poison(&self.correlator.waiting);
        waiting.remove(&self.correlation_id);
        let parked = lock_ignore_poison(&self.correlator.parked).remove(&self.correlation_id);
        if let Some((_, token)) = parked {
            lock_ignore_poison(&self.correlator.orphans).push(token);
        }
    }
}

enum Step<T> {
    Matched(Envelope, T),
    Parked,
    Foreign(T),
}

/// Give held foreign replies back to the broker.
async fn release<B: Broker>(broker: &B, held: &mut Vec<B::Token>) -> Result<()> {
    // ---
    for token in held.drain(..) {
        broker.reject(&token, true).await?;
    }
    Ok(())
}

impl<T> Correlator<T>
where
    T: Clone + std::fmt::Display + Send + Sync + 'static,
{
    pub fn register(&self, correlation_id: CorrelationId) -> Waiter<'_, T> {
        // ---
        lock_ignore_poison(&self.waiting).insert(correlation_id.clone());
        Waiter {
            correlator: self,
            correlation_id,
        }
    }

    #[cfg(test)]
    pub fn parked(&self) -> usize {
        lock_ignore_poison(&self.parked).len()
    }

    /// Discard replies parked for waiters that no longer exist.
    async fn settle_orphans<B>(&self, core: &BusCore, broker: &B) -> Result<()>
    where
        B: Broker<Token = T>,
    {
        // ---
        let orphans = std::mem::take(&mut *lock_ignore_poison(&self.orphans));
        for token in orphans {
            log_debug!(core.id() => "discarding orphaned reply {token}");
            broker.reject(&token, false).await?;
        }
        Ok(())
    }

    fn take_parked(&self, correlation_id: &CorrelationId) -> Option<(Envelope, T)> {
        lock_ignore_poison(&self.parked).remove(correlation_id)
    }

    /// Sort one reply into matched, parked for a local waiter, or foreign.
    fn classify(
        &self,
        expected: &CorrelationId,
        envelope: Envelope,
        token: T,
        capacity: usize,
    ) -> Step<T> {
        // ---
        if envelope.correlation_id() == expected {
            return Step::Matched(envelope, token);
        }

        // Lock order: waiting, then parked.
        let waiting = lock_ignore_poison(&self.waiting);
        if !waiting.contains(envelope.correlation_id()) {
            return Step::Foreign(token);
        }

        let mut parked = lock_ignore_poison(&self.parked);
        if parked.len() >= capacity {
            return Step::Foreign(token);
        }
        parked.insert(envelope.correlation_id().clone(), (envelope, token));
        Step::Parked
    }

    /// Poll `reply_topic` until the reply for `expected` arrives or the
    /// bus's reply timeout elapses.
    ///
    /// Cancellation is left to the caller, which closes the broker and so
    /// returns anything still held.
    pub async fn await_reply<B>(
        &self,
        core: &BusCore,
        broker: &B,
        reply_topic: &str,
        expected: &CorrelationId,
    ) -> Result<Envelope>
    where
        B: Broker<Token = T>,
    {
        // ---
        let mut held = Vec::new();
        let result = self
            .scan(core, broker, reply_topic, expected, &mut held)
            .await;

        if let Err(e) = release(broker, &mut held).await {
            log_warn!(core.id() => "releasing held replies failed: {e}");
        }
        result
    }

    async fn scan<B>(
        &self,
        core: &BusCore,
        broker: &B,
        reply_topic: &str,
        expected: &CorrelationId,
        held: &mut Vec<T>,
    ) -> Result<Envelope>
    where
        B: Broker<Token = T>,
    {
        // ---
        let config = &core.config;
        let deadline = config.reply_timeout.map(|limit| Instant::now() + limit);

        loop {
            self.settle_orphans(core, broker).await?;

            if let Some((envelope, token)) = self.take_parked(expected) {
                broker.ack(&token).await?;
                return Ok(envelope);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(BusError::Timeout);
            }

            let Some(Delivery { payload, token, .. }) =
                broker.poll(&self.reader, reply_topic).await?
            else {
                release(broker, held).await?;

                let mut pause = config.poll_interval;
                if let Some(deadline) = deadline {
                    pause = pause.min(deadline.saturating_duration_since(Instant::now()));
                }
                tokio::time::sleep(pause).await;
                continue;
            };

            let envelope = match Envelope::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log_warn!(core.id() => "discarding undecodable reply {token}: {e}");
                    broker.reject(&token, false).await?;
                    return Err(e);
                }
            };

            let found = envelope.correlation_id().clone();
            match self.classify(expected, envelope, token, config.park_capacity) {
                Step::Matched(envelope, token) => {
                    broker.ack(&token).await?;
                    return Ok(envelope);
                }
                Step::Parked => {
                    log_debug!(core.id() => "parked reply {found} while waiting for {expected}");
                }
                Step::Foreign(token) => {
                    log_debug!(core.id() => "holding foreign reply {found} ({token})");
                    held.push(token);
                }
            }
        }
    }
}

/// Publish a query and wait for its correlated reply.
///
/// The wait observes the bus's shutdown signal and its optional reply
/// timeout. Cancellation closes the broker before returning
/// [`BusError::Cancelled`].
pub(crate) async fn send_query<B, Q>(
    core: &BusCore,
    broker: &B,
    correlator: &Correlator<B::Token>,
    query: Q,
) -> Result<Q::Response>
where
    B: Broker,
    Q: Query,
{
    // ---
    let tag = Q::type_tag();
    core.ensure_registered(&tag)?;

    let envelope = Envelope::encode(&query, None)?;
    let expected = envelope.correlation_id().clone();
    let reply_topic = tag.reply_topic();

    let _waiter = correlator.register(expected.clone());

    let exchange = async {
        broker.send(tag.as_str(), envelope.serialize()?).await?;
        log_debug!(core.id() => "sent {tag} as {expected}, awaiting {reply_topic}");

        correlator
            .await_reply(core, broker, &reply_topic, &expected)
            .await
    };

    let reply = tokio::select! {
        biased;
        _ = core.config.shutdown.triggered() => {
            if let Err(e) = broker.close().await {
                log_warn!(core.id() => "closing broker failed: {e}");
            }
            return Err(BusError::Cancelled);
        }
        reply = exchange => reply?,
    };

    core.types.to_typed::<Q::Response>(&reply)
}
