// src/broker/memory/queue_broker.rs

//! In-memory durable queues.
//!
//! Queues are created on first use and retain messages until a consumer
//! acks them. A delivered message is held as unacked under its delivery tag:
//! `ack` or `reject(requeue = false)` discards it, `reject(requeue = true)`
//! puts it back at the head of its queue. Closing a broker handle requeues
//! whatever it still holds unacked.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use super::Session;
use crate::broker::{Broker, BrokerStats, Delivery, DeliveryTag, Lane, ReaderId};
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    BusError,
    Result,
};

struct Unacked {
    queue: String,
    payload: Bytes,
    owner: u64,
}

#[derive(Default)]
struct ServerState {
    queues: HashMap<String, VecDeque<Bytes>>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
}

impl ServerState {
    fn take(&mut self, queue: &str, owner: u64, lane: Lane) -> Option<Delivery<DeliveryTag>> {
        // ---
        let payload = self.queues.get_mut(queue)?.pop_front()?;
        self.next_tag += 1;
        let tag = self.next_tag;
        self.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                payload: payload.clone(),
                owner,
            },
        );

        Some(Delivery {
            topic: queue.to_string(),
            payload,
            token: DeliveryTag {
                queue: queue.to_string(),
                tag,
                lane,
            },
        })
    }

    fn requeue(&mut self, tag: u64) -> bool {
        // ---
        match self.unacked.remove(&tag) {
            Some(m) => {
                self.queues.entry(m.queue).or_default().push_front(m.payload);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct ServerInner {
    state: Mutex<ServerState>,
    available: Notify,
    next_connection: AtomicU64,
}

/// Shared queue storage. Clone it to hand the same server to several buses.
#[derive(Clone, Default)]
pub struct MemoryQueueServer {
    inner: Arc<ServerInner>,
}

impl MemoryQueueServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new broker handle, standing in for one client connection.
    pub fn broker(&self, broker_id: impl Into<String>) -> MemoryQueueBroker {
        // ---
        MemoryQueueBroker {
            broker_id: broker_id.into(),
            connection: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            server: self.clone(),
            state: Mutex::new(BrokerState {
                session: Session::Idle,
                stats: BrokerStats::default(),
            }),
            closed: Notify::new(),
        }
    }

    /// Messages ready for delivery on `queue`, head first.
    pub fn ready(&self, queue: &str) -> Vec<Bytes> {
        // ---
        lock_ignore_poison(&self.inner.state)
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of delivered but not yet settled messages, across all queues.
    pub fn unacked(&self) -> usize {
        lock_ignore_poison(&self.inner.state).unacked.len()
    }

    /// Enqueue a raw payload without going through a broker handle.
    pub fn publish(&self, queue: &str, payload: Bytes) {
        // ---
        lock_ignore_poison(&self.inner.state)
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload);
        self.inner.available.notify_waiters();
    }
}

struct BrokerState {
    session: Session,
    stats: BrokerStats,
}

/// Broker handle onto a [`MemoryQueueServer`].
pub struct MemoryQueueBroker {
    broker_id: String,
    connection: u64,
    server: MemoryQueueServer,
    state: Mutex<BrokerState>,
    closed: Notify,
}

impl MemoryQueueBroker {
    pub fn stats(&self) -> BrokerStats {
        lock_ignore_poison(&self.state).stats
    }
}

#[async_trait::async_trait]
impl Broker for MemoryQueueBroker {
    // ---
    type Token = DeliveryTag;

    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    /// Declares each queue, durable and empty if new.
    async fn connect(&self, topics: &[String]) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if state.session == Session::Closed {
                return Err(BusError::BrokerClosed);
            }
            state.session = Session::Connected;
        }

        let mut server = lock_ignore_poison(&self.server.inner.state);
        for topic in topics {
            server.queues.entry(topic.clone()).or_default();
        }
        log_info!(self.broker_id => "connected, declared {:?}", topics);
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.session.ensure_connected()?;
            state.stats.sends += 1;
        }
        self.server.publish(topic, payload);
        log_debug!(self.broker_id => "published to {topic}");
        Ok(())
    }

    async fn consume(&self, topics: &[String]) -> Result<Option<Delivery<DeliveryTag>>> {
        // ---
        loop {
            let available = self.server.inner.available.notified();
            let closed = self.closed.notified();
            tokio::pin!(available);
            tokio::pin!(closed);
            available.as_mut().enable();
            closed.as_mut().enable();

            {
                let mut state = lock_ignore_poison(&self.state);
                match state.session {
                    Session::Closed => return Ok(None),
                    Session::Idle => return Err(BusError::BrokerNotConnected),
                    Session::Connected => {}
                }

                let mut server = lock_ignore_poison(&self.server.inner.state);
                for topic in topics {
                    if let Some(delivery) = server.take(topic, self.connection, Lane::Requests) {
                        state.stats.consumed += 1;
                        return Ok(Some(delivery));
                    }
                }
            }

            tokio::select! {
                _ = &mut available => {}
                _ = &mut closed => {}
            }
        }
    }

    async fn poll(&self, reader: &ReaderId, topic: &str) -> Result<Option<Delivery<DeliveryTag>>> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.session.ensure_connected()?;

        let lane = Lane::Replies(reader.clone());
        let delivery = lock_ignore_poison(&self.server.inner.state).take(topic, self.connection, lane);
        if delivery.is_some() {
            state.stats.polled += 1;
        }
        Ok(delivery)
    }

    async fn ack(&self, token: &DeliveryTag) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.session.ensure_connected()?;
            state.stats.acks += 1;
        }

        if lock_ignore_poison(&self.server.inner.state)
            .unacked
            .remove(&token.tag)
            .is_none()
        {
            return Err(BusError::Transport(format!("unknown delivery tag {token}")));
        }
        Ok(())
    }

    async fn reject(&self, token: &DeliveryTag, requeue: bool) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.session.ensure_connected()?;
            state.stats.rejects += 1;
        }

        let known = {
            let mut server = lock_ignore_poison(&self.server.inner.state);
            if requeue {
                server.requeue(token.tag)
            } else {
                server.unacked.remove(&token.tag).is_some()
            }
        };
        if !known {
            return Err(BusError::Transport(format!("unknown delivery tag {token}")));
        }

        if requeue {
            self.server.inner.available.notify_waiters();
        }
        log_debug!(self.broker_id => "rejected {token} (requeue={requeue})");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.stats.closes += 1;
            if state.session == Session::Closed {
                return Ok(());
            }
            state.session = Session::Closed;
        }

        let requeued = {
            let mut server = lock_ignore_poison(&self.server.inner.state);
            let held: Vec<u64> = server
                .unacked
                .iter()
                .filter(|(_, m)| m.owner == self.connection)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in &held {
                server.requeue(*tag);
            }
            held.len()
        };

        self.closed.notify_waiters();
        if requeued > 0 {
            self.server.inner.available.notify_waiters();
        }
        log_info!(self.broker_id => "closed, requeued {requeued} unacked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers_first() {
        // ---
        let server = MemoryQueueServer::new();
        let broker = server.broker("b");
        broker.connect(&queues(&["q"])).await.unwrap();
        broker.send("q", Bytes::from("a")).await.unwrap();
        broker.send("q", Bytes::from("b")).await.unwrap();

        let a = broker.consume(&queues(&["q"])).await.unwrap().unwrap();
        broker.reject(&a.token, true).await.unwrap();

        let again = broker.consume(&queues(&["q"])).await.unwrap().unwrap();
        assert_eq!(again.payload, Bytes::from("a"));
        assert_ne!(again.token.tag, a.token.tag);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        // ---
        let server = MemoryQueueServer::new();
        let broker = server.broker("b");
        broker.connect(&queues(&["q"])).await.unwrap();
        broker.send("q", Bytes::from("a")).await.unwrap();

        let a = broker.poll(&ReaderId::from("r"), "q").await.unwrap().unwrap();
        assert_eq!(a.token.lane, Lane::Replies(ReaderId::from("r")));
        broker.reject(&a.token, false).await.unwrap();

        assert!(server.ready("q").is_empty());
        assert_eq!(server.unacked(), 0);
    }

    #[tokio::test]
    async fn test_messages_survive_until_consumer_connects() {
        // ---
        let server = MemoryQueueServer::new();
        let producer = server.broker("producer");
        producer.connect(&[]).await.unwrap();
        producer.send("q", Bytes::from("early")).await.unwrap();
        producer.close().await.unwrap();

        let consumer = server.broker("consumer");
        consumer.connect(&queues(&["q"])).await.unwrap();
        let d = consumer.consume(&queues(&["q"])).await.unwrap().unwrap();
        assert_eq!(d.payload, Bytes::from("early"));
    }

    #[tokio::test]
    async fn test_close_requeues_unacked() {
        // ---
        let server = MemoryQueueServer::new();
        let broker = server.broker("b");
        broker.connect(&queues(&["q"])).await.unwrap();
        broker.send("q", Bytes::from("held")).await.unwrap();
        let _held = broker.consume(&queues(&["q"])).await.unwrap().unwrap();
        assert_eq!(server.unacked(), 1);

        broker.close().await.unwrap();

        assert_eq!(server.unacked(), 0);
        assert_eq!(server.ready("q"), vec![Bytes::from("held")]);
        assert!(broker.consume(&queues(&["q"])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_before_connect_fails() {
        // ---
        let broker = MemoryQueueServer::new().broker("b");
        assert!(matches!(
            broker.poll(&ReaderId::from("r"), "q").await.unwrap_err(),
            BusError::BrokerNotConnected
        ));
    }
}
