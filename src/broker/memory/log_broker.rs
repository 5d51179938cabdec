// src/broker/memory/log_broker.rs

//! In-memory partitioned log.
//!
//! Every topic is a single append-only partition. Each broker handle reads
//! through its own cursors, one per (lane, topic), initialised from the
//! consumer group's committed offset. Every reply reader is a lane of its
//! own with a group of its own. Acks commit monotonically; rejects
//! leave the commit where it is and the cursor keeps moving forward.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use super::Session;
use crate::broker::{Broker, BrokerStats, Delivery, Lane, LogOffset, ReaderId};
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    BusError,
    Result,
};

#[derive(Default)]
struct ClusterState {
    topics: HashMap<String, Vec<Bytes>>,
    /// (group, topic) -> next offset to read.
    committed: HashMap<(String, String), i64>,
}

#[derive(Default)]
struct ClusterInner {
    state: Mutex<ClusterState>,
    appended: Notify,
}

/// Shared log storage. Clone it to hand the same cluster to several buses.
#[derive(Clone, Default)]
pub struct MemoryLogCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryLogCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new broker handle reading as consumer group `group`.
    pub fn broker(&self, broker_id: impl Into<String>, group: impl Into<String>) -> MemoryLogBroker {
        // ---
        MemoryLogBroker {
            broker_id: broker_id.into(),
            group: group.into(),
            cluster: self.clone(),
            state: Mutex::new(BrokerState {
                session: Session::Idle,
                positions: HashMap::new(),
                stats: BrokerStats::default(),
            }),
            closed: Notify::new(),
        }
    }

    /// Every record ever appended to `topic`, in order.
    pub fn records(&self, topic: &str) -> Vec<Bytes> {
        // ---
        lock_ignore_poison(&self.inner.state)
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Next offset `group` would resume from on `topic`, if it ever committed.
    pub fn committed(&self, group: &str, topic: &str) -> Option<i64> {
        // ---
        lock_ignore_poison(&self.inner.state)
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
    }

    /// Append a raw payload without going through a broker handle.
    pub fn append(&self, topic: &str, payload: Bytes) -> i64 {
        // ---
        let offset = {
            let mut state = lock_ignore_poison(&self.inner.state);
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(payload);
            (log.len() - 1) as i64
        };
        self.inner.appended.notify_waiters();
        offset
    }
}

struct BrokerState {
    session: Session,
    positions: HashMap<(Lane, String), i64>,
    stats: BrokerStats,
}

impl BrokerState {
    fn next_record(
        &mut self,
        cluster: &ClusterState,
        group: &str,
        lane: Lane,
        topic: &str,
    ) -> Option<Delivery<LogOffset>> {
        // ---
        let key = (lane.clone(), topic.to_string());
        let position = *self.positions.entry(key.clone()).or_insert_with(|| {
            cluster
                .committed
                .get(&(group.to_string(), topic.to_string()))
                .copied()
                .unwrap_or(0)
        });

        let payload = cluster.topics.get(topic)?.get(position as usize)?.clone();
        self.positions.insert(key, position + 1);

        Some(Delivery {
            topic: topic.to_string(),
            payload,
            token: LogOffset {
                topic: topic.to_string(),
                partition: 0,
                offset: position,
                lane,
            },
        })
    }
}

/// Broker handle onto a [`MemoryLogCluster`].
pub struct MemoryLogBroker {
    broker_id: String,
    group: String,
    cluster: MemoryLogCluster,
    state: Mutex<BrokerState>,
    closed: Notify,
}

impl MemoryLogBroker {
    pub fn stats(&self) -> BrokerStats {
        lock_ignore_poison(&self.state).stats
    }

    /// Consumer group used for `lane`. Each reply reader commits under its
    /// own group so reply progress never moves another cursor.
    fn lane_group(&self, lane: &Lane) -> String {
        // ---
        match lane {
            Lane::Requests => self.group.clone(),
            Lane::Replies(reader) => format!("{}-replies-{reader}", self.group),
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryLogBroker {
    // ---
    type Token = LogOffset;

    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn connect(&self, topics: &[String]) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if state.session == Session::Closed {
                return Err(BusError::BrokerClosed);
            }
            state.session = Session::Connected;
        }

        let mut cluster = lock_ignore_poison(&self.cluster.inner.state);
        for topic in topics {
            cluster.topics.entry(topic.clone()).or_default();
        }
        log_info!(self.broker_id => "connected as group {} to {:?}", self.group, topics);
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.session.ensure_connected()?;
            state.stats.sends += 1;
        }
        let offset = self.cluster.append(topic, payload);
        log_debug!(self.broker_id => "appended {topic}[0]@{offset}");
        Ok(())
    }

    async fn consume(&self, topics: &[String]) -> Result<Option<Delivery<LogOffset>>> {
        // ---
        let group = self.lane_group(&Lane::Requests);
        loop {
            let appended = self.cluster.inner.appended.notified();
            let closed = self.closed.notified();
            tokio::pin!(appended);
            tokio::pin!(closed);
            appended.as_mut().enable();
            closed.as_mut().enable();

            {
                let mut state = lock_ignore_poison(&self.state);
                match state.session {
                    Session::Closed => return Ok(None),
                    Session::Idle => return Err(BusError::BrokerNotConnected),
                    Session::Connected => {}
                }

                let cluster = lock_ignore_poison(&self.cluster.inner.state);
                for topic in topics {
                    if let Some(delivery) =
                        state.next_record(&cluster, &group, Lane::Requests, topic)
                    {
                        state.stats.consumed += 1;
                        return Ok(Some(delivery));
                    }
                }
            }

            tokio::select! {
                _ = &mut appended => {}
                _ = &mut closed => {}
            }
        }
    }

    async fn poll(&self, reader: &ReaderId, topic: &str) -> Result<Option<Delivery<LogOffset>>> {
        // ---
        let lane = Lane::Replies(reader.clone());
        let group = self.lane_group(&lane);
        let mut state = lock_ignore_poison(&self.state);
        state.session.ensure_connected()?;

        let cluster = lock_ignore_poison(&self.cluster.inner.state);
        let delivery = state.next_record(&cluster, &group, lane, topic);
        if delivery.is_some() {
            state.stats.polled += 1;
        }
        Ok(delivery)
    }

    async fn ack(&self, token: &LogOffset) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            state.session.ensure_connected()?;
            state.stats.acks += 1;
        }

        let key = (self.lane_group(&token.lane), token.topic.clone());
        let mut cluster = lock_ignore_poison(&self.cluster.inner.state);
        let committed = cluster.committed.entry(key).or_insert(0);
        *committed = (*committed).max(token.offset + 1);
        Ok(())
    }

    async fn reject(&self, token: &LogOffset, requeue: bool) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.session.ensure_connected()?;
        state.stats.rejects += 1;
        log_debug!(self.broker_id => "skipping {token} (requeue={requeue})");
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
            state.positions.clear();
        }
        self.closed.notify_waiters();
        log_info!(self.broker_id => "closed");
        Ok(())
    }
}
