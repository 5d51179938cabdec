// src/broker/kafka.rs

//! Kafka binding of the log broker family, using `rdkafka`.
//!
//! ## Session layout
//!
//! `connect` builds one session holding:
//!
//! - a `FutureProducer` shared by every `send`,
//! - a request `StreamConsumer` in the configured consumer group, subscribed
//!   to the union of all topics passed to `consume`,
//! - one reply `StreamConsumer` per (reader, reply topic), created on the
//!   reader's first `poll`, in a reply group unique to that reader.
//!
//! Topics are auto-created by the cluster, so `connect` only opens the
//! session; subscriptions follow the first `consume` or `poll`.
//!
//! Reply consumers start from the earliest retained offset so a reply
//! published between `send` and the first `poll` is never missed. Records
//! that belong to other waiters are scanned past; their owners read them
//! through their own reply groups, even when they share this handle.
//!
//! ## Publishing
//!
//! `send` only enqueues the record on the producer. The delivery report is
//! awaited on a spawned task and failures are logged; `close` flushes
//! whatever is still in flight.
//!
//! ## Commit semantics
//!
//! Auto-commit is disabled. `ack` commits `offset + 1` for the record's
//! partition asynchronously. `reject` commits nothing; the consumer position
//! has already moved past the record.
//!
//! ## Deviations from the in-memory log
//!
//! - Partition assignment happens after `subscribe` returns. A request
//!   published to a brand-new topic before the group's first assignment is
//!   still delivered, because request consumers also start at the earliest
//!   offset when the group has no commit.
//! - `poll` waits up to [`KafkaConfig::poll_wait`] for a record instead of
//!   returning immediately.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::Notify;

use crate::broker::{Broker, Delivery, Lane, LogOffset, ReaderId};
use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    BusError,
    Result,
};

/// Connection settings for [`KafkaBroker`].
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    // ---
    /// Comma-separated `host:port` list.
    pub bootstrap_servers: String,

    /// Consumer group for request topics. Instances sharing it split the
    /// request load.
    pub group_id: String,

    /// Prefix of the reply consumer groups. Each reply reader on the handle
    /// appends its own id.
    ///
    /// Default: `<group_id>-replies-<uuid>`, unique per handle.
    pub reply_group_id: String,

    /// How long a reply `poll` waits for a record.
    ///
    /// Default: 50ms
    pub poll_wait: Duration,

    /// Producer delivery timeout, also the flush bound on `close`.
    ///
    /// Default: 5s
    pub send_timeout: Duration,

    /// Extra librdkafka properties applied to every client.
    pub properties: Vec<(String, String)>,
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        // ---
        let group_id = group_id.into();
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            reply_group_id: format!("{group_id}-replies-{}", uuid::Uuid::new_v4()),
            group_id,
            poll_wait: Duration::from_millis(50),
            send_timeout: Duration::from_secs(5),
            properties: Vec::new(),
        }
    }

    /// Add a raw librdkafka property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    fn client(&self) -> ClientConfig {
        // ---
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }

    fn reply_group(&self, reader: &ReaderId) -> String {
        format!("{}-{reader}", self.reply_group_id)
    }

    fn consumer(&self, group_id: &str) -> Result<StreamConsumer> {
        // ---
        self.client()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "10000")
            .set("fetch.wait.max.ms", "100")
            .create()
            .map_err(|e| transport("consumer creation failed", e))
    }

    fn producer(&self) -> Result<FutureProducer> {
        // ---
        self.client()
            .set("message.timeout.ms", self.send_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| transport("producer creation failed", e))
    }
}

fn transport(context: &str, err: impl std::fmt::Display) -> BusError {
    // ---
    let msg = format!("kafka: {context}: {err}");
    log_error!("{msg}");
    BusError::Transport(msg)
}

struct Session {
    producer: FutureProducer,
    requests: StreamConsumer,
    request_topics: Mutex<BTreeSet<String>>,
    replies: Mutex<HashMap<(ReaderId, String), Arc<StreamConsumer>>>,
}

/// Log broker backed by a Kafka cluster.
pub struct KafkaBroker {
    broker_id: String,
    config: KafkaConfig,
    session: Mutex<SessionSlot>,
    closed: Notify,
}

enum SessionSlot {
    Idle,
    Open(Arc<Session>),
    Closed,
}

impl KafkaBroker {
    /// Create an unconnected handle. No network activity until `connect`.
    pub fn new(broker_id: impl Into<String>, config: KafkaConfig) -> Self {
        // ---
        Self {
            broker_id: broker_id.into(),
            config,
            session: Mutex::new(SessionSlot::Idle),
            closed: Notify::new(),
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        // ---
        match &*lock_ignore_poison(&self.session) {
            SessionSlot::Open(session) => Ok(Arc::clone(session)),
            SessionSlot::Idle => Err(BusError::BrokerNotConnected),
            SessionSlot::Closed => Err(BusError::BrokerClosed),
        }
    }

    /// Extend the request subscription to cover `topics`.
    fn subscribe_requests(&self, session: &Session, topics: &[String]) -> Result<()> {
        // ---
        let mut subscribed = lock_ignore_poison(&session.request_topics);
        if topics.iter().all(|t| subscribed.contains(t)) {
            return Ok(());
        }
        subscribed.extend(topics.iter().cloned());

        let names: Vec<&str> = subscribed.iter().map(String::as_str).collect();
        session
            .requests
            .subscribe(&names)
            .map_err(|e| transport("subscribe failed", e))?;
        log_info!(self.broker_id => "subscribed group {} to {:?}", self.config.group_id, names);
        Ok(())
    }

    fn reply_consumer(
        &self,
        session: &Session,
        reader: &ReaderId,
        topic: &str,
    ) -> Result<Arc<StreamConsumer>> {
        // ---
        let key = (reader.clone(), topic.to_string());
        let mut replies = lock_ignore_poison(&session.replies);
        if let Some(consumer) = replies.get(&key) {
            return Ok(Arc::clone(consumer));
        }

        let consumer = self.config.consumer(&self.config.reply_group(reader))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| transport("reply subscribe failed", e))?;
        log_debug!(self.broker_id => "reply consumer for {reader} on {topic}");

        let consumer = Arc::new(consumer);
        replies.insert(key, Arc::clone(&consumer));
        Ok(consumer)
    }
}

fn to_delivery(message: &BorrowedMessage<'_>, lane: Lane) -> Delivery<LogOffset> {
    // ---
    let topic = message.topic().to_string();
    Delivery {
        payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        token: LogOffset {
            topic: topic.clone(),
            partition: message.partition(),
            offset: message.offset(),
            lane,
        },
        topic,
    }
}

fn commit(consumer: &StreamConsumer, token: &LogOffset) -> Result<()> {
    // ---
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(&token.topic, token.partition, Offset::Offset(token.offset + 1))
        .map_err(|e| transport("commit offset invalid", e))?;
    consumer
        .commit(&tpl, CommitMode::Async)
        .map_err(|e| transport("commit failed", e))
}

#[async_trait::async_trait]
impl Broker for KafkaBroker {
    // ---
    type Token = LogOffset;

    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn connect(&self, topics: &[String]) -> Result<()> {
        // ---
        let mut slot = lock_ignore_poison(&self.session);
        match &*slot {
            SessionSlot::Closed => return Err(BusError::BrokerClosed),
            SessionSlot::Open(_) => {}
            SessionSlot::Idle => {
                log_info!(self.broker_id => "connecting to {}", self.config.bootstrap_servers);
                *slot = SessionSlot::Open(Arc::new(Session {
                    producer: self.config.producer()?,
                    requests: self.config.consumer(&self.config.group_id)?,
                    request_topics: Mutex::new(BTreeSet::new()),
                    replies: Mutex::new(HashMap::new()),
                }));
            }
        }

        log_debug!(self.broker_id => "session open, {} topics declared", topics.len());
        Ok(())
    }

    async fn send(&self, topic: &str, payload: Bytes) -> Result<()> {
        // ---
        let session = self.session()?;
        let record = FutureRecord::<(), [u8]>::to(topic).payload(&payload[..]);
        let delivery = session
            .producer
            .send_result(record)
            .map_err(|(e, _)| transport("send failed", e))?;

        let broker_id = self.broker_id.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok(delivered)) => {
                    log_debug!(broker_id => "delivered to {topic} {:?}", delivered);
                }
                Ok(Err((e, _))) => {
                    log_warn!(broker_id => "delivery to {topic} failed: {e}");
                }
                Err(_) => {
                    log_warn!(broker_id => "delivery report for {topic} dropped");
                }
            }
        });
        Ok(())
    }

    async fn consume(&self, topics: &[String]) -> Result<Option<Delivery<LogOffset>>> {
        // ---
        let session = match self.session() {
            Ok(session) => session,
            Err(BusError::BrokerClosed) => return Ok(None),
            Err(e) => return Err(e),
        };
        self.subscribe_requests(&session, topics)?;

        let closed = self.closed.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        if matches!(*lock_ignore_poison(&self.session), SessionSlot::Closed) {
            return Ok(None);
        }

        tokio::select! {
            _ = &mut closed => Ok(None),
            received = session.requests.recv() => match received {
                Ok(message) => Ok(Some(to_delivery(&message, Lane::Requests))),
                Err(e) => Err(transport("consume failed", e)),
            },
        }
    }

    async fn poll(&self, reader: &ReaderId, topic: &str) -> Result<Option<Delivery<LogOffset>>> {
        // ---
        let session = self.session()?;
        let consumer = self.reply_consumer(&session, reader, topic)?;

        match tokio::time::timeout(self.config.poll_wait, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(to_delivery(&message, Lane::Replies(reader.clone())))),
            Ok(Err(e)) => Err(transport("reply poll failed", e)),
        }
    }

    async fn ack(&self, token: &LogOffset) -> Result<()> {
        // ---
        let session = self.session()?;
        match &token.lane {
            Lane::Requests => commit(&session.requests, token),
            Lane::Replies(reader) => {
                let consumer = self.reply_consumer(&session, reader, &token.topic)?;
                commit(&consumer, token)
            }
        }
    }

    async fn reject(&self, token: &LogOffset, requeue: bool) -> Result<()> {
        // ---
        self.session()?;
        log_debug!(self.broker_id => "skipping {token} (requeue={requeue})");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        let previous = std::mem::replace(&mut *lock_ignore_poison(&self.session), SessionSlot::Closed);
        self.closed.notify_waiters();

        if let SessionSlot::Open(session) = previous {
            if let Err(e) = session.producer.flush(Timeout::After(self.config.send_timeout)) {
                log_warn!(self.broker_id => "flush on close failed: {e}");
            }
            session.requests.unsubscribe();
            for consumer in lock_ignore_poison(&session.replies).values() {
                consumer.unsubscribe();
            }
            log_info!(self.broker_id => "closed");
        }
        Ok(())
    }
}
