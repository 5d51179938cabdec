mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use common::*;
use mom_cqrs::broker::memory::{MemoryLogBroker, MemoryLogCluster};
use mom_cqrs::{
    //
    shutdown_channel,
    Broker,
    BusError,
    CommandBus,
    Envelope,
    LogCommandBus,
    LogQueryBus,
    QueryBus,
    Result,
    ShutdownTrigger,
};

type CommandBusImpl = LogCommandBus<MemoryLogBroker>;

async fn query_client(cluster: &MemoryLogCluster, id: &str) -> LogQueryBus<MemoryLogBroker> {
    // ---
    let bus = LogQueryBus::new(Arc::new(cluster.broker(id, id)), fast_config(id));
    bus.register_handler(answer).unwrap();
    bus.connect().await.unwrap();
    bus
}

/// Command listener in consumer group `group`, forwarding handled command
/// names to a channel. Commands named "bad" fail.
fn spawn_command_listener(
    cluster: &MemoryLogCluster,
    id: &str,
    group: &str,
) -> (
    Arc<CommandBusImpl>,
    ShutdownTrigger,
    tokio::task::JoinHandle<Result<()>>,
    mpsc::UnboundedReceiver<String>,
) {
    // ---
    let (trigger, shutdown) = shutdown_channel();
    let (tx, rx) = mpsc::unbounded_channel();
    let bus = Arc::new(LogCommandBus::new(
        Arc::new(cluster.broker(id, group)),
        fast_config(id).with_shutdown(shutdown),
    ));
    bus.register_handler(move |c: ExampleCommand| {
        let tx = tx.clone();
        async move {
            if c.name == "bad" {
                return Err(BusError::handler("bad command"));
            }
            tx.send(c.name).map_err(BusError::handler)
        }
    })
    .unwrap();

    let handle = tokio::spawn({
        let bus = bus.clone();
        async move { bus.listen().await }
    });
    (bus, trigger, handle, rx)
}

async fn command_client(cluster: &MemoryLogCluster) -> CommandBusImpl {
    // ---
    let bus = LogCommandBus::new(Arc::new(cluster.broker("client", "clients")), fast_config("client"));
    bus.register_handler(refuse).unwrap();
    bus.connect().await.unwrap();
    bus
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
    timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn test_query_round_trip() -> Result<()> {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (trigger, shutdown) = shutdown_channel();
    let listener = Arc::new(LogQueryBus::new(
        Arc::new(cluster.broker("listener", "listeners")),
        fast_config("listener").with_shutdown(shutdown),
    ));
    listener.register_handler(answer)?;
    let handle = tokio::spawn({
        let listener = listener.clone();
        async move { listener.listen().await }
    });

    let client = query_client(&cluster, "client").await;
    let response = client.execute(query("x", "y")).await?;
    log::info!("response: {:?}", response);
    assert_eq!(response.result, "x y z");

    trigger.trigger();
    assert!(matches!(handle.await.unwrap(), Err(BusError::Cancelled)));

    assert_eq!(cluster.committed("listeners", QUERY_TOPIC), Some(1));
    assert_eq!(cluster.records(REPLY_TOPIC).len(), 1);
    assert_eq!(listener.broker().stats().closes, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_queries_get_their_own_replies() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let client = query_client(&cluster, "client").await;

    let fake = Arc::new(cluster.broker("fake", "fakes"));
    fake.connect(&[QUERY_TOPIC.to_string()]).await.unwrap();

    // Answer both requests, then append the replies in reverse order.
    let responder = tokio::spawn({
        let fake = fake.clone();
        async move {
            let topics = vec![QUERY_TOPIC.to_string()];
            let mut replies = Vec::new();
            for _ in 0..2 {
                let delivery = fake.consume(&topics).await?.ok_or(BusError::BrokerClosed)?;
                let request = Envelope::decode(&delivery.payload)?;
                let q: ExampleQuery = request.to_message()?;
                replies.push(Envelope::encode(
                    &ExampleResponse {
                        result: q.parameter_one,
                    },
                    Some(request.correlation_id().clone()),
                )?);
                fake.ack(&delivery.token).await?;
            }
            for reply in replies.into_iter().rev() {
                fake.send(REPLY_TOPIC, reply.serialize()?).await?;
            }
            Ok::<_, BusError>(())
        }
    });

    let (a, b) = tokio::join!(
        client.execute(query("a", "-")),
        client.execute(query("b", "-"))
    );
    responder.await.unwrap().unwrap();

    assert_eq!(a.unwrap().result, "a");
    assert_eq!(b.unwrap().result, "b");
    assert_eq!(client.broker().stats().acks, 2);
}

#[tokio::test]
async fn test_every_reply_group_sees_every_reply() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (trigger, shutdown) = shutdown_channel();
    let listener = Arc::new(LogQueryBus::new(
        Arc::new(cluster.broker("listener", "listeners")),
        fast_config("listener").with_shutdown(shutdown),
    ));
    listener.register_handler(answer).unwrap();
    let handle = tokio::spawn({
        let listener = listener.clone();
        async move { listener.listen().await }
    });

    let first = query_client(&cluster, "first").await;
    let second = query_client(&cluster, "second").await;

    let (a, b) = timeout(Duration::from_secs(5), async {
        tokio::join!(first.execute(query("a", "1")), second.execute(query("b", "2")))
    })
    .await
    .expect("reply wait did not finish");

    assert_eq!(a.unwrap().result, "a 1 z");
    assert_eq!(b.unwrap().result, "b 2 z");
    assert_eq!(cluster.records(REPLY_TOPIC).len(), 2);

    trigger.trigger();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test]
async fn test_query_buses_sharing_a_broker_handle_both_get_replies() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (trigger, shutdown) = shutdown_channel();
    let listener = Arc::new(LogQueryBus::new(
        Arc::new(cluster.broker("listener", "listeners")),
        fast_config("listener").with_shutdown(shutdown),
    ));
    listener.register_handler(answer).unwrap();
    let handle = tokio::spawn({
        let listener = listener.clone();
        async move { listener.listen().await }
    });

    let shared = Arc::new(cluster.broker("shared", "clients"));
    let a = LogQueryBus::new(shared.clone(), fast_config("a"));
    let b = LogQueryBus::new(shared.clone(), fast_config("b"));
    for bus in [&a, &b] {
        bus.register_handler(answer).unwrap();
        bus.connect().await.unwrap();
    }

    let (ra, rb) = timeout(Duration::from_secs(2), async {
        tokio::join!(a.execute(query("a", "1")), b.execute(query("b", "2")))
    })
    .await
    .expect("a reply was lost to the other bus");
    log::info!("shared handle replies: {ra:?} {rb:?}");

    assert_eq!(ra.unwrap().result, "a 1 z");
    assert_eq!(rb.unwrap().result, "b 2 z");
    assert_eq!(shared.stats().acks, 2);

    trigger.trigger();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test]
async fn test_unregistered_command_sends_nothing() {
    // ---
    let cluster = MemoryLogCluster::new();
    let client = LogCommandBus::new(Arc::new(cluster.broker("client", "clients")), fast_config("client"));
    client.connect().await.unwrap();

    let err = client.execute(command("nobody")).await.unwrap_err();
    assert!(matches!(err, BusError::HandlerNotFound(tag) if tag.as_str() == COMMAND_TOPIC));
    assert_eq!(client.broker().stats().sends, 0);
    assert!(cluster.records(COMMAND_TOPIC).is_empty());
}

#[tokio::test]
async fn test_query_before_connect() {
    // ---
    let cluster = MemoryLogCluster::new();
    let client = LogQueryBus::new(Arc::new(cluster.broker("client", "clients")), fast_config("client"));
    client.register_handler(answer).unwrap();

    assert!(matches!(
        client.execute(query("x", "y")).await,
        Err(BusError::BrokerNotConnected)
    ));
}

#[tokio::test]
async fn test_command_reaches_listener_and_commits() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (_listener, trigger, handle, mut rx) = spawn_command_listener(&cluster, "listener", "listeners");
    let client = command_client(&cluster).await;

    client.execute(command("hello")).await.unwrap();
    assert_eq!(recv(&mut rx).await.as_deref(), Some("hello"));

    trigger.trigger();
    assert!(matches!(handle.await.unwrap(), Err(BusError::Cancelled)));
    assert_eq!(cluster.committed("listeners", COMMAND_TOPIC), Some(1));
}

#[tokio::test]
async fn test_restarted_listener_resumes_after_commit() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let client = command_client(&cluster).await;

    let (_first, trigger, handle, mut rx) = spawn_command_listener(&cluster, "first", "listeners");
    client.execute(command("one")).await.unwrap();
    client.execute(command("two")).await.unwrap();
    assert_eq!(recv(&mut rx).await.as_deref(), Some("one"));
    assert_eq!(recv(&mut rx).await.as_deref(), Some("two"));
    trigger.trigger();
    handle.await.unwrap().unwrap_err();

    client.execute(command("three")).await.unwrap();

    let (_second, trigger, handle, mut rx) = spawn_command_listener(&cluster, "second", "listeners");
    assert_eq!(recv(&mut rx).await.as_deref(), Some("three"));
    trigger.trigger();
    handle.await.unwrap().unwrap_err();

    // A different group starts from the beginning of the log.
    let (_audit, trigger, handle, mut rx) = spawn_command_listener(&cluster, "audit", "auditors");
    assert_eq!(recv(&mut rx).await.as_deref(), Some("one"));
    trigger.trigger();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test]
async fn test_failing_handler_commits_and_continues() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (_listener, trigger, handle, mut rx) = spawn_command_listener(&cluster, "listener", "listeners");
    let client = command_client(&cluster).await;

    client.execute(command("bad")).await.unwrap();
    client.execute(command("good")).await.unwrap();
    assert_eq!(recv(&mut rx).await.as_deref(), Some("good"));

    trigger.trigger();
    assert!(matches!(handle.await.unwrap(), Err(BusError::Cancelled)));
    assert_eq!(cluster.committed("listeners", COMMAND_TOPIC), Some(2));
}

#[tokio::test]
async fn test_listen_cancellation_closes_once() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (listener, trigger, handle, _rx) = spawn_command_listener(&cluster, "listener", "listeners");
    settle().await;

    trigger.trigger();
    assert!(matches!(handle.await.unwrap(), Err(BusError::Cancelled)));

    let stats = listener.broker().stats();
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.sends, 0);

    // A closed session cannot be reopened.
    assert!(matches!(
        listener.broker().connect(&[]).await,
        Err(BusError::BrokerClosed)
    ));
}

#[tokio::test]
async fn test_malformed_record_is_committed_past() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    cluster.append(COMMAND_TOPIC, bytes::Bytes::from_static(b"{\"correlation_id\":1}"));

    let (listener, _trigger, handle, _rx) = spawn_command_listener(&cluster, "listener", "listeners");
    let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

    assert!(matches!(result, Err(BusError::MalformedEnvelope(_))));
    assert_eq!(cluster.committed("listeners", COMMAND_TOPIC), Some(1));
    assert_eq!(listener.broker().stats().closes, 1);
}

#[tokio::test]
async fn test_reply_timeout() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let client = LogQueryBus::new(
        Arc::new(cluster.broker("client", "clients")),
        fast_config("client").with_reply_timeout(Duration::from_millis(50)),
    );
    client.register_handler(answer).unwrap();
    client.connect().await.unwrap();

    assert!(matches!(
        client.execute(query("x", "y")).await,
        Err(BusError::Timeout)
    ));
    assert_eq!(cluster.records(QUERY_TOPIC).len(), 1);
}

#[tokio::test]
async fn test_query_cancellation_closes_broker() {
    // ---
    init_logging();

    let cluster = MemoryLogCluster::new();
    let (trigger, shutdown) = shutdown_channel();
    let client = Arc::new(LogQueryBus::new(
        Arc::new(cluster.broker("client", "clients")),
        fast_config("client").with_shutdown(shutdown),
    ));
    client.register_handler(answer).unwrap();
    client.connect().await.unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.execute(query("x", "y")).await }
    });
    settle().await;

    trigger.trigger();
    let result = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();

    assert!(matches!(result, Err(BusError::Cancelled)));
    assert_eq!(client.broker().stats().closes, 1);
}
