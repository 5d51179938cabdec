//! Query and command buses over the in-memory queue broker.
//!
//! A listener answers `Example.Query` and handles `Example.Command`; a client
//! on a separate broker connection sends one of each.
//!
//! Run with: cargo run --example example_memory

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mom_cqrs::broker::memory::MemoryQueueServer;
use mom_cqrs::{
    //
    shutdown_channel,
    BusConfig,
    BusError,
    Command,
    CommandBus,
    Message,
    Query,
    QueryBus,
    QueueCommandBus,
    QueueQueryBus,
};

#[derive(Debug, Serialize, Deserialize)]
struct ExampleQuery {
    parameter_one: String,
    parameter_two: String,
}

impl Message for ExampleQuery {
    const TYPE_TAG: &'static str = "Example.Query";
}

impl Query for ExampleQuery {
    type Response = ExampleResponse;
}

#[derive(Debug, Serialize, Deserialize)]
struct ExampleResponse {
    result: String,
}

impl Message for ExampleResponse {
    const TYPE_TAG: &'static str = "Example.Response";
}

#[derive(Debug, Serialize, Deserialize)]
struct ExampleCommand {
    name: String,
}

impl Message for ExampleCommand {
    const TYPE_TAG: &'static str = "Example.Command";
}

impl Command for ExampleCommand {}

async fn answer(q: ExampleQuery) -> mom_cqrs::Result<ExampleResponse> {
    Ok(ExampleResponse {
        result: format!("{} {} z", q.parameter_one, q.parameter_two),
    })
}

async fn greet(c: ExampleCommand) -> mom_cqrs::Result<()> {
    println!("listener: hello, {}", c.name);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    env_logger::init();

    let server = MemoryQueueServer::new();
    let (trigger, shutdown) = shutdown_channel();

    // ---
    // Listener side: one bus per message kind, sharing a shutdown signal.
    let queries = Arc::new(QueueQueryBus::new(
        Arc::new(server.broker("listener-queries")),
        BusConfig::new("listener-queries").with_shutdown(shutdown.clone()),
    ));
    queries.register_handler(answer)?;

    let commands = Arc::new(QueueCommandBus::new(
        Arc::new(server.broker("listener-commands")),
        BusConfig::new("listener-commands").with_shutdown(shutdown),
    ));
    commands.register_handler(greet)?;

    let query_loop = tokio::spawn({
        let queries = queries.clone();
        async move { queries.listen().await }
    });
    let command_loop = tokio::spawn({
        let commands = commands.clone();
        async move { commands.listen().await }
    });

    // ---
    // Client side: handlers must be known locally before `execute`.
    let client = QueueQueryBus::new(
        Arc::new(server.broker("client-queries")),
        BusConfig::new("client-queries").with_reply_timeout(Duration::from_secs(5)),
    );
    client.register_handler(answer)?;
    client.connect().await?;

    let sender = QueueCommandBus::new(
        Arc::new(server.broker("client-commands")),
        BusConfig::new("client-commands"),
    );
    sender.register_handler(greet)?;
    sender.connect().await?;

    let response = client
        .execute(ExampleQuery {
            parameter_one: "x".into(),
            parameter_two: "y".into(),
        })
        .await?;
    println!("client: query answered with {:?}", response.result);

    let id = sender
        .execute(ExampleCommand {
            name: "world".into(),
        })
        .await?;
    println!("client: command sent as {id}");

    tokio::time::sleep(Duration::from_millis(100)).await;

    // ---
    // Stop both listeners; each closes its broker session.
    trigger.trigger();
    for outcome in [query_loop.await?, command_loop.await?] {
        match outcome {
            Err(BusError::Cancelled) => {}
            other => other?,
        }
    }

    Ok(())
}
