#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::time::Duration;

use mom_cqrs::{
    //
    BusConfig,
    BusError,
    Command,
    Message,
    Query,
    Result,
};

pub const QUERY_TOPIC: &str = "Example.Query";
pub const REPLY_TOPIC: &str = "Example.Query-Response";
pub const COMMAND_TOPIC: &str = "Example.Command";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleQuery {
    pub parameter_one: String,
    pub parameter_two: String,
}

impl Message for ExampleQuery {
    const TYPE_TAG: &'static str = "Example.Query";
}

impl Query for ExampleQuery {
    type Response = ExampleResponse;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleResponse {
    pub result: String,
}

impl Message for ExampleResponse {
    const TYPE_TAG: &'static str = "Example.Response";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleCommand {
    pub name: String,
}

impl Message for ExampleCommand {
    const TYPE_TAG: &'static str = "Example.Command";
}

impl Command for ExampleCommand {}

pub fn query(one: &str, two: &str) -> ExampleQuery {
    ExampleQuery {
        parameter_one: one.to_string(),
        parameter_two: two.to_string(),
    }
}

pub fn command(name: &str) -> ExampleCommand {
    ExampleCommand {
        name: name.to_string(),
    }
}

/// Handler joining both parameters with a trailing "z".
pub async fn answer(q: ExampleQuery) -> Result<ExampleResponse> {
    // ---
    Ok(ExampleResponse {
        result: format!("{} {} z", q.parameter_one, q.parameter_two),
    })
}

pub async fn refuse(_: ExampleCommand) -> Result<()> {
    Err(BusError::handler("refused"))
}

/// Bus config with a short reply backoff so tests stay quick.
pub fn fast_config(bus_id: &str) -> BusConfig {
    BusConfig::new(bus_id).with_poll_interval(Duration::from_millis(5))
}

/// Give a spawned `listen` time to connect.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
