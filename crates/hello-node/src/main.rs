//! Reference "hello-world" node for nodelink.
//!
//! Runs a client against an in-process loopback broker, subscribes to a
//! wildcard topic, publishes a few greetings and prints what comes back:
//!
//! - `/hello/greeting`   one record per round
//! - `/hello/heartbeat`  published by the broker itself
//!
//! Usage:
//!   nl-hello-node [config.toml] [rounds]
//!
//! Env vars:
//!   RUST_LOG                  log filter (default: "info")
//!   NODELINK_SERVICE_URL      overrides `service_url` from the config
//!   NODELINK_TOPIC_DATA_URL   overrides `topic_data_url` from the config

use std::time::Duration;

use nl_node_sdk::behavior::{Publish, Subscriptions};
use nl_node_sdk::{
    BehaviorKind, BrokerConfig, Client, LoopbackBroker, LoopbackProtocol, RetryInterceptor, TopicDataRecord,
    TracingInterceptor,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "nodelink.toml".into());
    let rounds: u32 = std::env::args()
        .nth(2)
        .and_then(|n| n.parse().ok())
        .unwrap_or(3);

    let config = BrokerConfig::load_or_default(&config_path).apply_env();
    tracing::info!(service_url = %config.service_url, topic_data_url = %config.topic_data_url, "configuration loaded");

    let broker = LoopbackBroker::new();
    let retry = RetryInterceptor::new(config.retry.clone());

    let client = Client::builder()
        .name("hello-node")
        .description("reference node")
        .tags(vec!["example".to_string()])
        .optional([BehaviorKind::Register, BehaviorKind::Devices, BehaviorKind::Sessions])
        .protocol(LoopbackProtocol::new(broker.clone()))
        .config(config)
        .interceptor(TracingInterceptor)
        .interceptor(retry)
        .build()?;

    let greeted = client
        .scoped(|c| {
            let broker = broker.clone();
            async move {
                tracing::info!(client_id = %c.id(), "client usable");

                let subscribe = c
                    .get::<Subscriptions>()
                    .and_then(|s| s.subscribe_regex)
                    .ok_or_else(|| nl_node_sdk::NodeSdkError::InvalidState("no subscriptions".into()))?;
                let topics = subscribe(vec!["/hello/*".into()]).await?;
                let mut inbox = topics[0].subscribe();

                let publish = c
                    .get::<Publish>()
                    .and_then(|p| p.publish)
                    .ok_or_else(|| nl_node_sdk::NodeSdkError::InvalidState("no publish".into()))?;

                let mut received = 0u32;
                for round in 1..=rounds {
                    publish(vec![TopicDataRecord::new(
                        "/hello/greeting",
                        serde_json::json!({ "round": round, "text": "hello, broker" }),
                    )])
                    .await?;
                    broker
                        .publish(vec![TopicDataRecord::new(
                            "/hello/heartbeat",
                            serde_json::json!({ "round": round }),
                        )])
                        .await;

                    for _ in 0..2 {
                        match tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await {
                            Ok(Ok(record)) => {
                                received += 1;
                                tracing::info!(topic = %record.topic, payload = %record.payload, "received");
                            }
                            Ok(Err(e)) => tracing::warn!(error = %e, "inbox lagged or closed"),
                            Err(_) => tracing::warn!(round, "no record within 2s"),
                        }
                    }
                }
                Ok(received)
            }
        })
        .await?;

    tracing::info!(received = greeted, "node exiting");
    Ok(())
}
