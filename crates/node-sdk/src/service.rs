//! Service invocation: request/response calls to the broker keyed by topic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use nl_protocol::{Constants, ServerDescription};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{NodeSdkError, Result};

/// Reply of the well-known server configuration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfigReply {
    pub server: ServerDescription,
    #[serde(default)]
    pub constants: Constants,
}

/// Maps service topics to callables performing a round trip to the broker.
#[async_trait::async_trait]
pub trait ServiceMap: Send + Sync + 'static {
    /// Call the service at `topic`.
    async fn call(&self, topic: &str, request: Value) -> Result<Value>;

    /// All service topics currently known to the map.
    fn topics(&self) -> Vec<String>;

    fn contains(&self, topic: &str) -> bool {
        self.topics().iter().any(|t| t == topic)
    }

    /// Fetch the broker configuration through the service at `topic`.
    async fn server_config(&self, topic: &str) -> Result<ServerConfigReply> {
        let reply = self.call(topic, Value::Null).await?;
        Ok(serde_json::from_value(reply)?)
    }
}

/// Boxed handler stored in a [`LocalServiceMap`].
pub type ServiceHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// In-process service map: topics are served by registered async closures.
///
/// Used by loopback brokers and tests; handlers may be added while the map
/// is already shared.
#[derive(Default)]
pub struct LocalServiceMap {
    handlers: RwLock<HashMap<String, ServiceHandler>>,
    timeout: Option<Duration>,
}

impl LocalServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound every call; a slow handler fails with [`NodeSdkError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Serve `topic` with `handler`, replacing any previous handler.
    ///
    /// Returns `&Self` for method chaining.
    pub fn register<F, Fut>(&self, topic: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: ServiceHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.handlers.write().insert(topic.into(), handler);
        self
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.handlers.write().remove(topic).is_some()
    }
}

#[async_trait::async_trait]
impl ServiceMap for LocalServiceMap {
    async fn call(&self, topic: &str, request: Value) -> Result<Value> {
        let handler = self
            .handlers
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| NodeSdkError::Service {
                topic: topic.to_string(),
                message: "no such service".into(),
            })?;

        tracing::trace!(topic = %topic, "service call");

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, handler(request))
                .await
                .map_err(|_| NodeSdkError::Timeout(limit))?,
            None => handler(request).await,
        }
    }

    fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}
