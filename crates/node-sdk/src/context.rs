//! Mutable namespace threaded through the hooks of one protocol run.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use nl_protocol::{Constants, ServerDescription};

use crate::client::Client;
use crate::config::BrokerConfig;
use crate::connection::DataConnection;
use crate::error::{NodeSdkError, Result};
use crate::scope::{ScopedTask, TaskScope};
use crate::service::ServiceMap;
use crate::topics::TopicStore;

/// State of one protocol run.  Created when the run starts and dropped
/// when it finishes; a reset client starts over with a fresh context.
pub struct ProtocolContext {
    pub client: Client,
    pub config: BrokerConfig,
    /// Broker description, filled by `update_config`.
    pub server: Option<ServerDescription>,
    /// Default topics and data types, filled by `update_config`.
    pub constants: Option<Constants>,
    pub service_map: Option<Arc<dyn ServiceMap>>,
    pub topic_connection: Option<Arc<dyn DataConnection>>,
    pub topic_store: Arc<TopicStore>,
    /// Background relay spawned by `on_connect`.
    pub relay: Option<ScopedTask<u64>>,
    scope: Arc<TaskScope>,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ProtocolContext {
    pub fn new(client: Client, scope: Arc<TaskScope>) -> Self {
        Self {
            config: client.config().clone(),
            client,
            server: None,
            constants: None,
            service_map: None,
            topic_connection: None,
            topic_store: Arc::new(TopicStore::new()),
            relay: None,
            scope,
            extensions: HashMap::new(),
        }
    }

    /// Task scope of this run.
    pub fn scope(&self) -> &Arc<TaskScope> {
        &self.scope
    }

    pub fn service_map(&self) -> Result<Arc<dyn ServiceMap>> {
        self.service_map
            .clone()
            .ok_or_else(|| NodeSdkError::InvalidState("no service map yet".into()))
    }

    pub fn topic_connection(&self) -> Result<Arc<dyn DataConnection>> {
        self.topic_connection
            .clone()
            .ok_or_else(|| NodeSdkError::InvalidState("no topic data connection yet".into()))
    }

    /// Resolve a logical service name through the broker constants.
    pub fn service_topic(&self, name: &str) -> Result<String> {
        self.constants
            .as_ref()
            .and_then(|c| c.service_topic(name))
            .map(str::to_string)
            .ok_or_else(|| {
                NodeSdkError::InvalidState(format!("broker constants do not name a {name:?} service"))
            })
    }

    /// Store broker-version specific state; returns the previous value.
    pub fn insert_ext<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.extensions
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn ext<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn ext_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.extensions
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }
}

impl std::fmt::Debug for ProtocolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolContext")
            .field("client", &self.client.name())
            .field("server", &self.server.as_ref().map(|s| s.name.as_str()))
            .field("has_service_map", &self.service_map.is_some())
            .field("has_topic_connection", &self.topic_connection.is_some())
            .field("topics", &self.topic_store.len())
            .field("scope", &self.scope.name())
            .finish()
    }
}
