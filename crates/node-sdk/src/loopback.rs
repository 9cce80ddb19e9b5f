//! Loopback broker: an in-process broker and the protocol that talks to it.
//!
//! [`LoopbackBroker`] serves the broker side over a [`LocalServiceMap`]:
//! server configuration, client (de)registration, topic subscriptions,
//! devices and sessions.  Data connections are [`ChannelConnection`] pairs;
//! every frame a client publishes is routed to all connected clients with a
//! matching subscription (wildcards included).
//!
//! [`LoopbackProtocol`] is a complete [`ClientProtocol`] for it and fills
//! the `Services`, `Subscriptions`, `Publish`, `Register`, `Devices` and
//! `Sessions` behaviors.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use nl_protocol::{
    ClientSpec, ClientStatus, Constants, Device, ServerDescription, Session, SessionList, TopicData,
    TopicDataRecord, DEFAULT_SERVER_CONFIG_TOPIC,
};
use glob::Pattern;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::behavior::{
    BehaviorKind, DeregisterDeviceFn, DeregisterFn, Devices, GetSessionsFn, Publish, PublishFn, Register,
    RegisterDeviceFn, RegisterFn, Services, Sessions, SlotFuture, StartSessionFn, StopSessionFn,
    SubscribeFn, Subscriptions,
};
use crate::client::{Client, ClientInner};
use crate::connection::{ChannelConnection, DataConnection};
use crate::context::ProtocolContext;
use crate::error::{NodeSdkError, Result};
use crate::lifecycle::ClientProtocol;
use crate::registration::{ServiceRegistration, DEREGISTRATION_SERVICE, REGISTRATION_SERVICE};
use crate::scope::ScopedResource;
use crate::service::{LocalServiceMap, ServerConfigReply, ServiceMap};
use crate::topics::{compile_wildcard, is_wildcard, Topic, TopicStore};

pub const SUBSCRIBE_SERVICE: &str = "topic_subscription";
pub const UNSUBSCRIBE_SERVICE: &str = "topic_unsubscription";
pub const REGISTER_DEVICE_SERVICE: &str = "device_registration";
pub const DEREGISTER_DEVICE_SERVICE: &str = "device_deregistration";
pub const START_SESSION_SERVICE: &str = "session_start";
pub const STOP_SESSION_SERVICE: &str = "session_stop";
pub const GET_SESSIONS_SERVICE: &str = "session_list";

/// Logical service name → topic, as advertised in the broker constants.
const SERVICE_TOPICS: [(&str, &str); 9] = [
    (REGISTRATION_SERVICE, "/services/client/registration"),
    (DEREGISTRATION_SERVICE, "/services/client/deregistration"),
    (SUBSCRIBE_SERVICE, "/services/topics/subscribe"),
    (UNSUBSCRIBE_SERVICE, "/services/topics/unsubscribe"),
    (REGISTER_DEVICE_SERVICE, "/services/devices/register"),
    (DEREGISTER_DEVICE_SERVICE, "/services/devices/deregister"),
    (START_SESSION_SERVICE, "/services/sessions/start"),
    (STOP_SESSION_SERVICE, "/services/sessions/stop"),
    (GET_SESSIONS_SERVICE, "/services/sessions/list"),
];

/// Data types the loopback broker routes.
const MSG_TYPES: [&str; 3] = ["json", "text", "binary"];

// ── Broker ───────────────────────────────────────────────────────────

pub struct LoopbackBroker {
    server: ServerDescription,
    constants: Constants,
    services: Arc<LocalServiceMap>,
    state: Mutex<BrokerState>,
    /// Service topic → remaining injected failures.
    failures: Mutex<HashMap<String, u32>>,
    registrations: AtomicU64,
    deregistrations: AtomicU64,
    routed: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientSpec>,
    links: HashMap<String, Link>,
    sessions: BTreeMap<String, Session>,
}

/// The broker's view of one connected client.
struct Link {
    tx: mpsc::Sender<Result<TopicData>>,
    subscriptions: Vec<(String, Pattern)>,
}

impl Link {
    fn wants(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|(_, pattern)| pattern.matches(topic))
    }
}

#[derive(Deserialize)]
struct SubscriptionRequest {
    client_id: String,
    topics: Vec<String>,
}

#[derive(Deserialize)]
struct DeviceRequest {
    client_id: String,
    device: Device,
}

impl LoopbackBroker {
    pub fn new() -> Arc<Self> {
        Self::with_server(ServerDescription {
            id: "loopback".into(),
            name: "loopback broker".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            service_url: "loopback://services".into(),
            topic_data_url: "loopback://topic_data".into(),
        })
    }

    pub fn with_server(server: ServerDescription) -> Arc<Self> {
        let constants = Constants {
            default_topics: SERVICE_TOPICS
                .iter()
                .map(|(name, topic)| (name.to_string(), topic.to_string()))
                .collect(),
            msg_types: MSG_TYPES.iter().map(|t| t.to_string()).collect(),
        };

        Arc::new_cyclic(|weak| {
            let services = LocalServiceMap::new();
            serve(&services, weak, DEFAULT_SERVER_CONFIG_TOPIC, |broker, _| {
                Ok(serde_json::to_value(ServerConfigReply {
                    server: broker.server.clone(),
                    constants: broker.constants.clone(),
                })?)
            });
            for (name, topic) in SERVICE_TOPICS {
                let handler: fn(&LoopbackBroker, Value) -> Result<Value> = match name {
                    REGISTRATION_SERVICE => LoopbackBroker::handle_register,
                    DEREGISTRATION_SERVICE => LoopbackBroker::handle_deregister,
                    SUBSCRIBE_SERVICE => LoopbackBroker::handle_subscribe,
                    UNSUBSCRIBE_SERVICE => LoopbackBroker::handle_unsubscribe,
                    REGISTER_DEVICE_SERVICE => LoopbackBroker::handle_register_device,
                    DEREGISTER_DEVICE_SERVICE => LoopbackBroker::handle_deregister_device,
                    START_SESSION_SERVICE => LoopbackBroker::handle_start_session,
                    STOP_SESSION_SERVICE => LoopbackBroker::handle_stop_session,
                    _ => LoopbackBroker::handle_get_sessions,
                };
                serve(&services, weak, topic, handler);
            }

            LoopbackBroker {
                server,
                constants,
                services: Arc::new(services),
                state: Mutex::new(BrokerState::default()),
                failures: Mutex::new(HashMap::new()),
                registrations: AtomicU64::new(0),
                deregistrations: AtomicU64::new(0),
                routed: AtomicU64::new(0),
            }
        })
    }

    pub fn server(&self) -> &ServerDescription {
        &self.server
    }

    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    pub fn services(&self) -> Arc<LocalServiceMap> {
        self.services.clone()
    }

    /// Resolve a logical service name to its topic.
    pub fn service_topic(&self, name: &str) -> Option<&str> {
        self.constants.service_topic(name)
    }

    /// Make the next `times` calls to the service at `topic` fail with
    /// [`NodeSdkError::Service`].
    pub fn fail_next(&self, topic: &str, times: u32) {
        self.failures.lock().insert(topic.to_string(), times);
    }

    fn take_failure(&self, topic: &str) -> Result<()> {
        let mut failures = self.failures.lock();
        match failures.get_mut(topic) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(NodeSdkError::Service {
                    topic: topic.to_string(),
                    message: "injected failure".into(),
                })
            }
            _ => Ok(()),
        }
    }

    // ── Counters / inspection ────────────────────────────────────────

    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn deregistrations(&self) -> u64 {
        self.deregistrations.load(Ordering::SeqCst)
    }

    /// Records delivered to clients so far.
    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.state.lock().clients.contains_key(client_id)
    }

    /// Ids of registered clients (sorted).
    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn registered(&self, client_id: &str) -> Option<ClientSpec> {
        self.state.lock().clients.get(client_id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Subscriptions of a connected client, in subscription order.
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.state
            .lock()
            .links
            .get(client_id)
            .map(|link| link.subscriptions.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.state.lock().sessions.values().cloned().collect()
    }

    // ── Data connections ─────────────────────────────────────────────

    /// Open a data connection for a registered client.
    ///
    /// Frames the client sends are routed until its end is dropped.
    pub fn connect(self: &Arc<Self>, client_id: &str) -> Result<ChannelConnection> {
        if client_id.is_empty() || !self.is_registered(client_id) {
            return Err(NodeSdkError::InvalidState(format!(
                "client {client_id:?} must register before connecting"
            )));
        }

        let (conn, peer) = ChannelConnection::pair();
        let (tx, mut rx) = peer.into_parts();
        let previous = self.state.lock().links.insert(
            client_id.to_string(),
            Link {
                tx,
                subscriptions: Vec::new(),
            },
        );
        if previous.is_some() {
            tracing::warn!(client_id = %client_id, "client reconnected; dropping old link");
        }

        let weak = Arc::downgrade(self);
        let sender = client_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let Some(broker) = weak.upgrade() else { break };
                match frame {
                    TopicData::Error { title, message } => {
                        tracing::warn!(client_id = %sender, title = %title, message = %message, "client sent an error frame");
                    }
                    data => {
                        let records = data
                            .into_records()
                            .into_iter()
                            .map(|mut record| {
                                if record.client_id.is_empty() {
                                    record.client_id = sender.clone();
                                }
                                record
                            })
                            .collect();
                        broker.route(records).await;
                    }
                }
            }
            tracing::debug!(client_id = %sender, "client data connection ended");
        });

        tracing::debug!(client_id = %client_id, "client connected");
        Ok(conn)
    }

    /// Publish records from the broker side; returns how many deliveries
    /// were made.
    pub async fn publish(&self, records: Vec<TopicDataRecord>) -> usize {
        self.route(records).await
    }

    /// Send an error frame to one client.
    pub async fn send_error(&self, client_id: &str, title: &str, message: &str) -> Result<()> {
        let tx = self.link_sender(client_id)?;
        tx.send(Ok(TopicData::Error {
            title: title.to_string(),
            message: message.to_string(),
        }))
        .await
        .map_err(|_| NodeSdkError::Connection(format!("client {client_id} is gone")))
    }

    /// Drop a client's data connection; its inbound stream ends.
    pub fn disconnect(&self, client_id: &str) -> bool {
        self.state.lock().links.remove(client_id).is_some()
    }

    fn link_sender(&self, client_id: &str) -> Result<mpsc::Sender<Result<TopicData>>> {
        self.state
            .lock()
            .links
            .get(client_id)
            .map(|link| link.tx.clone())
            .ok_or_else(|| NodeSdkError::Connection(format!("client {client_id} is not connected")))
    }

    async fn route(&self, records: Vec<TopicDataRecord>) -> usize {
        let mut deliveries = Vec::new();
        {
            let state = self.state.lock();
            for record in records {
                for (client_id, link) in &state.links {
                    if link.wants(&record.topic) {
                        deliveries.push((client_id.clone(), link.tx.clone(), record.clone()));
                    }
                }
            }
        }

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (client_id, tx, record) in deliveries {
            if tx.send(Ok(TopicData::Record { record })).await.is_ok() {
                delivered += 1;
            } else if !gone.contains(&client_id) {
                gone.push(client_id);
            }
        }

        if !gone.is_empty() {
            let mut state = self.state.lock();
            for client_id in gone {
                if state.links.get(&client_id).is_some_and(|l| l.tx.is_closed()) {
                    state.links.remove(&client_id);
                    tracing::debug!(client_id = %client_id, "dropped closed client link");
                }
            }
        }

        self.routed.fetch_add(delivered as u64, Ordering::SeqCst);
        delivered
    }

    // ── Service handlers ─────────────────────────────────────────────

    fn handle_register(&self, request: Value) -> Result<Value> {
        let mut spec: ClientSpec = serde_json::from_value(request)?;
        let mut state = self.state.lock();
        if spec.id.is_empty() || !state.clients.contains_key(&spec.id) {
            spec.id = format!("client-{}", uuid::Uuid::new_v4());
        }
        state.clients.insert(spec.id.clone(), spec.clone());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(client_id = %spec.id, name = %spec.name, "broker registered client");
        Ok(serde_json::to_value(spec)?)
    }

    fn handle_deregister(&self, request: Value) -> Result<Value> {
        let spec: ClientSpec = serde_json::from_value(request)?;
        let mut state = self.state.lock();
        let known = state.clients.remove(&spec.id).is_some();
        state.links.remove(&spec.id);
        if known {
            self.deregistrations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(json!(known))
    }

    fn handle_subscribe(&self, request: Value) -> Result<Value> {
        let request: SubscriptionRequest = serde_json::from_value(request)?;
        let mut compiled = Vec::with_capacity(request.topics.len());
        for name in request.topics {
            let pattern = compile_wildcard(&name)?;
            compiled.push((name, pattern));
        }

        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(&request.client_id)
            .ok_or_else(|| not_connected(SUBSCRIBE_SERVICE, &request.client_id))?;
        for (name, pattern) in compiled {
            if !link.subscriptions.iter().any(|(n, _)| *n == name) {
                link.subscriptions.push((name, pattern));
            }
        }
        Ok(json!(true))
    }

    fn handle_unsubscribe(&self, request: Value) -> Result<Value> {
        let request: SubscriptionRequest = serde_json::from_value(request)?;
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(&request.client_id)
            .ok_or_else(|| not_connected(UNSUBSCRIBE_SERVICE, &request.client_id))?;
        let before = link.subscriptions.len();
        link.subscriptions
            .retain(|(name, _)| !request.topics.contains(name));
        Ok(json!(link.subscriptions.len() < before))
    }

    fn handle_register_device(&self, request: Value) -> Result<Value> {
        let DeviceRequest { client_id, mut device } = serde_json::from_value(request)?;
        let mut state = self.state.lock();
        let client = state
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| not_registered(REGISTER_DEVICE_SERVICE, &client_id))?;
        if device.id.is_empty() {
            device.id = format!("device-{}", uuid::Uuid::new_v4());
        }
        device.client_id = client_id;
        client.devices.retain(|d| d.id != device.id);
        client.devices.push(device.clone());
        Ok(serde_json::to_value(device)?)
    }

    fn handle_deregister_device(&self, request: Value) -> Result<Value> {
        let DeviceRequest { client_id, device } = serde_json::from_value(request)?;
        let mut state = self.state.lock();
        let client = state
            .clients
            .get_mut(&client_id)
            .ok_or_else(|| not_registered(DEREGISTER_DEVICE_SERVICE, &client_id))?;
        let before = client.devices.len();
        client.devices.retain(|d| d.id != device.id);
        Ok(json!(client.devices.len() < before))
    }

    fn handle_start_session(&self, request: Value) -> Result<Value> {
        let mut session: Session = serde_json::from_value(request)?;
        if session.id.is_empty() {
            session.id = format!("session-{}", uuid::Uuid::new_v4());
        }
        self.state
            .lock()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(serde_json::to_value(session)?)
    }

    fn handle_stop_session(&self, request: Value) -> Result<Value> {
        let session: Session = serde_json::from_value(request)?;
        let known = self.state.lock().sessions.remove(&session.id).is_some();
        Ok(json!(known))
    }

    fn handle_get_sessions(&self, _request: Value) -> Result<Value> {
        Ok(serde_json::to_value(SessionList {
            elements: self.sessions(),
        })?)
    }
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackBroker")
            .field("server", &self.server.name)
            .field("clients", &state.clients.len())
            .field("connections", &state.links.len())
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

/// Serve `topic` with a synchronous broker handler.
fn serve<F>(map: &LocalServiceMap, broker: &Weak<LoopbackBroker>, topic: &'static str, handler: F)
where
    F: Fn(&LoopbackBroker, Value) -> Result<Value> + Send + Sync + 'static,
{
    let broker = broker.clone();
    let handler = Arc::new(handler);
    map.register(topic, move |request: Value| {
        let broker = broker.clone();
        let handler = handler.clone();
        async move {
            let broker = broker.upgrade().ok_or_else(|| NodeSdkError::Service {
                topic: topic.to_string(),
                message: "broker shut down".into(),
            })?;
            broker.take_failure(topic)?;
            handler(&broker, request)
        }
    });
}

fn not_connected(service: &str, client_id: &str) -> NodeSdkError {
    NodeSdkError::Service {
        topic: service.to_string(),
        message: format!("client {client_id:?} is not connected"),
    }
}

fn not_registered(service: &str, client_id: &str) -> NodeSdkError {
    NodeSdkError::Service {
        topic: service.to_string(),
        message: format!("client {client_id:?} is not registered"),
    }
}

// ── Protocol ─────────────────────────────────────────────────────────

/// [`ClientProtocol`] for a [`LoopbackBroker`].
pub struct LoopbackProtocol {
    broker: Arc<LoopbackBroker>,
    skip: Vec<BehaviorKind>,
}

impl LoopbackProtocol {
    pub fn new(broker: Arc<LoopbackBroker>) -> Self {
        Self {
            broker,
            skip: Vec::new(),
        }
    }

    /// Leave `kind` unimplemented, e.g. to exercise the implement deadline.
    pub fn without(mut self, kind: BehaviorKind) -> Self {
        self.skip.push(kind);
        self
    }

    pub fn broker(&self) -> &Arc<LoopbackBroker> {
        &self.broker
    }
}

#[async_trait::async_trait]
impl ClientProtocol for LoopbackProtocol {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn create_service_map(&self, _ctx: &mut ProtocolContext) -> Result<Arc<dyn ServiceMap>> {
        Ok(self.broker.services())
    }

    async fn update_config(&self, ctx: &mut ProtocolContext) -> Result<()> {
        let services = ctx.service_map()?;
        let topic = ctx.config.server_config_topic.clone();
        let limit = ctx.config.request_timeout();
        let reply = ctx
            .config
            .retry
            .run("server_config", || {
                let services = services.clone();
                let topic = topic.clone();
                async move {
                    tokio::time::timeout(limit, services.server_config(&topic))
                        .await
                        .map_err(|_| NodeSdkError::Timeout(limit))?
                }
            })
            .await?;
        tracing::debug!(server = %reply.server.name, version = %reply.server.version, "broker configuration");
        ctx.server = Some(reply.server);
        ctx.constants = Some(reply.constants);
        Ok(())
    }

    async fn update_services(&self, ctx: &mut ProtocolContext) -> Result<()> {
        let services = ctx.service_map()?;
        let advertised = ctx
            .constants
            .as_ref()
            .map(|c| c.default_topics.clone())
            .unwrap_or_default();
        for (name, topic) in advertised {
            if !services.contains(&topic) {
                tracing::warn!(service = %name, topic = %topic, "advertised service is not served");
            }
        }
        Ok(())
    }

    async fn create_client(&self, ctx: &mut ProtocolContext) -> Result<()> {
        ctx.client.set_status(ClientStatus::Unavailable);
        Ok(())
    }

    async fn register_client(
        &self,
        ctx: &mut ProtocolContext,
    ) -> Result<Box<dyn ScopedResource<Output = ()>>> {
        Ok(Box::new(ServiceRegistration::from_context(ctx)?))
    }

    async fn create_topic_connection(&self, ctx: &mut ProtocolContext) -> Result<Arc<dyn DataConnection>> {
        Ok(Arc::new(self.broker.connect(&ctx.client.id())?))
    }

    async fn implement_client(&self, ctx: &mut ProtocolContext) -> Result<()> {
        let env = SlotEnv::from_context(ctx)?;
        let client = ctx.client.clone();
        let kinds: Vec<BehaviorKind> = client
            .behaviors()
            .iter()
            .filter(|kind| !self.skip.contains(kind))
            .collect();

        for kind in kinds {
            match kind {
                BehaviorKind::Services => {
                    let map = env.services.clone();
                    client.update::<Services>(|s| s.service_map = Some(map))?;
                }
                BehaviorKind::Subscriptions => client.set(kind, env.subscriptions()?)?,
                BehaviorKind::Publish => client.set(kind, env.publish())?,
                BehaviorKind::Register => client.set(kind, env.register()?)?,
                BehaviorKind::Devices => client.set(kind, env.devices()?)?,
                BehaviorKind::Sessions => client.set(kind, env.sessions()?)?,
                other => {
                    tracing::debug!(behavior = %other, "behavior not provided by the loopback broker");
                }
            }
        }
        Ok(())
    }
}

/// What the behavior slots capture.  Holds the client weakly: the slots
/// live inside the client.
#[derive(Clone)]
struct SlotEnv {
    client: Weak<ClientInner>,
    services: Arc<dyn ServiceMap>,
    connection: Arc<dyn DataConnection>,
    store: Arc<TopicStore>,
    constants: Constants,
}

impl SlotEnv {
    fn from_context(ctx: &ProtocolContext) -> Result<Self> {
        Ok(Self {
            client: ctx.client.downgrade(),
            services: ctx.service_map()?,
            connection: ctx.topic_connection()?,
            store: ctx.topic_store.clone(),
            constants: ctx.constants.clone().unwrap_or_default(),
        })
    }

    fn client(&self) -> Result<Client> {
        Client::upgrade(&self.client).ok_or_else(|| NodeSdkError::InvalidState("client dropped".into()))
    }

    fn topic(&self, service: &str) -> Result<String> {
        self.constants
            .service_topic(service)
            .map(str::to_string)
            .ok_or_else(|| NodeSdkError::InvalidState(format!("broker does not advertise {service}")))
    }

    fn subscriptions(&self) -> Result<Subscriptions> {
        let subscribe = self.topic(SUBSCRIBE_SERVICE)?;
        let unsubscribe = self.topic(UNSUBSCRIBE_SERVICE)?;
        Ok(Subscriptions {
            subscribe_regex: Some(self.subscriber(subscribe.clone(), true)),
            subscribe_topic: Some(self.subscriber(subscribe, false)),
            unsubscribe_regex: Some(self.unsubscriber(unsubscribe.clone(), true)),
            unsubscribe_topic: Some(self.unsubscriber(unsubscribe, false)),
        })
    }

    fn subscriber(&self, service: String, patterns: bool) -> SubscribeFn {
        let env = self.clone();
        Arc::new(move |names: Vec<String>| -> SlotFuture<Vec<Arc<Topic>>> {
            let env = env.clone();
            let service = service.clone();
            Box::pin(async move {
                check_names(&names, patterns)?;
                let topics = names
                    .iter()
                    .map(|name| env.store.get_or_create(name))
                    .collect::<Result<Vec<_>>>()?;
                let client_id = env.client()?.id();
                env.services
                    .call(&service, json!({ "client_id": client_id, "topics": names }))
                    .await?;
                Ok(topics)
            })
        })
    }

    fn unsubscriber(&self, service: String, patterns: bool) -> SubscribeFn {
        let env = self.clone();
        Arc::new(move |names: Vec<String>| -> SlotFuture<Vec<Arc<Topic>>> {
            let env = env.clone();
            let service = service.clone();
            Box::pin(async move {
                check_names(&names, patterns)?;
                let client_id = env.client()?.id();
                env.services
                    .call(&service, json!({ "client_id": client_id, "topics": names }))
                    .await?;
                // Names that were never subscribed have nothing to return.
                Ok(names.iter().filter_map(|name| env.store.remove(name)).collect())
            })
        })
    }

    fn publish(&self) -> Publish {
        let env = self.clone();
        let publish: PublishFn = Arc::new(move |records: Vec<TopicDataRecord>| -> SlotFuture<()> {
            let env = env.clone();
            Box::pin(async move {
                if records.is_empty() {
                    return Ok(());
                }
                let client_id = env.client()?.id();
                let records = records
                    .into_iter()
                    .map(|mut record| {
                        record.client_id = client_id.clone();
                        record
                    })
                    .collect();
                env.connection.send(TopicData::from_records(records)).await
            })
        });
        Publish {
            publish: Some(publish),
        }
    }

    fn register(&self) -> Result<Register> {
        let register_topic = self.topic(REGISTRATION_SERVICE)?;
        let deregister_topic = self.topic(DEREGISTRATION_SERVICE)?;

        let env = self.clone();
        let (reg_topic, dereg_topic) = (register_topic.clone(), deregister_topic.clone());
        let register: RegisterFn = Arc::new(move || -> SlotFuture<()> {
            let env = env.clone();
            let (reg_topic, dereg_topic) = (reg_topic.clone(), dereg_topic.clone());
            Box::pin(async move {
                let mut registration =
                    ServiceRegistration::new(env.client()?, env.services.clone(), reg_topic, dereg_topic);
                registration.acquire().await
            })
        });

        let env = self.clone();
        let deregister: DeregisterFn = Arc::new(move || -> SlotFuture<bool> {
            let env = env.clone();
            let topic = deregister_topic.clone();
            Box::pin(async move {
                let client = env.client()?;
                let reply = env
                    .services
                    .call(&topic, serde_json::to_value(client.spec())?)
                    .await?;
                let known = reply.as_bool().unwrap_or(false);
                if known {
                    client.set_id("");
                }
                Ok(known)
            })
        });

        Ok(Register {
            register: Some(register),
            deregister: Some(deregister),
        })
    }

    fn devices(&self) -> Result<Devices> {
        let register_topic = self.topic(REGISTER_DEVICE_SERVICE)?;
        let deregister_topic = self.topic(DEREGISTER_DEVICE_SERVICE)?;

        let env = self.clone();
        let register_device: RegisterDeviceFn = Arc::new(move |device: Device| -> SlotFuture<Device> {
            let env = env.clone();
            let topic = register_topic.clone();
            Box::pin(async move {
                let client = env.client()?;
                let reply = env
                    .services
                    .call(&topic, json!({ "client_id": client.id(), "device": device }))
                    .await?;
                let device: Device = serde_json::from_value(reply)?;
                let added = device.clone();
                client.update_spec(|spec| {
                    spec.devices.retain(|d| d.id != added.id);
                    spec.devices.push(added);
                });
                Ok(device)
            })
        });

        let env = self.clone();
        let deregister_device: DeregisterDeviceFn = Arc::new(move |device: Device| -> SlotFuture<()> {
            let env = env.clone();
            let topic = deregister_topic.clone();
            Box::pin(async move {
                let client = env.client()?;
                env.services
                    .call(&topic, json!({ "client_id": client.id(), "device": device }))
                    .await?;
                client.update_spec(|spec| spec.devices.retain(|d| d.id != device.id));
                Ok(())
            })
        });

        Ok(Devices {
            register_device: Some(register_device),
            deregister_device: Some(deregister_device),
        })
    }

    fn sessions(&self) -> Result<Sessions> {
        let start_topic = self.topic(START_SESSION_SERVICE)?;
        let stop_topic = self.topic(STOP_SESSION_SERVICE)?;
        let list_topic = self.topic(GET_SESSIONS_SERVICE)?;

        let env = self.clone();
        let start_session: StartSessionFn = Arc::new(move |session: Session| -> SlotFuture<Session> {
            let env = env.clone();
            let topic = start_topic.clone();
            Box::pin(async move {
                let reply = env.services.call(&topic, serde_json::to_value(&session)?).await?;
                let started: Session = serde_json::from_value(reply)?;
                let tracked = started.clone();
                env.client()?.update::<Sessions>(|s| {
                    s.sessions
                        .get_or_insert_with(HashMap::new)
                        .insert(tracked.id.clone(), tracked);
                })?;
                Ok(started)
            })
        });

        let env = self.clone();
        let stop_session: StopSessionFn = Arc::new(move |session: Session| -> SlotFuture<bool> {
            let env = env.clone();
            let topic = stop_topic.clone();
            Box::pin(async move {
                let reply = env.services.call(&topic, serde_json::to_value(&session)?).await?;
                env.client()?.update::<Sessions>(|s| {
                    if let Some(sessions) = s.sessions.as_mut() {
                        sessions.remove(&session.id);
                    }
                })?;
                Ok(reply.as_bool().unwrap_or(false))
            })
        });

        let env = self.clone();
        let get_sessions: GetSessionsFn = Arc::new(move || -> SlotFuture<SessionList> {
            let env = env.clone();
            let topic = list_topic.clone();
            Box::pin(async move {
                let reply = env.services.call(&topic, Value::Null).await?;
                Ok(serde_json::from_value(reply)?)
            })
        });

        Ok(Sessions {
            sessions: Some(HashMap::new()),
            start_session: Some(start_session),
            stop_session: Some(stop_session),
            get_sessions: Some(get_sessions),
        })
    }
}

/// Plain topic slots take names only; the `_regex` slots take both.
fn check_names(names: &[String], patterns: bool) -> Result<()> {
    if patterns {
        return Ok(());
    }
    match names.iter().find(|name| is_wildcard(name)) {
        Some(name) => Err(NodeSdkError::InvalidArgument(format!(
            "{name:?} is a pattern; use the regex slot"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_config_advertises_every_service() {
        let broker = LoopbackBroker::new();
        let reply = broker
            .services()
            .server_config(DEFAULT_SERVER_CONFIG_TOPIC)
            .await
            .unwrap();
        assert_eq!(reply.server.id, "loopback");
        for (name, topic) in SERVICE_TOPICS {
            assert_eq!(reply.constants.service_topic(name), Some(topic));
            assert!(broker.services().contains(topic));
        }
    }

    #[tokio::test]
    async fn registration_round_trip() {
        let broker = LoopbackBroker::new();
        let services = broker.services();
        let spec = ClientSpec {
            name: "registrant".into(),
            ..Default::default()
        };

        let reply = services
            .call("/services/client/registration", serde_json::to_value(&spec).unwrap())
            .await
            .unwrap();
        let registered: ClientSpec = serde_json::from_value(reply).unwrap();
        assert!(registered.id.starts_with("client-"));
        assert!(broker.is_registered(&registered.id));
        assert_eq!(broker.registrations(), 1);

        let known = services
            .call("/services/client/deregistration", serde_json::to_value(&registered).unwrap())
            .await
            .unwrap();
        assert_eq!(known, json!(true));
        assert!(broker.registered_ids().is_empty());
        assert_eq!(broker.deregistrations(), 1);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let broker = LoopbackBroker::new();
        broker.fail_next(DEFAULT_SERVER_CONFIG_TOPIC, 1);
        let services = broker.services();
        assert!(services.server_config(DEFAULT_SERVER_CONFIG_TOPIC).await.is_err());
        assert!(services.server_config(DEFAULT_SERVER_CONFIG_TOPIC).await.is_ok());
    }

    #[tokio::test]
    async fn unregistered_clients_cannot_connect() {
        let broker = LoopbackBroker::new();
        assert!(matches!(
            broker.connect("nobody"),
            Err(NodeSdkError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn routing_follows_wildcard_subscriptions() {
        let broker = LoopbackBroker::new();
        let services = broker.services();
        let reply = services
            .call("/services/client/registration", json!({ "name": "sink" }))
            .await
            .unwrap();
        let id = reply["id"].as_str().unwrap().to_string();

        let conn = broker.connect(&id).unwrap();
        let mut inbound = conn.stream().unwrap();
        services
            .call(
                "/services/topics/subscribe",
                json!({ "client_id": id, "topics": ["/sensors/*"] }),
            )
            .await
            .unwrap();
        assert_eq!(broker.subscriptions(&id), vec!["/sensors/*"]);

        let delivered = broker
            .publish(vec![
                TopicDataRecord::new("/sensors/temp", json!(21.5)),
                TopicDataRecord::new("/actuators/fan", json!(true)),
            ])
            .await;
        assert_eq!(delivered, 1);

        use futures_util::StreamExt;
        match inbound.next().await {
            Some(Ok(TopicData::Record { record })) => assert_eq!(record.topic, "/sensors/temp"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn plain_slots_reject_patterns() {
        assert!(check_names(&["/a/*".to_string()], true).is_ok());
        assert!(matches!(
            check_names(&["/a/b".to_string(), "/a/?".to_string()], false),
            Err(NodeSdkError::InvalidArgument(_))
        ));
    }
}
