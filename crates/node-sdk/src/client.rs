//! The client node handle: identity, declared behaviors, readiness.
//!
//! A [`Client`] is a cheap clonable handle.  It owns its behavior
//! instances; the protocol fills their slots while it runs, and every
//! write wakes whoever waits on [`Client::implements`] or
//! [`Client::await_usable`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use nl_protocol::{ClientSpec, ClientStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::behavior::{AnyBehavior, Behavior, BehaviorKind, Behaviors};
use crate::builder::ClientBuilder;
use crate::config::BrokerConfig;
use crate::error::{NodeSdkError, Result};
use crate::gate::ReadinessGate;
use crate::lifecycle::{ClientProtocol, LifecycleState, ProtocolRunner};
use crate::registry::ClientRegistry;
use crate::scope::{ScopedTask, TaskScope};

/// Name given to clients built without one.
pub const DEFAULT_CLIENT_NAME: &str = "Rust-Client-nodelink";

/// A client node.  Create via [`ClientBuilder`].
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    spec: RwLock<ClientSpec>,
    /// What [`Client::reset`] restores.
    initial_spec: RwLock<ClientSpec>,
    behaviors: Behaviors,
    instances: RwLock<BTreeMap<BehaviorKind, AnyBehavior>>,
    gate: ReadinessGate,
    config: BrokerConfig,
    runner: ProtocolRunner,
    usable_tx: watch::Sender<bool>,
    usable_task: Mutex<Option<ScopedTask<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if !self.spec.get_mut().id.is_empty() {
            ClientRegistry::global().prune();
        }
    }
}

impl Client {
    /// Start a new builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_parts(
        spec: ClientSpec,
        behaviors: Behaviors,
        protocol: Arc<dyn ClientProtocol>,
        config: BrokerConfig,
    ) -> Self {
        let instances = behaviors
            .iter()
            .map(|kind| (kind, AnyBehavior::empty(kind)))
            .collect();
        let (usable_tx, _) = watch::channel(false);

        let client = Client {
            inner: Arc::new(ClientInner {
                initial_spec: RwLock::new(spec.clone()),
                spec: RwLock::new(spec),
                behaviors,
                instances: RwLock::new(instances),
                gate: ReadinessGate::new(),
                config,
                runner: ProtocolRunner::new(protocol),
                usable_tx,
                usable_task: Mutex::new(None),
            }),
        };
        client.sync_registry("");
        client
    }

    // ── Identity ─────────────────────────────────────────────────────

    /// Broker-assigned id; empty until registered.
    pub fn id(&self) -> String {
        self.inner.spec.read().id.clone()
    }

    pub fn name(&self) -> String {
        self.inner.spec.read().name.clone()
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.spec.read().status
    }

    pub fn spec(&self) -> ClientSpec {
        self.inner.spec.read().clone()
    }

    /// Edit the client's fields in place.
    pub fn update_spec(&self, f: impl FnOnce(&mut ClientSpec)) {
        let old_id = {
            let mut spec = self.inner.spec.write();
            let old_id = spec.id.clone();
            f(&mut spec);
            old_id
        };
        self.sync_registry(&old_id);
    }

    pub fn set_status(&self, status: ClientStatus) {
        self.inner.spec.write().status = status;
    }

    /// Set the broker-assigned id.  An empty id marks the client as
    /// unregistered and drops it from the [`ClientRegistry`].
    pub fn set_id(&self, id: impl Into<String>) {
        let id = id.into();
        self.update_spec(|spec| spec.id = id);
    }

    pub fn initial_spec(&self) -> ClientSpec {
        self.inner.initial_spec.read().clone()
    }

    /// Replace the values [`reset`](Self::reset) restores.
    pub fn set_initial_spec(&self, spec: ClientSpec) {
        *self.inner.initial_spec.write() = spec;
    }

    fn sync_registry(&self, old_id: &str) {
        let new_id = self.id();
        if old_id == new_id {
            return;
        }
        let registry = ClientRegistry::global();
        if !old_id.is_empty() {
            registry.remove(old_id, self);
        }
        if !new_id.is_empty() {
            registry.insert(&new_id, self);
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Gate signalled on every behavior write.
    pub fn gate(&self) -> &ReadinessGate {
        &self.inner.gate
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ClientInner>) -> Option<Client> {
        weak.upgrade().map(|inner| Client { inner })
    }

    pub(crate) fn ptr_eq(&self, other: &Weak<ClientInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.inner), other.as_ptr())
    }

    // ── Behaviors ────────────────────────────────────────────────────

    /// Declared required and optional behavior kinds.
    pub fn behaviors(&self) -> &Behaviors {
        &self.inner.behaviors
    }

    /// Whether every kind is declared (required or optional), regardless
    /// of whether it is implemented yet.
    pub fn wants(&self, kinds: &[BehaviorKind]) -> bool {
        kinds.iter().all(|k| self.inner.behaviors.contains(*k))
    }

    /// Check or await that every slot of every kind is filled.
    pub fn implements(&self, kinds: &[BehaviorKind]) -> Implements {
        Implements {
            client: self.clone(),
            kinds: kinds.to_vec(),
            timeout: None,
        }
    }

    /// Whether every required behavior is implemented.
    pub fn usable(&self) -> bool {
        self.check(&self.inner.behaviors.required)
    }

    /// Wait until [`usable`](Self::usable).  Without `timeout` the
    /// configured default wait bound applies, if any.
    pub async fn await_usable(&self, timeout: Option<Duration>) -> Result<()> {
        let required = self.inner.behaviors.required.clone();
        let mut implements = self.implements(&required);
        implements.timeout = timeout;
        implements.await
    }

    /// Flips to `true` once the client became usable in the current run.
    pub fn usable_watch(&self) -> watch::Receiver<bool> {
        self.inner.usable_tx.subscribe()
    }

    /// Required behaviors that are not implemented, with their empty slots.
    pub fn missing_required(&self) -> Vec<(BehaviorKind, Vec<&'static str>)> {
        let instances = self.inner.instances.read();
        self.inner
            .behaviors
            .required
            .iter()
            .filter_map(|kind| {
                let missing = instances.get(kind).map(AnyBehavior::missing_slots)?;
                (!missing.is_empty()).then_some((*kind, missing))
            })
            .collect()
    }

    fn check(&self, kinds: &[BehaviorKind]) -> bool {
        let instances = self.inner.instances.read();
        kinds
            .iter()
            .all(|kind| instances.get(kind).is_some_and(AnyBehavior::is_implemented))
    }

    /// Snapshot of the behavior instance of type `B`; `None` when `B` is
    /// not declared by this client.
    pub fn get<B: Behavior>(&self) -> Option<B> {
        self.inner
            .instances
            .read()
            .get(&B::KIND)
            .and_then(B::from_any)
            .cloned()
    }

    pub fn get_any(&self, kind: BehaviorKind) -> Option<AnyBehavior> {
        self.inner.instances.read().get(&kind).cloned()
    }

    /// Write slots of behavior `B` and wake the waiters.
    pub fn update<B: Behavior>(&self, f: impl FnOnce(&mut B)) -> Result<()> {
        {
            let mut instances = self.inner.instances.write();
            let behavior = instances
                .get_mut(&B::KIND)
                .and_then(B::from_any_mut)
                .ok_or_else(|| undeclared(B::KIND))?;
            f(behavior);
        }
        self.inner.gate.signal();
        Ok(())
    }

    /// Replace the whole instance of `kind`.  `value` must be of that kind.
    pub fn set(&self, kind: BehaviorKind, value: impl Into<AnyBehavior>) -> Result<()> {
        let value = value.into();
        if value.kind() != kind {
            return Err(NodeSdkError::InvalidArgument(format!(
                "cannot set {kind} to a {} instance",
                value.kind()
            )));
        }
        {
            let mut instances = self.inner.instances.write();
            let slot = instances.get_mut(&kind).ok_or_else(|| undeclared(kind))?;
            *slot = value;
        }
        self.inner.gate.signal();
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn runner(&self) -> &ProtocolRunner {
        &self.inner.runner
    }

    pub fn protocol_state(&self) -> LifecycleState {
        self.inner.runner.state()
    }

    /// Start the protocol unless it already started.
    pub fn start(&self) -> Result<()> {
        if self.inner.runner.start(self)? && self.inner.usable_task.lock().is_none() {
            let scope = self.inner.runner.ensure_scope()?;
            self.spawn_usable_task(&scope);
        }
        Ok(())
    }

    /// Start the protocol and wait until the client is usable.
    ///
    /// Fails with the run's error if the protocol finishes first.  On an
    /// already finished protocol nothing is restarted: entry only warns
    /// and succeeds if the behaviors are still filled, so prefer
    /// [`reset`](Self::reset) first.
    pub async fn enter(&self) -> Result<Client> {
        if self.protocol_state().is_terminal() {
            tracing::warn!(
                client = %self.name(),
                "entering a client whose protocol already finished; reset it first"
            );
        }
        self.start()?;

        let runner = self.inner.runner.clone();
        tokio::select! {
            biased;
            ready = self.await_usable(None) => {
                ready?;
                Ok(self.clone())
            }
            _ = runner.wait_finished() => {
                runner.join().await?;
                Err(NodeSdkError::InvalidState(format!(
                    "protocol of client {:?} finished before the client became usable",
                    self.name()
                )))
            }
        }
    }

    /// Stop the protocol and run its teardown (deregistration included).
    pub async fn exit(&self) -> Result<()> {
        self.inner.runner.stop().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.exit().await
    }

    /// Enter, run `body` with the usable client, then always exit.
    ///
    /// An error from `body` wins over an error from exiting.
    pub async fn scoped<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = match self.enter().await {
            Ok(client) => client,
            Err(e) => {
                if let Err(teardown) = self.exit().await {
                    tracing::warn!(client = %self.name(), error = %teardown, "exit after failed enter");
                }
                return Err(e);
            }
        };

        let outcome = body(client).await;
        let exited = self.exit().await;
        match (outcome, exited) {
            (Err(e), Err(teardown)) => {
                tracing::warn!(client = %self.name(), error = %teardown, "exit failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(teardown)) => Err(teardown),
            (Ok(v), Ok(())) => Ok(v),
        }
    }

    /// Recycle a client whose protocol finished.
    ///
    /// Empties every behavior slot, replaces the readiness task, returns
    /// the protocol to `NotStarted` and restores the initial spec.  A dead
    /// task scope is rebuilt first.  Fails with
    /// [`NodeSdkError::InvalidState`] (changing nothing) unless finished.
    pub fn reset(&self) -> Result<()> {
        let runner = &self.inner.runner;
        let state = runner.state();
        if !state.is_terminal() {
            return Err(NodeSdkError::InvalidState(format!(
                "cannot reset client {:?}: protocol is {state}",
                self.name()
            )));
        }

        let scope = runner.ensure_scope()?;

        for behavior in self.inner.instances.write().values_mut() {
            behavior.clear();
        }
        self.inner.gate.clear_pending();

        if let Some(old) = self.inner.usable_task.lock().take() {
            old.abort();
        }
        self.inner.usable_tx.send_replace(false);
        self.spawn_usable_task(&scope);

        runner.reset_state()?;

        let old_id = self.id();
        let initial = self.inner.initial_spec.read().clone();
        *self.inner.spec.write() = initial;
        self.sync_registry(&old_id);

        tracing::debug!(old_id = %old_id, client = %self.name(), "client reset");
        self.inner.gate.signal();
        Ok(())
    }

    /// Background task flipping [`usable_watch`](Self::usable_watch) once
    /// the client becomes usable.
    fn spawn_usable_task(&self, scope: &TaskScope) {
        let weak = self.downgrade();
        let gate = self.inner.gate.clone();
        let task = scope.spawn(async move {
            let target = weak.clone();
            let usable = move || {
                target
                    .upgrade()
                    .map_or(true, |inner| Client { inner }.usable())
            };
            if gate.wait(usable, None).await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let client = Client { inner };
                tracing::info!(client_id = %client.id(), client = %client.name(), "client usable");
                client.inner.usable_tx.send_replace(true);
            }
        });
        *self.inner.usable_task.lock() = Some(task);
    }
}

fn undeclared(kind: BehaviorKind) -> NodeSdkError {
    NodeSdkError::InvalidArgument(format!("behavior {kind} is not declared by this client"))
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spec = self.inner.spec.read();
        f.debug_struct("Client")
            .field("id", &spec.id)
            .field("name", &spec.name)
            .field("status", &spec.status)
            .field("behaviors", &self.inner.behaviors)
            .field("state", &self.inner.runner.state())
            .finish()
    }
}

/// Checkable / awaitable "all slots of these kinds are filled".
///
/// ```rust,ignore
/// if client.implements(&[BehaviorKind::Publish]).is_met() { ... }
/// client.implements(&[BehaviorKind::Publish]).timeout(Duration::from_secs(1)).await?;
/// ```
#[must_use = "an Implements does nothing unless checked or awaited"]
pub struct Implements {
    client: Client,
    kinds: Vec<BehaviorKind>,
    timeout: Option<Duration>,
}

impl Implements {
    pub fn is_met(&self) -> bool {
        self.client.check(&self.kinds)
    }

    /// Fail with [`NodeSdkError::Timeout`] after `limit`.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Wait until met.  Kinds the client does not declare can never be
    /// met and fail with [`NodeSdkError::InvalidArgument`].
    pub async fn wait(self) -> Result<()> {
        if let Some(kind) = self
            .kinds
            .iter()
            .find(|k| !self.client.inner.behaviors.contains(**k))
        {
            return Err(undeclared(*kind));
        }

        let timeout = self
            .timeout
            .or_else(|| self.client.inner.config.default_wait_timeout());
        let gate = self.client.inner.gate.clone();
        let Implements { client, kinds, .. } = self;
        gate.wait(move || client.check(&kinds), timeout).await
    }
}

impl IntoFuture for Implements {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl fmt::Debug for Implements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Implements")
            .field("kinds", &self.kinds)
            .field("met", &self.is_met())
            .field("timeout", &self.timeout)
            .finish()
    }
}
