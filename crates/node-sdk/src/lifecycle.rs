//! Client lifecycle protocol: the hook-ordered state machine a broker
//! version plugs into, and the runner that drives it.
//!
//! # Run order (fixed)
//!
//! ```text
//!  NotStarted ─start()─► Starting
//!     on_start          create_service_map → update_config → update_services → create_client
//!  ─► Created
//!     on_create         enter register_client() under the task scope
//!  ─► Registered
//!     on_registration   create_topic_connection → implement_client → wait usable (5s, fatal)
//!  ─► Active
//!     on_connect        spawn record relay under the task scope
//!  ─► Connected         ... until stop() ...
//!  ─► Stopping
//!     on_stop           status UNAVAILABLE, disconnect; then close the task scope
//!  ─► Finished          (terminal until reset)
//! ```
//!
//! Any hook error aborts the run.  Teardown (`on_stop`, scope close with
//! deregistration) still runs; its failures are logged and never replace
//! the original error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nl_protocol::ClientStatus;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::connection::DataConnection;
use crate::context::ProtocolContext;
use crate::error::{NodeSdkError, Result};
use crate::pipeline::{global_interceptors, Hook, HookInterceptor, Next};
use crate::scope::{ScopedResource, TaskScope};
use crate::service::ServiceMap;
use crate::topics::relay_records;

/// How long `on_registration` waits for the client to become usable.
/// Exceeding it aborts the run with [`NodeSdkError::Fatal`].
pub const IMPLEMENT_DEADLINE: Duration = Duration::from_secs(5);

/// Where a protocol run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Starting,
    Created,
    Registered,
    Active,
    Connected,
    Stopping,
    Finished,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Finished)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not_started",
            LifecycleState::Starting => "starting",
            LifecycleState::Created => "created",
            LifecycleState::Registered => "registered",
            LifecycleState::Active => "active",
            LifecycleState::Connected => "connected",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Finished => "finished",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A broker-version specific implementation of the client lifecycle.
///
/// The seven required methods have no default: the broker version must
/// supply them.  The five hooks default to [`default_on_start`] and
/// friends; an override can call the default and add to it.
///
/// # Example
///
/// ```rust,ignore
/// #[async_trait::async_trait]
/// impl ClientProtocol for MyBroker {
///     // ... required methods ...
///
///     async fn on_stop(&self, ctx: &mut ProtocolContext) -> Result<()> {
///         self.flush_metrics().await;
///         default_on_stop(self, ctx).await
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait ClientProtocol: Send + Sync + 'static {
    /// Label used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Build the service invocation map.
    async fn create_service_map(&self, ctx: &mut ProtocolContext) -> Result<Arc<dyn ServiceMap>>;

    /// Fetch the broker configuration (server description, constants).
    async fn update_config(&self, ctx: &mut ProtocolContext) -> Result<()>;

    /// Refresh the service map from the broker configuration.
    async fn update_services(&self, ctx: &mut ProtocolContext) -> Result<()>;

    /// Prepare the client for registration (the client is not usable yet).
    async fn create_client(&self, ctx: &mut ProtocolContext) -> Result<()>;

    /// Registration resource: acquiring it registers the client, releasing
    /// it deregisters.
    async fn register_client(&self, ctx: &mut ProtocolContext)
        -> Result<Box<dyn ScopedResource<Output = ()>>>;

    /// Open the topic data connection.
    async fn create_topic_connection(&self, ctx: &mut ProtocolContext) -> Result<Arc<dyn DataConnection>>;

    /// Fill in the remaining behavior slots of the client.
    async fn implement_client(&self, ctx: &mut ProtocolContext) -> Result<()>;

    async fn on_start(&self, ctx: &mut ProtocolContext) -> Result<()> {
        default_on_start(self, ctx).await
    }

    async fn on_create(&self, ctx: &mut ProtocolContext) -> Result<()> {
        default_on_create(self, ctx).await
    }

    async fn on_registration(&self, ctx: &mut ProtocolContext) -> Result<()> {
        default_on_registration(self, ctx).await
    }

    async fn on_connect(&self, ctx: &mut ProtocolContext) -> Result<()> {
        default_on_connect(self, ctx).await
    }

    async fn on_stop(&self, ctx: &mut ProtocolContext) -> Result<()> {
        default_on_stop(self, ctx).await
    }
}

// ── Default hooks ────────────────────────────────────────────────────

pub async fn default_on_start<P>(protocol: &P, ctx: &mut ProtocolContext) -> Result<()>
where
    P: ClientProtocol + ?Sized,
{
    let service_map = protocol.create_service_map(ctx).await?;
    ctx.service_map = Some(service_map);
    protocol.update_config(ctx).await?;
    protocol.update_services(ctx).await?;
    protocol.create_client(ctx).await?;
    tracing::debug!(
        client = %ctx.client.name(),
        server = ?ctx.server.as_ref().map(|s| s.name.as_str()),
        "client created"
    );
    Ok(())
}

pub async fn default_on_create<P>(protocol: &P, ctx: &mut ProtocolContext) -> Result<()>
where
    P: ClientProtocol + ?Sized,
{
    let registration = protocol.register_client(ctx).await?;
    ctx.scope().enter_scoped(registration).await?;
    tracing::info!(client_id = %ctx.client.id(), client = %ctx.client.name(), "client registered");
    Ok(())
}

pub async fn default_on_registration<P>(protocol: &P, ctx: &mut ProtocolContext) -> Result<()>
where
    P: ClientProtocol + ?Sized,
{
    let connection = protocol.create_topic_connection(ctx).await?;
    ctx.topic_connection = Some(connection);
    protocol.implement_client(ctx).await?;

    match ctx.client.await_usable(Some(IMPLEMENT_DEADLINE)).await {
        Ok(()) => {}
        Err(NodeSdkError::Timeout(_)) => {
            let missing: Vec<String> = ctx
                .client
                .missing_required()
                .into_iter()
                .map(|(kind, slots)| format!("{kind}({})", slots.join(", ")))
                .collect();
            return Err(NodeSdkError::Fatal(format!(
                "client {:?} was not implemented within {:?}; missing {}",
                ctx.client.name(),
                IMPLEMENT_DEADLINE,
                missing.join(", ")
            )));
        }
        Err(e) => return Err(e),
    }

    ctx.client.set_status(ClientStatus::Active);
    Ok(())
}

pub async fn default_on_connect<P>(_protocol: &P, ctx: &mut ProtocolContext) -> Result<()>
where
    P: ClientProtocol + ?Sized,
{
    let stream = ctx.topic_connection()?.stream()?;
    let store = ctx.topic_store.clone();
    ctx.relay = Some(ctx.scope().spawn(relay_records(stream, store)));
    tracing::debug!(client_id = %ctx.client.id(), "record relay started");
    Ok(())
}

pub async fn default_on_stop<P>(_protocol: &P, ctx: &mut ProtocolContext) -> Result<()>
where
    P: ClientProtocol + ?Sized,
{
    ctx.client.set_status(ClientStatus::Unavailable);
    if let Some(connection) = &ctx.topic_connection {
        connection.disconnect().await;
    }
    Ok(())
}

// ── Runner ───────────────────────────────────────────────────────────

/// Drives one [`ClientProtocol`] for one client.  Cheap to clone.
#[derive(Clone)]
pub struct ProtocolRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    protocol: Arc<dyn ClientProtocol>,
    state: watch::Sender<LifecycleState>,
    scope: Mutex<Option<Arc<TaskScope>>>,
    stop: Mutex<CancellationToken>,
    run: Mutex<Option<JoinHandle<Result<()>>>>,
    /// Runner-local interceptors in registration order; the last one is
    /// outermost.  Global interceptors sit inside them.
    interceptors: RwLock<Vec<Arc<dyn HookInterceptor>>>,
}

impl ProtocolRunner {
    /// New runner.  Global interceptors are looked up on every hook, so
    /// ones registered after construction still apply.
    pub fn new(protocol: Arc<dyn ClientProtocol>) -> Self {
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            inner: Arc::new(RunnerInner {
                protocol,
                state,
                scope: Mutex::new(None),
                stop: Mutex::new(CancellationToken::new()),
                run: Mutex::new(None),
                interceptors: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn protocol(&self) -> &Arc<dyn ClientProtocol> {
        &self.inner.protocol
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub fn was_started(&self) -> bool {
        self.state() != LifecycleState::NotStarted
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Add an interceptor; it becomes the outermost one.
    pub fn intercept(&self, interceptor: impl HookInterceptor) {
        self.inner.interceptors.write().push(Arc::new(interceptor));
    }

    pub(crate) fn intercept_arc(&self, interceptor: Arc<dyn HookInterceptor>) {
        self.inner.interceptors.write().push(interceptor);
    }

    /// The current task scope, if one was created.
    pub fn scope(&self) -> Option<Arc<TaskScope>> {
        self.inner.scope.lock().clone()
    }

    /// The current task scope, created or rebuilt when missing or dead.
    pub fn ensure_scope(&self) -> Result<Arc<TaskScope>> {
        let mut slot = self.inner.scope.lock();
        let scope = match slot.take() {
            Some(scope) if scope.is_alive() && !scope.is_closed() => scope,
            Some(dead) => {
                if dead.is_closed() {
                    tracing::debug!(scope = %dead.name(), "rebuilding closed task scope");
                } else {
                    tracing::warn!(scope = %dead.name(), "task scope died, rebuilding");
                }
                dead.rebuild()?
            }
            None => TaskScope::new(format!("protocol:{}", self.inner.protocol.name()))?,
        };
        *slot = Some(scope.clone());
        Ok(scope)
    }

    /// Start a run for `client`.
    ///
    /// A no-op returning `false` when the protocol was already started;
    /// a finished protocol must be reset first.
    pub fn start(&self, client: &Client) -> Result<bool> {
        match self.state() {
            LifecycleState::NotStarted => {}
            LifecycleState::Finished => {
                tracing::warn!(
                    client = %client.name(),
                    "protocol already finished; reset the client before starting it again"
                );
                return Ok(false);
            }
            state => {
                tracing::debug!(client = %client.name(), state = %state, "protocol already started");
                return Ok(false);
            }
        }

        let scope = self.ensure_scope()?;
        let won = self.inner.state.send_if_modified(|s| {
            if *s == LifecycleState::NotStarted {
                *s = LifecycleState::Starting;
                true
            } else {
                false
            }
        });
        if !won {
            return Ok(false);
        }

        let stop = self.inner.stop.lock().clone();
        let handle = tokio::spawn(drive(self.inner.clone(), client.clone(), scope, stop));
        *self.inner.run.lock() = Some(handle);
        Ok(true)
    }

    /// Ask a running protocol to stop and wait for its teardown.
    ///
    /// Returns the run's outcome: its error if it failed, otherwise the
    /// first teardown error.  Stopping a protocol that never started is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        if !self.was_started() {
            return Ok(());
        }
        self.inner.stop.lock().cancel();
        self.join().await
    }

    /// Wait for the current run to finish and take its outcome.
    ///
    /// Only the first caller receives the outcome; later callers just wait
    /// for the terminal state.
    pub async fn join(&self) -> Result<()> {
        let handle = self.inner.run.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(NodeSdkError::Cancelled),
                Err(e) => Err(NodeSdkError::Fatal(format!("protocol run panicked: {e}"))),
            },
            None => {
                self.wait_finished().await;
                Ok(())
            }
        }
    }

    /// Resolves once the protocol reaches its terminal state.
    pub async fn wait_finished(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so this only ends on a terminal state.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    /// Back to `NotStarted`.  Only valid once finished.
    pub fn reset_state(&self) -> Result<()> {
        let state = self.state();
        if !state.is_terminal() {
            return Err(NodeSdkError::InvalidState(format!(
                "protocol is {state}, not finished"
            )));
        }
        *self.inner.stop.lock() = CancellationToken::new();
        self.inner.run.lock().take();
        self.inner.state.send_replace(LifecycleState::NotStarted);
        Ok(())
    }
}

impl fmt::Debug for ProtocolRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRunner")
            .field("protocol", &self.inner.protocol.name())
            .field("state", &self.state())
            .field("interceptors", &self.inner.interceptors.read().len())
            .finish()
    }
}

impl RunnerInner {
    fn set_state(&self, state: LifecycleState) {
        tracing::trace!(state = %state, "protocol state");
        self.state.send_replace(state);
    }

    /// Outermost first: runner-local interceptors, then the globals.
    fn chain(&self) -> Vec<Arc<dyn HookInterceptor>> {
        let local = self.interceptors.read().clone();
        global_interceptors().into_iter().chain(local).rev().collect()
    }

    async fn invoke(&self, hook: Hook, ctx: &mut ProtocolContext) -> Result<()> {
        let chain = self.chain();
        tracing::debug!(hook = %hook, client = %ctx.client.name(), interceptors = chain.len(), "running hook");
        Next::new(&chain, self.protocol.as_ref(), hook).run(ctx).await
    }
}

/// One protocol run, from `Starting` to `Finished`.
async fn drive(
    inner: Arc<RunnerInner>,
    client: Client,
    scope: Arc<TaskScope>,
    stop: CancellationToken,
) -> Result<()> {
    let mut ctx = ProtocolContext::new(client.clone(), scope.clone());

    tracing::info!(
        client = %client.name(),
        protocol = %inner.protocol.name(),
        "protocol started"
    );

    let result = {
        let startup = async {
            const STAGES: [(Hook, LifecycleState); 4] = [
                (Hook::OnStart, LifecycleState::Created),
                (Hook::OnCreate, LifecycleState::Registered),
                (Hook::OnRegistration, LifecycleState::Active),
                (Hook::OnConnect, LifecycleState::Connected),
            ];
            for (hook, reached) in STAGES {
                inner.invoke(hook, &mut ctx).await?;
                inner.set_state(reached);
            }
            stop.cancelled().await;
            Ok(())
        };
        tokio::select! {
            biased;
            _ = stop.cancelled() => Ok(()),
            r = startup => r,
        }
    };

    inner.set_state(LifecycleState::Stopping);
    let stop_result = inner.invoke(Hook::OnStop, &mut ctx).await;
    let close_result = scope.close().await;
    inner.set_state(LifecycleState::Finished);

    match result {
        Err(e) => {
            tracing::error!(client = %client.name(), error = %e, "protocol run failed");
            for teardown in [stop_result, close_result] {
                if let Err(t) = teardown {
                    tracing::warn!(client = %client.name(), error = %t, "teardown failed");
                }
            }
            Err(e)
        }
        Ok(()) => {
            tracing::info!(client = %client.name(), "protocol stopped");
            stop_result.and(close_result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{stub_client, StubProtocol};

    #[test]
    fn only_finished_is_terminal() {
        assert!(LifecycleState::Finished.is_terminal());
        assert!(!LifecycleState::Stopping.is_terminal());
        assert!(!LifecycleState::NotStarted.is_terminal());
        assert_eq!(LifecycleState::default(), LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn runner_walks_every_state_in_order() {
        let client = stub_client("runner-order");
        let runner = client.runner().clone();
        let mut states = runner.subscribe_state();

        let seen = tokio::spawn(async move {
            let mut seen = vec![*states.borrow_and_update()];
            while states.changed().await.is_ok() {
                let s = *states.borrow_and_update();
                seen.push(s);
                if s.is_terminal() {
                    break;
                }
            }
            seen
        });

        client.enter().await.unwrap();
        assert!(client.usable());
        client.exit().await.unwrap();
        assert!(runner.is_finished());

        let seen = seen.await.unwrap();
        // The watch channel may skip intermediate values but never reorders.
        let order = [
            LifecycleState::NotStarted,
            LifecycleState::Starting,
            LifecycleState::Created,
            LifecycleState::Registered,
            LifecycleState::Active,
            LifecycleState::Connected,
            LifecycleState::Stopping,
            LifecycleState::Finished,
        ];
        let positions: Vec<usize> = seen
            .iter()
            .map(|s| order.iter().position(|o| o == s).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&LifecycleState::Finished));
    }

    #[tokio::test]
    async fn start_twice_is_a_no_op() {
        let client = stub_client("runner-twice");
        let runner = client.runner().clone();
        assert!(runner.start(&client).unwrap());
        assert!(!runner.start(&client).unwrap());
        runner.stop().await.unwrap();
        assert!(!runner.start(&client).unwrap(), "finished runner must not restart");
    }

    #[tokio::test]
    async fn reset_state_requires_terminal_state() {
        let client = stub_client("runner-reset");
        let runner = client.runner().clone();
        assert!(matches!(runner.reset_state(), Err(NodeSdkError::InvalidState(_))));

        runner.start(&client).unwrap();
        runner.stop().await.unwrap();
        runner.reset_state().unwrap();
        assert_eq!(runner.state(), LifecycleState::NotStarted);
        assert!(!runner.was_started());
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let runner = ProtocolRunner::new(Arc::new(StubProtocol::default()));
        runner.stop().await.unwrap();
        assert_eq!(runner.state(), LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn dead_scope_is_rebuilt_on_start() {
        let client = stub_client("runner-dead-scope");
        let runner = client.runner().clone();
        let first = runner.ensure_scope().unwrap();
        first.kill_sentinel();
        for _ in 0..16 {
            if !first.is_alive() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!first.is_alive());

        client.enter().await.unwrap();
        let current = runner.scope().unwrap();
        assert!(!Arc::ptr_eq(&first, &current));
        assert!(current.is_alive());
        client.exit().await.unwrap();
    }
}
