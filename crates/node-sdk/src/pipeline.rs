//! Hook pipeline: interceptors wrapped around every lifecycle hook.
//!
//! A [`ProtocolRunner`](crate::lifecycle::ProtocolRunner) never calls a hook
//! directly.  It builds a chain of [`HookInterceptor`]s (global ones first,
//! then the runner's own) and invokes the hook through it.  The interceptor
//! registered last is the outermost one:
//!
//! ```text
//!  register(A); register(B)
//!
//!  runner ─► B.intercept ─► A.intercept ─► protocol.on_xxx(ctx)
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::Instrument;

use crate::context::ProtocolContext;
use crate::error::Result;
use crate::lifecycle::ClientProtocol;
use crate::retry::RetryBackoff;

/// The five lifecycle hooks, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    OnStart,
    OnCreate,
    OnRegistration,
    OnConnect,
    OnStop,
}

impl Hook {
    pub const ORDER: [Hook; 5] = [
        Hook::OnStart,
        Hook::OnCreate,
        Hook::OnRegistration,
        Hook::OnConnect,
        Hook::OnStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::OnStart => "on_start",
            Hook::OnCreate => "on_create",
            Hook::OnRegistration => "on_registration",
            Hook::OnConnect => "on_connect",
            Hook::OnStop => "on_stop",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wraps hook invocations.  Call `next.run(ctx)` to continue down the
/// chain; not calling it skips the hook.
#[async_trait::async_trait]
pub trait HookInterceptor: Send + Sync + 'static {
    async fn intercept(&self, hook: Hook, ctx: &mut ProtocolContext, next: Next<'_>) -> Result<()>;
}

/// Remainder of the interceptor chain plus the hook at its end.
///
/// `Copy`, so an interceptor may run the rest of the chain more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn HookInterceptor>],
    protocol: &'a dyn ClientProtocol,
    hook: Hook,
}

impl<'a> Next<'a> {
    pub(crate) fn new(
        chain: &'a [Arc<dyn HookInterceptor>],
        protocol: &'a dyn ClientProtocol,
        hook: Hook,
    ) -> Self {
        Self {
            chain,
            protocol,
            hook,
        }
    }

    pub fn hook(&self) -> Hook {
        self.hook
    }

    pub fn run<'c>(self, ctx: &'c mut ProtocolContext) -> BoxFuture<'c, Result<()>>
    where
        'a: 'c,
    {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((outer, rest)) => {
                    let next = Next {
                        chain: rest,
                        ..self
                    };
                    outer.intercept(self.hook, ctx, next).await
                }
                None => dispatch(self.protocol, self.hook, ctx).await,
            }
        })
    }
}

async fn dispatch(protocol: &dyn ClientProtocol, hook: Hook, ctx: &mut ProtocolContext) -> Result<()> {
    match hook {
        Hook::OnStart => protocol.on_start(ctx).await,
        Hook::OnCreate => protocol.on_create(ctx).await,
        Hook::OnRegistration => protocol.on_registration(ctx).await,
        Hook::OnConnect => protocol.on_connect(ctx).await,
        Hook::OnStop => protocol.on_stop(ctx).await,
    }
}

// ── Global interceptors ──────────────────────────────────────────────

fn globals() -> &'static RwLock<Vec<Arc<dyn HookInterceptor>>> {
    static GLOBALS: OnceLock<RwLock<Vec<Arc<dyn HookInterceptor>>>> = OnceLock::new();
    GLOBALS.get_or_init(|| RwLock::new(Vec::new()))
}

/// Attach `interceptor` to every protocol runner, existing ones included.
/// It wraps each hook dispatched from now on, inside the runner's own
/// interceptors.
pub fn register_global_interceptor(interceptor: impl HookInterceptor) {
    globals().write().push(Arc::new(interceptor));
}

/// Snapshot of the global interceptors in registration order.
pub(crate) fn global_interceptors() -> Vec<Arc<dyn HookInterceptor>> {
    globals().read().clone()
}

// ── Built-in interceptors ────────────────────────────────────────────

/// Runs every hook inside a `hook` span and logs its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterceptor;

#[async_trait::async_trait]
impl HookInterceptor for TracingInterceptor {
    async fn intercept(&self, hook: Hook, ctx: &mut ProtocolContext, next: Next<'_>) -> Result<()> {
        let span = tracing::info_span!("hook", hook = %hook, client = %ctx.client.name());
        let started = Instant::now();
        let result = next.run(ctx).instrument(span).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => tracing::debug!(hook = %hook, elapsed_ms, "hook completed"),
            Err(e) => tracing::warn!(hook = %hook, elapsed_ms, error = %e, "hook failed"),
        }
        result
    }
}

/// Retries failing hooks with a [`RetryBackoff`].  Permanent errors
/// (fatal, invalid state, cancellation, ...) are never retried.
#[derive(Debug, Clone, Default)]
pub struct RetryInterceptor {
    backoff: RetryBackoff,
    hooks: Option<Vec<Hook>>,
}

impl RetryInterceptor {
    pub fn new(backoff: RetryBackoff) -> Self {
        Self {
            backoff,
            hooks: None,
        }
    }

    /// Only retry the given hooks; others pass straight through.
    pub fn only(mut self, hooks: impl Into<Vec<Hook>>) -> Self {
        self.hooks = Some(hooks.into());
        self
    }

    fn applies_to(&self, hook: Hook) -> bool {
        self.hooks.as_ref().map_or(true, |h| h.contains(&hook))
    }
}

#[async_trait::async_trait]
impl HookInterceptor for RetryInterceptor {
    async fn intercept(&self, hook: Hook, ctx: &mut ProtocolContext, next: Next<'_>) -> Result<()> {
        if !self.applies_to(hook) {
            return next.run(ctx).await;
        }

        let mut failures: u32 = 0;
        loop {
            let err = match next.run(&mut *ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            failures += 1;
            let Some(delay) = self.backoff.retry_delay(failures, &err) else {
                return Err(err);
            };
            tracing::warn!(
                hook = %hook,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying hook"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeSdkError;
    use crate::scope::TaskScope;
    use crate::testing::{stub_client, StubProtocol};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Label {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl HookInterceptor for Label {
        async fn intercept(&self, hook: Hook, ctx: &mut ProtocolContext, next: Next<'_>) -> Result<()> {
            self.log.lock().push(format!("{}>{hook}", self.name));
            let r = next.run(ctx).await;
            self.log.lock().push(format!("{}<{hook}", self.name));
            r
        }
    }

    /// Fails the first `n` times, then lets the hook run.
    struct FailFirst {
        remaining: AtomicU32,
        calls: AtomicU32,
        error: fn() -> NodeSdkError,
    }

    #[async_trait::async_trait]
    impl HookInterceptor for FailFirst {
        async fn intercept(&self, _hook: Hook, ctx: &mut ProtocolContext, next: Next<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.remaining.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining.store(left - 1, Ordering::SeqCst);
                return Err((self.error)());
            }
            next.run(ctx).await
        }
    }

    async fn context(name: &str) -> ProtocolContext {
        ProtocolContext::new(stub_client(name), TaskScope::new(name).unwrap())
    }

    #[tokio::test]
    async fn last_registered_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        // Chain order = reverse registration order.
        let chain: Vec<Arc<dyn HookInterceptor>> = vec![
            Arc::new(Label { name: "B", log: log.clone() }),
            Arc::new(Label { name: "A", log: log.clone() }),
        ];
        let protocol = StubProtocol::default();
        let mut ctx = context("pipeline-order").await;

        Next::new(&chain, &protocol, Hook::OnStop)
            .run(&mut ctx)
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["B>on_stop", "A>on_stop", "A<on_stop", "B<on_stop"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_interceptor_reruns_inner_chain() {
        let flaky = Arc::new(FailFirst {
            remaining: AtomicU32::new(2),
            calls: AtomicU32::new(0),
            error: || NodeSdkError::Connection("refused".into()),
        });
        let chain: Vec<Arc<dyn HookInterceptor>> = vec![
            Arc::new(RetryInterceptor::new(RetryBackoff {
                initial_delay: Duration::from_millis(10),
                max_attempts: 5,
                ..Default::default()
            })),
            flaky.clone(),
        ];
        let protocol = StubProtocol::default();
        let mut ctx = context("pipeline-retry").await;

        Next::new(&chain, &protocol, Hook::OnStop)
            .run(&mut ctx)
            .await
            .unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_interceptor_passes_fatal_through() {
        let fatal = Arc::new(FailFirst {
            remaining: AtomicU32::new(1),
            calls: AtomicU32::new(0),
            error: || NodeSdkError::Fatal("deadline".into()),
        });
        let chain: Vec<Arc<dyn HookInterceptor>> =
            vec![Arc::new(RetryInterceptor::default()), fatal.clone()];
        let protocol = StubProtocol::default();
        let mut ctx = context("pipeline-fatal").await;

        let err = Next::new(&chain, &protocol, Hook::OnStop)
            .run(&mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeSdkError::Fatal(_)));
        assert_eq!(fatal.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_can_be_limited_to_some_hooks() {
        let flaky = Arc::new(FailFirst {
            remaining: AtomicU32::new(1),
            calls: AtomicU32::new(0),
            error: || NodeSdkError::Connection("refused".into()),
        });
        let chain: Vec<Arc<dyn HookInterceptor>> = vec![
            Arc::new(RetryInterceptor::default().only([Hook::OnCreate])),
            flaky.clone(),
        ];
        let protocol = StubProtocol::default();
        let mut ctx = context("pipeline-only").await;

        assert!(Next::new(&chain, &protocol, Hook::OnStop)
            .run(&mut ctx)
            .await
            .is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_order_and_names() {
        let names: Vec<&str> = Hook::ORDER.iter().map(Hook::as_str).collect();
        assert_eq!(
            names,
            vec!["on_start", "on_create", "on_registration", "on_connect", "on_stop"]
        );
    }
}
