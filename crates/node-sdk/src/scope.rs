//! Structured task scope ("nursery").
//!
//! A [`TaskScope`] owns every background task a protocol run spawns and
//! every scoped resource it enters (e.g. the broker registration).  Closing
//! the scope cancels the tasks, runs the resource releases in reverse order
//! of acquisition and waits for everything to finish.
//!
//! A scope carries a sentinel task that lives as long as the scope is
//! usable.  When the sentinel is gone (scope closed, or the runtime that
//! hosted it shut down) the scope is dead and must be replaced through
//! [`TaskScope::rebuild`] before anything else is spawned on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{NodeSdkError, Result};

/// A resource with an async acquire/release pair whose release is deferred
/// to the closing of a [`TaskScope`].
#[async_trait::async_trait]
pub trait ScopedResource: Send + 'static {
    type Output: Send + 'static;

    /// Label used in logs.
    fn name(&self) -> &str {
        "resource"
    }

    async fn acquire(&mut self) -> Result<Self::Output>;

    async fn release(self: Box<Self>) -> Result<()>;
}

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct PendingRelease {
    label: String,
    release: ReleaseFn,
}

/// Container owning background tasks and scoped resources for one
/// protocol run.
pub struct TaskScope {
    name: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    releases: Mutex<Vec<PendingRelease>>,
    sentinel: JoinHandle<()>,
    closed: AtomicBool,
}

impl TaskScope {
    /// Create a scope on the current tokio runtime.
    ///
    /// Fails with [`NodeSdkError::DeadScope`] outside of a runtime, since
    /// the sentinel has nowhere to live.
    pub fn new(name: impl Into<String>) -> Result<Arc<Self>> {
        let name = name.into();
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| NodeSdkError::DeadScope(format!("{name} (no tokio runtime)")))?;

        let cancel = CancellationToken::new();
        let sentinel = {
            let token = cancel.clone();
            handle.spawn(async move { token.cancelled().await })
        };

        tracing::debug!(scope = %name, "task scope created");

        Ok(Arc::new(Self {
            name,
            cancel,
            tracker: TaskTracker::new(),
            releases: Mutex::new(Vec::new()),
            sentinel,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the sentinel task is still running.
    pub fn is_alive(&self) -> bool {
        !self.sentinel.is_finished()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tasks spawned on this scope that have not finished yet.
    pub fn task_count(&self) -> usize {
        self.tracker.len()
    }

    /// Scoped releases still waiting for the scope to close.
    pub fn pending_releases(&self) -> usize {
        self.releases.lock().len()
    }

    /// Token cancelled when the scope closes; child tokens follow it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() || !self.is_alive() {
            return Err(NodeSdkError::DeadScope(self.name.clone()));
        }
        Ok(())
    }

    /// Spawn `fut` under this scope.  The task is cancelled when the scope
    /// closes; awaiting its handle then yields [`NodeSdkError::Cancelled`].
    pub fn spawn<F>(&self, fut: F) -> ScopedTask<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.cancel.clone();
        let handle = self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                out = fut => Some(out),
            }
        });
        ScopedTask { handle }
    }

    /// Acquire `resource` now and defer its release to [`close`](Self::close).
    ///
    /// A failed acquire registers nothing.
    pub async fn enter_scoped<O>(&self, mut resource: Box<dyn ScopedResource<Output = O>>) -> Result<O>
    where
        O: Send + 'static,
    {
        self.ensure_usable()?;

        let label = resource.name().to_string();
        let output = resource.acquire().await?;

        tracing::debug!(scope = %self.name, resource = %label, "scoped resource acquired");
        self.releases.lock().push(PendingRelease {
            label,
            release: Box::new(move || resource.release()),
        });
        Ok(output)
    }

    /// Cancel all tasks, release scoped resources (last acquired first) and
    /// wait for the tasks to wind down.
    ///
    /// Cancellation errors are swallowed.  The first other release error is
    /// returned after every release has run; later ones are only logged.
    /// Calling `close` again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel.cancel();

        let releases = std::mem::take(&mut *self.releases.lock());
        let mut first_err: Option<NodeSdkError> = None;
        for pending in releases.into_iter().rev() {
            match (pending.release)().await {
                Ok(()) => {
                    tracing::debug!(scope = %self.name, resource = %pending.label, "released");
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tracing::warn!(
                        scope = %self.name,
                        resource = %pending.label,
                        error = %e,
                        "scoped release failed"
                    );
                    first_err.get_or_insert(e);
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;

        tracing::debug!(scope = %self.name, "task scope closed");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Build a fresh scope with the same name.
    ///
    /// Releases that never ran move to the new scope; in-flight tasks stay
    /// behind and are cancelled.
    pub fn rebuild(&self) -> Result<Arc<TaskScope>> {
        let fresh = TaskScope::new(self.name.clone())?;

        self.cancel.cancel();
        let carried = std::mem::take(&mut *self.releases.lock());
        if !carried.is_empty() {
            tracing::debug!(
                scope = %self.name,
                releases = carried.len(),
                "carrying pending releases into rebuilt scope"
            );
        }
        fresh.releases.lock().extend(carried);
        Ok(fresh)
    }

    #[cfg(test)]
    pub(crate) fn kill_sentinel(&self) {
        self.sentinel.abort();
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TaskScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScope")
            .field("name", &self.name)
            .field("alive", &self.is_alive())
            .field("closed", &self.is_closed())
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// Handle to a task spawned on a [`TaskScope`].
pub struct ScopedTask<T> {
    handle: JoinHandle<Option<T>>,
}

impl<T> ScopedTask<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl<T> Future for ScopedTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(NodeSdkError::Cancelled),
            Err(e) if e.is_cancelled() => Err(NodeSdkError::Cancelled),
            Err(e) => Err(NodeSdkError::Fatal(format!("scoped task panicked: {e}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle(scope: &TaskScope) {
        for _ in 0..16 {
            if !scope.is_alive() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    struct Recorded {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_release: Option<NodeSdkError>,
    }

    impl Recorded {
        fn boxed(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                label,
                log: log.clone(),
                fail_release: None,
            })
        }
    }

    #[async_trait::async_trait]
    impl ScopedResource for Recorded {
        type Output = &'static str;

        fn name(&self) -> &str {
            self.label
        }

        async fn acquire(&mut self) -> Result<&'static str> {
            self.log.lock().push(format!("acquire {}", self.label));
            Ok(self.label)
        }

        async fn release(self: Box<Self>) -> Result<()> {
            self.log.lock().push(format!("release {}", self.label));
            match self.fail_release {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn close_cancels_outstanding_tasks() {
        let scope = TaskScope::new("test").unwrap();
        let forever = scope.spawn(std::future::pending::<()>());
        let ticking = scope.spawn(async {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(scope.task_count(), 2);

        scope.close().await.unwrap();

        assert!(forever.await.unwrap_err().is_cancelled());
        assert!(ticking.await.unwrap_err().is_cancelled());
        assert_eq!(scope.task_count(), 0);
    }

    #[tokio::test]
    async fn finished_task_yields_its_value() {
        let scope = TaskScope::new("test").unwrap();
        let task = scope.spawn(async { 41 + 1 });
        assert_eq!(task.await.unwrap(), 42);
        scope.close().await.unwrap();
    }

    #[tokio::test]
    async fn releases_run_in_reverse_order() {
        let scope = TaskScope::new("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(scope.enter_scoped(Recorded::boxed("a", &log)).await.unwrap(), "a");
        assert_eq!(scope.enter_scoped(Recorded::boxed("b", &log)).await.unwrap(), "b");
        assert_eq!(scope.pending_releases(), 2);

        scope.close().await.unwrap();
        assert_eq!(
            *log.lock(),
            vec!["acquire a", "acquire b", "release b", "release a"]
        );
    }

    #[tokio::test]
    async fn release_errors_propagate_after_all_releases_ran() {
        let scope = TaskScope::new("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut failing = Recorded::boxed("a", &log);
        failing.fail_release = Some(NodeSdkError::Connection("gone".into()));
        scope.enter_scoped(failing).await.unwrap();

        let mut cancelled = Recorded::boxed("b", &log);
        cancelled.fail_release = Some(NodeSdkError::Cancelled);
        scope.enter_scoped(cancelled).await.unwrap();

        let err = scope.close().await.unwrap_err();
        assert!(matches!(err, NodeSdkError::Connection(_)));
        assert_eq!(log.lock().len(), 4);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_kills_sentinel() {
        let scope = TaskScope::new("test").unwrap();
        assert!(scope.is_alive());

        scope.close().await.unwrap();
        scope.close().await.unwrap();
        settle(&scope).await;

        assert!(scope.is_closed());
        assert!(!scope.is_alive());
    }

    #[tokio::test]
    async fn closed_scope_refuses_scoped_resources() {
        let scope = TaskScope::new("test").unwrap();
        scope.close().await.unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let err = scope
            .enter_scoped(Recorded::boxed("late", &log))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeSdkError::DeadScope(_)));
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn rebuild_carries_pending_releases_but_not_tasks() {
        let scope = TaskScope::new("test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        scope.enter_scoped(Recorded::boxed("reg", &log)).await.unwrap();
        let orphan = scope.spawn(std::future::pending::<()>());

        scope.kill_sentinel();
        settle(&scope).await;
        assert!(!scope.is_alive());

        let fresh = scope.rebuild().unwrap();
        assert!(fresh.is_alive());
        assert_eq!(fresh.name(), "test");
        assert_eq!(fresh.pending_releases(), 1);
        assert_eq!(fresh.task_count(), 0);
        assert!(orphan.await.unwrap_err().is_cancelled());

        fresh.close().await.unwrap();
        assert_eq!(*log.lock(), vec!["acquire reg", "release reg"]);
    }

    #[test]
    fn new_outside_runtime_is_dead_scope() {
        let err = TaskScope::new("nowhere").unwrap_err();
        assert!(matches!(err, NodeSdkError::DeadScope(_)));
    }
}
