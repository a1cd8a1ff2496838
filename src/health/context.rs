//! Per-endpoint health checker context.
//!
//! Every checked endpoint gets one [`HealthCheckerContext`]. It is the only
//! surface a checker sees: the endpoint to probe, the retry delay, a scheduler
//! scoped to the endpoint's lifetime, and the sink for health scores.
//!
//! All work scheduled through a context is tracked in its task roster. The
//! roster lock also guards the destroyed flag, so once a context is destroyed
//! no new task can be registered and every tracked task has been cancelled.

use crate::backoff::Backoff;
use crate::endpoint::{Endpoint, SessionProtocol};
use crate::health::group::GroupInner;
use crate::health::{CheckerError, HealthChecker};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

/// Errors returned to a checker by its context.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContextError {
    #[error("health checker context for '{endpoint}' has been destroyed already")]
    Rejected { endpoint: Endpoint },

    #[error("retry backoff returned a negative delay for '{endpoint}': {delay_millis}ms")]
    NegativeDelay { endpoint: Endpoint, delay_millis: i64 },

    #[error("period must be greater than zero")]
    ZeroPeriod,
}

/// Scheduled work tracked by a context.
#[derive(Debug, Default)]
struct TaskRoster {
    next_id: u64,
    tasks: HashMap<u64, AbortHandle>,
    destroyed: bool,
}

/// A task scheduled through a [`HealthCheckerContext`].
///
/// Dropping it does not cancel the task.
#[derive(Debug)]
pub struct ScheduledTask {
    id: u64,
    abort: AbortHandle,
    roster: Weak<Mutex<TaskRoster>>,
}

impl ScheduledTask {
    /// Cancel the task. A running task stops at its next await point.
    pub fn cancel(&self) {
        self.abort.abort();
        if let Some(roster) = self.roster.upgrade() {
            roster.lock().tasks.remove(&self.id);
        }
    }

    /// Whether the task completed or was cancelled.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Health checking surface for a single endpoint.
pub struct HealthCheckerContext {
    /// Endpoint as supplied by discovery; key of the healthy set.
    original_endpoint: Endpoint,
    /// Endpoint the checker should probe.
    endpoint: Endpoint,
    protocol: SessionProtocol,
    retry_backoff: Arc<dyn Backoff>,
    /// Shared scheduling substrate.
    runtime: Handle,
    group: Weak<GroupInner>,
    /// Tracked tasks and the destroyed flag.
    roster: Arc<Mutex<TaskRoster>>,
    checker: OnceLock<Box<dyn HealthChecker>>,
    /// Flips to `true` on the first health report.
    initial_check: watch::Sender<bool>,
}

impl HealthCheckerContext {
    pub(crate) fn new(
        original_endpoint: Endpoint,
        protocol: SessionProtocol,
        port: Option<u16>,
        retry_backoff: Arc<dyn Backoff>,
        runtime: Handle,
        group: Weak<GroupInner>,
    ) -> Arc<Self> {
        let endpoint = original_endpoint.for_health_check(protocol, port);
        let (initial_check, _) = watch::channel(false);
        Arc::new(Self {
            original_endpoint,
            endpoint,
            protocol,
            retry_backoff,
            runtime,
            group,
            roster: Arc::new(Mutex::new(TaskRoster::default())),
            checker: OnceLock::new(),
            initial_check,
        })
    }

    /// Endpoint to probe. Its port follows the group's health check port rules.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Endpoint as reported by discovery.
    pub fn original_endpoint(&self) -> &Endpoint {
        &self.original_endpoint
    }

    /// Protocol of the health checked group.
    pub fn protocol(&self) -> SessionProtocol {
        self.protocol
    }

    /// Delay before the next probe.
    ///
    /// A negative delay from the backoff is a configuration error; the checker
    /// should stop rather than retry.
    pub fn next_delay(&self) -> Result<Duration, ContextError> {
        let delay_millis = self.retry_backoff.next_delay_millis(1);
        if delay_millis < 0 {
            error!(
                endpoint = %self.endpoint,
                delay_millis,
                "retry backoff returned a negative delay"
            );
            return Err(ContextError::NegativeDelay {
                endpoint: self.endpoint.clone(),
                delay_millis,
            });
        }
        Ok(Duration::from_millis(delay_millis as u64))
    }

    /// Run a task as soon as possible.
    pub fn execute<F>(&self, task: F) -> Result<ScheduledTask, ContextError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_tracked(task)
    }

    /// Run a task once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<ScheduledTask, ContextError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_tracked(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Run a task every `period`, starting after `initial_delay`.
    ///
    /// Runs never overlap; missed ticks are caught up.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial_delay: Duration,
        period: Duration,
        mut task: F,
    ) -> Result<ScheduledTask, ContextError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(ContextError::ZeroPeriod);
        }
        self.spawn_tracked(async move {
            let start = tokio::time::Instant::now() + initial_delay;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                task().await;
            }
        })
    }

    /// Run a task repeatedly with `delay` between the end of one run and the
    /// start of the next, starting after `initial_delay`.
    pub fn schedule_with_fixed_delay<F, Fut>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        mut task: F,
    ) -> Result<ScheduledTask, ContextError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_tracked(async move {
            tokio::time::sleep(initial_delay).await;
            loop {
                task().await;
                tokio::time::sleep(delay).await;
            }
        })
    }

    /// Report a health score. Positive means healthy.
    pub fn update_health(&self, health: f64) {
        self.report(health, false);
    }

    /// Whether this context has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.roster.lock().destroyed
    }

    /// Number of scheduled tasks that have not completed yet.
    pub fn pending_tasks(&self) -> usize {
        self.roster.lock().tasks.len()
    }

    /// Whether at least one health report arrived.
    pub fn has_reported(&self) -> bool {
        *self.initial_check.borrow()
    }

    pub(crate) fn init(&self, checker: Box<dyn HealthChecker>) {
        if self.checker.set(checker).is_err() {
            warn!(endpoint = %self.endpoint, "health checker context initialized twice");
        }
    }

    /// Resolves on the first health report.
    pub(crate) fn initial_check(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.initial_check.subscribe();
        async move {
            // The sender lives as long as the context; an error means it is gone
            let _ = rx.wait_for(|reported| *reported).await;
        }
        .boxed()
    }

    /// Stop the checker, cancel tracked tasks and report the endpoint unhealthy.
    ///
    /// Safe to call more than once; only the first call cancels and reports.
    /// A failure to close the checker is returned after teardown completed.
    pub(crate) async fn destroy(self: Arc<Self>) -> Result<(), CheckerError> {
        let closed = match self.checker.get() {
            Some(checker) => checker.close().await,
            None => Ok(()),
        };

        {
            let mut roster = self.roster.lock();
            if roster.destroyed {
                return closed;
            }
            roster.destroyed = true;

            // Cancelling never re-enters the roster; tasks only remove
            // themselves after running to completion.
            let tasks = std::mem::take(&mut roster.tasks);
            debug!(
                endpoint = %self.endpoint,
                tasks = tasks.len(),
                "cancelling health check tasks"
            );
            for task in tasks.into_values() {
                task.abort();
            }
        }

        self.report(0.0, true);
        closed
    }

    fn report(&self, health: f64, even_if_destroyed: bool) {
        let group = self.group.upgrade();

        let updated = {
            let roster = self.roster.lock();
            if !even_if_destroyed && roster.destroyed {
                debug!(endpoint = %self.original_endpoint, health, "ignoring report from destroyed context");
                false
            } else {
                group.as_ref().is_some_and(|g| {
                    // Teardown of an endpoint that left discovery forgets it
                    if even_if_destroyed && !g.is_candidate(&self.original_endpoint) {
                        g.health.remove(&self.original_endpoint)
                    } else {
                        g.health.update(&self.original_endpoint, health)
                    }
                })
            }
        };

        if let Some(group) = group {
            if updated {
                group.republish();
            }
            if group.strategy.update_health(&self.original_endpoint, health) {
                group.refresh_contexts();
            }
        }

        self.initial_check.send_replace(true);
    }

    fn spawn_tracked<F>(&self, task: F) -> Result<ScheduledTask, ContextError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut roster = self.roster.lock();
        if roster.destroyed {
            debug!(endpoint = %self.endpoint, "rejecting task for destroyed context");
            return Err(ContextError::Rejected {
                endpoint: self.endpoint.clone(),
            });
        }

        let id = roster.next_id;
        roster.next_id += 1;

        // The task deregisters itself only after it ran to completion. It
        // blocks on the roster lock until the registration below is done.
        let weak = Arc::downgrade(&self.roster);
        let handle = self.runtime.spawn(async move {
            task.await;
            if let Some(roster) = weak.upgrade() {
                roster.lock().tasks.remove(&id);
            }
        });

        let abort = handle.abort_handle();
        roster.tasks.insert(id, abort.clone());

        Ok(ScheduledTask {
            id,
            abort,
            roster: Arc::downgrade(&self.roster),
        })
    }
}

impl std::fmt::Debug for HealthCheckerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheckerContext")
            .field("original_endpoint", &self.original_endpoint)
            .field("endpoint", &self.endpoint)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NoopHealthChecker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detached_context(endpoint: Endpoint, backoff: Arc<dyn Backoff>) -> Arc<HealthCheckerContext> {
        let ctx = HealthCheckerContext::new(
            endpoint,
            SessionProtocol::Http,
            None,
            backoff,
            Handle::current(),
            Weak::new(),
        );
        ctx.init(Box::new(NoopHealthChecker));
        ctx
    }

    fn context() -> Arc<HealthCheckerContext> {
        detached_context(Endpoint::of("127.0.0.1", 8080), <dyn Backoff>::fixed(10))
    }

    #[tokio::test]
    async fn test_endpoint_derivation() {
        let ctx = detached_context(Endpoint::of("example.com", 80), <dyn Backoff>::fixed(10));
        assert_eq!(ctx.endpoint(), &Endpoint::new("example.com"));
        assert_eq!(ctx.original_endpoint(), &Endpoint::of("example.com", 80));
    }

    #[tokio::test]
    async fn test_next_delay() {
        let ctx = context();
        assert_eq!(ctx.next_delay().unwrap(), Duration::from_millis(10));

        let broken = detached_context(Endpoint::of("127.0.0.1", 8080), <dyn Backoff>::fixed(-1));
        assert!(matches!(
            broken.next_delay(),
            Err(ContextError::NegativeDelay { delay_millis: -1, .. })
        ));
    }

    #[tokio::test]
    async fn test_completed_tasks_leave_roster() {
        let ctx = context();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let task = ctx
            .execute(async move {
                let _ = tx.send(());
            })
            .unwrap();
        rx.await.unwrap();

        for _ in 0..100 {
            if ctx.pending_tasks() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctx.pending_tasks(), 0);
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_cancel_removes_from_roster() {
        let ctx = context();
        let task = ctx
            .schedule(Duration::from_secs(3600), async {})
            .unwrap();
        assert_eq!(ctx.pending_tasks(), 1);

        task.cancel();
        assert_eq!(ctx.pending_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_runs_repeatedly() {
        let ctx = context();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        ctx.schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.pending_tasks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_runs_repeatedly() {
        let ctx = context();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        ctx.schedule_with_fixed_delay(
            Duration::from_millis(50),
            Duration::from_millis(100),
            move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(275)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let ctx = context();
        let result = ctx.schedule_at_fixed_rate(Duration::ZERO, Duration::ZERO, || async {});
        assert_eq!(result.unwrap_err(), ContextError::ZeroPeriod);
    }

    #[tokio::test]
    async fn test_destroy_cancels_and_rejects() {
        let ctx = context();
        let task = ctx
            .schedule(Duration::from_secs(3600), async {})
            .unwrap();
        let periodic = ctx
            .schedule_with_fixed_delay(Duration::ZERO, Duration::from_secs(1), || async {})
            .unwrap();
        assert_eq!(ctx.pending_tasks(), 2);
        assert!(!ctx.has_reported());

        Arc::clone(&ctx).destroy().await.unwrap();

        assert!(ctx.is_destroyed());
        assert_eq!(ctx.pending_tasks(), 0);
        // The forced final report releases anyone waiting on the first report
        assert!(ctx.has_reported());

        tokio::task::yield_now().await;
        for _ in 0..100 {
            if task.is_finished() && periodic.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(task.is_finished());
        assert!(periodic.is_finished());

        let rejected = ctx.execute(async {});
        assert!(matches!(rejected, Err(ContextError::Rejected { .. })));
        assert_eq!(ctx.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_initial_check_resolves_on_first_report() {
        let ctx = context();
        let waiter = tokio::spawn(ctx.initial_check());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        ctx.update_health(0.0);
        waiter.await.unwrap();
        assert!(ctx.has_reported());

        // Already resolved
        ctx.initial_check().await;
    }
}
