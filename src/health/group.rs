//! Health-checked endpoint group.
//!
//! Wraps a discovery source and publishes only the candidates whose health
//! checks currently pass. Each selected candidate gets its own
//! [`HealthCheckerContext`] and checker; the group reconciles those contexts
//! whenever the candidates or the strategy's selection change.

use crate::backoff::Backoff;
use crate::discovery::{DiscoveryError, DynamicEndpointGroup, EndpointGroup, EndpointListener};
use crate::endpoint::{Endpoint, SessionProtocol};
use crate::health::{
    AllHealthCheckStrategy, EndpointLimit, EndpointLimitError, HealthCheckStrategy,
    HealthCheckerContext, HealthCheckerFactory, HealthSnapshot, HealthState,
    PartialHealthCheckStrategy,
};
use arc_swap::ArcSwap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors that can occur while building a [`HealthCheckedEndpointGroup`].
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("health check port must be between 1 and 65535")]
    InvalidPort,

    #[error(transparent)]
    InvalidLimit(#[from] EndpointLimitError),

    #[error("max endpoint count and max endpoint ratio are mutually exclusive")]
    ConflictingLimits,

    #[error("a custom health check strategy cannot be combined with an endpoint limit")]
    ConflictingStrategy,

    #[error("no tokio runtime available; set one with `runtime()` or build inside a runtime")]
    NoRuntime,

    #[error("failed to load initial endpoints: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// An [`EndpointGroup`] that filters out unhealthy endpoints of another group.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use endpoint_health::discovery::DynamicEndpointGroup;
/// # use endpoint_health::health::{HealthCheckedEndpointGroup, Probe, ProbeCheckerFactory};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = tokio::runtime::Runtime::new()?;
/// let candidates = Arc::new(DynamicEndpointGroup::with_endpoints(vec!["10.0.0.1:8080".parse()?]));
/// let factory = ProbeCheckerFactory::new(Probe::http("/internal/l7check"), Duration::from_secs(5));
///
/// // Blocks until every candidate has been checked once.
/// let group = HealthCheckedEndpointGroup::builder(candidates, factory)
///     .retry_interval(Duration::from_secs(10))
///     .runtime(runtime.handle().clone())
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct HealthCheckedEndpointGroup {
    inner: Arc<GroupInner>,
}

pub(crate) struct GroupInner {
    delegate: Arc<dyn EndpointGroup>,
    protocol: SessionProtocol,
    port: Option<u16>,
    retry_backoff: Arc<dyn Backoff>,
    checker_factory: Arc<dyn HealthCheckerFactory>,
    pub(crate) strategy: Arc<dyn HealthCheckStrategy>,
    runtime: Handle,
    /// Handed to new contexts.
    this: Weak<GroupInner>,

    /// One context per selected endpoint.
    contexts: Mutex<HashMap<Endpoint, Arc<HealthCheckerContext>>>,
    /// Keys of `contexts` as of the last reconciliation, readable without the lock.
    checked: ArcSwap<Vec<Endpoint>>,
    /// Set while a reconciliation pass runs.
    refreshing: AtomicBool,
    /// Set by every trigger; the running pass repeats until it is clear.
    refresh_requested: AtomicBool,

    pub(crate) health: HealthState,
    /// Latest candidates from the delegate.
    candidates: ArcSwap<Vec<Endpoint>>,
    /// Healthy candidates, observable by consumers.
    published: DynamicEndpointGroup,
    /// Keeps publications in the order they were computed.
    publish_lock: Mutex<()>,

    /// Set once the readiness barrier was passed.
    started: AtomicBool,
    closing: AtomicBool,
    closed: watch::Sender<bool>,
}

impl HealthCheckedEndpointGroup {
    /// Start building a group over `delegate` using `checker_factory` for checks.
    pub fn builder(
        delegate: Arc<dyn EndpointGroup>,
        checker_factory: impl HealthCheckerFactory + 'static,
    ) -> HealthCheckedEndpointGroupBuilder {
        HealthCheckedEndpointGroupBuilder::new(delegate, Arc::new(checker_factory))
    }

    /// Current candidates, healthy or not.
    pub fn candidates(&self) -> Vec<Endpoint> {
        self.inner.candidates.load().to_vec()
    }

    /// Endpoints that currently have a running health checker.
    pub fn checked_endpoints(&self) -> Vec<Endpoint> {
        self.inner.checked.load().to_vec()
    }

    /// Whether the endpoint's latest report was positive.
    pub fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        self.inner.health.is_healthy(endpoint)
    }

    /// Snapshot of candidate and health counts plus per-candidate scores.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        let candidates = self.inner.candidates.load();
        self.inner.health.snapshot(&candidates)
    }

    /// Whether `close` has completed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl EndpointGroup for HealthCheckedEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.published.endpoints()
    }

    fn add_listener(&self, listener: EndpointListener) {
        self.inner.published.add_listener(listener);
    }

    /// Stop every health checker in parallel, then close the delegate.
    fn close(&self) -> BoxFuture<'static, ()> {
        Arc::clone(&self.inner).close().boxed()
    }
}

fn join_endpoints(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(Endpoint::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for HealthCheckedEndpointGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HealthCheckedEndpointGroup{{chosen=[{}], candidates=[{}]}}",
            join_endpoints(&self.endpoints()),
            join_endpoints(&self.candidates())
        )
    }
}

impl fmt::Debug for HealthCheckedEndpointGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl GroupInner {
    fn update_candidates(&self, candidates: Vec<Endpoint>) {
        debug!(candidates = candidates.len(), "candidates updated");
        self.candidates.store(Arc::new(candidates.clone()));
        self.health.retain_candidates(&candidates);
        self.strategy.update_candidates(candidates);
        self.refresh_contexts();

        // Before startup the readiness barrier owns the first publication
        if self.started.load(Ordering::Acquire) {
            self.republish();
        }
    }

    /// Reconcile contexts with the strategy's selection.
    ///
    /// At most one pass runs at a time. A trigger that arrives during a pass,
    /// including one made from inside it, makes that pass run once more.
    pub(crate) fn refresh_contexts(&self) {
        self.refresh_requested.store(true, Ordering::Release);
        loop {
            if self.closing.load(Ordering::Acquire) {
                return;
            }
            if self
                .refreshing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while self.refresh_requested.swap(false, Ordering::AcqRel) {
                if self.closing.load(Ordering::Acquire) {
                    break;
                }
                self.reconcile();
            }
            self.refreshing.store(false, Ordering::Release);

            // A trigger may have landed after the last swap but before the release
            if !self.refresh_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn reconcile(&self) {
        let mut contexts = self.contexts.lock();
        // `close` may have drained the map while this pass waited for the lock
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let selected = self.strategy.selected_endpoints();
        let selected_set: HashSet<&Endpoint> = selected.iter().collect();

        // Stop checkers whose endpoints are no longer selected
        let removed: Vec<Endpoint> = contexts
            .keys()
            .filter(|e| !selected_set.contains(e))
            .cloned()
            .collect();
        for endpoint in removed {
            if let Some(ctx) = contexts.remove(&endpoint) {
                debug!(endpoint = %endpoint, "stopping health checker");
                self.runtime.spawn(async move {
                    if let Err(e) = ctx.destroy().await {
                        warn!(endpoint = %endpoint, error = %e, "failed to stop a health checker");
                    }
                });
            }
        }

        // Start checkers for newly selected endpoints
        for endpoint in selected {
            if contexts.contains_key(&endpoint) {
                continue;
            }
            debug!(endpoint = %endpoint, "starting health checker");
            let ctx = HealthCheckerContext::new(
                endpoint.clone(),
                self.protocol,
                self.port,
                Arc::clone(&self.retry_backoff),
                self.runtime.clone(),
                self.this.clone(),
            );
            let checker = self.checker_factory.create(Arc::clone(&ctx));
            ctx.init(checker);
            contexts.insert(endpoint, ctx);
        }

        self.checked.store(Arc::new(contexts.keys().cloned().collect()));
    }

    pub(crate) fn is_candidate(&self, endpoint: &Endpoint) -> bool {
        self.candidates.load().contains(endpoint)
    }

    /// Publish `candidates ∩ healthy` in candidate order.
    pub(crate) fn republish(&self) {
        let _guard = self.publish_lock.lock();
        let candidates = self.candidates.load();
        let endpoints = self.health.filter_healthy(&candidates);
        let healthy = endpoints.len();
        if self.published.set_endpoints(endpoints) {
            debug!(
                healthy,
                candidates = candidates.len(),
                "published healthy endpoints"
            );
        }
    }

    fn finish_startup(&self) {
        self.started.store(true, Ordering::Release);
        // Publishes even when nothing turned healthy, so listeners learn the
        // initial check is over.
        self.republish();
        info!(
            candidates = self.candidates.load().len(),
            healthy = self.published.endpoints().len(),
            "health checked endpoint group ready"
        );
    }

    async fn close(self: Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            let mut closed = self.closed.subscribe();
            let _ = closed.wait_for(|closed| *closed).await;
            return;
        }

        let contexts: Vec<Arc<HealthCheckerContext>> = {
            let mut contexts = self.contexts.lock();
            self.checked.store(Arc::new(Vec::new()));
            contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        info!(checkers = contexts.len(), "closing health checked endpoint group");

        let stops = contexts.into_iter().map(|ctx| async move {
            let endpoint = ctx.original_endpoint().clone();
            if let Err(e) = ctx.destroy().await {
                warn!(endpoint = %endpoint, error = %e, "failed to stop a health checker");
            }
        });
        future::join_all(stops).await;

        self.delegate.close().await;
        self.published.close().await;
        self.closed.send_replace(true);
        info!("health checked endpoint group closed");
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if *self.closing.get_mut() {
            return;
        }
        let contexts = std::mem::take(self.contexts.get_mut());
        if contexts.is_empty() {
            return;
        }
        warn!(
            checkers = contexts.len(),
            "health checked endpoint group dropped without close, stopping checkers"
        );
        for (_, ctx) in contexts {
            self.runtime.spawn(async move {
                let _ = ctx.destroy().await;
            });
        }
    }
}

/// Builder for [`HealthCheckedEndpointGroup`].
pub struct HealthCheckedEndpointGroupBuilder {
    delegate: Arc<dyn EndpointGroup>,
    checker_factory: Arc<dyn HealthCheckerFactory>,
    protocol: SessionProtocol,
    port: Option<u16>,
    retry_backoff: Option<Arc<dyn Backoff>>,
    max_endpoint_count: Option<usize>,
    max_endpoint_ratio: Option<f64>,
    strategy: Option<Arc<dyn HealthCheckStrategy>>,
    runtime: Option<Handle>,
    listeners: Vec<EndpointListener>,
}

impl HealthCheckedEndpointGroupBuilder {
    fn new(delegate: Arc<dyn EndpointGroup>, checker_factory: Arc<dyn HealthCheckerFactory>) -> Self {
        Self {
            delegate,
            checker_factory,
            protocol: SessionProtocol::default(),
            port: None,
            retry_backoff: None,
            max_endpoint_count: None,
            max_endpoint_ratio: None,
            strategy: None,
            runtime: None,
            listeners: Vec::new(),
        }
    }

    /// Protocol used to derive the default health check port.
    pub fn protocol(mut self, protocol: SessionProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Probe this port instead of the endpoint's own port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Fixed interval between checks, with 20% jitter.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_backoff = Some(<dyn Backoff>::retry_interval(interval));
        self
    }

    /// Backoff used between checks.
    pub fn retry_backoff(mut self, backoff: Arc<dyn Backoff>) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Check at most this many candidates at once.
    pub fn max_endpoint_count(mut self, count: usize) -> Self {
        self.max_endpoint_count = Some(count);
        self
    }

    /// Check at most this fraction of the candidates at once.
    pub fn max_endpoint_ratio(mut self, ratio: f64) -> Self {
        self.max_endpoint_ratio = Some(ratio);
        self
    }

    /// Use a custom strategy for choosing the checked candidates.
    pub fn health_check_strategy(mut self, strategy: Arc<dyn HealthCheckStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Runtime that runs every checker task. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Listener registered before the first publication.
    pub fn listener(mut self, listener: EndpointListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the group, blocking the calling thread until every initial
    /// candidate has been checked once.
    ///
    /// Do not call this from a runtime thread that the checkers need; use
    /// [`build_async`](Self::build_async) there.
    pub fn build(self) -> Result<HealthCheckedEndpointGroup, GroupError> {
        let (group, barrier) = self.start()?;
        futures::executor::block_on(future::join_all(barrier));
        group.inner.finish_startup();
        Ok(group)
    }

    /// Build the group, waiting asynchronously until every initial candidate
    /// has been checked once.
    pub async fn build_async(self) -> Result<HealthCheckedEndpointGroup, GroupError> {
        let (group, barrier) = self.start()?;
        future::join_all(barrier).await;
        group.inner.finish_startup();
        Ok(group)
    }

    fn strategy(&mut self) -> Result<Arc<dyn HealthCheckStrategy>, GroupError> {
        let limit = match (self.max_endpoint_count, self.max_endpoint_ratio) {
            (Some(_), Some(_)) => return Err(GroupError::ConflictingLimits),
            (Some(count), None) => Some(EndpointLimit::count(count)?),
            (None, Some(ratio)) => Some(EndpointLimit::ratio(ratio)?),
            (None, None) => None,
        };

        match (self.strategy.take(), limit) {
            (Some(_), Some(_)) => Err(GroupError::ConflictingStrategy),
            (Some(strategy), None) => Ok(strategy),
            (None, Some(limit)) => Ok(Arc::new(PartialHealthCheckStrategy::new(limit))),
            (None, None) => Ok(Arc::new(AllHealthCheckStrategy::new())),
        }
    }

    /// Subscribe, load the initial candidates and collect the readiness barrier.
    fn start(mut self) -> Result<(HealthCheckedEndpointGroup, Vec<BoxFuture<'static, ()>>), GroupError> {
        if self.port == Some(0) {
            return Err(GroupError::InvalidPort);
        }
        let strategy = self.strategy()?;
        let runtime = match self.runtime.take() {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| GroupError::NoRuntime)?,
        };
        let retry_backoff = self
            .retry_backoff
            .take()
            .unwrap_or_else(<dyn Backoff>::default_health_check);

        let published = DynamicEndpointGroup::new();
        for listener in self.listeners.drain(..) {
            published.add_listener(listener);
        }

        let (closed, _) = watch::channel(false);
        let inner = Arc::new_cyclic(|this| GroupInner {
            delegate: self.delegate,
            protocol: self.protocol,
            port: self.port,
            retry_backoff,
            checker_factory: self.checker_factory,
            strategy,
            runtime,
            this: this.clone(),
            contexts: Mutex::new(HashMap::new()),
            checked: ArcSwap::from_pointee(Vec::new()),
            refreshing: AtomicBool::new(false),
            refresh_requested: AtomicBool::new(false),
            health: HealthState::new(),
            candidates: ArcSwap::from_pointee(Vec::new()),
            published,
            publish_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .delegate
            .add_listener(Arc::new(move |candidates: &[Endpoint]| {
                if let Some(inner) = weak.upgrade() {
                    inner.update_candidates(candidates.to_vec());
                }
            }));

        let initial = inner.delegate.initial_endpoints()?;
        info!(
            candidates = initial.len(),
            protocol = %inner.protocol,
            "starting health checked endpoint group"
        );
        inner.update_candidates(initial);

        // Contexts created or removed after this point are not waited for
        let barrier: Vec<BoxFuture<'static, ()>> = inner
            .contexts
            .lock()
            .values()
            .map(|ctx| ctx.initial_check())
            .collect();

        Ok((HealthCheckedEndpointGroup { inner }, barrier))
    }
}
