//! Pluggable health checkers.
//!
//! A [`HealthCheckerFactory`] is called once per checked endpoint with that
//! endpoint's [`HealthCheckerContext`]. The checker schedules its own probes
//! through the context and reports scores back to it. The returned
//! [`HealthChecker`] handle is closed when the endpoint stops being checked.

use crate::health::HealthCheckerContext;
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a health checker.
#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("failed to stop health checker: {0}")]
    Close(String),

    #[error("health check probe failed: {0}")]
    Probe(String),
}

/// Handle to a running health checker.
pub trait HealthChecker: Send + Sync {
    /// Stop the checker. The returned future resolves once it has stopped.
    fn close(&self) -> BoxFuture<'static, Result<(), CheckerError>>;
}

/// Creates a health checker for a newly checked endpoint.
pub trait HealthCheckerFactory: Send + Sync {
    /// Start checking the endpoint of `ctx`.
    fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn HealthChecker>;
}

impl<F> HealthCheckerFactory for F
where
    F: Fn(Arc<HealthCheckerContext>) -> Box<dyn HealthChecker> + Send + Sync,
{
    fn create(&self, ctx: Arc<HealthCheckerContext>) -> Box<dyn HealthChecker> {
        self(ctx)
    }
}

/// A checker handle with nothing to stop.
///
/// Useful for checkers that only schedule work on their context, since
/// destroying the context already cancels that work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHealthChecker;

impl HealthChecker for NoopHealthChecker {
    fn close(&self) -> BoxFuture<'static, Result<(), CheckerError>> {
        future::ready(Ok(())).boxed()
    }
}
