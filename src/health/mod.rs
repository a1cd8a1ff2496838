//! Health checking for discovered endpoints.

mod checker;
mod context;
mod group;
mod probe;
mod state;
mod strategy;

pub use checker::{CheckerError, HealthChecker, HealthCheckerFactory, NoopHealthChecker};
pub use context::{ContextError, HealthCheckerContext, ScheduledTask};
pub use group::{GroupError, HealthCheckedEndpointGroup, HealthCheckedEndpointGroupBuilder};
pub use probe::{DEFAULT_PROBE_TIMEOUT, Probe, ProbeCheckerFactory};
pub use state::{EndpointHealth, HealthSnapshot, HealthState};
pub use strategy::{
    AllHealthCheckStrategy, EndpointLimit, EndpointLimitError, HealthCheckStrategy,
    PartialHealthCheckStrategy,
};
