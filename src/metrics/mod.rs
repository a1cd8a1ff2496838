//! Metrics collection for health-checked groups.

mod collector;

pub use collector::{EndpointState, MetricsCollector};
