//! endpoint-health - health-checked endpoint groups for client-side load balancing
//!
//! This crate keeps a list of healthy endpoints on top of a discovery source:
//! - One independent health checker per monitored candidate
//! - A published list of healthy candidates, observable through listeners
//! - An initial readiness barrier and parallel, clean shutdown
//! - Pluggable checkers, backoff and check-selection strategies
//! - Static or file-watched discovery, Prometheus metrics and YAML configuration

pub mod backoff;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod health;
pub mod metrics;
pub mod util;

pub use config::Config;
pub use discovery::{DynamicEndpointGroup, EndpointGroup};
pub use endpoint::{Endpoint, SessionProtocol};
pub use health::{HealthCheckedEndpointGroup, HealthCheckerContext};
