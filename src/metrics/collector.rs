//! Metrics collector using prometheus-client.
//!
//! Exposes candidate and healthy counts per group plus the health of every
//! candidate, updated from [`HealthSnapshot`]s.

use crate::health::HealthSnapshot;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Labels for per-group endpoint counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GroupLabels {
    pub group: String,
    pub state: EndpointState,
}

/// Which endpoints a count refers to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum EndpointState {
    Candidate,
    Healthy,
}

/// Labels for per-endpoint health.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub group: String,
    pub authority: String,
}

/// Labels for per-group counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PublicationLabels {
    pub group: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Candidate and healthy endpoint counts.
    endpoint_count: Family<GroupLabels, Gauge>,
    /// Endpoint health gauge (1 = healthy, 0 = unhealthy).
    endpoint_healthy: Family<EndpointLabels, Gauge>,
    /// Published list changes.
    publications_total: Family<PublicationLabels, Counter>,
    /// Authorities recorded per group, for dropping removed candidates.
    recorded: Mutex<HashMap<String, HashSet<String>>>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let endpoint_count = Family::<GroupLabels, Gauge>::default();
        let endpoint_healthy = Family::<EndpointLabels, Gauge>::default();
        let publications_total = Family::<PublicationLabels, Counter>::default();

        registry.register(
            "endpoint_group_count",
            "Number of endpoints in a group by state",
            endpoint_count.clone(),
        );
        registry.register(
            "endpoint_group_healthy",
            "Endpoint health status (1=healthy, 0=unhealthy)",
            endpoint_healthy.clone(),
        );
        registry.register(
            "endpoint_group_publications",
            "Number of times the healthy endpoint list changed",
            publications_total.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                endpoint_count,
                endpoint_healthy,
                publications_total,
                recorded: Mutex::new(HashMap::new()),
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Update the gauges of `group` from a snapshot.
    ///
    /// Endpoints that are no longer candidates are removed.
    pub fn record_snapshot(&self, group: &str, snapshot: &HealthSnapshot) {
        self.set_count(group, EndpointState::Candidate, snapshot.candidates);
        self.set_count(group, EndpointState::Healthy, snapshot.healthy);

        let current: HashSet<String> = snapshot
            .endpoints
            .iter()
            .map(|e| e.endpoint.authority())
            .collect();

        for endpoint in &snapshot.endpoints {
            let labels = EndpointLabels {
                group: group.to_string(),
                authority: endpoint.endpoint.authority(),
            };
            self.inner
                .endpoint_healthy
                .get_or_create(&labels)
                .set(if endpoint.healthy { 1 } else { 0 });
        }

        let mut recorded = self.inner.recorded.lock();
        if let Some(previous) = recorded.get(group) {
            for authority in previous.difference(&current) {
                self.inner.endpoint_healthy.remove(&EndpointLabels {
                    group: group.to_string(),
                    authority: authority.clone(),
                });
            }
        }
        recorded.insert(group.to_string(), current);
    }

    /// Count a change of the published list.
    pub fn record_publication(&self, group: &str) {
        let labels = PublicationLabels {
            group: group.to_string(),
        };
        self.inner.publications_total.get_or_create(&labels).inc();
    }

    /// Render all metrics in the text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.inner.registry)?;
        Ok(buffer)
    }

    fn set_count(&self, group: &str, state: EndpointState, count: usize) {
        let labels = GroupLabels {
            group: group.to_string(),
            state,
        };
        self.inner
            .endpoint_count
            .get_or_create(&labels)
            .set(count as i64);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
