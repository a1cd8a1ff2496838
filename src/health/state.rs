//! Health state management.
//!
//! Holds the healthy set and the last score reported for each endpoint.

use crate::endpoint::Endpoint;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;

/// Shared health state for all checked endpoints.
///
/// Membership changes are independent per endpoint, so the set only needs
/// atomic insert/remove rather than a lock over the whole state.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Endpoints whose most recent report was positive.
    healthy: DashSet<Endpoint>,
    /// Last score reported per endpoint.
    scores: DashMap<Endpoint, f64>,
}

/// Point-in-time health of a single candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointHealth {
    /// The candidate endpoint.
    pub endpoint: Endpoint,
    /// Last reported score, `None` if nothing was reported yet.
    pub score: Option<f64>,
    /// Whether the endpoint is in the healthy set.
    pub healthy: bool,
}

/// Point-in-time view of a health-checked group.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSnapshot {
    /// Number of candidates.
    pub candidates: usize,
    /// Number of healthy candidates.
    pub healthy: usize,
    /// Per-candidate health, in candidate order.
    pub endpoints: Vec<EndpointHealth>,
}

impl HealthState {
    /// Create an empty health state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a health score.
    ///
    /// A positive score marks the endpoint healthy, anything else unhealthy.
    /// Returns `true` only if set membership actually changed.
    pub fn update(&self, endpoint: &Endpoint, score: f64) -> bool {
        self.scores.insert(endpoint.clone(), score);

        let changed = if score > 0.0 {
            self.healthy.insert(endpoint.clone())
        } else {
            self.healthy.remove(endpoint).is_some()
        };

        if changed {
            if score > 0.0 {
                tracing::info!(endpoint = %endpoint, score, "endpoint marked healthy");
            } else {
                tracing::warn!(endpoint = %endpoint, score, "endpoint marked unhealthy");
            }
        }
        changed
    }

    /// Check if an endpoint is healthy.
    pub fn is_healthy(&self, endpoint: &Endpoint) -> bool {
        self.healthy.contains(endpoint)
    }

    /// Last score reported for an endpoint.
    pub fn score(&self, endpoint: &Endpoint) -> Option<f64> {
        self.scores.get(endpoint).map(|s| *s)
    }

    /// Forget an endpoint. Returns `true` if it was healthy.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        self.scores.remove(endpoint);
        self.healthy.remove(endpoint).is_some()
    }

    /// Forget every endpoint that is not one of `candidates`.
    pub fn retain_candidates(&self, candidates: &[Endpoint]) {
        let keep: HashSet<&Endpoint> = candidates.iter().collect();
        self.scores.retain(|e, _| keep.contains(e));
        self.healthy.retain(|e| keep.contains(e));
    }

    /// Get the healthy endpoints from a list, preserving its order.
    pub fn filter_healthy(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        endpoints
            .iter()
            .filter(|e| self.is_healthy(e))
            .cloned()
            .collect()
    }

    /// Build a snapshot for the given candidates.
    pub fn snapshot(&self, candidates: &[Endpoint]) -> HealthSnapshot {
        let endpoints: Vec<EndpointHealth> = candidates
            .iter()
            .map(|e| EndpointHealth {
                endpoint: e.clone(),
                score: self.score(e),
                healthy: self.is_healthy(e),
            })
            .collect();

        HealthSnapshot {
            candidates: candidates.len(),
            healthy: endpoints.iter().filter(|e| e.healthy).count(),
            endpoints,
        }
    }
}
