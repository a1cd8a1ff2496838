//! Policies deciding which candidates are actively health checked.

use crate::endpoint::Endpoint;
use parking_lot::Mutex;
use std::collections::HashSet;
use thiserror::Error;

/// Chooses which candidates should have a running health checker.
///
/// Implementations must be deterministic: the same sequence of calls always
/// produces the same selections.
pub trait HealthCheckStrategy: Send + Sync {
    /// Replace the candidate pool. Calling it again with the same list is a no-op.
    fn update_candidates(&self, candidates: Vec<Endpoint>);

    /// Endpoints that should currently be checked, a subset of the latest candidates.
    fn selected_endpoints(&self) -> Vec<Endpoint>;

    /// Record a health score for an endpoint.
    ///
    /// Returns `true` if the selection changed and must be re-read.
    fn update_health(&self, endpoint: &Endpoint, health: f64) -> bool;
}

/// Checks every candidate.
#[derive(Debug, Default)]
pub struct AllHealthCheckStrategy {
    candidates: Mutex<Vec<Endpoint>>,
}

impl AllHealthCheckStrategy {
    /// Create a new strategy with no candidates.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HealthCheckStrategy for AllHealthCheckStrategy {
    fn update_candidates(&self, candidates: Vec<Endpoint>) {
        *self.candidates.lock() = candidates;
    }

    fn selected_endpoints(&self) -> Vec<Endpoint> {
        self.candidates.lock().clone()
    }

    fn update_health(&self, _endpoint: &Endpoint, _health: f64) -> bool {
        false
    }
}

/// Invalid limit for a [`PartialHealthCheckStrategy`].
#[derive(Debug, Error, PartialEq)]
pub enum EndpointLimitError {
    #[error("max endpoint count must be greater than 0")]
    ZeroCount,

    #[error("max endpoint ratio must be in (0, 1], got {0}")]
    InvalidRatio(f64),
}

/// How many candidates a [`PartialHealthCheckStrategy`] may select.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndpointLimit {
    /// At most this many endpoints.
    Count(usize),
    /// At most this fraction of the candidates, rounded up.
    Ratio(f64),
}

impl EndpointLimit {
    /// A fixed-count limit.
    pub fn count(count: usize) -> Result<Self, EndpointLimitError> {
        if count == 0 {
            return Err(EndpointLimitError::ZeroCount);
        }
        Ok(Self::Count(count))
    }

    /// A ratio limit.
    pub fn ratio(ratio: f64) -> Result<Self, EndpointLimitError> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(EndpointLimitError::InvalidRatio(ratio));
        }
        Ok(Self::Ratio(ratio))
    }

    /// Maximum number of selected endpoints for `candidates` candidates.
    pub fn max_for(self, candidates: usize) -> usize {
        match self {
            EndpointLimit::Count(count) => count.min(candidates),
            EndpointLimit::Ratio(ratio) => {
                let max = (candidates as f64 * ratio).ceil() as usize;
                max.min(candidates)
            }
        }
    }
}

/// Checks only a bounded subset of the candidates.
///
/// Candidates not known to be unhealthy are preferred, in candidate order.
/// When a selected endpoint reports unhealthy it is swapped for the next
/// eligible candidate; if there is none it stays selected so it keeps being
/// checked. Known-unhealthy candidates fill any remaining room, which rotates
/// checking through them when the whole pool is down.
#[derive(Debug)]
pub struct PartialHealthCheckStrategy {
    limit: EndpointLimit,
    state: Mutex<PartialState>,
}

#[derive(Debug, Default)]
struct PartialState {
    candidates: Vec<Endpoint>,
    selected: Vec<Endpoint>,
    unhealthy: HashSet<Endpoint>,
}

impl PartialHealthCheckStrategy {
    /// Create a strategy with the given limit.
    pub fn new(limit: EndpointLimit) -> Self {
        Self {
            limit,
            state: Mutex::new(PartialState::default()),
        }
    }
}

impl PartialState {
    /// Top up or trim the selection to `max` endpoints.
    fn fill(&mut self, max: usize) {
        self.selected.truncate(max);

        let mut eligible: Vec<Endpoint> = Vec::new();
        let mut fallback: Vec<Endpoint> = Vec::new();
        for candidate in &self.candidates {
            if self.selected.contains(candidate)
                || eligible.contains(candidate)
                || fallback.contains(candidate)
            {
                continue;
            }
            if self.unhealthy.contains(candidate) {
                fallback.push(candidate.clone());
            } else {
                eligible.push(candidate.clone());
            }
        }

        let room = max.saturating_sub(self.selected.len());
        self.selected
            .extend(eligible.into_iter().chain(fallback).take(room));
    }
}

impl HealthCheckStrategy for PartialHealthCheckStrategy {
    fn update_candidates(&self, candidates: Vec<Endpoint>) {
        let mut state = self.state.lock();
        state.selected.retain(|e| candidates.contains(e));
        state.unhealthy.retain(|e| candidates.contains(e));
        state.candidates = candidates;

        let max = self.limit.max_for(state.candidates.len());
        state.fill(max);
    }

    fn selected_endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().selected.clone()
    }

    fn update_health(&self, endpoint: &Endpoint, health: f64) -> bool {
        let mut state = self.state.lock();
        if health > 0.0 {
            state.unhealthy.remove(endpoint);
            return false;
        }

        // Unselected endpoints only send teardown reports, which say nothing
        // about their health
        let Some(pos) = state.selected.iter().position(|e| e == endpoint) else {
            return false;
        };
        state.unhealthy.insert(endpoint.clone());

        let before: HashSet<Endpoint> = state.selected.iter().cloned().collect();
        state.selected.remove(pos);
        let max = self.limit.max_for(state.candidates.len());
        state.fill(max);

        let after: HashSet<Endpoint> = state.selected.iter().cloned().collect();
        before != after
    }
}
