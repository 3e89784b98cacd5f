//! Builder matching engine and process-local locks.
//!
//! Candidate computation is pure: for the same registry and lock snapshot
//! it returns the same ordering, so tests can assert exact candidate lists.
//! It never acquires anything; acquisition happens only once a request has
//! actually been claimed.

use overseer_core::{Builder, LockClaim, MasterId, WorkerId};
use std::collections::HashMap;

use crate::registry::WorkerRegistry;

/// Named counting locks, local to one master process.
///
/// Each lock has a capacity (1 unless configured otherwise); a claim takes
/// `count` units for the duration of a build. Cluster-wide locks need the
/// same compare-and-set discipline as request claims and would sit behind
/// this same interface, backed by the store.
#[derive(Default)]
pub struct LockSet {
    capacities: HashMap<String, u32>,
    held: HashMap<String, u32>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of a counting lock. Unconfigured locks default to
    /// capacity 1 (exclusive).
    pub fn set_capacity(&mut self, lock: impl Into<String>, capacity: u32) {
        self.capacities.insert(lock.into(), capacity);
    }

    fn capacity(&self, lock: &str) -> u32 {
        self.capacities.get(lock).copied().unwrap_or(1)
    }

    /// Speculative check only; holds nothing.
    pub fn available(&self, claim: &LockClaim) -> bool {
        let held = self.held.get(&claim.lock).copied().unwrap_or(0);
        held + claim.count <= self.capacity(&claim.lock)
    }

    /// Take all claims or none.
    pub fn acquire(&mut self, claims: &[LockClaim]) -> bool {
        if !claims.iter().all(|c| self.available(c)) {
            return false;
        }
        for c in claims {
            *self.held.entry(c.lock.clone()).or_insert(0) += c.count;
        }
        true
    }

    pub fn release(&mut self, claims: &[LockClaim]) {
        for c in claims {
            if let Some(held) = self.held.get_mut(&c.lock) {
                *held = held.saturating_sub(c.count);
            }
        }
    }
}

/// Computes eligible workers for a builder.
#[derive(Debug, Clone, Copy)]
pub struct MatchingEngine {
    master: MasterId,
}

impl MatchingEngine {
    pub fn new(master: MasterId) -> Self {
        Self { master }
    }

    /// Workers eligible right now to run a request for `builder`:
    /// connected, below max_builds, capability and configured_on match,
    /// and every lock the builder declares is presently available.
    /// Ordered by fewest running builds first, then worker name, to
    /// spread load deterministically.
    pub fn candidates_for(
        &self,
        builder: &Builder,
        registry: &WorkerRegistry,
        locks: &LockSet,
    ) -> Vec<WorkerId> {
        if !builder.locks.iter().all(|c| locks.available(c)) {
            return Vec::new();
        }

        let mut candidates: Vec<WorkerId> = registry
            .for_builder(builder, self.master)
            .into_iter()
            .filter(|w| registry.is_available(*w))
            .collect();

        candidates.sort_by(|a, b| {
            registry
                .running_count(*a)
                .cmp(&registry.running_count(*b))
                .then_with(|| registry.worker_name(*a).cmp(&registry.worker_name(*b)))
                .then(a.cmp(b))
        });
        candidates
    }
}
