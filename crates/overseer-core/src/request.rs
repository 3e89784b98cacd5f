//! Build request, builder and result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{BuildsetId, MasterId, RequestId, WorkerId};

/// One logical request to run a builder.
///
/// Created unclaimed by a scheduler, claimed exactly once by one master,
/// completed exactly once by the build-execution path. A completed request
/// is terminal and never reclaimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: RequestId,
    /// Name of the builder this request is for.
    pub builder: String,
    /// Group of requests triggered together (one per builder per change).
    pub buildset_id: BuildsetId,
    /// Higher runs first. FIFO by submitted_at within a priority tier.
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by_master: Option<MasterId>,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Option<BuildResult>,
}

impl BuildRequest {
    pub fn is_claimed(&self) -> bool {
        self.claimed_at.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.complete_at.is_some()
    }

    /// The claim columns must be set and cleared together. A row where one
    /// is set without the other is corrupt and must not be dispatched.
    pub fn claim_columns_consistent(&self) -> bool {
        self.claimed_at.is_some() == self.claimed_by_master.is_some()
    }
}

/// Final outcome of a build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Success,
    Failure,
    Cancelled,
    /// Dispatch failed repeatedly; no worker could take the request.
    WorkerUnavailable,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Success => "success",
            BuildResult::Failure => "failure",
            BuildResult::Cancelled => "cancelled",
            BuildResult::WorkerUnavailable => "worker_unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(BuildResult::Success),
            "failure" => Some(BuildResult::Failure),
            "cancelled" => Some(BuildResult::Cancelled),
            "worker_unavailable" => Some(BuildResult::WorkerUnavailable),
            _ => None,
        }
    }
}

/// A named exclusivity resource a builder depends on.
///
/// `count` is the number of units the builder consumes out of the lock's
/// capacity; a plain mutex-style lock has capacity 1 and count 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockClaim {
    pub lock: String,
    pub count: u32,
}

impl LockClaim {
    pub fn exclusive(lock: impl Into<String>) -> Self {
        Self {
            lock: lock.into(),
            count: 1,
        }
    }
}

/// A named job type and the workers allowed to run it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    pub name: String,
    /// Locks that must be held for the whole build.
    pub locks: Vec<LockClaim>,
    /// (master, worker) pairs declaring which workers, on which masters,
    /// may run this builder. A master never dispatches outside its own
    /// pairs.
    pub configured_on: HashSet<(MasterId, WorkerId)>,
}

impl Builder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locks: Vec::new(),
            configured_on: HashSet::new(),
        }
    }

    /// Workers this builder is configured on for the given master.
    pub fn workers_for_master(&self, master: MasterId) -> HashSet<WorkerId> {
        self.configured_on
            .iter()
            .filter(|(m, _)| *m == master)
            .map(|(_, w)| *w)
            .collect()
    }
}
