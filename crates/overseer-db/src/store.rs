//! The request store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{BuildRequest, BuildResult, BuildsetId, MasterId, RequestId, WorkerId};
use std::collections::HashSet;

use crate::DbResult;

/// Fields a scheduler supplies when inserting a request.
#[derive(Debug, Clone)]
pub struct NewBuildRequest {
    pub builder: String,
    pub buildset_id: BuildsetId,
    pub priority: i32,
}

/// Transactional store for build requests and master liveness.
///
/// `try_claim` is the only correctness mechanism for at-most-once dispatch:
/// it must be a single atomic conditional write, never read-then-write.
/// Everything a distributor caches between passes is an optimization.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new unclaimed request. Returns the stored row.
    async fn create_request(&self, new: NewBuildRequest) -> DbResult<BuildRequest>;

    async fn get_request(&self, id: RequestId) -> DbResult<Option<BuildRequest>>;

    /// Unclaimed, incomplete requests for one builder, ordered by priority
    /// descending then submitted_at ascending then id ascending. The
    /// ordering is a contract: FIFO within a priority tier.
    async fn get_pending_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>>;

    /// Atomically claim the request for `master` if and only if it is
    /// currently unclaimed and incomplete. Returns false on a lost race,
    /// a missing row, or an already-complete row.
    async fn try_claim(&self, id: RequestId, master: MasterId) -> DbResult<bool>;

    /// Clear the claim columns unconditionally. Idempotent; a second call
    /// on an unclaimed row is a no-op.
    async fn unclaim(&self, id: RequestId) -> DbResult<()>;

    /// Unclaim incomplete requests held by masters that have not reported
    /// activity since `stale_before` (or are marked stopped). Returns the
    /// freed request ids.
    async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> DbResult<Vec<RequestId>>;

    /// Workers a builder is configured on for one master, as declared by
    /// the cluster configuration. Routing data, not a correctness input:
    /// the registry still gates on live connections and capacity.
    async fn configured_workers(
        &self,
        builder: &str,
        master: MasterId,
    ) -> DbResult<HashSet<WorkerId>>;

    /// Replace a builder's configured workers for one master.
    async fn set_configured_workers(
        &self,
        builder: &str,
        master: MasterId,
        workers: &HashSet<WorkerId>,
    ) -> DbResult<()>;

    /// Record which worker a claimed request was dispatched to.
    async fn record_dispatch(&self, id: RequestId, worker: WorkerId) -> DbResult<()>;

    /// Mark the request complete with its final results. Terminal.
    async fn record_complete(&self, id: RequestId, results: BuildResult) -> DbResult<()>;

    /// Report this master as alive.
    async fn heartbeat(&self, master: MasterId) -> DbResult<()>;

    /// Mark a master as cleanly stopped so its claims become reclaimable
    /// without waiting out the staleness threshold.
    async fn mark_stopped(&self, master: MasterId) -> DbResult<()>;
}
