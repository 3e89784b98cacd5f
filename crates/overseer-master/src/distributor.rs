//! Build request distributor.
//!
//! The control loop that matches pending requests to workers and claims
//! them against the shared store. Each builder is evaluated independently;
//! evaluations for one builder are serialized, and triggers arriving while
//! a pass is in flight coalesce into at most one follow-up pass.

use overseer_core::{Builder, BuildRequest, BuildResult, MasterId, RequestId, WorkerConnection, WorkerId};
use overseer_db::store::NewBuildRequest;
use overseer_db::{DbResult, RequestStore};
use overseer_mq::{EventBus, RoutingKey};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::claim::ClaimManager;
use crate::config::MasterConfig;
use crate::matching::{LockSet, MatchingEngine};
use crate::notifier::Notifier;
use crate::registry::{WorkerInfo, WorkerRegistry};

#[derive(Default)]
struct Activity {
    evaluating: bool,
    rerun: bool,
}

/// Build request distribution for one master process.
///
/// Owns the worker registry, the lock set and the per-builder evaluation
/// state. Constructed once at startup and shared as an `Arc`.
pub struct Distributor {
    master: MasterId,
    config: MasterConfig,
    store: Arc<dyn RequestStore>,
    claims: ClaimManager,
    matching: MatchingEngine,
    notifier: Notifier,
    registry: Mutex<WorkerRegistry>,
    locks: Mutex<LockSet>,
    builders: Mutex<HashMap<String, Builder>>,
    activity: Mutex<HashMap<String, Activity>>,
    dispatch_failures: Mutex<HashMap<RequestId, u32>>,
    failed_unclaims: Mutex<HashMap<RequestId, String>>,
    quarantined: Mutex<HashSet<RequestId>>,
    idle: Notify,
}

impl Distributor {
    pub fn new(
        master: MasterId,
        config: MasterConfig,
        store: Arc<dyn RequestStore>,
        bus: Arc<dyn EventBus>,
    ) -> overseer_core::Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            master,
            claims: ClaimManager::new(store.clone(), master, config.clone()),
            matching: MatchingEngine::new(master),
            notifier: Notifier::new(bus, master),
            store,
            config,
            registry: Mutex::new(WorkerRegistry::new()),
            locks: Mutex::new(LockSet::new()),
            builders: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
            dispatch_failures: Mutex::new(HashMap::new()),
            failed_unclaims: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(HashSet::new()),
            idle: Notify::new(),
        }))
    }

    pub fn master(&self) -> MasterId {
        self.master
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Replace the builder configuration and re-evaluate everything, as on
    /// startup or reload.
    pub fn configure_builders(self: &Arc<Self>, builders: Vec<Builder>) {
        let names: Vec<String> = builders.iter().map(|b| b.name.clone()).collect();
        {
            let mut map = self.builders.lock().unwrap();
            map.clear();
            for b in builders {
                map.insert(b.name.clone(), b);
            }
        }
        self.maybe_start_builds_on(names);
    }

    /// Refresh every builder's configured_on pairs for this master from
    /// the store's routing table, as after a cluster reconfiguration, and
    /// re-evaluate. Pairs belonging to other masters are left alone.
    pub async fn load_configured_workers(self: &Arc<Self>) {
        let names: Vec<String> = self.builders.lock().unwrap().keys().cloned().collect();
        let mut refreshed = Vec::new();
        for name in names {
            match self.store.configured_workers(&name, self.master).await {
                Ok(workers) => {
                    let mut builders = self.builders.lock().unwrap();
                    if let Some(builder) = builders.get_mut(&name) {
                        builder.configured_on.retain(|(m, _)| *m != self.master);
                        builder
                            .configured_on
                            .extend(workers.into_iter().map(|w| (self.master, w)));
                        refreshed.push(name);
                    }
                }
                Err(e) => {
                    warn!(builder = %name, error = %e, "Failed to load configured workers");
                }
            }
        }
        self.maybe_start_builds_on(refreshed);
    }

    pub fn set_lock_capacity(&self, lock: impl Into<String>, capacity: u32) {
        self.locks.lock().unwrap().set_capacity(lock, capacity);
    }

    /// Accept a worker connection and wake the builders it can run.
    pub async fn attach_worker(
        self: &Arc<Self>,
        worker: WorkerId,
        info: WorkerInfo,
        conn: Arc<dyn WorkerConnection>,
    ) {
        let name = info.name.clone();
        let capabilities = info.builders.clone();
        let registered = self.registry.lock().unwrap().register(worker, info, conn);
        if !registered {
            return;
        }
        self.notifier.worker_connected(worker, &name).await;
        self.maybe_start_builds_on(capabilities);
    }

    /// Handle a worker disconnect: its in-flight requests are unclaimed so
    /// another pass (here or on another master) can retry them.
    pub async fn detach_worker(self: &Arc<Self>, worker: WorkerId) {
        let (name, lost) = {
            let mut registry = self.registry.lock().unwrap();
            let name = registry.worker_name(worker).map(str::to_string);
            (name, registry.unregister(worker))
        };
        let Some(name) = name else { return };

        let mut affected: HashSet<String> = HashSet::new();
        for (request, builder_name) in lost {
            info!(
                request_id = %request,
                builder = %builder_name,
                worker_id = %worker,
                "Worker lost mid-build; unclaiming request for retry"
            );
            self.release_builder_locks(&builder_name);
            self.unclaim_or_queue(&builder_name, request).await;
            affected.insert(builder_name);
        }
        self.notifier.worker_disconnected(worker, &name).await;
        self.maybe_start_builds_on(affected);
    }

    /// Called by the build-execution path when a dispatched build finishes.
    /// Frees the worker slot and locks, records the result, and wakes the
    /// builder since a freed worker may match further pending requests.
    pub async fn on_build_complete(
        self: &Arc<Self>,
        worker: WorkerId,
        request: RequestId,
        results: BuildResult,
    ) {
        let Some(builder_name) = self.registry.lock().unwrap().note_complete(worker, request)
        else {
            debug!(request_id = %request, worker_id = %worker, "Completion for untracked request");
            return;
        };
        self.release_builder_locks(&builder_name);
        self.dispatch_failures.lock().unwrap().remove(&request);
        if let Err(e) = self.store.record_complete(request, results).await {
            warn!(request_id = %request, error = %e, "Failed to record completion");
        }
        self.maybe_start_builds_on([builder_name]);
    }

    /// Insert a new request, announce it, and wake its builder. Schedulers
    /// embedded in this process use this; external schedulers insert rows
    /// directly and publish the same event.
    pub async fn submit_request(self: &Arc<Self>, new: NewBuildRequest) -> DbResult<BuildRequest> {
        let request = self.store.create_request(new).await?;
        self.notifier.request_added(&request).await;
        self.maybe_start_builds_on([request.builder.clone()]);
        Ok(request)
    }

    /// Primary entry point: something happened that may allow new matches.
    ///
    /// If a builder is already being evaluated the trigger is recorded as a
    /// single pending re-check, so a burst of N triggers produces at most
    /// one follow-up pass. Unknown builder names are ignored.
    pub fn maybe_start_builds_on<I, S>(self: &Arc<Self>, builders: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in builders {
            let name = name.into();
            if !self.builders.lock().unwrap().contains_key(&name) {
                debug!(builder = %name, "Ignoring trigger for unconfigured builder");
                continue;
            }
            let mut activity = self.activity.lock().unwrap();
            let entry = activity.entry(name.clone()).or_default();
            if entry.evaluating {
                entry.rerun = true;
            } else {
                entry.evaluating = true;
                let this = self.clone();
                tokio::spawn(async move { this.run_builder(name).await });
            }
        }
    }

    /// Wait until no builder evaluation is in flight.
    pub async fn quiesce(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register for the wake-up before the check: `notify_waiters`
            // stores no permit, so an idle transition between the check
            // and the first poll would otherwise be lost.
            notified.as_mut().enable();
            if self
                .activity
                .lock()
                .unwrap()
                .values()
                .all(|a| !a.evaluating)
            {
                return;
            }
            notified.await;
        }
    }

    /// Serialized evaluation loop for one builder: run passes until no
    /// re-check is pending, then go idle.
    async fn run_builder(self: Arc<Self>, name: String) {
        loop {
            self.evaluate(&name).await;
            let mut activity = self.activity.lock().unwrap();
            let entry = activity.entry(name.clone()).or_default();
            if entry.rerun {
                entry.rerun = false;
                continue;
            }
            entry.evaluating = false;
            let all_idle = activity.values().all(|a| !a.evaluating);
            drop(activity);
            if all_idle {
                self.idle.notify_waiters();
            }
            return;
        }
    }

    /// One evaluation pass, executed to quiescence for this builder.
    async fn evaluate(self: &Arc<Self>, name: &str) {
        let Some(builder) = self.builders.lock().unwrap().get(name).cloned() else {
            return;
        };

        let pending = match self.claims.pending_with_retry(name).await {
            Ok(pending) => pending,
            Err(e) => {
                // The periodic sweep re-evaluates every builder, so an
                // abandoned pass cannot stall this builder forever.
                warn!(builder = %name, error = %e, "Abandoning evaluation pass after store retries");
                return;
            }
        };

        let mut pending: VecDeque<BuildRequest> = {
            let mut quarantined = self.quarantined.lock().unwrap();
            pending
                .into_iter()
                .filter(|r| {
                    if !r.claim_columns_consistent() {
                        if quarantined.insert(r.id) {
                            error!(
                                request_id = %r.id,
                                builder = %name,
                                "Claim columns inconsistent; quarantining request for operator review"
                            );
                        }
                        return false;
                    }
                    !quarantined.contains(&r.id)
                })
                .collect()
        };

        while let Some(request) = pending.pop_front() {
            // Candidates are recomputed fresh after every claim attempt;
            // another master or a lock holder may have changed the picture.
            let candidate = {
                let registry = self.registry.lock().unwrap();
                let locks = self.locks.lock().unwrap();
                self.matching
                    .candidates_for(&builder, &registry, &locks)
                    .into_iter()
                    .next()
            };
            let Some(worker) = candidate else {
                break;
            };

            if !self.claims.try_claim(request.id).await {
                // Lost the race; move to the next request. The same
                // request is never retried within one pass.
                continue;
            }

            let locks_taken = self.locks.lock().unwrap().acquire(&builder.locks);
            if !locks_taken {
                // Lock capacity vanished between the speculative check and
                // the claim (another builder shares the lock). Hand the
                // request back; the holder's release will wake us.
                self.unclaim_or_queue(name, request.id).await;
                break;
            }

            self.registry
                .lock()
                .unwrap()
                .note_dispatched(worker, request.id, name);
            self.notifier.request_claimed(&request).await;
            self.dispatch(&builder, &request, worker).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, builder: &Builder, request: &BuildRequest, worker: WorkerId) {
        let conn = self.registry.lock().unwrap().connection(worker);
        let started = match conn {
            Some(conn) => {
                conn.start_command(
                    request.id,
                    "startBuild",
                    json!({
                        "builder": builder.name,
                        "buildset_id": request.buildset_id,
                        "priority": request.priority,
                    }),
                )
                .await
            }
            None => Err(overseer_core::Error::WorkerDisconnected(format!(
                "worker {worker} vanished between claim and dispatch"
            ))),
        };

        match started {
            Ok(()) => {
                self.dispatch_failures.lock().unwrap().remove(&request.id);
                if let Err(e) = self.store.record_dispatch(request.id, worker).await {
                    warn!(request_id = %request.id, error = %e, "Failed to record dispatch");
                }
                info!(
                    request_id = %request.id,
                    builder = %builder.name,
                    worker_id = %worker,
                    "Build request dispatched"
                );
            }
            Err(e) => self.dispatch_failed(builder, request, worker, e).await,
        }
    }

    /// The connection died between claim and dispatch. Unclaim and requeue
    /// until the per-request retry threshold, then surface a permanent
    /// worker-unavailable result instead of retrying forever.
    async fn dispatch_failed(
        self: &Arc<Self>,
        builder: &Builder,
        request: &BuildRequest,
        worker: WorkerId,
        error: overseer_core::Error,
    ) {
        self.registry.lock().unwrap().note_complete(worker, request.id);
        self.release_builder_locks(&builder.name);

        let failures = {
            let mut map = self.dispatch_failures.lock().unwrap();
            let count = map.entry(request.id).or_insert(0);
            *count += 1;
            *count
        };

        if failures >= self.config.dispatch_retry_limit {
            warn!(
                request_id = %request.id,
                builder = %builder.name,
                failures,
                error = %error,
                "Dispatch failed repeatedly; completing request as worker-unavailable"
            );
            self.dispatch_failures.lock().unwrap().remove(&request.id);
            if let Err(e) = self
                .store
                .record_complete(request.id, BuildResult::WorkerUnavailable)
                .await
            {
                warn!(request_id = %request.id, error = %e, "Failed to record permanent dispatch failure");
            }
            return;
        }

        info!(
            request_id = %request.id,
            builder = %builder.name,
            worker_id = %worker,
            failures,
            error = %error,
            "Dispatch failed; unclaiming for retry"
        );
        self.unclaim_or_queue(&builder.name, request.id).await;
        self.maybe_start_builds_on([builder.name.clone()]);
    }

    /// Unclaim and announce, or queue the request for the sweep to retry.
    /// A claim held by this live master is invisible to orphan reclaim, so
    /// a failed unclaim has to be retried here until it lands.
    async fn unclaim_or_queue(self: &Arc<Self>, builder: &str, request: RequestId) {
        if self.claims.unclaim(request).await {
            self.notifier.request_unclaimed(builder, request).await;
        } else {
            self.failed_unclaims
                .lock()
                .unwrap()
                .insert(request, builder.to_string());
        }
    }

    /// Release a builder's lock claims and wake any other builder sharing
    /// one of the released locks; its next pass may now match.
    fn release_builder_locks(self: &Arc<Self>, builder_name: &str) {
        let claims = self
            .builders
            .lock()
            .unwrap()
            .get(builder_name)
            .map(|b| b.locks.clone())
            .unwrap_or_default();
        if claims.is_empty() {
            return;
        }
        self.locks.lock().unwrap().release(&claims);

        let released: HashSet<&str> = claims.iter().map(|c| c.lock.as_str()).collect();
        let waiters: Vec<String> = self
            .builders
            .lock()
            .unwrap()
            .values()
            .filter(|b| {
                b.name != builder_name
                    && b.locks.iter().any(|c| released.contains(c.lock.as_str()))
            })
            .map(|b| b.name.clone())
            .collect();
        self.maybe_start_builds_on(waiters);
    }

    /// Reclaim requests orphaned by stale or stopped masters and wake the
    /// builders of everything freed.
    pub async fn reclaim_orphans(self: &Arc<Self>) -> Vec<RequestId> {
        let cutoff = chrono::Utc::now() - self.config.master_stale_after();
        let freed = self.claims.reclaim_orphaned(cutoff).await;
        if freed.is_empty() {
            return freed;
        }
        info!(count = freed.len(), "Reclaimed orphaned build requests");

        let mut affected: HashSet<String> = HashSet::new();
        for id in &freed {
            if let Ok(Some(request)) = self.store.get_request(*id).await {
                self.notifier
                    .request_unclaimed(&request.builder, request.id)
                    .await;
                affected.insert(request.builder);
            }
        }
        self.maybe_start_builds_on(affected);
        freed
    }

    /// Safety-net sweep: heartbeat, reclaim orphans, and re-evaluate every
    /// configured builder. Evaluation is otherwise purely event-driven, so
    /// this is what rescues a builder whose last pass was abandoned.
    pub async fn sweep(self: &Arc<Self>) {
        if let Err(e) = self.store.heartbeat(self.master).await {
            warn!(error = %e, "Master heartbeat failed");
        }
        self.retry_failed_unclaims().await;
        self.prune_dispatch_failures().await;
        self.reclaim_orphans().await;
        let names: Vec<String> = self.builders.lock().unwrap().keys().cloned().collect();
        self.maybe_start_builds_on(names);
    }

    /// Re-attempt unclaims that exhausted their retries. These rows are
    /// still claimed by this master, which keeps heartbeating, so nothing
    /// else will ever free them.
    async fn retry_failed_unclaims(self: &Arc<Self>) {
        let queued: Vec<(RequestId, String)> = {
            let mut map = self.failed_unclaims.lock().unwrap();
            map.drain().collect()
        };
        for (request, builder) in queued {
            self.unclaim_or_queue(&builder, request).await;
        }
    }

    /// Drop dispatch-failure counters for requests that are no longer
    /// ours to dispatch: completed, deleted, or claimed by another master.
    async fn prune_dispatch_failures(&self) {
        let tracked: Vec<RequestId> = self
            .dispatch_failures
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect();
        for id in tracked {
            let keep = match self.store.get_request(id).await {
                Ok(Some(r)) => {
                    !r.is_complete() && r.claimed_by_master.is_none_or(|m| m == self.master)
                }
                Ok(None) => false,
                Err(_) => true,
            };
            if !keep {
                self.dispatch_failures.lock().unwrap().remove(&id);
            }
        }
    }

    /// Clean shutdown: mark this master stopped so peers reclaim its
    /// claims immediately, and announce it on the bus.
    pub async fn shutdown(&self) {
        if let Err(e) = self.store.mark_stopped(self.master).await {
            warn!(error = %e, "Failed to mark master stopped");
        }
        self.notifier.master_stopped().await;
    }

    /// Route bus events to the distributor: new and unclaimed requests
    /// wake their builder, a stopped master triggers orphan reclaim.
    pub fn spawn_event_pump(self: &Arc<Self>, bus: &Arc<dyn EventBus>) -> JoinHandle<()> {
        let mut added = bus.subscribe(RoutingKey::new(["buildrequests", "*", "new"]));
        let mut unclaimed = bus.subscribe(RoutingKey::new(["buildrequests", "*", "unclaimed"]));
        let mut stopped = bus.subscribe(RoutingKey::new(["masters", "*", "stopped"]));
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = added.recv() => match msg {
                        Some(msg) => this.maybe_start_builds_on([msg.key.segments()[1].clone()]),
                        None => break,
                    },
                    msg = unclaimed.recv() => match msg {
                        Some(msg) => this.maybe_start_builds_on([msg.key.segments()[1].clone()]),
                        None => break,
                    },
                    msg = stopped.recv() => match msg {
                        Some(_) => {
                            this.reclaim_orphans().await;
                        }
                        None => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use overseer_core::{BuildsetId, Result};
    use overseer_db::MemRequestStore;
    use overseer_mq::LocalBus;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Worker connection that records started commands and can be told to
    /// fail the first N of them.
    struct RecordingConnection {
        started: Mutex<Vec<RequestId>>,
        fail_first: AtomicU32,
    }

    impl RecordingConnection {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(n: u32) -> Arc<Self> {
            Arc::new(Self {
                started: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(n),
            })
        }

        fn started(&self) -> Vec<RequestId> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerConnection for RecordingConnection {
        async fn list_commands(&self) -> Result<HashSet<String>> {
            Ok(HashSet::from(["startBuild".to_string()]))
        }

        async fn start_command(
            &self,
            command_id: RequestId,
            _command_name: &str,
            _args: serde_json::Value,
        ) -> Result<()> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(overseer_core::Error::WorkerDisconnected(
                    "connection reset".to_string(),
                ));
            }
            self.started.lock().unwrap().push(command_id);
            Ok(())
        }

        async fn interrupt_command(&self, _command_id: RequestId, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemRequestStore>,
        distributor: Arc<Distributor>,
        master: MasterId,
    }

    fn test_config() -> MasterConfig {
        MasterConfig {
            store_retry_base_ms: 1,
            ..Default::default()
        }
    }

    fn harness_with(config: MasterConfig) -> Harness {
        let store = Arc::new(MemRequestStore::new());
        let master = MasterId::new();
        let distributor = Distributor::new(
            master,
            config,
            store.clone() as Arc<dyn RequestStore>,
            Arc::new(LocalBus::new()) as Arc<dyn EventBus>,
        )
        .unwrap();
        Harness {
            store,
            distributor,
            master,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    impl Harness {
        /// One builder configured on one worker of this master.
        async fn with_worker(
            &self,
            builder_name: &str,
            worker_name: &str,
            max_builds: u32,
            conn: Arc<RecordingConnection>,
        ) -> WorkerId {
            let worker = WorkerId::new();
            let mut builder = self
                .distributor
                .builders
                .lock()
                .unwrap()
                .get(builder_name)
                .cloned()
                .unwrap_or_else(|| Builder::new(builder_name));
            builder.configured_on.insert((self.master, worker));
            self.distributor.configure_builders(vec![builder]);
            self.distributor.quiesce().await;

            self.distributor
                .attach_worker(
                    worker,
                    WorkerInfo {
                        name: worker_name.to_string(),
                        max_builds,
                        builders: HashSet::from([builder_name.to_string()]),
                    },
                    conn,
                )
                .await;
            self.distributor.quiesce().await;
            worker
        }

        fn new_request(&self, builder: &str, priority: i32) -> NewBuildRequest {
            NewBuildRequest {
                builder: builder.to_string(),
                buildset_id: BuildsetId::new(),
                priority,
            }
        }
    }

    #[tokio::test]
    async fn test_simple_match_claims_and_dispatches_once() {
        let h = harness();
        let conn = RecordingConnection::new();
        let worker = h.with_worker("b1", "w1", 1, conn.clone()).await;

        let request = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![request.id]);
        let row = h.store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(row.claimed_by_master, Some(h.master));
        assert_eq!(h.store.dispatched_to(request.id), Some(worker));
    }

    #[tokio::test]
    async fn test_priority_fifo_dispatch_order() {
        let h = harness();
        let conn = RecordingConnection::new();
        h.with_worker("b1", "w1", 3, conn.clone()).await;

        // Insert before waking so one pass sees all three; submitted_at is
        // pinned so the FIFO tie-break inside the priority tier is exact.
        let base = Utc::now();
        let mut ids = Vec::new();
        for (priority, offset) in [(5i32, 1i64), (10, 1), (10, 2)] {
            let mut req = h.store.create_request(h.new_request("b1", priority)).await.unwrap();
            req.submitted_at = base + chrono::Duration::seconds(offset);
            h.store.insert_raw(req.clone());
            ids.push(req.id);
        }
        let (low, high_old, high_new) = (ids[0], ids[1], ids[2]);

        h.distributor.maybe_start_builds_on(["b1"]);
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![high_old, high_new, low]);
    }

    #[tokio::test]
    async fn test_concurrency_bound_holds_until_a_build_completes() {
        let h = harness();
        let conn = RecordingConnection::new();
        let worker = h.with_worker("b1", "w1", 1, conn.clone()).await;

        let first = h
            .distributor
            .submit_request(h.new_request("b1", 10))
            .await
            .unwrap();
        let second = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;

        // max_builds=1: only the first request is running.
        assert_eq!(conn.started(), vec![first.id]);
        let row = h.store.get_request(second.id).await.unwrap().unwrap();
        assert!(!row.is_claimed());

        h.distributor
            .on_build_complete(worker, first.id, BuildResult::Success)
            .await;
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![first.id, second.id]);
        let row = h.store.get_request(first.id).await.unwrap().unwrap();
        assert_eq!(row.results, Some(BuildResult::Success));
    }

    #[tokio::test]
    async fn test_worker_disconnect_mid_build_requeues_request() {
        let h = harness();
        let conn = RecordingConnection::new();
        let worker = h.with_worker("b1", "w1", 1, conn.clone()).await;

        let request = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;
        assert_eq!(conn.started(), vec![request.id]);

        h.distributor.detach_worker(worker).await;
        h.distributor.quiesce().await;

        let pending = h.store.get_pending_requests("b1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, request.id);
        assert!(pending[0].claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_failure_retries_then_surfaces_worker_unavailable() {
        let h = harness_with(MasterConfig {
            dispatch_retry_limit: 2,
            store_retry_base_ms: 1,
            ..Default::default()
        });
        let conn = RecordingConnection::failing(u32::MAX);
        h.with_worker("b1", "w1", 1, conn.clone()).await;

        let request = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;

        assert!(conn.started().is_empty());
        let row = h.store.get_request(request.id).await.unwrap().unwrap();
        assert!(row.is_complete());
        assert_eq!(row.results, Some(BuildResult::WorkerUnavailable));
        assert!(h
            .distributor
            .dispatch_failures
            .lock()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_transient_dispatch_failure_recovers_on_retry() {
        let h = harness();
        let conn = RecordingConnection::failing(1);
        h.with_worker("b1", "w1", 1, conn.clone()).await;

        let request = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![request.id]);
        let row = h.store.get_request(request.id).await.unwrap().unwrap();
        assert!(!row.is_complete());
        assert_eq!(row.claimed_by_master, Some(h.master));
    }

    #[tokio::test]
    async fn test_corrupt_claim_columns_are_quarantined_not_dispatched() {
        let h = harness();
        let conn = RecordingConnection::new();
        h.with_worker("b1", "w1", 1, conn.clone()).await;

        let mut corrupt = h.store.create_request(h.new_request("b1", 100)).await.unwrap();
        corrupt.claimed_by_master = Some(MasterId::new());
        h.store.insert_raw(corrupt.clone());
        let good = h.store.create_request(h.new_request("b1", 0)).await.unwrap();

        h.distributor.maybe_start_builds_on(["b1"]);
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![good.id]);
        // Untouched for operator investigation.
        let row = h.store.get_request(corrupt.id).await.unwrap().unwrap();
        assert!(row.claimed_by_master.is_some());
        assert!(row.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_orphan_recovery_frees_and_redispatches() {
        let h = harness();
        let dead = MasterId::new();
        h.store.heartbeat(dead).await.unwrap();
        h.store.mark_stopped(dead).await.unwrap();

        let request = h.store.create_request(h.new_request("b1", 0)).await.unwrap();
        assert!(h.store.try_claim(request.id, dead).await.unwrap());

        let conn = RecordingConnection::new();
        h.with_worker("b1", "w1", 1, conn.clone()).await;
        assert!(conn.started().is_empty());

        let freed = h.distributor.reclaim_orphans().await;
        assert_eq!(freed, vec![request.id]);
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![request.id]);
        let row = h.store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(row.claimed_by_master, Some(h.master));
    }

    /// Store wrapper that counts pending reads and holds each one until a
    /// permit is available, to freeze an evaluation mid-pass.
    struct GatedStore {
        inner: MemRequestStore,
        pending_reads: AtomicUsize,
        gate: Semaphore,
    }

    #[async_trait]
    impl RequestStore for GatedStore {
        async fn create_request(&self, new: NewBuildRequest) -> DbResult<BuildRequest> {
            self.inner.create_request(new).await
        }

        async fn get_request(&self, id: RequestId) -> DbResult<Option<BuildRequest>> {
            self.inner.get_request(id).await
        }

        async fn get_pending_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
            self.pending_reads.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.unwrap().forget();
            self.inner.get_pending_requests(builder).await
        }

        async fn try_claim(&self, id: RequestId, master: MasterId) -> DbResult<bool> {
            self.inner.try_claim(id, master).await
        }

        async fn unclaim(&self, id: RequestId) -> DbResult<()> {
            self.inner.unclaim(id).await
        }

        async fn reclaim_orphaned(
            &self,
            stale_before: DateTime<Utc>,
        ) -> DbResult<Vec<RequestId>> {
            self.inner.reclaim_orphaned(stale_before).await
        }


        async fn configured_workers(
            &self,
            builder: &str,
            master: MasterId,
        ) -> DbResult<HashSet<WorkerId>> {
            self.inner.configured_workers(builder, master).await
        }

        async fn set_configured_workers(
            &self,
            builder: &str,
            master: MasterId,
            workers: &HashSet<WorkerId>,
        ) -> DbResult<()> {
            self.inner.set_configured_workers(builder, master, workers).await
        }

        async fn record_dispatch(&self, id: RequestId, worker: WorkerId) -> DbResult<()> {
            self.inner.record_dispatch(id, worker).await
        }

        async fn record_complete(&self, id: RequestId, results: BuildResult) -> DbResult<()> {
            self.inner.record_complete(id, results).await
        }

        async fn heartbeat(&self, master: MasterId) -> DbResult<()> {
            self.inner.heartbeat(master).await
        }

        async fn mark_stopped(&self, master: MasterId) -> DbResult<()> {
            self.inner.mark_stopped(master).await
        }
    }

    #[tokio::test]
    async fn test_triggers_during_evaluation_coalesce_into_one_rerun() {
        let store = Arc::new(GatedStore {
            inner: MemRequestStore::new(),
            pending_reads: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        });
        let distributor = Distributor::new(
            MasterId::new(),
            test_config(),
            store.clone() as Arc<dyn RequestStore>,
            Arc::new(LocalBus::new()) as Arc<dyn EventBus>,
        )
        .unwrap();
        distributor.configure_builders(vec![Builder::new("b1")]);

        // The configure call started a pass that is now parked on the gate.
        while store.pending_reads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        for _ in 0..5 {
            distributor.maybe_start_builds_on(["b1"]);
        }

        store.gate.add_permits(10);
        distributor.quiesce().await;

        // Exactly one coalesced follow-up pass, not five.
        assert_eq!(store.pending_reads.load(Ordering::SeqCst), 2);
        assert_eq!(store.gate.available_permits(), 8);
    }

    /// Store wrapper that lets a competing master claim the head request
    /// the moment it is reported pending, forcing a claim race loss.
    struct RacingStore {
        inner: MemRequestStore,
        rival: MasterId,
        target: RequestId,
        armed: AtomicU32,
    }

    #[async_trait]
    impl RequestStore for RacingStore {
        async fn create_request(&self, new: NewBuildRequest) -> DbResult<BuildRequest> {
            self.inner.create_request(new).await
        }

        async fn get_request(&self, id: RequestId) -> DbResult<Option<BuildRequest>> {
            self.inner.get_request(id).await
        }

        async fn get_pending_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
            let pending = self.inner.get_pending_requests(builder).await?;
            if self
                .armed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                // The rival wins the race after our snapshot was taken.
                assert!(self.inner.try_claim(self.target, self.rival).await?);
            }
            Ok(pending)
        }

        async fn try_claim(&self, id: RequestId, master: MasterId) -> DbResult<bool> {
            self.inner.try_claim(id, master).await
        }

        async fn unclaim(&self, id: RequestId) -> DbResult<()> {
            self.inner.unclaim(id).await
        }

        async fn reclaim_orphaned(
            &self,
            stale_before: DateTime<Utc>,
        ) -> DbResult<Vec<RequestId>> {
            self.inner.reclaim_orphaned(stale_before).await
        }


        async fn configured_workers(
            &self,
            builder: &str,
            master: MasterId,
        ) -> DbResult<HashSet<WorkerId>> {
            self.inner.configured_workers(builder, master).await
        }

        async fn set_configured_workers(
            &self,
            builder: &str,
            master: MasterId,
            workers: &HashSet<WorkerId>,
        ) -> DbResult<()> {
            self.inner.set_configured_workers(builder, master, workers).await
        }

        async fn record_dispatch(&self, id: RequestId, worker: WorkerId) -> DbResult<()> {
            self.inner.record_dispatch(id, worker).await
        }

        async fn record_complete(&self, id: RequestId, results: BuildResult) -> DbResult<()> {
            self.inner.record_complete(id, results).await
        }

        async fn heartbeat(&self, master: MasterId) -> DbResult<()> {
            self.inner.heartbeat(master).await
        }

        async fn mark_stopped(&self, master: MasterId) -> DbResult<()> {
            self.inner.mark_stopped(master).await
        }
    }

    #[tokio::test]
    async fn test_claim_race_loss_moves_to_next_request() {
        let mem = MemRequestStore::new();
        let rival = MasterId::new();

        let contested = mem
            .create_request(NewBuildRequest {
                builder: "b1".to_string(),
                buildset_id: BuildsetId::new(),
                priority: 10,
            })
            .await
            .unwrap();
        let fallback = mem
            .create_request(NewBuildRequest {
                builder: "b1".to_string(),
                buildset_id: BuildsetId::new(),
                priority: 0,
            })
            .await
            .unwrap();

        let store = Arc::new(RacingStore {
            inner: mem,
            rival,
            target: contested.id,
            armed: AtomicU32::new(1),
        });
        let master = MasterId::new();
        let distributor = Distributor::new(
            master,
            test_config(),
            store.clone() as Arc<dyn RequestStore>,
            Arc::new(LocalBus::new()) as Arc<dyn EventBus>,
        )
        .unwrap();

        // Attach the worker before the builder is known so the racing read
        // happens on the pass that actually has a candidate.
        let worker = WorkerId::new();
        let conn = RecordingConnection::new();
        distributor
            .attach_worker(
                worker,
                WorkerInfo {
                    name: "w1".to_string(),
                    max_builds: 2,
                    builders: HashSet::from(["b1".to_string()]),
                },
                conn.clone(),
            )
            .await;

        let mut builder = Builder::new("b1");
        builder.configured_on.insert((master, worker));
        distributor.configure_builders(vec![builder]);
        distributor.quiesce().await;

        // The loser silently moves on to the fallback request.
        assert_eq!(conn.started(), vec![fallback.id]);
        let row = store.get_request(contested.id).await.unwrap().unwrap();
        assert_eq!(row.claimed_by_master, Some(rival));
    }

    #[tokio::test]
    async fn test_shared_lock_serializes_builders() {
        let h = harness();
        let conn = RecordingConnection::new();
        let worker = h.with_worker("b1", "w1", 2, conn.clone()).await;

        // Rewrite the builder with an exclusive lock.
        let mut builder = h
            .distributor
            .builders
            .lock()
            .unwrap()
            .get("b1")
            .cloned()
            .unwrap();
        builder.locks.push(overseer_core::LockClaim::exclusive("deploy-slot"));
        h.distributor.configure_builders(vec![builder]);
        h.distributor.quiesce().await;

        let first = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        let second = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;

        // The lock, not the worker slot count, limits to one build.
        assert_eq!(conn.started(), vec![first.id]);

        h.distributor
            .on_build_complete(worker, first.id, BuildResult::Success)
            .await;
        h.distributor.quiesce().await;
        assert_eq!(conn.started(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_shared_lock_release_wakes_the_other_builder() {
        let h = harness();
        let w1 = WorkerId::new();
        let w2 = WorkerId::new();
        let mut b1 = Builder::new("b1");
        b1.locks.push(overseer_core::LockClaim::exclusive("deploy-slot"));
        b1.configured_on.insert((h.master, w1));
        let mut b2 = Builder::new("b2");
        b2.locks.push(overseer_core::LockClaim::exclusive("deploy-slot"));
        b2.configured_on.insert((h.master, w2));
        h.distributor.configure_builders(vec![b1, b2]);
        h.distributor.quiesce().await;

        let conn1 = RecordingConnection::new();
        let conn2 = RecordingConnection::new();
        for (worker, name, builder, conn) in
            [(w1, "w1", "b1", &conn1), (w2, "w2", "b2", &conn2)]
        {
            h.distributor
                .attach_worker(
                    worker,
                    WorkerInfo {
                        name: name.to_string(),
                        max_builds: 1,
                        builders: HashSet::from([builder.to_string()]),
                    },
                    conn.clone(),
                )
                .await;
        }

        let first = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;
        let second = h
            .distributor
            .submit_request(h.new_request("b2", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;

        // b1 holds the lock; b2 has a free worker but cannot start.
        assert_eq!(conn1.started(), vec![first.id]);
        assert!(conn2.started().is_empty());

        // Completing b1's build releases the lock and must wake b2,
        // whose own builder never saw a completion.
        h.distributor
            .on_build_complete(w1, first.id, BuildResult::Success)
            .await;
        h.distributor.quiesce().await;

        assert_eq!(conn2.started(), vec![second.id]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quiesce_sees_idle_transitions_on_other_threads() {
        let h = harness();
        let conn = RecordingConnection::new();
        h.with_worker("b1", "w1", 1, conn.clone()).await;

        // The evaluation task goes idle on another thread; quiesce must
        // never miss that transition and hang.
        for _ in 0..200 {
            h.distributor.maybe_start_builds_on(["b1"]);
            tokio::time::timeout(
                std::time::Duration::from_secs(5),
                h.distributor.quiesce(),
            )
            .await
            .expect("quiesce missed an idle wake-up");
        }
    }

    /// Store whose unclaim fails while `failures_left` is nonzero.
    struct FailingUnclaimStore {
        inner: MemRequestStore,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl RequestStore for FailingUnclaimStore {
        async fn create_request(&self, new: NewBuildRequest) -> DbResult<BuildRequest> {
            self.inner.create_request(new).await
        }

        async fn get_request(&self, id: RequestId) -> DbResult<Option<BuildRequest>> {
            self.inner.get_request(id).await
        }

        async fn get_pending_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
            self.inner.get_pending_requests(builder).await
        }

        async fn try_claim(&self, id: RequestId, master: MasterId) -> DbResult<bool> {
            self.inner.try_claim(id, master).await
        }

        async fn unclaim(&self, id: RequestId) -> DbResult<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(overseer_db::DbError::NotFound(
                    "connection blip".to_string(),
                ));
            }
            self.inner.unclaim(id).await
        }

        async fn reclaim_orphaned(
            &self,
            stale_before: DateTime<Utc>,
        ) -> DbResult<Vec<RequestId>> {
            self.inner.reclaim_orphaned(stale_before).await
        }

        async fn configured_workers(
            &self,
            builder: &str,
            master: MasterId,
        ) -> DbResult<HashSet<WorkerId>> {
            self.inner.configured_workers(builder, master).await
        }

        async fn set_configured_workers(
            &self,
            builder: &str,
            master: MasterId,
            workers: &HashSet<WorkerId>,
        ) -> DbResult<()> {
            self.inner.set_configured_workers(builder, master, workers).await
        }

        async fn record_dispatch(&self, id: RequestId, worker: WorkerId) -> DbResult<()> {
            self.inner.record_dispatch(id, worker).await
        }

        async fn record_complete(&self, id: RequestId, results: BuildResult) -> DbResult<()> {
            self.inner.record_complete(id, results).await
        }

        async fn heartbeat(&self, master: MasterId) -> DbResult<()> {
            self.inner.heartbeat(master).await
        }

        async fn mark_stopped(&self, master: MasterId) -> DbResult<()> {
            self.inner.mark_stopped(master).await
        }
    }

    #[tokio::test]
    async fn test_failed_unclaim_is_retried_by_the_sweep() {
        let store = Arc::new(FailingUnclaimStore {
            inner: MemRequestStore::new(),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let master = MasterId::new();
        let distributor = Distributor::new(
            master,
            test_config(),
            store.clone() as Arc<dyn RequestStore>,
            Arc::new(LocalBus::new()) as Arc<dyn EventBus>,
        )
        .unwrap();

        let worker = WorkerId::new();
        let mut builder = Builder::new("b1");
        builder.configured_on.insert((master, worker));
        distributor.configure_builders(vec![builder]);
        distributor.quiesce().await;
        let conn = RecordingConnection::new();
        distributor
            .attach_worker(
                worker,
                WorkerInfo {
                    name: "w1".to_string(),
                    max_builds: 1,
                    builders: HashSet::from(["b1".to_string()]),
                },
                conn.clone(),
            )
            .await;

        let request = distributor
            .submit_request(NewBuildRequest {
                builder: "b1".to_string(),
                buildset_id: BuildsetId::new(),
                priority: 0,
            })
            .await
            .unwrap();
        distributor.quiesce().await;
        assert_eq!(conn.started(), vec![request.id]);

        // Every unclaim during the disconnect fails; the live master's
        // claim stays put, where orphan reclaim can never free it.
        distributor.detach_worker(worker).await;
        distributor.quiesce().await;
        let row = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(row.claimed_by_master, Some(master));

        // The store recovers; the sweep retries the queued unclaim.
        store.failures_left.store(0, Ordering::SeqCst);
        distributor.sweep().await;
        distributor.quiesce().await;

        let pending = store.get_pending_requests("b1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, request.id);
        assert!(distributor.failed_unclaims.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_dispatch_failure_counters_pruned_on_sweep() {
        let h = harness();
        h.distributor.configure_builders(vec![Builder::new("b1")]);
        h.distributor.quiesce().await;

        // A request this master once failed to dispatch, since claimed and
        // finished by a competing master.
        let request = h.store.create_request(h.new_request("b1", 0)).await.unwrap();
        let rival = MasterId::new();
        assert!(h.store.try_claim(request.id, rival).await.unwrap());
        h.store
            .record_complete(request.id, BuildResult::Success)
            .await
            .unwrap();
        h.distributor
            .dispatch_failures
            .lock()
            .unwrap()
            .insert(request.id, 1);

        h.distributor.sweep().await;
        h.distributor.quiesce().await;

        assert!(h.distributor.dispatch_failures.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_configured_workers_enables_dispatch() {
        let h = harness();
        let worker = WorkerId::new();
        // Builder known but with no configured_on pairs yet.
        h.distributor.configure_builders(vec![Builder::new("b1")]);
        h.distributor.quiesce().await;

        let conn = RecordingConnection::new();
        h.distributor
            .attach_worker(
                worker,
                WorkerInfo {
                    name: "w1".to_string(),
                    max_builds: 1,
                    builders: HashSet::from(["b1".to_string()]),
                },
                conn.clone(),
            )
            .await;
        let request = h
            .distributor
            .submit_request(h.new_request("b1", 0))
            .await
            .unwrap();
        h.distributor.quiesce().await;
        // Capable and connected, but not configured for this master.
        assert!(conn.started().is_empty());

        h.store
            .set_configured_workers("b1", h.master, &HashSet::from([worker]))
            .await
            .unwrap();
        h.distributor.load_configured_workers().await;
        h.distributor.quiesce().await;

        assert_eq!(conn.started(), vec![request.id]);
    }

    #[tokio::test]
    async fn test_event_pump_wakes_builder_on_new_request_event() {
        let store = Arc::new(MemRequestStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
        let master = MasterId::new();
        let distributor = Distributor::new(
            master,
            test_config(),
            store.clone() as Arc<dyn RequestStore>,
            bus.clone(),
        )
        .unwrap();
        let pump = distributor.spawn_event_pump(&bus);

        let worker = WorkerId::new();
        let mut builder = Builder::new("b1");
        builder.configured_on.insert((master, worker));
        distributor.configure_builders(vec![builder]);
        distributor.quiesce().await;
        let conn = RecordingConnection::new();
        distributor
            .attach_worker(
                worker,
                WorkerInfo {
                    name: "w1".to_string(),
                    max_builds: 1,
                    builders: HashSet::from(["b1".to_string()]),
                },
                conn.clone(),
            )
            .await;
        distributor.quiesce().await;

        // Another process inserts the row and publishes the event.
        let request = store
            .create_request(NewBuildRequest {
                builder: "b1".to_string(),
                buildset_id: BuildsetId::new(),
                priority: 0,
            })
            .await
            .unwrap();
        bus.publish(
            RoutingKey::new(["buildrequests", "b1", "new"]),
            serde_json::json!({ "request_id": request.id }),
        )
        .await
        .unwrap();

        // The pump runs on its own task; wait for the dispatch to land.
        for _ in 0..100 {
            if !conn.started().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(conn.started(), vec![request.id]);
        pump.abort();
    }
}
