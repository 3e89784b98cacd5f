//! In-memory implementation of the request store.
//!
//! Mirrors the PostgreSQL store's semantics exactly, including the
//! compare-and-set claim. Used by the test suites and by single-process
//! deployments that do not need a shared database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use overseer_core::{BuildRequest, BuildResult, MasterId, RequestId, WorkerId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::store::{NewBuildRequest, RequestStore};
use crate::{DbError, DbResult};

#[derive(Debug, Clone)]
struct MasterState {
    last_active: DateTime<Utc>,
    stopped: bool,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, BuildRequest>,
    dispatches: HashMap<RequestId, WorkerId>,
    masters: HashMap<MasterId, MasterState>,
    builder_workers: HashMap<(String, MasterId), HashSet<WorkerId>>,
}

/// Request store held entirely in process memory.
#[derive(Default)]
pub struct MemRequestStore {
    inner: Mutex<Inner>,
}

impl MemRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: insert a request row verbatim, claim columns included.
    pub fn insert_raw(&self, request: BuildRequest) {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.insert(request.id, request);
    }

    /// Test hook: the worker a request was last dispatched to.
    pub fn dispatched_to(&self, id: RequestId) -> Option<WorkerId> {
        self.inner.lock().unwrap().dispatches.get(&id).copied()
    }
}

#[async_trait]
impl RequestStore for MemRequestStore {
    async fn create_request(&self, new: NewBuildRequest) -> DbResult<BuildRequest> {
        let request = BuildRequest {
            id: RequestId::new(),
            builder: new.builder,
            buildset_id: new.buildset_id,
            priority: new.priority,
            submitted_at: Utc::now(),
            claimed_at: None,
            claimed_by_master: None,
            complete_at: None,
            results: None,
        };
        self.inner
            .lock()
            .unwrap()
            .requests
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: RequestId) -> DbResult<Option<BuildRequest>> {
        Ok(self.inner.lock().unwrap().requests.get(&id).cloned())
    }

    async fn get_pending_requests(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<BuildRequest> = inner
            .requests
            .values()
            .filter(|r| r.builder == builder && r.claimed_at.is_none() && r.complete_at.is_none())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    async fn try_claim(&self, id: RequestId, master: MasterId) -> DbResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.get_mut(&id) {
            Some(r) if r.claimed_at.is_none() && r.complete_at.is_none() => {
                r.claimed_at = Some(Utc::now());
                r.claimed_by_master = Some(master);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unclaim(&self, id: RequestId) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.requests.get_mut(&id) {
            r.claimed_at = None;
            r.claimed_by_master = None;
        }
        Ok(())
    }

    async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> DbResult<Vec<RequestId>> {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<MasterId> = inner
            .masters
            .iter()
            .filter(|(_, m)| m.stopped || m.last_active < stale_before)
            .map(|(id, _)| *id)
            .collect();
        let mut freed = Vec::new();
        for r in inner.requests.values_mut() {
            if r.complete_at.is_none()
                && r.claimed_by_master.is_some_and(|m| stale.contains(&m))
            {
                r.claimed_at = None;
                r.claimed_by_master = None;
                freed.push(r.id);
            }
        }
        Ok(freed)
    }

    async fn configured_workers(
        &self,
        builder: &str,
        master: MasterId,
    ) -> DbResult<HashSet<WorkerId>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .builder_workers
            .get(&(builder.to_string(), master))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_configured_workers(
        &self,
        builder: &str,
        master: MasterId,
        workers: &HashSet<WorkerId>,
    ) -> DbResult<()> {
        self.inner
            .lock()
            .unwrap()
            .builder_workers
            .insert((builder.to_string(), master), workers.clone());
        Ok(())
    }

    async fn record_dispatch(&self, id: RequestId, worker: WorkerId) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.requests.contains_key(&id) {
            return Err(DbError::NotFound(format!("build request {id}")));
        }
        inner.dispatches.insert(id, worker);
        Ok(())
    }

    async fn record_complete(&self, id: RequestId, results: BuildResult) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.get_mut(&id) {
            Some(r) if r.complete_at.is_none() => {
                r.complete_at = Some(Utc::now());
                r.results = Some(results);
                Ok(())
            }
            _ => Err(DbError::NotFound(format!(
                "build request {id} (missing or already complete)"
            ))),
        }
    }

    async fn heartbeat(&self, master: MasterId) -> DbResult<()> {
        self.inner.lock().unwrap().masters.insert(
            master,
            MasterState {
                last_active: Utc::now(),
                stopped: false,
            },
        );
        Ok(())
    }

    async fn mark_stopped(&self, master: MasterId) -> DbResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.masters.get_mut(&master) {
            m.stopped = true;
        }
        Ok(())
    }
}
