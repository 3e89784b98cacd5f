//! Worker registry.
//!
//! Tracks the workers connected to *this* master process: their reported
//! capabilities, concurrency limits and in-flight dispatches. The registry
//! is owned by one master and never shared across masters; other masters
//! learn about workers only through the store's configured_on pairs.

use overseer_core::{Builder, MasterId, RequestId, WorkerConnection, WorkerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Capability info a worker reports at connect time.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub name: String,
    /// Concurrency limit; the running count never exceeds it.
    pub max_builds: u32,
    /// Builder names this worker can run.
    pub builders: HashSet<String>,
}

struct ConnectedWorker {
    info: WorkerInfo,
    conn: Arc<dyn WorkerConnection>,
    /// Dispatched-but-incomplete requests, by builder name.
    running: HashMap<RequestId, String>,
}

/// The connected-worker set for one master process.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, ConnectedWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a worker connection. First connection wins: a second
    /// registration under the same id is rejected so one logical worker
    /// name can never be double-dispatched over two connections.
    pub fn register(
        &mut self,
        worker: WorkerId,
        info: WorkerInfo,
        conn: Arc<dyn WorkerConnection>,
    ) -> bool {
        if let Some(existing) = self.workers.get(&worker) {
            warn!(
                worker_id = %worker,
                name = %existing.info.name,
                "Duplicate worker registration rejected; existing connection wins"
            );
            return false;
        }
        info!(worker_id = %worker, name = %info.name, max_builds = info.max_builds, "Worker registered");
        self.workers.insert(
            worker,
            ConnectedWorker {
                info,
                conn,
                running: HashMap::new(),
            },
        );
        true
    }

    /// Drop a worker on disconnect. Returns its dispatched-but-incomplete
    /// requests with their builder names so the distributor can unclaim
    /// them and retry elsewhere.
    pub fn unregister(&mut self, worker: WorkerId) -> Vec<(RequestId, String)> {
        match self.workers.remove(&worker) {
            Some(w) => {
                let lost: Vec<(RequestId, String)> = w.running.into_iter().collect();
                info!(
                    worker_id = %worker,
                    name = %w.info.name,
                    in_flight = lost.len(),
                    "Worker unregistered"
                );
                lost
            }
            None => Vec::new(),
        }
    }

    pub fn is_connected(&self, worker: WorkerId) -> bool {
        self.workers.contains_key(&worker)
    }

    /// Connected with a free build slot.
    pub fn is_available(&self, worker: WorkerId) -> bool {
        self.workers
            .get(&worker)
            .is_some_and(|w| w.running.len() < w.info.max_builds as usize)
    }

    pub fn running_count(&self, worker: WorkerId) -> usize {
        self.workers.get(&worker).map_or(0, |w| w.running.len())
    }

    pub fn worker_name(&self, worker: WorkerId) -> Option<&str> {
        self.workers.get(&worker).map(|w| w.info.name.as_str())
    }

    pub fn connection(&self, worker: WorkerId) -> Option<Arc<dyn WorkerConnection>> {
        self.workers.get(&worker).map(|w| w.conn.clone())
    }

    /// Connected workers whose capability set includes the builder,
    /// intersected with the builder's configured_on pairs for `master`.
    pub fn for_builder(&self, builder: &Builder, master: MasterId) -> Vec<WorkerId> {
        let configured = builder.workers_for_master(master);
        self.workers
            .iter()
            .filter(|(id, w)| {
                w.info.builders.contains(&builder.name) && configured.contains(id)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Builder names a worker can run, for wake-up routing.
    pub fn builders_of(&self, worker: WorkerId) -> HashSet<String> {
        self.workers
            .get(&worker)
            .map(|w| w.info.builders.clone())
            .unwrap_or_default()
    }

    pub fn note_dispatched(&mut self, worker: WorkerId, request: RequestId, builder: &str) {
        if let Some(w) = self.workers.get_mut(&worker) {
            w.running.insert(request, builder.to_string());
        }
    }

    /// Returns the builder name the request was running for, if tracked.
    pub fn note_complete(&mut self, worker: WorkerId, request: RequestId) -> Option<String> {
        self.workers
            .get_mut(&worker)
            .and_then(|w| w.running.remove(&request))
    }
}
