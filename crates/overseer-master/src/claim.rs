//! Claim/unclaim protocol.
//!
//! The only place claim columns are mutated. Correctness rests entirely on
//! the store's atomic compare-and-set; everything here is timeout and retry
//! discipline around it.

use chrono::{DateTime, Utc};
use overseer_core::{BuildRequest, MasterId, RequestId};
use overseer_db::{DbResult, RequestStore};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::MasterConfig;

/// Claim operations for one master.
pub struct ClaimManager {
    store: Arc<dyn RequestStore>,
    master: MasterId,
    config: MasterConfig,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn RequestStore>, master: MasterId, config: MasterConfig) -> Self {
        Self {
            store,
            master,
            config,
        }
    }

    pub fn master(&self) -> MasterId {
        self.master
    }

    /// Attempt to claim a request for this master. Returns false on a lost
    /// race, a missing or already-complete row, a store error, or a
    /// timeout. A timed-out claim is never assumed to have succeeded: if
    /// the write actually landed, the row stays claimed by this master
    /// until the orphan sweep frees it, which delays but never duplicates
    /// dispatch.
    pub async fn try_claim(&self, request: RequestId) -> bool {
        match timeout(
            self.config.claim_timeout(),
            self.store.try_claim(request, self.master),
        )
        .await
        {
            Ok(Ok(claimed)) => {
                if !claimed {
                    debug!(request_id = %request, "Claim lost to another master");
                }
                claimed
            }
            Ok(Err(e)) => {
                warn!(request_id = %request, error = %e, "Claim attempt failed");
                false
            }
            Err(_) => {
                warn!(
                    request_id = %request,
                    timeout_ms = self.config.claim_timeout_ms,
                    "Claim attempt timed out; treating as failed"
                );
                false
            }
        }
    }

    /// Unclaim unconditionally, with the same bounded retry as pending
    /// reads. Idempotent. Returns false only after exhausting every
    /// attempt; the caller must queue the request for a later retry,
    /// because orphan reclaim never frees a claim held by a live master.
    pub async fn unclaim(&self, request: RequestId) -> bool {
        let attempts = self.config.store_retry_attempts;
        let mut attempt = 0;
        loop {
            match self.store.unclaim(request).await {
                Ok(()) => return true,
                Err(e) if attempt + 1 < attempts => {
                    let backoff = self.config.store_retry_backoff(attempt);
                    warn!(
                        request_id = %request,
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Unclaim failed; retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(request_id = %request, error = %e, "Unclaim failed after retries");
                    return false;
                }
            }
        }
    }

    /// Unclaim requests held by masters stale since `stale_before`.
    pub async fn reclaim_orphaned(&self, stale_before: DateTime<Utc>) -> Vec<RequestId> {
        match self.store.reclaim_orphaned(stale_before).await {
            Ok(freed) => freed,
            Err(e) => {
                warn!(error = %e, "Orphan reclaim failed");
                Vec::new()
            }
        }
    }

    /// Read pending requests with bounded exponential backoff. Exhausting
    /// the retries returns the last error; the caller abandons the pass
    /// and relies on the safety-net sweep.
    pub async fn pending_with_retry(&self, builder: &str) -> DbResult<Vec<BuildRequest>> {
        let attempts = self.config.store_retry_attempts;
        let mut attempt = 0;
        loop {
            match self.store.get_pending_requests(builder).await {
                Ok(pending) => return Ok(pending),
                Err(e) if attempt + 1 < attempts => {
                    let backoff = self.config.store_retry_backoff(attempt);
                    warn!(
                        builder,
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Pending-request read failed; retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
