//! Periodic safety-net sweep.
//!
//! Distribution is event-driven; an abandoned evaluation pass with no
//! future trigger would stall its builder indefinitely. The sweep closes
//! that hole at a coarse interval: heartbeat, reclaim orphaned claims,
//! re-evaluate every builder.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::debug;

use crate::distributor::Distributor;

/// Spawn the sweep loop. The first sweep runs immediately, which doubles
/// as the startup heartbeat and initial evaluation. Abort the handle to
/// stop sweeping.
pub fn spawn_sweeper(distributor: Arc<Distributor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(distributor.config().sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            debug!(master_id = %distributor.master(), "Running safety-net sweep");
            distributor.sweep().await;
        }
    })
}
