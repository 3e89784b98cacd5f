//! Event notifier.
//!
//! Publishes request/worker/master events on the bus so other masters and
//! UI consumers re-evaluate. Publish failures are logged, never fatal: the
//! periodic sweep covers for missed wake-ups.

use overseer_core::{BuildRequest, MasterId, WorkerId};
use overseer_mq::{EventBus, RoutingKey};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub struct Notifier {
    bus: Arc<dyn EventBus>,
    master: MasterId,
}

impl Notifier {
    pub fn new(bus: Arc<dyn EventBus>, master: MasterId) -> Self {
        Self { bus, master }
    }

    async fn publish(&self, key: RoutingKey, payload: serde_json::Value) {
        if let Err(e) = self.bus.publish(key.clone(), payload).await {
            warn!(key = %key, error = %e, "Event publish failed");
        }
    }

    pub async fn request_added(&self, request: &BuildRequest) {
        self.publish(
            RoutingKey::new(["buildrequests", request.builder.as_str(), "new"]),
            json!({
                "request_id": request.id,
                "buildset_id": request.buildset_id,
                "priority": request.priority,
            }),
        )
        .await;
    }

    pub async fn request_claimed(&self, request: &BuildRequest) {
        self.publish(
            RoutingKey::new(["buildrequests", request.builder.as_str(), "claimed"]),
            json!({
                "request_id": request.id,
                "master_id": self.master,
            }),
        )
        .await;
    }

    pub async fn request_unclaimed(&self, builder: &str, request: overseer_core::RequestId) {
        self.publish(
            RoutingKey::new(["buildrequests", builder, "unclaimed"]),
            json!({ "request_id": request }),
        )
        .await;
    }

    pub async fn worker_connected(&self, worker: WorkerId, name: &str) {
        let worker_seg = worker.to_string();
        self.publish(
            RoutingKey::new(["workers", worker_seg.as_str(), "connected"]),
            json!({ "name": name, "master_id": self.master }),
        )
        .await;
    }

    pub async fn worker_disconnected(&self, worker: WorkerId, name: &str) {
        let worker_seg = worker.to_string();
        self.publish(
            RoutingKey::new(["workers", worker_seg.as_str(), "disconnected"]),
            json!({ "name": name, "master_id": self.master }),
        )
        .await;
    }

    /// Announced during clean shutdown, after the store row is marked
    /// stopped, so peers reclaim this master's claims promptly.
    pub async fn master_stopped(&self) {
        let master_seg = self.master.to_string();
        self.publish(
            RoutingKey::new(["masters", master_seg.as_str(), "stopped"]),
            json!({}),
        )
        .await;
    }
}
