//! Worker RPC connection trait.
//!
//! The wire protocol to workers (remote command execution, log streaming)
//! is an external collaborator. The distributor only needs to start and
//! interrupt commands; results stream back over the same connection and are
//! handled by the build-execution path.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::{RequestId, Result};

/// One live connection to a worker process.
///
/// Implementations are connection-oriented: a `DispatchFailed` or
/// `WorkerDisconnected` error means the command did not start and the
/// request must be unclaimed and retried elsewhere.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// Protocol commands the worker supports, reported at connect time.
    async fn list_commands(&self) -> Result<HashSet<String>>;

    /// Start a command on the worker. Fire-and-forget: completion is
    /// reported asynchronously over the same connection.
    async fn start_command(
        &self,
        command_id: RequestId,
        command_name: &str,
        args: serde_json::Value,
    ) -> Result<()>;

    /// Interrupt a running command, e.g. on cancellation.
    async fn interrupt_command(&self, command_id: RequestId, reason: &str) -> Result<()>;
}
