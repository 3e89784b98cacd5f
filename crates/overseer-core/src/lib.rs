//! Core domain types and traits for the Overseer CI master.
//!
//! This crate contains:
//! - Typed identifiers for requests, buildsets, masters and workers
//! - BuildRequest, Builder and build result domain types
//! - The worker RPC connection trait

pub mod error;
pub mod id;
pub mod request;
pub mod rpc;

pub use error::{Error, Result};
pub use id::{BuildsetId, MasterId, RequestId, WorkerId};
pub use request::{BuildRequest, BuildResult, Builder, LockClaim};
pub use rpc::WorkerConnection;
