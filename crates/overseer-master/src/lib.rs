//! Build request distribution and claiming for the Overseer CI master.
//!
//! One master process owns:
//! - a [`registry::WorkerRegistry`] of its connected workers
//! - a [`distributor::Distributor`] that matches pending requests to
//!   workers and claims them atomically against the shared store
//! - a [`notifier::Notifier`] publishing claim/unclaim events on the bus
//! - a [`sweeper`] task that periodically re-evaluates all builders and
//!   reclaims requests orphaned by dead masters
//!
//! Masters coordinate only through the store's compare-and-set claim and
//! the event bus; there is no shared memory between masters.

pub mod claim;
pub mod config;
pub mod distributor;
pub mod matching;
pub mod notifier;
pub mod registry;
pub mod sweeper;
pub mod telemetry;

pub use claim::ClaimManager;
pub use config::MasterConfig;
pub use distributor::Distributor;
pub use matching::{LockSet, MatchingEngine};
pub use notifier::Notifier;
pub use registry::{WorkerInfo, WorkerRegistry};
