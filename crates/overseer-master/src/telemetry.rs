//! Tracing setup for the embedding process.

use tracing_subscriber::EnvFilter;

/// Initialize tracing from the environment, defaulting to `info`.
///
/// Call once at process startup, before constructing the distributor.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
