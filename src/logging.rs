//! Tracing subscriber setup for binaries and embedders.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{Result, StoreError};

/// Installs a fmt subscriber on stderr filtered by `filter`
/// (for example `"dbx_store=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| StoreError::Config(format!("invalid log filter: {e}")))?,
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| StoreError::Config("logging already initialized".into()))
}
