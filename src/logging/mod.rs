//! Logging initialization with a reloadable filter.
//!
//! The subscriber is installed once at process start with a provisional
//! level; once configuration is loaded the filter is swapped via
//! `tracing_subscriber::reload`.

use tracing_subscriber::{
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::{Error, Result};

/// Default log filter directive used before configuration is loaded.
pub const DEFAULT_LOG_FILTER: &str = "gostwriter=info,sqlx=warn";

/// Handle for swapping the active filter at runtime.
pub type FilterHandle = Handle<EnvFilter, Registry>;

/// Install the global subscriber with the provisional filter.
///
/// `RUST_LOG` overrides the built-in default. Returns the reload handle used
/// by [`apply_level`] once the configured level is known.
pub fn init() -> FilterHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    handle
}

/// Replace the active filter with one derived from the configured level.
pub fn apply_level(handle: &FilterHandle, level: &str) -> Result<()> {
    let directive = format!("gostwriter={level},sqlx=warn");
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| Error::config(format!("invalid log level {level:?}: {e}")))?;
    handle
        .reload(filter)
        .map_err(|e| Error::Other(format!("failed to reload log filter: {e}")))?;
    tracing::debug!(%directive, "log filter updated");
    Ok(())
}
