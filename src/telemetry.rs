//! Tracing bootstrap.
//!
//! The supervisor embedding this crate decides where logs go; this helper
//! covers the common case of stderr logging filtered by `WARDEN_LOG`
//! (falling back to `RUST_LOG`, then "info").

use tracing_subscriber::{fmt, EnvFilter};

const FILTER_ENV: &str = "WARDEN_LOG";

/// Install a stderr subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
