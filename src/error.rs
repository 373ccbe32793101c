use thiserror::Error;

use crate::core::{DepError, EnvError, LoadError, SignalError, StartError, StopError, UnloadError, WakeError};

/// Crate-level convenience error.
///
/// Not a "god error": a thin wrapper over the per-concern errors, plus the
/// config I/O cases that have no narrower home.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Stop(#[from] StopError),

    #[error(transparent)]
    Wake(#[from] WakeError),

    #[error(transparent)]
    Dep(#[from] DepError),

    #[error(transparent)]
    Unload(#[from] UnloadError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("failed to read or write config")]
    ConfigIo(#[source] std::io::Error),

    #[error("failed to parse config")]
    ConfigParse(#[source] serde_json::Error),
}
