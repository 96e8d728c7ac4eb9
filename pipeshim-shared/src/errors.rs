//! Error types shared by the shim I/O core and its fixtures.
//!
//! Errors are grouped by the phase that produces them:
//! - setup ([`ShimError::OpenTimeout`], [`ShimError::OpenFailed`]): fatal to
//!   the process start, surfaced once from `open_io`
//! - console handshake ([`ShimError::Console`]): terminal mode only
//! - termination ([`ShimError::TerminationFailed`]): surfaced from `kill_all`
//!
//! Relay errors have no variant: a broken stream ends as a typed relay
//! outcome and never reaches a caller.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the shim I/O core.
#[derive(Debug, Error)]
pub enum ShimError {
    /// An endpoint did not open before the setup deadline.
    #[error("opening {} timed out after {timeout:?}", path.display())]
    OpenTimeout { path: PathBuf, timeout: Duration },

    /// An endpoint could not be opened at all.
    #[error("opening {} failed: {source}", path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The console socket handshake failed.
    #[error("console: {0}")]
    Console(String),

    /// The runtime's kill-all invocation failed.
    ///
    /// `output` carries the combined stdout/stderr of the invocation.
    #[error("{output}: {reason}")]
    TerminationFailed { output: String, reason: String },

    /// Operation is not valid in the current I/O state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration rejected by validation.
    #[error("invalid config: {0}")]
    Config(String),

    /// Generic IO error (pipe creation, fd duplication).
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Result alias used throughout the shim.
pub type ShimResult<T> = Result<T, ShimError>;

impl ShimError {
    /// Create an open failure for `path`.
    pub fn open_failed(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::OpenFailed {
            path: path.into(),
            source,
        }
    }

    /// Create an open timeout for `path`.
    pub fn open_timeout(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::OpenTimeout {
            path: path.into(),
            timeout,
        }
    }

    /// True for errors raised while opening endpoints during setup.
    pub fn is_open_error(&self) -> bool {
        matches!(self, Self::OpenTimeout { .. } | Self::OpenFailed { .. })
    }
}
