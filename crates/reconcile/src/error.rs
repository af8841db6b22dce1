//! Error taxonomy for a reconciliation run

use crate::types::ResourceKey;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an environment or the whole run.
///
/// Individual action failures are not errors at this level: the executor
/// records them as outcomes and keeps going, and they only surface here as
/// [`Error::ActionsFailed`].
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A source file could not be read or parsed
    #[error("failed to load source {path}: {message}")]
    Source { path: PathBuf, message: String },

    /// Listing the observed inventory failed after retries
    #[error("failed to resolve inventory for {environment}: {source}")]
    Resolve {
        environment: String,
        #[source]
        source: kibanakit::Error,
    },

    /// The desired set declares the same resource twice
    #[error("duplicate desired resource {key}")]
    DuplicateKey { key: ResourceKey },

    /// At least one action in an environment failed
    #[error("{failed} action(s) failed in {environment}")]
    ActionsFailed { environment: String, failed: u64 },

    /// The worker pool could not be created
    #[error("failed to start workers for {environment}: {message}")]
    Executor {
        environment: String,
        message: String,
    },

    /// The run was interrupted
    #[error("run cancelled")]
    Cancelled,

    /// One or more environments failed
    #[error("sync failed: {}", join(.0))]
    Failed(Vec<EnvironmentFailure>),
}

impl Error {
    /// Whether this error reports an interruption rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Why one environment did not converge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentFailure {
    pub environment: String,
    pub reason: String,
}

impl fmt::Display for EnvironmentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.environment, self.reason)
    }
}

fn join(failures: &[EnvironmentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
