//! Orchestration error taxonomy.
//!
//! Every failure class the orchestrator distinguishes is represented here.
//! Functions still return `anyhow::Result`; the cycle orchestrator recovers
//! the class with `downcast_ref` at its boundary and routes accordingly.
//! A test run that completes with a nonzero exit is *data*
//! (`TestRun::passed == false`), not an error; only the final
//! retries-exhausted signal travels as [`OrchestratorError::TestFailed`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Invalid retry/attempt bounds or command configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The child process could not be launched at all (missing interpreter,
    /// bad permissions). Distinct from a test failure: there is no test
    /// output to repair against.
    #[error("failed to launch `{command}`: {source}")]
    ExecutionInfrastructure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A retried test target still failed after its final attempt.
    #[error("tests failed for {target}")]
    TestFailed { target: String },

    /// The pre-repair snapshot could not be taken. No repair is attempted
    /// without a safety copy.
    #[error("snapshot of {path} failed: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Restoring the snapshot failed. The artifact is left in its
    /// last-written, repair-attempted state.
    #[error("failed to restore {path} from {backup}: {source}")]
    Restoration {
        path: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The repair capability itself errored. Consumes one bounded attempt.
    #[error("repair capability failed: {0}")]
    RepairCapability(String),

    /// The state record could not be persisted. The cycle continues; the
    /// next cycle retries the save.
    #[error("failed to persist state to {path}: {source}")]
    StatePersistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OrchestratorError {
    /// Whether the retry wrapper may usefully try the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TestFailed { .. } | Self::RepairCapability(_) | Self::StatePersistence { .. } => {
                true
            }
            Self::Configuration(_)
            | Self::ExecutionInfrastructure { .. }
            | Self::Backup { .. }
            | Self::Restoration { .. } => false,
        }
    }
}
