//! Repair-verify-rollback workflow for a failing test target.
//!
//! The safety invariant: a repair sequence must never end with the source
//! artifact in a state worse than it started, except when restoring the
//! snapshot itself fails, and that case is reported loudly, never silently.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::error::OrchestratorError;
use crate::io::discover::TestTarget;
use crate::io::process::{TestRun, TestRunner, run_supervised};
use crate::io::snapshot::{file_sha256, take_snapshot};

/// The one capability the orchestrator requires from a repair mechanism.
///
/// The orchestrator supplies the failing source path and a bounded excerpt
/// of the test output, and only observes whether the capability reports
/// that it wrote a fix. How the fix is produced is not its concern.
pub trait RepairCapability {
    fn attempt_repair(&self, source: &Path, error_excerpt: &str) -> Result<bool>;
}

/// Repair capability that shells out to an external command.
///
/// The source file path is appended to the configured command and the error
/// excerpt is piped to stdin; exit code 0 means the capability wrote a fix.
#[derive(Debug, Clone)]
pub struct CommandRepairer {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl RepairCapability for CommandRepairer {
    #[instrument(skip_all, fields(source = %source.display()))]
    fn attempt_repair(&self, source: &Path, error_excerpt: &str) -> Result<bool> {
        let mut argv = self.command.clone();
        argv.push(source.display().to_string());
        let workdir = match source.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let run = run_supervised(
            &argv,
            workdir,
            Some(error_excerpt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|err| OrchestratorError::RepairCapability(format!("{err:#}")))?;
        if !run.passed {
            warn!(timed_out = run.timed_out, "repair command reported failure");
        }
        Ok(run.passed)
    }
}

/// Bounds for one repair sequence.
#[derive(Debug, Clone)]
pub struct RepairPolicy {
    pub max_attempts: u32,
    pub error_excerpt_bytes: usize,
}

/// Terminal result of one repair sequence.
#[derive(Debug)]
pub enum RepairOutcome {
    /// A repair was written and verified; the snapshot is kept only as a
    /// historical reference.
    Committed {
        attempts: u32,
        code_hash: String,
        backup: PathBuf,
    },
    /// Attempts exhausted; the source artifact was restored byte-for-byte.
    RolledBack { attempts: u32, backup: PathBuf },
    /// The snapshot could not be taken; no repair was attempted.
    BackupFailed { error: anyhow::Error },
    /// Restoring the snapshot failed; the artifact is left in its
    /// last-written, repair-attempted state.
    RestorationFailed {
        backup: PathBuf,
        error: anyhow::Error,
    },
    /// The naming convention points at a source artifact that does not
    /// exist; nothing to repair.
    SourceMissing,
}

/// Summary of one repair sequence.
#[derive(Debug)]
pub struct RepairReport {
    pub outcome: RepairOutcome,
    /// Verification runs that completed, in order. The caller folds these
    /// into the pass/fail metrics like any other supervised run.
    pub verification_runs: Vec<TestRun>,
}

/// Drive one failing target through snapshot → repair → verify → commit or
/// rollback.
///
/// Verification is a single supervised run per attempt, no retry wrapper. A
/// capability error consumes one attempt rather than aborting the sequence;
/// so does a verification run that could not be started (the restore still
/// happens on exhaustion either way).
#[instrument(skip_all, fields(target = %target.name))]
pub fn run_repair<C: RepairCapability, R: TestRunner>(
    capability: &C,
    runner: &R,
    target: &TestTarget,
    failing_output: &str,
    policy: &RepairPolicy,
) -> RepairReport {
    let mut verification_runs = Vec::new();

    if !target.source_path.exists() {
        warn!(source = %target.source_path.display(), "source artifact not found, skipping repair");
        return RepairReport {
            outcome: RepairOutcome::SourceMissing,
            verification_runs,
        };
    }

    let snapshot = match take_snapshot(&target.source_path) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            return RepairReport {
                outcome: RepairOutcome::BackupFailed { error },
                verification_runs,
            };
        }
    };

    let excerpt = truncate_excerpt(failing_output, policy.error_excerpt_bytes);
    for attempt in 1..=policy.max_attempts {
        info!(attempt, max_attempts = policy.max_attempts, "repair attempt");
        match capability.attempt_repair(&target.source_path, excerpt) {
            Ok(true) => match runner.run(target) {
                Ok(run) => {
                    let passed = run.passed;
                    verification_runs.push(run);
                    if passed {
                        info!(attempt, "repair verified");
                        match file_sha256(&target.source_path) {
                            Ok(code_hash) => {
                                return RepairReport {
                                    outcome: RepairOutcome::Committed {
                                        attempts: attempt,
                                        code_hash,
                                        backup: snapshot.backup_path.clone(),
                                    },
                                    verification_runs,
                                };
                            }
                            Err(err) => {
                                // The repair is verified; a failed digest is
                                // bookkeeping, not a reason to roll back.
                                warn!(err = %err, "could not hash repaired source");
                                return RepairReport {
                                    outcome: RepairOutcome::Committed {
                                        attempts: attempt,
                                        code_hash: String::new(),
                                        backup: snapshot.backup_path.clone(),
                                    },
                                    verification_runs,
                                };
                            }
                        }
                    }
                    warn!(attempt, "repair did not fix tests");
                }
                Err(err) => {
                    warn!(attempt, err = %err, "verification run could not be started");
                }
            },
            Ok(false) => {
                warn!(attempt, "repair capability reported failure");
            }
            Err(err) => {
                warn!(attempt, err = %err, "repair capability errored, counting as failed attempt");
            }
        }
    }

    warn!(
        max_attempts = policy.max_attempts,
        "all repair attempts failed, restoring backup"
    );
    match snapshot.restore() {
        Ok(()) => RepairReport {
            outcome: RepairOutcome::RolledBack {
                attempts: policy.max_attempts,
                backup: snapshot.backup_path,
            },
            verification_runs,
        },
        Err(error) => RepairReport {
            outcome: RepairOutcome::RestorationFailed {
                backup: snapshot.backup_path,
                error,
            },
            verification_runs,
        },
    }
}

/// Bound the failing output handed to the repair capability, respecting
/// UTF-8 boundaries.
fn truncate_excerpt(output: &str, limit: usize) -> &str {
    if output.len() <= limit {
        return output;
    }
    let mut end = limit;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    &output[..end]
}
