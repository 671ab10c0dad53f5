//! Cycle orchestration: discover targets, run them with retries, route
//! failures into the repair workflow, and persist state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::MenderConfig;
use crate::error::OrchestratorError;
use crate::io::discover::{TestTarget, discover_targets};
use crate::io::process::{TestRun, TestRunner};
use crate::io::state::{OrchestratorState, load_state, save_state};
use crate::repair::{RepairCapability, RepairOutcome, RepairPolicy, run_repair};
use crate::retry::with_retries;

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    pub cycle: u64,
    pub targets: usize,
    pub passed: usize,
    pub repaired: usize,
    /// Targets still failing after retries and (if configured) repair.
    pub unresolved: usize,
    /// Targets that failed fatally (could not be executed at all, or left
    /// in an unrestorable state).
    pub errors: usize,
}

enum TargetOutcome {
    Passed,
    Repaired,
    Unresolved,
    Error,
}

/// Drives test targets through retry, repair, and state persistence.
///
/// One instance per state path; concurrent instances against the same state
/// file are unsupported.
pub struct Orchestrator<R: TestRunner, C: RepairCapability> {
    config: MenderConfig,
    runner: R,
    repairer: Option<C>,
    state: OrchestratorState,
}

impl<R: TestRunner, C: RepairCapability> Orchestrator<R, C> {
    /// Load (or default) the persisted state and build an orchestrator.
    ///
    /// `repairer = None` disables the repair workflow; failing targets are
    /// reported unresolved.
    pub fn new(config: MenderConfig, runner: R, repairer: Option<C>) -> Self {
        let state = load_state(&config.paths.state_path);
        Self {
            config,
            runner,
            repairer,
            state,
        }
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn repairer(&self) -> Option<&C> {
        self.repairer.as_ref()
    }

    /// Execute exactly one cycle over all discovered targets.
    ///
    /// Per-target failures are contained here; state is persisted at cycle
    /// end regardless of outcomes (a failed save is warned about and
    /// retried by the next cycle's save).
    #[instrument(skip_all, fields(cycle = self.state.cycle_count + 1))]
    pub fn run_once(&mut self) -> Result<CycleOutcome> {
        self.state.cycle_count += 1;
        self.state.last_run = Some(Utc::now().to_rfc3339());
        info!("starting cycle");

        let targets = discover_targets(
            &self.config.paths.tests_dir,
            &self.config.paths.src_dir,
            &self.config.test.test_prefix,
        )
        .context("discover test targets")?;
        if targets.is_empty() {
            warn!(dir = %self.config.paths.tests_dir.display(), "no test targets found");
        }

        let mut outcome = CycleOutcome {
            cycle: self.state.cycle_count,
            targets: targets.len(),
            ..CycleOutcome::default()
        };
        for target in &targets {
            match self.process_target(target) {
                TargetOutcome::Passed => outcome.passed += 1,
                TargetOutcome::Repaired => outcome.repaired += 1,
                TargetOutcome::Unresolved => outcome.unresolved += 1,
                TargetOutcome::Error => outcome.errors += 1,
            }
        }

        if let Err(err) = save_state(&self.config.paths.state_path, &self.state) {
            warn!(err = %err, "state save failed, next cycle retries");
        }
        info!(
            targets = outcome.targets,
            passed = outcome.passed,
            repaired = outcome.repaired,
            unresolved = outcome.unresolved,
            errors = outcome.errors,
            "cycle complete"
        );
        Ok(outcome)
    }

    /// Run cycles separated by `interval` until `shutdown` is set.
    ///
    /// A failed cycle is logged and counted, never fatal; the inter-cycle
    /// sleep is sliced so an interrupt takes effect promptly. A final save
    /// runs on the way out.
    pub fn run_continuous(&mut self, interval: Duration, shutdown: &AtomicBool) {
        info!(interval_secs = interval.as_secs(), "starting continuous mode");
        while !shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.run_once() {
                error!(err = format!("{err:#}"), "cycle failed");
                self.state.total_errors += 1;
                if let Err(save_err) = save_state(&self.config.paths.state_path, &self.state) {
                    warn!(err = %save_err, "state save failed after cycle error");
                }
            }
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            debug!(secs = interval.as_secs(), "sleeping until next cycle");
            sleep_interruptible(interval, shutdown);
        }
        if let Err(err) = save_state(&self.config.paths.state_path, &self.state) {
            warn!(err = %err, "final state save failed");
        }
        info!(
            cycles = self.state.cycle_count,
            repairs = self.state.total_repairs,
            errors = self.state.total_errors,
            "continuous mode stopped"
        );
    }

    fn process_target(&mut self, target: &TestTarget) -> TargetOutcome {
        info!(target = %target.name, "processing target");
        let policy = self.config.retry.policy();
        let mut completed: Vec<TestRun> = Vec::new();
        let runner = &self.runner;
        let result = with_retries(&policy, &target.name, || {
            let run = runner.run(target)?;
            let passed = run.passed;
            completed.push(run);
            if passed {
                Ok(())
            } else {
                Err(OrchestratorError::TestFailed {
                    target: target.name.clone(),
                }
                .into())
            }
        });

        // Every run that completed counts, retry attempts included.
        for run in &completed {
            self.state.metrics = self.state.metrics.with_test_run(run.passed, run.duration);
        }

        match result {
            Ok(()) => TargetOutcome::Passed,
            Err(err) => match err.downcast_ref::<OrchestratorError>() {
                Some(OrchestratorError::TestFailed { .. }) => {
                    let failing_output = completed
                        .last()
                        .map(|run| run.output.clone())
                        .unwrap_or_default();
                    self.handle_test_failure(target, &failing_output)
                }
                _ => {
                    error!(target = %target.name, err = format!("{err:#}"), "target failed fatally");
                    self.state.total_errors += 1;
                    TargetOutcome::Error
                }
            },
        }
    }

    fn handle_test_failure(&mut self, target: &TestTarget, failing_output: &str) -> TargetOutcome {
        warn!(target = %target.name, "target still failing after retries");
        let Some(repairer) = self.repairer.as_ref() else {
            info!("repair not configured, leaving failure unresolved");
            return TargetOutcome::Unresolved;
        };

        let policy = RepairPolicy {
            max_attempts: self.config.repair.max_attempts,
            error_excerpt_bytes: self.config.repair.error_excerpt_bytes,
        };
        let report = run_repair(repairer, &self.runner, target, failing_output, &policy);

        for run in &report.verification_runs {
            self.state.metrics = self.state.metrics.with_test_run(run.passed, run.duration);
        }

        match report.outcome {
            RepairOutcome::Committed {
                attempts,
                code_hash,
                backup,
            } => {
                info!(target = %target.name, attempts, "repair committed");
                self.state.total_repairs += 1;
                self.state.metrics = self.state.metrics.with_repair_success();
                self.state.code_hash = Some(code_hash);
                self.state.last_backup = Some(backup);
                TargetOutcome::Repaired
            }
            RepairOutcome::RolledBack { attempts, backup } => {
                warn!(target = %target.name, attempts, "repair exhausted, backup restored");
                self.state.metrics = self.state.metrics.with_repair_failure();
                self.state.last_backup = Some(backup);
                TargetOutcome::Unresolved
            }
            RepairOutcome::BackupFailed { error } => {
                error!(
                    target = %target.name,
                    err = format!("{error:#}"),
                    "snapshot failed, repair aborted, failure unresolved"
                );
                TargetOutcome::Unresolved
            }
            RepairOutcome::RestorationFailed { backup, error } => {
                // Loud and distinct: the artifact is stuck in its
                // repair-attempted state with no recovery path.
                error!(
                    target = %target.name,
                    backup = %backup.display(),
                    err = format!("{error:#}"),
                    "RESTORE FAILED, artifact left in repair-attempted state"
                );
                self.state.metrics = self.state.metrics.with_repair_failure();
                self.state.total_errors += 1;
                self.state.last_backup = Some(backup);
                TargetOutcome::Error
            }
            RepairOutcome::SourceMissing => TargetOutcome::Unresolved,
        }
    }
}

fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(250);
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(SLICE));
    }
}
