//! Self-healing test-and-repair orchestrator.
//!
//! Runs a project's test artifacts, routes persistent failures into a
//! repair-verify-rollback workflow, and records recovery state across runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mender::config::{MenderConfig, load_config};
use mender::cycle::{CycleOutcome, Orchestrator};
use mender::exit_codes;
use mender::io::process::ProcessTestRunner;
use mender::io::state::{OrchestratorState, load_state};
use mender::repair::CommandRepairer;

#[derive(Parser)]
#[command(
    name = "mender",
    version,
    about = "Self-healing test-and-repair orchestrator"
)]
struct Cli {
    /// Path to the orchestrator config file.
    #[arg(long, global = true, default_value = "mender.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute exactly one test-and-repair cycle and print a summary.
    Run,
    /// Run cycles on a fixed interval until interrupted.
    Watch {
        /// Seconds to sleep between cycles.
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,
    },
    /// Print the persisted orchestrator state and exit without running.
    State,
}

fn main() {
    mender::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Run => cmd_run(config),
        Command::Watch { interval_secs } => cmd_watch(config, interval_secs),
        Command::State => cmd_state(&config),
    }
}

fn cmd_run(config: MenderConfig) -> Result<i32> {
    let mut orchestrator = build_orchestrator(config);
    let outcome = orchestrator.run_once()?;
    print_cycle(&outcome);
    print_summary(orchestrator.state());
    if outcome.unresolved > 0 || outcome.errors > 0 {
        return Ok(exit_codes::UNRESOLVED);
    }
    Ok(exit_codes::OK)
}

fn cmd_watch(config: MenderConfig, interval_secs: u64) -> Result<i32> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("install interrupt handler")?;

    let mut orchestrator = build_orchestrator(config);
    orchestrator.run_continuous(Duration::from_secs(interval_secs), &shutdown);
    print_summary(orchestrator.state());
    Ok(exit_codes::OK)
}

fn cmd_state(config: &MenderConfig) -> Result<i32> {
    let state = load_state(&config.paths.state_path);
    let payload = serde_json::to_string_pretty(&state).context("serialize state")?;
    println!("{payload}");
    Ok(exit_codes::OK)
}

fn build_orchestrator(config: MenderConfig) -> Orchestrator<ProcessTestRunner, CommandRepairer> {
    let runner = ProcessTestRunner {
        command: config.test.command.clone(),
        timeout: Duration::from_secs(config.test.timeout_secs),
        output_limit_bytes: config.test.output_limit_bytes,
    };
    let repairer = config.repair_enabled().then(|| CommandRepairer {
        command: config.repair.command.clone(),
        timeout: Duration::from_secs(config.repair.timeout_secs),
        output_limit_bytes: config.repair.output_limit_bytes,
    });
    Orchestrator::new(config, runner, repairer)
}

fn print_cycle(outcome: &CycleOutcome) {
    println!(
        "cycle {}: targets={} passed={} repaired={} unresolved={} errors={}",
        outcome.cycle,
        outcome.targets,
        outcome.passed,
        outcome.repaired,
        outcome.unresolved,
        outcome.errors
    );
}

fn print_summary(state: &OrchestratorState) {
    println!("summary: cycles={}", state.cycle_count);
    println!(
        "summary: repairs={} errors={}",
        state.total_repairs, state.total_errors
    );
    println!(
        "summary: test_passes={} test_failures={} repair_successes={} repair_failures={}",
        state.metrics.test_passes,
        state.metrics.test_failures,
        state.metrics.repair_successes,
        state.metrics.repair_failures
    );
    println!("summary: avg_test_secs={:.2}", state.metrics.avg_test_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run() {
        let cli = Cli::parse_from(["mender", "run"]);
        assert!(matches!(cli.command, Command::Run));
        assert_eq!(cli.config, PathBuf::from("mender.toml"));
    }

    #[test]
    fn parse_watch_with_interval() {
        let cli = Cli::parse_from(["mender", "watch", "--interval-secs", "60"]);
        assert!(matches!(
            cli.command,
            Command::Watch { interval_secs: 60 }
        ));
    }

    #[test]
    fn parse_state_with_config_override() {
        let cli = Cli::parse_from(["mender", "--config", "custom.toml", "state"]);
        assert!(matches!(cli.command, Command::State));
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }
}
