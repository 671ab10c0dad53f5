//! End-to-end cycle scenarios with scripted test and repair seams.

use std::fs;
use std::path::Path;

use mender::config::MenderConfig;
use mender::cycle::Orchestrator;
use mender::io::snapshot::file_sha256;
use mender::io::state::load_state;
use mender::test_support::{
    ScriptedRepair, ScriptedRepairer, ScriptedRun, ScriptedTestRunner, completed_run,
};

fn config_in(root: &Path) -> MenderConfig {
    let mut config = MenderConfig::default();
    config.paths.tests_dir = root.join("tests");
    config.paths.src_dir = root.join("src");
    config.paths.state_path = root.join(".mender/state.json");
    config.retry.base_delay_secs = 0.0;
    config.retry.max_delay_secs = 0.0;
    config.retry.jitter_fraction = 0.0;
    config
}

fn seed_target(root: &Path, test_name: &str, source_content: &str) {
    fs::create_dir_all(root.join("tests")).expect("mkdir tests");
    fs::create_dir_all(root.join("src")).expect("mkdir src");
    fs::write(root.join("tests").join(test_name), "test body\n").expect("write test");
    let source_name = test_name.strip_prefix("test_").expect("prefix");
    fs::write(root.join("src").join(source_name), source_content).expect("write source");
}

/// A target that always fails, a capability that always claims success, and
/// verification that never passes: the source must come back byte-for-byte
/// and the repair count as one failure.
#[test]
fn lying_repairer_ends_in_byte_identical_rollback() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    let original = "def mesh():\n    return 41\n";
    seed_target(root, "test_mesh.py", original);

    let mut config = config_in(root);
    config.retry.max_retries = 2;
    config.repair.max_attempts = 2;

    let runner = ScriptedTestRunner::new(vec![
        // Retried test runs.
        ScriptedRun::Completes(completed_run(false, "AssertionError: 41 != 42")),
        ScriptedRun::Completes(completed_run(false, "AssertionError: 41 != 42")),
        // Verification runs after each claimed repair.
        ScriptedRun::Completes(completed_run(false, "still broken")),
        ScriptedRun::Completes(completed_run(false, "still broken")),
    ]);
    let repairer = ScriptedRepairer::new(vec![
        ScriptedRepair::Fix("def mesh():\n    return None  # bogus\n".to_string()),
        ScriptedRepair::Fix("def mesh():\n    raise Boom\n".to_string()),
    ]);

    let mut orchestrator = Orchestrator::new(config, runner, Some(repairer));
    let outcome = orchestrator.run_once().expect("cycle");

    assert_eq!(outcome.unresolved, 1);
    assert_eq!(outcome.repaired, 0);
    let source = root.join("src/mesh.py");
    assert_eq!(fs::read(&source).expect("read source"), original.as_bytes());

    let state = orchestrator.state();
    assert_eq!(state.metrics.repair_failures, 1);
    assert_eq!(state.metrics.repair_successes, 0);
    assert_eq!(state.total_repairs, 0);
    // 2 retried runs + 2 verification runs all completed and failed.
    assert_eq!(state.metrics.test_failures, 4);
    assert_eq!(state.metrics.test_passes, 0);
    assert!(state.last_backup.is_some());
}

/// A failing target whose repair verifies on the first attempt commits: the
/// new content stays, the digest matches it, and nothing is restored.
#[test]
fn verified_repair_commits_and_records_the_new_digest() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    seed_target(root, "test_mesh.py", "def mesh():\n    return 41\n");

    let mut config = config_in(root);
    config.retry.max_retries = 1;
    config.repair.max_attempts = 2;

    let fixed = "def mesh():\n    return 42\n";
    let runner = ScriptedTestRunner::new(vec![
        ScriptedRun::Completes(completed_run(false, "AssertionError: 41 != 42")),
        ScriptedRun::Completes(completed_run(true, "ok")),
    ]);
    let repairer = ScriptedRepairer::new(vec![ScriptedRepair::Fix(fixed.to_string())]);

    let mut orchestrator = Orchestrator::new(config, runner, Some(repairer));
    let outcome = orchestrator.run_once().expect("cycle");

    assert_eq!(outcome.repaired, 1);
    assert_eq!(outcome.unresolved, 0);
    let source = root.join("src/mesh.py");
    assert_eq!(fs::read(&source).expect("read source"), fixed.as_bytes());

    let state = orchestrator.state();
    assert_eq!(state.total_repairs, 1);
    assert_eq!(state.metrics.repair_successes, 1);
    assert_eq!(state.metrics.repair_failures, 0);
    assert_eq!(
        state.code_hash.as_deref(),
        Some(file_sha256(&source).expect("hash").as_str())
    );
    // One failing run, one passing verification.
    assert_eq!(state.metrics.test_failures, 1);
    assert_eq!(state.metrics.test_passes, 1);
}

/// Without a configured repair capability, a failing target is simply
/// reported unresolved and the source is never touched.
#[test]
fn failure_without_repairer_stays_unresolved() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    let original = "content\n";
    seed_target(root, "test_mesh.py", original);

    let mut config = config_in(root);
    config.retry.max_retries = 1;

    let runner = ScriptedTestRunner::new(vec![ScriptedRun::Completes(completed_run(
        false, "boom",
    ))]);
    let mut orchestrator =
        Orchestrator::<_, ScriptedRepairer>::new(config, runner, None);
    let outcome = orchestrator.run_once().expect("cycle");

    assert_eq!(outcome.unresolved, 1);
    assert_eq!(
        fs::read(root.join("src/mesh.py")).expect("read"),
        original.as_bytes()
    );
    assert!(orchestrator.state().last_backup.is_none());
}

/// The excerpt handed to the capability is the failing output, bounded.
#[test]
fn repairer_receives_a_bounded_excerpt_of_the_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    seed_target(root, "test_mesh.py", "content\n");

    let mut config = config_in(root);
    config.retry.max_retries = 1;
    config.repair.max_attempts = 1;
    config.repair.error_excerpt_bytes = 16;

    let long_failure = "E".repeat(500);
    let runner = ScriptedTestRunner::new(vec![
        ScriptedRun::Completes(completed_run(false, &long_failure)),
        ScriptedRun::Completes(completed_run(false, &long_failure)),
    ]);
    let repairer = ScriptedRepairer::new(vec![ScriptedRepair::ClaimSuccess]);

    let mut orchestrator = Orchestrator::new(config, runner, Some(repairer));
    orchestrator.run_once().expect("cycle");

    let excerpts = orchestrator_excerpts(&orchestrator);
    assert_eq!(excerpts.len(), 1);
    assert_eq!(excerpts[0], "E".repeat(16));
}

fn orchestrator_excerpts(
    orchestrator: &Orchestrator<ScriptedTestRunner, ScriptedRepairer>,
) -> Vec<String> {
    // The scripted repairer records every excerpt it was handed.
    orchestrator
        .repairer()
        .expect("repairer configured")
        .excerpts()
}

/// Pass/fail counts always equal the number of completed supervised runs,
/// with retry attempts and verification runs each counted once.
#[test]
fn metrics_stay_consistent_across_cycles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    seed_target(root, "test_mesh.py", "content\n");

    let mut config = config_in(root);
    config.retry.max_retries = 3;
    config.repair.max_attempts = 1;

    let runner = ScriptedTestRunner::new(vec![
        // Cycle 1: fails twice, passes on the third attempt.
        ScriptedRun::Completes(completed_run(false, "flaky")),
        ScriptedRun::Completes(completed_run(false, "flaky")),
        ScriptedRun::Completes(completed_run(true, "ok")),
        // Cycle 2: passes immediately.
        ScriptedRun::Completes(completed_run(true, "ok")),
    ]);
    let repairer = ScriptedRepairer::new(Vec::new());

    let mut orchestrator = Orchestrator::new(config.clone(), runner, Some(repairer));
    orchestrator.run_once().expect("cycle 1");
    orchestrator.run_once().expect("cycle 2");

    let state = orchestrator.state();
    assert_eq!(state.metrics.completed_runs(), 4);
    assert_eq!(state.metrics.test_passes, 2);
    assert_eq!(state.metrics.test_failures, 2);
    assert_eq!(state.cycle_count, 2);

    // What the orchestrator holds is what the state file holds.
    assert_eq!(&load_state(&config.paths.state_path), state);
}
