//! Test-only scripted doubles for the process and repair seams.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use crate::error::OrchestratorError;
use crate::io::discover::TestTarget;
use crate::io::process::{TestRun, TestRunner};
use crate::repair::RepairCapability;

/// Build a completed run without spawning anything.
pub fn completed_run(passed: bool, output: &str) -> TestRun {
    TestRun {
        passed,
        output: output.to_string(),
        duration: Duration::from_millis(10),
        timed_out: false,
    }
}

/// One scripted runner step.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// The run completes with this result.
    Completes(TestRun),
    /// The process cannot be started at all.
    FailsToSpawn,
}

/// Runner that replays a predetermined sequence of outcomes.
pub struct ScriptedTestRunner {
    script: RefCell<VecDeque<ScriptedRun>>,
}

impl ScriptedTestRunner {
    pub fn new(script: Vec<ScriptedRun>) -> Self {
        Self {
            script: RefCell::new(script.into()),
        }
    }

    /// Steps not yet consumed; lets tests assert nothing extra ran.
    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _target: &TestTarget) -> Result<TestRun> {
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .expect("scripted runner exhausted");
        match step {
            ScriptedRun::Completes(run) => Ok(run),
            ScriptedRun::FailsToSpawn => Err(OrchestratorError::ExecutionInfrastructure {
                command: "scripted".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            }
            .into()),
        }
    }
}

/// One scripted repair-capability step.
#[derive(Debug, Clone)]
pub enum ScriptedRepair {
    /// Write `content` to the source artifact and report success.
    Fix(String),
    /// Report success without touching the file (a lying capability).
    ClaimSuccess,
    /// Report failure.
    Decline,
    /// Error out of the capability.
    Explode,
}

/// Repair capability that replays a predetermined sequence of behaviors and
/// records the excerpts it was handed.
pub struct ScriptedRepairer {
    script: RefCell<VecDeque<ScriptedRepair>>,
    excerpts: RefCell<Vec<String>>,
}

impl ScriptedRepairer {
    pub fn new(script: Vec<ScriptedRepair>) -> Self {
        Self {
            script: RefCell::new(script.into()),
            excerpts: RefCell::new(Vec::new()),
        }
    }

    /// How many times the capability was invoked.
    pub fn calls(&self) -> usize {
        self.excerpts.borrow().len()
    }

    /// The error excerpts handed to each invocation, in order.
    pub fn excerpts(&self) -> Vec<String> {
        self.excerpts.borrow().clone()
    }
}

impl RepairCapability for ScriptedRepairer {
    fn attempt_repair(&self, source: &Path, error_excerpt: &str) -> Result<bool> {
        self.excerpts.borrow_mut().push(error_excerpt.to_string());
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .expect("scripted repairer exhausted");
        match step {
            ScriptedRepair::Fix(content) => {
                fs::write(source, content)?;
                Ok(true)
            }
            ScriptedRepair::ClaimSuccess => Ok(true),
            ScriptedRepair::Decline => Ok(false),
            ScriptedRepair::Explode => {
                Err(OrchestratorError::RepairCapability("scripted explosion".to_string()).into())
            }
        }
    }
}
