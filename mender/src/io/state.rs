//! Durable orchestrator state for recovery across runs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::metrics::Metrics;
use crate::error::OrchestratorError;

/// Current schema version of the on-disk record.
pub const STATE_VERSION: u32 = 1;

/// Persisted bookkeeping for the orchestrator (one record per deployment).
///
/// The record is pretty-printed JSON so diffs stay readable. Fields added in
/// later versions must default when absent (`#[serde(default)]`), so an old
/// record still loads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorState {
    /// Schema version of this record.
    pub version: u32,
    /// Completed cycles; never decreases.
    pub cycle_count: u64,
    /// RFC 3339 timestamp of the most recently started cycle.
    pub last_run: Option<String>,
    /// Repairs that were verified and committed.
    pub total_repairs: u64,
    /// Cycles or targets that failed fatally.
    pub total_errors: u64,
    /// SHA-256 hex digest of the last successfully repaired source file.
    pub code_hash: Option<String>,
    /// Most recent snapshot taken before a repair sequence.
    pub last_backup: Option<PathBuf>,
    pub metrics: Metrics,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cycle_count: 0,
            last_run: None,
            total_repairs: 0,
            total_errors: 0,
            code_hash: None,
            last_backup: None,
            metrics: Metrics::default(),
        }
    }
}

/// Load orchestrator state from disk.
///
/// Never fails: a missing file, unreadable content, unparseable JSON, or a
/// record from a newer schema all yield a fresh default record with a
/// warning, so a corrupted state file can never wedge the orchestrator.
pub fn load_state(path: &Path) -> OrchestratorState {
    if !path.exists() {
        debug!(path = %path.display(), "no prior state, starting fresh");
        return OrchestratorState::default();
    }
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "could not read state, starting fresh");
            return OrchestratorState::default();
        }
    };
    let state: OrchestratorState = match serde_json::from_str(&contents) {
        Ok(state) => state,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "could not parse state, starting fresh");
            return OrchestratorState::default();
        }
    };
    if state.version > STATE_VERSION {
        warn!(
            version = state.version,
            supported = STATE_VERSION,
            "state record is from a newer version, starting fresh"
        );
        return OrchestratorState::default();
    }
    debug!(cycle_count = state.cycle_count, "state loaded");
    state
}

/// Atomically write orchestrator state to disk (temp file + rename).
///
/// A crash mid-write leaves the previous good record intact.
pub fn save_state(path: &Path, state: &OrchestratorState) -> Result<()> {
    debug!(path = %path.display(), cycle_count = state.cycle_count, "writing state");
    let mut buf = serde_json::to_string_pretty(state)
        .map_err(|err| OrchestratorError::StatePersistence {
            path: path.to_path_buf(),
            source: err.into(),
        })?;
    buf.push('\n');
    write_atomic(path, &buf).map_err(|source| {
        OrchestratorError::StatePersistence {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
