//! Test target discovery by filename convention.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// A discovered test artifact paired with the source artifact it exercises.
///
/// Ephemeral: recomputed each cycle, never persisted. The pairing is
/// one-to-one by construction: `tests/{prefix}{name}` maps to
/// `src/{name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    /// File name of the test artifact (e.g. `test_mesh.py`).
    pub name: String,
    pub test_path: PathBuf,
    pub source_path: PathBuf,
}

/// Scan `tests_dir` for files starting with `prefix` and pair each with its
/// source artifact under `src_dir`.
///
/// Returns targets sorted by name for deterministic cycle ordering. A
/// missing tests directory yields an empty list (the cycle logs the
/// zero-target case itself).
pub fn discover_targets(tests_dir: &Path, src_dir: &Path, prefix: &str) -> Result<Vec<TestTarget>> {
    if !tests_dir.is_dir() {
        debug!(dir = %tests_dir.display(), "tests directory missing, nothing to discover");
        return Ok(Vec::new());
    }

    let mut targets = Vec::new();
    for entry in
        fs::read_dir(tests_dir).with_context(|| format!("read {}", tests_dir.display()))?
    {
        let entry = entry.with_context(|| format!("read entry in {}", tests_dir.display()))?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(source_name) = name.strip_prefix(prefix) else {
            continue;
        };
        if source_name.is_empty() {
            continue;
        }
        targets.push(TestTarget {
            name: name.to_string(),
            test_path: entry.path(),
            source_path: src_dir.join(source_name),
        });
    }
    targets.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(count = targets.len(), "targets discovered");
    Ok(targets)
}
