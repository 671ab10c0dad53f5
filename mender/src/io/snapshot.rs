//! Pre-repair snapshots of source artifacts.

use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::OrchestratorError;

/// Immutable backup of a source artifact, taken before a repair sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
}

/// Copy the current source artifact to a timestamped sibling backup.
///
/// Named `{stem}_backup_{timestamp}_{short-id}{ext}` so repeated attempts in
/// the same second never collide. Fails with a `Backup` error when the copy
/// cannot be taken; no repair must proceed without one.
pub fn take_snapshot(source: &Path) -> Result<Snapshot> {
    let backup_path = backup_path_for(source, &generate_timestamp(), &generate_short_id())?;
    fs::copy(source, &backup_path).map_err(|err| OrchestratorError::Backup {
        path: source.to_path_buf(),
        source: err,
    })?;
    info!(backup = %backup_path.display(), "source backed up");
    Ok(Snapshot {
        source_path: source.to_path_buf(),
        backup_path,
    })
}

impl Snapshot {
    /// Overwrite the source artifact with the backup's content, byte for byte.
    ///
    /// A failure here means the artifact is stuck in its repair-attempted
    /// state; the caller must report it loudly.
    pub fn restore(&self) -> Result<()> {
        fs::copy(&self.backup_path, &self.source_path).map_err(|err| {
            OrchestratorError::Restoration {
                path: self.source_path.clone(),
                backup: self.backup_path.clone(),
                source: err,
            }
        })?;
        info!(path = %self.source_path.display(), "backup restored");
        Ok(())
    }
}

/// SHA-256 hex digest of a file's content. Identity check, not security.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn backup_path_for(source: &Path, timestamp: &str, short_id: &str) -> Result<PathBuf> {
    let stem = source
        .file_stem()
        .ok_or_else(|| anyhow!("source path {} has no file name", source.display()))?
        .to_string_lossy();
    let mut name = format!("{stem}_backup_{timestamp}_{short_id}");
    if let Some(ext) = source.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    let backup = match source.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
        _ => PathBuf::from(name),
    };
    debug!(backup = %backup.display(), "computed backup path");
    Ok(backup)
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
