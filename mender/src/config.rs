//! Orchestrator configuration (`mender.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;
use crate::error::OrchestratorError;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; a missing file is
/// the all-defaults configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MenderConfig {
    pub paths: PathsConfig,
    pub test: TestConfig,
    pub retry: RetryConfig,
    pub repair: RepairConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory scanned for test artifacts.
    pub tests_dir: PathBuf,
    /// Directory holding the source artifacts the tests exercise.
    pub src_dir: PathBuf,
    /// Durable orchestrator state record.
    pub state_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tests_dir: PathBuf::from("tests"),
            src_dir: PathBuf::from("src"),
            state_path: PathBuf::from(".mender/state.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TestConfig {
    /// Interpreter command the test file path is appended to
    /// (e.g. `["python3"]`).
    pub command: Vec<String>,
    /// Test artifacts are files whose name starts with this prefix; the
    /// source artifact is the same name with the prefix stripped.
    pub test_prefix: String,
    /// Hard wall-clock budget for one test run.
    pub timeout_secs: u64,
    /// Truncate captured test output beyond this many bytes per stream.
    pub output_limit_bytes: usize,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string()],
            test_prefix: "test_".to_string(),
            timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound on test-run attempts per target per cycle.
    pub max_retries: u32,
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    /// Symmetric jitter as a fraction of the capped delay (0.5 = ±50%).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 1.0,
            max_delay_secs: 10.0,
            jitter_fraction: 0.5,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs_f64(self.base_delay_secs),
            max_delay: Duration::from_secs_f64(self.max_delay_secs),
            jitter_fraction: self.jitter_fraction,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepairConfig {
    /// Repair command the failing source file path is appended to; the
    /// bounded error excerpt is piped to its stdin, and exit 0 means the
    /// capability wrote a fix. Empty disables repair.
    pub command: Vec<String>,
    /// Bounded repair attempts per failing target per cycle.
    pub max_attempts: u32,
    /// Truncate failing test output to this many bytes before handing it to
    /// the repair capability.
    pub error_excerpt_bytes: usize,
    /// Hard wall-clock budget for one repair invocation.
    pub timeout_secs: u64,
    /// Truncate captured repair output beyond this many bytes per stream.
    pub output_limit_bytes: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            max_attempts: 2,
            error_excerpt_bytes: 1000,
            timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl MenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.test.command.is_empty() || self.test.command[0].trim().is_empty() {
            return Err(invalid("test.command must be a non-empty array"));
        }
        if self.test.test_prefix.is_empty() {
            return Err(invalid("test.test_prefix must not be empty"));
        }
        if self.test.timeout_secs == 0 {
            return Err(invalid("test.timeout_secs must be > 0"));
        }
        if self.test.output_limit_bytes == 0 {
            return Err(invalid("test.output_limit_bytes must be > 0"));
        }
        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries must be > 0"));
        }
        if !self.retry.base_delay_secs.is_finite() || self.retry.base_delay_secs < 0.0 {
            return Err(invalid("retry.base_delay_secs must be >= 0"));
        }
        if !self.retry.max_delay_secs.is_finite()
            || self.retry.max_delay_secs < self.retry.base_delay_secs
        {
            return Err(invalid("retry.max_delay_secs must be >= retry.base_delay_secs"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(invalid("retry.jitter_fraction must be within [0, 1]"));
        }
        if self.repair.max_attempts == 0 {
            return Err(invalid("repair.max_attempts must be > 0"));
        }
        if self.repair.error_excerpt_bytes == 0 {
            return Err(invalid("repair.error_excerpt_bytes must be > 0"));
        }
        if self.repair.timeout_secs == 0 {
            return Err(invalid("repair.timeout_secs must be > 0"));
        }
        if self.repair.output_limit_bytes == 0 {
            return Err(invalid("repair.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Whether a repair capability is configured at all.
    pub fn repair_enabled(&self) -> bool {
        !self.repair.command.is_empty()
    }
}

fn invalid(msg: &str) -> anyhow::Error {
    OrchestratorError::Configuration(msg.to_string()).into()
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MenderConfig::default()`.
pub fn load_config(path: &Path) -> Result<MenderConfig> {
    if !path.exists() {
        let cfg = MenderConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MenderConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MenderConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, MenderConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mender.toml");
        let mut cfg = MenderConfig::default();
        cfg.repair.command = vec!["fixer".to_string(), "--apply".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_defaults_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mender.toml");
        fs::write(&path, "[retry]\nmax_retries = 5\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.test, TestConfig::default());
    }

    #[test]
    fn zero_retries_is_a_configuration_error() {
        let mut cfg = MenderConfig::default();
        cfg.retry.max_retries = 0;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::Configuration(_))
        ));
    }

    #[test]
    fn zero_repair_attempts_is_a_configuration_error() {
        let mut cfg = MenderConfig::default();
        cfg.repair.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn jitter_outside_unit_interval_is_rejected() {
        let mut cfg = MenderConfig::default();
        cfg.retry.jitter_fraction = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn max_delay_below_base_delay_is_rejected() {
        let mut cfg = MenderConfig::default();
        cfg.retry.base_delay_secs = 5.0;
        cfg.retry.max_delay_secs = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn repair_disabled_when_command_empty() {
        let cfg = MenderConfig::default();
        assert!(!cfg.repair_enabled());
    }
}
