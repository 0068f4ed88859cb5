//! Sandbox configuration stored as TOML (e.g. `scriptbox.toml`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::validator::ValidatorLimits;

/// Minimum heap an engine is allowed to start with.
pub const MIN_MEMORY_LIMIT_BYTES: usize = 1024 * 1024;

/// Sandbox configuration (TOML).
///
/// Missing fields default to values suitable for short rule-patch scripts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock bound per evaluation. On expiry the whole session is
    /// disposed. Unset means evaluations may run indefinitely.
    pub eval_timeout_ms: Option<u64>,

    pub engine: EngineConfig,

    pub validator: ValidatorLimits,
}

/// Limits applied to the embedded interpreter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Heap limit for the interpreter runtime.
    pub memory_limit_bytes: usize,

    /// Native stack budget for script execution.
    pub max_stack_bytes: usize,

    /// Promise jobs drained after a program finishes before the evaluation
    /// is treated as runaway.
    pub max_pending_jobs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 64 * 1024 * 1024,
            max_stack_bytes: 512 * 1024,
            max_pending_jobs: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_bytes < MIN_MEMORY_LIMIT_BYTES {
            return Err(anyhow!(
                "engine.memory_limit_bytes must be >= {MIN_MEMORY_LIMIT_BYTES}"
            ));
        }
        if self.max_stack_bytes == 0 {
            return Err(anyhow!("engine.max_stack_bytes must be > 0"));
        }
        if self.max_pending_jobs == 0 {
            return Err(anyhow!("engine.max_pending_jobs must be > 0"));
        }
        Ok(())
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.eval_timeout_ms == Some(0) {
            return Err(anyhow!("eval_timeout_ms must be > 0 when set"));
        }
        self.engine.validate()?;
        if self.validator.max_source_bytes == 0 {
            return Err(anyhow!("validator.max_source_bytes must be > 0"));
        }
        if self.validator.max_nesting_depth == 0 {
            return Err(anyhow!("validator.max_nesting_depth must be > 0"));
        }
        Ok(())
    }

    pub fn eval_timeout(&self) -> Option<Duration> {
        self.eval_timeout_ms.map(Duration::from_millis)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SandboxConfig::default()`.
pub fn load_config(path: &Path) -> Result<SandboxConfig> {
    if !path.exists() {
        let cfg = SandboxConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SandboxConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write `cfg` as TOML to `path`.
///
/// The file is staged next to its destination and renamed into place, so a
/// reader never observes a half-written config. Refuses to replace an
/// existing file unless `overwrite` is set.
pub fn write_config(path: &Path, cfg: &SandboxConfig, overwrite: bool) -> Result<()> {
    cfg.validate()?;
    if path.exists() && !overwrite {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    let rendered = toml::to_string_pretty(cfg).context("serialize config toml")?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("config path has no file name: {}", path.display()))?;
    let staging = dir.join(format!(".{}.partial", file_name.to_string_lossy()));
    fs::write(&staging, format!("{rendered}\n"))
        .with_context(|| format!("stage config {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("install config {}", path.display()))?;
    Ok(())
}
