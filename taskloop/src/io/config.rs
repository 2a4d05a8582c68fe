//! Loop configuration stored in `taskloop.toml`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::budget::{DEFAULT_MAX_GLOBAL_STEPS, DEFAULT_MAX_STEPS_PER_TASK};

pub const DEFAULT_CONFIG_FILE: &str = "taskloop.toml";

/// Loop configuration (TOML).
///
/// Missing fields default to sensible values so a config only needs to list
/// what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Hard cap on executed actions for a whole run.
    pub max_global_steps: u32,

    /// Cap on executed actions for a single task selection.
    pub max_steps_per_task: u32,

    /// Upper bound on any single oracle call.
    pub oracle_timeout_secs: u64,

    /// Upper bound on any single action invocation.
    pub action_timeout_secs: u64,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Draw the single-line progress indicator on stdout.
    pub progress: bool,

    /// Number of memory entries retrieved as planner context.
    pub memory_limit: usize,

    /// Directory for run records. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_dir: Option<PathBuf>,

    pub oracle: OracleConfig,

    pub actions: Vec<ActionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that answers oracle prompts (prompt on stdin, JSON on stdout).
    pub command: Vec<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
        }
    }
}

/// An action backed by an external command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Command to spawn; the JSON arguments are written to its stdin.
    pub command: Vec<String>,
    /// JSON schema for the arguments.
    #[serde(default = "empty_object_schema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_global_steps: DEFAULT_MAX_GLOBAL_STEPS,
            max_steps_per_task: DEFAULT_MAX_STEPS_PER_TASK,
            oracle_timeout_secs: 120,
            action_timeout_secs: 300,
            output_limit_bytes: 100_000,
            progress: true,
            memory_limit: 5,
            record_dir: None,
            oracle: OracleConfig::default(),
            actions: Vec::new(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_global_steps == 0 {
            return Err(anyhow!("max_global_steps must be > 0"));
        }
        if self.max_steps_per_task == 0 {
            return Err(anyhow!("max_steps_per_task must be > 0"));
        }
        if self.oracle_timeout_secs == 0 {
            return Err(anyhow!("oracle_timeout_secs must be > 0"));
        }
        if self.action_timeout_secs == 0 {
            return Err(anyhow!("action_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty() {
            return Err(anyhow!("oracle.command must be a non-empty array"));
        }
        let mut seen = HashSet::new();
        for action in &self.actions {
            if action.name.trim().is_empty() {
                return Err(anyhow!("action name must not be blank"));
            }
            if !seen.insert(action.name.as_str()) {
                return Err(anyhow!("duplicate action name '{}'", action.name));
            }
            if action.command.is_empty() || action.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "action '{}' command must be a non-empty array",
                    action.name
                ));
            }
            if !action.parameters.is_object() {
                return Err(anyhow!(
                    "action '{}' parameters must be a JSON schema object",
                    action.name
                ));
            }
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
