//! Engine configuration stored under `.coder/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::model::Provider;
use crate::tools::{CodeRunSettings, ToolSettings};

/// Engine directory under the sandbox root. Tools may not touch it.
pub const CONFIG_DIR: &str = ".coder";

/// Config location relative to the sandbox root.
pub const CONFIG_RELATIVE_PATH: &str = ".coder/config.toml";

/// Engine configuration (TOML).
///
/// Missing fields fall back to defaults tuned for a local Python project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoderConfig {
    /// Maximum number of dispatched tool-calling turns.
    pub step_budget: u32,

    /// Wall-clock budget for a whole session in seconds.
    pub session_timeout_secs: u64,

    /// Captured stdout/stderr beyond this many bytes is dropped.
    pub output_limit_bytes: usize,

    /// Lift `<tool_call>` blocks out of plain assistant text.
    pub inline_tool_calls: bool,

    pub model: ModelConfig,
    pub sandbox: SandboxConfig,
    pub code_run: CodeRunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: Provider,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding a bearer token, if the server wants one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            api_key_env: None,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Programs `shell_run` may start, matched exactly against the first token.
    pub allowed_commands: Vec<String>,
    pub per_call_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_commands: [
                "python", "python3", "pytest", "pip", "ls", "cat", "echo", "mkdir", "rm", "touch",
                "git",
            ]
            .map(str::to_string)
            .to_vec(),
            per_call_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodeRunConfig {
    /// Test suite command, run in the sandbox root.
    pub test_command: Vec<String>,
    /// Interpreter for snippets; the snippet file path is appended.
    pub snippet_command: Vec<String>,
    pub snippet_extension: String,
}

impl Default for CodeRunConfig {
    fn default() -> Self {
        Self {
            test_command: ["python3", "-m", "pytest", "-q"].map(str::to_string).to_vec(),
            snippet_command: ["python3", "-I"].map(str::to_string).to_vec(),
            snippet_extension: "py".to_string(),
        }
    }
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            step_budget: 25,
            session_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            inline_tool_calls: false,
            model: ModelConfig::default(),
            sandbox: SandboxConfig::default(),
            code_run: CodeRunConfig::default(),
        }
    }
}

impl CoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_timeout_secs == 0 {
            return Err(anyhow!("session_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.model.base_url.trim().is_empty() {
            return Err(anyhow!("model.base_url must not be empty"));
        }
        if self.model.model.trim().is_empty() {
            return Err(anyhow!("model.model must not be empty"));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(anyhow!("model.request_timeout_secs must be > 0"));
        }
        if self.sandbox.per_call_timeout_secs == 0 {
            return Err(anyhow!("sandbox.per_call_timeout_secs must be > 0"));
        }
        if self
            .sandbox
            .allowed_commands
            .iter()
            .any(|cmd| cmd.trim().is_empty() || cmd.contains(char::is_whitespace))
        {
            return Err(anyhow!(
                "sandbox.allowed_commands entries must be single program names"
            ));
        }
        if self.code_run.test_command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("code_run.test_command must be a non-empty array"));
        }
        if self.code_run.snippet_command.first().is_none_or(|p| p.trim().is_empty()) {
            return Err(anyhow!("code_run.snippet_command must be a non-empty array"));
        }
        if self.code_run.snippet_extension.contains(['/', '.']) {
            return Err(anyhow!("code_run.snippet_extension must be a bare extension"));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.model.request_timeout_secs)
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.per_call_timeout_secs)
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            output_limit_bytes: self.output_limit_bytes,
            code_run: CodeRunSettings {
                test_command: self.code_run.test_command.clone(),
                snippet_command: self.code_run.snippet_command.clone(),
                snippet_extension: self.code_run.snippet_extension.clone(),
            },
        }
    }

    /// Bearer token from the configured environment variable, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        let var = self.model.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|key| !key.trim().is_empty())
    }
}

/// Default config path for a sandbox root.
pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_RELATIVE_PATH)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CoderConfig::default()`.
pub fn load_config(path: &Path) -> Result<CoderConfig> {
    if !path.exists() {
        let cfg = CoderConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CoderConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CoderConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
