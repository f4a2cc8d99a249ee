//! Broker configuration parsing and defaults.
//!
//! Configuration lives in a TOML file with four sections: `workspace`
//! (root and read/write limits), `execution` (command allowlist and shell
//! settings), `security` (approval toggles consumed by outer surfaces), and
//! `agent` (the downstream agent process launch line). A missing file yields
//! the built-in defaults so the broker can run with zero setup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Workspace confinement settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct WorkspaceConfig {
    /// Workspace root applied before any `session/new` supplies one.
    /// Empty means "no workspace set" until a session provides a cwd.
    pub default_root: PathBuf,
    /// Glob patterns (matched against basename and full path) that may never
    /// be read or written.
    pub blocked_paths: Vec<String>,
    /// Largest file the fs primitive will read.
    pub max_file_size_bytes: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            default_root: PathBuf::new(),
            blocked_paths: vec![
                ".env".into(),
                "*.pem".into(),
                "*.key".into(),
                "**/node_modules/**".into(),
                "**/.git/objects/**".into(),
            ],
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// A single allowlisted command template.
///
/// `template` is a space-separated token prefix (e.g. `python -m pytest`);
/// a request matches when its `[command, args...]` tokens start with the
/// template tokens. Remaining tokens are "extra" arguments and are only
/// accepted when `allow_args` is set, bounded by `max_args` (0 = unbounded).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CommandSpec {
    pub id: String,
    pub template: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub allow_args: bool,
    #[serde(default)]
    pub max_args: usize,
    /// Extra `KEY=VALUE` pairs appended to the child environment.
    #[serde(default)]
    pub env: Vec<String>,
}

/// Command execution settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ExecutionConfig {
    /// Master switch for `terminal/*`; when false every create is rejected.
    pub enabled: bool,
    /// Default command timeout for outer tool surfaces.
    pub timeout_ms: u64,
    /// Shell used to run templated commands (`auto`, `sh`, `powershell`, `cmd`).
    pub shell: String,
    /// Cap on captured terminal output.
    pub max_output_bytes: usize,
    /// User-defined allowlist entries appended after the built-ins.
    pub custom_commands: Vec<CommandSpec>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 30_000,
            shell: "auto".into(),
            max_output_bytes: 1024 * 1024,
            custom_commands: Vec::new(),
        }
    }
}

/// Security toggles consumed by approval-gating surfaces.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SecurityConfig {
    pub require_approval_for_writes: bool,
    pub require_approval_for_exec: bool,
    pub redact_secrets: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_approval_for_writes: true,
            require_approval_for_exec: true,
            redact_secrets: true,
        }
    }
}

/// Downstream agent launch settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct AgentConfig {
    /// Agent binary; `session/new` fails while this is empty.
    pub command: String,
    pub args: Vec<String>,
    /// Extra `KEY=VALUE` pairs appended to the inherited environment.
    pub env: Vec<String>,
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub execution: ExecutionConfig,
    pub security: SecurityConfig,
    pub agent: AgentConfig,
}

impl Config {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be read or
    /// parsed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(AppError::Config(format!(
                "cannot read config file '{}': {err}",
                path.display()
            ))),
        }
    }

    /// Shell used for templated command execution, resolving `auto` per OS.
    #[must_use]
    pub fn shell(&self) -> &str {
        match self.execution.shell.as_str() {
            "auto" | "" => {
                if cfg!(windows) {
                    "powershell"
                } else {
                    "sh"
                }
            }
            other => other,
        }
    }
}

/// Built-in command allowlist, ahead of any `execution.custom_commands`.
#[must_use]
pub fn default_commands() -> Vec<CommandSpec> {
    if cfg!(windows) {
        default_windows_commands()
    } else {
        default_unix_commands()
    }
}

fn default_unix_commands() -> Vec<CommandSpec> {
    [
        ("pytest", "python -m pytest", "Run Python tests with pytest", "test", true, 20),
        ("npm_test", "npm test", "Run npm tests", "test", true, 10),
        ("go_test", "go test ./...", "Run Go tests", "test", true, 10),
        ("cargo_test", "cargo test", "Run Rust tests", "test", true, 10),
        ("ruff", "ruff check", "Run Ruff Python linter", "lint", true, 10),
        ("eslint", "npx eslint", "Run ESLint", "lint", true, 10),
        ("golint", "golangci-lint run", "Run Go linter", "lint", true, 10),
        ("prettier", "npx prettier --write", "Format with Prettier", "format", true, 20),
        ("black", "black", "Format Python with Black", "format", true, 20),
        ("gofmt", "go fmt ./...", "Format Go code", "format", true, 5),
        ("npm_install", "npm install", "Install npm dependencies", "package", false, 0),
        ("pip_install", "pip install -r requirements.txt", "Install Python dependencies", "package", false, 0),
        ("go_mod_tidy", "go mod tidy", "Tidy Go modules", "package", false, 0),
    ]
    .into_iter()
    .map(command_spec)
    .collect()
}

fn default_windows_commands() -> Vec<CommandSpec> {
    [
        ("pytest", "python -m pytest", "Run Python tests with pytest", "test", true, 20),
        ("npm_test", "npm test", "Run npm tests", "test", true, 10),
        ("go_test", "go test ./...", "Run Go tests", "test", true, 10),
        ("cargo_test", "cargo test", "Run Rust tests", "test", true, 10),
        ("dotnet_test", "dotnet test", "Run .NET tests", "test", true, 10),
        ("eslint", "npx eslint", "Run ESLint", "lint", true, 10),
        ("prettier", "npx prettier --write", "Format with Prettier", "format", true, 20),
        ("npm_install", "npm install", "Install npm dependencies", "package", false, 0),
        ("pip_install", "pip install -r requirements.txt", "Install Python dependencies", "package", false, 0),
        ("nuget_restore", "nuget restore", "Restore NuGet packages", "package", true, 5),
    ]
    .into_iter()
    .map(command_spec)
    .collect()
}

fn command_spec(
    (id, template, description, category, allow_args, max_args): (
        &str,
        &str,
        &str,
        &str,
        bool,
        usize,
    ),
) -> CommandSpec {
    CommandSpec {
        id: id.into(),
        template: template.into(),
        description: description.into(),
        category: category.into(),
        allow_args,
        max_args,
        env: Vec::new(),
    }
}
