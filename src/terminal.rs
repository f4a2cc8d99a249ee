//! Allowlisted command execution with capped output capture.
//!
//! Each session owns a [`TerminalManager`]. A terminal is one spawned shell
//! command: its stdout and stderr stream into a single [`CappedBuffer`], a
//! supervisor task records the exit status and fires a done signal, and the
//! entry stays addressable until released. Commands never reach the shell
//! unless they match an allowlist template, and extra arguments are rejected
//! when they contain shell metacharacters, because the matched template plus
//! arguments is ultimately handed to `sh -c` as one string.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{default_commands, CommandSpec, Config};
use crate::workspace::WorkspaceGuard;
use crate::{AppError, Result};

/// Fallback output cap when neither config nor caller supplies one: 1 MiB.
const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

// ── Capped buffer ────────────────────────────────────────────────────────────

/// Byte buffer that keeps only the most recent `limit` bytes.
///
/// Appends that would exceed the limit drop the oldest bytes and set the
/// truncated flag. A snapshot is always a suffix of everything written.
pub struct CappedBuffer {
    inner: Mutex<CappedInner>,
}

struct CappedInner {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(CappedInner {
                buf: Vec::new(),
                limit,
                truncated: false,
            }),
        }
    }

    /// Append `chunk`, evicting the oldest bytes past the limit.
    pub fn write(&self, chunk: &[u8]) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.buf.extend_from_slice(chunk);
        if inner.limit > 0 && inner.buf.len() > inner.limit {
            let over = inner.buf.len() - inner.limit;
            inner.buf.drain(..over);
            inner.truncated = true;
        }
    }

    /// Copy out the current contents and the truncated flag.
    #[must_use]
    pub fn snapshot(&self) -> (Vec<u8>, bool) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        (inner.buf.clone(), inner.truncated)
    }
}

// ── Exit status ──────────────────────────────────────────────────────────────

/// Exit status of a finished terminal, in ACP wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitStatusInfo {
    /// Process exit code; `-1` when the process was terminated by a signal.
    pub exit_code: Option<i64>,
    /// Name of the terminating signal, when there was one.
    pub signal: Option<String>,
}

fn exit_info(status: &std::process::ExitStatus) -> ExitStatusInfo {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return ExitStatusInfo {
                exit_code: Some(-1),
                signal: Some(signal_name(sig)),
            };
        }
    }
    ExitStatusInfo {
        exit_code: status.code().map(i64::from).or(Some(-1)),
        signal: None,
    }
}

#[cfg(unix)]
fn signal_name(sig: i32) -> String {
    match sig {
        1 => "SIGHUP".into(),
        2 => "SIGINT".into(),
        3 => "SIGQUIT".into(),
        6 => "SIGABRT".into(),
        9 => "SIGKILL".into(),
        13 => "SIGPIPE".into(),
        14 => "SIGALRM".into(),
        15 => "SIGTERM".into(),
        other => format!("signal {other}"),
    }
}

// ── Terminal handle ──────────────────────────────────────────────────────────

struct TerminalHandle {
    id: String,
    /// Fired by `kill`/`release`; the supervisor reacts by killing the child.
    kill: CancellationToken,
    /// Fired exactly once by the supervisor after the exit status is recorded.
    done: CancellationToken,
    output: Arc<CappedBuffer>,
    exit: Mutex<Option<ExitStatusInfo>>,
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Per-session registry of running and finished terminals.
pub struct TerminalManager {
    config: Arc<Config>,
    guard: Arc<WorkspaceGuard>,
    commands: Vec<CommandSpec>,
    terminals: Mutex<HashMap<String, Arc<TerminalHandle>>>,
    next_id: AtomicU64,
}

impl TerminalManager {
    /// Build a manager whose allowlist is the built-in defaults followed by
    /// `execution.custom_commands`.
    #[must_use]
    pub fn new(config: Arc<Config>, guard: Arc<WorkspaceGuard>) -> Self {
        let mut commands = default_commands();
        commands.extend(config.execution.custom_commands.iter().cloned());
        Self {
            config,
            guard,
            commands,
            terminals: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Match, sanitize, and spawn a command; returns the new terminal id.
    ///
    /// The working directory defaults to the workspace root and must resolve
    /// through the guard even when already absolute. The output cap is the
    /// smaller of `execution.max_output_bytes` and a positive
    /// `output_byte_limit`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Exec`] when execution is disabled, the command is
    /// not allowlisted, an argument carries shell metacharacters, the cwd is
    /// invalid, or the process fails to start.
    pub fn create(
        &self,
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        output_byte_limit: usize,
    ) -> Result<String> {
        if !self.config.execution.enabled {
            return Err(AppError::Exec("terminal execution disabled".into()));
        }

        let (spec, extra) = match_allowlist(&self.commands, command, args)?;
        for arg in &extra {
            if contains_shell_meta(arg) {
                return Err(AppError::Exec(format!(
                    "argument {arg:?} contains disallowed characters"
                )));
            }
        }

        let mut cmdline = spec.template.clone();
        if !extra.is_empty() {
            cmdline.push(' ');
            cmdline.push_str(&extra.join(" "));
        }

        let cwd: PathBuf = match cwd {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => self
                .guard
                .root()
                .ok_or_else(|| AppError::Exec("workspace root not set".into()))?,
        };
        if !cwd.is_absolute() {
            return Err(AppError::Exec("cwd must be absolute".into()));
        }
        let abs_cwd = self
            .guard
            .resolve_path(&cwd)
            .map_err(|err| AppError::Exec(format!("invalid cwd: {err}")))?;

        let mut limit = self.config.execution.max_output_bytes;
        if output_byte_limit > 0 && output_byte_limit < limit {
            limit = output_byte_limit;
        }
        if limit == 0 {
            limit = DEFAULT_OUTPUT_LIMIT;
        }

        let mut cmd = shell_command(self.config.shell(), &cmdline);
        cmd.current_dir(&abs_cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for pair in &spec.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Exec(format!("failed to start command: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Exec("failed to capture command stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Exec("failed to capture command stderr".into()))?;

        let id = format!("term_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let output = Arc::new(CappedBuffer::new(limit));
        let handle = Arc::new(TerminalHandle {
            id: id.clone(),
            kill: CancellationToken::new(),
            done: CancellationToken::new(),
            output: Arc::clone(&output),
            exit: Mutex::new(None),
        });

        pump(stdout, Arc::clone(&output));
        pump(stderr, output);

        let supervisor = Arc::clone(&handle);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = supervisor.kill.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        debug!(terminal_id = %supervisor.id, %err, "kill after exit");
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => exit_info(&status),
                Err(err) => {
                    warn!(terminal_id = %supervisor.id, %err, "error waiting for command");
                    ExitStatusInfo {
                        exit_code: Some(-1),
                        signal: None,
                    }
                }
            };

            *supervisor
                .exit
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(info);
            supervisor.done.cancel();
        });

        self.terminals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), handle);

        Ok(id)
    }

    /// Non-blocking output snapshot; the exit status is present only after
    /// the command finished.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    pub fn output(&self, terminal_id: &str) -> Result<(String, bool, Option<ExitStatusInfo>)> {
        let handle = self.get(terminal_id)?;
        let (data, truncated) = handle.output.snapshot();
        let exit = if handle.done.is_cancelled() {
            handle
                .exit
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        } else {
            None
        };
        Ok((
            String::from_utf8_lossy(&data).into_owned(),
            truncated,
            exit,
        ))
    }

    /// Block until the command exits and return its status.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    pub async fn wait_for_exit(&self, terminal_id: &str) -> Result<ExitStatusInfo> {
        let handle = self.get(terminal_id)?;
        handle.done.cancelled().await;
        let exit = handle
            .exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(exit.unwrap_or(ExitStatusInfo {
            exit_code: Some(-1),
            signal: None,
        }))
    }

    /// Request termination of the command. Idempotent; a no-op after exit.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    pub fn kill(&self, terminal_id: &str) -> Result<()> {
        let handle = self.get(terminal_id)?;
        handle.kill.cancel();
        Ok(())
    }

    /// Kill the command and remove the terminal from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] for an unknown terminal id.
    pub fn release(&self, terminal_id: &str) -> Result<()> {
        let handle = self.get(terminal_id)?;
        handle.kill.cancel();
        self.terminals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(terminal_id);
        Ok(())
    }

    /// Kill and drop every terminal; used on session teardown.
    pub fn release_all(&self) {
        let drained: Vec<Arc<TerminalHandle>> = self
            .terminals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in drained {
            handle.kill.cancel();
        }
    }

    fn get(&self, terminal_id: &str) -> Result<Arc<TerminalHandle>> {
        self.terminals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(terminal_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound("terminal not found".into()))
    }
}

// ── Allowlist matching ───────────────────────────────────────────────────────

/// Match `[command, args...]` against the allowlist in declared order.
///
/// The first entry whose whitespace-split template is a prefix of the
/// requested tokens wins; the remaining tokens are returned as extra
/// arguments, subject to the entry's `allow_args` / `max_args` policy.
///
/// # Errors
///
/// Returns [`AppError::Exec`]`("command not in allowlist")` when no entry
/// accepts the request.
pub fn match_allowlist<'a>(
    commands: &'a [CommandSpec],
    command: &str,
    args: &[String],
) -> Result<(&'a CommandSpec, Vec<String>)> {
    let mut requested = Vec::with_capacity(args.len() + 1);
    requested.push(command.to_owned());
    requested.extend(args.iter().cloned());

    for spec in commands {
        let template: Vec<&str> = spec.template.split_whitespace().collect();
        if template.is_empty() || requested.len() < template.len() {
            continue;
        }
        if !template.iter().zip(&requested).all(|(t, r)| *t == r) {
            continue;
        }

        let extra = requested[template.len()..].to_vec();
        if !extra.is_empty() {
            if !spec.allow_args {
                continue;
            }
            if spec.max_args > 0 && extra.len() > spec.max_args {
                continue;
            }
        }
        return Ok((spec, extra));
    }

    Err(AppError::Exec("command not in allowlist".into()))
}

/// Whether `s` contains a character that could alter shell parsing.
#[must_use]
pub fn contains_shell_meta(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(
            c,
            ';' | '&'
                | '|'
                | '`'
                | '$'
                | '('
                | ')'
                | '{'
                | '}'
                | '<'
                | '>'
                | '\''
                | '"'
                | '\\'
                | '\n'
                | '\r'
        )
    })
}

fn shell_command(shell: &str, cmdline: &str) -> Command {
    if cfg!(windows) {
        return match shell {
            "powershell" => {
                let mut cmd = Command::new("powershell");
                cmd.args(["-NoProfile", "-NonInteractive", "-Command", cmdline]);
                cmd
            }
            "cmd" => {
                let mut cmd = Command::new("cmd");
                cmd.args(["/c", cmdline]);
                cmd
            }
            other => {
                let mut cmd = Command::new(other);
                cmd.args(["-c", cmdline]);
                cmd
            }
        };
    }

    let mut cmd = Command::new(shell);
    cmd.args(["-c", cmdline]);
    cmd
}

fn pump(mut reader: impl AsyncRead + Send + Unpin + 'static, buffer: Arc<CappedBuffer>) {
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buffer.write(&chunk[..n]),
                Err(err) => {
                    debug!(%err, "terminal output stream closed");
                    break;
                }
            }
        }
    });
}
