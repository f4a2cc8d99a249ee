//! Error types shared across the broker.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Line-framing violation on a byte stream (size cap, embedded newline).
    Transport(String),
    /// JSON-RPC connection failure (serialization, closed peer, bad envelope).
    Rpc(String),
    /// Path failed validation against the workspace root or blocklist.
    Workspace(String),
    /// Command rejected by the allowlist or argument sanitizer, or spawn failure.
    Exec(String),
    /// File read or write failure inside the workspace.
    Fs(String),
    /// Requested entity (session, terminal) does not exist.
    NotFound(String),
    /// Underlying I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace: {msg}"),
            Self::Exec(msg) => write!(f, "exec: {msg}"),
            Self::Fs(msg) => write!(f, "fs: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
