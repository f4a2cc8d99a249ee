//! Bounded file read/write primitives behind the workspace guard.
//!
//! These back the `fs/read_text_file` and `fs/write_text_file` agent
//! callbacks. Reads enforce the configured size ceiling and support a
//! 1-indexed inclusive line window; writes create missing parent
//! directories. Writes are not atomic with respect to concurrent readers.

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::workspace::WorkspaceGuard;
use crate::{AppError, Result};

/// Result of a bounded file read.
#[derive(Debug)]
pub struct ReadOutcome {
    /// Selected file content, lines joined by `\n`.
    pub content: String,
    /// Number of lines scanned (the whole file unless an end line stopped
    /// the scan early).
    pub line_count: usize,
    /// File size in bytes.
    pub size: u64,
}

/// Result of a file write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub bytes: usize,
    pub line_count: usize,
}

/// Filesystem primitive scoped to one workspace.
pub struct FsOps {
    config: Arc<Config>,
    guard: Arc<WorkspaceGuard>,
}

impl FsOps {
    #[must_use]
    pub fn new(config: Arc<Config>, guard: Arc<WorkspaceGuard>) -> Self {
        Self { config, guard }
    }

    /// Read a file, optionally windowed to `[start_line, end_line]`
    /// (1-indexed, inclusive).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`] when the path fails validation and
    /// [`AppError::Fs`] when the target is a directory, exceeds
    /// `workspace.max_file_size_bytes`, or cannot be read.
    pub async fn read(
        &self,
        path: &Path,
        start_line: Option<u64>,
        end_line: Option<u64>,
    ) -> Result<ReadOutcome> {
        let abs = self.guard.resolve_path(path)?;

        let meta = tokio::fs::metadata(&abs)
            .await
            .map_err(|err| AppError::Fs(format!("failed to stat file: {err}")))?;
        if meta.is_dir() {
            return Err(AppError::Fs("path is a directory, not a file".into()));
        }
        let max = self.config.workspace.max_file_size_bytes;
        if meta.len() > max {
            return Err(AppError::Fs(format!(
                "file too large: {} bytes (max {max})",
                meta.len()
            )));
        }

        let raw = tokio::fs::read_to_string(&abs)
            .await
            .map_err(|err| AppError::Fs(format!("failed to read file: {err}")))?;

        let mut selected: Vec<&str> = Vec::new();
        let mut scanned = 0u64;
        for (idx, line) in raw.lines().enumerate() {
            let line_no = idx as u64 + 1;
            scanned = line_no;
            if let Some(end) = end_line {
                if line_no > end {
                    break;
                }
            }
            if let Some(start) = start_line {
                if line_no < start {
                    continue;
                }
            }
            selected.push(line);
        }

        Ok(ReadOutcome {
            content: selected.join("\n"),
            line_count: usize::try_from(scanned).unwrap_or(usize::MAX),
            size: meta.len(),
        })
    }

    /// Write `content` to a file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`] when the path fails validation and
    /// [`AppError::Fs`] when the directory or file cannot be created.
    pub async fn write(&self, path: &Path, content: &str) -> Result<WriteOutcome> {
        let abs = self.guard.resolve_path(path)?;

        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                AppError::Fs(format!("failed to create parent directory: {err}"))
            })?;
        }

        tokio::fs::write(&abs, content)
            .await
            .map_err(|err| AppError::Fs(format!("failed to write file: {err}")))?;

        Ok(WriteOutcome {
            bytes: content.len(),
            line_count: content.matches('\n').count() + 1,
        })
    }
}
