//! Workspace root confinement and path validation.
//!
//! A [`WorkspaceGuard`] turns untrusted path arguments into absolute paths
//! that are guaranteed to live under the workspace root after symlink
//! resolution, and that do not match the configured blocklist. Every file
//! and terminal operation the broker serves goes through [`WorkspaceGuard::resolve_path`].

use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::Config;
use crate::{AppError, Result};

struct GuardState {
    /// Canonical workspace root; `None` until a root has been set.
    root: Option<PathBuf>,
    /// Current working directory, relative to root.
    cwd: PathBuf,
}

/// Path validator scoped to a single workspace root.
pub struct WorkspaceGuard {
    blocked: GlobSet,
    state: RwLock<GuardState>,
}

impl WorkspaceGuard {
    /// Build a guard from the configured blocklist and default root.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if a blocklist pattern is not a valid
    /// glob.
    pub fn new(config: &Config) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.workspace.blocked_paths {
            let glob = Glob::new(pattern).map_err(|err| {
                AppError::Config(format!("invalid blocked path pattern {pattern:?}: {err}"))
            })?;
            builder.add(glob);
        }
        let blocked = builder
            .build()
            .map_err(|err| AppError::Config(format!("invalid blocked path set: {err}")))?;

        let root = if config.workspace.default_root.as_os_str().is_empty() {
            None
        } else {
            Some(config.workspace.default_root.clone())
        };

        Ok(Self {
            blocked,
            state: RwLock::new(GuardState {
                root,
                cwd: PathBuf::from("."),
            }),
        })
    }

    /// Set the workspace root, resetting the working directory to `.`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`] if the path does not exist or is not
    /// a directory.
    pub fn set_root(&self, root: &Path) -> Result<()> {
        let abs = root.canonicalize().map_err(|err| {
            AppError::Workspace(format!("failed to access directory: {err}"))
        })?;
        if !abs.is_dir() {
            return Err(AppError::Workspace(format!(
                "path is not a directory: {}",
                abs.display()
            )));
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.root = Some(abs);
        state.cwd = PathBuf::from(".");
        Ok(())
    }

    /// The current workspace root, if one is set.
    #[must_use]
    pub fn root(&self) -> Option<PathBuf> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .root
            .clone()
    }

    /// The current working directory relative to the root.
    #[must_use]
    pub fn cwd(&self) -> PathBuf {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cwd
            .clone()
    }

    /// Resolve `path` to a safe absolute path confined to the workspace.
    ///
    /// Relative paths are joined onto `root/cwd`. The candidate is resolved
    /// through symlinks (falling back to the parent directory for paths that
    /// do not exist yet, so new files can be written), checked against the
    /// canonical root, and matched against the blocklist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`] with one of: `no workspace set`,
    /// `failed to resolve path: <cause>`, `path escapes workspace root`, or
    /// `path is blocked by policy`.
    pub fn resolve_path(&self, path: &Path) -> Result<PathBuf> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let root = state
            .root
            .as_ref()
            .ok_or_else(|| AppError::Workspace("no workspace set".into()))?;

        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(&state.cwd).join(path)
        };

        self.validate(root, &abs)?;
        Ok(lexical_clean(&abs))
    }

    /// Change the working directory within the workspace.
    ///
    /// Absolute paths are taken as-is; relative paths resolve against the
    /// current cwd. The target must validate and be a directory.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Workspace`] on validation failure or when the
    /// target is missing or not a directory.
    pub fn chdir(&self, path: &Path) -> Result<PathBuf> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let root = state
            .root
            .clone()
            .ok_or_else(|| AppError::Workspace("no workspace set".into()))?;

        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(&state.cwd).join(path)
        };

        self.validate(&root, &abs)?;

        let meta = std::fs::metadata(&abs).map_err(|err| {
            AppError::Workspace(format!("failed to access directory: {err}"))
        })?;
        if !meta.is_dir() {
            return Err(AppError::Workspace("path is not a directory".into()));
        }

        let clean = lexical_clean(&abs);
        state.cwd = clean
            .strip_prefix(&root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from("."));
        if state.cwd.as_os_str().is_empty() {
            state.cwd = PathBuf::from(".");
        }
        Ok(clean)
    }

    /// Whether `path` matches the blocklist by basename or full path.
    #[must_use]
    pub fn is_blocked(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name() {
            if self.blocked.is_match(Path::new(name)) {
                return true;
            }
        }
        self.blocked.is_match(path)
    }

    fn validate(&self, root: &Path, abs: &Path) -> Result<()> {
        let real = resolve_symlinks(abs)?;
        let real_root = root.canonicalize().map_err(|err| {
            AppError::Workspace(format!("failed to resolve workspace root: {err}"))
        })?;

        if !real.starts_with(&real_root) {
            return Err(AppError::Workspace("path escapes workspace root".into()));
        }
        if self.is_blocked(&real) {
            return Err(AppError::Workspace("path is blocked by policy".into()));
        }
        Ok(())
    }
}

/// Canonicalize `abs`. When the leaf does not exist yet, canonicalize its
/// parent and rejoin the basename so writes to new files validate.
fn resolve_symlinks(abs: &Path) -> Result<PathBuf> {
    match abs.canonicalize() {
        Ok(real) => Ok(real),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let parent = abs.parent().ok_or_else(|| {
                AppError::Workspace("failed to resolve path: path has no parent".into())
            })?;
            let real_parent = parent.canonicalize().map_err(|err| {
                AppError::Workspace(format!("failed to resolve path: {err}"))
            })?;
            match abs.file_name() {
                Some(name) => Ok(real_parent.join(name)),
                None => Ok(real_parent),
            }
        }
        Err(err) => Err(AppError::Workspace(format!(
            "failed to resolve path: {err}"
        ))),
    }
}

/// Lexically normalize a path: drop `.` segments and fold `..` onto the
/// preceding component. No filesystem access.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
