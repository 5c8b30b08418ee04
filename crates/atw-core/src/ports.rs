use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure reported by an external collaborator behind a port. The message is
/// already human-readable; callers decide whether the failure is fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PortError {
    pub message: String,
}

impl PortError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for PortError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub trait TerminalPort {
    fn create_terminal(&mut self, name: &str, cwd: &Path) -> Result<String, PortError>;
    fn send_text(&mut self, terminal_id: &str, text: &str) -> Result<(), PortError>;
    fn close_terminal(&mut self, terminal_id: &str) -> Result<(), PortError>;
}

pub trait SourceControlPort {
    fn create_worktree(
        &mut self,
        repo_root: &Path,
        worktree_path: &Path,
        branch: &str,
    ) -> Result<(), PortError>;
    fn remove_worktree(&mut self, repo_root: &Path, worktree_path: &Path)
        -> Result<(), PortError>;
    fn switch_branch(&mut self, worktree_path: &Path, branch: &str) -> Result<(), PortError>;
    fn delete_branch(&mut self, repo_root: &Path, branch: &str) -> Result<(), PortError>;
    fn has_uncommitted_changes(&mut self, worktree_path: &Path) -> Result<bool, PortError>;
    fn stash_changes(&mut self, worktree_path: &Path, label: &str) -> Result<(), PortError>;
    fn list_branches(&mut self, repo_root: &Path) -> Result<Vec<String>, PortError>;
}

pub trait FilesystemPort {
    fn ensure_dir(&mut self, path: &Path) -> Result<(), PortError>;
    fn copy_file(&mut self, from: &Path, to: &Path) -> Result<(), PortError>;
    fn is_file(&self, path: &Path) -> bool;
}

pub trait FileGlobber {
    /// Absolute paths of files under `root` matching `pattern`.
    fn glob(&self, pattern: &str, root: &Path) -> Result<Vec<PathBuf>, PortError>;
}

pub trait EditorPort {
    fn open_folder(&mut self, path: &Path) -> Result<(), PortError>;
}

pub trait NotificationPort {
    fn show_info(&mut self, message: &str);
    fn show_warning(&mut self, message: &str);
}
