use atw_core::id::{IdGenerator, UuidGenerator};
use atw_core::ports::{EditorPort, FileGlobber, FilesystemPort, SourceControlPort, TerminalPort};
use atw_core::thread_contracts::{
    validate_branch_name, validate_thread_name, ContractError, ThreadState, WorktreeIsolation,
};
use atw_status::StatusDetector;
use atw_storage::{StorageError, WorkbenchStore};
use chrono::Utc;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub mod globber;

pub use globber::GlobsetFileGlobber;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("source control error: {0}")]
    SourceControl(atw_core::ports::PortError),
    #[error("terminal error: {0}")]
    Terminal(atw_core::ports::PortError),
    #[error("thread {thread_id} is not worktree-isolated")]
    NotWorktreeIsolated { thread_id: String },
    #[error("worktree for thread {thread_id} has uncommitted changes and stashing was declined")]
    UncommittedChanges { thread_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationMode {
    /// The agent runs directly in the workspace root.
    None,
    /// The agent runs in its own worktree on its own branch. Branch defaults
    /// to the thread name, the worktree path to
    /// `<workspace-parent>/<workspace-name>.worktree/<branch>`.
    Worktree {
        branch_name: Option<String>,
        worktree_path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone)]
pub struct CreateThreadRequest {
    pub name: String,
    pub isolation: IsolationMode,
    pub workspace_root: PathBuf,
    /// Globs for git-ignored local files (env files, editor settings) a fresh
    /// worktree would otherwise lack.
    pub worktree_copy_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DeleteThreadRequest {
    pub thread_id: String,
    pub workspace_root: PathBuf,
    pub close_terminal: bool,
    pub remove_worktree: bool,
}

impl DeleteThreadRequest {
    pub fn new(thread_id: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            thread_id: thread_id.into(),
            workspace_root: workspace_root.into(),
            close_terminal: true,
            remove_worktree: true,
        }
    }
}

/// One flag per cleanup step so callers can see exactly which of the
/// best-effort steps succeeded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteThreadOutcome {
    pub success: bool,
    pub deleted_comments: usize,
    pub worktree_removed: bool,
    pub branch_deleted: bool,
    pub terminal_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameOutcome {
    pub success: bool,
    pub thread_state: Option<ThreadState>,
    pub previous_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SwitchBranchRequest {
    pub thread_id: String,
    pub target_branch: String,
    pub stash_changes: bool,
}

impl SwitchBranchRequest {
    pub fn new(thread_id: impl Into<String>, target_branch: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            target_branch: target_branch.into(),
            stash_changes: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchBranchOutcome {
    pub success: bool,
    pub thread_state: Option<ThreadState>,
    pub previous_branch: Option<String>,
    pub changes_stashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInEditorOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl OpenInEditorOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// External collaborators a lifecycle operation may touch.
pub struct LifecyclePorts<'a> {
    pub terminal: &'a mut dyn TerminalPort,
    pub source_control: &'a mut dyn SourceControlPort,
    pub filesystem: &'a mut dyn FilesystemPort,
    pub globber: &'a dyn FileGlobber,
    pub editor: &'a mut dyn EditorPort,
}

pub struct ThreadLifecycleManager {
    ids: Box<dyn IdGenerator>,
}

impl Default for ThreadLifecycleManager {
    fn default() -> Self {
        Self {
            ids: Box::new(UuidGenerator),
        }
    }
}

impl ThreadLifecycleManager {
    pub fn with_id_generator(ids: Box<dyn IdGenerator>) -> Self {
        Self { ids }
    }

    pub fn create(
        &mut self,
        store: &WorkbenchStore,
        ports: &mut LifecyclePorts<'_>,
        request: CreateThreadRequest,
    ) -> Result<ThreadState, LifecycleError> {
        // Validate before any external resource exists.
        validate_thread_name(&request.name)?;

        let isolation = match &request.isolation {
            IsolationMode::None => None,
            IsolationMode::Worktree {
                branch_name,
                worktree_path,
            } => {
                let branch = branch_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|branch| !branch.is_empty())
                    .unwrap_or(&request.name)
                    .to_string();
                validate_branch_name(&branch)?;
                let worktree_path = worktree_path.clone().unwrap_or_else(|| {
                    default_worktree_path(&request.workspace_root, &branch)
                });
                Some(WorktreeIsolation {
                    branch,
                    worktree_path,
                })
            }
        };

        let working_dir = match isolation.as_ref() {
            Some(isolation) => {
                // A thread cannot exist without its working directory, so
                // worktree creation failures abort the whole operation.
                ports
                    .source_control
                    .create_worktree(
                        &request.workspace_root,
                        &isolation.worktree_path,
                        &isolation.branch,
                    )
                    .map_err(LifecycleError::SourceControl)?;
                let copied = copy_local_files(
                    ports,
                    &request.workspace_root,
                    &isolation.worktree_path,
                    &request.worktree_copy_patterns,
                );
                debug!(event = "worktree_files_copied", copied);
                isolation.worktree_path.clone()
            }
            None => request.workspace_root.clone(),
        };

        let terminal_id = ports
            .terminal
            .create_terminal(&request.name, &working_dir)
            .map_err(LifecycleError::Terminal)?;

        let thread = ThreadState::new(
            self.ids.next_id(),
            request.name,
            terminal_id,
            working_dir,
            isolation,
            Utc::now(),
        )?;
        store.save_thread(&thread)?;
        Ok(thread)
    }

    /// Best-effort teardown: external failures after the thread is found are
    /// logged and recorded in the outcome, never fatal — a half-deleted
    /// thread must still disappear from the active set.
    pub fn delete(
        &mut self,
        store: &WorkbenchStore,
        detector: &mut StatusDetector,
        ports: &mut LifecyclePorts<'_>,
        request: DeleteThreadRequest,
    ) -> Result<DeleteThreadOutcome, LifecycleError> {
        let Some(thread) = store.thread_by_id(&request.thread_id)? else {
            return Ok(DeleteThreadOutcome::default());
        };

        let mut outcome = DeleteThreadOutcome {
            success: true,
            ..DeleteThreadOutcome::default()
        };

        if request.close_terminal {
            match ports.terminal.close_terminal(&thread.terminal_id) {
                Ok(()) => outcome.terminal_closed = true,
                Err(err) => warn!(
                    event = "terminal_close_failed",
                    thread_id = %thread.thread_id,
                    error = %err
                ),
            }
        }

        detector.clear(&thread.terminal_id);
        outcome.deleted_comments = store.delete_comments_by_thread(&thread.thread_id)?;

        if request.remove_worktree {
            if let Some(isolation) = thread.isolation.as_ref() {
                match ports
                    .source_control
                    .remove_worktree(&request.workspace_root, &isolation.worktree_path)
                {
                    Ok(()) => {
                        outcome.worktree_removed = true;
                        // Only a branch whose worktree is gone can be deleted.
                        match ports
                            .source_control
                            .delete_branch(&request.workspace_root, &isolation.branch)
                        {
                            Ok(()) => outcome.branch_deleted = true,
                            Err(err) => warn!(
                                event = "branch_delete_failed",
                                branch = %isolation.branch,
                                error = %err
                            ),
                        }
                    }
                    Err(err) => warn!(
                        event = "worktree_remove_failed",
                        worktree = %isolation.worktree_path.display(),
                        error = %err
                    ),
                }
            }
        }

        store.delete_thread(&thread.thread_id)?;
        Ok(outcome)
    }

    pub fn rename(
        &mut self,
        store: &WorkbenchStore,
        thread_id: &str,
        new_name: &str,
    ) -> Result<RenameOutcome, LifecycleError> {
        validate_thread_name(new_name)?;
        let Some(thread) = store.thread_by_id(thread_id)? else {
            return Ok(RenameOutcome {
                success: false,
                thread_state: None,
                previous_name: None,
            });
        };

        let previous_name = thread.name.clone();
        let renamed = thread.with_name(new_name)?;
        store.save_thread(&renamed)?;
        Ok(RenameOutcome {
            success: true,
            thread_state: Some(renamed),
            previous_name: Some(previous_name),
        })
    }

    pub fn switch_branch(
        &mut self,
        store: &WorkbenchStore,
        ports: &mut LifecyclePorts<'_>,
        request: SwitchBranchRequest,
    ) -> Result<SwitchBranchOutcome, LifecycleError> {
        validate_branch_name(&request.target_branch)?;
        let Some(thread) = store.thread_by_id(&request.thread_id)? else {
            return Ok(SwitchBranchOutcome {
                success: false,
                thread_state: None,
                previous_branch: None,
                changes_stashed: false,
            });
        };

        let Some(isolation) = thread.isolation.clone() else {
            return Err(LifecycleError::NotWorktreeIsolated {
                thread_id: thread.thread_id,
            });
        };

        let mut changes_stashed = false;
        let dirty = ports
            .source_control
            .has_uncommitted_changes(&isolation.worktree_path)
            .map_err(LifecycleError::SourceControl)?;
        if dirty {
            if !request.stash_changes {
                return Err(LifecycleError::UncommittedChanges {
                    thread_id: thread.thread_id,
                });
            }
            ports
                .source_control
                .stash_changes(
                    &isolation.worktree_path,
                    &format!("before switch to {}", request.target_branch),
                )
                .map_err(LifecycleError::SourceControl)?;
            changes_stashed = true;
        }

        ports
            .source_control
            .switch_branch(&isolation.worktree_path, &request.target_branch)
            .map_err(LifecycleError::SourceControl)?;

        let switched = thread.with_branch(request.target_branch)?;
        store.save_thread(&switched)?;
        Ok(SwitchBranchOutcome {
            success: true,
            thread_state: Some(switched),
            previous_branch: Some(isolation.branch),
            changes_stashed,
        })
    }

    /// Infallible shape: every failure, including storage trouble, comes back
    /// as `success:false` with a human-readable message.
    pub fn open_in_editor(
        &mut self,
        store: &WorkbenchStore,
        ports: &mut LifecyclePorts<'_>,
        thread_id: &str,
    ) -> OpenInEditorOutcome {
        let thread = match store.thread_by_id(thread_id) {
            Ok(Some(thread)) => thread,
            Ok(None) => return OpenInEditorOutcome::failed(format!("thread {thread_id} not found")),
            Err(err) => return OpenInEditorOutcome::failed(err.to_string()),
        };
        let Some(worktree_path) = thread.worktree_path() else {
            return OpenInEditorOutcome::failed(format!(
                "thread {} has no worktree to open",
                thread.name
            ));
        };
        match ports.editor.open_folder(worktree_path) {
            Ok(()) => OpenInEditorOutcome {
                success: true,
                error: None,
            },
            Err(err) => OpenInEditorOutcome::failed(err.to_string()),
        }
    }

    pub fn add_whitelist_pattern(
        &mut self,
        store: &WorkbenchStore,
        thread_id: &str,
        pattern: &str,
    ) -> Result<Option<ThreadState>, LifecycleError> {
        let Some(thread) = store.thread_by_id(thread_id)? else {
            return Ok(None);
        };
        let updated = thread.with_whitelist_pattern(pattern)?;
        store.update_whitelist(&updated.thread_id, &updated.whitelist_patterns)?;
        Ok(Some(updated))
    }

    pub fn remove_whitelist_pattern(
        &mut self,
        store: &WorkbenchStore,
        thread_id: &str,
        pattern: &str,
    ) -> Result<Option<ThreadState>, LifecycleError> {
        let Some(thread) = store.thread_by_id(thread_id)? else {
            return Ok(None);
        };
        let updated = thread.without_whitelist_pattern(pattern);
        store.update_whitelist(&updated.thread_id, &updated.whitelist_patterns)?;
        Ok(Some(updated))
    }
}

fn default_worktree_path(workspace_root: &Path, branch: &str) -> PathBuf {
    let workspace_name = workspace_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "workspace".to_string());
    let parent = workspace_root.parent().unwrap_or(workspace_root);
    parent
        .join(format!("{workspace_name}.worktree"))
        .join(branch)
}

/// Copies every file matched by any pattern into the worktree, preserving
/// relative structure. Per-file failures are logged and skipped so one bad
/// file never blocks the rest.
fn copy_local_files(
    ports: &mut LifecyclePorts<'_>,
    workspace_root: &Path,
    worktree_path: &Path,
    patterns: &[String],
) -> usize {
    let mut sources = BTreeSet::new();
    for pattern in patterns {
        match ports.globber.glob(pattern, workspace_root) {
            Ok(matches) => sources.extend(matches),
            Err(err) => warn!(event = "copy_glob_failed", pattern = %pattern, error = %err),
        }
    }

    let mut copied = 0;
    for source in sources {
        let Ok(relative) = source.strip_prefix(workspace_root) else {
            warn!(event = "copy_outside_workspace", source = %source.display());
            continue;
        };
        let destination = worktree_path.join(relative);
        if let Some(parent) = destination.parent() {
            if let Err(err) = ports.filesystem.ensure_dir(parent) {
                warn!(event = "copy_mkdir_failed", dir = %parent.display(), error = %err);
                continue;
            }
        }
        match ports.filesystem.copy_file(&source, &destination) {
            Ok(()) => copied += 1,
            Err(err) => warn!(
                event = "copy_file_failed",
                source = %source.display(),
                error = %err
            ),
        }
    }
    copied
}
