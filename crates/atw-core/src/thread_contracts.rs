use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const THREAD_NAME_MIN_CHARS: usize = 1;
pub const THREAD_NAME_MAX_CHARS: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error(
        "thread name must be {THREAD_NAME_MIN_CHARS}-{THREAD_NAME_MAX_CHARS} characters, got {chars}"
    )]
    InvalidThreadName { chars: usize },
    #[error("branch name cannot be empty")]
    EmptyBranchName,
    #[error("thread {thread_id} is not worktree-isolated")]
    NotWorktreeIsolated { thread_id: String },
    #[error("whitelist pattern cannot be empty")]
    EmptyWhitelistPattern,
}

/// Branch and worktree path travel together: a thread either has both or
/// neither, so the mixed state is unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorktreeIsolation {
    pub branch: String,
    pub worktree_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadState {
    pub thread_id: String,
    pub name: String,
    pub terminal_id: String,
    pub working_dir: PathBuf,
    pub isolation: Option<WorktreeIsolation>,
    pub whitelist_patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ThreadState {
    pub fn new(
        thread_id: impl Into<String>,
        name: impl Into<String>,
        terminal_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        isolation: Option<WorktreeIsolation>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ContractError> {
        let name = validate_name(name.into())?;
        if let Some(isolation) = isolation.as_ref() {
            validate_branch(&isolation.branch)?;
        }
        Ok(Self {
            thread_id: thread_id.into(),
            name,
            terminal_id: terminal_id.into(),
            working_dir: working_dir.into(),
            isolation,
            whitelist_patterns: Vec::new(),
            created_at,
        })
    }

    pub fn is_worktree_isolated(&self) -> bool {
        self.isolation.is_some()
    }

    pub fn worktree_path(&self) -> Option<&Path> {
        self.isolation
            .as_ref()
            .map(|isolation| isolation.worktree_path.as_path())
    }

    pub fn branch(&self) -> Option<&str> {
        self.isolation
            .as_ref()
            .map(|isolation| isolation.branch.as_str())
    }

    pub fn with_name(mut self, new_name: impl Into<String>) -> Result<Self, ContractError> {
        self.name = validate_name(new_name.into())?;
        Ok(self)
    }

    pub fn with_branch(mut self, target_branch: impl Into<String>) -> Result<Self, ContractError> {
        let target_branch = target_branch.into();
        validate_branch(&target_branch)?;
        match self.isolation.as_mut() {
            Some(isolation) => {
                isolation.branch = target_branch;
                Ok(self)
            }
            None => Err(ContractError::NotWorktreeIsolated {
                thread_id: self.thread_id,
            }),
        }
    }

    /// Adding a pattern already present by exact string match is a no-op.
    pub fn with_whitelist_pattern(
        mut self,
        pattern: impl Into<String>,
    ) -> Result<Self, ContractError> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(ContractError::EmptyWhitelistPattern);
        }
        if !self.whitelist_patterns.iter().any(|p| *p == pattern) {
            self.whitelist_patterns.push(pattern);
        }
        Ok(self)
    }

    pub fn without_whitelist_pattern(mut self, pattern: &str) -> Self {
        self.whitelist_patterns.retain(|p| p != pattern);
        self
    }
}

pub fn validate_thread_name(name: &str) -> Result<(), ContractError> {
    let chars = name.chars().count();
    if !(THREAD_NAME_MIN_CHARS..=THREAD_NAME_MAX_CHARS).contains(&chars) {
        return Err(ContractError::InvalidThreadName { chars });
    }
    Ok(())
}

pub fn validate_branch_name(branch: &str) -> Result<(), ContractError> {
    if branch.trim().is_empty() {
        return Err(ContractError::EmptyBranchName);
    }
    Ok(())
}

fn validate_name(name: String) -> Result<String, ContractError> {
    validate_thread_name(&name)?;
    Ok(name)
}

fn validate_branch(branch: &str) -> Result<(), ContractError> {
    validate_branch_name(branch)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Inactive,
    Idle,
    Working,
    Waiting,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Inactive
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Inactive => "inactive",
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Waiting => "waiting",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "inactive" => Ok(AgentStatus::Inactive),
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "waiting" => Ok(AgentStatus::Waiting),
            other => Err(format!("Unknown agent status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentFlavor {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

impl AgentFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentFlavor::Claude => "claude",
            AgentFlavor::Codex => "codex",
            AgentFlavor::Gemini => "gemini",
            AgentFlavor::Opencode => "opencode",
        }
    }
}

impl fmt::Display for AgentFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentFlavor {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "claude" => Ok(AgentFlavor::Claude),
            "codex" => Ok(AgentFlavor::Codex),
            "gemini" => Ok(AgentFlavor::Gemini),
            "opencode" => Ok(AgentFlavor::Opencode),
            other => Err(format!("Unknown agent flavor: {other}")),
        }
    }
}

/// A review comment as the routing engine sees it. Immutable input except for
/// `is_submitted`, which flips after successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub comment_id: String,
    pub file: String,
    pub line: u32,
    pub end_line: Option<u32>,
    pub text: String,
    pub thread_id: Option<String>,
    pub is_submitted: bool,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn location_label(&self) -> String {
        match self.end_line {
            Some(end_line) if end_line != self.line => {
                format!("{}:{}-{}", self.file, self.line, end_line)
            }
            _ => format!("{}:{}", self.file, self.line),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileThreadMapping {
    pub file_path: String,
    pub thread_id: String,
    pub updated_at: DateTime<Utc>,
}
