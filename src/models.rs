// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Identifier assigned to a task when its request is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable descriptor of a single download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Source locator handed to the resolver (a URL or a search query).
    pub source: String,
    /// Display title shown by the presentation layer.
    pub title: String,
    /// Relative path hint for the downloaded file.
    #[serde(default)]
    pub destination: Option<PathBuf>,
}

impl Request {
    pub fn new(source: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: title.into(),
            destination: None,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Checks the descriptor, returning the reason it is malformed.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source is blank".into());
        }
        if self.title.trim().is_empty() {
            return Err("title is blank".into());
        }
        if let Some(dest) = &self.destination {
            validate_destination(dest)?;
        }
        Ok(())
    }

    /// Derives a request from a bare URL, using its last path segment as the title.
    pub fn from_url(url: &str) -> Self {
        let title = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .map(|s| s.split(['?', '#']).next().unwrap_or(s))
            .filter(|s| !s.is_empty() && !s.contains(':'))
            .unwrap_or(url);
        Self::new(url, title)
    }
}

fn validate_destination(dest: &Path) -> Result<(), String> {
    if dest.as_os_str().is_empty() {
        return Err("destination is empty".into());
    }
    for component in dest.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Err("destination escapes the output directory".into()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("destination must be a relative path".into())
            }
        }
    }
    Ok(())
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Inactive,
    Pending,
    Active,
    Paused,
    Cancelled,
    Failed,
    Completed,
}

impl TaskState {
    /// Cancelled, failed and completed tasks accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Last-known progress of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 0.0 ..= 100.0
    pub percent: f64,
    pub transferred: u64,
    pub total: Option<u64>,
}

/// Point-in-time copy of a task, for listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub request: Request,
    pub state: TaskState,
    pub progress: Progress,
    pub error: Option<String>,
}
