//! Response types of the platform JSON API.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{Result, ToolsError};

/// An application as returned by `GET /v3/apps`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct App {
    pub name: String,
    pub guid: String,
}

/// Lifecycle state of a remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Running,
    Canceling,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    /// `SUCCEEDED` and `FAILED` stop polling.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Canceling => "CANCELING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error record embedded in API responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub code: i64,
}

impl ApiError {
    pub(crate) fn into_error(self, action: impl Into<String>) -> ToolsError {
        ToolsError::Remote {
            action: action.into(),
            code: self.code,
            title: self.title,
            detail: self.detail,
        }
    }
}

/// A remote task as returned by the task endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub state: Option<TaskState>,
    #[serde(default)]
    pub errors: Vec<ApiError>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.map(TaskState::is_terminal).unwrap_or(false)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Resources<T> {
    #[serde(default = "Vec::new")]
    pub resources: Vec<T>,
}

/// Decode CLI output lines as a JSON document.
pub(crate) fn parse_json<T: DeserializeOwned>(lines: &[String]) -> Result<T> {
    let raw = lines.join("\n");
    serde_json::from_str(&raw)
        .map_err(|_| ToolsError::parse("failed to parse the following api response", raw))
}
