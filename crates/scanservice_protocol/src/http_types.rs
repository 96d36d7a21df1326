//! Request/response bodies of the HTTP boundary.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ids::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_path: PathBuf,
    pub output_file: PathBuf,
}

/// Echo of the request plus the task identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanAccepted {
    pub scan_path: PathBuf,
    pub output_file: PathBuf,
    pub uuid: TaskId,
}

/// Lifecycle state of a scan task as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    /// Finished and the output was written.
    Done,
    /// Finished without output: analyzer failure, write failure or cancel.
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub uuid: TaskId,
    pub status: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveScansResponse {
    pub status: String,
    pub scans: Vec<TaskId>,
}

impl ActiveScansResponse {
    pub fn active(scans: Vec<TaskId>) -> Self {
        Self {
            status: "active".to_string(),
            scans,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_wire_names() {
        assert_eq!(serde_json::to_string(&TaskState::Pending).unwrap(), "\"pending\"");
        assert_eq!(serde_json::to_string(&TaskState::Done).unwrap(), "\"done\"");
        assert_eq!(serde_json::to_string(&TaskState::Failed).unwrap(), "\"failed\"");
    }

    #[test]
    fn test_status_omits_missing_error() {
        let response = TaskStatusResponse {
            uuid: TaskId::new(),
            status: TaskState::Done,
            error: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["status"], "done");
    }
}
