use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::task::{AspectRatio, TaskInput, TaskLogEntry, TaskStatus};

/// Body of `POST /api/v1/tasks`.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    #[serde(default)]
    pub prompt: String,
    pub style: Option<String>,
    pub reference_image: Option<String>,
    pub aspect_ratio: Option<AspectRatio>,
    /// Becomes the task id. Must be a UUID; reusing one returns the original
    /// task instead of creating a new one.
    pub client_request_id: Option<Uuid>,
}

impl SubmitTaskRequest {
    pub fn into_parts(self) -> (TaskInput, Option<Uuid>) {
        let input = TaskInput {
            prompt: self.prompt,
            style: self.style,
            reference_image: self.reference_image,
            aspect_ratio: self.aspect_ratio,
        };
        (input, self.client_request_id)
    }
}

/// Response after submitting a task.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

/// Polling view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress_percentage: u8,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_secs: Option<u64>,
    /// Suggested delay before the next poll; absent once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_after_ms: Option<u64>,
}

/// Response for `POST /api/v1/tasks/{task_id}/cancel`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// False when the task was already cancelled before this request.
    pub newly_cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreditBalanceResponse {
    pub owner_id: String,
    pub balance: i64,
}

#[derive(Debug, Serialize)]
pub struct TaskLogResponse {
    pub task_id: Uuid,
    pub entries: Vec<TaskLogEntry>,
}
