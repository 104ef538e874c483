use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Opaque task identifier. Clients may supply one for idempotent resubmission.
pub type TaskId = Uuid;

/// Lifecycle status of a generation task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Statuses a racing writer may still move out of.
    pub const ACTIVE: [TaskStatus; 2] = [TaskStatus::Pending, TaskStatus::Processing];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the task state machine.
    ///
    /// Terminal statuses have no outgoing edges.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Pending | Processing, Failed)
                | (Pending | Processing, Cancelled)
        )
    }
}

/// Output aspect ratio requested by the client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    #[strum(serialize = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    #[strum(serialize = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    #[strum(serialize = "9:16")]
    Portrait,
    #[serde(rename = "4:3")]
    #[strum(serialize = "4:3")]
    Standard,
    #[serde(rename = "3:4")]
    #[strum(serialize = "3:4")]
    StandardPortrait,
}

impl AspectRatio {
    /// Pixel size string understood by OpenAI-compatible image endpoints.
    pub fn image_size(self) -> &'static str {
        match self {
            AspectRatio::Square => "1024x1024",
            AspectRatio::Landscape | AspectRatio::Standard => "1792x1024",
            AspectRatio::Portrait | AspectRatio::StandardPortrait => "1024x1792",
        }
    }
}

/// Size bounds applied to submitted input.
#[derive(Debug, Clone)]
pub struct InputLimits {
    pub max_prompt_chars: usize,
    pub max_reference_image_bytes: usize,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 2000,
            max_reference_image_bytes: 10 * 1024 * 1024,
        }
    }
}

/// What the client asked to generate. Stored as JSON on the task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[garde(context(InputLimits))]
pub struct TaskInput {
    #[garde(custom(prompt_within_limit))]
    pub prompt: String,

    #[garde(length(min = 1, max = 64))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,

    /// Either an `http(s)` URL or a base64 / data-URI encoded image.
    #[garde(length(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_image: Option<String>,

    #[garde(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<AspectRatio>,
}

fn prompt_within_limit(value: &String, limits: &InputLimits) -> garde::Result {
    let chars = value.chars().count();
    if chars > limits.max_prompt_chars {
        return Err(garde::Error::new(format!(
            "prompt is {chars} characters, limit is {}",
            limits.max_prompt_chars
        )));
    }
    Ok(())
}

impl TaskInput {
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: None,
            reference_image: None,
            aspect_ratio: None,
        }
    }
}

/// Coarse executor checkpoints shown to polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Queued,
    SendingRequest,
    ProviderProcessing,
    ExtractingResult,
    Finalizing,
    Done,
    Failed,
    Cancelled,
}

impl Stage {
    pub fn progress(self) -> u8 {
        match self {
            Stage::Queued => 5,
            Stage::SendingRequest => 15,
            Stage::ProviderProcessing => 40,
            Stage::ExtractingResult => 80,
            Stage::Finalizing => 95,
            Stage::Done => 100,
            Stage::Failed => 0,
            Stage::Cancelled => 0,
        }
    }
}

/// A generation task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: String,
    pub status: TaskStatus,
    pub input: TaskInput,
    pub progress_percentage: u8,
    pub stage: String,
    pub result_ref: Option<String>,
    pub provider_result_ref: Option<String>,
    pub error_message: Option<String>,
    pub credit_deducted: bool,
    pub credit_refunded: bool,
    pub materialized_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Row to insert on submission.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub owner_id: String,
    pub input: TaskInput,
}

impl NewTask {
    /// Materialize the row a store would create for this request.
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: self.id,
            owner_id: self.owner_id,
            status: TaskStatus::Pending,
            input: self.input,
            progress_percentage: 0,
            stage: Stage::Queued.to_string(),
            result_ref: None,
            provider_result_ref: None,
            error_message: None,
            credit_deducted: false,
            credit_refunded: false,
            materialized_at: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
        }
    }
}

/// Outcome of an idempotent insert.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(Task),
    Existing(Task),
}

/// Conditional status change applied by a store.
///
/// `None` fields leave the column untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: TaskStatus,
    pub stage: Option<Stage>,
    pub progress: Option<u8>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
}

impl Transition {
    pub fn start() -> Self {
        Self {
            to: TaskStatus::Processing,
            stage: Some(Stage::Queued),
            progress: Some(Stage::Queued.progress()),
            result_ref: None,
            error_message: None,
        }
    }

    /// Success. `locator` is written to both `result_ref` and `provider_result_ref`.
    pub fn complete(locator: impl Into<String>) -> Self {
        Self {
            to: TaskStatus::Completed,
            stage: Some(Stage::Done),
            progress: Some(100),
            result_ref: Some(locator.into()),
            error_message: None,
        }
    }

    /// Failure resets progress to 0.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            to: TaskStatus::Failed,
            stage: Some(Stage::Failed),
            progress: Some(0),
            result_ref: None,
            error_message: Some(message.into()),
        }
    }

    pub fn cancel() -> Self {
        Self {
            to: TaskStatus::Cancelled,
            stage: Some(Stage::Cancelled),
            progress: None,
            result_ref: None,
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Apply to an in-memory row. Callers check the expected status first.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        task.status = self.to;
        if let Some(stage) = self.stage {
            task.stage = stage.to_string();
        }
        if let Some(progress) = self.progress {
            task.progress_percentage = progress.min(100);
        }
        if let Some(locator) = &self.result_ref {
            task.result_ref = Some(locator.clone());
            task.provider_result_ref = Some(locator.clone());
        }
        if let Some(message) = &self.error_message {
            task.error_message = Some(message.clone());
        }
        if self.to == TaskStatus::Processing {
            task.processing_started_at = Some(now);
        }
        if self.to.is_terminal() {
            task.completed_at = Some(now);
        }
        task.updated_at = now;
    }
}

/// One-way ledger flags on the task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Latch {
    CreditDeducted,
    CreditRefunded,
}

/// Component that wrote a task log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Actor {
    Submission,
    Executor,
    Cancellation,
    Reaper,
    Materializer,
    Ledger,
}

/// Append-only audit record of a task event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub task_id: TaskId,
    pub actor: Actor,
    pub from_status: Option<TaskStatus>,
    pub to_status: Option<TaskStatus>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

impl TaskLogEntry {
    pub fn transition(
        task_id: TaskId,
        actor: Actor,
        from: Option<TaskStatus>,
        to: TaskStatus,
        note: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            actor,
            from_status: from,
            to_status: Some(to),
            note: note.into(),
            created_at: Utc::now(),
        }
    }

    pub fn note(task_id: TaskId, actor: Actor, note: impl Into<String>) -> Self {
        Self {
            task_id,
            actor,
            from_status: None,
            to_status: None,
            note: note.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_terminal_statuses_have_no_outgoing_edges() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_allowed_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn test_status_string_round_trip() {
        assert_eq!(TaskStatus::Processing.as_ref(), "processing");
        assert_eq!(TaskStatus::from_str("cancelled").unwrap(), TaskStatus::Cancelled);
        assert!(TaskStatus::from_str("interrupted").is_err());
    }

    #[test]
    fn test_aspect_ratio_parsing() {
        assert_eq!(AspectRatio::from_str("16:9").unwrap(), AspectRatio::Landscape);
        assert_eq!(AspectRatio::Portrait.image_size(), "1024x1792");
        let json = serde_json::to_string(&AspectRatio::Square).unwrap();
        assert_eq!(json, "\"1:1\"");
    }

    #[test]
    fn test_prompt_limit_counts_characters() {
        let limits = InputLimits {
            max_prompt_chars: 5,
            ..InputLimits::default()
        };
        assert!(TaskInput::from_prompt("héllo").validate_with(&limits).is_ok());
        assert!(TaskInput::from_prompt("héllo!").validate_with(&limits).is_err());

        let mut styled = TaskInput::from_prompt("cat");
        styled.style = Some("x".repeat(65));
        assert!(styled.validate_with(&InputLimits::default()).is_err());
    }

    #[test]
    fn test_fail_transition_resets_progress() {
        let mut task = NewTask {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            input: TaskInput::from_prompt("a red bicycle"),
        }
        .into_task(Utc::now());
        task.progress_percentage = 80;

        Transition::fail("provider timed out").apply(&mut task, Utc::now());

        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.progress_percentage, 0);
        assert_eq!(task.error_message.as_deref(), Some("provider timed out"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_complete_transition_records_both_refs() {
        let mut task = NewTask {
            id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            input: TaskInput::from_prompt("a red bicycle"),
        }
        .into_task(Utc::now());

        Transition::complete("https://cdn.example.org/a.png").apply(&mut task, Utc::now());

        assert_eq!(task.progress_percentage, 100);
        assert_eq!(task.result_ref, task.provider_result_ref);
        assert_eq!(task.stage, "done");
    }
}
