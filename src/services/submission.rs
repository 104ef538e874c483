use base64::Engine;
use garde::Validate;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::TaskStore;
use crate::error::TaskError;
use crate::models::task::{
    Actor, InputLimits, InsertOutcome, NewTask, Task, TaskInput, TaskLogEntry, TaskStatus,
};
use crate::services::audit;
use crate::services::ledger::CreditLedger;
use crate::services::pool::WorkerPool;

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task: Task,
    /// False when an existing task was returned for a reused request id.
    pub created: bool,
}

pub struct SubmissionService {
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<CreditLedger>,
    pool: Arc<WorkerPool>,
    limits: InputLimits,
    require_balance: bool,
}

impl SubmissionService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        ledger: Arc<CreditLedger>,
        pool: Arc<WorkerPool>,
        limits: InputLimits,
        require_balance: bool,
    ) -> Self {
        Self {
            tasks,
            ledger,
            pool,
            limits,
            require_balance,
        }
    }

    /// Create a `pending` task and hand it to the worker pool.
    ///
    /// Returns once the row exists; generation happens in the background.
    pub async fn submit(
        &self,
        owner_id: &str,
        input: TaskInput,
        client_request_id: Option<Uuid>,
    ) -> Result<SubmitOutcome, TaskError> {
        validate_input(&input, &self.limits)?;

        if let Some(id) = client_request_id {
            if let Some(existing) = self.tasks.get_task(id).await? {
                return self.resubmitted(existing, owner_id);
            }
        }

        if self.require_balance {
            let balance = self.ledger.balance(owner_id).await?;
            if balance < self.ledger.cost() {
                return Err(TaskError::InsufficientCredits {
                    balance,
                    cost: self.ledger.cost(),
                });
            }
        }

        let new_task = NewTask {
            id: client_request_id.unwrap_or_else(Uuid::new_v4),
            owner_id: owner_id.to_string(),
            input,
        };
        let task = match self.tasks.insert_task(&new_task).await? {
            InsertOutcome::Created(task) => task,
            InsertOutcome::Existing(existing) => return self.resubmitted(existing, owner_id),
        };

        metrics::counter!("tasks_submitted_total").increment(1);
        tracing::info!(task_id = %task.id, owner_id, "Task submitted");
        audit::record(
            self.tasks.as_ref(),
            TaskLogEntry::transition(task.id, Actor::Submission, None, TaskStatus::Pending, "submitted"),
        )
        .await;

        if let Err(e) = self.pool.dispatch(task.id) {
            tracing::error!(task_id = %task.id, error = %e, "Dispatch failed, task left pending");
        }

        Ok(SubmitOutcome {
            task,
            created: true,
        })
    }

    fn resubmitted(&self, existing: Task, owner_id: &str) -> Result<SubmitOutcome, TaskError> {
        if existing.owner_id != owner_id {
            return Err(TaskError::Forbidden);
        }
        tracing::info!(task_id = %existing.id, owner_id, "Duplicate submission, returning existing task");
        Ok(SubmitOutcome {
            task: existing,
            created: false,
        })
    }
}

/// Field limits, then the cross-field and reference image rules.
pub fn validate_input(input: &TaskInput, limits: &InputLimits) -> Result<(), TaskError> {
    input
        .validate_with(limits)
        .map_err(|report| TaskError::Validation(report.to_string()))?;

    if input.prompt.trim().is_empty() && input.reference_image.is_none() {
        return Err(TaskError::Validation(
            "either a prompt or a reference image is required".into(),
        ));
    }
    if let Some(reference) = &input.reference_image {
        check_reference_image(reference, limits.max_reference_image_bytes)?;
    }
    Ok(())
}

fn check_reference_image(reference: &str, max_bytes: usize) -> Result<(), TaskError> {
    let reference = reference.trim();
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return reqwest::Url::parse(reference)
            .map(|_| ())
            .map_err(|e| TaskError::Validation(format!("reference image URL is invalid: {e}")));
    }

    let encoded = match reference.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| TaskError::Validation("reference image data URI must be base64".into()))?,
        None => reference,
    };

    // Decoded size is about 3/4 of the encoded length; reject early before decoding.
    if encoded.len() / 4 * 3 > max_bytes + 3 {
        return Err(TaskError::Validation(format!(
            "reference image exceeds {max_bytes} bytes"
        )));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| TaskError::Validation("reference image is not valid base64".into()))?;
    if bytes.len() > max_bytes {
        return Err(TaskError::Validation(format!(
            "reference image exceeds {max_bytes} bytes"
        )));
    }
    image::guess_format(&bytes)
        .map(|_| ())
        .map_err(|_| TaskError::Validation("reference image format not recognized".into()))
}
