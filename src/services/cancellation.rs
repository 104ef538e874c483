//! Client-initiated cancellation.
//!
//! The cancel write races the executor. It goes through an ordered chain of
//! write paths, then the row is re-read until the outcome is confirmed. A row
//! still active after every confirmation read gets one forced privileged
//! write, and whatever that leaves in the store is the answer.

use std::sync::Arc;
use std::time::Duration;

use crate::db::TaskStore;
use crate::error::TaskError;
use crate::models::task::{Actor, Task, TaskId, TaskLogEntry, TaskStatus, Transition};
use crate::services::audit;
use crate::services::chain::{run_chain, AtomicWrite, PrivilegedWrite, StandardWrite, TransitionStrategy};
use crate::services::ledger::{CreditLedger, RefundOutcome};
use crate::services::retry::RetryPolicy;
use crate::services::signal::CancelSignal;

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub task: Task,
    /// False when the task was already cancelled before this call.
    pub newly_cancelled: bool,
    pub refund: Option<RefundOutcome>,
}

pub struct CancellationService {
    tasks: Arc<dyn TaskStore>,
    admin_tasks: Arc<dyn TaskStore>,
    ledger: Arc<CreditLedger>,
    signal: Arc<dyn CancelSignal>,
    chain: Vec<Box<dyn TransitionStrategy>>,
    confirm: RetryPolicy,
}

impl CancellationService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        admin_tasks: Arc<dyn TaskStore>,
        ledger: Arc<CreditLedger>,
        signal: Arc<dyn CancelSignal>,
        confirm_attempts: u32,
        confirm_delay: Duration,
    ) -> Self {
        let chain: Vec<Box<dyn TransitionStrategy>> = vec![
            Box::new(AtomicWrite(tasks.clone())),
            Box::new(StandardWrite(tasks.clone())),
            Box::new(PrivilegedWrite(admin_tasks.clone())),
        ];
        Self {
            tasks,
            admin_tasks,
            ledger,
            signal,
            chain,
            confirm: RetryPolicy::exponential(confirm_attempts.max(1), confirm_delay),
        }
    }

    pub async fn cancel(&self, id: TaskId, owner_id: &str) -> Result<CancelOutcome, TaskError> {
        let task = self.tasks.get_task(id).await?.ok_or(TaskError::NotFound)?;
        if task.owner_id != owner_id {
            return Err(TaskError::Forbidden);
        }
        match task.status {
            TaskStatus::Cancelled => {
                return Ok(CancelOutcome {
                    task,
                    newly_cancelled: false,
                    refund: None,
                })
            }
            status if status.is_terminal() => {
                return Err(TaskError::InvalidState { current: status })
            }
            _ => {}
        }

        self.signal.notify(id).await;

        let report = run_chain(
            &self.chain,
            id,
            owner_id,
            &TaskStatus::ACTIVE,
            &Transition::cancel(),
        )
        .await;

        let settled = match self.confirm_cancelled(id).await {
            Ok(Some(row)) => Ok(row),
            Ok(None) => self.force_cancel(id, owner_id).await,
            Err(e) => Err(e),
        };
        let confirmed = match settled {
            Err(e @ TaskError::InvalidState { .. }) => {
                // Another writer finished the task; nothing is left for the notice to stop.
                self.signal.clear(id).await;
                return Err(e);
            }
            other => other?,
        };

        let newly_cancelled = report.applied_by.is_some() || confirmed.forced;
        let row = confirmed.task;
        if newly_cancelled {
            metrics::counter!("tasks_cancelled_total").increment(1);
            tracing::info!(
                task_id = %id,
                owner_id,
                path = report.applied_by.unwrap_or("forced"),
                "Task cancelled"
            );
            audit::record(
                self.tasks.as_ref(),
                TaskLogEntry::transition(
                    id,
                    Actor::Cancellation,
                    Some(task.status),
                    TaskStatus::Cancelled,
                    format!("cancelled via {} write", report.applied_by.unwrap_or("forced")),
                ),
            )
            .await;
        }

        let refund = self.refund(&row).await;
        Ok(CancelOutcome {
            task: row,
            newly_cancelled,
            refund,
        })
    }

    /// Re-read until the row is terminal. `Ok(None)` means still active.
    async fn confirm_cancelled(&self, id: TaskId) -> Result<Option<Confirmed>, TaskError> {
        for attempt in 0..self.confirm.max_attempts {
            tokio::time::sleep(self.confirm.delay_for(attempt)).await;
            match self.tasks.get_task(id).await {
                Ok(Some(row)) if row.status == TaskStatus::Cancelled => {
                    return Ok(Some(Confirmed {
                        task: row,
                        forced: false,
                    }))
                }
                Ok(Some(row)) if row.status.is_terminal() => {
                    tracing::info!(task_id = %id, status = %row.status, "Task finished before cancellation landed");
                    return Err(TaskError::InvalidState {
                        current: row.status,
                    });
                }
                Ok(Some(_)) => {
                    tracing::debug!(task_id = %id, attempt = attempt + 1, "Cancellation not yet visible");
                }
                Ok(None) => return Err(TaskError::NotFound),
                Err(e) => {
                    tracing::warn!(task_id = %id, attempt = attempt + 1, error = %e, "Confirmation read failed");
                }
            }
        }
        Ok(None)
    }

    async fn force_cancel(&self, id: TaskId, owner_id: &str) -> Result<Confirmed, TaskError> {
        tracing::warn!(task_id = %id, "Cancellation unconfirmed, forcing privileged write");
        let forced = self
            .admin_tasks
            .transition(id, Some(owner_id), &TaskStatus::ACTIVE, &Transition::cancel())
            .await?;

        let row = self
            .admin_tasks
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound)?;
        match row.status {
            TaskStatus::Cancelled => Ok(Confirmed { task: row, forced }),
            status if status.is_terminal() => Err(TaskError::InvalidState { current: status }),
            _ => Err(TaskError::StillProcessing),
        }
    }

    async fn refund(&self, row: &Task) -> Option<RefundOutcome> {
        if !row.credit_deducted || row.credit_refunded {
            return None;
        }
        match self.ledger.refund(row).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                metrics::counter!("credit_anomalies_total", "kind" => "cancel_refund_failed").increment(1);
                tracing::error!(task_id = %row.id, owner_id = %row.owner_id, error = %e, "Refund after cancellation failed");
                None
            }
        }
    }
}

struct Confirmed {
    task: Task,
    forced: bool,
}
