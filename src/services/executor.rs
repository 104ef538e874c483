//! Runs one generation attempt for a task and drives it to a terminal state.
//!
//! The executor only ever writes `processing`, `completed` and `failed`, each
//! as a conditional update. Cancellation is observed two ways: the lossy
//! cancel signal, checked before the provider call and before committing, and
//! the store rejecting the terminal write because the row already moved.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::{StoreError, TaskStore};
use crate::models::task::{Actor, Stage, Task, TaskId, TaskLogEntry, TaskStatus, Transition};
use crate::services::audit;
use crate::services::extract::extract_locator;
use crate::services::ledger::{CreditLedger, DeductOutcome, LedgerError, RefundOutcome};
use crate::services::materializer::Materializer;
use crate::services::provider::{GenerationProvider, ProviderError, ProviderErrorKind, ProviderMode};
use crate::services::retry::RetryPolicy;
use crate::services::signal::CancelSignal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { result_ref: String },
    Failed { kind: ProviderErrorKind },
    /// A cancel notice was seen; the cancelling side owns the terminal write.
    Aborted,
    /// Our terminal write lost to another writer.
    LostRace { winner: TaskStatus },
    /// The task was not `pending` when the executor picked it up.
    NotRunnable { status: TaskStatus },
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} not found")]
    Missing(TaskId),
}

pub struct Executor {
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<CreditLedger>,
    provider: Arc<dyn GenerationProvider>,
    materializer: Arc<Materializer>,
    signal: Arc<dyn CancelSignal>,
    mode: ProviderMode,
    timeout: Duration,
    writes: RetryPolicy,
}

impl Executor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        ledger: Arc<CreditLedger>,
        provider: Arc<dyn GenerationProvider>,
        materializer: Arc<Materializer>,
        signal: Arc<dyn CancelSignal>,
        mode: ProviderMode,
        timeout: Duration,
    ) -> Self {
        Self {
            tasks,
            ledger,
            provider,
            materializer,
            signal,
            mode,
            timeout,
            writes: RetryPolicy::default(),
        }
    }

    pub async fn run(&self, id: TaskId) -> Result<ExecutionOutcome, ExecutorError> {
        let task = self
            .tasks
            .get_task(id)
            .await?
            .ok_or(ExecutorError::Missing(id))?;

        if task.status != TaskStatus::Pending {
            tracing::info!(task_id = %id, status = %task.status, "Task not runnable, skipping");
            return Ok(ExecutionOutcome::NotRunnable {
                status: task.status,
            });
        }
        if self.signal.is_cancelled(id).await {
            tracing::info!(task_id = %id, "Cancel notice seen before start");
            return Ok(ExecutionOutcome::Aborted);
        }

        if !self
            .tasks
            .transition(id, None, &[TaskStatus::Pending], &Transition::start())
            .await?
        {
            let status = self.current_status(id).await?;
            tracing::info!(task_id = %id, status = %status, "Task left pending before start");
            return Ok(ExecutionOutcome::NotRunnable { status });
        }
        audit::record(
            self.tasks.as_ref(),
            TaskLogEntry::transition(
                id,
                Actor::Executor,
                Some(TaskStatus::Pending),
                TaskStatus::Processing,
                "generation started",
            ),
        )
        .await;
        tracing::info!(task_id = %id, owner_id = %task.owner_id, mode = %self.mode, "Generation started");

        self.progress(id, Stage::SendingRequest).await;
        if self.signal.is_cancelled(id).await {
            tracing::info!(task_id = %id, "Cancel notice seen before provider call");
            return Ok(ExecutionOutcome::Aborted);
        }

        let started = Instant::now();
        let attempt = match tokio::time::timeout(self.timeout, self.attempt(&task)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::new(
                ProviderErrorKind::Timeout,
                format!("no result after {}s", self.timeout.as_secs()),
            )),
        };
        metrics::histogram!("generation_duration_seconds").record(started.elapsed().as_secs_f64());

        match attempt {
            Ok(locator) => self.succeed(&task, locator).await,
            Err(e) => self.fail(&task, e).await,
        }
    }

    /// One logical attempt. The conversational reply falls back to direct
    /// generation when it yields no locator; this is not a retry.
    async fn attempt(&self, task: &Task) -> Result<String, ProviderError> {
        self.progress(task.id, Stage::ProviderProcessing).await;

        if self.mode == ProviderMode::DirectOnly {
            let locator = self.provider.generate(&task.input).await?;
            self.progress(task.id, Stage::ExtractingResult).await;
            return Ok(locator);
        }

        match self.provider.converse(&task.input).await {
            Ok(reply) => {
                self.progress(task.id, Stage::ExtractingResult).await;
                if let Some(locator) = extract_locator(&reply) {
                    return Ok(locator);
                }
                tracing::info!(task_id = %task.id, "No locator in reply, using direct generation");
            }
            Err(e) if e.kind.is_fatal_for_attempt() => return Err(e),
            Err(e) => {
                tracing::info!(task_id = %task.id, error = %e, "Conversational call failed, using direct generation");
            }
        }

        let locator = self.provider.generate(&task.input).await?;
        self.progress(task.id, Stage::ExtractingResult).await;
        Ok(locator)
    }

    async fn succeed(&self, task: &Task, locator: String) -> Result<ExecutionOutcome, ExecutorError> {
        let id = task.id;

        if self.signal.is_cancelled(id).await {
            tracing::info!(task_id = %id, "Cancel notice seen before commit, discarding result");
            metrics::counter!("tasks_lost_race_total").increment(1);
            return Ok(ExecutionOutcome::Aborted);
        }
        self.progress(id, Stage::Finalizing).await;

        let complete = Transition::complete(locator.clone());
        let applied = self
            .writes
            .run("complete", || {
                self.tasks
                    .transition(id, None, &[TaskStatus::Processing], &complete)
            })
            .await?;

        if let Some(winner) = self.lost_to(id, applied, &complete).await? {
            metrics::counter!("tasks_lost_race_total").increment(1);
            tracing::warn!(
                task_id = %id,
                winner = %winner,
                locator = %locator,
                "Generation finished after the task was terminated; result discarded"
            );
            audit::record(
                self.tasks.as_ref(),
                TaskLogEntry::note(
                    id,
                    Actor::Executor,
                    format!("result discarded, task already {winner}"),
                ),
            )
            .await;
            return Ok(ExecutionOutcome::LostRace { winner });
        }

        metrics::counter!("tasks_completed_total").increment(1);
        tracing::info!(task_id = %id, owner_id = %task.owner_id, "Task completed");
        audit::record(
            self.tasks.as_ref(),
            TaskLogEntry::transition(
                id,
                Actor::Executor,
                Some(TaskStatus::Processing),
                TaskStatus::Completed,
                "generation succeeded",
            ),
        )
        .await;

        self.charge(task).await;
        self.materialize_inline(id).await;
        self.signal.clear(id).await;

        Ok(ExecutionOutcome::Completed { result_ref: locator })
    }

    async fn fail(&self, task: &Task, error: ProviderError) -> Result<ExecutionOutcome, ExecutorError> {
        let id = task.id;
        let kind = error.kind;
        tracing::warn!(task_id = %id, owner_id = %task.owner_id, kind = %kind, error = %error.detail, "Generation failed");

        let failure = Transition::fail(kind.user_message());
        let applied = self
            .writes
            .run("fail", || {
                self.tasks
                    .transition(id, None, &[TaskStatus::Processing], &failure)
            })
            .await?;

        if let Some(winner) = self.lost_to(id, applied, &failure).await? {
            tracing::info!(task_id = %id, winner = %winner, "Failure write lost to another writer");
            return Ok(ExecutionOutcome::LostRace { winner });
        }

        metrics::counter!("tasks_failed_total", "kind" => kind.to_string()).increment(1);
        audit::record(
            self.tasks.as_ref(),
            TaskLogEntry::transition(
                id,
                Actor::Executor,
                Some(TaskStatus::Processing),
                TaskStatus::Failed,
                format!("{kind}: {}", error.detail),
            ),
        )
        .await;

        if let Err(e) = self.refund_if_charged(id).await {
            tracing::error!(task_id = %id, error = %e, "Refund after failure did not complete");
        }
        self.signal.clear(id).await;

        Ok(ExecutionOutcome::Failed { kind })
    }

    async fn charge(&self, task: &Task) {
        match self.ledger.deduct(task).await {
            Ok(DeductOutcome::Deducted) => {}
            Ok(DeductOutcome::AlreadyDeducted) => {
                metrics::counter!("credit_anomalies_total", "kind" => "already_deducted").increment(1);
                tracing::warn!(task_id = %task.id, "Completed task was already charged");
            }
            Ok(DeductOutcome::InsufficientBalance) => {
                metrics::counter!("credit_anomalies_total", "kind" => "insufficient_balance").increment(1);
                tracing::warn!(
                    task_id = %task.id,
                    owner_id = %task.owner_id,
                    "Completed task could not be charged, balance too low"
                );
            }
            Err(e) => {
                metrics::counter!("credit_anomalies_total", "kind" => "deduct_failed").increment(1);
                tracing::error!(task_id = %task.id, owner_id = %task.owner_id, error = %e, "Deduction failed");
            }
        }
    }

    async fn refund_if_charged(&self, id: TaskId) -> Result<(), LedgerError> {
        let Some(current) = self.tasks.get_task(id).await? else {
            return Ok(());
        };
        if current.credit_deducted && !current.credit_refunded {
            let outcome = self.ledger.refund(&current).await?;
            if outcome == RefundOutcome::Refunded {
                metrics::counter!("credit_anomalies_total", "kind" => "refund_after_failure").increment(1);
            }
        }
        Ok(())
    }

    async fn materialize_inline(&self, id: TaskId) {
        let task = match self.tasks.get_task(id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "Could not reload task for materialization");
                return;
            }
        };
        if let Err(e) = self.materializer.materialize(&task).await {
            tracing::warn!(task_id = %id, error = %e, "Inline materialization failed, sweep will retry");
        }
    }

    async fn progress(&self, id: TaskId, stage: Stage) {
        if let Err(e) = self.tasks.record_progress(id, stage).await {
            tracing::debug!(task_id = %id, stage = %stage, error = %e, "Progress update failed");
        }
    }

    /// Resolves a terminal write that reported "not applied". A retried
    /// write sees its own earlier commit that way when the acknowledgement
    /// was lost, so the row is compared against what we wrote before
    /// conceding the race. Returns the winner's status on a real loss.
    async fn lost_to(
        &self,
        id: TaskId,
        applied: bool,
        ours: &Transition,
    ) -> Result<Option<TaskStatus>, ExecutorError> {
        if applied {
            return Ok(None);
        }
        let current = self
            .tasks
            .get_task(id)
            .await?
            .ok_or(ExecutorError::Missing(id))?;
        let landed = current.status == ours.to
            && match ours.to {
                TaskStatus::Completed => current.provider_result_ref == ours.result_ref,
                _ => current.error_message == ours.error_message,
            };
        if landed {
            tracing::info!(task_id = %id, status = %current.status, "Terminal write landed on an earlier attempt");
            return Ok(None);
        }
        Ok(Some(current.status))
    }

    async fn current_status(&self, id: TaskId) -> Result<TaskStatus, ExecutorError> {
        Ok(self
            .tasks
            .get_task(id)
            .await?
            .ok_or(ExecutorError::Missing(id))?
            .status)
    }
}
