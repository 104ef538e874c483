//! Periodic backstop that terminates tasks stuck in `pending`/`processing`.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::db::{StoreError, TaskStore};
use crate::models::task::{Actor, Task, TaskLogEntry, TaskStatus, Transition};
use crate::services::audit;
use crate::services::ledger::{CreditLedger, RefundOutcome};
use crate::services::pool::WorkerPool;
use crate::services::retry::RetryPolicy;
use crate::services::signal::CancelSignal;

pub const STUCK_MESSAGE: &str = "exceeded processing time";

const BATCH_LIMIT: i64 = 500;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Rows that reached a terminal state through another writer first.
    pub skipped: usize,
    pub refunded: usize,
    pub pool_restarted: bool,
}

pub struct Reaper {
    tasks: Arc<dyn TaskStore>,
    ledger: Arc<CreditLedger>,
    signal: Arc<dyn CancelSignal>,
    pool: Option<Arc<WorkerPool>>,
    stuck_after: Duration,
    writes: RetryPolicy,
}

impl Reaper {
    /// `tasks` should be the privileged store.
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        ledger: Arc<CreditLedger>,
        signal: Arc<dyn CancelSignal>,
        pool: Option<Arc<WorkerPool>>,
        stuck_after: Duration,
    ) -> Self {
        Self {
            tasks,
            ledger,
            signal,
            pool,
            stuck_after,
            writes: RetryPolicy::default(),
        }
    }

    pub async fn sweep(&self) -> Result<ReapReport, StoreError> {
        let mut report = ReapReport::default();

        if let Some(pool) = &self.pool {
            if !pool.is_alive() {
                tracing::warn!("Worker pool is not alive, restarting");
                pool.restart();
                report.pool_restarted = true;
            }
        }

        let stuck_after = chrono::Duration::from_std(self.stuck_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let cutoff = Utc::now() - stuck_after;
        let stuck = self.tasks.list_stuck(cutoff, BATCH_LIMIT).await?;
        report.scanned = stuck.len();

        for task in stuck {
            match self.reap(&task).await {
                Ok(Some((status, refund))) => {
                    match status {
                        TaskStatus::Cancelled => report.cancelled += 1,
                        _ => report.failed += 1,
                    }
                    if refund == Some(RefundOutcome::Refunded) {
                        report.refunded += 1;
                    }
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to reap task");
                }
            }
        }

        if report.scanned > 0 || report.pool_restarted {
            tracing::info!(
                scanned = report.scanned,
                failed = report.failed,
                cancelled = report.cancelled,
                skipped = report.skipped,
                refunded = report.refunded,
                pool_restarted = report.pool_restarted,
                "Reaper sweep finished"
            );
        }
        Ok(report)
    }

    /// Terminate one task. `None` when another writer got there first.
    async fn reap(
        &self,
        task: &Task,
    ) -> Result<Option<(TaskStatus, Option<RefundOutcome>)>, StoreError> {
        let transition = if self.signal.is_cancelled(task.id).await {
            Transition::cancel().with_error(STUCK_MESSAGE)
        } else {
            Transition::fail(STUCK_MESSAGE)
        };
        let target = transition.to;

        let applied = self
            .writes
            .run("reap", || {
                self.tasks
                    .transition(task.id, None, &TaskStatus::ACTIVE, &transition)
            })
            .await?;
        if !applied {
            return Ok(None);
        }

        metrics::counter!("tasks_reaped_total").increment(1);
        tracing::warn!(
            task_id = %task.id,
            owner_id = %task.owner_id,
            from = %task.status,
            to = %target,
            age_secs = (Utc::now() - task.created_at).num_seconds(),
            "Reaped stuck task"
        );
        audit::record(
            self.tasks.as_ref(),
            TaskLogEntry::transition(task.id, Actor::Reaper, Some(task.status), target, STUCK_MESSAGE),
        )
        .await;
        self.signal.clear(task.id).await;

        let refund = match self.ledger.refund(task).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                metrics::counter!("credit_anomalies_total", "kind" => "reap_refund_failed").increment(1);
                tracing::error!(task_id = %task.id, error = %e, "Refund for reaped task failed");
                None
            }
        };
        Ok(Some((target, refund)))
    }

    /// Runs `sweep` every `period` until `shutdown` flips to `true`. The flag
    /// is level-triggered, so a signal sent mid-sweep is still seen.
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                        tracing::info!("Reaper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            tracing::error!(error = %e, "Reaper sweep failed");
                        }
                    }
                }
            }
        })
    }
}
