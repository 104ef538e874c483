//! Per-task credit deduction and refund.
//!
//! Both operations are guarded by one-way latches on the task row. The
//! preferred path runs latch check, balance mutation and latch set in a
//! single store transaction. When that path errors, a check-then-act path
//! over separate conditional writes takes over; it compensates when it loses
//! a latch race so the balance still moves at most once per latch.

use std::sync::Arc;

use crate::db::{LatchedMutation, LedgerStore, StoreError, TaskStore};
use crate::models::task::{Latch, Task, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    Deducted,
    AlreadyDeducted,
    InsufficientBalance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Refunded,
    AlreadyRefunded,
    NotDeducted,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} not found")]
    TaskMissing(TaskId),

    #[error("unexpected ledger result {result:?} for task {task_id}")]
    Unexpected {
        task_id: TaskId,
        result: LatchedMutation,
    },
}

pub struct CreditLedger {
    tasks: Arc<dyn TaskStore>,
    store: Arc<dyn LedgerStore>,
    cost: i64,
}

impl CreditLedger {
    pub fn new(tasks: Arc<dyn TaskStore>, store: Arc<dyn LedgerStore>, cost: i64) -> Self {
        Self { tasks, store, cost }
    }

    pub fn cost(&self) -> i64 {
        self.cost
    }

    pub async fn balance(&self, owner_id: &str) -> Result<i64, LedgerError> {
        Ok(self.store.balance(owner_id).await?.unwrap_or(0))
    }

    pub async fn grant(&self, owner_id: &str, amount: i64) -> Result<i64, LedgerError> {
        let balance = self.store.grant(owner_id, amount).await?;
        tracing::info!(owner_id, amount, balance, "Credits granted");
        Ok(balance)
    }

    pub async fn deduct(&self, task: &Task) -> Result<DeductOutcome, LedgerError> {
        match self
            .store
            .debit_for_task(task.id, &task.owner_id, self.cost)
            .await
        {
            Ok(result) => {
                let outcome = match result {
                    LatchedMutation::Applied => DeductOutcome::Deducted,
                    LatchedMutation::LatchAlreadySet => DeductOutcome::AlreadyDeducted,
                    LatchedMutation::InsufficientBalance => DeductOutcome::InsufficientBalance,
                    LatchedMutation::NotDeducted => {
                        return Err(LedgerError::Unexpected {
                            task_id: task.id,
                            result,
                        })
                    }
                };
                self.log_deduct(task, outcome, "atomic");
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Atomic deduction failed, using latched path");
                let outcome = self.deduct_latched(task).await?;
                self.log_deduct(task, outcome, "latched");
                Ok(outcome)
            }
        }
    }

    pub async fn refund(&self, task: &Task) -> Result<RefundOutcome, LedgerError> {
        match self
            .store
            .credit_for_task(task.id, &task.owner_id, self.cost)
            .await
        {
            Ok(result) => {
                let outcome = match result {
                    LatchedMutation::Applied => RefundOutcome::Refunded,
                    LatchedMutation::LatchAlreadySet => RefundOutcome::AlreadyRefunded,
                    LatchedMutation::NotDeducted => RefundOutcome::NotDeducted,
                    LatchedMutation::InsufficientBalance => {
                        return Err(LedgerError::Unexpected {
                            task_id: task.id,
                            result,
                        })
                    }
                };
                self.log_refund(task, outcome, "atomic");
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Atomic refund failed, using latched path");
                let outcome = self.refund_latched(task).await?;
                self.log_refund(task, outcome, "latched");
                Ok(outcome)
            }
        }
    }

    async fn current(&self, id: TaskId) -> Result<Task, LedgerError> {
        self.tasks
            .get_task(id)
            .await?
            .ok_or(LedgerError::TaskMissing(id))
    }

    /// Read latch, debit, set latch. Losing the latch race credits the debit back.
    async fn deduct_latched(&self, task: &Task) -> Result<DeductOutcome, LedgerError> {
        if self.current(task.id).await?.credit_deducted {
            return Ok(DeductOutcome::AlreadyDeducted);
        }
        if !self.store.debit(&task.owner_id, self.cost).await? {
            return Ok(DeductOutcome::InsufficientBalance);
        }

        match self.tasks.set_latch(task.id, Latch::CreditDeducted).await {
            Ok(true) => Ok(DeductOutcome::Deducted),
            Ok(false) => {
                self.compensate(task, "deduct_latch_lost").await?;
                Ok(DeductOutcome::AlreadyDeducted)
            }
            Err(e) => {
                self.compensate(task, "deduct_latch_failed").await?;
                Err(e.into())
            }
        }
    }

    /// The refund latch is taken before crediting, so a racing refund cannot credit twice.
    async fn refund_latched(&self, task: &Task) -> Result<RefundOutcome, LedgerError> {
        let current = self.current(task.id).await?;
        if current.credit_refunded {
            return Ok(RefundOutcome::AlreadyRefunded);
        }
        if !current.credit_deducted {
            return Ok(RefundOutcome::NotDeducted);
        }
        if !self.tasks.set_latch(task.id, Latch::CreditRefunded).await? {
            return Ok(RefundOutcome::AlreadyRefunded);
        }

        if let Err(e) = self.store.credit(&task.owner_id, self.cost).await {
            metrics::counter!("credit_anomalies_total", "kind" => "refund_latched_without_credit")
                .increment(1);
            tracing::error!(
                task_id = %task.id,
                owner_id = %task.owner_id,
                amount = self.cost,
                error = %e,
                "Refund latch set but credit failed"
            );
            return Err(e.into());
        }
        Ok(RefundOutcome::Refunded)
    }

    async fn compensate(&self, task: &Task, reason: &'static str) -> Result<(), LedgerError> {
        metrics::counter!("credit_anomalies_total", "kind" => reason).increment(1);
        tracing::warn!(task_id = %task.id, owner_id = %task.owner_id, reason, "Crediting back debit");
        self.store.credit(&task.owner_id, self.cost).await?;
        Ok(())
    }

    fn log_deduct(&self, task: &Task, outcome: DeductOutcome, path: &'static str) {
        tracing::info!(
            task_id = %task.id,
            owner_id = %task.owner_id,
            amount = self.cost,
            path,
            outcome = ?outcome,
            "Credit deduction"
        );
    }

    fn log_refund(&self, task: &Task, outcome: RefundOutcome, path: &'static str) {
        tracing::info!(
            task_id = %task.id,
            owner_id = %task.owner_id,
            amount = self.cost,
            path,
            outcome = ?outcome,
            "Credit refund"
        );
    }
}
