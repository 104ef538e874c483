use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::task::{
    InsertOutcome, Latch, NewTask, Stage, Task, TaskId, TaskLogEntry, TaskStatus, Transition,
};

pub mod ledger_queries;
pub mod memory;
pub mod queries;

pub use ledger_queries::PgLedgerStore;
pub use memory::MemoryStore;
pub use queries::PgTaskStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row for task {task_id}: {reason}")]
    Corrupt { task_id: TaskId, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A caller asked for an edge the state machine does not have.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

/// Reject transitions whose expected source cannot reach the target.
pub(crate) fn check_edges(from: &[TaskStatus], to: TaskStatus) -> Result<(), StoreError> {
    match from.iter().find(|status| !status.can_transition_to(to)) {
        Some(&bad) => Err(StoreError::IllegalTransition { from: bad, to }),
        None => Ok(()),
    }
}

/// Durable record of tasks and their lifecycle.
///
/// Every status change goes through [`TaskStore::transition`] or
/// [`TaskStore::transition_atomic`]; both only apply when the row's current
/// status is one of `from` (and, when given, the row belongs to `owner`).
/// The returned bool reports whether the write applied, which makes the store
/// the arbiter between racing writers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert in `pending`, or return the existing row if the id is taken.
    async fn insert_task(&self, task: &NewTask) -> Result<InsertOutcome, StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn transition(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError>;

    /// Same contract as [`TaskStore::transition`], executed under a row lock.
    async fn transition_atomic(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError>;

    /// Applies only to non-terminal rows whose progress would not decrease.
    async fn record_progress(&self, id: TaskId, stage: Stage) -> Result<bool, StoreError>;

    /// Flip a latch false -> true. Returns false if it was already set.
    async fn set_latch(&self, id: TaskId, latch: Latch) -> Result<bool, StoreError>;

    /// Record the stable result locator for a completed task, once.
    async fn set_materialized(&self, id: TaskId, stable_ref: &str) -> Result<bool, StoreError>;

    /// Non-terminal tasks created before `cutoff`, oldest first.
    async fn list_stuck(&self, cutoff: DateTime<Utc>, limit: i64)
        -> Result<Vec<Task>, StoreError>;

    /// Completed tasks with a provider locator and no materialization marker.
    async fn list_unmaterialized(&self, limit: i64) -> Result<Vec<Task>, StoreError>;

    async fn append_log(&self, entry: &TaskLogEntry) -> Result<(), StoreError>;

    async fn list_logs(&self, id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Result of a ledger mutation guarded by a task latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchedMutation {
    Applied,
    LatchAlreadySet,
    InsufficientBalance,
    NotDeducted,
}

/// Per-owner credit balances.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn balance(&self, owner_id: &str) -> Result<Option<i64>, StoreError>;

    /// Add credits, creating the owner's row if needed.
    async fn grant(&self, owner_id: &str, amount: i64) -> Result<i64, StoreError>;

    /// Single-row conditional decrement; false if the balance is too low.
    async fn debit(&self, owner_id: &str, amount: i64) -> Result<bool, StoreError>;

    async fn credit(&self, owner_id: &str, amount: i64) -> Result<(), StoreError>;

    /// Check the deduction latch, debit and set the latch in one transaction.
    async fn debit_for_task(
        &self,
        task_id: TaskId,
        owner_id: &str,
        amount: i64,
    ) -> Result<LatchedMutation, StoreError>;

    /// Check both latches, credit and set the refund latch in one transaction.
    async fn credit_for_task(
        &self,
        task_id: TaskId,
        owner_id: &str,
        amount: i64,
    ) -> Result<LatchedMutation, StoreError>;
}
