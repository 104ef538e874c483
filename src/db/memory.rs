//! In-memory task and ledger store for tests and local development.
//!
//! One mutex guards tasks, balances and logs together, so every trait method
//! is atomic with respect to every other, mirroring the row-level guarantees
//! of the PostgreSQL implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{check_edges, LatchedMutation, LedgerStore, StoreError, TaskStore};
use crate::models::task::{
    InsertOutcome, Latch, NewTask, Stage, Task, TaskId, TaskLogEntry, TaskStatus, Transition,
};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    balances: HashMap<String, i64>,
    logs: Vec<TaskLogEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shift a task's timestamps into the past, as if it had been created earlier.
    pub fn backdate(&self, id: TaskId, by: chrono::Duration) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(&id) {
            Some(task) => {
                task.created_at -= by;
                task.updated_at -= by;
                if let Some(started) = task.processing_started_at.as_mut() {
                    *started -= by;
                }
                true
            }
            None => false,
        }
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }
}

fn try_transition(
    inner: &mut Inner,
    id: TaskId,
    owner: Option<&str>,
    from: &[TaskStatus],
    transition: &Transition,
) -> Result<bool, StoreError> {
    check_edges(from, transition.to)?;
    let Some(task) = inner.tasks.get_mut(&id) else {
        return Ok(false);
    };
    if owner.is_some_and(|o| o != task.owner_id) || !from.contains(&task.status) {
        return Ok(false);
    }
    transition.apply(task, Utc::now());
    Ok(true)
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &NewTask) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.tasks.get(&task.id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let created = task.clone().into_task(Utc::now());
        inner.tasks.insert(created.id, created.clone());
        Ok(InsertOutcome::Created(created))
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        try_transition(&mut self.lock(), id, owner, from, transition)
    }

    async fn transition_atomic(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        try_transition(&mut self.lock(), id, owner, from, transition)
    }

    async fn record_progress(&self, id: TaskId, stage: Stage) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status.is_terminal() || task.progress_percentage > stage.progress() {
            return Ok(false);
        }
        task.stage = stage.to_string();
        task.progress_percentage = stage.progress();
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_latch(&self, id: TaskId, latch: Latch) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        let flag = match latch {
            Latch::CreditDeducted => &mut task.credit_deducted,
            Latch::CreditRefunded => &mut task.credit_refunded,
        };
        if *flag {
            return Ok(false);
        }
        *flag = true;
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_materialized(&self, id: TaskId, stable_ref: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Completed || task.materialized_at.is_some() {
            return Ok(false);
        }
        let now = Utc::now();
        task.result_ref = Some(stable_ref.to_string());
        task.materialized_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn list_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut stuck: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal() && t.created_at < cutoff)
            .cloned()
            .collect();
        stuck.sort_by_key(|t| t.created_at);
        stuck.truncate(limit.max(0) as usize);
        Ok(stuck)
    }

    async fn list_unmaterialized(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut pending: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Completed
                    && t.materialized_at.is_none()
                    && t.provider_result_ref.is_some()
            })
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.completed_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn append_log(&self, entry: &TaskLogEntry) -> Result<(), StoreError> {
        self.lock().logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError> {
        Ok(self
            .lock()
            .logs
            .iter()
            .filter(|e| e.task_id == id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn balance(&self, owner_id: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.lock().balances.get(owner_id).copied())
    }

    async fn grant(&self, owner_id: &str, amount: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let balance = inner.balances.entry(owner_id.to_string()).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }

    async fn debit(&self, owner_id: &str, amount: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.balances.get_mut(owner_id) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn credit(&self, owner_id: &str, amount: i64) -> Result<(), StoreError> {
        *self.lock().balances.entry(owner_id.to_string()).or_insert(0) += amount;
        Ok(())
    }

    async fn debit_for_task(
        &self,
        task_id: TaskId,
        owner_id: &str,
        amount: i64,
    ) -> Result<LatchedMutation, StoreError> {
        let mut inner = self.lock();
        let Inner {
            tasks, balances, ..
        } = &mut *inner;

        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::Unavailable(format!("task {task_id} not found")))?;
        if task.credit_deducted {
            return Ok(LatchedMutation::LatchAlreadySet);
        }
        match balances.get_mut(owner_id) {
            Some(balance) if *balance >= amount => *balance -= amount,
            _ => return Ok(LatchedMutation::InsufficientBalance),
        }
        task.credit_deducted = true;
        task.updated_at = Utc::now();
        Ok(LatchedMutation::Applied)
    }

    async fn credit_for_task(
        &self,
        task_id: TaskId,
        owner_id: &str,
        amount: i64,
    ) -> Result<LatchedMutation, StoreError> {
        let mut inner = self.lock();
        let Inner {
            tasks, balances, ..
        } = &mut *inner;

        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::Unavailable(format!("task {task_id} not found")))?;
        if task.credit_refunded {
            return Ok(LatchedMutation::LatchAlreadySet);
        }
        if !task.credit_deducted {
            return Ok(LatchedMutation::NotDeducted);
        }
        *balances.entry(owner_id.to_string()).or_insert(0) += amount;
        task.credit_refunded = true;
        task.updated_at = Utc::now();
        Ok(LatchedMutation::Applied)
    }
}
