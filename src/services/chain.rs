//! Ordered write strategies for forcing a status change through.
//!
//! Each strategy performs the same conditional transition over a different
//! write path. [`run_chain`] tries them in order and stops at the first one
//! whose write applied.

use async_trait::async_trait;
use std::sync::Arc;

use crate::db::{StoreError, TaskStore};
use crate::models::task::{TaskId, TaskStatus, Transition};

#[async_trait]
pub trait TransitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(
        &self,
        id: TaskId,
        owner: &str,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError>;
}

/// Row-locked transaction on the standard connection.
pub struct AtomicWrite(pub Arc<dyn TaskStore>);

/// Plain conditional update on the standard connection.
pub struct StandardWrite(pub Arc<dyn TaskStore>);

/// Conditional update through the privileged connection, still owner-filtered.
pub struct PrivilegedWrite(pub Arc<dyn TaskStore>);

#[async_trait]
impl TransitionStrategy for AtomicWrite {
    fn name(&self) -> &'static str {
        "atomic"
    }

    async fn attempt(
        &self,
        id: TaskId,
        owner: &str,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        self.0.transition_atomic(id, Some(owner), from, transition).await
    }
}

#[async_trait]
impl TransitionStrategy for StandardWrite {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn attempt(
        &self,
        id: TaskId,
        owner: &str,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        self.0.transition(id, Some(owner), from, transition).await
    }
}

#[async_trait]
impl TransitionStrategy for PrivilegedWrite {
    fn name(&self) -> &'static str {
        "privileged"
    }

    async fn attempt(
        &self,
        id: TaskId,
        owner: &str,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        self.0.transition(id, Some(owner), from, transition).await
    }
}

/// What happened across a chain run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChainReport {
    /// Name of the strategy whose write applied, if any.
    pub applied_by: Option<&'static str>,
    /// Strategies that returned an error.
    pub errors: Vec<&'static str>,
}

pub async fn run_chain(
    chain: &[Box<dyn TransitionStrategy>],
    id: TaskId,
    owner: &str,
    from: &[TaskStatus],
    transition: &Transition,
) -> ChainReport {
    let mut report = ChainReport::default();
    for strategy in chain {
        match strategy.attempt(id, owner, from, transition).await {
            Ok(true) => {
                tracing::debug!(task_id = %id, strategy = strategy.name(), "Transition applied");
                report.applied_by = Some(strategy.name());
                break;
            }
            Ok(false) => {
                tracing::debug!(task_id = %id, strategy = strategy.name(), "Transition not applied");
            }
            Err(e) => {
                tracing::warn!(task_id = %id, strategy = strategy.name(), error = %e, "Write strategy failed");
                report.errors.push(strategy.name());
            }
        }
    }
    report
}
