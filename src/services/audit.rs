use crate::db::TaskStore;
use crate::models::task::TaskLogEntry;

/// Append a task log entry. The audit trail never blocks a state change.
pub async fn record(tasks: &dyn TaskStore, entry: TaskLogEntry) {
    if let Err(e) = tasks.append_log(&entry).await {
        tracing::warn!(
            task_id = %entry.task_id,
            actor = %entry.actor,
            error = %e,
            "Failed to append task log entry"
        );
    }
}
