use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::api::TaskView;
use crate::models::task::{Task, TaskStatus};

const PENDING_POLL_MS: u64 = 2_000;
const MIN_POLL_MS: u64 = 1_000;
const MAX_POLL_MS: u64 = 5_000;

/// Read-only projection of a task for polling clients.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    typical: Duration,
    ceiling: Duration,
}

impl ProgressReporter {
    /// `typical` is used before any real progress exists; estimates never
    /// exceed what is left of `ceiling` (the provider timeout).
    pub fn new(typical: Duration, ceiling: Duration) -> Self {
        Self { typical, ceiling }
    }

    pub fn view(&self, task: &Task, now: DateTime<Utc>) -> TaskView {
        let remaining = self.estimate_remaining(task, now);
        TaskView {
            task_id: task.id,
            status: task.status,
            progress_percentage: task.progress_percentage,
            stage: task.stage.clone(),
            result_ref: task.result_ref.clone(),
            error_message: task.error_message.clone(),
            estimated_remaining_secs: remaining,
            poll_after_ms: poll_after(task.status, remaining),
        }
    }

    /// Linear extrapolation from elapsed time and progress.
    pub fn estimate_remaining(&self, task: &Task, now: DateTime<Utc>) -> Option<u64> {
        if task.status.is_terminal() {
            return None;
        }
        let started = task.processing_started_at.unwrap_or(task.created_at);
        let elapsed = (now - started).num_seconds().max(0) as u64;
        let left_in_budget = self.ceiling.as_secs().saturating_sub(elapsed);

        let progress = u64::from(task.progress_percentage.min(99));
        let estimate = if task.status == TaskStatus::Pending || progress <= 5 || elapsed == 0 {
            self.typical.as_secs().saturating_sub(elapsed)
        } else {
            let total = elapsed * 100 / progress;
            total.saturating_sub(elapsed)
        };
        Some(estimate.min(left_in_budget))
    }
}

fn poll_after(status: TaskStatus, remaining: Option<u64>) -> Option<u64> {
    match (status, remaining) {
        (s, _) if s.is_terminal() => None,
        (TaskStatus::Pending, _) => Some(PENDING_POLL_MS),
        (_, Some(secs)) => Some((secs * 1000 / 10).clamp(MIN_POLL_MS, MAX_POLL_MS)),
        (_, None) => Some(MAX_POLL_MS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::{NewTask, TaskInput, Transition};
    use uuid::Uuid;

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(Duration::from_secs(45), Duration::from_secs(180))
    }

    fn task_at(now: DateTime<Utc>) -> Task {
        NewTask {
            id: Uuid::new_v4(),
            owner_id: "alice".into(),
            input: TaskInput::from_prompt("a red bicycle"),
        }
        .into_task(now)
    }

    #[test]
    fn test_pending_uses_typical_duration() {
        let now = Utc::now();
        let task = task_at(now - chrono::Duration::seconds(10));
        let view = reporter().view(&task, now);

        assert_eq!(view.estimated_remaining_secs, Some(35));
        assert_eq!(view.poll_after_ms, Some(PENDING_POLL_MS));
    }

    #[test]
    fn test_processing_extrapolates_linearly() {
        let now = Utc::now();
        let mut task = task_at(now);
        Transition::start().apply(&mut task, now - chrono::Duration::seconds(20));
        task.progress_percentage = 40;

        // 20s for 40% -> 50s total -> 30s left
        assert_eq!(reporter().estimate_remaining(&task, now), Some(30));
    }

    #[test]
    fn test_estimate_clamped_to_timeout() {
        let now = Utc::now();
        let mut task = task_at(now);
        Transition::start().apply(&mut task, now - chrono::Duration::seconds(170));
        task.progress_percentage = 15;

        assert_eq!(reporter().estimate_remaining(&task, now), Some(10));
    }

    #[test]
    fn test_terminal_has_no_estimate() {
        let now = Utc::now();
        let mut task = task_at(now);
        Transition::start().apply(&mut task, now);
        Transition::complete("https://media.acme.io/a.png").apply(&mut task, now);

        let view = reporter().view(&task, now);
        assert_eq!(view.estimated_remaining_secs, None);
        assert_eq!(view.poll_after_ms, None);
        assert_eq!(view.result_ref.as_deref(), Some("https://media.acme.io/a.png"));
    }
}
