use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

use super::{check_edges, StoreError, TaskStore};
use crate::models::task::{
    Actor, InsertOutcome, Latch, NewTask, Stage, Task, TaskId, TaskInput, TaskLogEntry,
    TaskStatus, Transition,
};

const TASK_COLUMNS: &str = r#"
    id, owner_id, status, input, progress_percentage, stage, result_ref,
    provider_result_ref, error_message, credit_deducted, credit_refunded,
    materialized_at, created_at, updated_at, processing_started_at, completed_at
"#;

/// PostgreSQL-backed task store.
///
/// Construct one per credential: the standard application role and the
/// privileged role used by the reaper and the last-resort cancellation path.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_status(task_id: TaskId, raw: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::from_str(raw).map_err(|_| StoreError::Corrupt {
        task_id,
        reason: format!("unknown status '{raw}'"),
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let Json(input): Json<TaskInput> = row.try_get("input")?;
    let progress: i16 = row.try_get("progress_percentage")?;

    Ok(Task {
        id,
        owner_id: row.try_get("owner_id")?,
        status: parse_status(id, &status)?,
        input,
        progress_percentage: progress.clamp(0, 100) as u8,
        stage: row.try_get("stage")?,
        result_ref: row.try_get("result_ref")?,
        provider_result_ref: row.try_get("provider_result_ref")?,
        error_message: row.try_get("error_message")?,
        credit_deducted: row.try_get("credit_deducted")?,
        credit_refunded: row.try_get("credit_refunded")?,
        materialized_at: row.try_get("materialized_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn status_names(statuses: &[TaskStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_ref().to_string()).collect()
}

/// Conditional update shared by the plain and the row-locked paths.
async fn apply_transition<'e, E: PgExecutor<'e>>(
    executor: E,
    id: TaskId,
    owner: Option<&str>,
    from: &[TaskStatus],
    transition: &Transition,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE tasks
        SET status = $2,
            stage = COALESCE($3, stage),
            progress_percentage = COALESCE($4, progress_percentage),
            result_ref = COALESCE($5, result_ref),
            provider_result_ref = COALESCE($5, provider_result_ref),
            error_message = COALESCE($6, error_message),
            processing_started_at = CASE WHEN $2 = 'processing' THEN NOW() ELSE processing_started_at END,
            completed_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled') THEN NOW() ELSE completed_at END,
            updated_at = NOW()
        WHERE id = $1
          AND status = ANY($7)
          AND ($8::TEXT IS NULL OR owner_id = $8)
        "#,
    )
    .bind(id)
    .bind(transition.to.as_ref())
    .bind(transition.stage.map(|s| s.to_string()))
    .bind(transition.progress.map(i16::from))
    .bind(transition.result_ref.as_deref())
    .bind(transition.error_message.as_deref())
    .bind(status_names(from))
    .bind(owner)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, task: &NewTask) -> Result<InsertOutcome, StoreError> {
        let query = format!(
            r#"
            INSERT INTO tasks (id, owner_id, status, input, progress_percentage, stage)
            VALUES ($1, $2, 'pending', $3, 0, $4)
            ON CONFLICT (id) DO NOTHING
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(task.id)
            .bind(&task.owner_id)
            .bind(Json(&task.input))
            .bind(Stage::Queued.to_string())
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            return Ok(InsertOutcome::Created(task_from_row(&row)?));
        }

        match self.get_task(task.id).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => Err(StoreError::Unavailable(format!(
                "task {} conflicted on insert but could not be read back",
                task.id
            ))),
        }
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn transition(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        check_edges(from, transition.to)?;
        apply_transition(&self.pool, id, owner, from, transition).await
    }

    async fn transition_atomic(
        &self,
        id: TaskId,
        owner: Option<&str>,
        from: &[TaskStatus],
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        check_edges(from, transition.to)?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT status, owner_id FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let status: String = row.try_get("status")?;
        let row_owner: String = row.try_get("owner_id")?;
        let owner_matches = owner.map_or(true, |o| o == row_owner);
        if !owner_matches || !from.contains(&parse_status(id, &status)?) {
            tx.rollback().await?;
            return Ok(false);
        }

        let applied = apply_transition(&mut *tx, id, owner, from, transition).await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn record_progress(&self, id: TaskId, stage: Stage) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET stage = $2, progress_percentage = $3, updated_at = NOW()
            WHERE id = $1
              AND status IN ('pending', 'processing')
              AND progress_percentage <= $3
            "#,
        )
        .bind(id)
        .bind(stage.to_string())
        .bind(i16::from(stage.progress()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_latch(&self, id: TaskId, latch: Latch) -> Result<bool, StoreError> {
        let sql = match latch {
            Latch::CreditDeducted => {
                "UPDATE tasks SET credit_deducted = TRUE, updated_at = NOW() \
                 WHERE id = $1 AND credit_deducted = FALSE"
            }
            Latch::CreditRefunded => {
                "UPDATE tasks SET credit_refunded = TRUE, updated_at = NOW() \
                 WHERE id = $1 AND credit_refunded = FALSE"
            }
        };
        let result = sqlx::query(sql).bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_materialized(&self, id: TaskId, stable_ref: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET result_ref = $2, materialized_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'completed' AND materialized_at IS NULL
            "#,
        )
        .bind(id)
        .bind(stable_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, StoreError> {
        let query = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status IN ('pending', 'processing') AND created_at < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn list_unmaterialized(&self, limit: i64) -> Result<Vec<Task>, StoreError> {
        let query = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status = 'completed'
              AND materialized_at IS NULL
              AND provider_result_ref IS NOT NULL
            ORDER BY completed_at ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn append_log(&self, entry: &TaskLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_logs (task_id, actor, from_status, to_status, note, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.task_id)
        .bind(entry.actor.as_ref())
        .bind(entry.from_status.map(|s| s.as_ref().to_string()))
        .bind(entry.to_status.map(|s| s.as_ref().to_string()))
        .bind(&entry.note)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_logs(&self, id: TaskId) -> Result<Vec<TaskLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, actor, from_status, to_status, note, created_at
            FROM task_logs
            WHERE task_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let actor: String = r.try_get("actor")?;
                let from_status: Option<String> = r.try_get("from_status")?;
                let to_status: Option<String> = r.try_get("to_status")?;
                Ok(TaskLogEntry {
                    task_id: r.try_get("task_id")?,
                    actor: Actor::from_str(&actor).map_err(|_| StoreError::Corrupt {
                        task_id: id,
                        reason: format!("unknown log actor '{actor}'"),
                    })?,
                    from_status: from_status.as_deref().map(|s| parse_status(id, s)).transpose()?,
                    to_status: to_status.as_deref().map(|s| parse_status(id, s)).transpose()?,
                    note: r.try_get("note")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
