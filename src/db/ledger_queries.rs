use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{LatchedMutation, LedgerStore, StoreError};
use crate::models::task::TaskId;

/// PostgreSQL-backed credit balances.
///
/// Each balance mutation is a single-row atomic statement, so concurrent
/// tasks of the same owner cannot corrupt the balance.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn balance(&self, owner_id: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT balance FROM credit_balances WHERE owner_id = $1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("balance")?),
            None => None,
        })
    }

    async fn grant(&self, owner_id: &str, amount: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO credit_balances (owner_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (owner_id)
            DO UPDATE SET balance = credit_balances.balance + EXCLUDED.balance, updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(owner_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("balance")?)
    }

    async fn debit(&self, owner_id: &str, amount: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2, updated_at = NOW()
            WHERE owner_id = $1 AND balance >= $2
            "#,
        )
        .bind(owner_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn credit(&self, owner_id: &str, amount: i64) -> Result<(), StoreError> {
        self.grant(owner_id, amount).await?;
        Ok(())
    }

    async fn debit_for_task(
        &self,
        task_id: TaskId,
        owner_id: &str,
        amount: i64,
    ) -> Result<LatchedMutation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT credit_deducted FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::Unavailable(format!("task {task_id} not found")));
        };
        if row.try_get::<bool, _>("credit_deducted")? {
            tx.rollback().await?;
            return Ok(LatchedMutation::LatchAlreadySet);
        }

        let debited = sqlx::query(
            r#"
            UPDATE credit_balances
            SET balance = balance - $2, updated_at = NOW()
            WHERE owner_id = $1 AND balance >= $2
            "#,
        )
        .bind(owner_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;
        if debited.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(LatchedMutation::InsufficientBalance);
        }

        sqlx::query("UPDATE tasks SET credit_deducted = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(LatchedMutation::Applied)
    }

    async fn credit_for_task(
        &self,
        task_id: TaskId,
        owner_id: &str,
        amount: i64,
    ) -> Result<LatchedMutation, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT credit_deducted, credit_refunded FROM tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Err(StoreError::Unavailable(format!("task {task_id} not found")));
        };
        if row.try_get::<bool, _>("credit_refunded")? {
            tx.rollback().await?;
            return Ok(LatchedMutation::LatchAlreadySet);
        }
        if !row.try_get::<bool, _>("credit_deducted")? {
            tx.rollback().await?;
            return Ok(LatchedMutation::NotDeducted);
        }

        sqlx::query(
            r#"
            INSERT INTO credit_balances (owner_id, balance)
            VALUES ($1, $2)
            ON CONFLICT (owner_id)
            DO UPDATE SET balance = credit_balances.balance + EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(owner_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE tasks SET credit_refunded = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(LatchedMutation::Applied)
    }
}
