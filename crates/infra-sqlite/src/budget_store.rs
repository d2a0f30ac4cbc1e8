// SQLite BudgetStore Implementation

use crate::error::map_sqlx_error;
use async_trait::async_trait;
use conveyor_core::domain::{BudgetPeriod, PeriodKey, Threshold, UsageDelta};
use conveyor_core::error::{AppError, Result};
use conveyor_core::port::{BudgetStore, TimeProvider};
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct SqliteBudgetStore {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteBudgetStore {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    async fn ensure_row(&self, period: PeriodKey, provider: &str, ceiling_cents: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO budget_periods (period_key, provider, ceiling_cents, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (period_key, provider) DO NOTHING
            "#,
        )
        .bind(period.to_string())
        .bind(provider)
        .bind(ceiling_cents)
        .bind(self.time_provider.now_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl BudgetStore for SqliteBudgetStore {
    async fn find_or_create(
        &self,
        period: PeriodKey,
        provider: &str,
        default_ceiling_cents: i64,
    ) -> Result<BudgetPeriod> {
        self.ensure_row(period, provider, default_ceiling_cents).await?;

        let row = sqlx::query_as::<_, BudgetRow>(
            "SELECT * FROM budget_periods WHERE period_key = ? AND provider = ?",
        )
        .bind(period.to_string())
        .bind(provider)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.into_period()
    }

    async fn record_usage(
        &self,
        period: PeriodKey,
        provider: &str,
        default_ceiling_cents: i64,
        delta: &UsageDelta,
    ) -> Result<BudgetPeriod> {
        self.ensure_row(period, provider, default_ceiling_cents).await?;

        // Single-statement increment: concurrent recorders never lose an update
        let row = sqlx::query_as::<_, BudgetRow>(
            r#"
            UPDATE budget_periods
            SET request_count = request_count + ?,
                input_units = input_units + ?,
                output_units = output_units + ?,
                cost_cents = cost_cents + ?,
                updated_at = ?
            WHERE period_key = ? AND provider = ?
            RETURNING *
            "#,
        )
        .bind(delta.requests)
        .bind(delta.input_units)
        .bind(delta.output_units)
        .bind(delta.cost_cents)
        .bind(self.time_provider.now_millis())
        .bind(period.to_string())
        .bind(provider)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.into_period()
    }

    async fn set_ceiling(
        &self,
        period: PeriodKey,
        provider: &str,
        ceiling_cents: i64,
    ) -> Result<BudgetPeriod> {
        let row = sqlx::query_as::<_, BudgetRow>(
            r#"
            INSERT INTO budget_periods (period_key, provider, ceiling_cents, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (period_key, provider)
            DO UPDATE SET ceiling_cents = ?3, updated_at = ?4
            RETURNING *
            "#,
        )
        .bind(period.to_string())
        .bind(provider)
        .bind(ceiling_cents)
        .bind(self.time_provider.now_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.into_period()
    }

    async fn claim_notification(
        &self,
        period: PeriodKey,
        provider: &str,
        threshold: Threshold,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE budget_periods
            SET notified_mask = notified_mask | ?1
            WHERE period_key = ?2 AND provider = ?3 AND (notified_mask & ?1) = 0
            "#,
        )
        .bind(threshold.bit())
        .bind(period.to_string())
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BudgetRow {
    period_key: String,
    provider: String,
    request_count: i64,
    input_units: i64,
    output_units: i64,
    cost_cents: i64,
    ceiling_cents: i64,
    notified_mask: i64,
    updated_at: i64,
}

impl BudgetRow {
    fn into_period(self) -> Result<BudgetPeriod> {
        let period: PeriodKey = self.period_key.parse().map_err(|e| {
            AppError::Database(format!("Corrupt budget row {}: {}", self.period_key, e))
        })?;

        Ok(BudgetPeriod {
            period,
            provider: self.provider,
            request_count: self.request_count,
            input_units: self.input_units,
            output_units: self.output_units,
            cost_cents: self.cost_cents,
            ceiling_cents: self.ceiling_cents,
            notified_mask: self.notified_mask,
            updated_at: self.updated_at,
        })
    }
}
