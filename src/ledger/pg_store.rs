use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::{Position, PositionStatus};

use super::store::{LedgerStore, StoreError};

/// Database row for the positions table.
#[derive(Debug, Clone, FromRow)]
struct PositionRow {
    id: Uuid,
    wallet: String,
    market_id: String,
    owned_size: Decimal,
    avg_entry_price: Decimal,
    budget_committed: Decimal,
    stop_loss_pct: Decimal,
    take_profit_pct: Decimal,
    status: String,
    needs_review: bool,
    realized_pnl: Decimal,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    version: i64,
}

impl PositionRow {
    fn into_position(self) -> anyhow::Result<Position> {
        let status = PositionStatus::from_str(&self.status)
            .ok_or_else(|| anyhow::anyhow!("unknown position status {:?}", self.status))?;
        Ok(Position {
            id: self.id,
            wallet: self.wallet,
            market_id: self.market_id,
            owned_size: self.owned_size,
            avg_entry_price: self.avg_entry_price,
            budget_committed: self.budget_committed,
            stop_loss_pct: self.stop_loss_pct,
            take_profit_pct: self.take_profit_pct,
            status,
            needs_review: self.needs_review,
            realized_pnl: self.realized_pnl,
            opened_at: self.opened_at,
            closed_at: self.closed_at,
            version: self.version,
        })
    }
}

/// Postgres-backed ledger store with optimistic version checks.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect, verify connectivity, and make sure the schema exists.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id UUID PRIMARY KEY,
                wallet TEXT NOT NULL,
                market_id TEXT NOT NULL,
                owned_size NUMERIC NOT NULL,
                avg_entry_price NUMERIC NOT NULL,
                budget_committed NUMERIC NOT NULL,
                stop_loss_pct NUMERIC NOT NULL,
                take_profit_pct NUMERIC NOT NULL,
                status TEXT NOT NULL,
                needs_review BOOLEAN NOT NULL DEFAULT FALSE,
                realized_pnl NUMERIC NOT NULL DEFAULT 0,
                opened_at TIMESTAMPTZ NOT NULL,
                closed_at TIMESTAMPTZ,
                version BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_signals (
                signal_id TEXT PRIMARY KEY,
                seen_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn load(&self) -> anyhow::Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT * FROM positions WHERE status IN ('open', 'closing') ORDER BY opened_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PositionRow::into_position).collect()
    }

    async fn save(&self, position: &Position, expected_version: i64) -> Result<(), StoreError> {
        if expected_version == 0 {
            let result = sqlx::query(
                r#"
                INSERT INTO positions (
                    id, wallet, market_id, owned_size, avg_entry_price,
                    budget_committed, stop_loss_pct, take_profit_pct, status,
                    needs_review, realized_pnl, opened_at, closed_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(position.id)
            .bind(&position.wallet)
            .bind(&position.market_id)
            .bind(position.owned_size)
            .bind(position.avg_entry_price)
            .bind(position.budget_committed)
            .bind(position.stop_loss_pct)
            .bind(position.take_profit_pct)
            .bind(position.status.as_str())
            .bind(position.needs_review)
            .bind(position.realized_pnl)
            .bind(position.opened_at)
            .bind(position.closed_at)
            .bind(position.version)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Other(e.into()))?;

            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict {
                    expected: expected_version,
                });
            }
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            UPDATE positions
            SET owned_size = $3, avg_entry_price = $4, budget_committed = $5,
                status = $6, needs_review = $7, realized_pnl = $8,
                closed_at = $9, version = $10
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(position.id)
        .bind(expected_version)
        .bind(position.owned_size)
        .bind(position.avg_entry_price)
        .bind(position.budget_committed)
        .bind(position.status.as_str())
        .bind(position.needs_review)
        .bind(position.realized_pnl)
        .bind(position.closed_at)
        .bind(position.version)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Other(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                expected: expected_version,
            });
        }
        Ok(())
    }

    async fn record_signal(&self, signal_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO processed_signals (signal_id) VALUES ($1) ON CONFLICT DO NOTHING",
        )
        .bind(signal_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
