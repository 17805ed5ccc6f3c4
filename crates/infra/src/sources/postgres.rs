//! Postgres adapters over the ledger and production-schedule tables.
//!
//! Both tables are owned by other systems; these adapters only read.

use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::instrument;

use lotsync_core::ProductCode;

use super::{
    DateRange, LedgerBalance, LedgerCursor, ProductionSchedule, ScheduledInflow, SourceError,
    StockLedger, StockMovement,
};

#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl StockLedger for PostgresLedger {
    #[instrument(skip(self), fields(product = %product), err)]
    async fn movements_since(
        &self,
        product: &ProductCode,
        cursor: Option<LedgerCursor>,
    ) -> Result<Vec<StockMovement>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, quantity, occurred_at
            FROM stock_movements
            WHERE product_code = $1 AND id > $2
            ORDER BY id ASC
            "#,
        )
        .bind(product.as_str())
        .bind(cursor.map(|c| c.0).unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_source_error)?;

        rows.iter()
            .map(|row| {
                Ok(StockMovement {
                    cursor: LedgerCursor(row.try_get("id").map_err(decode)?),
                    product_code: product.clone(),
                    quantity: row.try_get("quantity").map_err(decode)?,
                    occurred_at: row.try_get("occurred_at").map_err(decode)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), fields(product = %product), err)]
    async fn balance(&self, product: &ProductCode) -> Result<LedgerBalance, SourceError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(quantity), 0) AS balance, MAX(id) AS cursor
            FROM stock_movements
            WHERE product_code = $1
            "#,
        )
        .bind(product.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_source_error)?;

        let balance: Decimal = row.try_get("balance").map_err(decode)?;
        let cursor: Option<i64> = row.try_get("cursor").map_err(decode)?;
        Ok(LedgerBalance {
            balance,
            cursor: cursor.map(LedgerCursor),
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgresSchedule {
    pool: PgPool,
}

impl PostgresSchedule {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ProductionSchedule for PostgresSchedule {
    #[instrument(skip(self), fields(product = %product), err)]
    async fn scheduled_inflow(
        &self,
        product: &ProductCode,
        range: DateRange,
    ) -> Result<Vec<ScheduledInflow>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT scheduled_date, SUM(quantity) AS quantity
            FROM production_schedule
            WHERE product_code = $1 AND scheduled_date BETWEEN $2 AND $3
            GROUP BY scheduled_date
            ORDER BY scheduled_date ASC
            "#,
        )
        .bind(product.as_str())
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_source_error)?;

        rows.iter()
            .map(|row| {
                Ok(ScheduledInflow {
                    date: row.try_get("scheduled_date").map_err(decode)?,
                    quantity: row.try_get("quantity").map_err(decode)?,
                })
            })
            .collect()
    }
}

fn map_source_error(err: sqlx::Error) -> SourceError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => SourceError::Decode(err.to_string()),
        other => SourceError::Unavailable(other.to_string()),
    }
}

fn decode(err: sqlx::Error) -> SourceError {
    SourceError::Decode(err.to_string())
}
