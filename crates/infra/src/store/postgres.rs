//! Postgres-backed storage.
//!
//! Schema: `migrations/0001_lotsync.sql`.
//!
//! ## Concurrency
//!
//! A unit of work is one `sqlx::Transaction`. Lot rows read for mutation are
//! locked with `FOR UPDATE`; updates and deletes also carry the version the
//! caller read (`WHERE version = $n`), so a lost update surfaces as
//! `StoreError::Conflict` even under weaker isolation.
//!
//! Projection swaps take `pg_advisory_xact_lock(hashtext(product_code))`, which
//! serializes refreshes of one product without blocking other products.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | StoreError |
//! |------------|---------------|------------|
//! | Database (unique / check / FK violation) | `23505`, `23514`, `23503` | `Constraint` |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Conflict` |
//! | Database (connection exception, shutdown) | `08***`, `57P0*` | `Unavailable` |
//! | Database (other) | any other | `Constraint` |
//! | RowNotFound | N/A | `NotFound` |
//! | ColumnDecode / Decode | N/A | `Decode` |
//! | Pool / IO / TLS / protocol | N/A | `Unavailable` |

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use lotsync_backlog::{BacklogLine, LineKey, Routing, Scheduling, UnitMetrics};
use lotsync_core::{AlertId, ChangeLogId, ExpectedVersion, LotId, OrderNumber, ProductCode, Quantity};
use lotsync_separation::{LotPhase, LotRowKey, LotStatus, SeparationLot};

use crate::sources::LedgerCursor;

use super::{
    AckOutcome, AlertFilter, AlertStore, BacklogStore, ChangeLogEntry, ChangeLogStore,
    ProductProjection, ProductStockSummary, ProjectionSource, ProjectionStore, ReconcileTx,
    ReconciliationAlert, RemoveOutcome, RuptureStatus, SeparationStore, Shard, StockProjectionRow,
    Storage, StoreError, UpsertOutcome, product_hash,
};

const SELECT_LINES: &str = r#"
    SELECT order_number, product_code, demanded_qty, cnpj,
           expedition_date, appointment_date, protocol, appointment_confirmed,
           customer_name, city, state, route,
           unit_price, unit_weight, units_per_pallet, updated_at
    FROM backlog_lines
"#;

const SELECT_LOTS: &str = r#"
    SELECT lot_id, order_number, product_code, allocated_qty, weight, pallet_count, value_total,
           expedition_date, appointment_date, protocol, appointment_confirmed,
           status, returned_to_yard, version, created_at, updated_at
    FROM separation_lots
"#;

const SELECT_CHANGES: &str = r#"
    SELECT id, source_table, operation, product_code, processed, created_at, processed_at
    FROM change_log
"#;

const SELECT_ALERTS: &str = r#"
    SELECT id, lot_id, order_number, product_code, delta_kind, qty_before, qty_after,
           raised_at, resolved, resolved_at, resolved_by
    FROM reconciliation_alerts
"#;

/// Postgres storage over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Unit of work over one Postgres transaction. Dropping it rolls back.
pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

impl core::fmt::Debug for PostgresTx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresTx").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Storage for PostgresStorage {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PostgresTx { tx })
    }
}

#[async_trait::async_trait]
impl BacklogStore for PostgresTx {
    #[instrument(skip(self, line), fields(order = %line.key.order_number, product = %line.key.product_code), err)]
    async fn upsert_line(&mut self, line: BacklogLine) -> Result<UpsertOutcome, StoreError> {
        let previous: Option<Decimal> = sqlx::query_scalar(
            "SELECT demanded_qty FROM backlog_lines WHERE order_number = $1 AND product_code = $2 FOR UPDATE",
        )
        .bind(line.key.order_number.as_str())
        .bind(line.key.product_code.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_line", e))?;

        sqlx::query(
            r#"
            INSERT INTO backlog_lines (
                order_number, product_code, demanded_qty, cnpj,
                expedition_date, appointment_date, protocol, appointment_confirmed,
                customer_name, city, state, route,
                unit_price, unit_weight, units_per_pallet, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (order_number, product_code) DO UPDATE SET
                demanded_qty = EXCLUDED.demanded_qty,
                cnpj = EXCLUDED.cnpj,
                expedition_date = EXCLUDED.expedition_date,
                appointment_date = EXCLUDED.appointment_date,
                protocol = EXCLUDED.protocol,
                appointment_confirmed = EXCLUDED.appointment_confirmed,
                customer_name = EXCLUDED.customer_name,
                city = EXCLUDED.city,
                state = EXCLUDED.state,
                route = EXCLUDED.route,
                unit_price = EXCLUDED.unit_price,
                unit_weight = EXCLUDED.unit_weight,
                units_per_pallet = EXCLUDED.units_per_pallet,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(line.key.order_number.as_str())
        .bind(line.key.product_code.as_str())
        .bind(line.demanded_qty.value())
        .bind(&line.cnpj)
        .bind(line.scheduling.expedition_date)
        .bind(line.scheduling.appointment_date)
        .bind(line.scheduling.protocol.as_deref())
        .bind(line.scheduling.appointment_confirmed)
        .bind(line.routing.customer_name.as_deref())
        .bind(line.routing.city.as_deref())
        .bind(line.routing.state.as_deref())
        .bind(line.routing.route.as_deref())
        .bind(line.metrics.unit_price)
        .bind(line.metrics.unit_weight)
        .bind(line.metrics.units_per_pallet)
        .bind(line.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_line", e))?;

        Ok(UpsertOutcome {
            created: previous.is_none(),
            previous_qty: previous.map(Quantity::new).transpose()?.unwrap_or(Quantity::ZERO),
        })
    }

    #[instrument(skip(self), fields(order = %key.order_number, product = %key.product_code), err)]
    async fn remove_line(&mut self, key: &LineKey) -> Result<RemoveOutcome, StoreError> {
        let previous: Option<Decimal> = sqlx::query_scalar(
            "DELETE FROM backlog_lines WHERE order_number = $1 AND product_code = $2 RETURNING demanded_qty",
        )
        .bind(key.order_number.as_str())
        .bind(key.product_code.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("remove_line", e))?;

        Ok(RemoveOutcome {
            existed: previous.is_some(),
            previous_qty: previous.map(Quantity::new).transpose()?.unwrap_or(Quantity::ZERO),
        })
    }

    async fn get_line(&mut self, key: &LineKey) -> Result<Option<BacklogLine>, StoreError> {
        let sql = format!("{SELECT_LINES} WHERE order_number = $1 AND product_code = $2 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(key.order_number.as_str())
            .bind(key.product_code.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_line", e))?;
        row.as_ref().map(line_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl SeparationStore for PostgresTx {
    async fn lots_for_line(&mut self, key: &LineKey) -> Result<Vec<SeparationLot>, StoreError> {
        let sql = format!(
            "{SELECT_LOTS} WHERE order_number = $1 AND product_code = $2 ORDER BY lot_id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(key.order_number.as_str())
            .bind(key.product_code.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lots_for_line", e))?;
        rows.iter().map(lot_from_row).collect()
    }

    async fn lots_for_lot(&mut self, lot_id: &LotId) -> Result<Vec<SeparationLot>, StoreError> {
        let sql = format!("{SELECT_LOTS} WHERE lot_id = $1 ORDER BY order_number, product_code FOR UPDATE");
        let rows = sqlx::query(&sql)
            .bind(lot_id.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lots_for_lot", e))?;
        rows.iter().map(lot_from_row).collect()
    }

    async fn lots_for_order(&mut self, order: &OrderNumber) -> Result<Vec<SeparationLot>, StoreError> {
        let sql = format!("{SELECT_LOTS} WHERE order_number = $1 ORDER BY lot_id, product_code");
        let rows = sqlx::query(&sql)
            .bind(order.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("lots_for_order", e))?;
        rows.iter().map(lot_from_row).collect()
    }

    #[instrument(skip(self, lot), fields(lot = %lot.key), err)]
    async fn insert_lot(&mut self, lot: SeparationLot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO separation_lots (
                lot_id, order_number, product_code, allocated_qty, weight, pallet_count, value_total,
                expedition_date, appointment_date, protocol, appointment_confirmed,
                status, returned_to_yard, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 1, $14, $15)
            "#,
        )
        .bind(lot.key.lot_id.as_str())
        .bind(lot.key.order_number.as_str())
        .bind(lot.key.product_code.as_str())
        .bind(lot.allocated_qty.value())
        .bind(lot.weight)
        .bind(lot.pallet_count)
        .bind(lot.value_total)
        .bind(lot.scheduling.expedition_date)
        .bind(lot.scheduling.appointment_date)
        .bind(lot.scheduling.protocol.as_deref())
        .bind(lot.scheduling.appointment_confirmed)
        .bind(lot.status.as_str())
        .bind(lot.returned_to_yard)
        .bind(lot.created_at)
        .bind(lot.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_lot", e))?;
        Ok(())
    }

    #[instrument(skip(self, lot), fields(lot = %lot.key, expected = ?expected), err)]
    async fn update_lot(&mut self, lot: &SeparationLot, expected: ExpectedVersion) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE separation_lots SET
                allocated_qty = $4,
                weight = $5,
                pallet_count = $6,
                value_total = $7,
                status = $8,
                returned_to_yard = $9,
                updated_at = $10,
                version = version + 1
            WHERE lot_id = $1 AND order_number = $2 AND product_code = $3
              AND ($11::BIGINT IS NULL OR version = $11)
            "#,
        )
        .bind(lot.key.lot_id.as_str())
        .bind(lot.key.order_number.as_str())
        .bind(lot.key.product_code.as_str())
        .bind(lot.allocated_qty.value())
        .bind(lot.weight)
        .bind(lot.pallet_count)
        .bind(lot.value_total)
        .bind(lot.status.as_str())
        .bind(lot.returned_to_yard)
        .bind(lot.updated_at)
        .bind(expected_param(expected)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_lot", e))?;

        if result.rows_affected() == 0 {
            return Err(self.explain_missed_write(&lot.key).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(lot = %key, expected = ?expected), err)]
    async fn delete_lot(&mut self, key: &LotRowKey, expected: ExpectedVersion) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM separation_lots
            WHERE lot_id = $1 AND order_number = $2 AND product_code = $3
              AND UPPER(status) IN ('PREVIEW', 'OPEN', 'PREVISAO', 'ABERTO')
              AND ($4::BIGINT IS NULL OR version = $4)
            "#,
        )
        .bind(key.lot_id.as_str())
        .bind(key.order_number.as_str())
        .bind(key.product_code.as_str())
        .bind(expected_param(expected)?)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_lot", e))?;

        if result.rows_affected() == 0 {
            return Err(self.explain_missed_write(key).await);
        }
        Ok(())
    }
}

impl PostgresTx {
    /// Work out why a guarded UPDATE/DELETE matched no row.
    async fn explain_missed_write(&mut self, key: &LotRowKey) -> StoreError {
        let sql = format!("{SELECT_LOTS} WHERE lot_id = $1 AND order_number = $2 AND product_code = $3");
        let row = sqlx::query(&sql)
            .bind(key.lot_id.as_str())
            .bind(key.order_number.as_str())
            .bind(key.product_code.as_str())
            .fetch_optional(&mut *self.tx)
            .await;
        match row {
            Err(e) => map_sqlx_error("explain_missed_write", e),
            Ok(None) => StoreError::NotFound(format!("lot row {key}")),
            Ok(Some(row)) => match lot_from_row(&row) {
                Ok(lot) if lot.phase() != LotPhase::PreQuote => StoreError::Constraint(format!(
                    "lot row {key} is {} and cannot be deleted",
                    lot.status
                )),
                Ok(lot) => StoreError::Conflict(format!(
                    "lot row {key} changed concurrently (now at version {})",
                    lot.version
                )),
                Err(e) => e,
            },
        }
    }
}

#[async_trait::async_trait]
impl ReconcileTx for PostgresTx {
    async fn append_change(&mut self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        insert_change(&mut *self.tx, &entry).await
    }

    async fn raise_alert(&mut self, alert: ReconciliationAlert) -> Result<(), StoreError> {
        insert_alert(&mut *self.tx, &alert).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

async fn insert_change<'e, E>(executor: E, entry: &ChangeLogEntry) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO change_log (
            id, source_table, operation, product_code, product_hash, processed, created_at, processed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id.as_uuid())
    .bind(entry.source_table.as_str())
    .bind(entry.operation.as_str())
    .bind(entry.product_code.as_str())
    .bind(i64::from(product_hash(&entry.product_code)))
    .bind(entry.processed)
    .bind(entry.created_at)
    .bind(entry.processed_at)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("append_change", e))?;
    Ok(())
}

async fn insert_alert<'e, E>(executor: E, alert: &ReconciliationAlert) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO reconciliation_alerts (
            id, lot_id, order_number, product_code, delta_kind, qty_before, qty_after,
            raised_at, resolved, resolved_at, resolved_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(alert.id.as_uuid())
    .bind(alert.lot_id.as_str())
    .bind(alert.order_number.as_str())
    .bind(alert.product_code.as_str())
    .bind(alert.delta_kind.as_str())
    .bind(alert.qty_before.value())
    .bind(alert.qty_after.value())
    .bind(alert.raised_at)
    .bind(alert.resolved)
    .bind(alert.resolved_at)
    .bind(alert.resolved_by.as_deref())
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("raise_alert", e))?;
    Ok(())
}

#[async_trait::async_trait]
impl ChangeLogStore for PostgresStorage {
    async fn append(&self, entry: ChangeLogEntry) -> Result<(), StoreError> {
        insert_change(&self.pool, &entry).await
    }

    #[instrument(skip(self), err)]
    async fn unprocessed(&self, limit: usize, shard: Option<Shard>) -> Result<Vec<ChangeLogEntry>, StoreError> {
        let sql = format!(
            "{SELECT_CHANGES} WHERE NOT processed
               AND ($2::BIGINT IS NULL OR product_hash % $2 = $3)
             ORDER BY created_at, id
             LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(shard.map(|s| i64::from(s.count)))
            .bind(shard.map(|s| i64::from(s.index)).unwrap_or(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("unprocessed", e))?;
        rows.iter().map(change_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn mark_processed(&self, ids: &[ChangeLogId], at: DateTime<Utc>) -> Result<usize, StoreError> {
        let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query(
            "UPDATE change_log SET processed = TRUE, processed_at = $2 WHERE id = ANY($1) AND NOT processed",
        )
        .bind(ids)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait::async_trait]
impl AlertStore for PostgresStorage {
    async fn insert_alert(&self, alert: ReconciliationAlert) -> Result<(), StoreError> {
        insert_alert(&self.pool, &alert).await
    }

    async fn get_alert(&self, id: AlertId) -> Result<Option<ReconciliationAlert>, StoreError> {
        let sql = format!("{SELECT_ALERTS} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_alert", e))?;
        row.as_ref().map(alert_from_row).transpose()
    }

    #[instrument(skip(self), fields(alert_id = %id), err)]
    async fn acknowledge(&self, id: AlertId, by: &str, at: DateTime<Utc>) -> Result<AckOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE reconciliation_alerts
            SET resolved = TRUE, resolved_at = $2, resolved_by = $3
            WHERE id = $1 AND NOT resolved
            RETURNING id, lot_id, order_number, product_code, delta_kind, qty_before, qty_after,
                      raised_at, resolved, resolved_at, resolved_by
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .bind(by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("acknowledge", e))?;

        if let Some(row) = row {
            return Ok(AckOutcome::Acknowledged(alert_from_row(&row)?));
        }
        match self.get_alert(id).await? {
            Some(alert) => Ok(AckOutcome::AlreadyAcknowledged(alert)),
            None => Err(StoreError::NotFound(format!("alert {id}"))),
        }
    }

    async fn list_unresolved(&self, filter: &AlertFilter) -> Result<Vec<ReconciliationAlert>, StoreError> {
        let sql = format!(
            "{SELECT_ALERTS} WHERE NOT resolved
               AND ($1::TEXT IS NULL OR order_number = $1)
               AND ($2::TEXT IS NULL OR product_code = $2)
               AND ($3::TEXT IS NULL OR lot_id = $3)
               AND ($4::TEXT IS NULL OR delta_kind = $4)
             ORDER BY raised_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.order_number.as_ref().map(|o| o.as_str()))
            .bind(filter.product_code.as_ref().map(|p| p.as_str()))
            .bind(filter.lot_id.as_ref().map(|l| l.as_str()))
            .bind(filter.delta_kind.map(|k| k.as_str()))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_unresolved", e))?;
        rows.iter().map(alert_from_row).collect()
    }
}

#[async_trait::async_trait]
impl ProjectionSource for PostgresStorage {
    async fn lines_for_product(&self, product: &ProductCode) -> Result<Vec<BacklogLine>, StoreError> {
        let sql = format!("{SELECT_LINES} WHERE product_code = $1 ORDER BY order_number");
        let rows = sqlx::query(&sql)
            .bind(product.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("lines_for_product", e))?;
        rows.iter().map(line_from_row).collect()
    }

    async fn lots_for_product(&self, product: &ProductCode) -> Result<Vec<SeparationLot>, StoreError> {
        let sql = format!("{SELECT_LOTS} WHERE product_code = $1 ORDER BY lot_id, order_number");
        let rows = sqlx::query(&sql)
            .bind(product.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("lots_for_product", e))?;
        rows.iter().map(lot_from_row).collect()
    }
}

#[async_trait::async_trait]
impl ProjectionStore for PostgresStorage {
    #[instrument(skip(self, projection), fields(product = %projection.product_code()), err)]
    async fn replace_projection(&self, projection: ProductProjection) -> Result<bool, StoreError> {
        let product = projection.product_code().as_str();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("replace_projection", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(product)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_projection", e))?;

        let stored_at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT refreshed_at FROM product_stock_summary WHERE product_code = $1")
                .bind(product)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("replace_projection", e))?;
        if stored_at.is_some_and(|at| at > projection.summary.refreshed_at) {
            debug!(product, "stored projection is newer; skipping swap");
            return Ok(false);
        }

        sqlx::query("DELETE FROM stock_projection_rows WHERE product_code = $1")
            .bind(product)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_projection", e))?;

        for row in &projection.rows {
            sqlx::query(
                r#"
                INSERT INTO stock_projection_rows (
                    product_code, day_offset, projection_date,
                    opening_stock, planned_outflow, planned_inflow, closing_stock
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(product)
            .bind(i16::from(row.day_offset))
            .bind(row.date)
            .bind(row.opening_stock)
            .bind(row.planned_outflow)
            .bind(row.planned_inflow)
            .bind(row.closing_stock)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_projection", e))?;
        }

        let summary = &projection.summary;
        sqlx::query(
            r#"
            INSERT INTO product_stock_summary (
                product_code, current_balance, rupture_prediction_7d, rupture_status,
                first_rupture_day, ledger_cursor, refreshed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (product_code) DO UPDATE SET
                current_balance = EXCLUDED.current_balance,
                rupture_prediction_7d = EXCLUDED.rupture_prediction_7d,
                rupture_status = EXCLUDED.rupture_status,
                first_rupture_day = EXCLUDED.first_rupture_day,
                ledger_cursor = EXCLUDED.ledger_cursor,
                refreshed_at = EXCLUDED.refreshed_at
            "#,
        )
        .bind(product)
        .bind(summary.current_balance)
        .bind(summary.rupture_prediction_7d)
        .bind(summary.rupture_status.as_str())
        .bind(summary.first_rupture_day.map(i16::from))
        .bind(summary.ledger_cursor.map(|c| c.0))
        .bind(summary.refreshed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replace_projection", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("replace_projection", e))?;
        Ok(true)
    }

    async fn load_projection(&self, product: &ProductCode) -> Result<Option<ProductProjection>, StoreError> {
        // One snapshot for summary and rows.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("load_projection", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("load_projection", e))?;

        let summary_row = sqlx::query(
            r#"
            SELECT product_code, current_balance, rupture_prediction_7d, rupture_status,
                   first_rupture_day, ledger_cursor, refreshed_at
            FROM product_stock_summary
            WHERE product_code = $1
            "#,
        )
        .bind(product.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_projection", e))?;
        let Some(summary_row) = summary_row else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT product_code, day_offset, projection_date,
                   opening_stock, planned_outflow, planned_inflow, closing_stock
            FROM stock_projection_rows
            WHERE product_code = $1
            ORDER BY day_offset ASC
            "#,
        )
        .bind(product.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_projection", e))?;

        Ok(Some(ProductProjection {
            summary: summary_from_row(&summary_row)?,
            rows: rows.iter().map(projection_row_from_row).collect::<Result<_, _>>()?,
        }))
    }

    async fn summaries_by_status(&self, status: RuptureStatus) -> Result<Vec<ProductStockSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT product_code, current_balance, rupture_prediction_7d, rupture_status,
                   first_rupture_day, ledger_cursor, refreshed_at
            FROM product_stock_summary
            WHERE rupture_status = $1
            ORDER BY product_code
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("summaries_by_status", e))?;
        rows.iter().map(summary_from_row).collect()
    }
}

// Row mapping

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("{column}: {e}")))
}

fn quantity(row: &PgRow, column: &str) -> Result<Quantity, StoreError> {
    Ok(Quantity::new(get::<Decimal>(row, column)?)?)
}

fn line_from_row(row: &PgRow) -> Result<BacklogLine, StoreError> {
    let key = LineKey::new(
        OrderNumber::parse(get::<String>(row, "order_number")?)?,
        ProductCode::parse(get::<String>(row, "product_code")?)?,
    );
    Ok(BacklogLine {
        key,
        demanded_qty: quantity(row, "demanded_qty")?,
        cnpj: get(row, "cnpj")?,
        scheduling: Scheduling {
            expedition_date: get(row, "expedition_date")?,
            appointment_date: get(row, "appointment_date")?,
            protocol: get(row, "protocol")?,
            appointment_confirmed: get(row, "appointment_confirmed")?,
        },
        routing: Routing {
            customer_name: get(row, "customer_name")?,
            city: get(row, "city")?,
            state: get(row, "state")?,
            route: get(row, "route")?,
        },
        metrics: UnitMetrics {
            unit_price: get(row, "unit_price")?,
            unit_weight: get(row, "unit_weight")?,
            units_per_pallet: get(row, "units_per_pallet")?,
        },
        updated_at: get(row, "updated_at")?,
    })
}

fn lot_from_row(row: &PgRow) -> Result<SeparationLot, StoreError> {
    let key = LotRowKey {
        lot_id: LotId::parse(get::<String>(row, "lot_id")?)?,
        order_number: OrderNumber::parse(get::<String>(row, "order_number")?)?,
        product_code: ProductCode::parse(get::<String>(row, "product_code")?)?,
    };
    // Rows migrated from the legacy tables may still carry the old labels.
    let (status, legacy_returned) = LotStatus::parse_legacy(&get::<String>(row, "status")?)?;
    let version: i64 = get(row, "version")?;
    Ok(SeparationLot {
        key,
        allocated_qty: quantity(row, "allocated_qty")?,
        weight: get(row, "weight")?,
        pallet_count: get(row, "pallet_count")?,
        value_total: get(row, "value_total")?,
        scheduling: Scheduling {
            expedition_date: get(row, "expedition_date")?,
            appointment_date: get(row, "appointment_date")?,
            protocol: get(row, "protocol")?,
            appointment_confirmed: get(row, "appointment_confirmed")?,
        },
        status,
        returned_to_yard: legacy_returned || get::<bool>(row, "returned_to_yard")?,
        version: u64::try_from(version).map_err(|_| StoreError::Decode(format!("negative version {version}")))?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn change_from_row(row: &PgRow) -> Result<ChangeLogEntry, StoreError> {
    Ok(ChangeLogEntry {
        id: ChangeLogId::from_uuid(get(row, "id")?),
        source_table: get::<String>(row, "source_table")?.parse()?,
        operation: get::<String>(row, "operation")?.parse()?,
        product_code: ProductCode::parse(get::<String>(row, "product_code")?)?,
        processed: get(row, "processed")?,
        created_at: get(row, "created_at")?,
        processed_at: get(row, "processed_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<ReconciliationAlert, StoreError> {
    Ok(ReconciliationAlert {
        id: AlertId::from_uuid(get(row, "id")?),
        lot_id: LotId::parse(get::<String>(row, "lot_id")?)?,
        order_number: OrderNumber::parse(get::<String>(row, "order_number")?)?,
        product_code: ProductCode::parse(get::<String>(row, "product_code")?)?,
        delta_kind: get::<String>(row, "delta_kind")?.parse()?,
        qty_before: quantity(row, "qty_before")?,
        qty_after: quantity(row, "qty_after")?,
        raised_at: get(row, "raised_at")?,
        resolved: get(row, "resolved")?,
        resolved_at: get(row, "resolved_at")?,
        resolved_by: get(row, "resolved_by")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<ProductStockSummary, StoreError> {
    let first_rupture_day: Option<i16> = get(row, "first_rupture_day")?;
    Ok(ProductStockSummary {
        product_code: ProductCode::parse(get::<String>(row, "product_code")?)?,
        current_balance: get(row, "current_balance")?,
        rupture_prediction_7d: get(row, "rupture_prediction_7d")?,
        rupture_status: get::<String>(row, "rupture_status")?.parse()?,
        first_rupture_day: first_rupture_day.map(day_offset).transpose()?,
        ledger_cursor: get::<Option<i64>>(row, "ledger_cursor")?.map(LedgerCursor),
        refreshed_at: get(row, "refreshed_at")?,
    })
}

fn projection_row_from_row(row: &PgRow) -> Result<StockProjectionRow, StoreError> {
    Ok(StockProjectionRow {
        product_code: ProductCode::parse(get::<String>(row, "product_code")?)?,
        day_offset: day_offset(get(row, "day_offset")?)?,
        date: get(row, "projection_date")?,
        opening_stock: get(row, "opening_stock")?,
        planned_outflow: get(row, "planned_outflow")?,
        planned_inflow: get(row, "planned_inflow")?,
        closing_stock: get(row, "closing_stock")?,
    })
}

fn day_offset(raw: i16) -> Result<u8, StoreError> {
    u8::try_from(raw).map_err(|_| StoreError::Decode(format!("day offset {raw} out of range")))
}

fn expected_param(expected: ExpectedVersion) -> Result<Option<i64>, StoreError> {
    match expected {
        ExpectedVersion::Any => Ok(None),
        ExpectedVersion::Exact(v) => i64::try_from(v)
            .map(Some)
            .map_err(|_| StoreError::Constraint(format!("version {v} out of range"))),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") | Some("23503") => StoreError::Constraint(msg),
                Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                Some(code) if code.starts_with("08") || code.starts_with("57P0") => {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Constraint(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("no row in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        other => StoreError::Unavailable(format!("{operation}: {other}")),
    }
}
