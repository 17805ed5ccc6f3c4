use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use lotsync_core::ProductCode;

use super::{
    DateRange, LedgerBalance, LedgerCursor, ProductionSchedule, ScheduledInflow, SourceError,
    StockLedger, StockMovement,
};

/// In-memory stock ledger for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    /// Visible movements, ordered by cursor.
    movements: RwLock<Vec<StockMovement>>,
    last_cursor: AtomicI64,
    unavailable: AtomicBool,
    reads: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a movement and return its cursor.
    pub fn record(&self, product: &ProductCode, quantity: Decimal, at: DateTime<Utc>) -> LedgerCursor {
        let cursor = self.reserve();
        self.commit_reserved(cursor, product, quantity, at);
        cursor
    }

    /// Take the next cursor without making a movement visible, like a ledger
    /// transaction that got its id but has not committed yet.
    pub fn reserve(&self) -> LedgerCursor {
        LedgerCursor(self.last_cursor.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Make a movement visible under a cursor taken earlier with [`Self::reserve`].
    pub fn commit_reserved(&self, cursor: LedgerCursor, product: &ProductCode, quantity: Decimal, at: DateTime<Utc>) {
        let mut movements = match self.movements.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let position = movements.partition_point(|m| m.cursor < cursor);
        movements.insert(
            position,
            StockMovement {
                cursor,
                product_code: product.clone(),
                quantity,
                occurred_at: at,
            },
        );
    }

    /// Simulate an outage of the ledger service.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of read calls served (both operations).
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("ledger offline".to_string()));
        }
        Ok(())
    }

    fn snapshot(&self, product: &ProductCode) -> Result<Vec<StockMovement>, SourceError> {
        let movements = self
            .movements
            .read()
            .map_err(|_| SourceError::Unavailable("ledger lock poisoned".to_string()))?;
        Ok(movements
            .iter()
            .filter(|m| &m.product_code == product)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl StockLedger for InMemoryLedger {
    async fn movements_since(
        &self,
        product: &ProductCode,
        cursor: Option<LedgerCursor>,
    ) -> Result<Vec<StockMovement>, SourceError> {
        self.check()?;
        let mut movements = self.snapshot(product)?;
        if let Some(cursor) = cursor {
            movements.retain(|m| m.cursor > cursor);
        }
        Ok(movements)
    }

    async fn balance(&self, product: &ProductCode) -> Result<LedgerBalance, SourceError> {
        self.check()?;
        let movements = self.snapshot(product)?;
        Ok(LedgerBalance {
            balance: movements.iter().map(|m| m.quantity).sum(),
            cursor: movements.last().map(|m| m.cursor),
        })
    }
}

/// In-memory production schedule.
#[derive(Debug, Default)]
pub struct InMemorySchedule {
    inflows: RwLock<HashMap<ProductCode, Vec<ScheduledInflow>>>,
    unavailable: AtomicBool,
}

impl InMemorySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(&self, product: &ProductCode, date: NaiveDate, quantity: Decimal) {
        let mut inflows = match self.inflows.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflows
            .entry(product.clone())
            .or_default()
            .push(ScheduledInflow { date, quantity });
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ProductionSchedule for InMemorySchedule {
    async fn scheduled_inflow(
        &self,
        product: &ProductCode,
        range: DateRange,
    ) -> Result<Vec<ScheduledInflow>, SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("production schedule offline".to_string()));
        }
        let inflows = self
            .inflows
            .read()
            .map_err(|_| SourceError::Unavailable("schedule lock poisoned".to_string()))?;
        Ok(inflows
            .get(product)
            .map(|rows| rows.iter().filter(|r| range.contains(r.date)).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn movements_since_skips_folded_movements() {
        let ledger = InMemoryLedger::new();
        let p1 = ProductCode::parse("P1").unwrap();
        let p2 = ProductCode::parse("P2").unwrap();
        let first = ledger.record(&p1, dec!(100), Utc::now());
        ledger.record(&p2, dec!(7), Utc::now());
        ledger.record(&p1, dec!(-30), Utc::now());

        let balance = ledger.balance(&p1).await.unwrap();
        assert_eq!(balance.balance, dec!(70));
        assert_eq!(balance.cursor, Some(LedgerCursor(3)));

        let newer = ledger.movements_since(&p1, Some(first)).await.unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].quantity, dec!(-30));
    }

    #[tokio::test]
    async fn offline_ledger_reports_unavailable() {
        let ledger = InMemoryLedger::new();
        ledger.set_available(false);
        let err = ledger.balance(&ProductCode::parse("P1").unwrap()).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }
}
