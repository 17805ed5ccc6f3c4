//! Integration tests for the reconciliation and projection pipeline.
//!
//! Tests: ERP delta → ReconciliationEngine → Backlog/Lots/ChangeLog/Alerts →
//! StockProjectionCache → read path
//!
//! Verifies:
//! - Shortfalls are absorbed by pre-quote lots before quoted ones
//! - Quoted lots are only touched with an alert
//! - Re-delivered deltas are no-ops
//! - Bursts of changes for one product coalesce into one refresh
//! - Readers never see a half-swapped projection

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use lotsync_backlog::{DeltaKind, LineDelta};
    use lotsync_core::LotId;
    use lotsync_separation::LotStatus;

    use crate::alerts::AlertPublisher;
    use crate::planning::LotPlanner;
    use crate::projection::{ProjectionConfig, StockProjectionCache};
    use crate::quoting::QuotingService;
    use crate::reconciliation::{ReconcileConfig, ReconciliationEngine};
    use crate::sources::{InMemoryLedger, InMemorySchedule};
    use crate::store::{AlertFilter, ChangeLogStore, InMemoryStorage, RuptureStatus};
    use crate::test_support::{day, line, line_key, lot, product, qty};

    type Cache = StockProjectionCache<InMemoryStorage, InMemoryLedger, InMemorySchedule>;

    struct Harness {
        storage: Arc<InMemoryStorage>,
        ledger: Arc<InMemoryLedger>,
        engine: ReconciliationEngine<InMemoryStorage>,
        cache: Cache,
    }

    fn setup() -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let engine = ReconciliationEngine::new(storage.clone(), ReconcileConfig::default());
        let cache = StockProjectionCache::new(
            storage.clone(),
            ledger.clone(),
            Arc::new(InMemorySchedule::new()),
            ProjectionConfig::default(),
        );
        Harness {
            storage,
            ledger,
            engine,
            cache,
        }
    }

    fn today() -> NaiveDate {
        day(2026, 3, 2)
    }

    fn decrease_to(new_qty: Decimal) -> LineDelta {
        LineDelta::new("100", "P1", DeltaKind::Decrease, dec!(50), new_qty)
    }

    #[tokio::test]
    async fn decrease_on_open_lot_cuts_without_alert() {
        let h = setup();
        h.storage.seed_line(line(dec!(50))).unwrap();
        h.storage.seed_lot(lot("L1", dec!(50), LotStatus::Open)).unwrap();

        let outcome = h.engine.apply_delta(&decrease_to(dec!(30))).await.unwrap();

        assert_eq!(h.storage.lots()[0].allocated_qty, qty(dec!(30)));
        assert!(outcome.alerts.is_empty());
        assert!(h.storage.alerts().is_empty());
    }

    #[tokio::test]
    async fn decrease_on_quoted_lot_raises_one_alert() {
        let h = setup();
        h.storage.seed_line(line(dec!(50))).unwrap();
        h.storage.seed_lot(lot("L1", dec!(50), LotStatus::Quoted)).unwrap();

        h.engine.apply_delta(&decrease_to(dec!(30))).await.unwrap();

        assert_eq!(h.storage.lots()[0].allocated_qty, qty(dec!(30)));
        let alerts = h.storage.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].delta_kind, DeltaKind::Decrease);
        assert_eq!(alerts[0].qty_before, qty(dec!(50)));
        assert_eq!(alerts[0].qty_after, qty(dec!(30)));
        assert!(!alerts[0].resolved);
    }

    #[tokio::test]
    async fn small_shortfall_is_absorbed_by_the_preview_lot() {
        let h = setup();
        h.storage.seed_line(line(dec!(50))).unwrap();
        h.storage.seed_lot(lot("L1", dec!(10), LotStatus::Preview)).unwrap();
        h.storage.seed_lot(lot("L2", dec!(40), LotStatus::Quoted)).unwrap();

        h.engine.apply_delta(&decrease_to(dec!(45))).await.unwrap();

        let lots = h.storage.lots();
        assert_eq!(lots[0].allocated_qty, qty(dec!(5)));
        assert_eq!(lots[1].allocated_qty, qty(dec!(40)));
        assert_eq!(lots[1].version, 1);
        assert!(h.storage.alerts().is_empty());
    }

    #[tokio::test]
    async fn large_shortfall_deletes_preview_and_cuts_quoted_lot() {
        let h = setup();
        h.storage.seed_line(line(dec!(50))).unwrap();
        h.storage.seed_lot(lot("L1", dec!(10), LotStatus::Preview)).unwrap();
        h.storage.seed_lot(lot("L2", dec!(40), LotStatus::Quoted)).unwrap();

        let outcome = h.engine.apply_delta(&decrease_to(dec!(5))).await.unwrap();

        let lots = h.storage.lots();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].key.lot_id.as_str(), "L2");
        assert_eq!(lots[0].allocated_qty, qty(dec!(5)));
        assert_eq!(lots[0].status, LotStatus::Quoted);
        assert_eq!(outcome.cuts.len(), 2);

        let alerts = h.storage.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].lot_id.as_str(), "L2");
        assert_eq!(alerts[0].qty_before, qty(dec!(40)));
        assert_eq!(alerts[0].qty_after, qty(dec!(5)));
    }

    #[tokio::test]
    async fn remove_leaves_shipped_lot_and_raises_remove_alert() {
        let h = setup();
        h.storage.seed_line(line(dec!(20))).unwrap();
        h.storage.seed_lot(lot("L1", dec!(20), LotStatus::Shipped)).unwrap();

        let delta = LineDelta::new("100", "P1", DeltaKind::Remove, dec!(20), dec!(0));
        h.engine.apply_delta(&delta).await.unwrap();

        assert!(h.storage.line(&line_key()).is_none());
        let lots = h.storage.lots();
        assert_eq!(lots.len(), 1);
        assert_eq!(lots[0].status, LotStatus::Shipped);
        assert_eq!(lots[0].allocated_qty, qty(dec!(20)));

        let alerts = h.storage.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].delta_kind, DeltaKind::Remove);
        assert_eq!(alerts[0].qty_before, qty(dec!(20)));
        assert_eq!(alerts[0].qty_after, qty(dec!(0)));
    }

    #[tokio::test]
    async fn burst_of_changes_refreshes_product_once() {
        let h = setup();
        let p1 = product("P1");
        h.ledger.record(&p1, dec!(100), Utc::now());
        h.cache.mark_dirty(&p1).await.unwrap();
        h.cache.mark_dirty(&p1).await.unwrap();
        assert_eq!(h.storage.unprocessed(10, None).await.unwrap().len(), 2);

        let report = h.cache.process_pending(today()).await.unwrap();

        assert_eq!(report.refreshed, vec![p1.clone()]);
        assert_eq!(report.entries_processed, 2);
        assert_eq!(h.ledger.reads(), 1);

        // Nothing left: the next cycle is idle.
        let report = h.cache.process_pending(today()).await.unwrap();
        assert!(report.refreshed.is_empty());
        assert_eq!(h.ledger.reads(), 1);
    }

    #[tokio::test]
    async fn redelivered_batch_changes_nothing_twice() {
        let h = setup();
        h.storage.seed_line(line(dec!(50))).unwrap();
        h.storage.seed_lot(lot("L1", dec!(10), LotStatus::Preview)).unwrap();
        h.storage.seed_lot(lot("L2", dec!(40), LotStatus::Quoted)).unwrap();
        let batch = vec![
            decrease_to(dec!(20)),
            LineDelta::new("200", "P1", DeltaKind::Add, dec!(0), dec!(7)),
        ];

        let first = h.engine.run_batch(batch.clone()).await.unwrap();
        let lots_after_first = h.storage.lots();
        let second = h.engine.run_batch(batch).await.unwrap();

        assert!(first.is_clean() && second.is_clean());
        assert_eq!(first.alerts_raised(), 1);
        assert_eq!(second.alerts_raised(), 0);
        assert!(second.applied.iter().all(|o| o.is_noop()));
        assert_eq!(h.storage.lots(), lots_after_first);
        assert_eq!(h.storage.alerts().len(), 1);
    }

    #[tokio::test]
    async fn same_batch_add_then_decrease_sees_the_added_line() {
        let h = setup();
        let report = h
            .engine
            .run_batch(vec![
                LineDelta::new("100", "P1", DeltaKind::Add, dec!(0), dec!(50)),
                LineDelta::new("100", "P1", DeltaKind::Decrease, dec!(50), dec!(20)),
            ])
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.applied[1].applied, Some(DeltaKind::Decrease));
        assert_eq!(h.storage.line(&line_key()).unwrap().demanded_qty, qty(dec!(20)));
    }

    #[tokio::test]
    async fn connector_feed_parses_into_a_batch() {
        let h = setup();
        let feed = r#"[
            {"order_number": "100", "product_code": "P1", "kind": "ADD", "old_qty": "0", "new_qty": "50"},
            {"order_number": "100", "product_code": "P1", "kind": "DECREASE", "old_qty": "50", "new_qty": "30"}
        ]"#;
        let batch: Vec<LineDelta> = serde_json::from_str(feed).unwrap();
        assert!(batch.iter().all(|delta| delta.attributes.is_none()));

        let report = h.engine.run_batch(batch).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(h.storage.line(&line_key()).unwrap().demanded_qty, qty(dec!(30)));
    }

    #[tokio::test]
    async fn malformed_delta_is_rejected_and_batch_continues() {
        let h = setup();
        let report = h
            .engine
            .run_batch(vec![
                LineDelta::new("", "P1", DeltaKind::Add, dec!(0), dec!(5)),
                LineDelta::new("100", "P1", DeltaKind::Add, dec!(0), dec!(-5)),
                LineDelta::new("100", "P1", DeltaKind::Add, dec!(0), dec!(5)),
            ])
            .await
            .unwrap();

        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[1].key, "100/P1");
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_feeds_the_projection() {
        let h = setup();
        let p1 = product("P1");
        h.ledger.record(&p1, dec!(60), Utc::now());
        h.engine
            .apply_delta(&LineDelta::new("100", "P1", DeltaKind::Add, dec!(0), dec!(50)))
            .await
            .unwrap();

        h.cache.process_pending(today()).await.unwrap();
        let summary = h.cache.summary(&p1).await.unwrap().unwrap();
        assert_eq!(summary.rupture_status, RuptureStatus::Ok);
        assert_eq!(summary.rupture_prediction_7d, dec!(10));

        h.engine
            .apply_delta(&LineDelta::new("100", "P1", DeltaKind::Increase, dec!(50), dec!(80)))
            .await
            .unwrap();
        h.cache.process_pending(today()).await.unwrap();
        assert_eq!(h.cache.status(&p1).await.unwrap(), Some(RuptureStatus::Critical));
        assert_eq!(h.cache.list_by_status(RuptureStatus::Critical).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn planned_lot_lifecycle_gates_alerts() {
        let h = setup();
        h.storage.seed_line(line(dec!(50))).unwrap();
        let planner = LotPlanner::new(h.storage.clone());
        let quoting = QuotingService::new(h.storage.clone());
        let alerts = AlertPublisher::new(h.storage.clone());
        let lot_id = LotId::parse("L1").unwrap();

        planner
            .create_preview(&lot_id, vec![(line_key(), qty(dec!(50)))])
            .await
            .unwrap();
        planner.confirm(&lot_id).await.unwrap();

        h.engine.apply_delta(&decrease_to(dec!(45))).await.unwrap();
        assert!(alerts.list_unresolved(&AlertFilter::default()).await.unwrap().is_empty());

        quoting
            .advance_status(&lot_id, LotStatus::Open, LotStatus::Quoted)
            .await
            .unwrap();
        h.engine
            .apply_delta(&LineDelta::new("100", "P1", DeltaKind::Decrease, dec!(45), dec!(40)))
            .await
            .unwrap();

        let unresolved = alerts.list_unresolved(&AlertFilter::default()).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].qty_before, qty(dec!(45)));
        assert_eq!(unresolved[0].qty_after, qty(dec!(40)));

        alerts.acknowledge(unresolved[0].id, "planner").await.unwrap();
        assert!(alerts.list_unresolved(&AlertFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invoiced_allocation_is_replanned_without_double_counting() {
        let h = setup();
        let p1 = product("P1");
        h.ledger.record(&p1, dec!(50), Utc::now());
        h.storage.seed_line(line(dec!(20))).unwrap();
        h.storage.seed_lot(lot("L0", dec!(20), LotStatus::Invoiced)).unwrap();
        let outflow = |projection: &crate::store::ProductProjection| {
            projection.rows.iter().map(|row| row.planned_outflow).sum::<Decimal>()
        };

        // The invoiced lot released the line: its 20 units are unallocated demand.
        let before = h.cache.refresh_as_of(&p1, today()).await.unwrap();
        assert_eq!(outflow(&before), dec!(20));

        LotPlanner::new(h.storage.clone())
            .create_preview(&LotId::parse("L1").unwrap(), vec![(line_key(), qty(dec!(20)))])
            .await
            .unwrap();

        // Now the new lot carries the same 20; the line's remainder is zero.
        let after = h.cache.refresh_as_of(&p1, today()).await.unwrap();
        assert_eq!(outflow(&after), dec!(20));
        assert_eq!(after.rows[3].planned_outflow, dec!(20));
        assert_eq!(after.summary.current_balance, dec!(50));
        assert_eq!(after.rows[28].closing_stock, dec!(30));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn readers_never_see_a_half_swapped_projection() {
        let h = setup();
        let p1 = product("P1");
        let ledger = h.ledger.clone();
        let cache = Arc::new(h.cache);
        ledger.record(&p1, dec!(1), Utc::now());
        cache.refresh_as_of(&p1, today()).await.unwrap();

        let writer = {
            let cache = cache.clone();
            let ledger = ledger.clone();
            let p1 = p1.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    ledger.record(&p1, dec!(1), Utc::now());
                    cache.refresh_as_of(&p1, today()).await.unwrap();
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let mut seen = 0;
        while !writer.is_finished() {
            let projection = cache.projection(&p1).await.unwrap().unwrap();
            let balance = projection.summary.current_balance;
            assert_eq!(projection.rows.len(), 29);
            assert!(projection.rows.iter().all(|row| row.opening_stock == balance));
            seen += 1;
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert!(seen > 0);

        let last = cache.summary(&p1).await.unwrap().unwrap();
        assert_eq!(last.current_balance, dec!(51));
    }
}
