//! Alert publisher: the review queue for changes made to quoted lots.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, instrument};

use lotsync_core::AlertId;

use crate::store::{AckOutcome, AlertFilter, AlertStore, ReconciliationAlert, StoreError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(AlertId),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug)]
pub struct AlertPublisher<S: AlertStore> {
    store: Arc<S>,
}

impl<S: AlertStore> Clone for AlertPublisher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: AlertStore> AlertPublisher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persist an alert raised outside a reconciliation unit of work.
    #[instrument(skip(self, alert), fields(alert_id = %alert.id, lot_id = %alert.lot_id), err)]
    pub async fn raise(&self, alert: ReconciliationAlert) -> Result<ReconciliationAlert, AlertError> {
        self.store.insert_alert(alert.clone()).await?;
        info!(kind = %alert.delta_kind, before = %alert.qty_before, after = %alert.qty_after, "alert raised");
        Ok(alert)
    }

    /// Mark an alert as reviewed. Acknowledging twice keeps the first reviewer.
    #[instrument(skip(self), err)]
    pub async fn acknowledge(&self, id: AlertId, by: &str) -> Result<AckOutcome, AlertError> {
        let by = by.trim();
        if by.is_empty() {
            return Err(AlertError::Validation("reviewer is required".to_string()));
        }
        match self.store.acknowledge(id, by, Utc::now()).await {
            Ok(outcome) => {
                if let AckOutcome::Acknowledged(_) = outcome {
                    info!("alert acknowledged");
                }
                Ok(outcome)
            }
            Err(StoreError::NotFound(_)) => Err(AlertError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self, id: AlertId) -> Result<ReconciliationAlert, AlertError> {
        self.store.get_alert(id).await?.ok_or(AlertError::NotFound(id))
    }

    /// Unresolved alerts, oldest first.
    pub async fn list_unresolved(&self, filter: &AlertFilter) -> Result<Vec<ReconciliationAlert>, AlertError> {
        Ok(self.store.list_unresolved(filter).await?)
    }
}
