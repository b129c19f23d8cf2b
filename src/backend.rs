//! Record store interface and an in-memory implementation.
//!
//! The table never talks to storage directly; it goes through
//! [`LineItemBackend`]. Hosts plug in [`MemoryBackend`] (tests, demos) or
//! [`crate::db::SqliteBackend`].

use crate::error::BackendError;
use crate::line_item::{budget_percentage, LedgerSnapshot, LineItem};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Await a backend call, giving up after `limit` (the limit is returned on expiry).
pub(crate) async fn bounded<F: Future>(
    limit: Option<Duration>,
    call: F,
) -> Result<F::Output, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| limit),
        None => Ok(call.await),
    }
}

#[async_trait]
pub trait LineItemBackend: Send + Sync {
    /// Line items plus the reference total for one parent record.
    async fn load_line_items(&self, parent_id: &str) -> Result<LedgerSnapshot, BackendError>;

    /// Persist one row's cost. The backend derives the stored budget
    /// percentage from `reference_total`.
    async fn update_line_item(
        &self,
        item_id: &str,
        new_cost: f64,
        reference_total: f64,
    ) -> Result<(), BackendError>;

    /// Persist several rows in one call. Whether a rejection is
    /// all-or-nothing is up to the implementation.
    async fn update_line_items(
        &self,
        changes: &[LineItem],
        parent_id: &str,
    ) -> Result<(), BackendError>;
}

#[async_trait]
impl<T: LineItemBackend + ?Sized> LineItemBackend for Arc<T> {
    async fn load_line_items(&self, parent_id: &str) -> Result<LedgerSnapshot, BackendError> {
        (**self).load_line_items(parent_id).await
    }

    async fn update_line_item(
        &self,
        item_id: &str,
        new_cost: f64,
        reference_total: f64,
    ) -> Result<(), BackendError> {
        (**self).update_line_item(item_id, new_cost, reference_total).await
    }

    async fn update_line_items(
        &self,
        changes: &[LineItem],
        parent_id: &str,
    ) -> Result<(), BackendError> {
        (**self).update_line_items(changes, parent_id).await
    }
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

#[derive(Debug, Clone)]
struct Ledger {
    items: Vec<LineItem>,
    reference_total: f64,
    report_total: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    ledgers: HashMap<String, Ledger>,
    load_failure: Option<BackendError>,
    batch_failure: Option<BackendError>,
    row_failures: HashMap<String, BackendError>,
    load_calls: usize,
    row_update_calls: Vec<String>,
    batch_update_calls: usize,
    hang: HashSet<&'static str>,
}

/// In-process record store with failure injection and call counters
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the data is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_ledger(&self, parent_id: &str, items: Vec<LineItem>, reference_total: f64) {
        self.state().ledgers.insert(
            parent_id.to_string(),
            Ledger {
                items,
                reference_total,
                report_total: false,
            },
        );
    }

    /// Also return a server-computed total with each load
    pub fn report_totals(&self, parent_id: &str) {
        if let Some(ledger) = self.state().ledgers.get_mut(parent_id) {
            ledger.report_total = true;
        }
    }

    pub fn fail_loads(&self, error: Option<BackendError>) {
        self.state().load_failure = error;
    }

    pub fn fail_batches(&self, error: Option<BackendError>) {
        self.state().batch_failure = error;
    }

    pub fn fail_row(&self, item_id: &str, error: BackendError) {
        self.state().row_failures.insert(item_id.to_string(), error);
    }

    /// Make an operation ("load", "row", "batch") never complete
    pub fn hang(&self, operation: &'static str) {
        self.state().hang.insert(operation);
    }

    pub fn load_calls(&self) -> usize {
        self.state().load_calls
    }

    pub fn row_update_calls(&self) -> Vec<String> {
        self.state().row_update_calls.clone()
    }

    pub fn batch_update_calls(&self) -> usize {
        self.state().batch_update_calls
    }

    pub fn cost_of(&self, item_id: &str) -> Option<f64> {
        self.state()
            .ledgers
            .values()
            .flat_map(|l| l.items.iter())
            .find(|i| i.id == item_id)
            .map(|i| i.cost)
    }

    async fn maybe_hang(&self, operation: &'static str) {
        let hangs = self.state().hang.contains(operation);
        if hangs {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl LineItemBackend for MemoryBackend {
    async fn load_line_items(&self, parent_id: &str) -> Result<LedgerSnapshot, BackendError> {
        self.maybe_hang("load").await;

        let mut state = self.state();
        state.load_calls += 1;

        if let Some(err) = state.load_failure.clone() {
            return Err(err);
        }

        let ledger = state
            .ledgers
            .get(parent_id)
            .ok_or_else(|| BackendError::not_found(format!("No record found for {}", parent_id)))?;

        let mut snapshot =
            LedgerSnapshot::new(parent_id, ledger.items.clone(), ledger.reference_total);
        if ledger.report_total {
            snapshot = snapshot.with_reported_total(ledger.items.iter().map(|i| i.cost).sum());
        }

        Ok(snapshot)
    }

    async fn update_line_item(
        &self,
        item_id: &str,
        new_cost: f64,
        reference_total: f64,
    ) -> Result<(), BackendError> {
        self.maybe_hang("row").await;

        let mut state = self.state();
        state.row_update_calls.push(item_id.to_string());

        if let Some(err) = state.row_failures.get(item_id).cloned() {
            return Err(err);
        }

        let item = state
            .ledgers
            .values_mut()
            .flat_map(|l| l.items.iter_mut())
            .find(|i| i.id == item_id)
            .ok_or_else(|| BackendError::not_found(format!("Line item {} not found", item_id)))?;

        item.cost = new_cost;
        item.budget_percentage = budget_percentage(new_cost, reference_total);
        Ok(())
    }

    async fn update_line_items(
        &self,
        changes: &[LineItem],
        parent_id: &str,
    ) -> Result<(), BackendError> {
        self.maybe_hang("batch").await;

        let mut state = self.state();
        state.batch_update_calls += 1;

        if let Some(err) = state.batch_failure.clone() {
            return Err(err);
        }

        let ledger = state
            .ledgers
            .get_mut(parent_id)
            .ok_or_else(|| BackendError::not_found(format!("No record found for {}", parent_id)))?;

        // All-or-nothing: check every id before touching anything
        if let Some(missing) = changes
            .iter()
            .find(|c| !ledger.items.iter().any(|i| i.id == c.id))
        {
            return Err(BackendError::not_found(format!(
                "Line item {} not found",
                missing.id
            )));
        }

        for change in changes {
            if let Some(item) = ledger.items.iter_mut().find(|i| i.id == change.id) {
                item.cost = change.cost;
                item.budget_percentage = change.budget_percentage;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorKind;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.insert_ledger(
            "opp-1",
            vec![
                LineItem::new("1", "Acme Electric", 500.0),
                LineItem::new("2", "Beta Builders", 300.0),
            ],
            800.0,
        );
        backend
    }

    #[tokio::test]
    async fn test_load_and_row_update() {
        let backend = seeded();

        let snapshot = backend.load_line_items("opp-1").await.unwrap();
        assert_eq!(snapshot.items.len(), 2);
        assert_eq!(snapshot.reference_total, 800.0);
        assert_eq!(snapshot.reported_total, None);

        backend.update_line_item("1", 400.0, 800.0).await.unwrap();
        assert_eq!(backend.cost_of("1"), Some(400.0));

        let snapshot = backend.load_line_items("opp-1").await.unwrap();
        assert_eq!(snapshot.find("1").map(|i| i.budget_percentage), Some(50.0));
        assert_eq!(backend.load_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_parent() {
        let backend = seeded();
        let err = backend.load_line_items("missing").await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let backend = seeded();
        let changes = vec![
            LineItem::new("1", "Acme Electric", 1.0),
            LineItem::new("ghost", "Nobody", 2.0),
        ];

        assert!(backend.update_line_items(&changes, "opp-1").await.is_err());
        assert_eq!(backend.cost_of("1"), Some(500.0));
    }

    #[tokio::test]
    async fn test_reported_total() {
        let backend = seeded();
        backend.report_totals("opp-1");

        let snapshot = backend.load_line_items("opp-1").await.unwrap();
        assert_eq!(snapshot.reported_total, Some(800.0));
    }
}
