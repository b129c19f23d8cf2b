// 💾 Reconciliation Table - Loads, reconciles and saves one parent's line items
//
// Save cycle:
//   Idle → Saving → (update ok) → refresh → clear drafts → Idle
//                 → (any failure) → drafts kept → Idle
//
// Save and refresh share one gate: while either is running the other is
// rejected with `Busy`, so the reconciler never sees a half-merged table.

use crate::backend::{bounded, LineItemBackend};
use crate::config::{ColumnDescriptor, TableConfig, UpdateStrategy};
use crate::edits::{merge_edits, EditAccumulator, MergeOutcome};
use crate::error::{LedgerError, LoadError, ParseError, UpdateError, ValidationError};
use crate::line_item::{DraftEdit, LedgerSnapshot, LineItem};
use crate::loader::{DataLoader, LoadResult, LoadState, LoadStream};
use crate::notify::{Notification, NotificationSink};
use crate::reconciliation::{ReconciliationEngine, ReconciliationStatus};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

pub const SAVE_SUCCESS_MESSAGE: &str = "Changes saved successfully";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Loading,
    Saving,
}

/// What a successful save did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveOutcome {
    pub saved: Vec<String>,
    /// Drafts for rows that were no longer loaded
    pub ignored: Vec<String>,
    /// Reconciliation of the re-fetched rows, when the refresh succeeded
    pub status: Option<ReconciliationStatus>,
    /// The update went through but re-fetching failed
    pub refresh_error: Option<String>,
}

/// Loaded rows with the pending drafts applied, for display
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub merge: MergeOutcome,
    pub status: ReconciliationStatus,
}

/// Releases the operation gate when dropped
struct OperationGuard<'a> {
    phase: &'a Mutex<Phase>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        *lock(self.phase) = Phase::Idle;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ReconciliationTable {
    config: TableConfig,
    loader: DataLoader,
    notifier: Arc<dyn NotificationSink>,
    engine: ReconciliationEngine,
    drafts: Mutex<EditAccumulator>,
    phase: Mutex<Phase>,
}

impl ReconciliationTable {
    pub fn new(
        config: TableConfig,
        backend: Arc<dyn LineItemBackend>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let loader = DataLoader::new(backend, config.backend_timeout);
        Self {
            config,
            loader,
            notifier,
            engine: ReconciliationEngine::new(),
            drafts: Mutex::new(EditAccumulator::new()),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.config.columns
    }

    pub fn loader(&self) -> &DataLoader {
        &self.loader
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Whether a host should enable its save trigger
    pub fn can_save(&self) -> bool {
        self.phase() == Phase::Idle && self.config.is_editable() && !lock(&self.drafts).is_empty()
    }

    pub fn load_state(&self) -> LoadState {
        self.loader.state()
    }

    pub fn snapshot(&self) -> Option<Arc<LedgerSnapshot>> {
        self.loader.snapshot()
    }

    /// Reconciliation of the rows as loaded, ignoring drafts
    pub fn status(&self) -> Option<ReconciliationStatus> {
        self.snapshot().map(|s| {
            self.engine
                .reconcile_reported(&s.items, s.reference_total, s.reported_total)
        })
    }

    // ========================================================================
    // LOADING
    // ========================================================================

    /// Bind the table to a parent record and stream its loads.
    ///
    /// Switching to a different parent discards drafts made for the old one.
    pub async fn open(&self, parent_id: &str) -> Result<LoadStream, LedgerError> {
        let _guard = self.begin(Phase::Loading)?;

        if self.loader.parent_id().as_deref() != Some(parent_id.trim()) {
            lock(&self.drafts).clear();
        }

        let stream = self.loader.subscribe(parent_id).await;
        if let LoadState::Failed(e) = self.loader.state() {
            self.notify_load_failure(&e);
        }
        Ok(stream)
    }

    /// Re-fetch the current parent. Rejected while a save is running.
    pub async fn refresh(&self) -> Result<Arc<LedgerSnapshot>, LedgerError> {
        let _guard = self.begin(Phase::Loading)?;

        self.loader.refresh().await.map_err(|e| {
            self.notify_load_failure(&e);
            LedgerError::Load(e)
        })
    }

    fn notify_load_failure(&self, e: &LoadError) {
        self.notifier.notify(Notification::error(&e.user_message()));
    }

    // ========================================================================
    // DRAFTS
    // ========================================================================

    pub fn stage_drafts(&self, drafts: impl IntoIterator<Item = DraftEdit>) {
        lock(&self.drafts).stage(drafts);
    }

    pub fn drafts(&self) -> Vec<DraftEdit> {
        lock(&self.drafts).drafts().to_vec()
    }

    /// Cancel every pending edit
    pub fn discard_drafts(&self) {
        lock(&self.drafts).clear();
    }

    /// Loaded rows with drafts applied, as they would be saved
    pub fn preview(&self) -> Result<Preview, LedgerError> {
        let snapshot = self.snapshot().ok_or(ValidationError::NotLoaded)?;
        let edits = lock(&self.drafts).parse(self.config.cost_parsing)?;

        let merge = merge_edits(
            &snapshot.items,
            &edits,
            snapshot.reference_total,
            self.config.recompute_budget_percentage,
        );
        let status = self.engine.reconcile(&merge.items, snapshot.reference_total);

        Ok(Preview { merge, status })
    }

    /// Like [`preview`](Self::preview), but a draft that does not parse is
    /// left out and reported instead of hiding every other draft.
    pub fn preview_valid(&self) -> Result<(Preview, Vec<ParseError>), LedgerError> {
        let snapshot = self.snapshot().ok_or(ValidationError::NotLoaded)?;
        let (edits, rejected) = lock(&self.drafts).parse_each(self.config.cost_parsing);

        let merge = merge_edits(
            &snapshot.items,
            &edits,
            snapshot.reference_total,
            self.config.recompute_budget_percentage,
        );
        let status = self.engine.reconcile(&merge.items, snapshot.reference_total);

        Ok((Preview { merge, status }, rejected))
    }

    // ========================================================================
    // SAVING
    // ========================================================================

    /// Persist the pending drafts.
    ///
    /// Every failure is reported through the notifier and leaves the drafts
    /// in place so the user can fix and retry. `Busy` is returned without a
    /// notification: the host should not have offered the action.
    pub async fn save(&self) -> Result<SaveOutcome, LedgerError> {
        let _guard = self.begin(Phase::Saving)?;

        match self.persist().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(error = %e, "save failed, drafts kept");
                self.notifier.notify(Notification::error(&e.user_message()));
                Err(e)
            }
        }
    }

    /// Stage `drafts` and save them in one step, the way a table's save event arrives
    pub async fn save_drafts(
        &self,
        drafts: impl IntoIterator<Item = DraftEdit>,
    ) -> Result<SaveOutcome, LedgerError> {
        if self.phase() != Phase::Idle {
            return Err(LedgerError::Busy);
        }
        self.stage_drafts(drafts);
        self.save().await
    }

    async fn persist(&self) -> Result<SaveOutcome, LedgerError> {
        if !self.config.is_editable() {
            return Err(ValidationError::ReadOnly.into());
        }

        let snapshot = self.snapshot().ok_or(ValidationError::NotLoaded)?;
        let pending = lock(&self.drafts).clone();
        if pending.is_empty() {
            return Err(ValidationError::NoChanges.into());
        }

        let edits = pending.parse(self.config.cost_parsing)?;
        let merge = merge_edits(
            &snapshot.items,
            &edits,
            snapshot.reference_total,
            self.config.recompute_budget_percentage,
        );
        if !merge.has_changes() {
            return Err(ValidationError::NoChanges.into());
        }

        let status = self.engine.reconcile(&merge.items, snapshot.reference_total);
        if self.config.require_balance && !status.is_balanced {
            return Err(ValidationError::Unbalanced {
                total_cost: status.total_cost,
                reference_total: status.reference_total,
            }
            .into());
        }

        match self.config.strategy {
            UpdateStrategy::Sequential => {
                self.update_sequentially(&merge.changed, snapshot.reference_total)
                    .await?
            }
            UpdateStrategy::Batch => {
                self.update_batch(&merge.changed, &snapshot.parent_id)
                    .await?
            }
        }

        let saved = merge.changed_ids();
        info!(parent_id = %snapshot.parent_id, rows = saved.len(), "line items saved");
        self.notifier.notify(Notification::success(SAVE_SUCCESS_MESSAGE));

        // Drafts go only once the authoritative rows are back, and only the
        // ones this save sent; edits staged meanwhile stay pending
        let refreshed: LoadResult = self.loader.refresh().await;
        lock(&self.drafts).remove_saved(pending.drafts());

        let (status, refresh_error) = match refreshed {
            Ok(s) => (
                Some(self.engine.reconcile_reported(&s.items, s.reference_total, s.reported_total)),
                None,
            ),
            Err(e) => {
                warn!(error = %e, "saved, but reloading line items failed");
                self.notify_load_failure(&e);
                (None, Some(e.user_message()))
            }
        };

        Ok(SaveOutcome {
            saved,
            ignored: merge.ignored,
            status,
            refresh_error,
        })
    }

    /// One call per row, in order; stop at the first failure
    async fn update_sequentially(
        &self,
        rows: &[LineItem],
        reference_total: f64,
    ) -> Result<(), UpdateError> {
        let backend = self.loader.backend();
        let mut persisted: Vec<String> = Vec::new();

        for (index, row) in rows.iter().enumerate() {
            let call = backend.update_line_item(&row.id, row.cost, reference_total);
            let failure = match bounded(self.config.backend_timeout, call).await {
                Ok(Ok(())) => {
                    persisted.push(row.id.clone());
                    continue;
                }
                Ok(Err(e)) if persisted.is_empty() => return Err(UpdateError::Rejected(e)),
                Err(limit) if persisted.is_empty() => return Err(UpdateError::Timeout(limit)),
                Ok(Err(e)) => e.user_message().to_string(),
                Err(limit) => format!("update timed out after {:?}", limit),
            };

            let not_attempted: Vec<String> =
                rows[index + 1..].iter().map(|r| r.id.clone()).collect();
            warn!(
                failed = %row.id,
                persisted = persisted.len(),
                not_attempted = not_attempted.len(),
                "sequential update stopped part-way"
            );

            return Err(UpdateError::Partial {
                persisted,
                failed: row.id.clone(),
                not_attempted,
                message: failure,
            });
        }

        Ok(())
    }

    async fn update_batch(&self, rows: &[LineItem], parent_id: &str) -> Result<(), UpdateError> {
        let call = self.loader.backend().update_line_items(rows, parent_id);
        match bounded(self.config.backend_timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(UpdateError::Rejected(e)),
            Err(limit) => Err(UpdateError::Timeout(limit)),
        }
    }

    fn begin(&self, phase: Phase) -> Result<OperationGuard<'_>, LedgerError> {
        let mut current = lock(&self.phase);
        if *current != Phase::Idle {
            return Err(LedgerError::Busy);
        }
        *current = phase;
        Ok(OperationGuard { phase: &self.phase })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::CostParsing;
    use crate::error::{BackendError, BackendErrorKind};
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use crate::notify::{CollectingNotifier, Severity};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.insert_ledger(
            "opp-1",
            vec![
                LineItem::new("1", "Acme Electric", 500.0).with_budget_percentage(62.5),
                LineItem::new("2", "Beta Builders", 300.0).with_budget_percentage(37.5),
            ],
            800.0,
        );
        backend
    }

    async fn open_table(
        config: TableConfig,
        backend: &MemoryBackend,
    ) -> (ReconciliationTable, CollectingNotifier) {
        let notifier = CollectingNotifier::new();
        let table = ReconciliationTable::new(
            config,
            Arc::new(backend.clone()),
            Arc::new(notifier.clone()),
        );
        table.open("opp-1").await.unwrap();
        (table, notifier)
    }

    /// Holds every batch update until `release` is notified
    struct GatedBackend {
        inner: MemoryBackend,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl LineItemBackend for GatedBackend {
        async fn load_line_items(&self, parent_id: &str) -> Result<LedgerSnapshot, BackendError> {
            self.inner.load_line_items(parent_id).await
        }

        async fn update_line_item(
            &self,
            item_id: &str,
            new_cost: f64,
            reference_total: f64,
        ) -> Result<(), BackendError> {
            self.inner
                .update_line_item(item_id, new_cost, reference_total)
                .await
        }

        async fn update_line_items(
            &self,
            changes: &[LineItem],
            parent_id: &str,
        ) -> Result<(), BackendError> {
            self.release.notified().await;
            self.inner.update_line_items(changes, parent_id).await
        }
    }

    fn batch_config() -> TableConfig {
        let mut config = TableConfig::opportunity_reconciliation();
        config.require_balance = false;
        config
    }

    #[tokio::test]
    async fn test_initial_status_balanced() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        let status = table.status().unwrap();
        assert!(status.is_balanced);
        assert_eq!(status.variance, 0.0);
    }

    #[tokio::test]
    async fn test_preview_shows_unbalanced_edit() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        table.stage_drafts(vec![DraftEdit::new("1", "600")]);
        let preview = table.preview().unwrap();

        assert_eq!(preview.status.total_cost, 900.0);
        assert_eq!(preview.status.variance, 100.0);
        assert!(!preview.status.is_balanced);
        assert_eq!(backend.row_update_calls().len(), 0);
    }

    #[tokio::test]
    async fn test_batch_save_success() {
        let backend = seeded();
        let (table, notifier) = open_table(batch_config(), &backend).await;
        let loads_before = backend.load_calls();

        let outcome = table
            .save_drafts(vec![DraftEdit::new("1", "600")])
            .await
            .unwrap();

        assert_eq!(outcome.saved, vec!["1".to_string()]);
        assert!(table.drafts().is_empty());
        assert_eq!(backend.load_calls(), loads_before + 1);
        assert_eq!(backend.batch_update_calls(), 1);
        assert_eq!(backend.cost_of("1"), Some(600.0));

        let last = notifier.last().unwrap();
        assert_eq!(last.severity, Severity::Success);
        assert_eq!(last.message, SAVE_SUCCESS_MESSAGE);

        // Post-save state comes from the re-fetch
        let status = outcome.status.unwrap();
        assert_eq!(status.total_cost, 900.0);
        assert_eq!(table.snapshot().unwrap().find("1").unwrap().budget_percentage, 75.0);
        assert_eq!(table.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_batch_rejection_keeps_drafts() {
        let backend = seeded();
        backend.fail_batches(Some(BackendError::validation("Insufficient funds")));
        let (table, notifier) = open_table(batch_config(), &backend).await;
        let loads_before = backend.load_calls();

        let err = table
            .save_drafts(vec![DraftEdit::new("1", "600")])
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Update(UpdateError::Rejected(_))));
        assert_eq!(table.drafts(), vec![DraftEdit::new("1", "600")]);
        assert_eq!(backend.load_calls(), loads_before);

        let last = notifier.last().unwrap();
        assert_eq!(last.severity, Severity::Error);
        assert_eq!(last.message, "Insufficient funds");
        assert_eq!(table.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_generic_message_when_backend_silent() {
        let backend = seeded();
        backend.fail_batches(Some(BackendError::without_message(BackendErrorKind::Internal)));
        let (table, notifier) = open_table(batch_config(), &backend).await;

        let _ = table.save_drafts(vec![DraftEdit::new("2", "1")]).await;
        assert_eq!(
            notifier.last().unwrap().message,
            crate::error::GENERIC_SAVE_ERROR
        );
    }

    #[tokio::test]
    async fn test_balance_gate_blocks_backend() {
        let backend = seeded();
        let (table, notifier) =
            open_table(TableConfig::opportunity_reconciliation(), &backend).await;

        let err = table
            .save_drafts(vec![DraftEdit::new("1", "600")])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::Validation(ValidationError::Unbalanced {
                total_cost: 900.0,
                reference_total: 800.0,
            })
        );
        assert_eq!(backend.batch_update_calls(), 0);
        assert_eq!(table.drafts().len(), 1);
        assert_eq!(
            notifier.last().unwrap().message,
            "Total cost (900.00) must equal reference amount (800.00)"
        );

        // Rebalance and it goes through
        table.stage_drafts(vec![DraftEdit::new("2", "200")]);
        let outcome = table.save().await.unwrap();
        assert_eq!(outcome.saved.len(), 2);
        assert!(outcome.status.unwrap().is_balanced);
    }

    #[tokio::test]
    async fn test_sequential_saves_in_order() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        table
            .save_drafts(vec![DraftEdit::new("2", "350"), DraftEdit::new("1", "450")])
            .await
            .unwrap();

        assert_eq!(backend.row_update_calls(), vec!["2".to_string(), "1".to_string()]);
        assert_eq!(backend.cost_of("1"), Some(450.0));
        assert_eq!(backend.cost_of("2"), Some(350.0));
        assert!(table.drafts().is_empty());
    }

    #[tokio::test]
    async fn test_sequential_partial_failure() {
        let backend = seeded();
        backend.insert_ledger(
            "opp-1",
            vec![
                LineItem::new("1", "Acme Electric", 100.0),
                LineItem::new("2", "Beta Builders", 100.0),
                LineItem::new("3", "Civic Plumbing", 100.0),
            ],
            300.0,
        );
        backend.fail_row("2", BackendError::validation("Row locked"));
        let (table, notifier) = open_table(TableConfig::opportunity_changes(), &backend).await;
        let loads_before = backend.load_calls();

        let err = table
            .save_drafts(vec![
                DraftEdit::new("1", "110"),
                DraftEdit::new("2", "90"),
                DraftEdit::new("3", "100"),
            ])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::Update(UpdateError::Partial {
                persisted: vec!["1".to_string()],
                failed: "2".to_string(),
                not_attempted: vec!["3".to_string()],
                message: "Row locked".to_string(),
            })
        );
        assert_eq!(backend.row_update_calls(), vec!["1".to_string(), "2".to_string()]);
        assert_eq!(backend.cost_of("1"), Some(110.0));
        assert_eq!(table.drafts().len(), 3);
        assert_eq!(backend.load_calls(), loads_before);
        assert!(notifier.last().unwrap().message.contains("not attempted: 3"));
    }

    #[tokio::test]
    async fn test_strict_parse_error_keeps_drafts() {
        let backend = seeded();
        let (table, notifier) = open_table(TableConfig::opportunity_changes(), &backend).await;

        let err = table
            .save_drafts(vec![DraftEdit::new("1", "six hundred")])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::Parse(ParseError {
                row_id: "1".to_string(),
                input: "six hundred".to_string(),
            })
        );
        assert!(backend.row_update_calls().is_empty());
        assert_eq!(table.drafts().len(), 1);
        assert_eq!(notifier.last().unwrap().severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_lenient_parse_coerces_to_zero() {
        let backend = seeded();
        let mut config = TableConfig::opportunity_changes();
        config.cost_parsing = CostParsing::Lenient;
        let (table, _) = open_table(config, &backend).await;

        table
            .save_drafts(vec![DraftEdit::new("1", "six hundred")])
            .await
            .unwrap();
        assert_eq!(backend.cost_of("1"), Some(0.0));
    }

    #[tokio::test]
    async fn test_read_only_table_rejects_save() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::project_billings(), &backend).await;

        let err = table
            .save_drafts(vec![DraftEdit::new("1", "10")])
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Validation(ValidationError::ReadOnly));
        assert!(!table.can_save());

        // Refresh still works
        assert!(table.refresh().await.is_ok());
    }

    #[tokio::test]
    async fn test_drafts_for_removed_rows_only() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        let err = table
            .save_drafts(vec![DraftEdit::new("gone", "10")])
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Validation(ValidationError::NoChanges));
    }

    #[tokio::test]
    async fn test_unknown_rows_ignored_alongside_real_edit() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        let outcome = table
            .save_drafts(vec![DraftEdit::new("gone", "10"), DraftEdit::new("2", "310")])
            .await
            .unwrap();
        assert_eq!(outcome.saved, vec!["2".to_string()]);
        assert_eq!(outcome.ignored, vec!["gone".to_string()]);
    }

    #[tokio::test]
    async fn test_save_and_refresh_rejected_while_saving() {
        let backend = seeded();
        let (table, _) = open_table(batch_config(), &backend).await;
        backend.hang("batch");

        let table = Arc::new(table);
        table.stage_drafts(vec![DraftEdit::new("1", "600")]);

        let background = table.clone();
        let handle = tokio::spawn(async move { background.save().await });
        while table.phase() != Phase::Saving {
            tokio::task::yield_now().await;
        }

        assert_eq!(table.save().await.unwrap_err(), LedgerError::Busy);
        assert_eq!(table.refresh().await.unwrap_err(), LedgerError::Busy);
        assert!(!table.can_save());

        handle.abort();
        let _ = handle.await;
        assert_eq!(table.phase(), Phase::Idle);
        assert_eq!(table.drafts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_update_times_out() {
        let backend = seeded();
        let mut config = TableConfig::opportunity_changes();
        config.backend_timeout = Some(Duration::from_secs(10));
        let (table, notifier) = open_table(config, &backend).await;
        backend.hang("row");

        let err = table
            .save_drafts(vec![DraftEdit::new("1", "600")])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::Update(UpdateError::Timeout(Duration::from_secs(10)))
        );
        assert_eq!(table.phase(), Phase::Idle);
        assert_eq!(table.drafts().len(), 1);
        assert_eq!(notifier.last().unwrap().severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_refresh_failure_after_save() {
        let backend = seeded();
        let (table, notifier) = open_table(batch_config(), &backend).await;

        // Loads fail from now on, updates still succeed
        backend.fail_loads(Some(BackendError::new(BackendErrorKind::Network, "offline")));

        let outcome = table
            .save_drafts(vec![DraftEdit::new("1", "600")])
            .await
            .unwrap();

        assert_eq!(outcome.refresh_error.as_deref(), Some("offline"));
        assert!(outcome.status.is_none());
        assert!(table.drafts().is_empty());
        assert!(table.load_state().error().is_some());

        let severities: Vec<_> = notifier.snapshot().iter().map(|n| n.severity).collect();
        assert_eq!(severities, vec![Severity::Success, Severity::Error]);
    }

    #[tokio::test]
    async fn test_open_other_parent_clears_drafts() {
        let backend = seeded();
        backend.insert_ledger("opp-2", vec![LineItem::new("9", "Civic Plumbing", 50.0)], 50.0);
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        table.stage_drafts(vec![DraftEdit::new("1", "600")]);
        let mut stream = table.open("opp-2").await.unwrap();

        assert!(table.drafts().is_empty());
        let snapshot = stream.next().await.unwrap().unwrap();
        assert_eq!(snapshot.parent_id, "opp-2");
    }

    #[tokio::test]
    async fn test_open_failure_notifies() {
        let backend = seeded();
        let notifier = CollectingNotifier::new();
        let table = ReconciliationTable::new(
            TableConfig::project_billings(),
            Arc::new(backend.clone()),
            Arc::new(notifier.clone()),
        );

        let mut stream = table.open("missing").await.unwrap();
        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(notifier.last().unwrap().message, "No record found for missing");
    }

    #[tokio::test]
    async fn test_draft_staged_mid_save_is_kept() {
        let backend = seeded();
        let release = Arc::new(Notify::new());
        let gated = GatedBackend {
            inner: backend.clone(),
            release: release.clone(),
        };
        let table = Arc::new(ReconciliationTable::new(
            batch_config(),
            Arc::new(gated),
            Arc::new(CollectingNotifier::new()),
        ));
        table.open("opp-1").await.unwrap();

        table.stage_drafts(vec![DraftEdit::new("1", "600")]);
        let background = table.clone();
        let handle = tokio::spawn(async move { background.save().await });
        while table.phase() != Phase::Saving {
            tokio::task::yield_now().await;
        }

        // The user keeps editing while the batch is in flight
        table.stage_drafts(vec![DraftEdit::new("2", "250")]);
        release.notify_one();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.saved, vec!["1".to_string()]);
        assert_eq!(backend.cost_of("1"), Some(600.0));
        assert_eq!(backend.cost_of("2"), Some(300.0));
        assert_eq!(table.drafts(), vec![DraftEdit::new("2", "250")]);
        println!("✅ Edit staged during save still pending afterwards");
    }

    #[tokio::test]
    async fn test_redrafted_row_mid_save_is_kept() {
        let backend = seeded();
        let release = Arc::new(Notify::new());
        let gated = GatedBackend {
            inner: backend.clone(),
            release: release.clone(),
        };
        let table = Arc::new(ReconciliationTable::new(
            batch_config(),
            Arc::new(gated),
            Arc::new(CollectingNotifier::new()),
        ));
        table.open("opp-1").await.unwrap();

        table.stage_drafts(vec![DraftEdit::new("1", "600")]);
        let background = table.clone();
        let handle = tokio::spawn(async move { background.save().await });
        while table.phase() != Phase::Saving {
            tokio::task::yield_now().await;
        }

        // Same row, new value: the saved 600 must not erase the 650
        table.stage_drafts(vec![DraftEdit::new("1", "650")]);
        release.notify_one();

        handle.await.unwrap().unwrap();
        assert_eq!(backend.cost_of("1"), Some(600.0));
        assert_eq!(table.drafts(), vec![DraftEdit::new("1", "650")]);
    }

    #[tokio::test]
    async fn test_preview_valid_skips_bad_draft() {
        let backend = seeded();
        let (table, _) = open_table(TableConfig::opportunity_changes(), &backend).await;

        table.stage_drafts(vec![DraftEdit::new("1", "600"), DraftEdit::new("2", "abc")]);
        assert!(matches!(table.preview(), Err(LedgerError::Parse(_))));

        let (preview, rejected) = table.preview_valid().unwrap();
        assert_eq!(preview.merge.items[0].cost, 600.0);
        assert_eq!(preview.merge.items[1].cost, 300.0);
        assert_eq!(preview.status.total_cost, 900.0);
        assert_eq!(
            rejected,
            vec![ParseError {
                row_id: "2".to_string(),
                input: "abc".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_reopen_after_failed_load_reloads() {
        let backend = seeded();
        backend.fail_loads(Some(BackendError::new(BackendErrorKind::Network, "offline")));
        let notifier = CollectingNotifier::new();
        let table = ReconciliationTable::new(
            TableConfig::opportunity_changes(),
            Arc::new(backend.clone()),
            Arc::new(notifier.clone()),
        );

        let mut stream = table.open("opp-1").await.unwrap();
        assert!(stream.next().await.unwrap().is_err());
        assert_eq!(notifier.snapshot().len(), 1);

        backend.fail_loads(None);
        let mut stream = table.open("opp-1").await.unwrap();

        assert_eq!(backend.load_calls(), 2);
        assert!(stream.next().await.unwrap().is_ok());
        // No replay of the earlier failure
        assert_eq!(notifier.snapshot().len(), 1);
    }
}
