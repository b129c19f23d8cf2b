// Contractor Ledger - Web Server
// JSON API over the reconciliation table, one table per parent record

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use contractor_ledger::{
    init_tracing, BackendErrorKind, ColumnDescriptor, CollectingNotifier, DraftEdit, LedgerError,
    LineItem, LineItemBackend, LoadError, Notification, Phase, ReconciliationStatus,
    ReconciliationTable, SaveOutcome, SqliteBackend, TableConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "contractor-ledger-server", version)]
struct Args {
    #[arg(long, env = "LEDGER_DB", default_value = "contractor-ledger.db")]
    db: PathBuf,

    #[arg(long, env = "LEDGER_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    #[arg(long, env = "LEDGER_PRESET", default_value = "opportunity-changes")]
    preset: String,

    /// JSON table configuration (overrides --preset)
    #[arg(long, env = "LEDGER_TABLE_CONFIG")]
    config: Option<PathBuf>,
}

/// A table plus the notifications it has raised but nobody has read yet
#[derive(Clone)]
struct TableHandle {
    table: Arc<ReconciliationTable>,
    notifier: CollectingNotifier,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    backend: Arc<dyn LineItemBackend>,
    config: TableConfig,
    tables: Arc<Mutex<HashMap<String, TableHandle>>>,
}

impl AppState {
    fn handle(&self, parent_id: &str) -> TableHandle {
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        tables
            .entry(parent_id.to_string())
            .or_insert_with(|| {
                let notifier = CollectingNotifier::new();
                let table = ReconciliationTable::new(
                    self.config.clone(),
                    self.backend.clone(),
                    Arc::new(notifier.clone()),
                );
                TableHandle {
                    table: Arc::new(table),
                    notifier,
                }
            })
            .clone()
    }

    /// Forget a parent whose load showed it does not exist, so unknown ids
    /// never accumulate in the registry
    fn evict_if_missing(&self, parent_id: &str, err: &LedgerError) {
        if !is_missing(err) {
            return;
        }
        let mut tables = self
            .tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let unloaded = tables
            .get(parent_id)
            .map(|h| h.table.snapshot().is_none())
            .unwrap_or(false);
        if unloaded {
            tables.remove(parent_id);
        }
    }
}

fn is_missing(err: &LedgerError) -> bool {
    match err {
        LedgerError::Load(LoadError::InvalidParent) => true,
        LedgerError::Load(LoadError::Backend(e)) => e.kind == BackendErrorKind::NotFound,
        _ => false,
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    notifications: Vec<Notification>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
            notifications: Vec::new(),
        }
    }

    fn with_notifications(mut self, notifications: Vec<Notification>) -> Self {
        self.notifications = notifications;
        self
    }
}

impl ApiResponse<()> {
    fn fail(message: String) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message),
            notifications: Vec::new(),
        }
    }
}

/// Everything a client needs to render the table
#[derive(Serialize)]
struct LedgerView {
    parent_id: String,
    title: String,
    columns: Vec<ColumnDescriptor>,
    items: Vec<LineItem>,
    reference_total: f64,
    reconciliation: Option<ReconciliationStatus>,
    drafts: Vec<DraftEdit>,
    phase: Phase,
    editable: bool,
}

impl LedgerView {
    fn of(table: &ReconciliationTable, parent_id: &str) -> Self {
        let snapshot = table.snapshot();
        Self {
            parent_id: parent_id.to_string(),
            title: table.config().title.clone(),
            columns: table.columns().to_vec(),
            items: snapshot.as_ref().map(|s| s.items.clone()).unwrap_or_default(),
            reference_total: snapshot.as_ref().map(|s| s.reference_total).unwrap_or(0.0),
            reconciliation: table.status(),
            drafts: table.drafts(),
            phase: table.phase(),
            editable: table.config().is_editable(),
        }
    }
}

/// Rows as they would be saved with the staged drafts
#[derive(Serialize)]
struct PreviewResponse {
    items: Vec<LineItem>,
    changed: Vec<String>,
    ignored: Vec<String>,
    reconciliation: ReconciliationStatus,
}

#[derive(Deserialize)]
struct DraftsRequest {
    drafts: Vec<DraftEdit>,
}

#[derive(Deserialize, Default)]
struct SaveRequest {
    #[serde(default)]
    drafts: Vec<DraftEdit>,
}

// ============================================================================
// Error mapping
// ============================================================================

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::Busy => StatusCode::CONFLICT,
        LedgerError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::Parse(_) => StatusCode::BAD_REQUEST,
        LedgerError::Load(LoadError::InvalidParent) => StatusCode::BAD_REQUEST,
        LedgerError::Load(LoadError::Backend(e)) if e.kind == BackendErrorKind::NotFound => {
            StatusCode::NOT_FOUND
        }
        LedgerError::Load(LoadError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        LedgerError::Load(_) | LedgerError::Update(_) => StatusCode::BAD_GATEWAY,
    }
}

fn failure(err: &LedgerError, handle: &TableHandle) -> Response {
    (
        status_for(err),
        Json(ApiResponse::fail(err.user_message()).with_notifications(handle.notifier.drain())),
    )
        .into_response()
}

/// Make sure `parent_id` has been loaded at least once. A parent that turns
/// out not to exist is dropped from the registry again.
async fn ensure_open(
    state: &AppState,
    handle: &TableHandle,
    parent_id: &str,
) -> Result<(), LedgerError> {
    if handle.table.snapshot().is_some() {
        return Ok(());
    }

    let result = match handle.table.open(parent_id).await {
        Ok(mut loads) => match loads.next().await {
            Some(Err(e)) => Err(LedgerError::Load(e)),
            _ => Ok(()),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        state.evict_if_missing(parent_id, e);
    }
    result
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/parents/:id - Line items, columns and reconciliation
async fn get_ledger(State(state): State<AppState>, Path(parent_id): Path<String>) -> Response {
    let handle = state.handle(&parent_id);

    if let Err(e) = ensure_open(&state, &handle, &parent_id).await {
        error!(parent_id = %parent_id, error = %e, "loading line items failed");
        return failure(&e, &handle);
    }

    let view = LedgerView::of(&handle.table, &parent_id);
    (
        StatusCode::OK,
        Json(ApiResponse::ok(view).with_notifications(handle.notifier.drain())),
    )
        .into_response()
}

/// POST /api/parents/:id/drafts - Stage cost edits and preview the result
async fn stage_drafts(
    State(state): State<AppState>,
    Path(parent_id): Path<String>,
    Json(request): Json<DraftsRequest>,
) -> Response {
    let handle = state.handle(&parent_id);

    if let Err(e) = ensure_open(&state, &handle, &parent_id).await {
        return failure(&e, &handle);
    }

    handle.table.stage_drafts(request.drafts);

    match handle.table.preview() {
        Ok(preview) => {
            let changed = preview.merge.changed_ids();
            let response = PreviewResponse {
                items: preview.merge.items,
                changed,
                ignored: preview.merge.ignored,
                reconciliation: preview.status,
            };
            (StatusCode::OK, Json(ApiResponse::ok(response))).into_response()
        }
        Err(e) => failure(&e, &handle),
    }
}

/// DELETE /api/parents/:id/drafts - Cancel pending edits
async fn discard_drafts(State(state): State<AppState>, Path(parent_id): Path<String>) -> Response {
    let handle = state.handle(&parent_id);

    if let Err(e) = ensure_open(&state, &handle, &parent_id).await {
        return failure(&e, &handle);
    }

    handle.table.discard_drafts();
    (StatusCode::OK, Json(ApiResponse::ok(LedgerView::of(&handle.table, &parent_id))))
        .into_response()
}

/// POST /api/parents/:id/save - Persist staged drafts (plus any in the body)
async fn save_ledger(
    State(state): State<AppState>,
    Path(parent_id): Path<String>,
    body: Option<Json<SaveRequest>>,
) -> Response {
    let handle = state.handle(&parent_id);

    if let Err(e) = ensure_open(&state, &handle, &parent_id).await {
        return failure(&e, &handle);
    }

    let request = body.map(|Json(r)| r).unwrap_or_default();
    let result: Result<SaveOutcome, LedgerError> = if request.drafts.is_empty() {
        handle.table.save().await
    } else {
        handle.table.save_drafts(request.drafts).await
    };

    match result {
        Ok(outcome) => {
            info!(parent_id = %parent_id, rows = outcome.saved.len(), "saved via API");
            (
                StatusCode::OK,
                Json(ApiResponse::ok(outcome).with_notifications(handle.notifier.drain())),
            )
                .into_response()
        }
        Err(e) => failure(&e, &handle),
    }
}

/// POST /api/parents/:id/refresh - Re-fetch line items from the store
async fn refresh_ledger(State(state): State<AppState>, Path(parent_id): Path<String>) -> Response {
    let handle = state.handle(&parent_id);

    let result = if handle.table.loader().parent_id().is_some() {
        handle.table.refresh().await.map(|_| ())
    } else {
        ensure_open(&state, &handle, &parent_id).await
    };

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(
                ApiResponse::ok(LedgerView::of(&handle.table, &parent_id))
                    .with_notifications(handle.notifier.drain()),
            ),
        )
            .into_response(),
        Err(e) => {
            state.evict_if_missing(&parent_id, &e);
            failure(&e, &handle)
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("info");

    println!("🌐 Contractor Ledger - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !args.db.exists() {
        eprintln!("❌ Database not found at {:?}", args.db);
        eprintln!("   Run: contractor-ledger import <csv> --parent <id> --reference <amount>");
        eprintln!("   to import line items first.");
        std::process::exit(1);
    }

    let config = match &args.config {
        Some(path) => TableConfig::from_json_file(path)?,
        None => TableConfig::preset(&args.preset)
            .ok_or_else(|| anyhow::anyhow!("Unknown preset {:?}", args.preset))?,
    };

    let backend = SqliteBackend::open(&args.db, "api")?;
    println!("✓ Database opened: {:?}", args.db);
    println!("✓ Table: {}", config.title);

    // Create shared state
    let state = AppState {
        backend: Arc::new(backend),
        config,
        tables: Arc::new(Mutex::new(HashMap::new())),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/parents/:id", get(get_ledger))
        .route("/parents/:id/drafts", post(stage_drafts).delete(discard_drafts))
        .route("/parents/:id/save", post(save_ledger))
        .route("/parents/:id/refresh", post(refresh_ledger))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    // Start server
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;

    println!("\n🚀 Server running on http://{}", args.bind);
    println!("   API: http://{}/api/parents/<id>", args.bind);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await?;

    Ok(())
}
