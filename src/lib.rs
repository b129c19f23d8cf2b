// Contractor Ledger - Core Library
// Editable reconciliation tables for contractor changes and billings.
// Exposes all modules for use in the CLI, TUI, API server, and tests.

pub mod backend;
pub mod config;
pub mod db;
pub mod edits;
pub mod error;
pub mod line_item;
pub mod loader;
pub mod notify;
pub mod reconciliation;
pub mod table;

// Re-export commonly used types
pub use backend::{LineItemBackend, MemoryBackend};
pub use config::{
    ColumnDescriptor, ColumnField, ColumnType, CostParsing, TableConfig, UpdateStrategy,
};
pub use db::{
    get_events_for_entity, get_snapshot, insert_line_items, load_csv, setup_database,
    upsert_parent, Event, ParentRecord, SqliteBackend,
};
pub use edits::{merge_edits, parse_cost, EditAccumulator, MergeOutcome};
pub use error::{
    BackendError, BackendErrorKind, LedgerError, LoadError, ParseError, UpdateError,
    ValidationError,
};
pub use line_item::{
    sort_items, DraftEdit, Edit, LedgerSnapshot, LineItem, ParentKind, SortDirection, SortField,
};
pub use loader::{DataLoader, LoadState, LoadStream};
pub use notify::{CollectingNotifier, LogNotifier, Notification, NotificationSink, Severity};
pub use reconciliation::{
    format_currency, format_percent, FooterData, ReconciliationEngine, ReconciliationStatus,
    BALANCE_TOLERANCE,
};
pub use table::{Phase, Preview, ReconciliationTable, SaveOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the fmt subscriber used by the binaries (`RUST_LOG` overrides `default_filter`)
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
