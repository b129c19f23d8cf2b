// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_stream::StreamExt;

// Use library instead of local modules
use contractor_ledger::{
    format_currency, format_percent, init_tracing, insert_line_items, load_csv, CollectingNotifier,
    DraftEdit, LedgerError, LedgerSnapshot, LineItemBackend, ParentKind, ParentRecord,
    ReconciliationTable, Severity, SqliteBackend, TableConfig,
};

#[derive(Parser)]
#[command(name = "contractor-ledger", version, about = "Contractor changes and billings, reconciled")]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "LEDGER_DB", default_value = "contractor-ledger.db", global = true)]
    db: PathBuf,

    /// Table preset: opportunity-changes, opportunity-reconciliation, project-billings
    #[arg(long, env = "LEDGER_PRESET", default_value = "opportunity-changes", global = true)]
    preset: String,

    /// JSON table configuration (overrides --preset)
    #[arg(long, env = "LEDGER_TABLE_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import line items from CSV under a parent record
    Import {
        csv: PathBuf,
        #[arg(long)]
        parent: String,
        /// Opportunity amount / project budget
        #[arg(long)]
        reference: f64,
        #[arg(long, default_value = "opportunity")]
        kind: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Print a parent's line items and reconciliation
    Show { parent: String },
    /// Set one row's cost through the normal save path
    Set {
        parent: String,
        item: String,
        cost: String,
    },
    /// Interactive editable table
    Tui { parent: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The TUI owns the terminal; keep log lines out of it unless asked for
    let default_filter = match cli.command {
        Command::Tui { .. } => "off",
        _ => "warn",
    };
    init_tracing(default_filter);

    match &cli.command {
        Command::Import {
            csv,
            parent,
            reference,
            kind,
            name,
        } => run_import(&cli.db, csv, parent, *reference, kind, name.as_deref()),
        Command::Show { parent } => run_show(&cli, parent),
        Command::Set { parent, item, cost } => run_set(&cli, parent, item, cost),
        Command::Tui { parent } => run_ui_mode(&cli, parent),
    }
}

fn table_config(cli: &Cli) -> Result<TableConfig> {
    match &cli.config {
        Some(path) => TableConfig::from_json_file(path),
        None => TableConfig::preset(&cli.preset)
            .ok_or_else(|| anyhow!("Unknown preset {:?}", cli.preset)),
    }
}

fn runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

fn open_backend(db: &Path) -> Result<SqliteBackend> {
    if !db.exists() {
        eprintln!("❌ Database not found at {:?}", db);
        eprintln!("   Run: contractor-ledger import <csv> --parent <id> --reference <amount>");
        eprintln!("   to import line items first.");
        std::process::exit(1);
    }
    SqliteBackend::open(db, "cli")
}

/// Open a table on `parent`, failing if the first load does not succeed
fn open_table(
    rt: &Runtime,
    cli: &Cli,
    parent: &str,
    notifier: &CollectingNotifier,
) -> Result<Arc<ReconciliationTable>> {
    let backend: Arc<dyn LineItemBackend> = Arc::new(open_backend(&cli.db)?);
    let table = Arc::new(ReconciliationTable::new(
        table_config(cli)?,
        backend,
        Arc::new(notifier.clone()),
    ));

    rt.block_on(async {
        let mut loads = table.open(parent).await?;
        match loads.next().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(LedgerError::Load(e)),
            None => Ok(()),
        }
    })
    .map_err(|e| anyhow!(e.user_message()))?;

    Ok(table)
}

fn run_import(
    db: &Path,
    csv: &Path,
    parent: &str,
    reference: f64,
    kind: &str,
    name: Option<&str>,
) -> Result<()> {
    println!("🗄️  Import - CSV → SQLite + WAL");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let kind = ParentKind::parse(kind).ok_or_else(|| anyhow!("Unknown parent kind {:?}", kind))?;

    // 1. Load CSV
    println!("\n📂 Loading CSV...");
    let items = load_csv(csv)?;
    println!("✓ Loaded {} line items from CSV", items.len());

    // 2. Setup database
    println!("\n🔧 Setting up database...");
    let backend = SqliteBackend::open(db, "import")?;
    println!("✓ Database initialized with WAL mode");

    // 3. Insert parent + line items
    println!("\n💾 Inserting line items...");
    let record = ParentRecord {
        id: parent.to_string(),
        kind,
        name: name.unwrap_or(parent).to_string(),
        reference_total: reference,
    };
    let (inserted, total) = backend.with_conn(|conn| {
        contractor_ledger::upsert_parent(conn, &record)?;
        let inserted = insert_line_items(conn, parent, &items)?;
        let total = contractor_ledger::db::count_line_items(conn, parent)?;
        Ok((inserted, total))
    })?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ {} {} now has {} line items", kind.as_str(), parent, total);
    println!("✓ New: {}", inserted);
    println!("✓ Already present: {}", items.len() - inserted);

    Ok(())
}

fn run_show(cli: &Cli, parent: &str) -> Result<()> {
    let rt = runtime()?;
    let notifier = CollectingNotifier::new();
    let table = open_table(&rt, cli, parent, &notifier)?;

    let snapshot = table
        .snapshot()
        .ok_or_else(|| anyhow!("No line items loaded for {}", parent))?;

    println!("📊 {} - {}", table.config().title, parent);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for item in &snapshot.items {
        println!(
            "{:<12} {:<32} {:>14} {:>9}  {}",
            item.id,
            item.display_name,
            format_currency(item.cost),
            format_percent(item.budget_percentage, 2),
            item.category
        );
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if let Some(status) = table.status() {
        let mark = if status.is_balanced { "✅" } else { "⚠️ " };
        println!("{} {}", mark, status.summary());
    }

    Ok(())
}

fn run_set(cli: &Cli, parent: &str, item: &str, cost: &str) -> Result<()> {
    let rt = runtime()?;
    let notifier = CollectingNotifier::new();
    let table = open_table(&rt, cli, parent, &notifier)?;

    let snapshot = table
        .snapshot()
        .ok_or_else(|| anyhow!("No line items loaded for {}", parent))?;
    ensure_item(&snapshot, item)?;

    let result = rt.block_on(table.save_drafts(vec![DraftEdit::new(item, cost)]));

    for note in notifier.drain() {
        match note.severity {
            Severity::Success => println!("✅ {}: {}", note.title, note.message),
            Severity::Error => eprintln!("❌ {}: {}", note.title, note.message),
        }
    }

    let outcome = result.map_err(|e| anyhow!(e.user_message()))?;
    if let Some(status) = outcome.status {
        println!("✓ {}", status.summary());
    }

    Ok(())
}

/// `set` only edits rows that exist; anything else is a typo, not "no changes"
fn ensure_item(snapshot: &LedgerSnapshot, item: &str) -> Result<()> {
    if snapshot.find(item).is_none() {
        bail!("No line item {} on {}", item, snapshot.parent_id);
    }
    Ok(())
}

#[cfg(feature = "tui")]
fn run_ui_mode(cli: &Cli, parent: &str) -> Result<()> {
    println!("🖥️  Loading Contractor Ledger UI...\n");

    let rt = runtime()?;
    let notifier = CollectingNotifier::new();
    let table = open_table(&rt, cli, parent, &notifier)?;

    println!("Starting UI... (Press 'q' to quit)\n");

    let mut app = ui::App::new(table, rt, notifier);
    ui::run_ui(&mut app)?;

    println!("\n✅ UI closed successfully");

    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_ui_mode(_cli: &Cli, _parent: &str) -> Result<()> {
    eprintln!("❌ TUI mode not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use the API: cargo run --bin contractor-ledger-server --features server");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use contractor_ledger::LineItem;

    #[test]
    fn test_ensure_item() {
        let snapshot = LedgerSnapshot::new(
            "opp-1",
            vec![LineItem::new("1", "Acme Electric", 500.0)],
            500.0,
        );

        assert!(ensure_item(&snapshot, "1").is_ok());

        let err = ensure_item(&snapshot, "42").unwrap_err();
        assert_eq!(err.to_string(), "No line item 42 on opp-1");
        println!("✅ Unknown item rejected before save");
    }
}
