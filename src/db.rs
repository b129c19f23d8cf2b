use crate::backend::LineItemBackend;
use crate::error::BackendError;
use crate::line_item::{budget_percentage, LedgerSnapshot, LineItem, ParentKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Parent record (Opportunity / Project) that owns line items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub id: String,
    pub kind: ParentKind,
    pub name: String,
    /// Opportunity amount / project budget
    pub reference_total: f64,
}

/// One CSV row as exported from the CRM
#[derive(Debug, Deserialize)]
struct CsvLineItem {
    #[serde(rename = "Id", default)]
    id: Option<String>,

    #[serde(rename = "Name")]
    name: String,

    #[serde(rename = "Cost")]
    cost: f64,

    #[serde(rename = "Budget_Percentage", default)]
    budget_percentage: Option<f64>,

    #[serde(rename = "Category", default)]
    category: Option<String>,

    #[serde(rename = "Contact", default)]
    contact: Option<String>,

    #[serde(rename = "Last_Billed_Date", default)]
    last_billed_date: Option<String>,
}

impl CsvLineItem {
    fn into_line_item(self) -> Result<LineItem> {
        let last_billed_date = match self.last_billed_date.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .with_context(|| format!("Invalid Last_Billed_Date {:?}", raw))?,
            ),
            _ => None,
        };

        Ok(LineItem {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            display_name: self.name,
            cost: self.cost,
            budget_percentage: self.budget_percentage.unwrap_or(0.0),
            category: self.category.unwrap_or_default(),
            contact_name: self.contact.filter(|c| !c.trim().is_empty()),
            last_billed_date,
        })
    }
}

/// Event for audit trail: every cost change is recorded
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Parent records
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS parents (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            reference_total REAL NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Line items (position keeps import order stable)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS line_items (
            id TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL REFERENCES parents(id),
            position INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            cost REAL NOT NULL,
            budget_percentage REAL NOT NULL DEFAULT 0,
            category TEXT NOT NULL DEFAULT '',
            contact_name TEXT,
            last_billed_date TEXT,
            updated_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_line_items_parent ON line_items(parent_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<LineItem>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut items = Vec::new();
    for (line, result) in rdr.deserialize::<CsvLineItem>().enumerate() {
        let row = result.with_context(|| format!("Failed to deserialize line item {}", line + 1))?;
        items.push(row.into_line_item()?);
    }

    Ok(items)
}

pub fn upsert_parent(conn: &Connection, parent: &ParentRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO parents (id, kind, name, reference_total) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            name = excluded.name,
            reference_total = excluded.reference_total",
        params![
            parent.id,
            parent.kind.as_str(),
            parent.name,
            parent.reference_total
        ],
    )?;

    Ok(())
}

pub fn get_parent(conn: &Connection, parent_id: &str) -> Result<Option<ParentRecord>> {
    conn.query_row(
        "SELECT id, kind, name, reference_total FROM parents WHERE id = ?1",
        params![parent_id],
        |row| {
            let kind: String = row.get(1)?;
            Ok(ParentRecord {
                id: row.get(0)?,
                kind: ParentKind::parse(&kind).unwrap_or(ParentKind::Opportunity),
                name: row.get(2)?,
                reference_total: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(Into::into)
}

/// Insert line items under `parent_id`; rows whose id already exists are skipped
pub fn insert_line_items(conn: &Connection, parent_id: &str, items: &[LineItem]) -> Result<usize> {
    let next_position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM line_items WHERE parent_id = ?1",
        params![parent_id],
        |row| row.get(0),
    )?;

    let mut inserted = 0;
    let mut duplicates = 0;

    for (offset, item) in items.iter().enumerate() {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO line_items (
                id, parent_id, position, display_name, cost, budget_percentage,
                category, contact_name, last_billed_date, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                item.id,
                parent_id,
                next_position + offset as i64,
                item.display_name,
                item.cost,
                item.budget_percentage,
                item.category,
                item.contact_name,
                item.last_billed_date.map(|d| d.to_string()),
                Utc::now().to_rfc3339(),
            ],
        )?;

        if changed > 0 {
            inserted += 1;
        } else {
            duplicates += 1;
        }
    }

    if duplicates > 0 {
        debug!(parent_id, duplicates, "skipped line items that already exist");
    }

    Ok(inserted)
}

pub fn get_line_items(conn: &Connection, parent_id: &str) -> Result<Vec<LineItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, display_name, cost, budget_percentage, category,
                contact_name, last_billed_date
         FROM line_items
         WHERE parent_id = ?1
         ORDER BY position",
    )?;

    let items = stmt
        .query_map(params![parent_id], |row| {
            let last_billed: Option<String> = row.get(6)?;
            Ok(LineItem {
                id: row.get(0)?,
                display_name: row.get(1)?,
                cost: row.get(2)?,
                budget_percentage: row.get(3)?,
                category: row.get(4)?,
                contact_name: row.get(5)?,
                last_billed_date: last_billed
                    .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
}

pub fn get_snapshot(conn: &Connection, parent_id: &str) -> Result<Option<LedgerSnapshot>> {
    let Some(parent) = get_parent(conn, parent_id)? else {
        return Ok(None);
    };

    let items = get_line_items(conn, parent_id)?;
    let total: f64 = items.iter().map(|i| i.cost).sum();

    Ok(Some(
        LedgerSnapshot::new(&parent.id, items, parent.reference_total).with_reported_total(total),
    ))
}

/// Set one row's cost and derived budget percentage. Returns false if the row does not exist.
pub fn update_cost(
    conn: &Connection,
    item_id: &str,
    new_cost: f64,
    reference_total: f64,
    actor: &str,
) -> Result<bool> {
    let previous: Option<f64> = conn
        .query_row(
            "SELECT cost FROM line_items WHERE id = ?1",
            params![item_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(previous) = previous else {
        return Ok(false);
    };

    conn.execute(
        "UPDATE line_items SET cost = ?1, budget_percentage = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            new_cost,
            budget_percentage(new_cost, reference_total),
            Utc::now().to_rfc3339(),
            item_id
        ],
    )?;

    insert_event(
        conn,
        &Event::new(
            "cost_updated",
            "line_item",
            item_id,
            serde_json::json!({ "from": previous, "to": new_cost }),
            actor,
        ),
    )?;

    Ok(true)
}

/// Apply several rows at once. Any missing row rolls the whole batch back.
pub fn update_costs(
    conn: &mut Connection,
    parent_id: &str,
    changes: &[LineItem],
    actor: &str,
) -> Result<()> {
    let tx = conn.transaction()?;

    for change in changes {
        let previous: Option<f64> = tx
            .query_row(
                "SELECT cost FROM line_items WHERE id = ?1 AND parent_id = ?2",
                params![change.id, parent_id],
                |row| row.get(0),
            )
            .optional()?;

        let previous = previous.ok_or_else(|| {
            anyhow!("Line item {} not found on {}", change.id, parent_id)
        })?;

        tx.execute(
            "UPDATE line_items SET cost = ?1, budget_percentage = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                change.cost,
                change.budget_percentage,
                Utc::now().to_rfc3339(),
                change.id
            ],
        )?;

        insert_event(
            &tx,
            &Event::new(
                "cost_updated",
                "line_item",
                &change.id,
                serde_json::json!({ "from": previous, "to": change.cost, "batch": true }),
                actor,
            ),
        )?;
    }

    tx.commit()?;
    Ok(())
}

pub fn count_line_items(conn: &Connection, parent_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM line_items WHERE parent_id = ?1",
        params![parent_id],
        |row| row.get(0),
    )?;

    Ok(count)
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

/// `LineItemBackend` over a shared SQLite connection
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    actor: String,
}

impl SqliteBackend {
    pub fn new(conn: Connection, actor: &str) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            actor: actor.to_string(),
        }
    }

    pub fn open(path: &Path, actor: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        setup_database(&conn)?;
        Ok(Self::new(conn, actor))
    }

    /// Run `f` with the connection locked
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database lock poisoned"))?;
        f(&mut conn)
    }
}

fn internal(err: anyhow::Error) -> BackendError {
    BackendError::internal(format!("{:#}", err))
}

#[async_trait]
impl LineItemBackend for SqliteBackend {
    async fn load_line_items(&self, parent_id: &str) -> Result<LedgerSnapshot, BackendError> {
        self.with_conn(|conn| get_snapshot(conn, parent_id))
            .map_err(internal)?
            .ok_or_else(|| BackendError::not_found(format!("No record found for {}", parent_id)))
    }

    async fn update_line_item(
        &self,
        item_id: &str,
        new_cost: f64,
        reference_total: f64,
    ) -> Result<(), BackendError> {
        let found = self
            .with_conn(|conn| update_cost(conn, item_id, new_cost, reference_total, &self.actor))
            .map_err(internal)?;

        if !found {
            return Err(BackendError::not_found(format!(
                "Line item {} not found",
                item_id
            )));
        }

        info!(item_id, new_cost, "line item cost updated");
        Ok(())
    }

    async fn update_line_items(
        &self,
        changes: &[LineItem],
        parent_id: &str,
    ) -> Result<(), BackendError> {
        self.with_conn(|conn| update_costs(conn, parent_id, changes, &self.actor))
            .map_err(|e| BackendError::validation(format!("{:#}", e)))?;

        info!(parent_id, rows = changes.len(), "line items updated in batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorKind;
    use std::io::Write;

    fn seeded_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        upsert_parent(
            &conn,
            &ParentRecord {
                id: "opp-1".to_string(),
                kind: ParentKind::Opportunity,
                name: "Riverside Renovation".to_string(),
                reference_total: 800.0,
            },
        )
        .unwrap();

        insert_line_items(
            &conn,
            "opp-1",
            &[
                LineItem::new("1", "Acme Electric", 500.0).with_category("Add"),
                LineItem::new("2", "Beta Builders", 300.0).with_category("Remove"),
            ],
        )
        .unwrap();

        conn
    }

    #[test]
    fn test_import_is_idempotent() {
        let conn = seeded_conn();

        let again = insert_line_items(&conn, "opp-1", &[LineItem::new("1", "Acme Electric", 500.0)])
            .unwrap();

        assert_eq!(again, 0, "Second import should insert 0 line items");
        assert_eq!(count_line_items(&conn, "opp-1").unwrap(), 2);
    }

    #[test]
    fn test_snapshot_keeps_import_order() {
        let conn = seeded_conn();

        let snapshot = get_snapshot(&conn, "opp-1").unwrap().unwrap();
        assert_eq!(snapshot.reference_total, 800.0);
        assert_eq!(snapshot.reported_total, Some(800.0));

        let ids: Vec<_> = snapshot.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(snapshot.items[1].category, "Remove");

        assert!(get_snapshot(&conn, "nope").unwrap().is_none());
    }

    #[test]
    fn test_update_cost_records_event() {
        let conn = seeded_conn();

        assert!(update_cost(&conn, "1", 600.0, 800.0, "tester").unwrap());
        assert!(!update_cost(&conn, "missing", 1.0, 800.0, "tester").unwrap());

        let items = get_line_items(&conn, "opp-1").unwrap();
        assert_eq!(items[0].cost, 600.0);
        assert_eq!(items[0].budget_percentage, 75.0);

        let events = get_events_for_entity(&conn, "line_item", "1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "cost_updated");
        assert_eq!(events[0].data["from"], serde_json::json!(500.0));
        assert_eq!(events[0].actor, "tester");
    }

    #[test]
    fn test_batch_update_rolls_back() {
        let mut conn = seeded_conn();

        let changes = vec![
            LineItem::new("1", "Acme Electric", 1.0),
            LineItem::new("ghost", "Nobody", 2.0),
        ];
        assert!(update_costs(&mut conn, "opp-1", &changes, "tester").is_err());

        let items = get_line_items(&conn, "opp-1").unwrap();
        assert_eq!(items[0].cost, 500.0);
        assert!(get_events_for_entity(&conn, "line_item", "1").unwrap().is_empty());
    }

    #[test]
    fn test_load_csv() {
        let path = std::env::temp_dir().join(format!("line-items-{}.csv", uuid::Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "Id,Name,Cost,Budget_Percentage,Category,Contact,Last_Billed_Date").unwrap();
            writeln!(file, "b-1,Acme Electric,1200.50,40,Billing,Dana Reyes,2024-03-01").unwrap();
            writeln!(file, ",Beta Builders,300,,,,").unwrap();
        }

        let items = load_csv(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "b-1");
        assert_eq!(items[0].contact_name.as_deref(), Some("Dana Reyes"));
        assert_eq!(
            items[0].last_billed_date,
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert!(!items[1].id.is_empty());
        assert_eq!(items[1].contact_name, None);
        assert_eq!(items[1].last_billed_date, None);
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let backend = SqliteBackend::new(seeded_conn(), "tester");

        backend.update_line_item("2", 250.0, 800.0).await.unwrap();
        let snapshot = backend.load_line_items("opp-1").await.unwrap();
        assert_eq!(snapshot.find("2").map(|i| i.cost), Some(250.0));

        let err = backend.update_line_item("missing", 1.0, 800.0).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);

        let err = backend.load_line_items("nope").await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::NotFound);

        let mut changed = snapshot.find("1").cloned().unwrap();
        changed.cost = 550.0;
        backend.update_line_items(&[changed], "opp-1").await.unwrap();
        assert_eq!(
            backend.load_line_items("opp-1").await.unwrap().find("1").map(|i| i.cost),
            Some(550.0)
        );
    }
}
