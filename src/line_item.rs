// 📋 Line Items - Contractor changes / billings bound to a parent record
//
// A parent record (Opportunity or Project) owns a list of line items and an
// authoritative reference total. The UI edits `cost`; everything else is
// display data supplied by the backend.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ============================================================================
// LINE ITEM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Stable record id assigned by the backend
    pub id: String,

    /// Contractor / change name shown in the first column
    pub display_name: String,

    /// Currency amount, the only user-editable field
    pub cost: f64,

    /// Share of the reference total, 0–100
    #[serde(default)]
    pub budget_percentage: f64,

    /// Free text ("Add", "Remove", "Billing", ...)
    #[serde(default)]
    pub category: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_billed_date: Option<NaiveDate>,
}

impl LineItem {
    pub fn new(id: &str, display_name: &str, cost: f64) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            cost,
            budget_percentage: 0.0,
            category: String::new(),
            contact_name: None,
            last_billed_date: None,
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_budget_percentage(mut self, percentage: f64) -> Self {
        self.budget_percentage = percentage;
        self
    }

    pub fn with_contact(mut self, contact_name: &str) -> Self {
        self.contact_name = Some(contact_name.to_string());
        self
    }

    pub fn with_last_billed_date(mut self, date: NaiveDate) -> Self {
        self.last_billed_date = Some(date);
        self
    }

    /// Recompute `budget_percentage` from the current cost.
    ///
    /// A zero reference total has no meaningful share, so the percentage
    /// falls back to 0.
    pub fn recompute_budget_percentage(&mut self, reference_total: f64) {
        self.budget_percentage = budget_percentage(self.cost, reference_total);
    }
}

pub fn budget_percentage(cost: f64, reference_total: f64) -> f64 {
    if reference_total == 0.0 {
        0.0
    } else {
        cost / reference_total * 100.0
    }
}

// ============================================================================
// LEDGER SNAPSHOT (load payload)
// ============================================================================

/// Kind of record that owns the line items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParentKind {
    Opportunity,
    Project,
}

impl ParentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentKind::Opportunity => "opportunity",
            ParentKind::Project => "project",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "opportunity" => Some(ParentKind::Opportunity),
            "project" => Some(ParentKind::Project),
            _ => None,
        }
    }
}

/// Everything a single load returns for one parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub parent_id: String,
    pub items: Vec<LineItem>,

    /// Authoritative target amount (Opportunity amount / Project budget)
    pub reference_total: f64,

    /// Total computed by the backend, when it supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_total: Option<f64>,

    pub loaded_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    pub fn new(parent_id: &str, items: Vec<LineItem>, reference_total: f64) -> Self {
        Self {
            parent_id: parent_id.to_string(),
            items,
            reference_total,
            reported_total: None,
            loaded_at: Utc::now(),
        }
    }

    pub fn with_reported_total(mut self, total: f64) -> Self {
        self.reported_total = Some(total);
        self
    }

    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn find(&self, id: &str) -> Option<&LineItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

// ============================================================================
// EDITS
// ============================================================================

/// Raw cell value from the table renderer, not yet parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftEdit {
    pub id: String,
    pub cost: String,
}

impl DraftEdit {
    pub fn new(id: &str, cost: &str) -> Self {
        Self {
            id: id.to_string(),
            cost: cost.to_string(),
        }
    }
}

/// Parsed draft, ready to merge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub id: String,
    pub new_cost: f64,
}

// ============================================================================
// SORTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    DisplayName,
    ContactName,
    Cost,
    BudgetPercentage,
    Category,
    LastBilledDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn toggle(&self) -> Self {
        match self {
            SortDirection::Asc => SortDirection::Desc,
            SortDirection::Desc => SortDirection::Asc,
        }
    }
}

/// Stable sort; rows missing an optional value go last in both directions.
pub fn sort_items(items: &mut [LineItem], field: SortField, direction: SortDirection) {
    items.sort_by(|a, b| {
        let (ordering, missing) = match field {
            SortField::DisplayName => (a.display_name.cmp(&b.display_name), None),
            SortField::Category => (a.category.cmp(&b.category), None),
            SortField::Cost => (a.cost.total_cmp(&b.cost), None),
            SortField::BudgetPercentage => {
                (a.budget_percentage.total_cmp(&b.budget_percentage), None)
            }
            SortField::ContactName => compare_optional(&a.contact_name, &b.contact_name),
            SortField::LastBilledDate => {
                compare_optional(&a.last_billed_date, &b.last_billed_date)
            }
        };

        match (missing, direction) {
            (Some(fixed), _) => fixed,
            (None, SortDirection::Asc) => ordering,
            (None, SortDirection::Desc) => ordering.reverse(),
        }
    });
}

/// Returns `(ordering, Some(fixed))` when one side is missing, so the caller
/// keeps absent values last regardless of direction.
fn compare_optional<T: Ord>(a: &Option<T>, b: &Option<T>) -> (Ordering, Option<Ordering>) {
    match (a, b) {
        (Some(x), Some(y)) => (x.cmp(y), None),
        (Some(_), None) => (Ordering::Less, Some(Ordering::Less)),
        (None, Some(_)) => (Ordering::Greater, Some(Ordering::Greater)),
        (None, None) => (Ordering::Equal, Some(Ordering::Equal)),
    }
}
