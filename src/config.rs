// ⚙️ Table Configuration - Columns and behaviour passed in at construction
//
// The three shipped presets correspond to the three table flavours:
//   opportunity_changes        - per-row updates, no balance gate
//   opportunity_reconciliation - batch update, strict balance gate
//   project_billings           - read-only list with refresh

use crate::line_item::SortField;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// COLUMNS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Currency,
    Percent,
    Date,
}

/// Which `LineItem` field a column displays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnField {
    DisplayName,
    ContactName,
    Cost,
    BudgetPercentage,
    Category,
    LastBilledDate,
}

impl ColumnField {
    pub fn sort_field(&self) -> SortField {
        match self {
            ColumnField::DisplayName => SortField::DisplayName,
            ColumnField::ContactName => SortField::ContactName,
            ColumnField::Cost => SortField::Cost,
            ColumnField::BudgetPercentage => SortField::BudgetPercentage,
            ColumnField::Category => SortField::Category,
            ColumnField::LastBilledDate => SortField::LastBilledDate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub label: String,
    pub field: ColumnField,
    pub column_type: ColumnType,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub sortable: bool,
    /// Fraction digits for currency / percent cells
    #[serde(default = "default_fraction_digits")]
    pub fraction_digits: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_code: Option<String>,
}

fn default_fraction_digits() -> usize {
    2
}

impl ColumnDescriptor {
    pub fn new(label: &str, field: ColumnField, column_type: ColumnType) -> Self {
        Self {
            label: label.to_string(),
            field,
            column_type,
            editable: false,
            sortable: false,
            fraction_digits: default_fraction_digits(),
            currency_code: None,
        }
    }

    pub fn editable(mut self) -> Self {
        self.editable = true;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.sortable = true;
        self
    }

    pub fn currency(mut self, code: &str) -> Self {
        self.currency_code = Some(code.to_string());
        self
    }
}

// ============================================================================
// BEHAVIOUR
// ============================================================================

/// How changed rows reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// One call per changed row, awaited in order
    Sequential,
    /// One call carrying every changed row
    Batch,
}

/// What to do with a cost cell that is not a number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostParsing {
    /// Reject the save with a `ParseError`
    #[default]
    Strict,
    /// Leading-number parsing, garbage becomes 0
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub title: String,
    pub columns: Vec<ColumnDescriptor>,
    pub strategy: UpdateStrategy,
    #[serde(default)]
    pub cost_parsing: CostParsing,
    /// Refuse to save when the edited total does not match the reference
    #[serde(default)]
    pub require_balance: bool,
    /// Recompute budget % for edited rows before the balance check
    #[serde(default)]
    pub recompute_budget_percentage: bool,
    /// `None` waits forever
    #[serde(default = "default_timeout", with = "timeout_millis")]
    pub backend_timeout: Option<Duration>,
}

fn default_timeout() -> Option<Duration> {
    Some(DEFAULT_BACKEND_TIMEOUT)
}

impl TableConfig {
    /// Opportunity contractor changes saved one row at a time
    pub fn opportunity_changes() -> Self {
        Self {
            title: "Contractor Changes".to_string(),
            columns: vec![
                ColumnDescriptor::new("Name", ColumnField::DisplayName, ColumnType::Text),
                ColumnDescriptor::new("Cost", ColumnField::Cost, ColumnType::Currency).editable(),
                ColumnDescriptor::new(
                    "Budget Percentage",
                    ColumnField::BudgetPercentage,
                    ColumnType::Percent,
                ),
                ColumnDescriptor::new("Change Type", ColumnField::Category, ColumnType::Text),
            ],
            strategy: UpdateStrategy::Sequential,
            cost_parsing: CostParsing::Strict,
            require_balance: false,
            recompute_budget_percentage: false,
            backend_timeout: default_timeout(),
        }
    }

    /// Opportunity contractor changes that must add up to the amount
    pub fn opportunity_reconciliation() -> Self {
        Self {
            title: "Contractor Reconciliation".to_string(),
            columns: vec![
                ColumnDescriptor::new("Contractor", ColumnField::DisplayName, ColumnType::Text)
                    .sortable(),
                ColumnDescriptor::new("Cost", ColumnField::Cost, ColumnType::Currency)
                    .currency("USD")
                    .editable()
                    .sortable(),
                ColumnDescriptor::new(
                    "Budget %",
                    ColumnField::BudgetPercentage,
                    ColumnType::Percent,
                )
                .sortable(),
            ],
            strategy: UpdateStrategy::Batch,
            cost_parsing: CostParsing::Strict,
            require_balance: true,
            recompute_budget_percentage: true,
            backend_timeout: default_timeout(),
        }
    }

    /// Read-only project billing list
    pub fn project_billings() -> Self {
        Self {
            title: "Contractor Billings".to_string(),
            columns: vec![
                ColumnDescriptor::new(
                    "Contractor Name",
                    ColumnField::DisplayName,
                    ColumnType::Text,
                )
                .sortable(),
                ColumnDescriptor::new("Contact", ColumnField::ContactName, ColumnType::Text)
                    .sortable(),
                ColumnDescriptor::new(
                    "Budget %",
                    ColumnField::BudgetPercentage,
                    ColumnType::Percent,
                )
                .sortable(),
                ColumnDescriptor::new("Cost", ColumnField::Cost, ColumnType::Currency).sortable(),
                ColumnDescriptor::new(
                    "Last Billed Date",
                    ColumnField::LastBilledDate,
                    ColumnType::Date,
                )
                .sortable(),
            ],
            strategy: UpdateStrategy::Batch,
            cost_parsing: CostParsing::Strict,
            require_balance: false,
            recompute_budget_percentage: false,
            backend_timeout: default_timeout(),
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "opportunity-changes" => Some(Self::opportunity_changes()),
            "opportunity-reconciliation" => Some(Self::opportunity_reconciliation()),
            "project-billings" => Some(Self::project_billings()),
            _ => None,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read table config {}", path.display()))?;
        serde_json::from_str(&raw).context("Failed to parse table config")
    }

    /// The cost column is the only one that can be editable
    pub fn is_editable(&self) -> bool {
        self.columns
            .iter()
            .any(|c| c.editable && c.field == ColumnField::Cost)
    }

    pub fn column(&self, field: ColumnField) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.field == field)
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self::opportunity_changes()
    }
}

/// Timeouts travel as whole milliseconds in JSON
mod timeout_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
