// ⚖️ Reconciliation Engine - Validate that line items add up
//
// Following the formula:
//   sum(line_item.cost) = reference_total   (within $0.01)
//
// The tolerance absorbs floating-point rounding only. It is fixed: a table
// either balances to the cent or it does not.

use crate::line_item::LineItem;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum absolute difference still considered balanced
pub const BALANCE_TOLERANCE: f64 = 0.01;

// ============================================================================
// RECONCILIATION STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationStatus {
    pub total_cost: f64,
    pub reference_total: f64,

    /// total_cost - reference_total (positive = over budget)
    pub variance: f64,

    pub is_balanced: bool,
}

impl ReconciliationStatus {
    pub fn has_discrepancy(&self) -> bool {
        !self.is_balanced
    }

    /// What is still left to allocate (negative = over budget)
    pub fn remaining(&self) -> f64 {
        self.reference_total - self.total_cost
    }

    pub fn footer(&self) -> FooterData {
        FooterData {
            total_cost: self.total_cost,
            reference_total: self.reference_total,
            difference: self.remaining(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Total cost {}, reference amount {}, variance {} ({})",
            format_currency(self.total_cost),
            format_currency(self.reference_total),
            format_currency(self.variance),
            if self.is_balanced { "balanced" } else { "unbalanced" }
        )
    }
}

/// Values shown under the table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FooterData {
    pub total_cost: f64,
    pub reference_total: f64,
    pub difference: f64,
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationEngine;

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine
    }

    /// Reconcile line items against the reference total
    ///
    /// Example:
    /// ```
    /// use contractor_ledger::{LineItem, ReconciliationEngine};
    ///
    /// let engine = ReconciliationEngine::new();
    /// let items = vec![
    ///     LineItem::new("1", "Acme Electric", 500.0),
    ///     LineItem::new("2", "Beta Builders", 300.0),
    /// ];
    ///
    /// let status = engine.reconcile(&items, 800.0);
    /// assert!(status.is_balanced);
    /// assert_eq!(status.variance, 0.0);
    /// ```
    pub fn reconcile(&self, items: &[LineItem], reference_total: f64) -> ReconciliationStatus {
        let total_cost = self.total_cost(items);
        let variance = total_cost - reference_total;

        ReconciliationStatus {
            total_cost,
            reference_total,
            variance,
            is_balanced: variance.abs() < BALANCE_TOLERANCE,
        }
    }

    /// Same as `reconcile`, but cross-checks a total computed by the backend.
    ///
    /// The local sum always wins; a disagreement is only logged.
    pub fn reconcile_reported(
        &self,
        items: &[LineItem],
        reference_total: f64,
        reported_total: Option<f64>,
    ) -> ReconciliationStatus {
        let status = self.reconcile(items, reference_total);

        if let Some(reported) = reported_total {
            if (reported - status.total_cost).abs() >= BALANCE_TOLERANCE {
                warn!(
                    reported,
                    computed = status.total_cost,
                    "backend total disagrees with line item sum"
                );
            }
        }

        status
    }

    /// Sum of the cost column; non-finite costs count as zero
    pub fn total_cost(&self, items: &[LineItem]) -> f64 {
        items
            .iter()
            .map(|item| if item.cost.is_finite() { item.cost } else { 0.0 })
            .sum()
    }

    /// Quick check if line items balance to the expected amount
    pub fn is_balanced(&self, items: &[LineItem], reference_total: f64) -> bool {
        self.reconcile(items, reference_total).is_balanced
    }
}

// ============================================================================
// FORMATTING
// ============================================================================

/// `$1,234.50` / `-$12.00`
pub fn format_currency(amount: f64) -> String {
    let sign = if amount < 0.0 { "-" } else { "" };
    let cents = format!("{:.2}", amount.abs());
    let (whole, fraction) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));

    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}${}.{}", sign, grouped, fraction)
}

pub fn format_percent(percentage: f64, fraction_digits: usize) -> String {
    format!("{:.*}%", fraction_digits, percentage)
}

// ============================================================================
// TESTS
// ============================================================================
