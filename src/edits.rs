// ✏️ Edit Accumulator - Pending cost edits and how they merge into rows
//
// Drafts arrive as raw strings from the table renderer. They are parsed and
// merged only when a save is triggered; nothing is validated as the user types.

use crate::config::CostParsing;
use crate::error::ParseError;
use crate::line_item::{DraftEdit, Edit, LineItem};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// ACCUMULATOR
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditAccumulator {
    drafts: Vec<DraftEdit>,
}

impl EditAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch of drafts; a later draft for the same row replaces the earlier one.
    pub fn stage(&mut self, drafts: impl IntoIterator<Item = DraftEdit>) {
        for draft in drafts {
            match self.drafts.iter_mut().find(|d| d.id == draft.id) {
                Some(existing) => existing.cost = draft.cost,
                None => self.drafts.push(draft),
            }
        }
    }

    pub fn drafts(&self) -> &[DraftEdit] {
        &self.drafts
    }

    pub fn draft_for(&self, id: &str) -> Option<&DraftEdit> {
        self.drafts.iter().find(|d| d.id == id)
    }

    pub fn discard(&mut self, id: &str) {
        self.drafts.retain(|d| d.id != id);
    }

    /// Drop drafts that still match what was persisted; edits made since stay
    pub fn remove_saved(&mut self, saved: &[DraftEdit]) {
        self.drafts.retain(|d| !saved.contains(d));
    }

    pub fn clear(&mut self) {
        self.drafts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    /// Parse every draft. Strict parsing fails on the first bad cell.
    pub fn parse(&self, policy: CostParsing) -> Result<Vec<Edit>, ParseError> {
        self.drafts
            .iter()
            .map(|draft| {
                Ok(Edit {
                    id: draft.id.clone(),
                    new_cost: parse_cost(&draft.id, &draft.cost, policy)?,
                })
            })
            .collect()
    }

    /// Parse every draft independently, splitting the ones that parse from
    /// the ones that do not
    pub fn parse_each(&self, policy: CostParsing) -> (Vec<Edit>, Vec<ParseError>) {
        let mut edits = Vec::new();
        let mut rejected = Vec::new();

        for draft in &self.drafts {
            match parse_cost(&draft.id, &draft.cost, policy) {
                Ok(new_cost) => edits.push(Edit {
                    id: draft.id.clone(),
                    new_cost,
                }),
                Err(e) => rejected.push(e),
            }
        }

        (edits, rejected)
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Parse a cost cell. `$` and thousands separators are accepted.
pub fn parse_cost(row_id: &str, input: &str, policy: CostParsing) -> Result<f64, ParseError> {
    let cleaned = normalize(input);

    match policy {
        CostParsing::Strict => cleaned
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError {
                row_id: row_id.to_string(),
                input: input.to_string(),
            }),
        CostParsing::Lenient => match leading_number(&cleaned) {
            Some(value) => Ok(value),
            None => {
                warn!(row_id, input, "unparsable cost coerced to zero");
                Ok(0.0)
            }
        },
    }
}

fn normalize(input: &str) -> String {
    let trimmed = input.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, trimmed),
    };
    let rest = rest.strip_prefix('$').unwrap_or(rest);
    let digits: String = rest.chars().filter(|c| *c != ',').collect();

    if negative {
        format!("-{}", digits)
    } else {
        digits
    }
}

/// Longest numeric prefix, the way a browser's `parseFloat` reads "12.5abc".
fn leading_number(input: &str) -> Option<f64> {
    let bytes = input.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;

    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }

    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }

    if !seen_digit {
        return None;
    }

    // Exponent counts only when digits follow it: "1e3" but not "1e"
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'-' || bytes[exp_end] == b'+') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_start {
            end = exp_end;
        }
    }

    input[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

// ============================================================================
// MERGE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Full collection with edits applied; same ids, same order
    pub items: Vec<LineItem>,

    /// Rows an edit touched, post-merge values
    pub changed: Vec<LineItem>,

    /// Edits naming rows that are no longer loaded
    pub ignored: Vec<String>,
}

impl MergeOutcome {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    pub fn changed_ids(&self) -> Vec<String> {
        self.changed.iter().map(|item| item.id.clone()).collect()
    }
}

/// Apply parsed edits to a copy of `items`.
///
/// Budget percentages are recomputed for edited rows when asked to, so the
/// caller can run the balance check on the result directly.
pub fn merge_edits(
    items: &[LineItem],
    edits: &[Edit],
    reference_total: f64,
    recompute_budget_percentage: bool,
) -> MergeOutcome {
    let mut merged = items.to_vec();
    let mut changed = Vec::new();
    let mut ignored = Vec::new();

    for edit in edits {
        let Some(row) = merged.iter_mut().find(|row| row.id == edit.id) else {
            debug!(id = %edit.id, "draft for unknown row ignored");
            ignored.push(edit.id.clone());
            continue;
        };

        row.cost = edit.new_cost;
        if recompute_budget_percentage {
            row.recompute_budget_percentage(reference_total);
        }
        changed.push(row.clone());
    }

    if !ignored.is_empty() {
        warn!(count = ignored.len(), "ignored drafts for rows no longer loaded");
    }

    MergeOutcome {
        items: merged,
        changed,
        ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<LineItem> {
        vec![
            LineItem::new("1", "Acme Electric", 500.0).with_budget_percentage(62.5),
            LineItem::new("2", "Beta Builders", 300.0).with_budget_percentage(37.5),
        ]
    }

    #[test]
    fn test_stage_replaces_same_row() {
        let mut acc = EditAccumulator::new();
        acc.stage(vec![DraftEdit::new("1", "600"), DraftEdit::new("2", "250")]);
        acc.stage(vec![DraftEdit::new("1", "650")]);

        assert_eq!(acc.len(), 2);
        assert_eq!(acc.draft_for("1").map(|d| d.cost.as_str()), Some("650"));

        acc.discard("2");
        assert_eq!(acc.len(), 1);

        acc.clear();
        assert!(acc.is_empty());
    }

    #[test]
    fn test_parse_cost_strict() {
        assert_eq!(parse_cost("1", "600", CostParsing::Strict), Ok(600.0));
        assert_eq!(parse_cost("1", " $1,250.75 ", CostParsing::Strict), Ok(1250.75));
        assert_eq!(parse_cost("1", "-$20", CostParsing::Strict), Ok(-20.0));

        let err = parse_cost("7", "abc", CostParsing::Strict).unwrap_err();
        assert_eq!(err.row_id, "7");
        assert_eq!(err.input, "abc");

        assert!(parse_cost("1", "", CostParsing::Strict).is_err());
        assert!(parse_cost("1", "NaN", CostParsing::Strict).is_err());
        assert!(parse_cost("1", "12abc", CostParsing::Strict).is_err());
    }

    #[test]
    fn test_parse_cost_lenient() {
        assert_eq!(parse_cost("1", "abc", CostParsing::Lenient), Ok(0.0));
        assert_eq!(parse_cost("1", "", CostParsing::Lenient), Ok(0.0));
        assert_eq!(parse_cost("1", "12.5abc", CostParsing::Lenient), Ok(12.5));
        assert_eq!(parse_cost("1", "$99", CostParsing::Lenient), Ok(99.0));
        assert_eq!(parse_cost("1", "-.5", CostParsing::Lenient), Ok(-0.5));
    }

    #[test]
    fn test_parse_cost_lenient_exponent() {
        assert_eq!(parse_cost("1", "1e3", CostParsing::Lenient), Ok(1000.0));
        assert_eq!(parse_cost("1", "2.5E-1x", CostParsing::Lenient), Ok(0.25));
        // A dangling exponent marker is not part of the number
        assert_eq!(parse_cost("1", "7e", CostParsing::Lenient), Ok(7.0));
        assert_eq!(parse_cost("1", "7e+", CostParsing::Lenient), Ok(7.0));
    }

    #[test]
    fn test_remove_saved_keeps_newer_drafts() {
        let mut acc = EditAccumulator::new();
        acc.stage(vec![DraftEdit::new("1", "600"), DraftEdit::new("2", "250")]);
        let saved = acc.drafts().to_vec();

        // Row 2 is re-edited and row 3 added after the save started
        acc.stage(vec![DraftEdit::new("2", "275"), DraftEdit::new("3", "10")]);
        acc.remove_saved(&saved);

        assert_eq!(
            acc.drafts(),
            &[DraftEdit::new("2", "275"), DraftEdit::new("3", "10")]
        );
        println!("✅ Drafts staged during a save survive it");
    }

    #[test]
    fn test_accumulator_parse_stops_on_bad_cell() {
        let mut acc = EditAccumulator::new();
        acc.stage(vec![DraftEdit::new("1", "600"), DraftEdit::new("2", "oops")]);

        assert!(acc.parse(CostParsing::Strict).is_err());

        let lenient = acc.parse(CostParsing::Lenient).unwrap();
        assert_eq!(lenient[1].new_cost, 0.0);
    }

    #[test]
    fn test_merge_preserves_ids_and_count() {
        let items = rows();
        let edits = vec![Edit {
            id: "1".to_string(),
            new_cost: 600.0,
        }];

        let outcome = merge_edits(&items, &edits, 800.0, false);

        assert_eq!(outcome.items.len(), items.len());
        let ids: Vec<_> = outcome.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        assert_eq!(outcome.items[0].cost, 600.0);
        assert_eq!(outcome.items[0].budget_percentage, 62.5);
        assert_eq!(outcome.items[1], items[1]);
        assert_eq!(outcome.changed_ids(), vec!["1".to_string()]);
    }

    #[test]
    fn test_merge_recomputes_percentage() {
        let edits = vec![Edit {
            id: "2".to_string(),
            new_cost: 200.0,
        }];

        let outcome = merge_edits(&rows(), &edits, 800.0, true);
        assert_eq!(outcome.items[1].budget_percentage, 25.0);
        assert_eq!(outcome.items[0].budget_percentage, 62.5);
    }

    #[test]
    fn test_merge_ignores_unknown_rows() {
        let edits = vec![
            Edit {
                id: "gone".to_string(),
                new_cost: 1.0,
            },
            Edit {
                id: "2".to_string(),
                new_cost: 310.0,
            },
        ];

        let outcome = merge_edits(&rows(), &edits, 800.0, false);
        assert_eq!(outcome.ignored, vec!["gone".to_string()]);
        assert_eq!(outcome.changed.len(), 1);
        assert_eq!(outcome.items.len(), 2);
    }
}
