//! Named range definitions and management
//!
//! Named ranges allow users to give meaningful names to cells or ranges,
//! making formulas more readable (e.g., =SUM(Revenue) instead of =SUM(A1:A100)).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tabula_core::GridRect;

use crate::cell_id::col_to_letters;
use crate::formula::adjust::{Axis, ShiftOp};
use crate::sheet::normalize_sheet_name;

/// A named range that maps a name to a cell reference or range
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedRange {
    /// The name (case-insensitive for lookups, but preserves original case)
    pub name: String,

    /// What the name refers to
    pub target: NamedRangeTarget,

    /// Optional description for documentation
    pub description: Option<String>,
}

/// The target of a named range - either a single cell or a rectangular range.
/// The sheet is identified by name; lookups normalize case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NamedRangeTarget {
    Cell {
        sheet: String,
        row: usize,
        col: usize,
    },
    Range {
        sheet: String,
        rect: GridRect,
    },
}

impl NamedRange {
    /// Create a new named range pointing to a single cell
    pub fn cell(
        name: impl Into<String>,
        sheet: impl Into<String>,
        row: usize,
        col: usize,
    ) -> Self {
        Self {
            name: name.into(),
            target: NamedRangeTarget::Cell {
                sheet: sheet.into(),
                row,
                col,
            },
            description: None,
        }
    }

    /// Create a new named range pointing to a range
    pub fn range(name: impl Into<String>, sheet: impl Into<String>, rect: GridRect) -> Self {
        Self {
            name: name.into(),
            target: NamedRangeTarget::Range {
                sheet: sheet.into(),
                rect,
            },
            description: None,
        }
    }

    /// Add a description to this named range
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The sheet this name lives on.
    pub fn sheet_name(&self) -> &str {
        match &self.target {
            NamedRangeTarget::Cell { sheet, .. } => sheet,
            NamedRangeTarget::Range { sheet, .. } => sheet,
        }
    }

    /// The target as a rect (a cell is a 1x1 rect).
    pub fn rect(&self) -> GridRect {
        match &self.target {
            NamedRangeTarget::Cell { row, col, .. } => GridRect::cell(*row, *col),
            NamedRangeTarget::Range { rect, .. } => *rect,
        }
    }

    /// Get the cell reference string (e.g., "A1" or "A1:B10")
    pub fn reference_string(&self) -> String {
        match &self.target {
            NamedRangeTarget::Cell { row, col, .. } => {
                format!("{}{}", col_to_letters(*col), row + 1)
            }
            NamedRangeTarget::Range { rect, .. } => {
                format!(
                    "{}{}:{}{}",
                    col_to_letters(rect.start_col),
                    rect.start_row + 1,
                    col_to_letters(rect.end_col),
                    rect.end_row + 1
                )
            }
        }
    }

    /// Check if this named range references the given cell
    pub fn references_cell(&self, sheet: &str, row: usize, col: usize) -> bool {
        if normalize_sheet_name(self.sheet_name()) != normalize_sheet_name(sheet) {
            return false;
        }
        self.rect().contains(row, col)
    }
}

/// Validate a named range identifier
/// Rules:
/// - Must start with letter or underscore
/// - Can contain letters, numbers, underscores, and dots (for namespaces)
/// - Cannot be a cell reference (A1, BC23) or a range (A1:B2)
/// - Cannot be a function name (SUM, IF)
/// - Cannot be a boolean or error literal (TRUE, FALSE, #REF!)
pub fn is_valid_name(name: &str) -> Result<(), String> {
    let name = name.trim();

    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }

    let first = name.chars().next().unwrap();

    if first.is_ascii_digit() {
        return Err("Name must start with a letter or underscore, not a digit".into());
    }

    if !first.is_alphabetic() && first != '_' {
        return Err("Name must start with a letter or underscore".into());
    }

    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return Err("Name can only contain letters, numbers, underscores, and dots".into());
    }

    if name.ends_with('.') {
        return Err("Name cannot end with a dot".into());
    }

    if name.contains("..") {
        return Err("Name cannot have consecutive dots".into());
    }

    let upper = name.to_uppercase();

    if looks_like_cell_ref(&upper) {
        return Err(format!(
            "'{}' looks like a cell reference (e.g., A1, BC23). Choose a different name.",
            name
        ));
    }

    if upper == "TRUE" || upper == "FALSE" {
        return Err(format!(
            "'{}' is a reserved boolean value. Choose a different name.",
            name
        ));
    }

    let error_literals = ["REF", "DIV", "NAME", "VALUE", "CYCLE"];
    if error_literals.iter().any(|e| upper == *e) {
        return Err(format!(
            "'{}' conflicts with an error value. Choose a different name.",
            name
        ));
    }

    if is_function_name(&upper) {
        return Err(format!(
            "'{}' is a function name. Choose a different name to avoid confusion.",
            name
        ));
    }

    Ok(())
}

/// Check if name matches a known worksheet function (case-insensitive)
fn is_function_name(upper_name: &str) -> bool {
    const FUNCTIONS: &[&str] = &[
        // Math & statistics
        "SUM", "PRODUCT", "AVERAGE", "COUNT", "COUNTA", "MIN", "MAX", "MEDIAN", "ABS", "SQRT",
        "INT", "ROUND", "POWER", "MOD",
        // Logical
        "IF", "AND", "OR", "NOT", "IFERROR", "ISBLANK",
        // Text
        "LEN", "UPPER", "LOWER", "TRIM", "LEFT", "RIGHT", "MID", "CONCATENATE", "EXACT",
        // Reference
        "ROW", "COLUMN",
    ];
    FUNCTIONS.contains(&upper_name)
}

/// True for strings shaped like A1 or BC23 (letters then digits).
fn looks_like_cell_ref(upper: &str) -> bool {
    let letters: String = upper.chars().take_while(|c| c.is_ascii_uppercase()).collect();
    if letters.is_empty() {
        return false;
    }
    let rest = &upper[letters.len()..];
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

/// Store for named ranges. Names are unique case-insensitively; setting an
/// existing name replaces it, so lookups always resolve to exactly one
/// target (the latest).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamedRangeStore {
    entries: HashMap<String, NamedRange>,
}

impl NamedRangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// Insert or replace a named range. Returns the replaced entry, if any.
    pub fn set(&mut self, range: NamedRange) -> Result<Option<NamedRange>, String> {
        is_valid_name(&range.name)?;
        Ok(self.entries.insert(Self::key(&range.name), range))
    }

    /// Look up by name, case-insensitive. Unknown names are `None`, never
    /// an error.
    pub fn get(&self, name: &str) -> Option<&NamedRange> {
        self.entries.get(&Self::key(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<NamedRange> {
        self.entries.remove(&Self::key(name))
    }

    pub fn rename(&mut self, old_name: &str, new_name: &str) -> Result<(), String> {
        is_valid_name(new_name)?;
        if self.get(new_name).is_some() && Self::key(old_name) != Self::key(new_name) {
            return Err(format!("Name '{}' is already defined", new_name));
        }
        match self.entries.remove(&Self::key(old_name)) {
            Some(mut range) => {
                range.name = new_name.trim().to_string();
                self.entries.insert(Self::key(new_name), range);
                Ok(())
            }
            None => Err(format!("Name '{}' is not defined", old_name)),
        }
    }

    pub fn set_description(&mut self, name: &str, description: Option<String>) -> bool {
        match self.entries.get_mut(&Self::key(name)) {
            Some(range) => {
                range.description = description;
                true
            }
            None => false,
        }
    }

    /// All entries, sorted by name for deterministic listings.
    pub fn list(&self) -> Vec<&NamedRange> {
        let mut entries: Vec<&NamedRange> = self.entries.values().collect();
        entries.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find all named ranges that cover a specific cell
    pub fn find_by_cell(&self, sheet: &str, row: usize, col: usize) -> Vec<&NamedRange> {
        self.list()
            .into_iter()
            .filter(|r| r.references_cell(sheet, row, col))
            .collect()
    }

    /// Remove every name targeting the given sheet (sheet deleted).
    /// Returns the removed entries.
    pub fn remove_sheet(&mut self, sheet: &str) -> Vec<NamedRange> {
        let sheet_key = normalize_sheet_name(sheet);
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, r)| normalize_sheet_name(r.sheet_name()) == sheet_key)
            .map(|(k, _)| k.clone())
            .collect();
        dead.into_iter()
            .filter_map(|k| self.entries.remove(&k))
            .collect()
    }

    /// Rewrite targets after a sheet rename.
    pub fn rename_sheet(&mut self, old_name: &str, new_name: &str) {
        let old_key = normalize_sheet_name(old_name);
        for range in self.entries.values_mut() {
            let sheet = match &mut range.target {
                NamedRangeTarget::Cell { sheet, .. } => sheet,
                NamedRangeTarget::Range { sheet, .. } => sheet,
            };
            if normalize_sheet_name(sheet) == old_key {
                *sheet = new_name.to_string();
            }
        }
    }

    /// Shift targets on the edited sheet through a row/column edit.
    /// Entries whose target is wholly deleted are dropped and returned.
    pub fn apply_shift(&mut self, sheet: &str, op: &ShiftOp) -> Vec<NamedRange> {
        let sheet_key = normalize_sheet_name(sheet);
        let mut dropped = Vec::new();
        let mut dead_keys = Vec::new();

        for (key, range) in self.entries.iter_mut() {
            if normalize_sheet_name(range.sheet_name()) != sheet_key {
                continue;
            }
            match &mut range.target {
                NamedRangeTarget::Cell { row, col, .. } => {
                    let mapped = match op.axis {
                        Axis::Row => op.map_point(*row).map(|r| (r, *col)),
                        Axis::Col => op.map_point(*col).map(|c| (*row, c)),
                    };
                    match mapped {
                        Some((r, c)) => {
                            *row = r;
                            *col = c;
                        }
                        None => dead_keys.push(key.clone()),
                    }
                }
                NamedRangeTarget::Range { rect, .. } => {
                    let mapped = match op.axis {
                        Axis::Row => op
                            .map_span(rect.start_row, rect.end_row)
                            .map(|(r1, r2)| GridRect {
                                start_row: r1,
                                start_col: rect.start_col,
                                end_row: r2,
                                end_col: rect.end_col,
                            }),
                        Axis::Col => op
                            .map_span(rect.start_col, rect.end_col)
                            .map(|(c1, c2)| GridRect {
                                start_row: rect.start_row,
                                start_col: c1,
                                end_row: rect.end_row,
                                end_col: c2,
                            }),
                    };
                    match mapped {
                        Some(new_rect) => *rect = new_rect,
                        None => dead_keys.push(key.clone()),
                    }
                }
            }
        }

        for key in dead_keys {
            if let Some(range) = self.entries.remove(&key) {
                dropped.push(range);
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("Revenue").is_ok());
        assert!(is_valid_name("_temp").is_ok());
        assert!(is_valid_name("ACME.Revenue").is_ok());
        assert!(is_valid_name("tax_rate_2024").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(is_valid_name("").is_err());
        assert!(is_valid_name("1st").is_err());
        assert!(is_valid_name("A1").is_err());
        assert!(is_valid_name("bc23").is_err());
        assert!(is_valid_name("TRUE").is_err());
        assert!(is_valid_name("SUM").is_err());
        assert!(is_valid_name("has space").is_err());
        assert!(is_valid_name("trailing.").is_err());
        assert!(is_valid_name("a..b").is_err());
    }

    #[test]
    fn test_set_and_get_case_insensitive() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("Revenue", "Sheet1", 0, 0)).unwrap();

        assert!(store.get("revenue").is_some());
        assert!(store.get("REVENUE").is_some());
        assert_eq!(store.get("revenue").unwrap().name, "Revenue");
        assert!(store.get("unknown").is_none());
    }

    #[test]
    fn test_set_replaces_existing() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("Revenue", "Sheet1", 0, 0)).unwrap();
        let old = store
            .set(NamedRange::cell("REVENUE", "Sheet1", 5, 5))
            .unwrap();

        assert!(old.is_some());
        assert_eq!(store.len(), 1);
        // Lookups return exactly one target: the latest
        assert_eq!(store.get("revenue").unwrap().rect(), GridRect::cell(5, 5));
    }

    #[test]
    fn test_rejects_invalid_name_on_set() {
        let mut store = NamedRangeStore::new();
        assert!(store.set(NamedRange::cell("A1", "Sheet1", 0, 0)).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_rename() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("Old", "Sheet1", 0, 0)).unwrap();
        store.set(NamedRange::cell("Taken", "Sheet1", 1, 1)).unwrap();

        assert!(store.rename("Old", "Taken").is_err());
        assert!(store.rename("Old", "New").is_ok());
        assert!(store.get("old").is_none());
        assert!(store.get("new").is_some());
        assert!(store.rename("missing", "X").is_err());
    }

    #[test]
    fn test_find_by_cell() {
        let mut store = NamedRangeStore::new();
        store
            .set(NamedRange::range(
                "Data",
                "Sheet1",
                GridRect::new((0, 0), (9, 1)),
            ))
            .unwrap();

        assert_eq!(store.find_by_cell("Sheet1", 5, 1).len(), 1);
        assert_eq!(store.find_by_cell("sheet1", 5, 1).len(), 1);
        assert!(store.find_by_cell("Sheet1", 10, 0).is_empty());
        assert!(store.find_by_cell("Sheet2", 5, 1).is_empty());
    }

    #[test]
    fn test_apply_shift_moves_targets() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("Mark", "Sheet1", 5, 0)).unwrap();

        let dropped = store.apply_shift("Sheet1", &ShiftOp::insert_rows(0, 2));
        assert!(dropped.is_empty());
        assert_eq!(store.get("Mark").unwrap().rect(), GridRect::cell(7, 0));
    }

    #[test]
    fn test_apply_shift_drops_deleted_targets() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("Doomed", "Sheet1", 3, 0)).unwrap();
        store.set(NamedRange::cell("Safe", "Other", 3, 0)).unwrap();

        let dropped = store.apply_shift("Sheet1", &ShiftOp::delete_rows(3, 1));
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, "Doomed");
        assert!(store.get("Doomed").is_none());
        // Same coordinates on another sheet are untouched
        assert_eq!(store.get("Safe").unwrap().rect(), GridRect::cell(3, 0));
    }

    #[test]
    fn test_remove_sheet_drops_names() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("A", "Gone", 0, 0)).unwrap();
        store.set(NamedRange::cell("B", "Stays", 0, 0)).unwrap();

        let removed = store.remove_sheet("gone");
        assert_eq!(removed.len(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("B").is_some());
    }

    #[test]
    fn test_rename_sheet_rewrites_targets() {
        let mut store = NamedRangeStore::new();
        store.set(NamedRange::cell("X", "Old", 0, 0)).unwrap();
        store.rename_sheet("old", "New");
        assert_eq!(store.get("X").unwrap().sheet_name(), "New");
    }

    #[test]
    fn test_reference_string() {
        let cell = NamedRange::cell("X", "Sheet1", 0, 0);
        assert_eq!(cell.reference_string(), "A1");

        let range = NamedRange::range("Y", "Sheet1", GridRect::new((0, 0), (9, 1)));
        assert_eq!(range.reference_string(), "A1:B10");
    }
}
