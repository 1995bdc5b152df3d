//! Reference extraction from formula AST.
//!
//! Extracts all cell references from a bound expression as `CellId`s
//! for dependency graph construction.

use rustc_hash::FxHashSet;

use crate::cell_id::CellId;
use crate::named_range::{NamedRange, NamedRangeStore, NamedRangeTarget};
use crate::sheet::{SheetId, SheetRef};

use super::parser::{BoundExpr, Expr};

/// Extract all cell references from a bound expression.
///
/// Returns a deduplicated list of `CellId`s that the formula depends on.
///
/// # Known Limitations
///
/// - References to deleted sheets (`SheetRef::RefError`) contribute no
///   edges; the formula evaluates to #REF! regardless.
/// - A named range pointing at an unknown sheet is skipped; the evaluator
///   reports the error.
pub fn extract_cell_ids<F>(
    expr: &BoundExpr,
    context_sheet: SheetId,
    named_ranges: &NamedRangeStore,
    sheet_id_by_name: F,
) -> Vec<CellId>
where
    F: Fn(&str) -> Option<SheetId>,
{
    let mut refs = FxHashSet::default();
    collect_refs(expr, context_sheet, named_ranges, &sheet_id_by_name, &mut refs);
    refs.into_iter().collect()
}

fn collect_refs<F>(
    expr: &BoundExpr,
    context_sheet: SheetId,
    named_ranges: &NamedRangeStore,
    sheet_id_by_name: &F,
    refs: &mut FxHashSet<CellId>,
) where
    F: Fn(&str) -> Option<SheetId>,
{
    match expr {
        Expr::Number(_) | Expr::Text(_) | Expr::Boolean(_) | Expr::Empty | Expr::RefError => {
            // No dependencies
        }

        Expr::CellRef { sheet, row, col, .. } => {
            if let Some(sheet_id) = resolve_sheet_ref(sheet, context_sheet) {
                refs.insert(CellId::new(sheet_id, *row, *col));
            }
        }

        Expr::Range {
            sheet,
            start_row,
            start_col,
            end_row,
            end_col,
            ..
        } => {
            if let Some(sheet_id) = resolve_sheet_ref(sheet, context_sheet) {
                let (r1, r2) = (*start_row.min(end_row), *start_row.max(end_row));
                let (c1, c2) = (*start_col.min(end_col), *start_col.max(end_col));
                for row in r1..=r2 {
                    for col in c1..=c2 {
                        refs.insert(CellId::new(sheet_id, row, col));
                    }
                }
            }
        }

        Expr::NamedRange(name) => {
            if let Some(named_range) = named_ranges.get(name) {
                expand_named_range(named_range, sheet_id_by_name, refs);
            }
        }

        Expr::Function { args, .. } => {
            for arg in args {
                collect_refs(arg, context_sheet, named_ranges, sheet_id_by_name, refs);
            }
        }

        Expr::BinaryOp { left, right, .. } => {
            collect_refs(left, context_sheet, named_ranges, sheet_id_by_name, refs);
            collect_refs(right, context_sheet, named_ranges, sheet_id_by_name, refs);
        }
    }
}

fn resolve_sheet_ref(sheet_ref: &SheetRef, context_sheet: SheetId) -> Option<SheetId> {
    match sheet_ref {
        SheetRef::Current => Some(context_sheet),
        SheetRef::Id(id) => Some(*id),
        SheetRef::RefError { .. } => None,
    }
}

fn expand_named_range<F>(range: &NamedRange, sheet_id_by_name: &F, refs: &mut FxHashSet<CellId>)
where
    F: Fn(&str) -> Option<SheetId>,
{
    match &range.target {
        NamedRangeTarget::Cell { sheet, row, col } => {
            if let Some(sheet_id) = sheet_id_by_name(sheet) {
                refs.insert(CellId::new(sheet_id, *row, *col));
            }
        }
        NamedRangeTarget::Range { sheet, rect } => {
            if let Some(sheet_id) = sheet_id_by_name(sheet) {
                for row in rect.start_row..=rect.end_row {
                    for col in rect.start_col..=rect.end_col {
                        refs.insert(CellId::new(sheet_id, row, col));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::{bind_expr, parse};
    use tabula_core::GridRect;

    fn sheet(id: u64) -> SheetId {
        SheetId::from_raw(id)
    }

    fn cell(sheet_id: u64, row: usize, col: usize) -> CellId {
        CellId::new(sheet(sheet_id), row, col)
    }

    fn extract(formula: &str, store: &NamedRangeStore) -> Vec<CellId> {
        let parsed = parse(formula).unwrap();
        let bound = bind_expr(&parsed, |name| {
            if name.eq_ignore_ascii_case("Sheet2") {
                Some(sheet(2))
            } else {
                None
            }
        });
        extract_cell_ids(&bound, sheet(1), store, |name| {
            match name.to_lowercase().as_str() {
                "sheet1" => Some(sheet(1)),
                "sheet2" => Some(sheet(2)),
                _ => None,
            }
        })
    }

    #[test]
    fn test_same_sheet_ref() {
        let store = NamedRangeStore::new();
        let refs = extract("=A1", &store);
        assert_eq!(refs.len(), 1);
        assert!(refs.contains(&cell(1, 0, 0)));
    }

    #[test]
    fn test_cross_sheet_ref() {
        let store = NamedRangeStore::new();
        let refs = extract("=Sheet2!A1", &store);
        assert_eq!(refs.len(), 1);
        assert!(refs.contains(&cell(2, 0, 0)));
    }

    #[test]
    fn test_range_expansion() {
        let store = NamedRangeStore::new();
        let refs = extract("=SUM(A1:B2)", &store);
        assert_eq!(refs.len(), 4);
        assert!(refs.contains(&cell(1, 0, 0)));
        assert!(refs.contains(&cell(1, 0, 1)));
        assert!(refs.contains(&cell(1, 1, 0)));
        assert!(refs.contains(&cell(1, 1, 1)));
    }

    #[test]
    fn test_named_range_expansion() {
        let mut store = NamedRangeStore::new();
        store
            .set(NamedRange::range(
                "Revenue",
                "Sheet1",
                GridRect::new((0, 0), (9, 0)),
            ))
            .unwrap();

        let refs = extract("=SUM(Revenue)", &store);
        assert_eq!(refs.len(), 10);
        for row in 0..10 {
            assert!(refs.contains(&cell(1, row, 0)));
        }
    }

    #[test]
    fn test_duplicate_refs_deduped() {
        let store = NamedRangeStore::new();
        let refs = extract("=A1+A1+A1", &store);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_deleted_sheet_ref_skipped() {
        let store = NamedRangeStore::new();
        // "Missing" doesn't bind, so the ref contributes no edges
        let refs = extract("=Missing!A1+B1", &store);
        assert_eq!(refs.len(), 1);
        assert!(refs.contains(&cell(1, 0, 1)));
    }

    #[test]
    fn test_unknown_named_range_skipped() {
        let store = NamedRangeStore::new();
        let refs = extract("=UnknownName", &store);
        assert!(refs.is_empty());
    }

    #[test]
    fn test_ref_error_literal_no_edges() {
        let store = NamedRangeStore::new();
        let refs = extract("=#REF!+A1", &store);
        assert_eq!(refs.len(), 1);
    }

    #[test]
    fn test_mixed_function_and_operator_refs() {
        let store = NamedRangeStore::new();
        let refs = extract("=SUM(A1:A3)+Sheet2!B1*2", &store);
        assert_eq!(refs.len(), 4);
        assert!(refs.contains(&cell(1, 0, 0)));
        assert!(refs.contains(&cell(1, 1, 0)));
        assert!(refs.contains(&cell(1, 2, 0)));
        assert!(refs.contains(&cell(2, 0, 1)));
    }
}
