//! Reference rewriting for structural edits.
//!
//! When rows or columns are inserted or deleted, every formula that
//! references the edited sheet is rewritten so surviving references keep
//! pointing at the same logical cell. References wholly inside a deleted
//! span become `Expr::RefError` (#REF!) rather than silently renumbering.

use crate::sheet::UnboundSheetRef;

use super::parser::{Expr, ParsedExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Row,
    Col,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Insert,
    Delete,
}

/// One row/column insertion or deletion on a single sheet.
#[derive(Debug, Clone, Copy)]
pub struct ShiftOp {
    pub axis: Axis,
    pub kind: ShiftKind,
    /// First affected index. Insert places new rows/columns before it.
    pub at: usize,
    pub count: usize,
}

impl ShiftOp {
    pub fn insert_rows(at: usize, count: usize) -> Self {
        Self { axis: Axis::Row, kind: ShiftKind::Insert, at, count }
    }

    pub fn delete_rows(at: usize, count: usize) -> Self {
        Self { axis: Axis::Row, kind: ShiftKind::Delete, at, count }
    }

    pub fn insert_cols(at: usize, count: usize) -> Self {
        Self { axis: Axis::Col, kind: ShiftKind::Insert, at, count }
    }

    pub fn delete_cols(at: usize, count: usize) -> Self {
        Self { axis: Axis::Col, kind: ShiftKind::Delete, at, count }
    }

    /// Map a single index through this edit. `None` means deleted.
    pub fn map_point(&self, idx: usize) -> Option<usize> {
        match self.kind {
            ShiftKind::Insert => Some(if idx >= self.at { idx + self.count } else { idx }),
            ShiftKind::Delete => {
                if idx < self.at {
                    Some(idx)
                } else if idx < self.at + self.count {
                    None
                } else {
                    Some(idx - self.count)
                }
            }
        }
    }

    /// Map an inclusive span through this edit.
    ///
    /// A partially deleted span shrinks; a wholly deleted span is `None`.
    /// An insertion inside a span grows it.
    pub fn map_span(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        match self.kind {
            ShiftKind::Insert => {
                let s = if start >= self.at { start + self.count } else { start };
                let e = if end >= self.at { end + self.count } else { end };
                Some((s, e))
            }
            ShiftKind::Delete => {
                let del_end = self.at + self.count; // exclusive
                if start >= self.at && end < del_end {
                    return None;
                }
                let s = if start < self.at {
                    start
                } else if start < del_end {
                    self.at
                } else {
                    start - self.count
                };
                // Reaching the middle branch implies start < at, so at > 0.
                let e = if end < self.at {
                    end
                } else if end < del_end {
                    self.at - 1
                } else {
                    end - self.count
                };
                if s > e {
                    None
                } else {
                    Some((s, e))
                }
            }
        }
    }

    fn map_cell(&self, row: usize, col: usize) -> Option<(usize, usize)> {
        match self.axis {
            Axis::Row => self.map_point(row).map(|r| (r, col)),
            Axis::Col => self.map_point(col).map(|c| (row, c)),
        }
    }
}

/// Rewrite an AST for a structural edit.
///
/// `targets_sheet` decides whether a given sheet reference points at the
/// edited sheet (the caller knows the formula's own sheet for
/// `UnboundSheetRef::Current`). Returns the rewritten expression and whether
/// anything changed.
pub fn adjust_expr<F>(expr: &ParsedExpr, op: &ShiftOp, targets_sheet: F) -> (ParsedExpr, bool)
where
    F: Fn(&UnboundSheetRef) -> bool + Copy,
{
    match expr {
        Expr::Number(_) | Expr::Text(_) | Expr::Boolean(_) | Expr::Empty | Expr::RefError => {
            (expr.clone(), false)
        }
        Expr::NamedRange(_) => (expr.clone(), false),

        Expr::CellRef {
            sheet,
            col,
            row,
            col_abs,
            row_abs,
        } => {
            if !targets_sheet(sheet) {
                return (expr.clone(), false);
            }
            match op.map_cell(*row, *col) {
                Some((new_row, new_col)) => {
                    let changed = new_row != *row || new_col != *col;
                    (
                        Expr::CellRef {
                            sheet: sheet.clone(),
                            col: new_col,
                            row: new_row,
                            col_abs: *col_abs,
                            row_abs: *row_abs,
                        },
                        changed,
                    )
                }
                None => (Expr::RefError, true),
            }
        }

        Expr::Range {
            sheet,
            start_col,
            start_row,
            end_col,
            end_row,
            start_col_abs,
            start_row_abs,
            end_col_abs,
            end_row_abs,
        } => {
            if !targets_sheet(sheet) {
                return (expr.clone(), false);
            }
            let mapped = match op.axis {
                Axis::Row => op
                    .map_span(*start_row, *end_row)
                    .map(|(r1, r2)| (r1, *start_col, r2, *end_col)),
                Axis::Col => op
                    .map_span(*start_col, *end_col)
                    .map(|(c1, c2)| (*start_row, c1, *end_row, c2)),
            };
            match mapped {
                Some((r1, c1, r2, c2)) => {
                    let changed =
                        r1 != *start_row || c1 != *start_col || r2 != *end_row || c2 != *end_col;
                    (
                        Expr::Range {
                            sheet: sheet.clone(),
                            start_col: c1,
                            start_row: r1,
                            end_col: c2,
                            end_row: r2,
                            start_col_abs: *start_col_abs,
                            start_row_abs: *start_row_abs,
                            end_col_abs: *end_col_abs,
                            end_row_abs: *end_row_abs,
                        },
                        changed,
                    )
                }
                None => (Expr::RefError, true),
            }
        }

        Expr::Function { name, args } => {
            let mut changed = false;
            let new_args = args
                .iter()
                .map(|a| {
                    let (expr, c) = adjust_expr(a, op, targets_sheet);
                    changed |= c;
                    expr
                })
                .collect();
            (
                Expr::Function {
                    name: name.clone(),
                    args: new_args,
                },
                changed,
            )
        }

        Expr::BinaryOp { op: bin_op, left, right } => {
            let (new_left, c1) = adjust_expr(left, op, targets_sheet);
            let (new_right, c2) = adjust_expr(right, op, targets_sheet);
            (
                Expr::BinaryOp {
                    op: *bin_op,
                    left: Box::new(new_left),
                    right: Box::new(new_right),
                },
                c1 || c2,
            )
        }
    }
}

/// Rewrite sheet-name references after a sheet rename.
///
/// `old_key` is the normalized (lowercased, trimmed) old name.
pub fn rename_sheet_refs(
    expr: &ParsedExpr,
    old_key: &str,
    new_name: &str,
) -> (ParsedExpr, bool) {
    let rename = |sheet: &UnboundSheetRef| -> (UnboundSheetRef, bool) {
        match sheet {
            UnboundSheetRef::Named(n) if crate::sheet::normalize_sheet_name(n) == old_key => {
                (UnboundSheetRef::Named(new_name.to_string()), true)
            }
            other => (other.clone(), false),
        }
    };

    match expr {
        Expr::Number(_)
        | Expr::Text(_)
        | Expr::Boolean(_)
        | Expr::Empty
        | Expr::RefError
        | Expr::NamedRange(_) => (expr.clone(), false),

        Expr::CellRef {
            sheet,
            col,
            row,
            col_abs,
            row_abs,
        } => {
            let (new_sheet, changed) = rename(sheet);
            (
                Expr::CellRef {
                    sheet: new_sheet,
                    col: *col,
                    row: *row,
                    col_abs: *col_abs,
                    row_abs: *row_abs,
                },
                changed,
            )
        }

        Expr::Range {
            sheet,
            start_col,
            start_row,
            end_col,
            end_row,
            start_col_abs,
            start_row_abs,
            end_col_abs,
            end_row_abs,
        } => {
            let (new_sheet, changed) = rename(sheet);
            (
                Expr::Range {
                    sheet: new_sheet,
                    start_col: *start_col,
                    start_row: *start_row,
                    end_col: *end_col,
                    end_row: *end_row,
                    start_col_abs: *start_col_abs,
                    start_row_abs: *start_row_abs,
                    end_col_abs: *end_col_abs,
                    end_row_abs: *end_row_abs,
                },
                changed,
            )
        }

        Expr::Function { name, args } => {
            let mut changed = false;
            let new_args = args
                .iter()
                .map(|a| {
                    let (expr, c) = rename_sheet_refs(a, old_key, new_name);
                    changed |= c;
                    expr
                })
                .collect();
            (
                Expr::Function {
                    name: name.clone(),
                    args: new_args,
                },
                changed,
            )
        }

        Expr::BinaryOp { op, left, right } => {
            let (new_left, c1) = rename_sheet_refs(left, old_key, new_name);
            let (new_right, c2) = rename_sheet_refs(right, old_key, new_name);
            (
                Expr::BinaryOp {
                    op: *op,
                    left: Box::new(new_left),
                    right: Box::new(new_right),
                },
                c1 || c2,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::{parse, to_formula};

    fn adjust_src(src: &str, op: &ShiftOp) -> (String, bool) {
        let ast = parse(src).unwrap();
        let (adjusted, changed) = adjust_expr(&ast, op, |_| true);
        (to_formula(&adjusted), changed)
    }

    #[test]
    fn test_insert_rows_shifts_references_below() {
        // Insert one row above row 1 (index 0): A1 -> A2
        let (result, changed) = adjust_src("=A1", &ShiftOp::insert_rows(0, 1));
        assert!(changed);
        assert_eq!(result, "=A2");

        // A reference above the insertion point is untouched
        let (result, changed) = adjust_src("=A1", &ShiftOp::insert_rows(1, 1));
        assert!(!changed);
        assert_eq!(result, "=A1");
    }

    #[test]
    fn test_delete_rows_shifts_references_up() {
        // Delete row 1 (index 0): A3 -> A2
        let (result, changed) = adjust_src("=A3", &ShiftOp::delete_rows(0, 1));
        assert!(changed);
        assert_eq!(result, "=A2");
    }

    #[test]
    fn test_delete_referenced_row_becomes_ref_error() {
        let (result, changed) = adjust_src("=A1+1", &ShiftOp::delete_rows(0, 1));
        assert!(changed);
        assert_eq!(result, "=#REF!+1");
    }

    #[test]
    fn test_delete_referenced_column_becomes_ref_error() {
        let (result, changed) = adjust_src("=A1", &ShiftOp::delete_cols(0, 1));
        assert!(changed);
        assert_eq!(result, "=#REF!");
    }

    #[test]
    fn test_insert_cols_shifts_columns() {
        let (result, changed) = adjust_src("=B2*2", &ShiftOp::insert_cols(0, 2));
        assert!(changed);
        assert_eq!(result, "=D2*2");
    }

    #[test]
    fn test_range_shrinks_on_partial_delete() {
        // A1:A10, delete rows 5..7 (indices 4..6): range becomes A1:A8
        let (result, changed) = adjust_src("=SUM(A1:A10)", &ShiftOp::delete_rows(4, 2));
        assert!(changed);
        assert_eq!(result, "=SUM(A1:A8)");
    }

    #[test]
    fn test_range_wholly_deleted_becomes_ref_error() {
        let (result, changed) = adjust_src("=SUM(A2:A3)", &ShiftOp::delete_rows(1, 2));
        assert!(changed);
        assert_eq!(result, "=SUM(#REF!)");
    }

    #[test]
    fn test_range_grows_on_internal_insert() {
        // Insert a row inside A1:A3: range grows to A1:A4
        let (result, changed) = adjust_src("=SUM(A1:A3)", &ShiftOp::insert_rows(1, 1));
        assert!(changed);
        assert_eq!(result, "=SUM(A1:A4)");
    }

    #[test]
    fn test_other_sheet_untouched() {
        let ast = parse("=Other!A1").unwrap();
        let (adjusted, changed) = adjust_expr(&ast, &ShiftOp::delete_rows(0, 1), |sheet| {
            matches!(sheet, UnboundSheetRef::Current)
        });
        assert!(!changed);
        assert_eq!(to_formula(&adjusted), "=Other!A1");
    }

    #[test]
    fn test_absolute_refs_shift_like_relative() {
        // Insert/delete moves absolute references too; $ only pins fill/copy
        let (result, changed) = adjust_src("=$A$2", &ShiftOp::insert_rows(0, 1));
        assert!(changed);
        assert_eq!(result, "=$A$3");
    }

    #[test]
    fn test_map_span_edge_cases() {
        let op = ShiftOp::delete_rows(0, 2);
        assert_eq!(op.map_span(0, 1), None);
        assert_eq!(op.map_span(0, 4), Some((0, 2)));
        assert_eq!(op.map_span(2, 4), Some((0, 2)));

        let op = ShiftOp::delete_rows(3, 2);
        assert_eq!(op.map_span(0, 2), Some((0, 2)));
        assert_eq!(op.map_span(0, 3), Some((0, 2)));
        assert_eq!(op.map_span(5, 6), Some((3, 4)));
    }

    #[test]
    fn test_rename_sheet_refs() {
        let ast = parse("=Budget!A1+SUM(Budget!B1:B5)+Other!C1").unwrap();
        let (renamed, changed) = rename_sheet_refs(&ast, "budget", "Forecast");
        assert!(changed);
        assert_eq!(
            to_formula(&renamed),
            "=Forecast!A1+SUM(Forecast!B1:B5)+Other!C1"
        );
    }
}
