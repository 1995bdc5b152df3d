//! Recalculation reporting types.
//!
//! A recalculation pass returns a `RecalcReport` describing what was
//! recomputed; the document layer logs its one-line rendering.

use crate::cell_id::CellId;
use crate::formula::eval::CellError;

/// Report from one recalculation pass (incremental or full).
#[derive(Debug, Clone, Default)]
pub struct RecalcReport {
    /// Time taken for the pass in milliseconds.
    pub duration_ms: u64,

    /// Number of cells that were recomputed, in evaluation order.
    pub recomputed: Vec<CellId>,

    /// Maximum dependency depth encountered.
    /// A formula with no formula dependencies has depth 1;
    /// a formula depending on another formula has depth = max(precedent depths) + 1.
    pub max_depth: usize,

    /// True if cycles were detected. Cycle cells are marked #CYCLE!.
    pub had_cycles: bool,

    /// Number of cells participating in circular reference cycles.
    pub cycle_cells: usize,

    /// Cells whose evaluation produced an error value (truncated to first 100).
    pub errors: Vec<RecalcError>,
}

impl RecalcReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cells_recomputed(&self) -> usize {
        self.recomputed.len()
    }

    /// Format as a concise one-line summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} cells in {}ms, depth={}, cycles={}, errors={}",
            self.recomputed.len(),
            self.duration_ms,
            self.max_depth,
            self.cycle_cells,
            self.errors.len()
        )
    }

    /// Format as a one-line log entry.
    ///
    /// Format: `[recalc] 14ms  628 cells  depth=7  cycles=0  errors=0`
    pub fn log_line(&self) -> String {
        format!(
            "[recalc] {:>4}ms  {} cells  depth={}  cycles={}  errors={}",
            self.duration_ms,
            self.recomputed.len(),
            self.max_depth,
            self.cycle_cells,
            self.errors.len()
        )
    }
}

/// An error value produced while recomputing a specific cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecalcError {
    pub cell: CellId,
    pub error: CellError,
}

impl RecalcError {
    pub fn new(cell: CellId, error: CellError) -> Self {
        Self { cell, error }
    }
}

/// Report when cycle detection finds a circular reference.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Cells participating in the cycle. May be a subset for large cycles.
    pub cells: Vec<CellId>,

    /// Human-readable description of the cycle.
    pub message: String,
}

impl CycleReport {
    pub fn new(cells: Vec<CellId>, message: impl Into<String>) -> Self {
        Self {
            cells,
            message: message.into(),
        }
    }

    /// Report for a self-referencing cell.
    pub fn self_reference(cell: CellId) -> Self {
        Self {
            cells: vec![cell],
            message: format!("Cell {} references itself", cell),
        }
    }

    /// Report for a multi-cell cycle.
    pub fn cycle(cells: Vec<CellId>) -> Self {
        let cell_list: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        let message = if cells.len() <= 5 {
            format!("Circular reference: {}", cell_list.join(" -> "))
        } else {
            format!(
                "Circular reference involving {} cells: {} -> ... -> {}",
                cells.len(),
                cell_list[0],
                cell_list.last().unwrap()
            )
        };
        Self { cells, message }
    }
}

impl std::fmt::Display for CycleReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CycleReport {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::SheetId;

    fn cell(sheet: u64, row: usize, col: usize) -> CellId {
        CellId::new(SheetId::from_raw(sheet), row, col)
    }

    #[test]
    fn test_report_default() {
        let report = RecalcReport::default();
        assert_eq!(report.duration_ms, 0);
        assert_eq!(report.cells_recomputed(), 0);
        assert!(!report.had_cycles);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_report_log_line() {
        let report = RecalcReport {
            duration_ms: 14,
            recomputed: vec![cell(1, 0, 0); 628],
            max_depth: 7,
            had_cycles: false,
            cycle_cells: 0,
            errors: vec![],
        };
        assert_eq!(
            report.log_line(),
            "[recalc]   14ms  628 cells  depth=7  cycles=0  errors=0"
        );
    }

    #[test]
    fn test_report_summary_with_errors() {
        let report = RecalcReport {
            duration_ms: 5,
            recomputed: vec![cell(1, 0, 0)],
            max_depth: 1,
            had_cycles: true,
            cycle_cells: 2,
            errors: vec![RecalcError::new(cell(1, 0, 0), CellError::Div0)],
        };
        assert_eq!(report.summary(), "1 cells in 5ms, depth=1, cycles=2, errors=1");
    }

    #[test]
    fn test_cycle_report_self_reference() {
        let a1 = cell(1, 0, 0);
        let report = CycleReport::self_reference(a1);
        assert_eq!(report.cells.len(), 1);
        assert!(report.message.contains("references itself"));
    }

    #[test]
    fn test_cycle_report_small_cycle() {
        let cells = vec![cell(1, 0, 0), cell(1, 0, 1), cell(1, 0, 2)];
        let report = CycleReport::cycle(cells);
        assert!(report.message.contains("->"));
        assert!(!report.message.contains("..."));
    }

    #[test]
    fn test_cycle_report_large_cycle() {
        let cells: Vec<CellId> = (0..10).map(|i| cell(1, i, 0)).collect();
        let report = CycleReport::cycle(cells);
        assert!(report.message.contains("..."));
        assert!(report.message.contains("10 cells"));
    }
}
