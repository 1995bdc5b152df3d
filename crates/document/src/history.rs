//! Undo/Redo history for document operations.
//!
//! Each `UndoAction` captures, at commit time, exactly the state needed to
//! reverse the edit that already happened. The stacks are linear: a fresh
//! push clears the redo stack. While the history is locked, pushes are
//! ignored - the document locks it while applying an undo or redo so the
//! mutations performed by the reversal cannot append nested entries.

use tabula_core::GridRect;
use tabula_engine::cell::CellFormat;
use tabula_engine::named_range::NamedRange;
use tabula_engine::sheet::{ColFormat, RowFormat};

/// One cell's raw-text transition.
#[derive(Clone, Debug, PartialEq)]
pub struct CellChange {
    pub row: usize,
    pub col: usize,
    pub old_value: String,
    pub new_value: String,
}

/// One cell's format transition.
#[derive(Clone, Debug, PartialEq)]
pub struct FormatPatch {
    pub row: usize,
    pub col: usize,
    pub before: CellFormat,
    pub after: CellFormat,
}

/// Full snapshot of one cell (text + format) for restore-after-delete.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedCell {
    pub row: usize,
    pub col: usize,
    pub text: String,
    pub format: CellFormat,
}

/// A formula's pre-rewrite source text, anywhere in the workbook.
#[derive(Clone, Debug, PartialEq)]
pub struct CellTextSnapshot {
    pub sheet_index: usize,
    pub row: usize,
    pub col: usize,
    pub text: String,
}

#[derive(Clone, Debug)]
pub enum UndoAction {
    /// Raw-text edits, applied old->new. Undo replays old values in
    /// reverse order so same-cell sequences unwind correctly.
    Values {
        sheet_index: usize,
        changes: Vec<CellChange>,
    },
    /// Formatting over a set of cells.
    Format {
        sheet_index: usize,
        patches: Vec<FormatPatch>,
        description: String,
    },
    /// A rectangular range was cleared; captured cells restore it.
    RangeCleared {
        sheet_index: usize,
        cells: Vec<CapturedCell>,
    },
    RowsInserted {
        sheet_index: usize,
        at_row: usize,
        count: usize,
        /// Pre-edit sources of formulas the insert rewrote.
        rewrites: Vec<CellTextSnapshot>,
        /// Pre-insert rects of merged regions that spanned the insertion
        /// point (the inverse delete dissolves them; undo re-merges).
        spanned_merges: Vec<GridRect>,
    },
    RowsDeleted {
        sheet_index: usize,
        at_row: usize,
        count: usize,
        cells: Vec<CapturedCell>,
        row_formats: Vec<(usize, RowFormat)>,
        /// Merged regions dissolved by the delete.
        dissolved_merges: Vec<GridRect>,
        rewrites: Vec<CellTextSnapshot>,
    },
    ColsInserted {
        sheet_index: usize,
        at_col: usize,
        count: usize,
        rewrites: Vec<CellTextSnapshot>,
        spanned_merges: Vec<GridRect>,
    },
    ColsDeleted {
        sheet_index: usize,
        at_col: usize,
        count: usize,
        cells: Vec<CapturedCell>,
        col_formats: Vec<(usize, ColFormat)>,
        dissolved_merges: Vec<GridRect>,
        rewrites: Vec<CellTextSnapshot>,
    },
    /// A region was merged; captured cells restore discarded content.
    MergeSet {
        sheet_index: usize,
        rect: GridRect,
        overwritten: Vec<CapturedCell>,
    },
    /// A merged region was dissolved.
    MergeCleared {
        sheet_index: usize,
        rect: GridRect,
    },
    SheetAdded {
        sheet_index: usize,
        name: String,
    },
    SheetRenamed {
        sheet_index: usize,
        old_name: String,
        new_name: String,
    },
    /// A named range was defined, possibly replacing an earlier binding.
    NamedRangeSet {
        replaced: Option<NamedRange>,
        range: NamedRange,
    },
    NamedRangeDeleted {
        range: NamedRange,
    },
    /// Several actions committed as one user-visible step.
    /// Undone in reverse order.
    Group {
        actions: Vec<UndoAction>,
        description: String,
    },
}

impl UndoAction {
    /// Human-readable name for the Edit menu.
    pub fn description(&self) -> String {
        match self {
            UndoAction::Values { changes, .. } => {
                if changes.len() == 1 {
                    "Change cell".to_string()
                } else {
                    format!("Change {} cells", changes.len())
                }
            }
            UndoAction::Format { description, .. } => description.clone(),
            UndoAction::RangeCleared { cells, .. } => format!("Clear {} cell(s)", cells.len()),
            UndoAction::RowsInserted { count, .. } => format!("Insert {} row(s)", count),
            UndoAction::RowsDeleted { count, .. } => format!("Delete {} row(s)", count),
            UndoAction::ColsInserted { count, .. } => format!("Insert {} column(s)", count),
            UndoAction::ColsDeleted { count, .. } => format!("Delete {} column(s)", count),
            UndoAction::MergeSet { .. } => "Merge cells".to_string(),
            UndoAction::MergeCleared { .. } => "Unmerge cells".to_string(),
            UndoAction::SheetAdded { name, .. } => format!("Add sheet '{}'", name),
            UndoAction::SheetRenamed { new_name, .. } => format!("Rename sheet to '{}'", new_name),
            UndoAction::NamedRangeSet { range, .. } => format!("Define name '{}'", range.name),
            UndoAction::NamedRangeDeleted { range } => format!("Delete name '{}'", range.name),
            UndoAction::Group { description, .. } => description.clone(),
        }
    }
}

pub struct History {
    undo_stack: Vec<UndoAction>,
    redo_stack: Vec<UndoAction>,
    max_entries: usize,
    locked: bool,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            max_entries,
            locked: false,
        }
    }

    /// Record a committed action. A no-op while locked. Clears the redo
    /// stack: there is no redo after a fresh edit.
    pub fn push(&mut self, action: UndoAction) {
        if self.locked {
            return;
        }
        self.undo_stack.push(action);
        self.redo_stack.clear();

        if self.undo_stack.len() > self.max_entries {
            self.undo_stack.remove(0);
        }
    }

    /// Pop the most recent action for reversal, moving it to the redo stack.
    /// Returns None (not an error) when there is nothing to undo.
    pub fn undo(&mut self) -> Option<UndoAction> {
        let entry = self.undo_stack.pop()?;
        self.redo_stack.push(entry.clone());
        Some(entry)
    }

    /// Pop the most recently undone action for re-application.
    pub fn redo(&mut self) -> Option<UndoAction> {
        let entry = self.redo_stack.pop()?;
        self.undo_stack.push(entry.clone());
        Some(entry)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    /// Description of the next undo step, for the Edit menu.
    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.last().map(|a| a.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.last().map(|a| a.description())
    }

    /// Reentrancy guard: while locked, `push` is ignored. Used by the
    /// document while it applies an undo/redo so the reversal's own
    /// mutations do not generate nested entries.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(row: usize, old: &str, new: &str) -> UndoAction {
        UndoAction::Values {
            sheet_index: 0,
            changes: vec![CellChange {
                row,
                col: 0,
                old_value: old.to_string(),
                new_value: new.to_string(),
            }],
        }
    }

    #[test]
    fn test_push_clears_redo() {
        let mut history = History::new();
        history.push(change(0, "", "a"));
        history.push(change(1, "", "b"));
        assert!(history.undo().is_some());
        assert!(history.can_redo());

        history.push(change(2, "", "c"));
        assert!(!history.can_redo());
        assert_eq!(history.undo_len(), 2);
    }

    #[test]
    fn test_undo_redo_move_between_stacks() {
        let mut history = History::new();
        history.push(change(0, "", "a"));

        assert!(history.undo().is_some());
        assert!(!history.can_undo());
        assert!(history.can_redo());

        assert!(history.redo().is_some());
        assert!(history.can_undo());
        assert!(!history.can_redo());
    }

    #[test]
    fn test_empty_stacks_are_noops() {
        let mut history = History::new();
        assert!(history.undo().is_none());
        assert!(history.redo().is_none());
    }

    #[test]
    fn test_locked_push_ignored() {
        let mut history = History::new();
        history.lock();
        history.push(change(0, "", "a"));
        assert!(!history.can_undo());

        history.unlock();
        history.push(change(0, "", "a"));
        assert!(history.can_undo());
    }

    #[test]
    fn test_capacity_trims_oldest() {
        let mut history = History::with_capacity(2);
        history.push(change(0, "", "a"));
        history.push(change(1, "", "b"));
        history.push(change(2, "", "c"));
        assert_eq!(history.undo_len(), 2);

        // The oldest entry (row 0) was dropped
        match history.undo().unwrap() {
            UndoAction::Values { changes, .. } => assert_eq!(changes[0].row, 2),
            other => panic!("unexpected action {:?}", other.description()),
        }
    }

    #[test]
    fn test_descriptions() {
        let mut history = History::new();
        assert!(history.undo_description().is_none());
        history.push(change(0, "", "a"));
        assert_eq!(history.undo_description().unwrap(), "Change cell");
    }
}
