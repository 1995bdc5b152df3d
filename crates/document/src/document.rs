//! The document: one workbook, one undo history, document settings, and
//! the begin/end-operation batching contract.
//!
//! All edits enter through `apply(Command)`. Each command captures its
//! inverse state before mutating, applies the mutation through the
//! workbook, and records an `UndoAction`. Recalculation and change events
//! are deferred to the end of the outermost operation, so a gesture that
//! performs many writes (paste, fill) pays for one recalculation pass.

use thiserror::Error;

use tabula_core::{CommandSink, GridRect};
use tabula_engine::cell::CellFormat;
use tabula_engine::events::{
    CellsChangedEvent, EventCallback, PaintDirtyEvent, RecalcCompletedEvent, WorkbookEvent,
};
use tabula_engine::formula::adjust::{Axis, ShiftOp};
use tabula_engine::named_range::NamedRange;
use tabula_engine::recalc::RecalcReport;
use tabula_engine::workbook::{RewrittenFormula, Workbook};

use crate::history::{
    CapturedCell, CellChange, CellTextSnapshot, FormatPatch, History, UndoAction,
};
use crate::settings::{DocumentSettings, RecalcPolicy};

/// An edit submitted by a UI adapter or script.
#[derive(Debug, Clone)]
pub enum Command {
    SetText {
        sheet: usize,
        row: usize,
        col: usize,
        text: String,
    },
    SetFormat {
        sheet: usize,
        rect: GridRect,
        format: CellFormat,
    },
    ClearRange {
        sheet: usize,
        rect: GridRect,
    },
    InsertRows {
        sheet: usize,
        at: usize,
        count: usize,
    },
    DeleteRows {
        sheet: usize,
        at: usize,
        count: usize,
    },
    InsertCols {
        sheet: usize,
        at: usize,
        count: usize,
    },
    DeleteCols {
        sheet: usize,
        at: usize,
        count: usize,
    },
    MergeCells {
        sheet: usize,
        rect: GridRect,
    },
    UnmergeCells {
        sheet: usize,
        row: usize,
        col: usize,
    },
    AddSheet {
        name: Option<String>,
    },
    RenameSheet {
        sheet: usize,
        name: String,
    },
    DefineName {
        range: NamedRange,
    },
    DeleteName {
        name: String,
    },
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("end_operation called without a matching begin_operation")]
    UnbalancedOperation,
    #[error("no such sheet: {0}")]
    SheetNotFound(usize),
    #[error("sheet is protected")]
    ProtectedSheet,
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid region: {0}")]
    InvalidRegion(String),
}

pub struct Document {
    workbook: Workbook,
    history: History,
    settings: DocumentSettings,
    operation_depth: usize,
    observers: Vec<EventCallback>,
    modified: bool,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::from_parts(Workbook::new(), DocumentSettings::default())
    }

    /// Assemble a document from loaded state. Rebuilds the dependency graph
    /// and runs a full recalculation so every cache is settled before the
    /// document becomes visible.
    pub fn from_parts(mut workbook: Workbook, settings: DocumentSettings) -> Self {
        workbook.rebuild_dep_graph();
        let report = workbook.recalc_all();
        if !report.recomputed.is_empty() {
            tracing::debug!("{}", report.log_line());
        }
        // Load-time recalculation is not an edit
        for idx in 0..workbook.sheet_count() {
            if let Some(sheet) = workbook.sheet_mut(idx) {
                sheet.take_paint_dirty();
            }
        }
        Self {
            workbook,
            history: History::new(),
            settings,
            operation_depth: 0,
            observers: Vec::new(),
            modified: false,
        }
    }

    pub fn workbook(&self) -> &Workbook {
        &self.workbook
    }

    /// Direct mutable access for view-state concerns (row heights, column
    /// widths, protection) that bypass the undo history.
    pub fn workbook_mut(&mut self) -> &mut Workbook {
        &mut self.workbook
    }

    pub fn settings(&self) -> &DocumentSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut DocumentSettings {
        &mut self.settings
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn mark_saved(&mut self) {
        self.modified = false;
    }

    /// Register a change observer. Observers run at the end of the
    /// outermost operation; the document never calls into them mid-batch.
    pub fn add_observer(&mut self, callback: EventCallback) {
        self.observers.push(callback);
    }

    pub fn set_sheet_protected(&mut self, sheet: usize, protected: bool) -> Result<(), DocumentError> {
        let sheet = self
            .workbook
            .sheet_mut(sheet)
            .ok_or(DocumentError::SheetNotFound(sheet))?;
        sheet.protected = protected;
        Ok(())
    }

    // =========================================================================
    // Operation Batching
    // =========================================================================

    /// Open a batch. Calls nest; recalculation and change events are
    /// deferred until the outermost `end_operation`.
    pub fn begin_operation(&mut self) {
        self.operation_depth += 1;
    }

    /// Close a batch. Only the outermost call triggers the deferred
    /// recalculation pass and event delivery.
    pub fn end_operation(&mut self) -> Result<(), DocumentError> {
        if self.operation_depth == 0 {
            return Err(DocumentError::UnbalancedOperation);
        }
        self.end_operation_internal();
        Ok(())
    }

    fn end_operation_internal(&mut self) {
        self.operation_depth -= 1;
        if self.operation_depth == 0 {
            self.flush();
        }
    }

    /// Run the deferred work of a completed batch: recalculation (per
    /// policy), paint-dirty collection, and observer notification.
    fn flush(&mut self) {
        let report = match self.settings.recalc_policy {
            RecalcPolicy::Automatic => Some(self.workbook.recalc_dirty()),
            RecalcPolicy::Manual => None,
        };

        let mut events = Vec::new();
        for idx in 0..self.workbook.sheet_count() {
            let sheet = self.workbook.sheet_mut(idx).unwrap();
            let sheet_id = sheet.id;
            let regions = sheet.take_paint_dirty();
            if !regions.is_empty() {
                events.push(WorkbookEvent::PaintDirty(PaintDirtyEvent {
                    sheet: sheet_id,
                    regions,
                }));
            }
        }

        if let Some(report) = report {
            if !report.recomputed.is_empty() || report.had_cycles {
                tracing::debug!("{}", report.log_line());
            }
            if !report.recomputed.is_empty() {
                events.push(WorkbookEvent::CellsChanged(CellsChangedEvent {
                    cells: report.recomputed.clone(),
                }));
                events.push(WorkbookEvent::RecalcCompleted(RecalcCompletedEvent {
                    cells_recomputed: report.recomputed.len(),
                    had_cycles: report.had_cycles,
                }));
            }
        }

        for event in &events {
            for observer in self.observers.iter_mut() {
                observer(event);
            }
        }
    }

    /// Recalculate immediately. With `force`, every formula is recomputed;
    /// otherwise only the calc-dirty set.
    pub fn recalc(&mut self, force: bool) -> RecalcReport {
        let report = if force {
            self.workbook.recalc_all()
        } else {
            self.workbook.recalc_dirty()
        };
        if !report.recomputed.is_empty() || report.had_cycles {
            tracing::debug!("{}", report.log_line());
        }
        report
    }

    // =========================================================================
    // Command Application
    // =========================================================================

    /// Apply a command, recording its reversal in the undo history.
    pub fn apply(&mut self, cmd: Command) -> Result<(), DocumentError> {
        self.begin_operation();
        let result = self.apply_inner(cmd);
        self.end_operation_internal();
        if result.is_ok() {
            self.modified = true;
        }
        result
    }

    fn checked_sheet(&self, sheet: usize) -> Result<&tabula_engine::sheet::Sheet, DocumentError> {
        let s = self
            .workbook
            .sheet(sheet)
            .ok_or(DocumentError::SheetNotFound(sheet))?;
        if s.protected {
            return Err(DocumentError::ProtectedSheet);
        }
        Ok(s)
    }

    fn apply_inner(&mut self, cmd: Command) -> Result<(), DocumentError> {
        match cmd {
            Command::SetText {
                sheet, row, col, text,
            } => {
                let s = self.checked_sheet(sheet)?;
                if row >= s.rows || col >= s.cols {
                    return Err(DocumentError::InvalidRegion(format!(
                        "cell ({}, {}) out of bounds",
                        row, col
                    )));
                }
                // Writes to an obscured cell land on the anchor; capture there
                let (anchor_row, anchor_col) = s.anchor_of(row, col);
                let old_value = s.get_raw(anchor_row, anchor_col);
                let (row, col) = self
                    .workbook
                    .set_cell_text(sheet, row, col, &text)
                    .expect("sheet presence checked above");
                self.history.push(UndoAction::Values {
                    sheet_index: sheet,
                    changes: vec![CellChange {
                        row,
                        col,
                        old_value,
                        new_value: text,
                    }],
                });
                Ok(())
            }

            Command::SetFormat { sheet, rect, format } => {
                let s = self.checked_sheet(sheet)?;
                if rect.end_row >= s.rows || rect.end_col >= s.cols {
                    return Err(DocumentError::InvalidRegion(
                        "format region out of bounds".to_string(),
                    ));
                }
                let patches: Vec<FormatPatch> = rect
                    .iter_cells()
                    .map(|(row, col)| FormatPatch {
                        row,
                        col,
                        before: s.get_format(row, col),
                        after: format.clone(),
                    })
                    .collect();

                let s = self.workbook.sheet_mut(sheet).unwrap();
                for patch in &patches {
                    s.set_format(patch.row, patch.col, patch.after.clone());
                }
                self.history.push(UndoAction::Format {
                    sheet_index: sheet,
                    patches,
                    description: "Format cells".to_string(),
                });
                Ok(())
            }

            Command::ClearRange { sheet, rect } => {
                let s = self.checked_sheet(sheet)?;
                let mut cells = Vec::new();
                for (row, col) in s.cells_in_range(&rect) {
                    if s.is_obscured(row, col) {
                        continue;
                    }
                    cells.push(CapturedCell {
                        row,
                        col,
                        text: s.get_raw(row, col),
                        format: s.get_format(row, col),
                    });
                }
                let coords: Vec<(usize, usize)> = cells.iter().map(|c| (c.row, c.col)).collect();
                self.clear_cells(sheet, &coords);
                self.history.push(UndoAction::RangeCleared {
                    sheet_index: sheet,
                    cells,
                });
                Ok(())
            }

            Command::InsertRows { sheet, at, count } => {
                let s = self.checked_sheet(sheet)?;
                if count == 0 || at >= s.rows {
                    return Err(DocumentError::InvalidRegion("invalid row range".to_string()));
                }
                let spanned_merges: Vec<GridRect> = s
                    .merged_regions()
                    .into_iter()
                    .filter(|m| m.start_row < at && at <= m.end_row)
                    .collect();
                let rewrites = snapshots(self.workbook.insert_rows(sheet, at, count));
                self.history.push(UndoAction::RowsInserted {
                    sheet_index: sheet,
                    at_row: at,
                    count,
                    rewrites,
                    spanned_merges,
                });
                Ok(())
            }

            Command::DeleteRows { sheet, at, count } => {
                let s = self.checked_sheet(sheet)?;
                if count == 0 || at + count > s.rows {
                    return Err(DocumentError::InvalidRegion("invalid row range".to_string()));
                }
                let rect = GridRect::new((at, 0), (at + count - 1, s.cols - 1));
                let cells = capture_rect(s, &rect);
                let row_formats: Vec<_> = (at..at + count)
                    .filter_map(|r| s.row_format(r).map(|f| (r, f.clone())))
                    .collect();
                let dissolved_merges: Vec<GridRect> = s
                    .merged_regions()
                    .into_iter()
                    .filter(|m| m.intersects(&rect))
                    .collect();

                let rewrites =
                    snapshots(self.workbook.delete_rows(sheet, at, count));
                self.history.push(UndoAction::RowsDeleted {
                    sheet_index: sheet,
                    at_row: at,
                    count,
                    cells,
                    row_formats,
                    dissolved_merges,
                    rewrites,
                });
                Ok(())
            }

            Command::InsertCols { sheet, at, count } => {
                let s = self.checked_sheet(sheet)?;
                if count == 0 || at >= s.cols {
                    return Err(DocumentError::InvalidRegion(
                        "invalid column range".to_string(),
                    ));
                }
                let spanned_merges: Vec<GridRect> = s
                    .merged_regions()
                    .into_iter()
                    .filter(|m| m.start_col < at && at <= m.end_col)
                    .collect();
                let rewrites = snapshots(self.workbook.insert_cols(sheet, at, count));
                self.history.push(UndoAction::ColsInserted {
                    sheet_index: sheet,
                    at_col: at,
                    count,
                    rewrites,
                    spanned_merges,
                });
                Ok(())
            }

            Command::DeleteCols { sheet, at, count } => {
                let s = self.checked_sheet(sheet)?;
                if count == 0 || at + count > s.cols {
                    return Err(DocumentError::InvalidRegion(
                        "invalid column range".to_string(),
                    ));
                }
                let rect = GridRect::new((0, at), (s.rows - 1, at + count - 1));
                let cells = capture_rect(s, &rect);
                let col_formats: Vec<_> = (at..at + count)
                    .filter_map(|c| s.col_format(c).map(|f| (c, f.clone())))
                    .collect();
                let dissolved_merges: Vec<GridRect> = s
                    .merged_regions()
                    .into_iter()
                    .filter(|m| m.intersects(&rect))
                    .collect();

                let rewrites =
                    snapshots(self.workbook.delete_cols(sheet, at, count));
                self.history.push(UndoAction::ColsDeleted {
                    sheet_index: sheet,
                    at_col: at,
                    count,
                    cells,
                    col_formats,
                    dissolved_merges,
                    rewrites,
                });
                Ok(())
            }

            Command::MergeCells { sheet, rect } => {
                let s = self.checked_sheet(sheet)?;
                let anchor = rect.top_left();
                let overwritten: Vec<CapturedCell> = s
                    .cells_in_range(&rect)
                    .into_iter()
                    .filter(|pos| *pos != anchor)
                    .map(|(row, col)| CapturedCell {
                        row,
                        col,
                        text: s.get_raw(row, col),
                        format: s.get_format(row, col),
                    })
                    .collect();

                self.workbook
                    .merge_cells(sheet, &rect)
                    .map_err(DocumentError::InvalidRegion)?;
                self.history.push(UndoAction::MergeSet {
                    sheet_index: sheet,
                    rect,
                    overwritten,
                });
                Ok(())
            }

            Command::UnmergeCells { sheet, row, col } => {
                self.checked_sheet(sheet)?;
                if let Some(rect) = self.workbook.unmerge_cells(sheet, row, col) {
                    self.history.push(UndoAction::MergeCleared {
                        sheet_index: sheet,
                        rect,
                    });
                }
                Ok(())
            }

            Command::AddSheet { name } => {
                let idx = match &name {
                    Some(n) => self
                        .workbook
                        .add_sheet_named(n)
                        .ok_or_else(|| DocumentError::InvalidName(n.clone()))?,
                    None => self.workbook.add_sheet(),
                };
                let actual_name = self.workbook.sheet(idx).unwrap().name.clone();
                self.history.push(UndoAction::SheetAdded {
                    sheet_index: idx,
                    name: actual_name,
                });
                Ok(())
            }

            Command::RenameSheet { sheet, name } => {
                let old_name = self
                    .workbook
                    .sheet(sheet)
                    .ok_or(DocumentError::SheetNotFound(sheet))?
                    .name
                    .clone();
                if !self.workbook.rename_sheet(sheet, &name) {
                    return Err(DocumentError::InvalidName(name));
                }
                self.history.push(UndoAction::SheetRenamed {
                    sheet_index: sheet,
                    old_name,
                    new_name: name.trim().to_string(),
                });
                Ok(())
            }

            Command::DefineName { range } => {
                let replaced = self
                    .workbook
                    .define_name(range.clone())
                    .map_err(DocumentError::InvalidName)?;
                self.history.push(UndoAction::NamedRangeSet { replaced, range });
                Ok(())
            }

            Command::DeleteName { name } => {
                if let Some(removed) = self.workbook.delete_named_range(&name) {
                    self.history
                        .push(UndoAction::NamedRangeDeleted { range: removed });
                }
                Ok(())
            }
        }
    }

    /// Clear cells, preserving merge structure: the anchor of a merged
    /// region keeps the merge and only loses its content.
    fn clear_cells(&mut self, sheet: usize, coords: &[(usize, usize)]) {
        for &(row, col) in coords {
            let is_anchor = self
                .workbook
                .sheet(sheet)
                .map(|s| s.merge_span_at(row, col).is_some())
                .unwrap_or(false);
            if is_anchor {
                self.workbook.set_cell_text(sheet, row, col, "");
            } else {
                self.workbook.clear_cell(sheet, row, col);
            }
        }
    }

    // =========================================================================
    // Undo / Redo
    // =========================================================================

    /// Revert the most recent command. Returns false (a no-op, not an
    /// error) when the undo stack is empty.
    pub fn undo(&mut self) -> bool {
        let Some(action) = self.history.undo() else {
            return false;
        };
        tracing::debug!("undo: {}", action.description());
        self.history.lock();
        self.begin_operation();
        self.apply_undo_action(&action);
        self.end_operation_internal();
        self.history.unlock();
        self.modified = true;
        true
    }

    /// Re-apply the most recently undone command. Returns false when the
    /// redo stack is empty.
    pub fn redo(&mut self) -> bool {
        let Some(action) = self.history.redo() else {
            return false;
        };
        tracing::debug!("redo: {}", action.description());
        self.history.lock();
        self.begin_operation();
        self.apply_redo_action(&action);
        self.end_operation_internal();
        self.history.unlock();
        self.modified = true;
        true
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    fn apply_undo_action(&mut self, action: &UndoAction) {
        match action {
            UndoAction::Values { sheet_index, changes } => {
                // Reverse order so same-cell sequences unwind correctly
                for change in changes.iter().rev() {
                    self.workbook
                        .set_cell_text(*sheet_index, change.row, change.col, &change.old_value);
                }
            }

            UndoAction::Format { sheet_index, patches, .. } => {
                if let Some(sheet) = self.workbook.sheet_mut(*sheet_index) {
                    for patch in patches {
                        sheet.set_format(patch.row, patch.col, patch.before.clone());
                    }
                }
            }

            UndoAction::RangeCleared { sheet_index, cells } => {
                self.restore_cells(*sheet_index, cells);
            }

            UndoAction::RowsInserted {
                sheet_index,
                at_row,
                count,
                rewrites,
                spanned_merges,
            } => {
                self.workbook.delete_rows(*sheet_index, *at_row, *count);
                for rect in spanned_merges {
                    let _ = self.workbook.merge_cells(*sheet_index, rect);
                }
                self.restore_snapshots(rewrites, *sheet_index, &ShiftOp::delete_rows(*at_row, *count));
            }

            UndoAction::RowsDeleted {
                sheet_index,
                at_row,
                count,
                cells,
                row_formats,
                dissolved_merges,
                rewrites,
            } => {
                self.workbook.insert_rows(*sheet_index, *at_row, *count);
                self.restore_cells(*sheet_index, cells);
                if let Some(sheet) = self.workbook.sheet_mut(*sheet_index) {
                    for (row, format) in row_formats {
                        sheet.set_row_format(*row, format.clone());
                    }
                }
                for rect in dissolved_merges {
                    let _ = self.workbook.merge_cells(*sheet_index, rect);
                }
                self.restore_snapshots(rewrites, *sheet_index, &ShiftOp::insert_rows(*at_row, *count));
            }

            UndoAction::ColsInserted {
                sheet_index,
                at_col,
                count,
                rewrites,
                spanned_merges,
            } => {
                self.workbook.delete_cols(*sheet_index, *at_col, *count);
                for rect in spanned_merges {
                    let _ = self.workbook.merge_cells(*sheet_index, rect);
                }
                self.restore_snapshots(rewrites, *sheet_index, &ShiftOp::delete_cols(*at_col, *count));
            }

            UndoAction::ColsDeleted {
                sheet_index,
                at_col,
                count,
                cells,
                col_formats,
                dissolved_merges,
                rewrites,
            } => {
                self.workbook.insert_cols(*sheet_index, *at_col, *count);
                self.restore_cells(*sheet_index, cells);
                if let Some(sheet) = self.workbook.sheet_mut(*sheet_index) {
                    for (col, format) in col_formats {
                        sheet.set_col_format(*col, format.clone());
                    }
                }
                for rect in dissolved_merges {
                    let _ = self.workbook.merge_cells(*sheet_index, rect);
                }
                self.restore_snapshots(rewrites, *sheet_index, &ShiftOp::insert_cols(*at_col, *count));
            }

            UndoAction::MergeSet {
                sheet_index,
                rect,
                overwritten,
            } => {
                self.workbook
                    .unmerge_cells(*sheet_index, rect.start_row, rect.start_col);
                self.restore_cells(*sheet_index, overwritten);
            }

            UndoAction::MergeCleared { sheet_index, rect } => {
                let _ = self.workbook.merge_cells(*sheet_index, rect);
            }

            UndoAction::SheetAdded { sheet_index, .. } => {
                self.workbook.delete_sheet(*sheet_index);
            }

            UndoAction::SheetRenamed {
                sheet_index,
                old_name,
                ..
            } => {
                self.workbook.rename_sheet(*sheet_index, old_name);
            }

            UndoAction::NamedRangeSet { replaced, range } => {
                self.workbook.delete_named_range(&range.name);
                if let Some(previous) = replaced {
                    let _ = self.workbook.define_name(previous.clone());
                }
            }

            UndoAction::NamedRangeDeleted { range } => {
                let _ = self.workbook.define_name(range.clone());
            }

            UndoAction::Group { actions, .. } => {
                for action in actions.iter().rev() {
                    self.apply_undo_action(action);
                }
            }
        }
    }

    fn apply_redo_action(&mut self, action: &UndoAction) {
        match action {
            UndoAction::Values { sheet_index, changes } => {
                for change in changes {
                    self.workbook
                        .set_cell_text(*sheet_index, change.row, change.col, &change.new_value);
                }
            }

            UndoAction::Format { sheet_index, patches, .. } => {
                if let Some(sheet) = self.workbook.sheet_mut(*sheet_index) {
                    for patch in patches {
                        sheet.set_format(patch.row, patch.col, patch.after.clone());
                    }
                }
            }

            UndoAction::RangeCleared { sheet_index, cells } => {
                let coords: Vec<(usize, usize)> = cells.iter().map(|c| (c.row, c.col)).collect();
                self.clear_cells(*sheet_index, &coords);
            }

            UndoAction::RowsInserted {
                sheet_index,
                at_row,
                count,
                ..
            } => {
                self.workbook.insert_rows(*sheet_index, *at_row, *count);
            }

            UndoAction::RowsDeleted {
                sheet_index,
                at_row,
                count,
                ..
            } => {
                self.workbook.delete_rows(*sheet_index, *at_row, *count);
            }

            UndoAction::ColsInserted {
                sheet_index,
                at_col,
                count,
                ..
            } => {
                self.workbook.insert_cols(*sheet_index, *at_col, *count);
            }

            UndoAction::ColsDeleted {
                sheet_index,
                at_col,
                count,
                ..
            } => {
                self.workbook.delete_cols(*sheet_index, *at_col, *count);
            }

            UndoAction::MergeSet { sheet_index, rect, .. } => {
                let _ = self.workbook.merge_cells(*sheet_index, rect);
            }

            UndoAction::MergeCleared { sheet_index, rect } => {
                self.workbook
                    .unmerge_cells(*sheet_index, rect.start_row, rect.start_col);
            }

            UndoAction::SheetAdded { name, .. } => {
                let _ = self.workbook.add_sheet_named(name);
            }

            UndoAction::SheetRenamed {
                sheet_index,
                new_name,
                ..
            } => {
                self.workbook.rename_sheet(*sheet_index, new_name);
            }

            UndoAction::NamedRangeSet { range, .. } => {
                let _ = self.workbook.define_name(range.clone());
            }

            UndoAction::NamedRangeDeleted { range } => {
                self.workbook.delete_named_range(&range.name);
            }

            UndoAction::Group { actions, .. } => {
                for action in actions {
                    self.apply_redo_action(action);
                }
            }
        }
    }

    fn restore_cells(&mut self, sheet_index: usize, cells: &[CapturedCell]) {
        for cell in cells {
            self.workbook
                .set_cell_text(sheet_index, cell.row, cell.col, &cell.text);
            if let Some(sheet) = self.workbook.sheet_mut(sheet_index) {
                sheet.set_format(cell.row, cell.col, cell.format.clone());
            }
        }
    }

    /// Restore pre-edit formula sources after the structural inverse ran.
    ///
    /// Snapshot coordinates were recorded after the original edit; on the
    /// edited sheet they must be mapped through the inverse edit to find
    /// where those formulas sit now. Other sheets' coordinates are stable.
    fn restore_snapshots(
        &mut self,
        snapshots: &[CellTextSnapshot],
        edited_sheet: usize,
        inverse: &ShiftOp,
    ) {
        for snap in snapshots {
            let (mut row, mut col) = (snap.row, snap.col);
            if snap.sheet_index == edited_sheet {
                let mapped = match inverse.axis {
                    Axis::Row => inverse.map_point(row).map(|r| (r, col)),
                    Axis::Col => inverse.map_point(col).map(|c| (row, c)),
                };
                match mapped {
                    Some((r, c)) => {
                        row = r;
                        col = c;
                    }
                    None => continue,
                }
            }
            self.workbook
                .set_cell_text(snap.sheet_index, row, col, &snap.text);
        }
    }
}

/// Convert workbook rewrite records into history snapshots.
fn snapshots(rewrites: Vec<RewrittenFormula>) -> Vec<CellTextSnapshot> {
    rewrites
        .into_iter()
        .map(|r| CellTextSnapshot {
            sheet_index: r.sheet_index,
            row: r.row,
            col: r.col,
            text: r.old_source,
        })
        .collect()
}

/// Capture all non-obscured materialized cells in a rect.
fn capture_rect(sheet: &tabula_engine::sheet::Sheet, rect: &GridRect) -> Vec<CapturedCell> {
    sheet
        .cells_in_range(rect)
        .into_iter()
        .filter(|(row, col)| !sheet.is_obscured(*row, *col))
        .map(|(row, col)| CapturedCell {
            row,
            col,
            text: sheet.get_raw(row, col),
            format: sheet.get_format(row, col),
        })
        .collect()
}

impl CommandSink for Document {
    type Command = Command;
    type Error = DocumentError;

    fn submit(&mut self, cmd: Command) -> Result<(), DocumentError> {
        self.apply(cmd)
    }

    fn undo(&mut self) -> bool {
        Document::undo(self)
    }

    fn redo(&mut self) -> bool {
        Document::redo(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tabula_engine::formula::eval::{CellError, Value};

    fn set_text(doc: &mut Document, row: usize, col: usize, text: &str) {
        doc.apply(Command::SetText {
            sheet: 0,
            row,
            col,
            text: text.to_string(),
        })
        .unwrap();
    }

    fn value_at(doc: &Document, row: usize, col: usize) -> Value {
        doc.workbook().sheet(0).unwrap().computed_value(row, col)
    }

    fn raw_at(doc: &Document, row: usize, col: usize) -> String {
        doc.workbook().sheet(0).unwrap().get_raw(row, col)
    }

    #[test]
    fn test_set_text_recalculates_immediately() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "5");
        set_text(&mut doc, 1, 1, "=A1+1");
        assert_eq!(value_at(&doc, 1, 1), Value::Number(6.0));

        set_text(&mut doc, 0, 0, "10");
        assert_eq!(value_at(&doc, 1, 1), Value::Number(11.0));
    }

    #[test]
    fn test_undo_redo_single_edit() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "a");
        set_text(&mut doc, 0, 0, "b");

        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 0, 0), "a");
        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 0, 0), "");
        assert!(!doc.undo()); // stack empty: no-op

        assert!(doc.redo());
        assert_eq!(raw_at(&doc, 0, 0), "a");
        assert!(doc.redo());
        assert_eq!(raw_at(&doc, 0, 0), "b");
        assert!(!doc.redo());
    }

    #[test]
    fn test_undo_n_then_redo_n_restores_final_state() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "1");
        set_text(&mut doc, 0, 1, "=A1*2");
        set_text(&mut doc, 0, 0, "3");
        doc.apply(Command::InsertRows {
            sheet: 0,
            at: 0,
            count: 1,
        })
        .unwrap();

        let final_b = raw_at(&doc, 1, 1);
        assert_eq!(final_b, "=A2*2");
        assert_eq!(value_at(&doc, 1, 1), Value::Number(6.0));

        for _ in 0..4 {
            assert!(doc.undo());
        }
        assert_eq!(raw_at(&doc, 0, 0), "");
        assert_eq!(raw_at(&doc, 0, 1), "");

        for _ in 0..4 {
            assert!(doc.redo());
        }
        assert_eq!(raw_at(&doc, 1, 1), "=A2*2");
        assert_eq!(value_at(&doc, 1, 1), Value::Number(6.0));
    }

    #[test]
    fn test_fresh_edit_clears_redo() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "a");
        doc.undo();
        assert!(doc.can_redo());

        set_text(&mut doc, 0, 0, "z");
        assert!(!doc.can_redo());
    }

    #[test]
    fn test_undo_does_not_grow_history() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "a");
        let before = doc.history().undo_len();
        doc.undo();
        // Applying the undo must not append nested entries
        assert_eq!(doc.history().undo_len(), before - 1);
    }

    #[test]
    fn test_batching_defers_recalc() {
        let mut doc = Document::new();
        let recalcs = Arc::new(Mutex::new(0usize));
        let counter = recalcs.clone();
        doc.add_observer(Box::new(move |event| {
            if matches!(event, WorkbookEvent::RecalcCompleted(_)) {
                *counter.lock().unwrap() += 1;
            }
        }));

        doc.begin_operation();
        for row in 0..10 {
            set_text(&mut doc, row, 0, "1");
        }
        set_text(&mut doc, 0, 1, "=SUM(A1:A10)");
        doc.end_operation().unwrap();

        assert_eq!(*recalcs.lock().unwrap(), 1);
        assert_eq!(value_at(&doc, 0, 1), Value::Number(10.0));
    }

    #[test]
    fn test_nested_batching_only_outermost_flushes() {
        let mut doc = Document::new();
        let recalcs = Arc::new(Mutex::new(0usize));
        let counter = recalcs.clone();
        doc.add_observer(Box::new(move |event| {
            if matches!(event, WorkbookEvent::RecalcCompleted(_)) {
                *counter.lock().unwrap() += 1;
            }
        }));

        doc.begin_operation();
        doc.begin_operation();
        set_text(&mut doc, 0, 0, "1");
        doc.end_operation().unwrap();
        assert_eq!(*recalcs.lock().unwrap(), 0); // still inside the outer batch
        doc.end_operation().unwrap();
        assert_eq!(*recalcs.lock().unwrap(), 1);
    }

    #[test]
    fn test_unbalanced_end_operation_is_error() {
        let mut doc = Document::new();
        assert!(matches!(
            doc.end_operation(),
            Err(DocumentError::UnbalancedOperation)
        ));
    }

    #[test]
    fn test_paint_dirty_events_delivered() {
        let mut doc = Document::new();
        let regions = Arc::new(Mutex::new(Vec::new()));
        let sink = regions.clone();
        doc.add_observer(Box::new(move |event| {
            if let WorkbookEvent::PaintDirty(p) = event {
                sink.lock().unwrap().extend(p.regions.clone());
            }
        }));

        set_text(&mut doc, 2, 3, "x");
        let regions = regions.lock().unwrap();
        assert!(regions.iter().any(|r| r.contains(2, 3)));
    }

    #[test]
    fn test_manual_recalc_policy() {
        let mut doc = Document::new();
        doc.settings_mut().recalc_policy = RecalcPolicy::Manual;

        set_text(&mut doc, 0, 0, "5");
        set_text(&mut doc, 0, 1, "=A1");
        // No pass has run yet; the cache is stale
        assert_eq!(value_at(&doc, 0, 1), Value::Empty);

        doc.recalc(false);
        assert_eq!(value_at(&doc, 0, 1), Value::Number(5.0));
    }

    #[test]
    fn test_delete_rows_undo_restores_contents_and_heights() {
        let mut doc = Document::new();
        set_text(&mut doc, 2, 0, "keep");
        set_text(&mut doc, 3, 1, "=A3");
        {
            // Row height is part of the captured state
            doc.apply(Command::SetText {
                sheet: 0,
                row: 2,
                col: 2,
                text: "h".into(),
            })
            .unwrap();
        }
        doc.workbook.sheet_mut(0).unwrap().set_row_height(2, 44.0);

        doc.apply(Command::DeleteRows {
            sheet: 0,
            at: 2,
            count: 1,
        })
        .unwrap();
        assert_eq!(raw_at(&doc, 2, 0), "");
        assert_eq!(raw_at(&doc, 2, 1), "=#REF!");

        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 2, 0), "keep");
        assert_eq!(raw_at(&doc, 2, 2), "h");
        assert_eq!(raw_at(&doc, 3, 1), "=A3");
        assert_eq!(value_at(&doc, 3, 1), Value::Text("keep".to_string()));
        assert_eq!(doc.workbook().sheet(0).unwrap().row_height(2), 44.0);
    }

    #[test]
    fn test_delete_cols_ref_error_and_undo() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "5"); // A1
        set_text(&mut doc, 1, 1, "=A1"); // B2
        doc.apply(Command::DeleteCols {
            sheet: 0,
            at: 0,
            count: 1,
        })
        .unwrap();

        // B2 shifted to A2 with a dead reference
        assert_eq!(raw_at(&doc, 1, 0), "=#REF!");
        assert_eq!(value_at(&doc, 1, 0), Value::Error(CellError::Ref));

        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 0, 0), "5");
        assert_eq!(raw_at(&doc, 1, 1), "=A1");
        assert_eq!(value_at(&doc, 1, 1), Value::Number(5.0));
    }

    #[test]
    fn test_merge_undo_restores_overwritten_content() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "anchor");
        set_text(&mut doc, 0, 1, "victim");
        doc.apply(Command::MergeCells {
            sheet: 0,
            rect: GridRect::new((0, 0), (1, 1)),
        })
        .unwrap();
        assert_eq!(raw_at(&doc, 0, 1), "");

        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 0, 1), "victim");
        assert!(doc
            .workbook()
            .sheet(0)
            .unwrap()
            .merge_span_at(0, 0)
            .is_none());

        assert!(doc.redo());
        assert_eq!(raw_at(&doc, 0, 1), "");
        assert!(doc
            .workbook()
            .sheet(0)
            .unwrap()
            .merge_span_at(0, 0)
            .is_some());
    }

    #[test]
    fn test_write_to_obscured_cell_recorded_against_anchor() {
        let mut doc = Document::new();
        doc.apply(Command::MergeCells {
            sheet: 0,
            rect: GridRect::new((0, 0), (1, 1)),
        })
        .unwrap();

        // Write targeting the obscured corner lands on the anchor
        set_text(&mut doc, 1, 1, "42");
        assert_eq!(raw_at(&doc, 0, 0), "42");

        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 0, 0), "");
    }

    #[test]
    fn test_clear_range_undo() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "1");
        set_text(&mut doc, 1, 0, "2");
        set_text(&mut doc, 2, 0, "=A1+A2");

        doc.apply(Command::ClearRange {
            sheet: 0,
            rect: GridRect::new((0, 0), (1, 0)),
        })
        .unwrap();
        assert_eq!(value_at(&doc, 2, 0), Value::Number(0.0));

        assert!(doc.undo());
        assert_eq!(raw_at(&doc, 0, 0), "1");
        assert_eq!(raw_at(&doc, 1, 0), "2");
        assert_eq!(value_at(&doc, 2, 0), Value::Number(3.0));
    }

    #[test]
    fn test_named_range_commands_undo() {
        let mut doc = Document::new();
        set_text(&mut doc, 0, 0, "7");
        doc.apply(Command::DefineName {
            range: NamedRange::cell("Tax", "Sheet1", 0, 0),
        })
        .unwrap();
        set_text(&mut doc, 0, 1, "=Tax");
        assert_eq!(value_at(&doc, 0, 1), Value::Number(7.0));

        doc.apply(Command::DeleteName {
            name: "Tax".to_string(),
        })
        .unwrap();
        assert_eq!(value_at(&doc, 0, 1), Value::Error(CellError::Name));

        assert!(doc.undo()); // name restored
        assert_eq!(value_at(&doc, 0, 1), Value::Number(7.0));
    }

    #[test]
    fn test_sheet_commands() {
        let mut doc = Document::new();
        doc.apply(Command::AddSheet {
            name: Some("Data".to_string()),
        })
        .unwrap();
        assert_eq!(doc.workbook().sheet_count(), 2);

        doc.apply(Command::RenameSheet {
            sheet: 1,
            name: "Numbers".to_string(),
        })
        .unwrap();
        assert_eq!(doc.workbook().sheet(1).unwrap().name, "Numbers");

        assert!(doc.undo()); // rename back
        assert_eq!(doc.workbook().sheet(1).unwrap().name, "Data");
        assert!(doc.undo()); // remove the added sheet
        assert_eq!(doc.workbook().sheet_count(), 1);

        assert!(doc.redo());
        assert_eq!(doc.workbook().sheet_count(), 2);
    }

    #[test]
    fn test_protected_sheet_rejects_edits() {
        let mut doc = Document::new();
        doc.set_sheet_protected(0, true).unwrap();
        let result = doc.apply(Command::SetText {
            sheet: 0,
            row: 0,
            col: 0,
            text: "x".to_string(),
        });
        assert!(matches!(result, Err(DocumentError::ProtectedSheet)));
        assert!(!doc.can_undo());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let mut doc = Document::new();
        let rows = doc.workbook().sheet(0).unwrap().rows;
        let result = doc.apply(Command::SetText {
            sheet: 0,
            row: rows,
            col: 0,
            text: "x".to_string(),
        });
        assert!(matches!(result, Err(DocumentError::InvalidRegion(_))));
    }

    #[test]
    fn test_command_sink_trait_surface() {
        fn drive<S>(sink: &mut S)
        where
            S: CommandSink<Command = Command, Error = DocumentError>,
        {
            sink.submit(Command::SetText {
                sheet: 0,
                row: 0,
                col: 0,
                text: "via trait".to_string(),
            })
            .unwrap();
            assert!(sink.undo());
            assert!(sink.redo());
        }

        let mut doc = Document::new();
        drive(&mut doc);
        assert_eq!(raw_at(&doc, 0, 0), "via trait");
    }

    #[test]
    fn test_modified_flag() {
        let mut doc = Document::new();
        assert!(!doc.is_modified());
        set_text(&mut doc, 0, 0, "x");
        assert!(doc.is_modified());
        doc.mark_saved();
        assert!(!doc.is_modified());
        doc.undo();
        assert!(doc.is_modified());
    }
}
