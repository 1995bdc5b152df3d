//! A single sheet: sparse cell grid, merges, row/column formats.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tabula_core::GridRect;

use crate::cell::{Cell, CellContent, CellFormat, MergeSpan};
use crate::formula::adjust::{Axis, ShiftKind, ShiftOp};
use crate::formula::eval::Value;

/// Documented grid maxima per sheet.
pub const MAX_ROWS: usize = 65_536;
pub const MAX_COLS: usize = 256;

pub const DEFAULT_ROW_HEIGHT: f32 = 20.0;
pub const DEFAULT_COL_WIDTH: f32 = 64.0;

/// Stable sheet identity. Monotonically assigned by the workbook,
/// never reused after deletion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SheetId(pub u64);

impl SheetId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Sheet reference as written in a formula, before binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnboundSheetRef {
    /// No prefix: the formula's own sheet.
    Current,
    /// `Name!A1` prefix; resolved case-insensitively at bind time.
    Named(String),
}

/// Sheet reference after binding names to stable IDs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SheetRef {
    Current,
    Id(SheetId),
    /// The named sheet no longer exists; evaluates to #REF!.
    RefError { last_known_name: String },
}

/// Case-insensitive lookup key for sheet names.
pub fn normalize_sheet_name(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn is_valid_sheet_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty() && !trimmed.contains('!') && !trimmed.contains('\'')
}

/// Text layout direction for the sheet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutDirection {
    #[default]
    LeftToRight,
    RightToLeft,
}

/// Per-row formatting, stored sparsely (only non-default rows).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFormat {
    pub height: f32,
    /// Default format applied to cells in this row that have none of their own.
    pub format: Option<CellFormat>,
}

impl Default for RowFormat {
    fn default() -> Self {
        Self {
            height: DEFAULT_ROW_HEIGHT,
            format: None,
        }
    }
}

/// Per-column formatting, stored sparsely (only non-default columns).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColFormat {
    pub width: f32,
    pub format: Option<CellFormat>,
}

impl Default for ColFormat {
    fn default() -> Self {
        Self {
            width: DEFAULT_COL_WIDTH,
            format: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sheet {
    pub id: SheetId,
    pub name: String,
    /// Normalized name for case-insensitive uniqueness checks.
    pub name_key: String,
    cells: FxHashMap<(usize, usize), Cell>,
    pub rows: usize,
    pub cols: usize,
    row_formats: FxHashMap<usize, RowFormat>,
    col_formats: FxHashMap<usize, ColFormat>,
    pub direction: LayoutDirection,
    pub protected: bool,
    /// Regions needing repaint; a hint for the rendering layer only.
    #[serde(skip)]
    paint_dirty: Vec<GridRect>,
}

impl Sheet {
    pub fn new(id: SheetId, rows: usize, cols: usize) -> Self {
        Self::new_with_name(id, rows, cols, "Sheet1")
    }

    pub fn new_with_name(id: SheetId, rows: usize, cols: usize, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            name_key: normalize_sheet_name(name),
            cells: FxHashMap::default(),
            rows,
            cols,
            row_formats: FxHashMap::default(),
            col_formats: FxHashMap::default(),
            direction: LayoutDirection::default(),
            protected: false,
            paint_dirty: Vec::new(),
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.trim().to_string();
        self.name_key = normalize_sheet_name(name);
    }

    // =========================================================================
    // Cell Access
    // =========================================================================

    /// The anchor position for a coordinate: the merge anchor if the cell is
    /// obscured, otherwise the coordinate itself.
    pub fn anchor_of(&self, row: usize, col: usize) -> (usize, usize) {
        self.cells
            .get(&(row, col))
            .and_then(|c| c.merged_into)
            .unwrap_or((row, col))
    }

    pub fn is_obscured(&self, row: usize, col: usize) -> bool {
        self.cells
            .get(&(row, col))
            .map(|c| c.is_obscured())
            .unwrap_or(false)
    }

    /// Set a cell's raw text. Writes to an obscured cell redirect to the
    /// region's anchor; the returned coordinate is where the write landed.
    ///
    /// Default cells are materialized on first write; a cell cleared back to
    /// its default state is dropped from the map again.
    pub fn set_text(&mut self, row: usize, col: usize, text: &str) -> (usize, usize) {
        let (row, col) = self.anchor_of(row, col);
        let cell = self.cells.entry((row, col)).or_insert_with(Cell::new);
        cell.set(text);
        if cell.is_default() {
            self.cells.remove(&(row, col));
        }
        self.mark_cell_paint_dirty(row, col);
        (row, col)
    }

    /// Remove a cell entirely (content and formatting).
    pub fn clear_cell(&mut self, row: usize, col: usize) {
        self.cells.remove(&(row, col));
        self.mark_cell_paint_dirty(row, col);
    }

    /// Raw text at the physical coordinate (no merge delegation).
    pub fn get_raw(&self, row: usize, col: usize) -> String {
        self.cells
            .get(&(row, col))
            .map(|c| c.content.raw_display())
            .unwrap_or_default()
    }

    /// Raw text as the user sees it: obscured cells show their anchor's text.
    pub fn text(&self, row: usize, col: usize) -> String {
        let (row, col) = self.anchor_of(row, col);
        self.get_raw(row, col)
    }

    /// A copy of the cell (default if not materialized).
    pub fn get_cell(&self, row: usize, col: usize) -> Cell {
        self.cells.get(&(row, col)).cloned().unwrap_or_default()
    }

    pub(crate) fn cell_ref(&self, row: usize, col: usize) -> Option<&Cell> {
        self.cells.get(&(row, col))
    }

    pub(crate) fn cell_mut(&mut self, row: usize, col: usize) -> &mut Cell {
        self.cells.entry((row, col)).or_insert_with(Cell::new)
    }

    /// The settled value at a physical coordinate: literals directly,
    /// formulas from the recalculation cache.
    pub fn computed_value(&self, row: usize, col: usize) -> Value {
        match self.cells.get(&(row, col)) {
            Some(cell) => match &cell.content {
                CellContent::Formula { .. } => cell.computed.clone(),
                other => other.literal_value(),
            },
            None => Value::Empty,
        }
    }

    /// Display text with number formatting applied; obscured cells delegate
    /// to their anchor.
    pub fn display(&self, row: usize, col: usize) -> String {
        let (row, col) = self.anchor_of(row, col);
        let Some(cell) = self.cells.get(&(row, col)) else {
            return String::new();
        };
        let value = match &cell.content {
            CellContent::Formula { .. } => cell.computed.clone(),
            other => other.literal_value(),
        };
        match value {
            Value::Number(n) => CellContent::format_number(n, &self.effective_format(row, col).number_format),
            other => other.to_text(),
        }
    }

    /// Iterate over all materialized cells.
    pub fn cells_iter(&self) -> impl Iterator<Item = (&(usize, usize), &Cell)> {
        self.cells.iter()
    }

    pub(crate) fn cells_iter_mut(&mut self) -> impl Iterator<Item = (&(usize, usize), &mut Cell)> {
        self.cells.iter_mut()
    }

    /// Coordinates of materialized cells within a rect.
    pub fn cells_in_range(&self, rect: &GridRect) -> Vec<(usize, usize)> {
        let mut found: Vec<(usize, usize)> = self
            .cells
            .keys()
            .filter(|(r, c)| rect.contains(*r, *c))
            .copied()
            .collect();
        found.sort();
        found
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    // =========================================================================
    // Formatting
    // =========================================================================

    /// The cell's own format (default if not materialized).
    pub fn get_format(&self, row: usize, col: usize) -> CellFormat {
        self.cells
            .get(&(row, col))
            .map(|c| c.format.clone())
            .unwrap_or_default()
    }

    pub fn set_format(&mut self, row: usize, col: usize, format: CellFormat) {
        let cell = self.cells.entry((row, col)).or_insert_with(Cell::new);
        cell.format = format;
        if cell.is_default() {
            self.cells.remove(&(row, col));
        }
        self.mark_cell_paint_dirty(row, col);
    }

    /// Layered format resolution: cell, then row default, then column
    /// default, then the sheet default.
    pub fn effective_format(&self, row: usize, col: usize) -> CellFormat {
        if let Some(cell) = self.cells.get(&(row, col)) {
            if cell.format != CellFormat::default() {
                return cell.format.clone();
            }
        }
        if let Some(rf) = self.row_formats.get(&row) {
            if let Some(format) = &rf.format {
                return format.clone();
            }
        }
        if let Some(cf) = self.col_formats.get(&col) {
            if let Some(format) = &cf.format {
                return format.clone();
            }
        }
        CellFormat::default()
    }

    pub fn row_format(&self, row: usize) -> Option<&RowFormat> {
        self.row_formats.get(&row)
    }

    pub fn set_row_format(&mut self, row: usize, format: RowFormat) {
        if format == RowFormat::default() {
            self.row_formats.remove(&row);
        } else {
            self.row_formats.insert(row, format);
        }
    }

    pub fn row_height(&self, row: usize) -> f32 {
        self.row_formats
            .get(&row)
            .map(|f| f.height)
            .unwrap_or(DEFAULT_ROW_HEIGHT)
    }

    pub fn set_row_height(&mut self, row: usize, height: f32) {
        let entry = self.row_formats.entry(row).or_default();
        entry.height = height;
    }

    pub fn col_format(&self, col: usize) -> Option<&ColFormat> {
        self.col_formats.get(&col)
    }

    pub fn set_col_format(&mut self, col: usize, format: ColFormat) {
        if format == ColFormat::default() {
            self.col_formats.remove(&col);
        } else {
            self.col_formats.insert(col, format);
        }
    }

    pub fn col_width(&self, col: usize) -> f32 {
        self.col_formats
            .get(&col)
            .map(|f| f.width)
            .unwrap_or(DEFAULT_COL_WIDTH)
    }

    pub fn set_col_width(&mut self, col: usize, width: f32) {
        let entry = self.col_formats.entry(col).or_default();
        entry.width = width;
    }

    /// All non-default row formats (unordered).
    pub fn row_formats_iter(&self) -> impl Iterator<Item = (usize, &RowFormat)> {
        self.row_formats.iter().map(|(idx, f)| (*idx, f))
    }

    /// All non-default column formats (unordered).
    pub fn col_formats_iter(&self) -> impl Iterator<Item = (usize, &ColFormat)> {
        self.col_formats.iter().map(|(idx, f)| (*idx, f))
    }

    // =========================================================================
    // Merged Regions
    // =========================================================================

    /// Merge a rect into one region anchored at its top-left cell.
    ///
    /// Content of non-anchor cells is discarded (the anchor is the sole
    /// holder of the region's content); capture it first if it must be
    /// restorable.
    pub fn merge_cells(&mut self, rect: &GridRect) -> Result<(), String> {
        if rect.is_single_cell() {
            return Err("A merged region needs at least two cells".to_string());
        }
        if rect.end_row >= self.rows || rect.end_col >= self.cols {
            return Err("Merge region exceeds sheet bounds".to_string());
        }
        for (row, col) in rect.iter_cells() {
            if let Some(cell) = self.cells.get(&(row, col)) {
                if cell.is_merge_anchor() || cell.is_obscured() {
                    return Err("Region overlaps an existing merged region".to_string());
                }
            }
        }

        let anchor = rect.top_left();
        for (row, col) in rect.iter_cells() {
            if (row, col) == anchor {
                let cell = self.cell_mut(row, col);
                cell.merge = Some(MergeSpan {
                    rows: rect.rows(),
                    cols: rect.cols(),
                });
            } else {
                let cell = self.cell_mut(row, col);
                cell.content = CellContent::Empty;
                cell.computed = Value::Empty;
                cell.calc_dirty = false;
                cell.merged_into = Some(anchor);
            }
        }
        self.set_region_paint_dirty(*rect);
        Ok(())
    }

    /// Dissolve the merged region covering the given cell.
    /// Returns the region's rect, or None if the cell is not merged.
    pub fn unmerge_cells(&mut self, row: usize, col: usize) -> Option<GridRect> {
        let (anchor_row, anchor_col) = self.anchor_of(row, col);
        let span = self.cells.get(&(anchor_row, anchor_col))?.merge?;
        let rect = GridRect::new(
            (anchor_row, anchor_col),
            (anchor_row + span.rows - 1, anchor_col + span.cols - 1),
        );

        for (r, c) in rect.iter_cells() {
            if let Some(cell) = self.cells.get_mut(&(r, c)) {
                cell.merge = None;
                cell.merged_into = None;
                if cell.is_default() {
                    self.cells.remove(&(r, c));
                }
            }
        }
        self.set_region_paint_dirty(rect);
        Some(rect)
    }

    /// The merged region covering a cell, if any.
    pub fn merge_span_at(&self, row: usize, col: usize) -> Option<GridRect> {
        let (anchor_row, anchor_col) = self.anchor_of(row, col);
        let span = self.cells.get(&(anchor_row, anchor_col))?.merge?;
        Some(GridRect::new(
            (anchor_row, anchor_col),
            (anchor_row + span.rows - 1, anchor_col + span.cols - 1),
        ))
    }

    /// All merged regions, sorted by anchor.
    pub fn merged_regions(&self) -> Vec<GridRect> {
        let mut regions: Vec<GridRect> = self
            .cells
            .iter()
            .filter_map(|((r, c), cell)| {
                cell.merge.map(|span| {
                    GridRect::new((*r, *c), (*r + span.rows - 1, *c + span.cols - 1))
                })
            })
            .collect();
        regions.sort_by_key(|r| (r.start_row, r.start_col));
        regions
    }

    // =========================================================================
    // Structural Edits
    // =========================================================================

    /// Insert rows at the specified position, shifting existing rows down.
    /// Merged regions spanning the insertion point grow.
    pub fn insert_rows(&mut self, at_row: usize, count: usize) {
        let op = ShiftOp::insert_rows(at_row, count);
        self.shift_cells(&op);
        self.shift_row_formats(&op);
        self.grow_merges_after_insert(&op);
        self.set_region_paint_dirty(GridRect::new((at_row, 0), (self.rows - 1, self.cols - 1)));
    }

    /// Delete rows at the specified position, shifting remaining rows up.
    /// Merged regions intersecting the deleted span are dissolved first.
    pub fn delete_rows(&mut self, start_row: usize, count: usize) {
        self.unmerge_intersecting(&GridRect::new(
            (start_row, 0),
            ((start_row + count - 1).min(self.rows - 1), self.cols - 1),
        ));
        let op = ShiftOp::delete_rows(start_row, count);
        self.shift_cells(&op);
        self.shift_row_formats(&op);
        self.set_region_paint_dirty(GridRect::new((start_row, 0), (self.rows - 1, self.cols - 1)));
    }

    /// Insert columns at the specified position, shifting existing columns right.
    pub fn insert_cols(&mut self, at_col: usize, count: usize) {
        let op = ShiftOp::insert_cols(at_col, count);
        self.shift_cells(&op);
        self.shift_col_formats(&op);
        self.grow_merges_after_insert(&op);
        self.set_region_paint_dirty(GridRect::new((0, at_col), (self.rows - 1, self.cols - 1)));
    }

    /// Delete columns at the specified position, shifting remaining columns left.
    pub fn delete_cols(&mut self, start_col: usize, count: usize) {
        self.unmerge_intersecting(&GridRect::new(
            (0, start_col),
            (self.rows - 1, (start_col + count - 1).min(self.cols - 1)),
        ));
        let op = ShiftOp::delete_cols(start_col, count);
        self.shift_cells(&op);
        self.shift_col_formats(&op);
        self.set_region_paint_dirty(GridRect::new((0, start_col), (self.rows - 1, self.cols - 1)));
    }

    fn shift_cells(&mut self, op: &ShiftOp) {
        let old = std::mem::take(&mut self.cells);
        for ((row, col), mut cell) in old {
            let mapped = match op.axis {
                Axis::Row => op.map_point(row).map(|r| (r, col)),
                Axis::Col => op.map_point(col).map(|c| (row, c)),
            };
            let Some((new_row, new_col)) = mapped else {
                continue; // deleted
            };
            if new_row >= self.rows || new_col >= self.cols {
                continue; // shifted off the grid
            }
            // Keep merge pointers in step with their (shifted) anchors
            if let Some((ar, ac)) = cell.merged_into {
                let mapped_anchor = match op.axis {
                    Axis::Row => op.map_point(ar).map(|r| (r, ac)),
                    Axis::Col => op.map_point(ac).map(|c| (ar, c)),
                };
                cell.merged_into = mapped_anchor;
                if cell.merged_into.is_none() {
                    continue; // anchor vanished; drop the obscured shell
                }
            }
            self.cells.insert((new_row, new_col), cell);
        }
    }

    fn shift_row_formats(&mut self, op: &ShiftOp) {
        let old = std::mem::take(&mut self.row_formats);
        for (row, format) in old {
            if let Some(new_row) = op.map_point(row) {
                if new_row < self.rows {
                    self.row_formats.insert(new_row, format);
                }
            }
        }
    }

    fn shift_col_formats(&mut self, op: &ShiftOp) {
        let old = std::mem::take(&mut self.col_formats);
        for (col, format) in old {
            if let Some(new_col) = op.map_point(col) {
                if new_col < self.cols {
                    self.col_formats.insert(new_col, format);
                }
            }
        }
    }

    /// After an insert, widen any merged region that spanned the insertion
    /// point and claim the fresh gap cells for it.
    fn grow_merges_after_insert(&mut self, op: &ShiftOp) {
        debug_assert_eq!(op.kind, ShiftKind::Insert);
        let anchors: Vec<((usize, usize), MergeSpan)> = self
            .cells
            .iter()
            .filter_map(|((r, c), cell)| cell.merge.map(|span| ((*r, *c), span)))
            .collect();

        for ((anchor_row, anchor_col), span) in anchors {
            let (start, extent) = match op.axis {
                Axis::Row => (anchor_row, span.rows),
                Axis::Col => (anchor_col, span.cols),
            };
            // Spans the insertion point when it starts before and ends at or
            // after it (the tail was shifted away, leaving a gap).
            if start < op.at && op.at <= start + extent - 1 {
                let grown = MergeSpan {
                    rows: span.rows + if op.axis == Axis::Row { op.count } else { 0 },
                    cols: span.cols + if op.axis == Axis::Col { op.count } else { 0 },
                };
                if let Some(cell) = self.cells.get_mut(&(anchor_row, anchor_col)) {
                    cell.merge = Some(grown);
                }
                let gap = match op.axis {
                    Axis::Row => GridRect::new(
                        (op.at, anchor_col),
                        (op.at + op.count - 1, anchor_col + span.cols - 1),
                    ),
                    Axis::Col => GridRect::new(
                        (anchor_row, op.at),
                        (anchor_row + span.rows - 1, op.at + op.count - 1),
                    ),
                };
                for (r, c) in gap.iter_cells() {
                    if r < self.rows && c < self.cols {
                        let cell = self.cell_mut(r, c);
                        cell.merged_into = Some((anchor_row, anchor_col));
                    }
                }
            }
        }
    }

    fn unmerge_intersecting(&mut self, rect: &GridRect) {
        let regions: Vec<GridRect> = self
            .merged_regions()
            .into_iter()
            .filter(|r| r.intersects(rect))
            .collect();
        for region in regions {
            self.unmerge_cells(region.start_row, region.start_col);
        }
    }

    // =========================================================================
    // Paint-dirty Regions
    // =========================================================================

    /// Record a region needing repaint. A hint for the (external) rendering
    /// layer; carries no computational effect.
    pub fn set_region_paint_dirty(&mut self, rect: GridRect) {
        if self.paint_dirty.iter().any(|r| r.contains(rect.start_row, rect.start_col)
            && r.contains(rect.end_row, rect.end_col))
        {
            return;
        }
        self.paint_dirty.push(rect);
    }

    fn mark_cell_paint_dirty(&mut self, row: usize, col: usize) {
        let rect = self
            .merge_span_at(row, col)
            .unwrap_or_else(|| GridRect::cell(row, col));
        self.set_region_paint_dirty(rect);
    }

    /// Drain accumulated paint-dirty regions.
    pub fn take_paint_dirty(&mut self) -> Vec<GridRect> {
        std::mem::take(&mut self.paint_dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet() -> Sheet {
        Sheet::new(SheetId(1), 100, 26)
    }

    #[test]
    fn test_sparse_materialization() {
        let mut s = sheet();
        assert_eq!(s.cell_count(), 0);

        // Reads never materialize
        assert_eq!(s.get_raw(5, 5), "");
        assert_eq!(s.get_cell(5, 5), Cell::default());
        assert_eq!(s.cell_count(), 0);

        // Writes materialize
        s.set_text(5, 5, "hello");
        assert_eq!(s.cell_count(), 1);
        assert_eq!(s.get_raw(5, 5), "hello");

        // Clearing back to default drops the cell
        s.set_text(5, 5, "");
        assert_eq!(s.cell_count(), 0);
    }

    #[test]
    fn test_clear_to_empty_keeps_formatted_cell() {
        let mut s = sheet();
        s.set_text(0, 0, "x");
        let mut format = CellFormat::default();
        format.bold = true;
        s.set_format(0, 0, format);

        s.set_text(0, 0, "");
        // Format is persistent state, so the cell survives
        assert_eq!(s.cell_count(), 1);
        assert!(s.get_format(0, 0).bold);
    }

    #[test]
    fn test_merge_redirects_writes_to_anchor() {
        let mut s = sheet();
        let rect = GridRect::new((0, 0), (1, 1));
        s.merge_cells(&rect).unwrap();

        // Write to a non-anchor cell lands on the anchor
        let landed = s.set_text(1, 1, "42");
        assert_eq!(landed, (0, 0));
        assert_eq!(s.get_raw(0, 0), "42");
        assert_eq!(s.get_raw(1, 1), "");

        // The anchor's text is the sole source of truth for the region
        assert_eq!(s.text(1, 1), "42");
        assert_eq!(s.text(0, 1), "42");
    }

    #[test]
    fn test_merge_discards_obscured_content() {
        let mut s = sheet();
        s.set_text(0, 0, "anchor");
        s.set_text(0, 1, "doomed");
        s.merge_cells(&GridRect::new((0, 0), (0, 1))).unwrap();

        assert_eq!(s.get_raw(0, 0), "anchor");
        assert_eq!(s.get_raw(0, 1), "");
        assert!(s.is_obscured(0, 1));
        assert!(!s.is_obscured(0, 0));
    }

    #[test]
    fn test_merge_rejects_overlap_and_single_cell() {
        let mut s = sheet();
        s.merge_cells(&GridRect::new((0, 0), (1, 1))).unwrap();

        assert!(s.merge_cells(&GridRect::new((1, 1), (2, 2))).is_err());
        assert!(s.merge_cells(&GridRect::cell(5, 5)).is_err());
    }

    #[test]
    fn test_unmerge() {
        let mut s = sheet();
        let rect = GridRect::new((2, 2), (3, 4));
        s.merge_cells(&rect).unwrap();
        s.set_text(2, 2, "kept");

        // Unmerge via a non-anchor member
        let dissolved = s.unmerge_cells(3, 4).unwrap();
        assert_eq!(dissolved, rect);
        assert!(!s.is_obscured(3, 4));
        assert!(s.merge_span_at(2, 2).is_none());
        assert_eq!(s.get_raw(2, 2), "kept");

        assert!(s.unmerge_cells(9, 9).is_none());
    }

    #[test]
    fn test_insert_rows_shifts_cells() {
        let mut s = sheet();
        s.set_text(0, 0, "top");
        s.set_text(5, 0, "mid");

        s.insert_rows(1, 2);

        assert_eq!(s.get_raw(0, 0), "top");
        assert_eq!(s.get_raw(5, 0), "");
        assert_eq!(s.get_raw(7, 0), "mid");
    }

    #[test]
    fn test_delete_rows_shifts_cells_up() {
        let mut s = sheet();
        s.set_text(0, 0, "top");
        s.set_text(2, 0, "doomed");
        s.set_text(5, 0, "tail");

        s.delete_rows(2, 1);

        assert_eq!(s.get_raw(0, 0), "top");
        assert_eq!(s.get_raw(4, 0), "tail");
        // The deleted row's cell is gone entirely
        assert!(!s.cells_iter().any(|(_, c)| c.content.raw_display() == "doomed"));
    }

    #[test]
    fn test_insert_delete_cols() {
        let mut s = sheet();
        s.set_text(0, 0, "a");
        s.set_text(0, 3, "b");

        s.insert_cols(1, 1);
        assert_eq!(s.get_raw(0, 0), "a");
        assert_eq!(s.get_raw(0, 4), "b");

        s.delete_cols(1, 1);
        assert_eq!(s.get_raw(0, 3), "b");
    }

    #[test]
    fn test_row_formats_shift_with_rows() {
        let mut s = sheet();
        s.set_row_height(3, 40.0);

        s.insert_rows(0, 2);
        assert_eq!(s.row_height(5), 40.0);
        assert_eq!(s.row_height(3), DEFAULT_ROW_HEIGHT);

        s.delete_rows(0, 2);
        assert_eq!(s.row_height(3), 40.0);
    }

    #[test]
    fn test_col_formats_shift_with_cols() {
        let mut s = sheet();
        s.set_col_width(2, 120.0);

        s.insert_cols(0, 1);
        assert_eq!(s.col_width(3), 120.0);

        s.delete_cols(0, 1);
        assert_eq!(s.col_width(2), 120.0);
    }

    #[test]
    fn test_merge_shifts_whole_on_insert_above() {
        let mut s = sheet();
        s.merge_cells(&GridRect::new((3, 0), (4, 1))).unwrap();
        s.set_text(3, 0, "m");

        s.insert_rows(0, 2);

        assert_eq!(s.merge_span_at(5, 0), Some(GridRect::new((5, 0), (6, 1))));
        assert_eq!(s.text(6, 1), "m");
    }

    #[test]
    fn test_merge_grows_on_internal_insert() {
        let mut s = sheet();
        s.merge_cells(&GridRect::new((0, 0), (2, 0))).unwrap();

        s.insert_rows(1, 1);

        // Region now covers 4 rows, gap row included
        assert_eq!(s.merge_span_at(0, 0), Some(GridRect::new((0, 0), (3, 0))));
        assert!(s.is_obscured(1, 0));
        assert!(s.is_obscured(3, 0));
    }

    #[test]
    fn test_merge_dissolved_by_intersecting_delete() {
        let mut s = sheet();
        s.merge_cells(&GridRect::new((2, 0), (4, 0))).unwrap();
        s.set_text(2, 0, "m");

        s.delete_rows(3, 1);

        // The region was dissolved; remaining cells are plain
        assert!(s.merge_span_at(2, 0).is_none());
        assert!(!s.is_obscured(3, 0));
        assert_eq!(s.get_raw(2, 0), "m");
    }

    #[test]
    fn test_effective_format_layering() {
        let mut s = sheet();
        let mut row_fmt = CellFormat::default();
        row_fmt.italic = true;
        s.set_row_format(
            1,
            RowFormat {
                height: DEFAULT_ROW_HEIGHT,
                format: Some(row_fmt),
            },
        );
        let mut col_fmt = CellFormat::default();
        col_fmt.bold = true;
        s.set_col_format(
            2,
            ColFormat {
                width: DEFAULT_COL_WIDTH,
                format: Some(col_fmt),
            },
        );

        // Row default wins over column default
        assert!(s.effective_format(1, 2).italic);
        assert!(!s.effective_format(1, 2).bold);
        // Column default applies where the row has none
        assert!(s.effective_format(0, 2).bold);
        // Cell's own format wins over both
        let mut own = CellFormat::default();
        own.underline = true;
        s.set_format(1, 2, own);
        assert!(s.effective_format(1, 2).underline);
        assert!(!s.effective_format(1, 2).italic);
    }

    #[test]
    fn test_paint_dirty_accumulates_and_drains() {
        let mut s = sheet();
        s.set_text(0, 0, "x");
        s.set_region_paint_dirty(GridRect::new((5, 5), (6, 6)));

        let regions = s.take_paint_dirty();
        assert_eq!(regions.len(), 2);
        assert!(s.take_paint_dirty().is_empty());
    }

    #[test]
    fn test_display_uses_number_format() {
        let mut s = sheet();
        s.set_text(0, 0, "0.5");
        let mut format = CellFormat::default();
        format.number_format = crate::cell::NumberFormat::Percent { decimals: 0 };
        s.set_format(0, 0, format);

        assert_eq!(s.display(0, 0), "50%");
    }
}
