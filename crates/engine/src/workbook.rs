//! The workbook: an ordered collection of sheets plus the dependency graph
//! and the dirty-set recalculation machinery.
//!
//! Insertion order of sheets is significant - it is the tab order. Sheet
//! names are unique case-insensitively; sheet IDs are stable and never
//! reused.

use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tabula_core::GridRect;

use crate::cell::CellContent;
use crate::cell_id::CellId;
use crate::dep_graph::DepGraph;
use crate::formula::adjust::{self, ShiftOp};
use crate::formula::eval::{self, CellError, CellLookup, NamedRangeResolution, Value};
use crate::formula::parser::{bind_expr, parse, to_formula, ParsedExpr};
use crate::formula::refs::extract_cell_ids;
use crate::named_range::{NamedRange, NamedRangeStore, NamedRangeTarget};
use crate::recalc::{CycleReport, RecalcError, RecalcReport};
use crate::sheet::{
    is_valid_sheet_name, normalize_sheet_name, Sheet, SheetId, UnboundSheetRef, MAX_COLS, MAX_ROWS,
};

/// A formula whose source was rewritten by a structural edit.
/// Coordinates are post-edit; `old_source` allows exact undo.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenFormula {
    pub sheet_index: usize,
    pub row: usize,
    pub col: usize,
    pub old_source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workbook {
    sheets: Vec<Sheet>,
    active_sheet: usize,
    /// Next ID to assign to a new sheet. Monotonically increasing, never reused.
    #[serde(default = "default_next_sheet_id")]
    next_sheet_id: u64,
    #[serde(default)]
    named_ranges: NamedRangeStore,

    /// Dependency graph for formula cells.
    /// Rebuilt on load, updated incrementally on cell changes.
    #[serde(skip)]
    dep_graph: DepGraph,

    /// Cells whose cached value is stale; drained by the next recalc pass.
    #[serde(skip)]
    dirty: FxHashSet<CellId>,
}

fn default_next_sheet_id() -> u64 {
    1
}

impl Default for Workbook {
    fn default() -> Self {
        Self::new()
    }
}

impl Workbook {
    /// Create a new workbook with one default sheet
    pub fn new() -> Self {
        let sheet = Sheet::new(SheetId(1), MAX_ROWS, MAX_COLS);
        Self {
            sheets: vec![sheet],
            active_sheet: 0,
            next_sheet_id: 2,
            named_ranges: NamedRangeStore::new(),
            dep_graph: DepGraph::new(),
            dirty: FxHashSet::default(),
        }
    }

    fn generate_sheet_id(&mut self) -> SheetId {
        let id = SheetId(self.next_sheet_id);
        self.next_sheet_id += 1;
        id
    }

    pub fn next_sheet_id(&self) -> u64 {
        self.next_sheet_id
    }

    pub fn set_next_sheet_id(&mut self, id: u64) {
        self.next_sheet_id = id;
    }

    // =========================================================================
    // Sheet Management
    // =========================================================================

    pub fn sheet_count(&self) -> usize {
        self.sheets.len()
    }

    pub fn active_sheet_index(&self) -> usize {
        self.active_sheet
    }

    pub fn set_active_sheet(&mut self, index: usize) -> bool {
        if index < self.sheets.len() {
            self.active_sheet = index;
            true
        } else {
            false
        }
    }

    pub fn active_sheet(&self) -> &Sheet {
        &self.sheets[self.active_sheet]
    }

    pub fn active_sheet_mut(&mut self) -> &mut Sheet {
        &mut self.sheets[self.active_sheet]
    }

    pub fn sheet(&self, index: usize) -> Option<&Sheet> {
        self.sheets.get(index)
    }

    pub fn sheet_mut(&mut self, index: usize) -> Option<&mut Sheet> {
        self.sheets.get_mut(index)
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Add a new sheet with an auto-generated unique name; returns its index.
    pub fn add_sheet(&mut self) -> usize {
        let mut n = self.sheets.len() + 1;
        let mut new_name = format!("Sheet{}", n);
        while self.sheet_name_exists(&new_name) {
            n += 1;
            new_name = format!("Sheet{}", n);
        }

        let id = self.generate_sheet_id();
        let sheet = Sheet::new_with_name(id, MAX_ROWS, MAX_COLS, &new_name);
        self.sheets.push(sheet);
        // Formulas naming this sheet may now resolve
        self.mark_all_formulas_dirty();
        self.rebuild_dep_graph();
        self.sheets.len() - 1
    }

    /// Add a new sheet with a specific name.
    /// Returns None if the name is invalid or already taken.
    pub fn add_sheet_named(&mut self, name: &str) -> Option<usize> {
        if !is_valid_sheet_name(name) || self.sheet_name_exists(name) {
            return None;
        }
        let id = self.generate_sheet_id();
        let sheet = Sheet::new_with_name(id, MAX_ROWS, MAX_COLS, name);
        self.sheets.push(sheet);
        self.mark_all_formulas_dirty();
        self.rebuild_dep_graph();
        Some(self.sheets.len() - 1)
    }

    pub fn sheet_name_exists(&self, name: &str) -> bool {
        let key = normalize_sheet_name(name);
        self.sheets.iter().any(|s| s.name_key == key)
    }

    /// True if the name is not used by any sheet other than `exclude_id`.
    pub fn is_name_available(&self, name: &str, exclude_id: SheetId) -> bool {
        let key = normalize_sheet_name(name);
        !self
            .sheets
            .iter()
            .any(|s| s.id != exclude_id && s.name_key == key)
    }

    /// Delete a sheet. Returns false for the last remaining sheet or an
    /// invalid index. Formulas referencing the deleted sheet evaluate to
    /// #REF! afterwards.
    pub fn delete_sheet(&mut self, index: usize) -> bool {
        if self.sheets.len() <= 1 || index >= self.sheets.len() {
            return false;
        }

        let removed = self.sheets.remove(index);
        self.dep_graph.remove_sheet(removed.id);
        self.named_ranges.remove_sheet(&removed.name);

        if self.active_sheet >= self.sheets.len() {
            self.active_sheet = self.sheets.len() - 1;
        } else if self.active_sheet > index {
            self.active_sheet -= 1;
        }

        self.mark_all_formulas_dirty();
        true
    }

    /// Rename a sheet, rewriting formula references to the old name.
    /// Returns false if the index is invalid, the name is invalid, or the
    /// name is taken by another sheet.
    pub fn rename_sheet(&mut self, index: usize, new_name: &str) -> bool {
        if !is_valid_sheet_name(new_name) {
            return false;
        }
        let Some(sheet) = self.sheets.get(index) else {
            return false;
        };
        let sheet_id = sheet.id;
        let old_name = sheet.name.clone();
        if !self.is_name_available(new_name, sheet_id) {
            return false;
        }

        let old_key = normalize_sheet_name(&old_name);
        self.rewrite_all_formulas(|ast| adjust::rename_sheet_refs(ast, &old_key, new_name.trim()));
        self.named_ranges.rename_sheet(&old_name, new_name);

        if let Some(sheet) = self.sheets.get_mut(index) {
            sheet.set_name(new_name);
        }
        // A formerly dangling name may now resolve (or vice versa)
        self.rebuild_dep_graph();
        self.mark_all_formulas_dirty();
        true
    }

    // =========================================================================
    // Sheet ID-based Access
    // =========================================================================

    pub fn idx_for_sheet_id(&self, id: SheetId) -> Option<usize> {
        self.sheets.iter().position(|s| s.id == id)
    }

    pub fn sheet_id_at_idx(&self, idx: usize) -> Option<SheetId> {
        self.sheets.get(idx).map(|s| s.id)
    }

    pub fn sheet_by_id(&self, id: SheetId) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.id == id)
    }

    pub fn sheet_by_id_mut(&mut self, id: SheetId) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.id == id)
    }

    pub fn sheet_by_name(&self, name: &str) -> Option<&Sheet> {
        let key = normalize_sheet_name(name);
        self.sheets.iter().find(|s| s.name_key == key)
    }

    pub fn sheet_id_by_name(&self, name: &str) -> Option<SheetId> {
        self.sheet_by_name(name).map(|s| s.id)
    }

    pub fn active_sheet_id(&self) -> SheetId {
        self.sheets[self.active_sheet].id
    }

    /// Create a workbook from sheets (for deserialization).
    /// Call `rebuild_dep_graph()` and a full recalc after loading.
    pub fn from_sheets(sheets: Vec<Sheet>, active: usize) -> Self {
        let active_sheet = active.min(sheets.len().saturating_sub(1));
        let max_id = sheets.iter().map(|s| s.id.raw()).max().unwrap_or(0);
        Self {
            sheets,
            active_sheet,
            next_sheet_id: max_id + 1,
            named_ranges: NamedRangeStore::new(),
            dep_graph: DepGraph::new(),
            dirty: FxHashSet::default(),
        }
    }

    // =========================================================================
    // Cell Editing
    // =========================================================================

    /// Set a cell's raw text, maintaining dependencies and dirtiness.
    ///
    /// Writes to an obscured (merged) cell redirect to the anchor; the
    /// returned coordinate is where the write landed. Recalculation is NOT
    /// triggered here - it is deferred to the next recalc pass.
    pub fn set_cell_text(
        &mut self,
        sheet_idx: usize,
        row: usize,
        col: usize,
        text: &str,
    ) -> Option<(usize, usize)> {
        let sheet_id = self.sheet_id_at_idx(sheet_idx)?;
        let (row, col) = self.sheets[sheet_idx].set_text(row, col, text);
        self.update_cell_deps(sheet_id, row, col);
        self.mark_dirty(CellId::new(sheet_id, row, col));
        Some((row, col))
    }

    /// Remove a cell entirely (content and format).
    pub fn clear_cell(&mut self, sheet_idx: usize, row: usize, col: usize) {
        let Some(sheet_id) = self.sheet_id_at_idx(sheet_idx) else {
            return;
        };
        self.sheets[sheet_idx].clear_cell(row, col);
        let cell_id = CellId::new(sheet_id, row, col);
        self.dep_graph.clear_cell(cell_id);
        self.mark_dirty(cell_id);
    }

    // =========================================================================
    // Dependency Graph
    // =========================================================================

    pub fn dep_graph(&self) -> &DepGraph {
        &self.dep_graph
    }

    /// Rebuild the dependency graph from scratch.
    ///
    /// Call this after loading a workbook or after a structural edit.
    pub fn rebuild_dep_graph(&mut self) {
        self.dep_graph = DepGraph::new();

        for sheet in &self.sheets {
            let sheet_id = sheet.id;
            for ((row, col), cell) in sheet.cells_iter() {
                if let CellContent::Formula { ast: Some(ast), .. } = &cell.content {
                    let bound = bind_expr(ast, |name| self.sheet_id_by_name(name));
                    let refs = extract_cell_ids(&bound, sheet_id, &self.named_ranges, |name| {
                        self.sheet_id_by_name(name)
                    });

                    if !refs.is_empty() {
                        let formula_cell = CellId::new(sheet_id, *row, *col);
                        let preds: FxHashSet<CellId> = refs.into_iter().collect();
                        self.dep_graph.replace_edges(formula_cell, preds);
                    }
                }
            }
        }
    }

    /// Update the dependency graph for a specific cell after its content
    /// changed. Non-formula cells clear any existing edges.
    pub fn update_cell_deps(&mut self, sheet_id: SheetId, row: usize, col: usize) {
        let cell_id = CellId::new(sheet_id, row, col);

        let ast = self
            .sheet_by_id(sheet_id)
            .and_then(|sheet| sheet.cell_ref(row, col))
            .and_then(|cell| cell.content.formula_ast().cloned());

        if let Some(ast) = ast {
            let bound = bind_expr(&ast, |name| self.sheet_id_by_name(name));
            let refs = extract_cell_ids(&bound, sheet_id, &self.named_ranges, |name| {
                self.sheet_id_by_name(name)
            });
            let preds: FxHashSet<CellId> = refs.into_iter().collect();
            self.dep_graph.replace_edges(cell_id, preds);
        } else {
            self.dep_graph.clear_cell(cell_id);
        }
    }

    pub fn get_precedents(&self, sheet_id: SheetId, row: usize, col: usize) -> Vec<CellId> {
        self.dep_graph
            .precedents(CellId::new(sheet_id, row, col))
            .collect()
    }

    pub fn get_dependents(&self, sheet_id: SheetId, row: usize, col: usize) -> Vec<CellId> {
        self.dep_graph
            .dependents(CellId::new(sheet_id, row, col))
            .collect()
    }

    /// Check whether committing `formula` at the given cell would create a
    /// cycle. The formula should not be applied if this errors; entry
    /// points that skip the check still get per-cell #CYCLE! marking at the
    /// next recalc pass.
    pub fn check_formula_cycle(
        &self,
        sheet_id: SheetId,
        row: usize,
        col: usize,
        formula: &str,
    ) -> Result<(), CycleReport> {
        let parsed =
            parse(formula).map_err(|e| CycleReport::new(vec![], format!("Parse error: {}", e)))?;
        let bound = bind_expr(&parsed, |name| self.sheet_id_by_name(name));
        let new_preds = extract_cell_ids(&bound, sheet_id, &self.named_ranges, |name| {
            self.sheet_id_by_name(name)
        });

        let cell_id = CellId::new(sheet_id, row, col);
        if let Some(cycle) = self.dep_graph.would_create_cycle(cell_id, &new_preds) {
            return Err(cycle);
        }
        Ok(())
    }

    // =========================================================================
    // Dirtiness & Recalculation
    // =========================================================================

    /// Mark a cell and everything transitively depending on it calc-dirty.
    pub fn mark_dirty(&mut self, cell_id: CellId) {
        let affected = self.dep_graph.transitive_dependents([cell_id]);
        for id in &affected {
            if let Some(sheet) = self.sheet_by_id_mut(id.sheet) {
                if sheet.cell_ref(id.row, id.col).is_some() {
                    sheet.cell_mut(id.row, id.col).calc_dirty = true;
                }
            }
        }
        self.dirty.extend(affected);
    }

    /// Mark every formula cell in the workbook calc-dirty.
    pub fn mark_all_formulas_dirty(&mut self) {
        let mut ids = Vec::new();
        for sheet in &mut self.sheets {
            let sheet_id = sheet.id;
            for ((row, col), cell) in sheet.cells_iter_mut() {
                if cell.content.is_formula() {
                    cell.calc_dirty = true;
                    ids.push(CellId::new(sheet_id, *row, *col));
                }
            }
        }
        self.dirty.extend(ids);
    }

    pub fn has_dirty_cells(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Recalculate exactly the calc-dirty set in dependency order.
    pub fn recalc_dirty(&mut self) -> RecalcReport {
        self.run_recalc_pass()
    }

    /// Force a full recalculation of every formula cell.
    pub fn recalc_all(&mut self) -> RecalcReport {
        self.mark_all_formulas_dirty();
        self.run_recalc_pass()
    }

    /// One recalculation pass over the dirty set.
    ///
    /// Cycle members are settled to #CYCLE! first and excluded from ordered
    /// evaluation; the rest evaluates in topological order (precedents
    /// before dependents, ties broken by cell id), reading precedent values
    /// from the caches settled earlier in the same pass. Errors propagate
    /// as values.
    fn run_recalc_pass(&mut self) -> RecalcReport {
        let start = Instant::now();
        let mut report = RecalcReport::new();

        if self.dirty.is_empty() {
            return report;
        }

        // Settle cycle members first
        let cycle_members = self.dep_graph.find_cycle_members();
        report.had_cycles = !cycle_members.is_empty();
        report.cycle_cells = cycle_members.len();

        let mut sorted_cycle: Vec<CellId> = cycle_members.iter().copied().collect();
        sorted_cycle.sort();
        for id in &sorted_cycle {
            self.dirty.remove(id);
            if let Some(sheet) = self.sheet_by_id_mut(id.sheet) {
                if sheet.cell_ref(id.row, id.col).is_some() {
                    let cell = sheet.cell_mut(id.row, id.col);
                    cell.computed = Value::Error(CellError::Cycle);
                    cell.calc_dirty = false;
                    report.recomputed.push(*id);
                    if report.errors.len() < 100 {
                        report.errors.push(RecalcError::new(*id, CellError::Cycle));
                    }
                }
            }
        }

        // Ordered evaluation of the remaining dirty set
        let dirty_set = std::mem::take(&mut self.dirty);
        let order = self.dep_graph.topo_order(&dirty_set);

        let mut depths: FxHashMap<CellId, usize> = FxHashMap::default();
        for cell_id in &order {
            let Some(value) = self.evaluate_cell(*cell_id) else {
                continue; // cell no longer materialized
            };

            let is_formula = self
                .sheet_by_id(cell_id.sheet)
                .and_then(|s| s.cell_ref(cell_id.row, cell_id.col))
                .map(|c| c.content.is_formula())
                .unwrap_or(false);

            if is_formula {
                let mut max_pred_depth = 0;
                for pred in self.dep_graph.precedents(*cell_id) {
                    max_pred_depth = max_pred_depth.max(depths.get(&pred).copied().unwrap_or(0));
                }
                let depth = max_pred_depth + 1;
                depths.insert(*cell_id, depth);
                report.max_depth = report.max_depth.max(depth);
            }

            if let Value::Error(e) = &value {
                if report.errors.len() < 100 {
                    report.errors.push(RecalcError::new(*cell_id, *e));
                }
            }

            if let Some(sheet) = self.sheet_by_id_mut(cell_id.sheet) {
                let cell = sheet.cell_mut(cell_id.row, cell_id.col);
                cell.computed = value;
                cell.calc_dirty = false;
            }
            report.recomputed.push(*cell_id);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }

    /// Evaluate a single cell against the current caches.
    /// Returns None if the cell is not materialized.
    fn evaluate_cell(&self, cell_id: CellId) -> Option<Value> {
        let sheet = self.sheet_by_id(cell_id.sheet)?;
        let cell = sheet.cell_ref(cell_id.row, cell_id.col)?;

        match &cell.content {
            CellContent::Formula { ast: Some(ast), .. } => {
                let bound = bind_expr(ast, |name| self.sheet_id_by_name(name));
                let lookup = WorkbookLookup::with_cell_context(
                    self,
                    cell_id.sheet,
                    cell_id.row,
                    cell_id.col,
                );
                Some(eval::evaluate(&bound, &lookup))
            }
            // Unparseable formula source
            CellContent::Formula { ast: None, .. } => Some(Value::Error(CellError::Value)),
            other => Some(other.literal_value()),
        }
    }

    // =========================================================================
    // Structural Edits (with formula rewriting)
    // =========================================================================

    pub fn insert_rows(&mut self, sheet_idx: usize, at: usize, count: usize) -> Vec<RewrittenFormula> {
        self.structural_edit(sheet_idx, ShiftOp::insert_rows(at, count))
    }

    pub fn delete_rows(&mut self, sheet_idx: usize, at: usize, count: usize) -> Vec<RewrittenFormula> {
        self.structural_edit(sheet_idx, ShiftOp::delete_rows(at, count))
    }

    pub fn insert_cols(&mut self, sheet_idx: usize, at: usize, count: usize) -> Vec<RewrittenFormula> {
        self.structural_edit(sheet_idx, ShiftOp::insert_cols(at, count))
    }

    pub fn delete_cols(&mut self, sheet_idx: usize, at: usize, count: usize) -> Vec<RewrittenFormula> {
        self.structural_edit(sheet_idx, ShiftOp::delete_cols(at, count))
    }

    /// Apply a row/column edit: shift the sheet, shift named ranges, rewrite
    /// every formula in the workbook that references the edited sheet, and
    /// rebuild the dependency graph.
    ///
    /// Returns the rewritten formulas' old sources (for undo capture).
    fn structural_edit(&mut self, sheet_idx: usize, op: ShiftOp) -> Vec<RewrittenFormula> {
        let Some(target_id) = self.sheet_id_at_idx(sheet_idx) else {
            return Vec::new();
        };
        let target_key = self.sheets[sheet_idx].name_key.clone();
        let target_name = self.sheets[sheet_idx].name.clone();

        {
            use crate::formula::adjust::{Axis, ShiftKind};
            let sheet = &mut self.sheets[sheet_idx];
            match (op.axis, op.kind) {
                (Axis::Row, ShiftKind::Insert) => sheet.insert_rows(op.at, op.count),
                (Axis::Row, ShiftKind::Delete) => sheet.delete_rows(op.at, op.count),
                (Axis::Col, ShiftKind::Insert) => sheet.insert_cols(op.at, op.count),
                (Axis::Col, ShiftKind::Delete) => sheet.delete_cols(op.at, op.count),
            }
        }

        self.named_ranges.apply_shift(&target_name, &op);

        let rewrites = self.rewrite_formulas_for_shift(&op, target_id, &target_key);

        self.rebuild_dep_graph();
        self.mark_all_formulas_dirty();
        rewrites
    }

    fn rewrite_formulas_for_shift(
        &mut self,
        op: &ShiftOp,
        target_id: SheetId,
        target_key: &str,
    ) -> Vec<RewrittenFormula> {
        // Collect first, mutate after: the rewrite touches every sheet.
        let mut changes: Vec<(usize, usize, usize, ParsedExpr, String)> = Vec::new();

        for (sheet_index, sheet) in self.sheets.iter().enumerate() {
            let own_id = sheet.id;
            for ((row, col), cell) in sheet.cells_iter() {
                let CellContent::Formula { source, ast: Some(ast) } = &cell.content else {
                    continue;
                };
                let (adjusted, changed) = adjust::adjust_expr(ast, op, |sheet_ref| match sheet_ref {
                    UnboundSheetRef::Current => own_id == target_id,
                    UnboundSheetRef::Named(n) => normalize_sheet_name(n) == target_key,
                });
                if changed {
                    changes.push((sheet_index, *row, *col, adjusted, source.clone()));
                }
            }
        }

        let mut rewrites = Vec::with_capacity(changes.len());
        for (sheet_index, row, col, adjusted, old_source) in changes {
            let new_source = to_formula(&adjusted);
            let cell = self.sheets[sheet_index].cell_mut(row, col);
            cell.content = CellContent::Formula {
                source: new_source,
                ast: Some(adjusted),
            };
            cell.calc_dirty = true;
            rewrites.push(RewrittenFormula {
                sheet_index,
                row,
                col,
                old_source,
            });
        }
        rewrites
    }

    /// Rewrite every formula AST in the workbook through `f`.
    fn rewrite_all_formulas<F>(&mut self, f: F)
    where
        F: Fn(&ParsedExpr) -> (ParsedExpr, bool),
    {
        for sheet in &mut self.sheets {
            let mut changes: Vec<((usize, usize), ParsedExpr)> = Vec::new();
            for ((row, col), cell) in sheet.cells_iter() {
                if let CellContent::Formula { ast: Some(ast), .. } = &cell.content {
                    let (rewritten, changed) = f(ast);
                    if changed {
                        changes.push(((*row, *col), rewritten));
                    }
                }
            }
            for ((row, col), rewritten) in changes {
                let cell = sheet.cell_mut(row, col);
                cell.content = CellContent::Formula {
                    source: to_formula(&rewritten),
                    ast: Some(rewritten),
                };
                cell.calc_dirty = true;
            }
        }
    }

    // =========================================================================
    // Merged Regions
    // =========================================================================

    /// Merge a region, clearing dependencies of the discarded non-anchor
    /// cells so their dependents re-read them as empty.
    pub fn merge_cells(&mut self, sheet_idx: usize, rect: &GridRect) -> Result<(), String> {
        let sheet_id = self
            .sheet_id_at_idx(sheet_idx)
            .ok_or_else(|| "No such sheet".to_string())?;

        let anchor = rect.top_left();
        let cleared: Vec<(usize, usize)> = self.sheets[sheet_idx]
            .cells_in_range(rect)
            .into_iter()
            .filter(|pos| *pos != anchor)
            .collect();

        self.sheets[sheet_idx].merge_cells(rect)?;

        for (row, col) in cleared {
            let cell_id = CellId::new(sheet_id, row, col);
            self.dep_graph.clear_cell(cell_id);
            self.mark_dirty(cell_id);
        }
        Ok(())
    }

    pub fn unmerge_cells(&mut self, sheet_idx: usize, row: usize, col: usize) -> Option<GridRect> {
        self.sheets.get_mut(sheet_idx)?.unmerge_cells(row, col)
    }

    // =========================================================================
    // Named Range Management
    // =========================================================================

    pub fn named_ranges(&self) -> &NamedRangeStore {
        &self.named_ranges
    }

    pub fn named_ranges_mut(&mut self) -> &mut NamedRangeStore {
        &mut self.named_ranges
    }

    /// Define (or replace) a named range. Formulas referencing the name are
    /// re-marked dirty so they pick up the new target.
    pub fn define_name(&mut self, range: NamedRange) -> Result<Option<NamedRange>, String> {
        let replaced = self.named_ranges.set(range)?;
        self.rebuild_dep_graph();
        self.mark_all_formulas_dirty();
        Ok(replaced)
    }

    pub fn delete_named_range(&mut self, name: &str) -> Option<NamedRange> {
        let removed = self.named_ranges.remove(name)?;
        self.rebuild_dep_graph();
        self.mark_all_formulas_dirty();
        Some(removed)
    }

    pub fn get_named_range(&self, name: &str) -> Option<&NamedRange> {
        self.named_ranges.get(name)
    }

    /// Resolve a named range to the rect it covers.
    /// Unknown names are None - a sentinel, not an error.
    pub fn get_rect_for_name(&self, name: &str) -> Option<(SheetId, GridRect)> {
        let range = self.named_ranges.get(name)?;
        let sheet_id = self.sheet_id_by_name(range.sheet_name())?;
        Some((sheet_id, range.rect()))
    }

    pub fn list_named_ranges(&self) -> Vec<&NamedRange> {
        self.named_ranges.list()
    }
}

// =============================================================================
// WorkbookLookup - CellLookup implementation with cross-sheet support
// =============================================================================

/// A CellLookup over workbook caches, with cross-sheet and named-range
/// resolution.
pub struct WorkbookLookup<'a> {
    workbook: &'a Workbook,
    current_sheet_id: SheetId,
    current_cell: Option<(usize, usize)>,
}

impl<'a> WorkbookLookup<'a> {
    pub fn new(workbook: &'a Workbook, current_sheet_id: SheetId) -> Self {
        Self {
            workbook,
            current_sheet_id,
            current_cell: None,
        }
    }

    pub fn with_cell_context(
        workbook: &'a Workbook,
        current_sheet_id: SheetId,
        row: usize,
        col: usize,
    ) -> Self {
        Self {
            workbook,
            current_sheet_id,
            current_cell: Some((row, col)),
        }
    }
}

impl<'a> CellLookup for WorkbookLookup<'a> {
    fn cell_value(&self, row: usize, col: usize) -> Value {
        match self.workbook.sheet_by_id(self.current_sheet_id) {
            Some(sheet) => sheet.computed_value(row, col),
            None => Value::Error(CellError::Ref),
        }
    }

    fn cell_value_sheet(&self, sheet_id: SheetId, row: usize, col: usize) -> Value {
        match self.workbook.sheet_by_id(sheet_id) {
            Some(sheet) => sheet.computed_value(row, col),
            None => Value::Error(CellError::Ref),
        }
    }

    fn resolve_named_range(&self, name: &str) -> Option<NamedRangeResolution> {
        let range = self.workbook.named_ranges.get(name)?;
        let sheet_id = self.workbook.sheet_id_by_name(range.sheet_name())?;
        Some(match &range.target {
            NamedRangeTarget::Cell { row, col, .. } => NamedRangeResolution::Cell {
                sheet: sheet_id,
                row: *row,
                col: *col,
            },
            NamedRangeTarget::Range { rect, .. } => NamedRangeResolution::Range {
                sheet: sheet_id,
                start_row: rect.start_row,
                start_col: rect.start_col,
                end_row: rect.end_row,
                end_col: rect.end_col,
            },
        })
    }

    fn current_cell(&self) -> Option<(usize, usize)> {
        self.current_cell
    }
}
