//! Dependency graph for formula cells.
//!
//! Tracks precedents (cells a formula depends on) and dependents (cells that
//! depend on a given cell) for dirty propagation and ordered recomputation.
//!
//! # Edge Direction
//!
//! ```text
//! A → B  means  "B depends on A"  (A is a precedent of B)
//! ```
//!
//! This makes "what breaks if I change X?" trivial: follow outgoing edges.

use std::collections::BinaryHeap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell_id::CellId;
use crate::recalc::CycleReport;
use crate::sheet::SheetId;

/// Persistent dependency graph for formula cells.
///
/// Maintains bidirectional adjacency for O(1) lookups:
/// - `preds[B]` = cells that B depends on (precedents)
/// - `succs[A]` = cells that depend on A (dependents)
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** If A ∈ preds[B] then B ∈ succs[A], and vice versa.
/// 2. **No dangling entries:** Empty sets are removed, not stored.
/// 3. **No duplicate edges:** Set semantics enforced by FxHashSet.
/// 4. **Atomic updates:** `replace_edges` is the only mutator that touches both maps.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    /// Precedents: for each formula cell B, the cells A it depends on.
    preds: FxHashMap<CellId, FxHashSet<CellId>>,

    /// Dependents: for each referenced cell A, the formula cells B that depend on it.
    succs: FxHashMap<CellId, FxHashSet<CellId>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cells this formula cell depends on (precedents).
    pub fn precedents(&self, cell: CellId) -> impl Iterator<Item = CellId> + '_ {
        self.preds
            .get(&cell)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// Returns the cells that depend on this cell (dependents).
    pub fn dependents(&self, cell: CellId) -> impl Iterator<Item = CellId> + '_ {
        self.succs
            .get(&cell)
            .into_iter()
            .flat_map(|s| s.iter().copied())
    }

    /// Returns true if this cell has formula dependencies tracked in the graph.
    pub fn is_formula_cell(&self, cell: CellId) -> bool {
        self.preds.contains_key(&cell)
    }

    /// All formula cells (cells with at least one precedent).
    pub fn formula_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.preds.keys().copied()
    }

    pub fn formula_cell_count(&self) -> usize {
        self.preds.len()
    }

    /// Replace all edges for a formula cell atomically.
    ///
    /// This is the primary mutation API. Pass an empty set to clear all
    /// edges for this cell.
    pub fn replace_edges(&mut self, formula_cell: CellId, new_preds: FxHashSet<CellId>) {
        // Remove old edges
        if let Some(old_preds) = self.preds.remove(&formula_cell) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&formula_cell);
                    // Invariant: no dangling entries
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        // Add new edges
        for pred in &new_preds {
            self.succs.entry(*pred).or_default().insert(formula_cell);
        }
        self.preds.insert(formula_cell, new_preds);
    }

    /// Clear all edges for a cell (formula removed or cell deleted).
    pub fn clear_cell(&mut self, cell: CellId) {
        self.replace_edges(cell, FxHashSet::default());
    }

    /// Remove all edges involving cells from a specific sheet.
    ///
    /// Called when a sheet is deleted.
    pub fn remove_sheet(&mut self, sheet: SheetId) {
        let cells_to_remove: Vec<CellId> = self
            .preds
            .keys()
            .filter(|c| c.sheet == sheet)
            .copied()
            .collect();

        for cell in cells_to_remove {
            self.clear_cell(cell);
        }

        // Cells on this sheet that are only referenced (no formulas of their own)
        let referenced_to_remove: Vec<CellId> = self
            .succs
            .keys()
            .filter(|c| c.sheet == sheet)
            .copied()
            .collect();

        for cell in referenced_to_remove {
            if let Some(dependents) = self.succs.remove(&cell) {
                for dep in dependents {
                    if let Some(preds) = self.preds.get_mut(&dep) {
                        preds.remove(&cell);
                        if preds.is_empty() {
                            self.preds.remove(&dep);
                        }
                    }
                }
            }
        }
    }

    /// Apply a coordinate mapping to all cells in the graph.
    ///
    /// Used for row/column insert/delete operations. The mapping function
    /// returns `Some(new_id)` if the cell moves, or `None` if it's deleted.
    pub fn apply_mapping<F>(&mut self, map: F)
    where
        F: Fn(CellId) -> Option<CellId>,
    {
        let mut new_preds: FxHashMap<CellId, FxHashSet<CellId>> = FxHashMap::default();
        let mut new_succs: FxHashMap<CellId, FxHashSet<CellId>> = FxHashMap::default();

        for (formula_cell, preds) in &self.preds {
            let Some(new_formula_cell) = map(*formula_cell) else {
                continue; // Formula cell was deleted
            };

            let mapped_preds: FxHashSet<CellId> = preds.iter().filter_map(|p| map(*p)).collect();
            if mapped_preds.is_empty() {
                continue; // All precedents were deleted
            }

            for pred in &mapped_preds {
                new_succs.entry(*pred).or_default().insert(new_formula_cell);
            }
            new_preds.insert(new_formula_cell, mapped_preds);
        }

        self.preds = new_preds;
        self.succs = new_succs;
    }

    // =========================================================================
    // Dirty Propagation
    // =========================================================================

    /// All cells transitively depending on any of the given cells,
    /// including the starting cells themselves.
    pub fn transitive_dependents(
        &self,
        start: impl IntoIterator<Item = CellId>,
    ) -> FxHashSet<CellId> {
        let mut visited: FxHashSet<CellId> = FxHashSet::default();
        let mut queue: Vec<CellId> = start.into_iter().collect();
        for cell in &queue {
            visited.insert(*cell);
        }

        while let Some(cell) = queue.pop() {
            for dep in self.dependents(cell) {
                if visited.insert(dep) {
                    queue.push(dep);
                }
            }
        }

        visited
    }

    // =========================================================================
    // Topological Ordering
    // =========================================================================

    /// Order the given cells so that precedents come before dependents.
    ///
    /// Only edges between cells *within the set* are considered. Ties are
    /// broken by (sheet, row, col) for deterministic evaluation order.
    /// Cells on a cycle inside the set are not emitted; callers must settle
    /// cycle members separately (see `find_cycle_members`).
    pub fn topo_order(&self, cells: &FxHashSet<CellId>) -> Vec<CellId> {
        let mut indegree: FxHashMap<CellId, usize> = FxHashMap::default();
        for &cell in cells {
            let n = self.precedents(cell).filter(|p| cells.contains(p)).count();
            indegree.insert(cell, n);
        }

        // Min-heap on CellId for deterministic tie-break
        let mut ready: BinaryHeap<std::cmp::Reverse<CellId>> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(c, _)| std::cmp::Reverse(*c))
            .collect();

        let mut order = Vec::with_capacity(cells.len());
        while let Some(std::cmp::Reverse(cell)) = ready.pop() {
            order.push(cell);
            for dep in self.dependents(cell) {
                if let Some(n) = indegree.get_mut(&dep) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(std::cmp::Reverse(dep));
                    }
                }
            }
        }

        order
    }

    // =========================================================================
    // Cycle Detection (Tarjan's SCC)
    // =========================================================================

    /// Find all cells that are members of true cycles (SCC size > 1 or self-loop).
    ///
    /// Uses an iterative Tarjan's algorithm to avoid stack overflow on deep
    /// graphs. Only edges between formula cells are considered; nodes are
    /// visited in sorted order for deterministic output.
    pub fn find_cycle_members(&self) -> FxHashSet<CellId> {
        let formula_cells: FxHashSet<CellId> = self.preds.keys().copied().collect();
        if formula_cells.is_empty() {
            return FxHashSet::default();
        }

        let mut sorted_cells: Vec<CellId> = formula_cells.iter().copied().collect();
        sorted_cells.sort();

        let sorted_neighbours = |cell: CellId| -> Vec<CellId> {
            let mut neighbours: Vec<CellId> = self
                .preds
                .get(&cell)
                .into_iter()
                .flat_map(|s| s.iter().copied())
                .filter(|c| formula_cells.contains(c))
                .collect();
            neighbours.sort();
            neighbours
        };

        let mut index_counter: u32 = 0;
        let mut stack: Vec<CellId> = Vec::new();
        let mut on_stack: FxHashSet<CellId> = FxHashSet::default();
        let mut indices: FxHashMap<CellId, u32> = FxHashMap::default();
        let mut lowlinks: FxHashMap<CellId, u32> = FxHashMap::default();
        let mut result: FxHashSet<CellId> = FxHashSet::default();

        struct DfsFrame {
            cell: CellId,
            neighbours: Vec<CellId>,
            next_idx: usize,
        }

        for &root in &sorted_cells {
            if indices.contains_key(&root) {
                continue;
            }

            let mut dfs_stack: Vec<DfsFrame> = Vec::new();

            let idx = index_counter;
            index_counter += 1;
            indices.insert(root, idx);
            lowlinks.insert(root, idx);
            stack.push(root);
            on_stack.insert(root);

            dfs_stack.push(DfsFrame {
                cell: root,
                neighbours: sorted_neighbours(root),
                next_idx: 0,
            });

            while let Some(frame) = dfs_stack.last_mut() {
                if frame.next_idx < frame.neighbours.len() {
                    let w = frame.neighbours[frame.next_idx];
                    frame.next_idx += 1;

                    if !indices.contains_key(&w) {
                        let w_idx = index_counter;
                        index_counter += 1;
                        indices.insert(w, w_idx);
                        lowlinks.insert(w, w_idx);
                        stack.push(w);
                        on_stack.insert(w);

                        dfs_stack.push(DfsFrame {
                            cell: w,
                            neighbours: sorted_neighbours(w),
                            next_idx: 0,
                        });
                    } else if on_stack.contains(&w) {
                        let w_idx = indices[&w];
                        let v_low = lowlinks.get_mut(&frame.cell).unwrap();
                        if w_idx < *v_low {
                            *v_low = w_idx;
                        }
                    }
                } else {
                    // All neighbours explored — pop and propagate lowlink
                    let finished = dfs_stack.pop().unwrap();
                    let v = finished.cell;
                    let v_low = lowlinks[&v];
                    let v_idx = indices[&v];

                    if let Some(parent) = dfs_stack.last() {
                        let parent_low = lowlinks.get_mut(&parent.cell).unwrap();
                        if v_low < *parent_low {
                            *parent_low = v_low;
                        }
                    }

                    // SCC root check
                    if v_low == v_idx {
                        let mut scc = Vec::new();
                        loop {
                            let w = stack.pop().unwrap();
                            on_stack.remove(&w);
                            scc.push(w);
                            if w == v {
                                break;
                            }
                        }

                        // Include SCC if size > 1, or size == 1 with a self-loop
                        if scc.len() > 1 {
                            result.extend(scc);
                        } else if scc.len() == 1 {
                            let cell = scc[0];
                            if self.preds.get(&cell).is_some_and(|p| p.contains(&cell)) {
                                result.insert(cell);
                            }
                        }
                    }
                }
            }
        }

        result
    }

    /// Check whether giving `cell` the precedents `new_preds` would create a
    /// cycle, without mutating the graph.
    ///
    /// Walks upstream from the new precedents; if `cell` is reachable, the
    /// edge set closes a loop.
    pub fn would_create_cycle(&self, cell: CellId, new_preds: &[CellId]) -> Option<CycleReport> {
        if new_preds.contains(&cell) {
            return Some(CycleReport::self_reference(cell));
        }

        let mut visited: FxHashSet<CellId> = FxHashSet::default();
        let mut parent: FxHashMap<CellId, CellId> = FxHashMap::default();
        let mut queue: Vec<CellId> = Vec::new();

        for &pred in new_preds {
            if visited.insert(pred) {
                queue.push(pred);
            }
        }

        while let Some(current) = queue.pop() {
            for upstream in self.precedents(current) {
                if upstream == cell {
                    // Reconstruct one path for the report
                    let mut path = vec![cell, current];
                    let mut cursor = current;
                    while let Some(&p) = parent.get(&cursor) {
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    return Some(CycleReport::cycle(path));
                }
                if visited.insert(upstream) {
                    parent.insert(upstream, current);
                    queue.push(upstream);
                }
            }
        }

        None
    }
}
