//! Selection state shared between the engine consumers and UI adapters.
//!
//! The selection is pure data: an anchor, a marker (the active cell), and a
//! list of ranges. The last range is the active one; earlier entries are
//! additional discontinuous selections. The core never renders or reacts to
//! this state - UI layers read it and translate gestures into the three
//! mutation calls below.

use serde::{Deserialize, Serialize};

use crate::rect::GridRect;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Where the current gesture started; extend() grows from here.
    anchor: (usize, usize),
    /// The active cell (cursor position).
    marker: (usize, usize),
    /// Selected ranges; the last entry is the active range.
    ranges: Vec<GridRect>,
}

impl Default for Selection {
    fn default() -> Self {
        Self::new()
    }
}

impl Selection {
    pub fn new() -> Self {
        Self {
            anchor: (0, 0),
            marker: (0, 0),
            ranges: vec![GridRect::cell(0, 0)],
        }
    }

    /// Reset the selection to a single cell. Discards additional ranges.
    pub fn initialize(&mut self, pos: (usize, usize)) {
        self.anchor = pos;
        self.marker = pos;
        self.ranges = vec![GridRect::cell(pos.0, pos.1)];
    }

    /// Move the marker, collapsing the active range to the new cell.
    /// Additional ranges are kept (the gesture continues a multi-selection).
    pub fn update(&mut self, pos: (usize, usize)) {
        self.anchor = pos;
        self.marker = pos;
        if let Some(last) = self.ranges.last_mut() {
            *last = GridRect::cell(pos.0, pos.1);
        } else {
            self.ranges.push(GridRect::cell(pos.0, pos.1));
        }
    }

    /// Grow the active range from the anchor to the given cell.
    pub fn extend(&mut self, pos: (usize, usize)) {
        self.marker = pos;
        let rect = GridRect::new(self.anchor, pos);
        if let Some(last) = self.ranges.last_mut() {
            *last = rect;
        } else {
            self.ranges.push(rect);
        }
    }

    /// Start an additional range at the given cell, keeping existing ranges.
    pub fn begin_additional(&mut self, pos: (usize, usize)) {
        self.anchor = pos;
        self.marker = pos;
        self.ranges.push(GridRect::cell(pos.0, pos.1));
    }

    /// The active cell.
    pub fn marker(&self) -> (usize, usize) {
        self.marker
    }

    /// Bounding rect of the active (most recent) range.
    pub fn last_range(&self) -> GridRect {
        *self
            .ranges
            .last()
            .expect("selection always holds at least one range")
    }

    /// All selected ranges, active range last.
    pub fn ranges(&self) -> &[GridRect] {
        &self.ranges
    }

    pub fn is_multi(&self) -> bool {
        self.ranges.len() > 1
    }

    /// True if the cell is inside any selected range.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.ranges.iter().any(|r| r.contains(row, col))
    }
}
