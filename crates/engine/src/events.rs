//! Event types for workbook change notifications.
//!
//! The document layer emits these at the end of the outermost operation so
//! observers (UI adapters, session servers) can react without polling.

use tabula_core::GridRect;

use crate::cell_id::CellId;
use crate::sheet::SheetId;

/// Events emitted when a batched operation completes.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkbookEvent {
    /// Cells changed value as a result of edits or recalc.
    CellsChanged(CellsChangedEvent),

    /// Regions need repainting. Purely a rendering hint.
    PaintDirty(PaintDirtyEvent),

    /// A recalculation pass finished.
    RecalcCompleted(RecalcCompletedEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellsChangedEvent {
    /// Cells recomputed by the pass, in evaluation order.
    pub cells: Vec<CellId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaintDirtyEvent {
    pub sheet: SheetId,
    pub regions: Vec<GridRect>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecalcCompletedEvent {
    pub cells_recomputed: usize,
    pub had_cycles: bool,
}

/// Callback type for receiving workbook events.
pub type EventCallback = Box<dyn FnMut(&WorkbookEvent) + Send>;

/// Simple event collector for testing.
#[derive(Default)]
pub struct EventCollector {
    events: Vec<WorkbookEvent>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn push(&mut self, event: WorkbookEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[WorkbookEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Filter to only CellsChanged events.
    pub fn cells_changed(&self) -> Vec<&CellsChangedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                WorkbookEvent::CellsChanged(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Filter to only PaintDirty events.
    pub fn paint_dirty(&self) -> Vec<&PaintDirtyEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                WorkbookEvent::PaintDirty(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// Filter to only RecalcCompleted events.
    pub fn recalc_completed(&self) -> Vec<&RecalcCompletedEvent> {
        self.events
            .iter()
            .filter_map(|e| match e {
                WorkbookEvent::RecalcCompleted(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_collector_filtering() {
        let mut collector = EventCollector::new();

        collector.push(WorkbookEvent::CellsChanged(CellsChangedEvent {
            cells: vec![CellId::new(SheetId(1), 0, 0)],
        }));
        collector.push(WorkbookEvent::PaintDirty(PaintDirtyEvent {
            sheet: SheetId(1),
            regions: vec![GridRect::cell(0, 0)],
        }));
        collector.push(WorkbookEvent::RecalcCompleted(RecalcCompletedEvent {
            cells_recomputed: 1,
            had_cycles: false,
        }));

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.cells_changed().len(), 1);
        assert_eq!(collector.paint_dirty().len(), 1);
        assert_eq!(collector.recalc_completed().len(), 1);
    }
}
