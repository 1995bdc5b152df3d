//! End-to-end editing behavior through the public document surface.

use tabula_core::{CommandSink, GridRect, Selection};
use tabula_document::{Command, Document};
use tabula_engine::formula::eval::{CellError, Value};
use tabula_engine::named_range::NamedRange;

fn set(doc: &mut Document, row: usize, col: usize, text: &str) {
    doc.apply(Command::SetText {
        sheet: 0,
        row,
        col,
        text: text.to_string(),
    })
    .unwrap();
}

fn value(doc: &Document, row: usize, col: usize) -> Value {
    doc.workbook().sheet(0).unwrap().computed_value(row, col)
}

fn raw(doc: &Document, row: usize, col: usize) -> String {
    doc.workbook().sheet(0).unwrap().get_raw(row, col)
}

#[test]
fn dependency_propagation() {
    let mut doc = Document::new();
    set(&mut doc, 0, 0, "5"); // A1
    set(&mut doc, 1, 1, "=A1+1"); // B2
    assert_eq!(value(&doc, 1, 1), Value::Number(6.0));

    // Updating the precedent recalculates the dependent without touching it
    set(&mut doc, 0, 0, "10");
    assert_eq!(value(&doc, 1, 1), Value::Number(11.0));
}

#[test]
fn circular_reference_terminates_with_errors() {
    let mut doc = Document::new();
    set(&mut doc, 0, 0, "=B1");
    set(&mut doc, 0, 1, "=A1");

    assert_eq!(value(&doc, 0, 0), Value::Error(CellError::Cycle));
    assert_eq!(value(&doc, 0, 1), Value::Error(CellError::Cycle));
}

#[test]
fn row_insertion_rewrites_references() {
    let mut doc = Document::new();
    set(&mut doc, 0, 0, "7"); // A1
    set(&mut doc, 1, 1, "=A1"); // B2

    doc.apply(Command::InsertRows {
        sheet: 0,
        at: 0,
        count: 1,
    })
    .unwrap();

    // The formula (now at B3) still reaches the cell that was A1
    assert_eq!(raw(&doc, 2, 1), "=A2");
    assert_eq!(value(&doc, 2, 1), Value::Number(7.0));
}

#[test]
fn column_deletion_invalidates_references() {
    let mut doc = Document::new();
    set(&mut doc, 0, 0, "7"); // A1
    set(&mut doc, 1, 1, "=A1"); // B2

    doc.apply(Command::DeleteCols {
        sheet: 0,
        at: 0,
        count: 1,
    })
    .unwrap();

    assert_eq!(raw(&doc, 1, 0), "=#REF!");
    assert_eq!(value(&doc, 1, 0), Value::Error(CellError::Ref));
}

#[test]
fn merged_region_has_single_source_of_truth() {
    let mut doc = Document::new();
    doc.apply(Command::MergeCells {
        sheet: 0,
        rect: GridRect::new((0, 0), (1, 1)),
    })
    .unwrap();

    set(&mut doc, 1, 1, "42"); // non-anchor write

    let sheet = doc.workbook().sheet(0).unwrap();
    assert_eq!(sheet.get_raw(0, 0), "42");
    assert_eq!(sheet.get_raw(1, 1), "");
    assert_eq!(sheet.text(1, 1), "42");
    assert_eq!(sheet.text(0, 1), "42");
}

#[test]
fn named_range_lookups_never_ambiguous() {
    let mut doc = Document::new();
    doc.apply(Command::DefineName {
        range: NamedRange::cell("Target", "Sheet1", 0, 0),
    })
    .unwrap();
    doc.apply(Command::DefineName {
        range: NamedRange::cell("TARGET", "Sheet1", 5, 5),
    })
    .unwrap();

    // Latest definition wins; exactly one target resolves
    let (_, rect) = doc.workbook().get_rect_for_name("target").unwrap();
    assert_eq!(rect, GridRect::cell(5, 5));
    assert!(doc.workbook().get_rect_for_name("absent").is_none());
}

#[test]
fn undo_redo_round_trip_over_mixed_edits() {
    let mut doc = Document::new();
    set(&mut doc, 0, 0, "1");
    set(&mut doc, 1, 0, "2");
    set(&mut doc, 2, 0, "=SUM(A1:A2)");
    doc.apply(Command::InsertRows {
        sheet: 0,
        at: 1,
        count: 1,
    })
    .unwrap();
    doc.apply(Command::MergeCells {
        sheet: 0,
        rect: GridRect::new((5, 0), (5, 1)),
    })
    .unwrap();
    set(&mut doc, 5, 0, "end");

    let edits = 6;
    let final_sum = raw(&doc, 3, 0);
    assert_eq!(final_sum, "=SUM(A1:A3)");

    for _ in 0..edits {
        assert!(doc.undo());
    }
    assert!(!doc.can_undo());
    assert_eq!(raw(&doc, 0, 0), "");
    assert_eq!(raw(&doc, 2, 0), "");

    for _ in 0..edits {
        assert!(doc.redo());
    }
    assert_eq!(raw(&doc, 3, 0), final_sum);
    assert_eq!(value(&doc, 3, 0), Value::Number(3.0));
    assert_eq!(raw(&doc, 5, 0), "end");
}

#[test]
fn selection_contract_drives_commands() {
    // A UI adapter reads the selection and submits commands; the core
    // never calls back into it.
    let mut selection = Selection::new();
    selection.initialize((2, 2));
    selection.extend((4, 3));

    let mut doc = Document::new();
    let rect = selection.last_range();
    let mut format = tabula_engine::cell::CellFormat::default();
    format.bold = true;
    doc.submit(Command::SetFormat {
        sheet: 0,
        rect,
        format,
    })
    .unwrap();

    let sheet = doc.workbook().sheet(0).unwrap();
    assert!(sheet.get_format(2, 2).bold);
    assert!(sheet.get_format(4, 3).bold);
    assert!(!sheet.get_format(5, 3).bold);
    assert_eq!(selection.marker(), (4, 3));
}
