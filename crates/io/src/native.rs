//! Native XML document format.
//!
//! A `<spreadsheet>` root carries the mimetype, editor and syntax version;
//! `<map>` holds `<table>` elements with `<cell>`, `<row>`, `<column>` and
//! `<merge>` children; named ranges live under `<areaname>`.
//!
//! Loading builds a fresh `Document` and returns it - the caller's live
//! document is never touched, so a failed load cannot corrupt visible
//! state. Documents with a *newer* syntax version than this build load only
//! after the caller's version gate approves; unknown elements are then
//! skipped with a warning rather than aborting.

use std::path::Path;

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use tabula_core::GridRect;
use tabula_document::{Document, DocumentSettings, Locale};
use tabula_engine::cell::{Alignment, CellFormat, NumberFormat, VerticalAlignment};
use tabula_engine::named_range::{NamedRange, NamedRangeTarget};
use tabula_engine::sheet::{
    ColFormat, LayoutDirection, RowFormat, Sheet, SheetId, MAX_COLS, MAX_ROWS,
};
use tabula_engine::workbook::Workbook;

pub const MIME_TYPE: &str = "application/x-tabula";
pub const EDITOR: &str = "Tabula";
/// Current syntax version. The load path accepts anything <= this; newer
/// versions need the caller's approval.
pub const SYNTAX_VERSION: u32 = 2;

/// Caller's decision when a document claims a newer syntax version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDecision {
    /// Continue loading; unknown constructs are skipped (possible feature
    /// loss, understood data stays intact).
    Proceed,
    /// Cancel the load.
    Abort,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml error: {0}")]
    Xml(String),
    #[error("not a spreadsheet document: expected mimetype {expected}, found '{found}'")]
    MimeMismatch { expected: String, found: String },
    #[error("document uses syntax version {found}, newer than supported {supported}")]
    VersionRejected { found: u32, supported: u32 },
    #[error("malformed document: {0}")]
    Malformed(String),
}

// =============================================================================
// Save
// =============================================================================

pub fn save(doc: &Document, path: &Path) -> Result<(), IoError> {
    let xml = save_to_string(doc)?;
    std::fs::write(path, xml)?;
    tracing::info!("saved document to {}", path.display());
    Ok(())
}

fn xml_err(e: impl std::fmt::Display) -> IoError {
    IoError::Xml(e.to_string())
}

pub fn save_to_string(doc: &Document) -> Result<String, IoError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;

    let mut root = BytesStart::new("spreadsheet");
    root.push_attribute(("mime", MIME_TYPE));
    root.push_attribute(("editor", EDITOR));
    root.push_attribute(("syntaxVersion", SYNTAX_VERSION.to_string().as_str()));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    // Locale
    let mut locale = BytesStart::new("locale");
    locale.push_attribute(("language", doc.settings().locale.language.as_str()));
    writer.write_event(Event::Empty(locale)).map_err(xml_err)?;

    let workbook = doc.workbook();

    // Named ranges
    let names = workbook.list_named_ranges();
    if !names.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("areaname")))
            .map_err(xml_err)?;
        for range in names {
            let rect = range.rect();
            let mut area = BytesStart::new("area");
            area.push_attribute(("name", range.name.as_str()));
            area.push_attribute(("table", range.sheet_name()));
            area.push_attribute(("top", rect.start_row.to_string().as_str()));
            area.push_attribute(("left", rect.start_col.to_string().as_str()));
            area.push_attribute(("bottom", rect.end_row.to_string().as_str()));
            area.push_attribute(("right", rect.end_col.to_string().as_str()));
            if let Some(description) = &range.description {
                area.push_attribute(("description", description.as_str()));
            }
            writer.write_event(Event::Empty(area)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("areaname")))
            .map_err(xml_err)?;
    }

    // Map of tables
    let mut map = BytesStart::new("map");
    map.push_attribute(("active", workbook.active_sheet_index().to_string().as_str()));
    writer.write_event(Event::Start(map)).map_err(xml_err)?;

    for sheet in workbook.sheets() {
        write_table(&mut writer, sheet)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("map")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("spreadsheet")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| IoError::Malformed(format!("non-utf8 output: {}", e)))
}

fn write_table(writer: &mut Writer<Vec<u8>>, sheet: &Sheet) -> Result<(), IoError> {
    let mut table = BytesStart::new("table");
    table.push_attribute(("name", sheet.name.as_str()));
    table.push_attribute((
        "direction",
        match sheet.direction {
            LayoutDirection::LeftToRight => "ltr",
            LayoutDirection::RightToLeft => "rtl",
        },
    ));
    table.push_attribute(("protected", if sheet.protected { "true" } else { "false" }));
    writer.write_event(Event::Start(table)).map_err(xml_err)?;

    // Row formats, sorted for stable output
    let mut row_formats: Vec<(usize, &RowFormat)> = sheet.row_formats_iter().collect();
    row_formats.sort_by_key(|(idx, _)| *idx);
    for (idx, format) in row_formats {
        let mut row = BytesStart::new("row");
        row.push_attribute(("index", idx.to_string().as_str()));
        row.push_attribute(("height", format.height.to_string().as_str()));
        if let Some(cell_format) = &format.format {
            push_format_attrs(&mut row, cell_format);
        }
        writer.write_event(Event::Empty(row)).map_err(xml_err)?;
    }

    // Column formats
    let mut col_formats: Vec<(usize, &ColFormat)> = sheet.col_formats_iter().collect();
    col_formats.sort_by_key(|(idx, _)| *idx);
    for (idx, format) in col_formats {
        let mut col = BytesStart::new("column");
        col.push_attribute(("index", idx.to_string().as_str()));
        col.push_attribute(("width", format.width.to_string().as_str()));
        if let Some(cell_format) = &format.format {
            push_format_attrs(&mut col, cell_format);
        }
        writer.write_event(Event::Empty(col)).map_err(xml_err)?;
    }

    // Cells, sorted row-major. Obscured shells carry no content of their
    // own; the <merge> elements rebuild them on load.
    let mut cells: Vec<(&(usize, usize), &tabula_engine::cell::Cell)> =
        sheet.cells_iter().collect();
    cells.sort_by_key(|((row, col), _)| (*row, *col));

    for ((row, col), cell) in cells {
        if cell.is_obscured() && cell.format == CellFormat::default() {
            continue;
        }
        let raw = cell.content.raw_display();
        if raw.is_empty() && cell.format == CellFormat::default() && !cell.is_merge_anchor() {
            continue;
        }

        let mut elem = BytesStart::new("cell");
        elem.push_attribute(("row", row.to_string().as_str()));
        elem.push_attribute(("column", col.to_string().as_str()));
        push_format_attrs(&mut elem, &cell.format);

        if raw.is_empty() {
            writer.write_event(Event::Empty(elem)).map_err(xml_err)?;
        } else {
            writer.write_event(Event::Start(elem)).map_err(xml_err)?;
            writer.write_event(Event::Text(BytesText::new(&raw))).map_err(xml_err)?;
            writer.write_event(Event::End(BytesEnd::new("cell"))).map_err(xml_err)?;
        }
    }

    // Merged regions
    for region in sheet.merged_regions() {
        let mut merge = BytesStart::new("merge");
        merge.push_attribute(("row", region.start_row.to_string().as_str()));
        merge.push_attribute(("column", region.start_col.to_string().as_str()));
        merge.push_attribute(("rows", region.rows().to_string().as_str()));
        merge.push_attribute(("columns", region.cols().to_string().as_str()));
        writer.write_event(Event::Empty(merge)).map_err(xml_err)?;
    }

    writer.write_event(Event::End(BytesEnd::new("table"))).map_err(xml_err)?;
    Ok(())
}

fn push_format_attrs(elem: &mut BytesStart, format: &CellFormat) {
    if format.bold {
        elem.push_attribute(("bold", "true"));
    }
    if format.italic {
        elem.push_attribute(("italic", "true"));
    }
    if format.underline {
        elem.push_attribute(("underline", "true"));
    }
    if format.strikethrough {
        elem.push_attribute(("strikethrough", "true"));
    }
    match format.alignment {
        Alignment::Left => {}
        Alignment::Center => elem.push_attribute(("align", "center")),
        Alignment::Right => elem.push_attribute(("align", "right")),
    }
    match format.vertical_alignment {
        VerticalAlignment::Middle => {}
        VerticalAlignment::Top => elem.push_attribute(("valign", "top")),
        VerticalAlignment::Bottom => elem.push_attribute(("valign", "bottom")),
    }
    match format.number_format {
        NumberFormat::General => {}
        NumberFormat::Number { decimals } => {
            elem.push_attribute(("format", "number"));
            elem.push_attribute(("decimals", decimals.to_string().as_str()));
        }
        NumberFormat::Currency { decimals } => {
            elem.push_attribute(("format", "currency"));
            elem.push_attribute(("decimals", decimals.to_string().as_str()));
        }
        NumberFormat::Percent { decimals } => {
            elem.push_attribute(("format", "percent"));
            elem.push_attribute(("decimals", decimals.to_string().as_str()));
        }
    }
    if let Some(font) = &format.font_family {
        elem.push_attribute(("font", font.as_str()));
    }
}

// =============================================================================
// Load
// =============================================================================

pub fn load<F>(path: &Path, gate: F) -> Result<Document, IoError>
where
    F: Fn(u32, u32) -> VersionDecision,
{
    let xml = std::fs::read_to_string(path)?;
    let doc = load_from_str(&xml, gate)?;
    tracing::info!("loaded document from {}", path.display());
    Ok(doc)
}

/// Parse a document. The version gate is consulted only when the file's
/// syntax version is newer than this build supports.
pub fn load_from_str<F>(xml: &str, gate: F) -> Result<Document, IoError>
where
    F: Fn(u32, u32) -> VersionDecision,
{
    let mut reader = Reader::from_str(xml);
    // Inter-element indentation arrives as text events only where no cell is
    // open, so the `pending_cell` guard already discards it. Trimming is left
    // off so that whitespace inside a cell's text — which quick-xml now splits
    // into multiple events around entity references — is preserved verbatim.
    let mut buf = Vec::new();

    let mut saw_root = false;
    let mut settings = DocumentSettings::default();
    let mut named_ranges: Vec<NamedRange> = Vec::new();
    let mut active_sheet: usize = 0;
    let mut sheets: Vec<Sheet> = Vec::new();

    // Per-<cell> state
    let mut pending_cell: Option<(usize, usize, CellFormat)> = None;
    let mut pending_text: Option<String> = None;
    // Merges are applied after the table's cells are all in place
    let mut pending_merges: Vec<GridRect> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) if e.name().as_ref() == b"spreadsheet" => {
                saw_root = true;
                let mime = attr_string(e, b"mime").unwrap_or_default();
                if mime != MIME_TYPE {
                    return Err(IoError::MimeMismatch {
                        expected: MIME_TYPE.to_string(),
                        found: mime,
                    });
                }
                let found: u32 = attr_parse(e, b"syntaxVersion").unwrap_or(1);
                if found > SYNTAX_VERSION {
                    match gate(found, SYNTAX_VERSION) {
                        VersionDecision::Proceed => {
                            tracing::warn!(
                                "document syntax version {} is newer than supported {}; \
                                 unknown constructs will be skipped",
                                found,
                                SYNTAX_VERSION
                            );
                        }
                        VersionDecision::Abort => {
                            return Err(IoError::VersionRejected {
                                found,
                                supported: SYNTAX_VERSION,
                            });
                        }
                    }
                }
            }

            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e)) if e.name().as_ref() == b"locale" => {
                if let Some(language) = attr_string(e, b"language") {
                    settings.locale = Locale { language };
                }
            }

            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"area" => {
                if let Some(range) = parse_area(e) {
                    named_ranges.push(range);
                }
            }

            Ok(Event::Start(ref e)) if e.name().as_ref() == b"map" => {
                active_sheet = attr_parse(e, b"active").unwrap_or(0);
            }

            Ok(Event::Start(ref e)) if e.name().as_ref() == b"table" => {
                let name = attr_string(e, b"name")
                    .unwrap_or_else(|| format!("Sheet{}", sheets.len() + 1));
                let id = SheetId::from_raw(sheets.len() as u64 + 1);
                let mut sheet = Sheet::new_with_name(id, MAX_ROWS, MAX_COLS, &name);
                if attr_string(e, b"direction").as_deref() == Some("rtl") {
                    sheet.direction = LayoutDirection::RightToLeft;
                }
                sheet.protected = attr_string(e, b"protected").as_deref() == Some("true");
                sheets.push(sheet);
                pending_merges.clear();
            }

            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"row" => {
                if let (Some(sheet), Some(index)) = (sheets.last_mut(), attr_parse::<usize>(e, b"index")) {
                    let height = attr_parse::<f32>(e, b"height")
                        .unwrap_or(tabula_engine::sheet::DEFAULT_ROW_HEIGHT);
                    sheet.set_row_format(
                        index,
                        RowFormat {
                            height,
                            format: parse_format_attrs_opt(e),
                        },
                    );
                }
            }

            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"column" => {
                if let (Some(sheet), Some(index)) = (sheets.last_mut(), attr_parse::<usize>(e, b"index")) {
                    let width = attr_parse::<f32>(e, b"width")
                        .unwrap_or(tabula_engine::sheet::DEFAULT_COL_WIDTH);
                    sheet.set_col_format(
                        index,
                        ColFormat {
                            width,
                            format: parse_format_attrs_opt(e),
                        },
                    );
                }
            }

            Ok(Event::Start(ref e)) if e.name().as_ref() == b"cell" => {
                let row = attr_parse::<usize>(e, b"row");
                let col = attr_parse::<usize>(e, b"column");
                if let (Some(row), Some(col)) = (row, col) {
                    pending_cell = Some((row, col, parse_format_attrs(e)));
                    pending_text = None;
                }
            }

            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"cell" => {
                // Format-only cell
                let row = attr_parse::<usize>(e, b"row");
                let col = attr_parse::<usize>(e, b"column");
                if let (Some(sheet), Some(row), Some(col)) = (sheets.last_mut(), row, col) {
                    sheet.set_format(row, col, parse_format_attrs(e));
                }
            }

            Ok(Event::Text(ref e)) if pending_cell.is_some() => {
                let text = e
                    .xml_content()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(e.as_ref()).to_string());
                pending_text.get_or_insert_with(String::new).push_str(&text);
            }

            // quick-xml reports entity references as standalone events, splitting
            // a cell's text run; resolve each one and append it so the original
            // string is reconstructed intact.
            Ok(Event::GeneralRef(ref e)) if pending_cell.is_some() => {
                let acc = pending_text.get_or_insert_with(String::new);
                if let Ok(Some(c)) = e.resolve_char_ref() {
                    acc.push(c);
                } else if let Ok(name) = e.decode() {
                    if let Some(resolved) = resolve_predefined_entity(&name) {
                        acc.push_str(resolved);
                    }
                }
            }

            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"merge" => {
                let row = attr_parse::<usize>(e, b"row").unwrap_or(0);
                let col = attr_parse::<usize>(e, b"column").unwrap_or(0);
                let rows = attr_parse::<usize>(e, b"rows").unwrap_or(1);
                let cols = attr_parse::<usize>(e, b"columns").unwrap_or(1);
                if rows * cols > 1 {
                    pending_merges.push(GridRect::new(
                        (row, col),
                        (row + rows - 1, col + cols - 1),
                    ));
                }
            }

            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"cell" => {
                    if let (Some(sheet), Some((row, col, format))) =
                        (sheets.last_mut(), pending_cell.take())
                    {
                        if let Some(text) = pending_text.take() {
                            sheet.set_text(row, col, &text);
                        }
                        if format != CellFormat::default() {
                            sheet.set_format(row, col, format);
                        }
                    }
                }
                b"table" => {
                    if let Some(sheet) = sheets.last_mut() {
                        for rect in pending_merges.drain(..) {
                            if let Err(reason) = sheet.merge_cells(&rect) {
                                tracing::warn!("skipping merge region: {}", reason);
                            }
                        }
                    }
                }
                _ => {}
            },

            Ok(Event::Eof) => break,
            Err(e) => return Err(IoError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(IoError::Malformed("missing <spreadsheet> root".to_string()));
    }
    if sheets.is_empty() {
        return Err(IoError::Malformed("document has no tables".to_string()));
    }

    let mut workbook = Workbook::from_sheets(sheets, active_sheet);
    for range in named_ranges {
        let name = range.name.clone();
        if let Err(reason) = workbook.named_ranges_mut().set(range) {
            tracing::warn!("skipping named range '{}': {}", name, reason);
        }
    }

    // Assemble into a fresh document: dependency graph and caches settle
    // here, before the caller ever sees the result.
    Ok(Document::from_parts(workbook, settings))
}

fn parse_area(e: &BytesStart) -> Option<NamedRange> {
    let name = attr_string(e, b"name")?;
    let table = attr_string(e, b"table")?;
    let top = attr_parse::<usize>(e, b"top")?;
    let left = attr_parse::<usize>(e, b"left")?;
    let bottom = attr_parse::<usize>(e, b"bottom").unwrap_or(top);
    let right = attr_parse::<usize>(e, b"right").unwrap_or(left);

    let mut range = if top == bottom && left == right {
        NamedRange::cell(name, table, top, left)
    } else {
        NamedRange {
            name,
            target: NamedRangeTarget::Range {
                sheet: table,
                rect: GridRect::new((top, left), (bottom, right)),
            },
            description: None,
        }
    };
    range.description = attr_string(e, b"description");
    Some(range)
}

fn parse_format_attrs(e: &BytesStart) -> CellFormat {
    let mut format = CellFormat::default();
    format.bold = attr_string(e, b"bold").as_deref() == Some("true");
    format.italic = attr_string(e, b"italic").as_deref() == Some("true");
    format.underline = attr_string(e, b"underline").as_deref() == Some("true");
    format.strikethrough = attr_string(e, b"strikethrough").as_deref() == Some("true");
    format.alignment = match attr_string(e, b"align").as_deref() {
        Some("center") => Alignment::Center,
        Some("right") => Alignment::Right,
        _ => Alignment::Left,
    };
    format.vertical_alignment = match attr_string(e, b"valign").as_deref() {
        Some("top") => VerticalAlignment::Top,
        Some("bottom") => VerticalAlignment::Bottom,
        _ => VerticalAlignment::Middle,
    };
    let decimals = attr_parse::<u8>(e, b"decimals").unwrap_or(2);
    format.number_format = match attr_string(e, b"format").as_deref() {
        Some("number") => NumberFormat::Number { decimals },
        Some("currency") => NumberFormat::Currency { decimals },
        Some("percent") => NumberFormat::Percent { decimals },
        _ => NumberFormat::General,
    };
    format.font_family = attr_string(e, b"font");
    format
}

fn parse_format_attrs_opt(e: &BytesStart) -> Option<CellFormat> {
    let format = parse_format_attrs(e);
    if format == CellFormat::default() {
        None
    } else {
        Some(format)
    }
}

fn attr_string(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.as_ref() == name {
            Some(
                attr.unescape_value()
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string()),
            )
        } else {
            None
        }
    })
}

fn attr_parse<T: std::str::FromStr>(e: &BytesStart, name: &[u8]) -> Option<T> {
    attr_string(e, name)?.parse().ok()
}
