use serde::{Deserialize, Serialize};

use super::formula::eval::Value;
use super::formula::parser::{self, ParsedExpr};

/// Horizontal text alignment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub enum Alignment {
    #[default]
    Left,
    Center,
    Right,
}

/// Vertical text alignment
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub enum VerticalAlignment {
    Top,
    #[default]
    Middle,
    Bottom,
}

/// Number format type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub enum NumberFormat {
    #[default]
    General,
    Number { decimals: u8 },
    Currency { decimals: u8 },
    Percent { decimals: u8 },
}

/// Cell formatting options
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CellFormat {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub alignment: Alignment,
    pub vertical_alignment: VerticalAlignment,
    pub number_format: NumberFormat,
    pub font_family: Option<String>, // None = inherit from settings
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum CellContent {
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Formula {
        source: String,
        #[serde(skip)]
        ast: Option<ParsedExpr>,
    },
}

impl Default for CellContent {
    fn default() -> Self {
        CellContent::Empty
    }
}

impl CellContent {
    /// Classify raw input the way the cell editor commits it.
    ///
    /// A leading `=` makes a formula; an unparseable formula keeps its raw
    /// source with no AST and surfaces an error at evaluation time rather
    /// than rejecting the edit.
    pub fn from_input(input: &str) -> Self {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return CellContent::Empty;
        }

        if trimmed.starts_with('=') {
            let ast = parser::parse(trimmed).ok();
            return CellContent::Formula {
                source: trimmed.to_string(),
                ast,
            };
        }

        if trimmed.eq_ignore_ascii_case("true") {
            return CellContent::Boolean(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return CellContent::Boolean(false);
        }

        if let Ok(num) = trimmed.parse::<f64>() {
            return CellContent::Number(num);
        }

        CellContent::Text(trimmed.to_string())
    }

    /// The raw text as the user would see it in the edit line.
    pub fn raw_display(&self) -> String {
        match self {
            CellContent::Empty => String::new(),
            CellContent::Text(s) => s.clone(),
            CellContent::Boolean(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            CellContent::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            CellContent::Formula { source, .. } => source.clone(),
        }
    }

    /// The literal value of a non-formula cell. Formulas yield Empty here;
    /// their value comes from the recalculation cache.
    pub fn literal_value(&self) -> Value {
        match self {
            CellContent::Empty => Value::Empty,
            CellContent::Number(n) => Value::Number(*n),
            CellContent::Text(s) => Value::Text(s.clone()),
            CellContent::Boolean(b) => Value::Boolean(*b),
            CellContent::Formula { .. } => Value::Empty,
        }
    }

    pub fn formula_ast(&self) -> Option<&ParsedExpr> {
        match self {
            CellContent::Formula { ast, .. } => ast.as_ref(),
            _ => None,
        }
    }

    pub fn is_formula(&self) -> bool {
        matches!(self, CellContent::Formula { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellContent::Empty)
    }

    /// Format a number according to the specified format
    pub fn format_number(n: f64, format: &NumberFormat) -> String {
        match format {
            NumberFormat::General => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", n as i64)
                } else {
                    format!("{}", n)
                }
            }
            NumberFormat::Number { decimals } => {
                format!("{:.*}", *decimals as usize, n)
            }
            NumberFormat::Currency { decimals } => {
                if n < 0.0 {
                    format!("-${:.*}", *decimals as usize, n.abs())
                } else {
                    format!("${:.*}", *decimals as usize, n)
                }
            }
            NumberFormat::Percent { decimals } => {
                format!("{:.*}%", *decimals as usize, n * 100.0)
            }
        }
    }
}

/// Extent of a merged region, anchored at the cell carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSpan {
    pub rows: usize,
    pub cols: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Cell {
    pub content: CellContent,
    pub format: CellFormat,
    /// Set on the anchor (top-left) cell of a merged region.
    pub merge: Option<MergeSpan>,
    /// Set on every non-anchor cell of a merged region; points at the anchor.
    pub merged_into: Option<(usize, usize)>,
    /// Result of the last completed recalculation pass.
    #[serde(skip)]
    pub computed: Value,
    /// True when `computed` is stale relative to `content`.
    #[serde(skip)]
    pub calc_dirty: bool,
}

impl Cell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, input: &str) {
        self.content = CellContent::from_input(input);
        self.calc_dirty = true;
    }

    /// True for a cell that carries no persistent state and need not be
    /// materialized in the sheet's cell map.
    pub fn is_default(&self) -> bool {
        self.content.is_empty()
            && self.format == CellFormat::default()
            && self.merge.is_none()
            && self.merged_into.is_none()
    }

    pub fn is_merge_anchor(&self) -> bool {
        self.merge.is_some()
    }

    pub fn is_obscured(&self) -> bool {
        self.merged_into.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::eval::CellError;

    #[test]
    fn test_from_input_classification() {
        assert_eq!(CellContent::from_input(""), CellContent::Empty);
        assert_eq!(CellContent::from_input("   "), CellContent::Empty);
        assert_eq!(CellContent::from_input("42"), CellContent::Number(42.0));
        assert_eq!(CellContent::from_input("-3.5"), CellContent::Number(-3.5));
        assert_eq!(
            CellContent::from_input("hello"),
            CellContent::Text("hello".to_string())
        );
        assert_eq!(CellContent::from_input("TRUE"), CellContent::Boolean(true));
        assert_eq!(CellContent::from_input("false"), CellContent::Boolean(false));
    }

    #[test]
    fn test_from_input_formula() {
        match CellContent::from_input("=A1+1") {
            CellContent::Formula { source, ast } => {
                assert_eq!(source, "=A1+1");
                assert!(ast.is_some());
            }
            other => panic!("expected formula, got {:?}", other),
        }
    }

    #[test]
    fn test_unparseable_formula_kept_as_source() {
        // Commit succeeds; the error surfaces at evaluation time.
        match CellContent::from_input("=SUM(") {
            CellContent::Formula { source, ast } => {
                assert_eq!(source, "=SUM(");
                assert!(ast.is_none());
            }
            other => panic!("expected formula, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_display_round_trip() {
        assert_eq!(CellContent::from_input("42").raw_display(), "42");
        assert_eq!(CellContent::from_input("x").raw_display(), "x");
        assert_eq!(CellContent::from_input("=A1").raw_display(), "=A1");
        assert_eq!(CellContent::from_input("TRUE").raw_display(), "TRUE");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(CellContent::format_number(3.0, &NumberFormat::General), "3");
        assert_eq!(
            CellContent::format_number(3.25, &NumberFormat::Number { decimals: 1 }),
            "3.2"
        );
        assert_eq!(
            CellContent::format_number(1234.5, &NumberFormat::Currency { decimals: 2 }),
            "$1234.50"
        );
        assert_eq!(
            CellContent::format_number(-2.0, &NumberFormat::Currency { decimals: 0 }),
            "-$2"
        );
        assert_eq!(
            CellContent::format_number(0.15, &NumberFormat::Percent { decimals: 0 }),
            "15%"
        );
    }

    #[test]
    fn test_cell_set_marks_dirty() {
        let mut cell = Cell::new();
        assert!(!cell.calc_dirty);
        cell.set("5");
        assert!(cell.calc_dirty);
        assert_eq!(cell.content, CellContent::Number(5.0));
    }

    #[test]
    fn test_cell_format_serde_round_trip() {
        let mut format = CellFormat::default();
        format.bold = true;
        format.alignment = Alignment::Right;
        format.number_format = NumberFormat::Percent { decimals: 1 };

        let json = serde_json::to_string(&format).unwrap();
        let back: CellFormat = serde_json::from_str(&json).unwrap();
        assert_eq!(format, back);
    }

    #[test]
    fn test_default_cell_detection() {
        let mut cell = Cell::new();
        assert!(cell.is_default());
        cell.format.bold = true;
        assert!(!cell.is_default());

        let mut cell = Cell::new();
        cell.merged_into = Some((0, 0));
        assert!(!cell.is_default());

        // A stale error cache alone does not make a cell persistent
        let mut cell = Cell::new();
        cell.computed = Value::Error(CellError::Value);
        assert!(cell.is_default());
    }
}
