// Formula evaluator - evaluates bound expressions (after sheet name resolution)

use std::fmt;

use crate::sheet::{SheetId, SheetRef};

use super::funcs;
use super::parser::{BoundExpr, Expr, Op};

/// Typed formula error. Stored as a cell's value, never thrown; propagates
/// through dependent formulas like any other value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellError {
    /// Division by zero
    Div0,
    /// Type mismatch or unusable operand
    Value,
    /// Unknown function or named range
    Name,
    /// Invalidated reference (deleted row/column/sheet)
    Ref,
    /// Circular reference
    Cycle,
}

impl CellError {
    pub fn code(&self) -> &'static str {
        match self {
            CellError::Div0 => "#DIV/0!",
            CellError::Value => "#VALUE!",
            CellError::Name => "#NAME?",
            CellError::Ref => "#REF!",
            CellError::Cycle => "#CYCLE!",
        }
    }

    pub fn from_code(code: &str) -> Option<CellError> {
        match code {
            "#DIV/0!" => Some(CellError::Div0),
            "#VALUE!" => Some(CellError::Value),
            "#NAME?" => Some(CellError::Name),
            "#REF!" => Some(CellError::Ref),
            "#CYCLE!" => Some(CellError::Cycle),
            _ => None,
        }
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of resolving a named range
#[derive(Debug, Clone)]
pub enum NamedRangeResolution {
    Cell {
        sheet: SheetId,
        row: usize,
        col: usize,
    },
    Range {
        sheet: SheetId,
        start_row: usize,
        start_col: usize,
        end_row: usize,
        end_col: usize,
    },
}

/// Data access seam for formula evaluation.
///
/// Same-sheet lookups read the current sheet; cross-sheet lookups default to
/// #REF! so a bare sheet can still evaluate its own formulas.
pub trait CellLookup {
    /// The settled value of a cell on the current sheet (cache of the last
    /// completed recalculation pass for formula cells).
    fn cell_value(&self, row: usize, col: usize) -> Value;

    fn cell_value_sheet(&self, _sheet: SheetId, _row: usize, _col: usize) -> Value {
        Value::Error(CellError::Ref)
    }

    fn resolve_named_range(&self, _name: &str) -> Option<NamedRangeResolution> {
        None
    }

    /// The cell being evaluated (for ROW()/COLUMN() without arguments).
    fn current_cell(&self) -> Option<(usize, usize)> {
        None
    }
}

// =============================================================================
// Value: The scalar primitive for all cell values
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Error(CellError),
}

impl Default for Value {
    fn default() -> Self {
        Value::Empty
    }
}

impl Value {
    pub fn to_number(&self) -> Result<f64, CellError> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) if s.trim().is_empty() => Ok(0.0),
            Value::Text(s) => s.trim().parse::<f64>().map_err(|_| CellError::Value),
            Value::Empty => Ok(0.0),
            Value::Error(e) => Err(*e),
        }
    }

    pub fn to_bool(&self) -> Result<bool, CellError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            Value::Number(n) => Ok(*n != 0.0),
            Value::Text(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::Text(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            Value::Text(_) => Err(CellError::Value),
            Value::Empty => Ok(false),
            Value::Error(e) => Err(*e),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Value::Empty => String::new(),
            Value::Text(s) => s.clone(),
            Value::Boolean(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Error(e) => e.code().to_string(),
        }
    }

    pub fn as_error(&self) -> Option<CellError> {
        match self {
            Value::Error(e) => Some(*e),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

/// An evaluated argument: either a scalar or a flattened range.
#[derive(Debug, Clone)]
pub enum Operand {
    Scalar(Value),
    Range(Vec<Value>),
}

impl Operand {
    /// Coerce to a scalar. A multi-cell range has no scalar meaning here.
    pub fn into_scalar(self) -> Value {
        match self {
            Operand::Scalar(v) => v,
            Operand::Range(mut values) => {
                if values.len() == 1 {
                    values.pop().unwrap()
                } else {
                    Value::Error(CellError::Value)
                }
            }
        }
    }
}

/// Evaluate a bound expression to a scalar value.
pub fn evaluate(expr: &BoundExpr, lookup: &dyn CellLookup) -> Value {
    eval_operand(expr, lookup).into_scalar()
}

pub fn eval_operand(expr: &BoundExpr, lookup: &dyn CellLookup) -> Operand {
    match expr {
        Expr::Number(n) => Operand::Scalar(Value::Number(*n)),
        Expr::Text(s) => Operand::Scalar(Value::Text(s.clone())),
        Expr::Boolean(b) => Operand::Scalar(Value::Boolean(*b)),
        Expr::Empty => Operand::Scalar(Value::Empty),
        Expr::RefError => Operand::Scalar(Value::Error(CellError::Ref)),

        Expr::CellRef { sheet, row, col, .. } => Operand::Scalar(match sheet {
            SheetRef::Current => lookup.cell_value(*row, *col),
            SheetRef::Id(id) => lookup.cell_value_sheet(*id, *row, *col),
            SheetRef::RefError { .. } => Value::Error(CellError::Ref),
        }),

        Expr::Range {
            sheet,
            start_row,
            start_col,
            end_row,
            end_col,
            ..
        } => {
            let (r1, r2) = (*start_row.min(end_row), *start_row.max(end_row));
            let (c1, c2) = (*start_col.min(end_col), *start_col.max(end_col));
            let mut values = Vec::with_capacity((r2 - r1 + 1) * (c2 - c1 + 1));
            match sheet {
                SheetRef::Current => {
                    for row in r1..=r2 {
                        for col in c1..=c2 {
                            values.push(lookup.cell_value(row, col));
                        }
                    }
                }
                SheetRef::Id(id) => {
                    for row in r1..=r2 {
                        for col in c1..=c2 {
                            values.push(lookup.cell_value_sheet(*id, row, col));
                        }
                    }
                }
                SheetRef::RefError { .. } => {
                    return Operand::Scalar(Value::Error(CellError::Ref));
                }
            }
            Operand::Range(values)
        }

        Expr::NamedRange(name) => match lookup.resolve_named_range(name) {
            Some(NamedRangeResolution::Cell { sheet, row, col }) => {
                Operand::Scalar(lookup.cell_value_sheet(sheet, row, col))
            }
            Some(NamedRangeResolution::Range {
                sheet,
                start_row,
                start_col,
                end_row,
                end_col,
            }) => {
                let mut values =
                    Vec::with_capacity((end_row - start_row + 1) * (end_col - start_col + 1));
                for row in start_row..=end_row {
                    for col in start_col..=end_col {
                        values.push(lookup.cell_value_sheet(sheet, row, col));
                    }
                }
                Operand::Range(values)
            }
            None => Operand::Scalar(Value::Error(CellError::Name)),
        },

        Expr::Function { name, args } => eval_function(name, args, lookup),

        Expr::BinaryOp { op, left, right } => {
            let l = eval_operand(left, lookup).into_scalar();
            let r = eval_operand(right, lookup).into_scalar();
            Operand::Scalar(apply_binary(*op, l, r))
        }
    }
}

fn eval_function(name: &str, args: &[BoundExpr], lookup: &dyn CellLookup) -> Operand {
    // IF is lazy in its branches: only the taken branch is evaluated, so an
    // error in the dead branch does not poison the result.
    if name == "IF" {
        if args.len() < 2 || args.len() > 3 {
            return Operand::Scalar(Value::Error(CellError::Value));
        }
        let cond = eval_operand(&args[0], lookup).into_scalar();
        let taken = match cond.to_bool() {
            Ok(b) => b,
            Err(e) => return Operand::Scalar(Value::Error(e)),
        };
        let branch = if taken { args.get(1) } else { args.get(2) };
        return match branch {
            Some(expr) => Operand::Scalar(eval_operand(expr, lookup).into_scalar()),
            // =IF(cond, a) with a false condition
            None => Operand::Scalar(Value::Boolean(false)),
        };
    }

    // ROW/COLUMN read the reference itself, not its value.
    if name == "ROW" || name == "COLUMN" {
        let pos = match args.first() {
            Some(Expr::CellRef { row, col, .. }) => Some((*row, *col)),
            Some(_) => return Operand::Scalar(Value::Error(CellError::Value)),
            None => lookup.current_cell(),
        };
        return Operand::Scalar(match pos {
            Some((row, col)) => {
                let idx = if name == "ROW" { row } else { col };
                Value::Number((idx + 1) as f64)
            }
            None => Value::Error(CellError::Value),
        });
    }

    let evaluated: Vec<Operand> = args.iter().map(|a| eval_operand(a, lookup)).collect();
    Operand::Scalar(funcs::call(name, &evaluated))
}

fn apply_binary(op: Op, l: Value, r: Value) -> Value {
    if let Some(e) = l.as_error() {
        return Value::Error(e);
    }
    if let Some(e) = r.as_error() {
        return Value::Error(e);
    }

    match op {
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => {
            let a = match l.to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let b = match r.to_number() {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            match op {
                Op::Add => Value::Number(a + b),
                Op::Sub => Value::Number(a - b),
                Op::Mul => Value::Number(a * b),
                Op::Div => {
                    if b == 0.0 {
                        Value::Error(CellError::Div0)
                    } else {
                        Value::Number(a / b)
                    }
                }
                Op::Pow => Value::Number(a.powf(b)),
                _ => unreachable!(),
            }
        }
        Op::Concat => Value::Text(format!("{}{}", l.to_text(), r.to_text())),
        Op::Lt | Op::Gt | Op::Eq | Op::LtEq | Op::GtEq | Op::NotEq => {
            let ord = compare_values(&l, &r);
            let result = match op {
                Op::Lt => ord == std::cmp::Ordering::Less,
                Op::Gt => ord == std::cmp::Ordering::Greater,
                Op::Eq => ord == std::cmp::Ordering::Equal,
                Op::LtEq => ord != std::cmp::Ordering::Greater,
                Op::GtEq => ord != std::cmp::Ordering::Less,
                Op::NotEq => ord != std::cmp::Ordering::Equal,
                _ => unreachable!(),
            };
            Value::Boolean(result)
        }
    }
}

/// Total order over scalar values for comparison operators.
///
/// Numbers sort before text, text before booleans; text comparison is
/// case-insensitive; Empty coerces to 0 against numbers and "" against text.
fn compare_values(l: &Value, r: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Empty => 0,
            Value::Number(_) => 0,
            Value::Text(_) => 1,
            Value::Boolean(_) => 2,
            Value::Error(_) => 3,
        }
    }

    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Text(a), Value::Text(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
        (Value::Empty, Value::Number(b)) => 0.0f64.partial_cmp(b).unwrap_or(Ordering::Equal),
        (Value::Number(a), Value::Empty) => a.partial_cmp(&0.0).unwrap_or(Ordering::Equal),
        (Value::Empty, Value::Text(b)) => "".cmp(&b.to_lowercase()),
        (Value::Text(a), Value::Empty) => a.to_lowercase().as_str().cmp(""),
        (Value::Empty, Value::Empty) => Ordering::Equal,
        _ => rank(l).cmp(&rank(r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::{bind_expr, parse};
    use rustc_hash::FxHashMap;

    /// Minimal in-memory lookup for evaluator tests.
    struct GridLookup {
        cells: FxHashMap<(usize, usize), Value>,
    }

    impl GridLookup {
        fn new() -> Self {
            Self {
                cells: FxHashMap::default(),
            }
        }

        fn with(mut self, row: usize, col: usize, value: Value) -> Self {
            self.cells.insert((row, col), value);
            self
        }
    }

    impl CellLookup for GridLookup {
        fn cell_value(&self, row: usize, col: usize) -> Value {
            self.cells.get(&(row, col)).cloned().unwrap_or(Value::Empty)
        }
    }

    fn eval_str(formula: &str, lookup: &GridLookup) -> Value {
        let parsed = parse(formula).unwrap();
        let bound = bind_expr(&parsed, |_| None);
        evaluate(&bound, lookup)
    }

    #[test]
    fn test_arithmetic() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=1+2*3", &lookup), Value::Number(7.0));
        assert_eq!(eval_str("=(1+2)*3", &lookup), Value::Number(9.0));
        assert_eq!(eval_str("=2^10", &lookup), Value::Number(1024.0));
        assert_eq!(eval_str("=50%", &lookup), Value::Number(0.5));
    }

    #[test]
    fn test_division_by_zero() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=1/0", &lookup), Value::Error(CellError::Div0));
    }

    #[test]
    fn test_cell_reference() {
        let lookup = GridLookup::new().with(0, 0, Value::Number(5.0));
        assert_eq!(eval_str("=A1+1", &lookup), Value::Number(6.0));
    }

    #[test]
    fn test_empty_cell_is_zero_in_arithmetic() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=A1+1", &lookup), Value::Number(1.0));
    }

    #[test]
    fn test_error_contagion_through_operators() {
        let lookup = GridLookup::new().with(0, 0, Value::Error(CellError::Div0));
        assert_eq!(eval_str("=A1+1", &lookup), Value::Error(CellError::Div0));
        assert_eq!(eval_str("=A1&\"x\"", &lookup), Value::Error(CellError::Div0));
    }

    #[test]
    fn test_ref_error_literal_evaluates_to_ref() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=#REF!", &lookup), Value::Error(CellError::Ref));
        assert_eq!(eval_str("=#REF!+1", &lookup), Value::Error(CellError::Ref));
    }

    #[test]
    fn test_unknown_sheet_is_ref_error() {
        let lookup = GridLookup::new();
        assert_eq!(
            eval_str("=Missing!A1", &lookup),
            Value::Error(CellError::Ref)
        );
    }

    #[test]
    fn test_unknown_named_range_is_name_error() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=Revenue", &lookup), Value::Error(CellError::Name));
    }

    #[test]
    fn test_comparisons() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=1<2", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=2<=2", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=1<>2", &lookup), Value::Boolean(true));
        assert_eq!(eval_str("=\"abc\"=\"ABC\"", &lookup), Value::Boolean(true));
    }

    #[test]
    fn test_concat() {
        let lookup = GridLookup::new().with(0, 0, Value::Number(3.0));
        assert_eq!(
            eval_str("=\"n=\"&A1", &lookup),
            Value::Text("n=3".to_string())
        );
    }

    #[test]
    fn test_if_is_lazy() {
        // The dead branch's error must not poison the result
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=IF(TRUE,1,1/0)", &lookup), Value::Number(1.0));
        assert_eq!(
            eval_str("=IF(FALSE,1,1/0)", &lookup),
            Value::Error(CellError::Div0)
        );
    }

    #[test]
    fn test_if_condition_error_propagates() {
        let lookup = GridLookup::new();
        assert_eq!(
            eval_str("=IF(1/0,1,2)", &lookup),
            Value::Error(CellError::Div0)
        );
    }

    #[test]
    fn test_row_column_of_reference() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=ROW(B5)", &lookup), Value::Number(5.0));
        assert_eq!(eval_str("=COLUMN(B5)", &lookup), Value::Number(2.0));
    }

    #[test]
    fn test_bare_multi_cell_range_is_value_error() {
        let lookup = GridLookup::new();
        assert_eq!(eval_str("=A1:B2", &lookup), Value::Error(CellError::Value));
    }

    #[test]
    fn test_sum_over_range() {
        let lookup = GridLookup::new()
            .with(0, 0, Value::Number(1.0))
            .with(1, 0, Value::Number(2.0))
            .with(2, 0, Value::Number(3.0));
        assert_eq!(eval_str("=SUM(A1:A3)", &lookup), Value::Number(6.0));
    }

    #[test]
    fn test_error_contagion_through_aggregate() {
        let lookup = GridLookup::new()
            .with(0, 0, Value::Number(1.0))
            .with(1, 0, Value::Error(CellError::Ref));
        assert_eq!(
            eval_str("=SUM(A1:A3)", &lookup),
            Value::Error(CellError::Ref)
        );
    }

    #[test]
    fn test_value_coercions() {
        assert_eq!(Value::Text(" 4 ".to_string()).to_number(), Ok(4.0));
        assert_eq!(Value::Empty.to_number(), Ok(0.0));
        assert_eq!(Value::Boolean(true).to_number(), Ok(1.0));
        assert!(Value::Text("abc".to_string()).to_number().is_err());
        assert_eq!(Value::Number(2.5).to_text(), "2.5");
        assert_eq!(Value::Number(2.0).to_text(), "2");
        assert_eq!(Value::Error(CellError::Name).to_text(), "#NAME?");
    }
}
