//! Built-in worksheet functions.
//!
//! Arguments arrive pre-evaluated as scalars or flattened ranges. Errors in
//! any consumed argument propagate to the result; aggregate functions skip
//! text and blank cells inside ranges the way direct entry does not.

use ordered_float::OrderedFloat;

use super::eval::{CellError, Operand, Value};

pub fn call(name: &str, args: &[Operand]) -> Value {
    match name {
        // Math & statistics
        "SUM" => fold_numbers(args, |nums| nums.iter().sum()),
        "PRODUCT" => fold_numbers(args, |nums| nums.iter().product()),
        "AVERAGE" => match collect_numbers(args) {
            Err(e) => Value::Error(e),
            Ok(nums) if nums.is_empty() => Value::Error(CellError::Div0),
            Ok(nums) => Value::Number(nums.iter().sum::<f64>() / nums.len() as f64),
        },
        "COUNT" => match collect_numbers(args) {
            Err(e) => Value::Error(e),
            Ok(nums) => Value::Number(nums.len() as f64),
        },
        "COUNTA" => {
            let mut count = 0usize;
            for arg in args {
                match arg {
                    Operand::Scalar(Value::Empty) => {}
                    Operand::Scalar(Value::Error(e)) => return Value::Error(*e),
                    Operand::Scalar(_) => count += 1,
                    Operand::Range(values) => {
                        for v in values {
                            match v {
                                Value::Empty => {}
                                Value::Error(e) => return Value::Error(*e),
                                _ => count += 1,
                            }
                        }
                    }
                }
            }
            Value::Number(count as f64)
        }
        "MIN" => match collect_numbers(args) {
            Err(e) => Value::Error(e),
            Ok(nums) if nums.is_empty() => Value::Number(0.0),
            Ok(nums) => Value::Number(nums.iter().copied().fold(f64::INFINITY, f64::min)),
        },
        "MAX" => match collect_numbers(args) {
            Err(e) => Value::Error(e),
            Ok(nums) if nums.is_empty() => Value::Number(0.0),
            Ok(nums) => Value::Number(nums.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        },
        "MEDIAN" => match collect_numbers(args) {
            Err(e) => Value::Error(e),
            Ok(nums) if nums.is_empty() => Value::Error(CellError::Value),
            Ok(mut nums) => {
                nums.sort_by_key(|n| OrderedFloat(*n));
                let mid = nums.len() / 2;
                if nums.len() % 2 == 1 {
                    Value::Number(nums[mid])
                } else {
                    Value::Number((nums[mid - 1] + nums[mid]) / 2.0)
                }
            }
        },
        "ABS" => unary_number(args, f64::abs),
        "SQRT" => match scalar_number(args, 0) {
            Err(e) => Value::Error(e),
            Ok(n) if n < 0.0 => Value::Error(CellError::Value),
            Ok(n) => Value::Number(n.sqrt()),
        },
        "INT" => unary_number(args, f64::floor),
        "ROUND" => {
            let n = match scalar_number(args, 0) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let digits = match args.get(1) {
                None | Some(Operand::Scalar(Value::Empty)) => 0.0,
                Some(_) => match scalar_number(args, 1) {
                    Ok(d) => d.trunc(),
                    Err(e) => return Value::Error(e),
                },
            };
            let factor = 10f64.powf(digits);
            Value::Number((n * factor).round() / factor)
        }
        "POWER" => {
            let base = match scalar_number(args, 0) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let exp = match scalar_number(args, 1) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            Value::Number(base.powf(exp))
        }
        "MOD" => {
            let a = match scalar_number(args, 0) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let b = match scalar_number(args, 1) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            if b == 0.0 {
                Value::Error(CellError::Div0)
            } else {
                // Result takes the sign of the divisor
                Value::Number(a - b * (a / b).floor())
            }
        }

        // Logical
        "AND" | "OR" => {
            let mut bools = Vec::new();
            for arg in args {
                match arg {
                    Operand::Scalar(v) => match v.to_bool() {
                        Ok(b) => bools.push(b),
                        Err(e) => return Value::Error(e),
                    },
                    Operand::Range(values) => {
                        for v in values {
                            match v {
                                Value::Error(e) => return Value::Error(*e),
                                Value::Text(_) | Value::Empty => {}
                                other => match other.to_bool() {
                                    Ok(b) => bools.push(b),
                                    Err(e) => return Value::Error(e),
                                },
                            }
                        }
                    }
                }
            }
            if bools.is_empty() {
                return Value::Error(CellError::Value);
            }
            let result = if name == "AND" {
                bools.iter().all(|b| *b)
            } else {
                bools.iter().any(|b| *b)
            };
            Value::Boolean(result)
        }
        "NOT" => match scalar(args, 0).and_then(|v| v.to_bool().map_err(Value::Error)) {
            Ok(b) => Value::Boolean(!b),
            Err(v) => v,
        },
        "IFERROR" => {
            let value = match args.first() {
                Some(op) => op.clone().into_scalar(),
                None => return Value::Error(CellError::Value),
            };
            if value.is_error() {
                match args.get(1) {
                    Some(op) => op.clone().into_scalar(),
                    None => Value::Empty,
                }
            } else {
                value
            }
        }
        "ISBLANK" => match scalar(args, 0) {
            Ok(v) => Value::Boolean(matches!(v, Value::Empty)),
            Err(v) => v,
        },

        // Text
        "LEN" => match scalar_text(args, 0) {
            Ok(s) => Value::Number(s.chars().count() as f64),
            Err(e) => Value::Error(e),
        },
        "UPPER" => text_map(args, |s| s.to_uppercase()),
        "LOWER" => text_map(args, |s| s.to_lowercase()),
        "TRIM" => text_map(args, |s| s.trim().to_string()),
        "LEFT" => {
            let s = match scalar_text(args, 0) {
                Ok(s) => s,
                Err(e) => return Value::Error(e),
            };
            let n = match optional_count(args, 1) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            Value::Text(s.chars().take(n).collect())
        }
        "RIGHT" => {
            let s = match scalar_text(args, 0) {
                Ok(s) => s,
                Err(e) => return Value::Error(e),
            };
            let n = match optional_count(args, 1) {
                Ok(n) => n,
                Err(e) => return Value::Error(e),
            };
            let len = s.chars().count();
            Value::Text(s.chars().skip(len.saturating_sub(n)).collect())
        }
        "MID" => {
            let s = match scalar_text(args, 0) {
                Ok(s) => s,
                Err(e) => return Value::Error(e),
            };
            let start = match scalar_number(args, 1) {
                Ok(n) if n >= 1.0 => n as usize - 1,
                Ok(_) => return Value::Error(CellError::Value),
                Err(e) => return Value::Error(e),
            };
            let len = match scalar_number(args, 2) {
                Ok(n) if n >= 0.0 => n as usize,
                Ok(_) => return Value::Error(CellError::Value),
                Err(e) => return Value::Error(e),
            };
            Value::Text(s.chars().skip(start).take(len).collect())
        }
        "CONCATENATE" => {
            let mut out = String::new();
            for arg in args {
                match arg {
                    Operand::Scalar(Value::Error(e)) => return Value::Error(*e),
                    Operand::Scalar(v) => out.push_str(&v.to_text()),
                    Operand::Range(_) => return Value::Error(CellError::Value),
                }
            }
            Value::Text(out)
        }
        "EXACT" => {
            let a = match scalar_text(args, 0) {
                Ok(s) => s,
                Err(e) => return Value::Error(e),
            };
            let b = match scalar_text(args, 1) {
                Ok(s) => s,
                Err(e) => return Value::Error(e),
            };
            Value::Boolean(a == b)
        }

        _ => Value::Error(CellError::Name),
    }
}

// =============================================================================
// Argument helpers
// =============================================================================

fn scalar(args: &[Operand], idx: usize) -> Result<Value, Value> {
    match args.get(idx) {
        Some(op) => {
            let v = op.clone().into_scalar();
            match v {
                Value::Error(e) => Err(Value::Error(e)),
                other => Ok(other),
            }
        }
        None => Err(Value::Error(CellError::Value)),
    }
}

fn scalar_number(args: &[Operand], idx: usize) -> Result<f64, CellError> {
    match args.get(idx) {
        Some(op) => op.clone().into_scalar().to_number(),
        None => Err(CellError::Value),
    }
}

fn scalar_text(args: &[Operand], idx: usize) -> Result<String, CellError> {
    match args.get(idx) {
        Some(op) => {
            let v = op.clone().into_scalar();
            match v {
                Value::Error(e) => Err(e),
                other => Ok(other.to_text()),
            }
        }
        None => Err(CellError::Value),
    }
}

/// An optional count argument defaulting to 1 (LEFT/RIGHT).
fn optional_count(args: &[Operand], idx: usize) -> Result<usize, CellError> {
    match args.get(idx) {
        None | Some(Operand::Scalar(Value::Empty)) => Ok(1),
        Some(_) => {
            let n = scalar_number(args, idx)?;
            if n < 0.0 {
                Err(CellError::Value)
            } else {
                Ok(n as usize)
            }
        }
    }
}

fn unary_number(args: &[Operand], f: impl Fn(f64) -> f64) -> Value {
    match scalar_number(args, 0) {
        Ok(n) => Value::Number(f(n)),
        Err(e) => Value::Error(e),
    }
}

fn text_map(args: &[Operand], f: impl Fn(&str) -> String) -> Value {
    match scalar_text(args, 0) {
        Ok(s) => Value::Text(f(&s)),
        Err(e) => Value::Error(e),
    }
}

/// Collect numeric inputs for an aggregate.
///
/// Direct scalar arguments coerce (text must parse); range elements include
/// numbers and booleans only, skipping text and blanks. Any error value
/// aborts the collection.
fn collect_numbers(args: &[Operand]) -> Result<Vec<f64>, CellError> {
    let mut nums = Vec::new();
    for arg in args {
        match arg {
            Operand::Scalar(Value::Empty) => {}
            Operand::Scalar(v) => nums.push(v.to_number()?),
            Operand::Range(values) => {
                for v in values {
                    match v {
                        Value::Number(n) => nums.push(*n),
                        Value::Boolean(b) => nums.push(if *b { 1.0 } else { 0.0 }),
                        Value::Error(e) => return Err(*e),
                        Value::Text(_) | Value::Empty => {}
                    }
                }
            }
        }
    }
    Ok(nums)
}

fn fold_numbers(args: &[Operand], f: impl Fn(&[f64]) -> f64) -> Value {
    match collect_numbers(args) {
        Ok(nums) => Value::Number(f(&nums)),
        Err(e) => Value::Error(e),
    }
}
