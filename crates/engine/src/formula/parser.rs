// Formula parser - converts formula strings into AST
// Supports: numbers, cell refs (A1), ranges (A1:A5), functions (SUM), basic math (+, -, *, /)
// Also supports: comparison operators (<, >, =, <=, >=, <>), string literals, concatenation (&)

use serde::{Deserialize, Serialize};

use crate::sheet::{SheetId, SheetRef, UnboundSheetRef};

/// Generic expression AST, parameterized over sheet reference type.
/// - Parser outputs `ParsedExpr = Expr<UnboundSheetRef>` (sheet names unresolved)
/// - After binding, becomes `BoundExpr = Expr<SheetRef>` (sheet IDs resolved)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr<S> {
    Number(f64),
    Text(String),
    Boolean(bool),
    /// Cell reference with sheet context
    /// - col_abs/row_abs: true if that component is absolute ($A vs A, $1 vs 1)
    CellRef {
        sheet: S,
        col: usize,
        row: usize,
        col_abs: bool,
        row_abs: bool,
    },
    /// Range reference with sheet context
    Range {
        sheet: S,
        start_col: usize,
        start_row: usize,
        end_col: usize,
        end_row: usize,
        start_col_abs: bool,
        start_row_abs: bool,
        end_col_abs: bool,
        end_row_abs: bool,
    },
    Function {
        name: String,
        args: Vec<Expr<S>>,
    },
    BinaryOp {
        op: Op,
        left: Box<Expr<S>>,
        right: Box<Expr<S>>,
    },
    /// Named range reference (resolved at evaluation time)
    NamedRange(String),
    /// Empty/omitted argument (e.g. the trailing slot in `=IF(a,b,)`)
    Empty,
    /// A reference invalidated by a structural edit (deleted row/column/sheet).
    /// Renders and evaluates as #REF!.
    RefError,
}

/// Parser output: sheet references are unresolved names
pub type ParsedExpr = Expr<UnboundSheetRef>;

/// Bound expression: sheet references resolved to stable IDs
pub type BoundExpr = Expr<SheetRef>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    // Comparison
    Lt,    // <
    Gt,    // >
    Eq,    // =
    LtEq,  // <=
    GtEq,  // >=
    NotEq, // <>
    // String
    Concat, // &
    // Exponentiation
    Pow, // ^
}

/// Parse a formula string into an unbound AST (sheet names not yet resolved to IDs).
/// Call `bind_expr()` with workbook context to resolve sheet references before evaluation.
pub fn parse(formula: &str) -> Result<ParsedExpr, String> {
    let formula = formula.trim();
    if !formula.starts_with('=') {
        return Err("Formula must start with =".to_string());
    }

    let input = &formula[1..]; // Skip the '='
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("Empty formula".to_string());
    }
    let (expr, pos) = parse_comparison(&tokens, 0)?;
    if pos != tokens.len() {
        return Err(format!("Unexpected trailing input at token {}", pos));
    }
    Ok(expr)
}

#[derive(Debug, Clone)]
enum Token {
    Number(f64),
    StringLit(String),
    /// Cell reference with absolute/relative flags
    CellRef {
        col: usize,
        row: usize,
        col_abs: bool,
        row_abs: bool,
    },
    /// Sheet name prefix (e.g., "Sheet1" from "Sheet1!A1")
    SheetPrefix(String),
    Ident(String),
    RefError,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Colon,
    Comma,
    // Comparison operators
    Lt,    // <
    Gt,    // >
    Eq,    // =
    LtEq,  // <=
    GtEq,  // >=
    NotEq, // <>
    // String concatenation
    Ampersand, // &
    // Exponentiation and percent
    Caret,   // ^
    Percent, // %
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                tokens.push(Token::Plus);
                chars.next();
            }
            '-' => {
                tokens.push(Token::Minus);
                chars.next();
            }
            '*' => {
                tokens.push(Token::Star);
                chars.next();
            }
            '/' => {
                tokens.push(Token::Slash);
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            ':' => {
                tokens.push(Token::Colon);
                chars.next();
            }
            ',' => {
                tokens.push(Token::Comma);
                chars.next();
            }
            '&' => {
                tokens.push(Token::Ampersand);
                chars.next();
            }
            '^' => {
                tokens.push(Token::Caret);
                chars.next();
            }
            '%' => {
                tokens.push(Token::Percent);
                chars.next();
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        tokens.push(Token::LtEq);
                        chars.next();
                    }
                    Some('>') => {
                        tokens.push(Token::NotEq);
                        chars.next();
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    tokens.push(Token::GtEq);
                    chars.next();
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '=' => {
                tokens.push(Token::Eq);
                chars.next();
            }
            '#' => {
                // Error literal; only #REF! can appear in stored formulas
                // (structural edits rewrite dead references to it).
                let mut lit = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphabetic() || ch == '#' || ch == '!' || ch == '/' || ch == '?'
                        || ch == '0'
                    {
                        lit.push(ch);
                        chars.next();
                        if ch == '!' || ch == '?' {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                if lit == "#REF!" {
                    tokens.push(Token::RefError);
                } else {
                    return Err(format!("Unexpected error literal: {}", lit));
                }
            }
            '"' => {
                // String literal
                chars.next(); // consume opening quote
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => s.push(ch),
                        None => return Err("Unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::StringLit(s));
            }
            '\'' => {
                // Quoted sheet name (e.g., 'My Sheet'!A1 or 'Bob''s Sheet'!A1)
                // Doubled quotes ('') inside are escape for a single quote
                chars.next(); // consume opening quote
                let mut sheet_name = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => {
                            if chars.peek() == Some(&'\'') {
                                chars.next();
                                sheet_name.push('\'');
                            } else {
                                break;
                            }
                        }
                        Some(ch) => sheet_name.push(ch),
                        None => return Err("Unterminated sheet name".to_string()),
                    }
                }
                // Must be followed by !
                if chars.next() != Some('!') {
                    return Err("Quoted sheet name must be followed by !".to_string());
                }
                tokens.push(Token::SheetPrefix(sheet_name));
            }
            'A'..='Z' | 'a'..='z' | '_' => {
                // Could be cell reference (A1), function name (SUM), or sheet prefix (Sheet1!)
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }

                // Check if followed by ! (sheet reference prefix)
                if chars.peek() == Some(&'!') {
                    chars.next(); // consume the !
                    tokens.push(Token::SheetPrefix(ident));
                    continue;
                }

                let upper = ident.to_uppercase();
                if upper == "TRUE" || upper == "FALSE" {
                    tokens.push(Token::Ident(upper));
                } else if let Some(token) = try_parse_cell_ref(&ident) {
                    tokens.push(token);
                } else {
                    tokens.push(Token::Ident(upper));
                }
            }
            '$' => {
                // Absolute reference marker - collect with following letters/numbers
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '$' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Some(token) = try_parse_cell_ref(&ident) {
                    tokens.push(token);
                } else {
                    return Err(format!("Invalid cell reference: {}", ident));
                }
            }
            '0'..='9' | '.' => {
                let mut num_str = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num_str.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num: f64 = num_str
                    .parse()
                    .map_err(|_| format!("Invalid number: {}", num_str))?;
                tokens.push(Token::Number(num));
            }
            _ => return Err(format!("Unexpected character: {}", c)),
        }
    }

    Ok(tokens)
}

fn try_parse_cell_ref(s: &str) -> Option<Token> {
    let s = s.to_uppercase();
    let mut chars = s.chars().peekable();

    let col_abs = if chars.peek() == Some(&'$') {
        chars.next();
        true
    } else {
        false
    };

    // Collect column letters (supports multi-letter like AA, AB, etc.)
    let mut col_str = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_uppercase() {
            col_str.push(c);
            chars.next();
        } else {
            break;
        }
    }

    if col_str.is_empty() {
        return None;
    }

    let row_abs = if chars.peek() == Some(&'$') {
        chars.next();
        true
    } else {
        false
    };

    let row_str: String = chars.collect();
    if row_str.is_empty() || !row_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let row: usize = row_str.parse().ok()?;
    if row == 0 {
        return None;
    }

    // Convert column letters to number (A=0, B=1, ..., Z=25, AA=26, AB=27, etc.)
    let col = col_str
        .chars()
        .fold(0usize, |acc, c| acc * 26 + (c as usize - 'A' as usize + 1))
        - 1;

    Some(Token::CellRef {
        col,
        row: row - 1,
        col_abs,
        row_abs,
    })
}

// Lowest precedence: comparison operators
fn parse_comparison(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_concat(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Lt => Op::Lt,
            Token::Gt => Op::Gt,
            Token::Eq => Op::Eq,
            Token::LtEq => Op::LtEq,
            Token::GtEq => Op::GtEq,
            Token::NotEq => Op::NotEq,
            _ => break,
        };
        let (right, new_pos) = parse_concat(tokens, pos + 1)?;
        left = Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = new_pos;
    }

    Ok((left, pos))
}

// String concatenation (&)
fn parse_concat(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_add_sub(tokens, pos)?;

    while pos < tokens.len() {
        if let Token::Ampersand = &tokens[pos] {
            let (right, new_pos) = parse_add_sub(tokens, pos + 1)?;
            left = Expr::BinaryOp {
                op: Op::Concat,
                left: Box::new(left),
                right: Box::new(right),
            };
            pos = new_pos;
        } else {
            break;
        }
    }

    Ok((left, pos))
}

fn parse_add_sub(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_mul_div(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Plus => Op::Add,
            Token::Minus => Op::Sub,
            _ => break,
        };
        let (right, new_pos) = parse_mul_div(tokens, pos + 1)?;
        left = Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = new_pos;
    }

    Ok((left, pos))
}

fn parse_mul_div(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut left, mut pos) = parse_power(tokens, pos)?;

    while pos < tokens.len() {
        let op = match &tokens[pos] {
            Token::Star => Op::Mul,
            Token::Slash => Op::Div,
            _ => break,
        };
        let (right, new_pos) = parse_power(tokens, pos + 1)?;
        left = Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };
        pos = new_pos;
    }

    Ok((left, pos))
}

// Exponentiation (^) - right-associative, higher precedence than * /
fn parse_power(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (base, pos) = parse_percent(tokens, pos)?;

    if pos < tokens.len() {
        if let Token::Caret = &tokens[pos] {
            // Right-associative: recurse into parse_power for the exponent
            let (exponent, new_pos) = parse_power(tokens, pos + 1)?;
            return Ok((
                Expr::BinaryOp {
                    op: Op::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
                new_pos,
            ));
        }
    }

    Ok((base, pos))
}

// Percent postfix (%) - highest precedence operator, desugars to * 0.01
fn parse_percent(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    let (mut expr, mut pos) = parse_primary(tokens, pos)?;

    while pos < tokens.len() {
        if let Token::Percent = &tokens[pos] {
            expr = Expr::BinaryOp {
                op: Op::Mul,
                left: Box::new(expr),
                right: Box::new(Expr::Number(0.01)),
            };
            pos += 1;
        } else {
            break;
        }
    }

    Ok((expr, pos))
}

fn parse_primary(tokens: &[Token], pos: usize) -> Result<(ParsedExpr, usize), String> {
    if pos >= tokens.len() {
        return Err("Unexpected end of expression".to_string());
    }

    match &tokens[pos] {
        Token::Number(n) => Ok((Expr::Number(*n), pos + 1)),
        Token::StringLit(s) => Ok((Expr::Text(s.clone()), pos + 1)),
        Token::RefError => Ok((Expr::RefError, pos + 1)),
        Token::SheetPrefix(sheet_name) => {
            // Sheet prefix must be followed by a cell reference
            if pos + 1 >= tokens.len() {
                return Err("Sheet reference must be followed by cell reference".to_string());
            }
            let sheet = UnboundSheetRef::Named(sheet_name.clone());
            match &tokens[pos + 1] {
                Token::CellRef {
                    col,
                    row,
                    col_abs,
                    row_abs,
                } => {
                    // Check if this is a range (Sheet1!A1:B5)
                    if pos + 3 < tokens.len() {
                        if let Token::Colon = &tokens[pos + 2] {
                            if let Token::CellRef {
                                col: end_col,
                                row: end_row,
                                col_abs: end_col_abs,
                                row_abs: end_row_abs,
                            } = &tokens[pos + 3]
                            {
                                return Ok((
                                    Expr::Range {
                                        sheet,
                                        start_col: *col,
                                        start_row: *row,
                                        end_col: *end_col,
                                        end_row: *end_row,
                                        start_col_abs: *col_abs,
                                        start_row_abs: *row_abs,
                                        end_col_abs: *end_col_abs,
                                        end_row_abs: *end_row_abs,
                                    },
                                    pos + 4,
                                ));
                            }
                        }
                    }
                    Ok((
                        Expr::CellRef {
                            sheet,
                            col: *col,
                            row: *row,
                            col_abs: *col_abs,
                            row_abs: *row_abs,
                        },
                        pos + 2,
                    ))
                }
                _ => Err("Sheet reference must be followed by cell reference".to_string()),
            }
        }
        Token::CellRef {
            col,
            row,
            col_abs,
            row_abs,
        } => {
            // Check if this is a range (A1:B5)
            if pos + 2 < tokens.len() {
                if let Token::Colon = &tokens[pos + 1] {
                    if let Token::CellRef {
                        col: end_col,
                        row: end_row,
                        col_abs: end_col_abs,
                        row_abs: end_row_abs,
                    } = &tokens[pos + 2]
                    {
                        return Ok((
                            Expr::Range {
                                sheet: UnboundSheetRef::Current,
                                start_col: *col,
                                start_row: *row,
                                end_col: *end_col,
                                end_row: *end_row,
                                start_col_abs: *col_abs,
                                start_row_abs: *row_abs,
                                end_col_abs: *end_col_abs,
                                end_row_abs: *end_row_abs,
                            },
                            pos + 3,
                        ));
                    }
                }
            }
            Ok((
                Expr::CellRef {
                    sheet: UnboundSheetRef::Current,
                    col: *col,
                    row: *row,
                    col_abs: *col_abs,
                    row_abs: *row_abs,
                },
                pos + 1,
            ))
        }
        Token::Ident(name) => {
            if name == "TRUE" {
                return Ok((Expr::Boolean(true), pos + 1));
            }
            if name == "FALSE" {
                return Ok((Expr::Boolean(false), pos + 1));
            }
            // Function call
            if pos + 1 < tokens.len() {
                if let Token::LParen = &tokens[pos + 1] {
                    let (args, new_pos) = parse_function_args(tokens, pos + 2)?;
                    return Ok((
                        Expr::Function {
                            name: name.clone(),
                            args,
                        },
                        new_pos,
                    ));
                }
            }
            // Not a function call - treat as a named range (resolved at evaluation time)
            Ok((Expr::NamedRange(name.clone()), pos + 1))
        }
        Token::LParen => {
            let (expr, pos) = parse_comparison(tokens, pos + 1)?;
            if pos >= tokens.len() {
                return Err("Missing closing parenthesis".to_string());
            }
            match &tokens[pos] {
                Token::RParen => Ok((expr, pos + 1)),
                _ => Err("Expected closing parenthesis".to_string()),
            }
        }
        Token::Plus => {
            // Unary plus (no-op, just parse the next expression)
            parse_primary(tokens, pos + 1)
        }
        Token::Minus => {
            // Unary minus
            let (expr, pos) = parse_primary(tokens, pos + 1)?;
            Ok((
                Expr::BinaryOp {
                    op: Op::Sub,
                    left: Box::new(Expr::Number(0.0)),
                    right: Box::new(expr),
                },
                pos,
            ))
        }
        _ => Err(format!("Unexpected token at position {}", pos)),
    }
}

fn parse_function_args(tokens: &[Token], pos: usize) -> Result<(Vec<ParsedExpr>, usize), String> {
    let mut args = Vec::new();
    let mut pos = pos;

    // Handle empty function call SUM()
    if pos < tokens.len() {
        if let Token::RParen = &tokens[pos] {
            return Ok((args, pos + 1));
        }
    }

    loop {
        // Empty argument: next token is , or ) immediately
        if pos < tokens.len() && matches!(&tokens[pos], Token::Comma | Token::RParen) {
            args.push(Expr::Empty);
            match &tokens[pos] {
                Token::RParen => return Ok((args, pos + 1)),
                Token::Comma => {
                    pos += 1;
                    continue;
                }
                _ => unreachable!(),
            }
        }

        let (arg, new_pos) = parse_comparison(tokens, pos)?;
        args.push(arg);
        pos = new_pos;

        if pos >= tokens.len() {
            return Err("Missing closing parenthesis in function call".to_string());
        }

        match &tokens[pos] {
            Token::RParen => return Ok((args, pos + 1)),
            Token::Comma => pos += 1,
            _ => return Err("Expected comma or closing parenthesis".to_string()),
        }
    }
}

// =============================================================================
// Expression Binding - Convert ParsedExpr to BoundExpr
// =============================================================================

/// Bind a parsed expression by resolving sheet names to SheetIds.
///
/// The resolver function takes a sheet name and returns:
/// - Some(SheetId) if the sheet exists
/// - None if the sheet doesn't exist (the reference becomes #REF!)
pub fn bind_expr<F>(expr: &ParsedExpr, resolver: F) -> BoundExpr
where
    F: Fn(&str) -> Option<SheetId> + Copy,
{
    match expr {
        Expr::Empty => Expr::Empty,
        Expr::RefError => Expr::RefError,
        Expr::Number(n) => Expr::Number(*n),
        Expr::Text(s) => Expr::Text(s.clone()),
        Expr::Boolean(b) => Expr::Boolean(*b),
        Expr::NamedRange(name) => Expr::NamedRange(name.clone()),
        Expr::CellRef {
            sheet,
            col,
            row,
            col_abs,
            row_abs,
        } => Expr::CellRef {
            sheet: bind_sheet_ref(sheet, resolver),
            col: *col,
            row: *row,
            col_abs: *col_abs,
            row_abs: *row_abs,
        },
        Expr::Range {
            sheet,
            start_col,
            start_row,
            end_col,
            end_row,
            start_col_abs,
            start_row_abs,
            end_col_abs,
            end_row_abs,
        } => Expr::Range {
            sheet: bind_sheet_ref(sheet, resolver),
            start_col: *start_col,
            start_row: *start_row,
            end_col: *end_col,
            end_row: *end_row,
            start_col_abs: *start_col_abs,
            start_row_abs: *start_row_abs,
            end_col_abs: *end_col_abs,
            end_row_abs: *end_row_abs,
        },
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(|a| bind_expr(a, resolver)).collect(),
        },
        Expr::BinaryOp { op, left, right } => Expr::BinaryOp {
            op: *op,
            left: Box::new(bind_expr(left, resolver)),
            right: Box::new(bind_expr(right, resolver)),
        },
    }
}

fn bind_sheet_ref<F>(sheet: &UnboundSheetRef, resolver: F) -> SheetRef
where
    F: Fn(&str) -> Option<SheetId>,
{
    match sheet {
        UnboundSheetRef::Current => SheetRef::Current,
        UnboundSheetRef::Named(name) => match resolver(name) {
            Some(id) => SheetRef::Id(id),
            None => SheetRef::RefError {
                last_known_name: name.clone(),
            },
        },
    }
}

// =============================================================================
// Source Regeneration - Convert ParsedExpr back to formula text
// =============================================================================

/// Regenerate formula source text (with leading `=`) from an AST.
///
/// Used after structural edits rewrite references; the output re-parses to
/// the same AST.
pub fn to_formula(expr: &ParsedExpr) -> String {
    format!("={}", fmt_expr(expr))
}

fn fmt_expr(expr: &ParsedExpr) -> String {
    match expr {
        Expr::Empty => String::new(),
        Expr::RefError => "#REF!".to_string(),
        Expr::Number(n) => fmt_number(*n),
        Expr::Text(s) => format!("\"{}\"", s),
        Expr::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Expr::NamedRange(name) => name.clone(),
        Expr::CellRef {
            sheet,
            col,
            row,
            col_abs,
            row_abs,
        } => format!(
            "{}{}",
            fmt_sheet_prefix(sheet),
            fmt_cell_ref(*col, *row, *col_abs, *row_abs)
        ),
        Expr::Range {
            sheet,
            start_col,
            start_row,
            end_col,
            end_row,
            start_col_abs,
            start_row_abs,
            end_col_abs,
            end_row_abs,
        } => format!(
            "{}{}:{}",
            fmt_sheet_prefix(sheet),
            fmt_cell_ref(*start_col, *start_row, *start_col_abs, *start_row_abs),
            fmt_cell_ref(*end_col, *end_row, *end_col_abs, *end_row_abs)
        ),
        Expr::Function { name, args } => {
            let rendered: Vec<String> = args.iter().map(fmt_expr).collect();
            format!("{}({})", name, rendered.join(","))
        }
        Expr::BinaryOp { op, left, right } => {
            // Unary minus was desugared to 0 - x; render it back
            if *op == Op::Sub {
                if let Expr::Number(n) = **left {
                    if n == 0.0 {
                        return format!("-{}", fmt_operand(right, *op, true));
                    }
                }
            }
            format!(
                "{}{}{}",
                fmt_operand(left, *op, false),
                op_symbol(*op),
                fmt_operand(right, *op, true)
            )
        }
    }
}

/// Parenthesize an operand when re-parsing would otherwise bind it
/// differently than the original tree.
fn fmt_operand(operand: &ParsedExpr, parent: Op, is_right: bool) -> String {
    let rendered = fmt_expr(operand);
    if let Expr::BinaryOp { op, .. } = operand {
        let child = precedence(*op);
        let this = precedence(parent);
        let needs_parens = child < this
            || (child == this && is_right && parent != Op::Pow)
            || (child == this && !is_right && parent == Op::Pow);
        if needs_parens {
            return format!("({})", rendered);
        }
    }
    rendered
}

fn precedence(op: Op) -> u8 {
    match op {
        Op::Lt | Op::Gt | Op::Eq | Op::LtEq | Op::GtEq | Op::NotEq => 1,
        Op::Concat => 2,
        Op::Add | Op::Sub => 3,
        Op::Mul | Op::Div => 4,
        Op::Pow => 5,
    }
}

fn op_symbol(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div => "/",
        Op::Lt => "<",
        Op::Gt => ">",
        Op::Eq => "=",
        Op::LtEq => "<=",
        Op::GtEq => ">=",
        Op::NotEq => "<>",
        Op::Concat => "&",
        Op::Pow => "^",
    }
}

fn fmt_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn fmt_cell_ref(col: usize, row: usize, col_abs: bool, row_abs: bool) -> String {
    format!(
        "{}{}{}{}",
        if col_abs { "$" } else { "" },
        crate::cell_id::col_to_letters(col),
        if row_abs { "$" } else { "" },
        row + 1
    )
}

fn fmt_sheet_prefix(sheet: &UnboundSheetRef) -> String {
    match sheet {
        UnboundSheetRef::Current => String::new(),
        UnboundSheetRef::Named(name) => {
            let plain = !name.is_empty()
                && !name.chars().next().unwrap().is_ascii_digit()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if plain {
                format!("{}!", name)
            } else {
                format!("'{}'!", name.replace('\'', "''"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(formula: &str) -> ParsedExpr {
        parse(formula).unwrap_or_else(|e| panic!("parse failed for {}: {}", formula, e))
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_ok("=42"), Expr::Number(42.0));
        assert_eq!(parse_ok("=3.25"), Expr::Number(3.25));
    }

    #[test]
    fn test_parse_requires_equals() {
        assert!(parse("42").is_err());
        assert!(parse("=").is_err());
    }

    #[test]
    fn test_parse_cell_ref() {
        assert_eq!(
            parse_ok("=B3"),
            Expr::CellRef {
                sheet: UnboundSheetRef::Current,
                col: 1,
                row: 2,
                col_abs: false,
                row_abs: false,
            }
        );
    }

    #[test]
    fn test_parse_absolute_refs() {
        assert_eq!(
            parse_ok("=$A$1"),
            Expr::CellRef {
                sheet: UnboundSheetRef::Current,
                col: 0,
                row: 0,
                col_abs: true,
                row_abs: true,
            }
        );
        assert_eq!(
            parse_ok("=A$1"),
            Expr::CellRef {
                sheet: UnboundSheetRef::Current,
                col: 0,
                row: 0,
                col_abs: false,
                row_abs: true,
            }
        );
    }

    #[test]
    fn test_parse_range() {
        match parse_ok("=A1:B5") {
            Expr::Range {
                start_col,
                start_row,
                end_col,
                end_row,
                ..
            } => {
                assert_eq!((start_col, start_row), (0, 0));
                assert_eq!((end_col, end_row), (1, 4));
            }
            other => panic!("expected range, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_sheet_prefix() {
        match parse_ok("=Sheet2!A1") {
            Expr::CellRef { sheet, .. } => {
                assert_eq!(sheet, UnboundSheetRef::Named("Sheet2".to_string()));
            }
            other => panic!("expected cell ref, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_quoted_sheet_prefix() {
        match parse_ok("='My Sheet'!A1:B2") {
            Expr::Range { sheet, .. } => {
                assert_eq!(sheet, UnboundSheetRef::Named("My Sheet".to_string()));
            }
            other => panic!("expected range, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        match parse_ok("=1+2*3") {
            Expr::BinaryOp { op: Op::Add, right, .. } => match *right {
                Expr::BinaryOp { op: Op::Mul, .. } => {}
                other => panic!("expected mul on right, got {:?}", other),
            },
            other => panic!("expected add at root, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_power_right_associative() {
        // 2 ^ 3 ^ 2 parses as 2 ^ (3 ^ 2)
        match parse_ok("=2^3^2") {
            Expr::BinaryOp { op: Op::Pow, right, .. } => match *right {
                Expr::BinaryOp { op: Op::Pow, .. } => {}
                other => panic!("expected pow on right, got {:?}", other),
            },
            other => panic!("expected pow at root, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_percent_desugars() {
        match parse_ok("=50%") {
            Expr::BinaryOp { op: Op::Mul, left, right } => {
                assert_eq!(*left, Expr::Number(50.0));
                assert_eq!(*right, Expr::Number(0.01));
            }
            other => panic!("expected mul, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unary_minus() {
        match parse_ok("=-A1") {
            Expr::BinaryOp { op: Op::Sub, left, .. } => {
                assert_eq!(*left, Expr::Number(0.0));
            }
            other => panic!("expected sub, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_function_with_empty_arg() {
        match parse_ok("=IF(A1,B1,)") {
            Expr::Function { name, args } => {
                assert_eq!(name, "IF");
                assert_eq!(args.len(), 3);
                assert_eq!(args[2], Expr::Empty);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_named_range() {
        assert_eq!(
            parse_ok("=Revenue"),
            Expr::NamedRange("REVENUE".to_string())
        );
    }

    #[test]
    fn test_parse_booleans() {
        assert_eq!(parse_ok("=TRUE"), Expr::Boolean(true));
        assert_eq!(parse_ok("=false"), Expr::Boolean(false));
    }

    #[test]
    fn test_parse_ref_error_literal() {
        assert_eq!(parse_ok("=#REF!"), Expr::RefError);
        match parse_ok("=#REF!+1") {
            Expr::BinaryOp { op: Op::Add, left, .. } => {
                assert_eq!(*left, Expr::RefError);
            }
            other => panic!("expected add, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_comparison_and_concat() {
        match parse_ok("=A1<>B1") {
            Expr::BinaryOp { op: Op::NotEq, .. } => {}
            other => panic!("expected <>, got {:?}", other),
        }
        match parse_ok("=\"a\"&\"b\"") {
            Expr::BinaryOp { op: Op::Concat, .. } => {}
            other => panic!("expected concat, got {:?}", other),
        }
    }

    #[test]
    fn test_bind_unknown_sheet_becomes_ref_error() {
        let parsed = parse_ok("=Missing!A1");
        let bound = bind_expr(&parsed, |_| None);
        match bound {
            Expr::CellRef { sheet, .. } => match sheet {
                SheetRef::RefError { last_known_name } => {
                    assert_eq!(last_known_name, "Missing");
                }
                other => panic!("expected ref error, got {:?}", other),
            },
            other => panic!("expected cell ref, got {:?}", other),
        }
    }

    #[test]
    fn test_to_formula_round_trip() {
        for src in [
            "=A1+1",
            "=SUM(A1:B5)",
            "=$A$1*B2",
            "=IF(A1>0,\"yes\",\"no\")",
            "=Sheet2!A1+1",
            "='My Sheet'!A1:B2",
            "=#REF!",
            "=(1+2)*3",
            "=2^3^2",
            "=A1&\"x\"",
        ] {
            let ast = parse_ok(src);
            let regenerated = to_formula(&ast);
            let reparsed = parse_ok(&regenerated);
            assert_eq!(ast, reparsed, "round trip failed for {}", src);
        }
    }

    #[test]
    fn test_to_formula_preserves_grouping() {
        // (1+2)*3 must not regenerate as 1+2*3
        let ast = parse_ok("=(1+2)*3");
        let regenerated = to_formula(&ast);
        assert_eq!(regenerated, "=(1+2)*3");
    }

    #[test]
    fn test_to_formula_unary_minus() {
        let ast = parse_ok("=-A1");
        assert_eq!(to_formula(&ast), "=-A1");
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse("=1 2").is_err());
    }
}
