//! Restricted arithmetic evaluator
//!
//! Accepts plain arithmetic over numbers plus a small allow-listed set of
//! math functions and constants. Input is screened by pattern checks before
//! it is parsed, and evaluation never touches anything but the parsed tree.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod parser;

pub use parser::{parse_expression, BinaryOp, Expr};

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CalcError {
    #[error("Invalid expression - {0}")]
    InvalidExpression(String),

    #[error("Division by zero.")]
    DivisionByZero,

    #[error("Math domain error - {0}")]
    MathDomainError(String),
}

/// Functions the evaluator will call. Anything else is rejected.
pub const ALLOWED_FUNCTIONS: &[&str] = &[
    "abs", "round", "min", "max", "sum", "sqrt", "sin", "cos", "tan", "asin", "acos", "atan",
    "log", "log10", "exp", "pow", "floor", "ceil",
];

pub const ALLOWED_CONSTANTS: &[&str] = &["pi", "e"];

/// Longest expression the evaluator accepts, in characters.
pub const MAX_EXPRESSION_LEN: usize = 512;

/// Deepest nesting the recursive parser is allowed to see. Parentheses,
/// unary signs and `**` each add a level.
pub const MAX_NESTING: usize = 64;

lazy_static! {
    static ref DANGEROUS_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"__\w+__").unwrap(),
        Regex::new(r"import\s*").unwrap(),
        Regex::new(r"exec\s*\(").unwrap(),
        Regex::new(r"eval\s*\(").unwrap(),
        Regex::new(r"open\s*\(").unwrap(),
        Regex::new(r"input\s*\(").unwrap(),
        Regex::new(r"lambda").unwrap(),
    ];
    static ref ATTRIBUTE_ACCESS: Regex = Regex::new(r"\.\s*[a-z_]").unwrap();
}

fn is_allowed_char(c: char) -> bool {
    c.is_ascii_digit() || c.is_ascii_lowercase() || " \t+-*/().,".contains(c)
}

/// Worst-case recursion depth of the grammar over `expression`. A unary
/// sign or `**` stays open until the enclosing parenthesis closes.
fn nesting_depth(expression: &str) -> usize {
    // operators opened at each parenthesis level
    let mut levels: Vec<usize> = vec![0];
    let mut open_operators = 0;
    let mut deepest = 0;
    let mut prev: Option<char> = None;
    let mut chars = expression.chars().filter(|c| !c.is_whitespace()).peekable();

    while let Some(c) = chars.next() {
        match c {
            '(' => levels.push(0),
            ')' if levels.len() > 1 => {
                open_operators -= levels.pop().unwrap_or(0);
            }
            '+' | '-' if matches!(prev, None | Some('(' | ',' | '+' | '-' | '*' | '/')) => {
                if let Some(top) = levels.last_mut() {
                    *top += 1;
                    open_operators += 1;
                }
            }
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if let Some(top) = levels.last_mut() {
                    *top += 1;
                    open_operators += 1;
                }
            }
            _ => {}
        }
        prev = Some(c);
        deepest = deepest.max(levels.len() - 1 + open_operators);
    }

    deepest
}

/// Pattern screen applied before any parsing happens.
pub fn screen(expression: &str) -> Result<(), CalcError> {
    if expression.is_empty() {
        return Err(CalcError::InvalidExpression("empty expression".to_string()));
    }

    if expression.chars().count() > MAX_EXPRESSION_LEN {
        return Err(CalcError::InvalidExpression(format!(
            "expression longer than {} characters",
            MAX_EXPRESSION_LEN
        )));
    }

    if DANGEROUS_PATTERNS.iter().any(|p| p.is_match(expression)) {
        return Err(CalcError::InvalidExpression(
            "contains potentially dangerous operations".to_string(),
        ));
    }

    if let Some(bad) = expression.chars().find(|c| !is_allowed_char(*c)) {
        return Err(CalcError::InvalidExpression(format!(
            "character '{}' is not allowed",
            bad
        )));
    }

    if ATTRIBUTE_ACCESS.is_match(expression) {
        return Err(CalcError::InvalidExpression(
            "attribute access is not allowed".to_string(),
        ));
    }

    if nesting_depth(expression) > MAX_NESTING {
        return Err(CalcError::InvalidExpression(format!(
            "nested deeper than {} levels",
            MAX_NESTING
        )));
    }

    Ok(())
}

/// Evaluate a restricted arithmetic expression.
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let normalized = expression.trim().to_lowercase();
    screen(&normalized)?;

    let tree = parse_expression(&normalized)?;
    let value = tree.eval()?;

    if !value.is_finite() {
        return Err(CalcError::MathDomainError("result out of range".to_string()));
    }

    debug!(expression = %normalized, value, "Expression evaluated");
    Ok(value)
}

/// Integers print without a fraction; everything else with up to ten
/// significant digits.
pub fn format_value(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }

    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{}", value as i64);
    }

    let exponent = value.abs().log10().floor() as i32;

    if !(-4..10).contains(&exponent) {
        let formatted = format!("{:.9e}", value);
        match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
                format!("{}e{}", mantissa, exp)
            }
            None => formatted,
        }
    } else {
        let decimals = (9 - exponent).max(0) as usize;
        let formatted = format!("{:.*}", decimals, value);
        if formatted.contains('.') {
            formatted
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            formatted
        }
    }
}
