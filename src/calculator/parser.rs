//! nom grammar for the arithmetic evaluator
//!
//! expr  := term (("+" | "-") term)*
//! term  := unary (("*" | "/") unary)*
//! unary := ("+" | "-") unary | power
//! power := atom ("**" unary)?
//! atom  := number | "(" expr ")" | name "(" args ")" | name

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric0, char, digit0, digit1, multispace0, one_of},
    combinator::{map, map_res, not, opt, recognize, value},
    error::VerboseError,
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    Finish, IResult,
};

use super::{CalcError, ALLOWED_CONSTANTS, ALLOWED_FUNCTIONS};

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Constant(String),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

/// Parse a complete expression; trailing input is an error.
pub fn parse_expression(input: &str) -> Result<Expr, CalcError> {
    let (remaining, expr) = parse_expr(input).finish().map_err(|e| {
        let near = e
            .errors
            .first()
            .map(|(rest, _)| rest.trim())
            .unwrap_or_default();
        if near.is_empty() {
            CalcError::InvalidExpression("incomplete expression".to_string())
        } else {
            CalcError::InvalidExpression(format!("malformed expression near '{}'", near))
        }
    })?;

    if !remaining.trim().is_empty() {
        return Err(CalcError::InvalidExpression(format!(
            "unexpected input at '{}'",
            remaining.trim()
        )));
    }

    Ok(expr)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ParseResult<'a, O>
where
    F: FnMut(&'a str) -> ParseResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn fold(first: Expr, rest: Vec<(BinaryOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |acc, (op, rhs)| {
        Expr::Binary(op, Box::new(acc), Box::new(rhs))
    })
}

fn parse_expr(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = parse_term(input)?;
    let (input, rest) = many0(pair(
        ws(alt((value(BinaryOp::Add, char('+')), value(BinaryOp::Sub, char('-'))))),
        parse_term,
    ))(input)?;
    Ok((input, fold(first, rest)))
}

fn parse_term(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOp::Mul, terminated(char('*'), not(char('*')))),
            value(BinaryOp::Div, char('/')),
        ))),
        parse_unary,
    ))(input)?;
    Ok((input, fold(first, rest)))
}

fn parse_unary(input: &str) -> ParseResult<'_, Expr> {
    alt((
        map(preceded(ws(char('-')), parse_unary), |e| Expr::Neg(Box::new(e))),
        preceded(ws(char('+')), parse_unary),
        parse_power,
    ))(input)
}

fn parse_power(input: &str) -> ParseResult<'_, Expr> {
    let (input, base) = parse_atom(input)?;
    let (input, exponent) = opt(preceded(ws(tag("**")), parse_unary))(input)?;
    let expr = match exponent {
        Some(exp) => Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exp)),
        None => base,
    };
    Ok((input, expr))
}

fn parse_atom(input: &str) -> ParseResult<'_, Expr> {
    ws(alt((
        parse_number,
        delimited(ws(char('(')), parse_expr, char(')')),
        parse_name,
    )))(input)
}

fn parse_number(input: &str) -> ParseResult<'_, Expr> {
    let exponent = || tuple((one_of("eE"), opt(one_of("+-")), digit1));
    map_res(
        alt((
            recognize(tuple((
                digit1,
                opt(pair(char('.'), digit0)),
                opt(exponent()),
            ))),
            recognize(tuple((char('.'), digit1, opt(exponent())))),
        )),
        |text: &str| text.parse::<f64>().map(Expr::Number),
    )(input)
}

fn parse_name(input: &str) -> ParseResult<'_, Expr> {
    let (input, name) = recognize(pair(alpha1, alphanumeric0))(input)?;
    let (input, args) = opt(delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), parse_expr),
        char(')'),
    ))(input)?;

    let expr = match args {
        Some(args) => Expr::Call(name.to_string(), args),
        None => Expr::Constant(name.to_string()),
    };
    Ok((input, expr))
}

//
// ================= Evaluation =================
//

fn expect_args(name: &str, args: &[f64], min: usize, max: usize) -> Result<(), CalcError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("at least {}", min)
        } else {
            format!("{}-{}", min, max)
        };
        return Err(CalcError::InvalidExpression(format!(
            "{}() expects {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn power(base: f64, exponent: f64) -> Result<f64, CalcError> {
    if base == 0.0 && exponent < 0.0 {
        return Err(CalcError::DivisionByZero);
    }
    if base < 0.0 && exponent.fract() != 0.0 {
        return Err(CalcError::MathDomainError(
            "negative base with fractional exponent".to_string(),
        ));
    }
    Ok(base.powf(exponent))
}

fn call(name: &str, args: &[f64]) -> Result<f64, CalcError> {
    let domain = |msg: &str| CalcError::MathDomainError(format!("{}: {}", name, msg));

    match name {
        "abs" => {
            expect_args(name, args, 1, 1)?;
            Ok(args[0].abs())
        }
        "round" => {
            expect_args(name, args, 1, 2)?;
            match args.get(1) {
                None => Ok(args[0].round_ties_even()),
                Some(digits) if digits.fract() == 0.0 => {
                    let scale = 10f64.powi(*digits as i32);
                    Ok((args[0] * scale).round_ties_even() / scale)
                }
                Some(_) => Err(CalcError::InvalidExpression(
                    "round() digits must be an integer".to_string(),
                )),
            }
        }
        "min" => {
            expect_args(name, args, 1, usize::MAX)?;
            Ok(args.iter().copied().fold(f64::INFINITY, f64::min))
        }
        "max" => {
            expect_args(name, args, 1, usize::MAX)?;
            Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max))
        }
        "sum" => Ok(args.iter().sum()),
        "sqrt" => {
            expect_args(name, args, 1, 1)?;
            if args[0] < 0.0 {
                return Err(domain("negative argument"));
            }
            Ok(args[0].sqrt())
        }
        "sin" | "cos" | "tan" | "atan" | "exp" | "floor" | "ceil" => {
            expect_args(name, args, 1, 1)?;
            let x = args[0];
            Ok(match name {
                "sin" => x.sin(),
                "cos" => x.cos(),
                "tan" => x.tan(),
                "atan" => x.atan(),
                "exp" => x.exp(),
                "floor" => x.floor(),
                _ => x.ceil(),
            })
        }
        "asin" | "acos" => {
            expect_args(name, args, 1, 1)?;
            if !(-1.0..=1.0).contains(&args[0]) {
                return Err(domain("argument outside [-1, 1]"));
            }
            Ok(if name == "asin" { args[0].asin() } else { args[0].acos() })
        }
        "log" => {
            expect_args(name, args, 1, 2)?;
            if args[0] <= 0.0 {
                return Err(domain("argument must be positive"));
            }
            match args.get(1) {
                None => Ok(args[0].ln()),
                Some(base) if *base <= 0.0 => Err(domain("base must be positive")),
                Some(base) if *base == 1.0 => Err(CalcError::DivisionByZero),
                Some(base) => Ok(args[0].ln() / base.ln()),
            }
        }
        "log10" => {
            expect_args(name, args, 1, 1)?;
            if args[0] <= 0.0 {
                return Err(domain("argument must be positive"));
            }
            Ok(args[0].log10())
        }
        "pow" => {
            expect_args(name, args, 2, 2)?;
            power(args[0], args[1])
        }
        other => Err(CalcError::InvalidExpression(format!(
            "unrecognized function '{}'",
            other
        ))),
    }
}

impl Expr {
    pub fn eval(&self) -> Result<f64, CalcError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Constant(name) => {
                if !ALLOWED_CONSTANTS.contains(&name.as_str()) {
                    return Err(CalcError::InvalidExpression(format!(
                        "unrecognized name '{}'",
                        name
                    )));
                }
                Ok(if name == "pi" {
                    std::f64::consts::PI
                } else {
                    std::f64::consts::E
                })
            }
            Expr::Neg(inner) => Ok(-inner.eval()?),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval()?;
                let r = rhs.eval()?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div => {
                        if r == 0.0 {
                            Err(CalcError::DivisionByZero)
                        } else {
                            Ok(l / r)
                        }
                    }
                    BinaryOp::Pow => power(l, r),
                }
            }
            Expr::Call(name, args) => {
                if !ALLOWED_FUNCTIONS.contains(&name.as_str()) {
                    return Err(CalcError::InvalidExpression(format!(
                        "unrecognized function '{}'",
                        name
                    )));
                }
                let values = args
                    .iter()
                    .map(Expr::eval)
                    .collect::<Result<Vec<f64>, CalcError>>()?;
                call(name, &values)
            }
        }
    }
}
