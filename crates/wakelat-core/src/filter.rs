//! Datapoint row filters.
//!
//! Users select which datapoints land in the CSV file with two expressions
//! over metric names: `include` (keep matching rows) and `exclude` (drop
//! matching rows). An expression is a scalar predicate such as
//! `CC6% > 0 and WakeLatency < 100`, supporting numeric and string
//! literals, metric references, arithmetic, comparisons, and
//! `and` / `or` / `not` (`&&` / `||` / `!` also accepted).
//!
//! Expressions are parsed up front but bound lazily against the header of
//! the first processed datapoint, because the metric set is not known until
//! then. Binding also applies the `CC1%` ↔ `CC1Derived%` substitution:
//! the two metrics mean the same thing, and whichever one the CSV actually
//! carries is used (with a warning) when the filter references the other.

use std::collections::HashSet;

use crate::datapoint::{Datapoint, Value};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Str(String),
    Metric(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Evaluation result of a (sub-)expression.
#[derive(Debug, Clone, PartialEq)]
enum Eval {
    Num(f64),
    Bool(bool),
    Str(String),
}

/// The include/exclude row filter.
#[derive(Debug, Default)]
pub struct RowFilter {
    include: Option<String>,
    exclude: Option<String>,
    compiled: Option<Expr>,
    bound: bool,
}

impl RowFilter {
    pub fn new(include: Option<String>, exclude: Option<String>) -> Self {
        Self {
            include,
            exclude,
            compiled: None,
            bound: false,
        }
    }

    /// Whether any filtering was requested at all.
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    /// Parse the expressions and bind metric references against the CSV
    /// header. Must be called before [`RowFilter::passes`]; a no-op for an
    /// empty filter.
    pub fn bind(&mut self, header: &[String]) -> Result<()> {
        self.bound = true;
        if self.is_empty() {
            return Ok(());
        }

        // Merge into a single predicate: (include) and not (exclude).
        let include = self
            .include
            .as_deref()
            .map(|text| parse(text))
            .transpose()?;
        let exclude = self
            .exclude
            .as_deref()
            .map(|text| parse(text))
            .transpose()?;

        let mut merged = match (include, exclude) {
            (Some(inc), Some(exc)) => {
                Expr::Binary(BinOp::And, Box::new(inc), Box::new(Expr::Not(Box::new(exc))))
            }
            (Some(inc), None) => inc,
            (None, Some(exc)) => Expr::Not(Box::new(exc)),
            (None, None) => unreachable!(),
        };

        let known: HashSet<&str> = header.iter().map(String::as_str).collect();
        self.rewrite_metrics(&mut merged, &known)?;
        self.compiled = Some(merged);
        Ok(())
    }

    /// Substitute `CC1%` ↔ `CC1Derived%` where needed and reject unknown
    /// metric references.
    fn rewrite_metrics(&self, expr: &mut Expr, known: &HashSet<&str>) -> Result<()> {
        match expr {
            Expr::Metric(name) => {
                if known.contains(name.as_str()) {
                    return Ok(());
                }
                let substitute = match name.as_str() {
                    "CC1%" => "CC1Derived%",
                    "CC1Derived%" => "CC1%",
                    _ => "",
                };
                if !substitute.is_empty() && known.contains(substitute) {
                    log::warn!(
                        "metric '{name}' was not found, using '{substitute}' in the filter \
                         instead"
                    );
                    *name = substitute.to_string();
                    return Ok(());
                }
                Err(self.error(format!(
                    "unknown metric '{name}'. Metric names are case-sensitive; the metrics \
                     present are: {}",
                    known_list(known)
                )))
            }
            Expr::Neg(inner) | Expr::Not(inner) => self.rewrite_metrics(inner, known),
            Expr::Binary(_, lhs, rhs) => {
                self.rewrite_metrics(lhs, known)?;
                self.rewrite_metrics(rhs, known)
            }
            Expr::Num(_) | Expr::Str(_) => Ok(()),
        }
    }

    /// Whether the datapoint passes the filter. Unfiltered runs pass
    /// everything.
    pub fn passes(&self, datapoint: &Datapoint) -> Result<bool> {
        debug_assert!(self.bound, "passes() before bind()");
        let Some(expr) = &self.compiled else {
            return Ok(true);
        };

        match self.eval(expr, datapoint)? {
            Eval::Bool(passed) => Ok(passed),
            other => Err(self.error(format!(
                "the expression evaluates to {other:?} rather than a condition"
            ))),
        }
    }

    fn eval(&self, expr: &Expr, datapoint: &Datapoint) -> Result<Eval> {
        match expr {
            Expr::Num(value) => Ok(Eval::Num(*value)),
            Expr::Str(value) => Ok(Eval::Str(value.clone())),
            Expr::Metric(name) => match datapoint.get(name) {
                Some(Value::Int(v)) => Ok(Eval::Num(*v as f64)),
                Some(Value::Float(v)) => Ok(Eval::Num(*v)),
                Some(Value::Bool(v)) => Ok(Eval::Bool(*v)),
                Some(Value::Name(v)) => Ok(Eval::Str(v.clone())),
                None => Err(self.error(format!(
                    "metric '{name}' is missing from the datapoint:\n{}",
                    datapoint.dump()
                ))),
            },
            Expr::Neg(inner) => match self.eval(inner, datapoint)? {
                Eval::Num(v) => Ok(Eval::Num(-v)),
                other => Err(self.error(format!("cannot negate {other:?}"))),
            },
            Expr::Not(inner) => match self.eval(inner, datapoint)? {
                Eval::Bool(v) => Ok(Eval::Bool(!v)),
                other => Err(self.error(format!("'not' applied to {other:?}"))),
            },
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs, datapoint),
        }
    }

    fn eval_binary(
        &self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        datapoint: &Datapoint,
    ) -> Result<Eval> {
        let lhs = self.eval(lhs, datapoint)?;
        let rhs = self.eval(rhs, datapoint)?;

        // String equality for C-state name comparisons.
        if let (Eval::Str(a), Eval::Str(b)) = (&lhs, &rhs) {
            return match op {
                BinOp::Eq => Ok(Eval::Bool(a == b)),
                BinOp::Ne => Ok(Eval::Bool(a != b)),
                _ => Err(self.error(format!("operator {op:?} is not defined for strings"))),
            };
        }

        if op == BinOp::And || op == BinOp::Or {
            let (Eval::Bool(a), Eval::Bool(b)) = (&lhs, &rhs) else {
                return Err(self.error(format!(
                    "'{}' requires conditions on both sides",
                    if op == BinOp::And { "and" } else { "or" }
                )));
            };
            return Ok(Eval::Bool(if op == BinOp::And { *a && *b } else { *a || *b }));
        }

        let (Eval::Num(a), Eval::Num(b)) = (&lhs, &rhs) else {
            return Err(self.error(format!("operator {op:?} requires numbers, got {lhs:?} and {rhs:?}")));
        };
        let (a, b) = (*a, *b);

        Ok(match op {
            BinOp::Add => Eval::Num(a + b),
            BinOp::Sub => Eval::Num(a - b),
            BinOp::Mul => Eval::Num(a * b),
            BinOp::Div => Eval::Num(a / b),
            BinOp::Lt => Eval::Bool(a < b),
            BinOp::Le => Eval::Bool(a <= b),
            BinOp::Gt => Eval::Bool(a > b),
            BinOp::Ge => Eval::Bool(a >= b),
            BinOp::Eq => Eval::Bool(a == b),
            BinOp::Ne => Eval::Bool(a != b),
            BinOp::And | BinOp::Or => unreachable!(),
        })
    }

    fn error(&self, reason: String) -> Error {
        let expr = match (&self.include, &self.exclude) {
            (Some(inc), Some(exc)) => format!("({inc}) and not ({exc})"),
            (Some(inc), None) => inc.clone(),
            (None, Some(exc)) => format!("not ({exc})"),
            (None, None) => String::new(),
        };
        Error::FilterExpr { expr, reason }
    }
}

fn known_list(known: &HashSet<&str>) -> String {
    let mut metrics: Vec<&str> = known.iter().copied().collect();
    metrics.sort_unstable();
    metrics.join(", ")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(BinOp),
    Not,
    LParen,
    RParen,
}

fn parse(text: &str) -> Result<Expr> {
    let err = |reason: String| Error::FilterExpr {
        expr: text.to_string(),
        reason,
    };

    let tokens = tokenize(text).map_err(&err)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or_expr().map_err(&err)?;
    if parser.pos != parser.tokens.len() {
        return Err(err(format!(
            "unexpected trailing input at token {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

fn tokenize(text: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '<' | '>' | '=' | '!' => {
                let eq = bytes.get(i + 1) == Some(&b'=');
                let token = match (c, eq) {
                    ('<', true) => Token::Op(BinOp::Le),
                    ('<', false) => Token::Op(BinOp::Lt),
                    ('>', true) => Token::Op(BinOp::Ge),
                    ('>', false) => Token::Op(BinOp::Gt),
                    ('=', true) => Token::Op(BinOp::Eq),
                    ('=', false) => return Err("bare '=', use '==' for comparison".to_string()),
                    ('!', true) => Token::Op(BinOp::Ne),
                    ('!', false) => Token::Not,
                    _ => unreachable!(),
                };
                tokens.push(token);
                i += if eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if bytes.get(i + 1) != Some(&bytes[i]) {
                    return Err(format!("bare '{c}', use '{c}{c}'"));
                }
                tokens.push(Token::Op(if c == '&' { BinOp::And } else { BinOp::Or }));
                i += 2;
            }
            '\'' | '"' => {
                let quote = bytes[i];
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end] != quote {
                    end += 1;
                }
                if end == bytes.len() {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Str(text[start..end].to_string()));
                i = end + 1;
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit()
                        || bytes[i] == b'.'
                        || bytes[i] == b'e'
                        || bytes[i] == b'E')
                {
                    i += 1;
                }
                let num: f64 = text[start..i]
                    .parse()
                    .map_err(|_| format!("bad number '{}'", &text[start..i]))?;
                tokens.push(Token::Num(num));
            }
            'A'..='Z' | 'a'..='z' | '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric()
                        || bytes[i] == b'_'
                        || bytes[i] == b'%')
                {
                    i += 1;
                }
                match &text[start..i] {
                    "and" => tokens.push(Token::Op(BinOp::And)),
                    "or" => tokens.push(Token::Op(BinOp::Or)),
                    "not" => tokens.push(Token::Not),
                    ident => tokens.push(Token::Ident(ident.to_string())),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[BinOp]) -> Option<BinOp> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn or_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.and_expr()?;
        while self.eat_op(&[BinOp::Or]).is_some() {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.not_expr()?;
        while self.eat_op(&[BinOp::And]).is_some() {
            let rhs = self.not_expr()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.not_expr()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> std::result::Result<Expr, String> {
        let lhs = self.sum()?;
        let ops = [BinOp::Lt, BinOp::Le, BinOp::Gt, BinOp::Ge, BinOp::Eq, BinOp::Ne];
        if let Some(op) = self.eat_op(&ops) {
            let rhs = self.sum()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn sum(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.product()?;
        while let Some(op) = self.eat_op(&[BinOp::Add, BinOp::Sub]) {
            let rhs = self.product()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn product(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&[BinOp::Mul, BinOp::Div]) {
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.eat_op(&[BinOp::Sub]).is_some() {
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::Num(value)) => {
                self.pos += 1;
                Ok(Expr::Num(value))
            }
            Some(Token::Str(value)) => {
                self.pos += 1;
                Ok(Expr::Str(value))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Expr::Metric(name))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err("missing closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(inner)
            }
            other => Err(format!("expected a value, got {other:?}")),
        }
    }
}
