//! A small boolean expression language.
//!
//! Study definitions describe their population and derived flags as text expressions,
//! e.g. `(age >= 18) AND has_follow_up AND NOT care_home_type = 'U'`. Expressions
//! reference study variables (and a handful of registration-table fields) by name and
//! are evaluated against per-patient bindings. Evaluation is pure: the same bindings
//! always produce the same value.

use chrono::NaiveDate;
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};
use thiserror::Error;

use crate::ArcStr;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExprError {
    #[error("unexpected character at byte {0}")]
    Lex(usize),
    #[error("parse error at byte {at}: {message}")]
    Parse { at: usize, message: String },
    #[error("variable \"{0}\" is not defined")]
    Unbound(ArcStr),
    #[error("cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: CmpOp,
        left: &'static str,
        right: &'static str,
    },
}

/// A value a study variable can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// No data. Expected, not exceptional: a patient with no matching events gets
    /// `Missing` for a date variable, not an error.
    Missing,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(ArcStr),
    Date(NaiveDate),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// Boolean interpretation, matching how study texts use non-boolean variables:
    /// a date variable in a boolean position means "has a value".
    pub fn truthy(&self) -> bool {
        match self {
            Value::Missing => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Date(_) => true,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Missing => "missing",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Date(_) => "date",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Missing => Ok(()),
            Value::Bool(b) => write!(f, "{}", u8::from(*b)),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// =
    Eq,
    /// !=
    Neq,
    /// >
    Gt,
    /// >=
    Geq,
    /// <
    Lt,
    /// <=
    Leq,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            CmpOp::Eq => "=",
            CmpOp::Neq => "!=",
            CmpOp::Gt => ">",
            CmpOp::Geq => ">=",
            CmpOp::Lt => "<",
            CmpOp::Leq => "<=",
        })
    }
}

/// Per-patient name lookup for expression evaluation.
pub trait Bindings {
    fn get(&self, name: &str) -> Option<Value>;
}

impl Bindings for std::collections::BTreeMap<ArcStr, Value> {
    fn get(&self, name: &str) -> Option<Value> {
        std::collections::BTreeMap::get(self, name).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Lit(Value),
    Var(ArcStr),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let mut toks = Vec::new();
        for (tok, span) in Tok::lexer(input).spanned() {
            if matches!(tok, Tok::Error) {
                return Err(ExprError::Lex(span.start));
            }
            toks.push((tok, span));
        }
        let mut parser = Parser {
            toks,
            pos: 0,
            end: input.len(),
        };
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(_) => Err(parser.error("expected end of expression")),
        }
    }

    /// The variable names this expression references, in first-use order.
    pub fn names(&self) -> Vec<ArcStr> {
        let mut out = Vec::new();
        self.collect_names(&mut out);
        out
    }

    fn collect_names(&self, out: &mut Vec<ArcStr>) {
        match self {
            Expr::Lit(_) => {}
            Expr::Var(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Not(inner) => inner.collect_names(out),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Cmp(_, l, r) => {
                l.collect_names(out);
                r.collect_names(out);
            }
        }
    }

    pub fn eval(&self, bindings: &dyn Bindings) -> Result<Value, ExprError> {
        match self {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::Var(name) => bindings
                .get(name)
                .ok_or_else(|| ExprError::Unbound(name.clone())),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(bindings)?.truthy())),
            Expr::And(l, r) => {
                if !l.eval(bindings)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(r.eval(bindings)?.truthy()))
            }
            Expr::Or(l, r) => {
                if l.eval(bindings)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(r.eval(bindings)?.truthy()))
            }
            Expr::Cmp(op, l, r) => compare(*op, &l.eval(bindings)?, &r.eval(bindings)?),
        }
    }

    pub fn eval_bool(&self, bindings: &dyn Bindings) -> Result<bool, ExprError> {
        Ok(self.eval(bindings)?.truthy())
    }
}

/// Comparison over two values.
///
/// A `Missing` operand never matches: `=`, `>`, etc. are false and `!=` is true.
/// Mixing incompatible kinds (a date with a number, say) is an error rather than false,
/// since it means the study definition itself is wrong.
fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    use Value::*;
    if left.is_missing() || right.is_missing() {
        return Ok(Bool(matches!(op, CmpOp::Neq)));
    }
    let ord = match (left, right) {
        (Int(a), Int(b)) => a.partial_cmp(b),
        (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
        (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
        (Float(a), Float(b)) => a.partial_cmp(b),
        (Str(a), Str(b)) => Some(a.cmp(b)),
        (Date(a), Date(b)) => Some(a.cmp(b)),
        (Bool(a), Bool(b)) if matches!(op, CmpOp::Eq | CmpOp::Neq) => Some(a.cmp(b)),
        _ => None,
    };
    let ord = ord.ok_or(ExprError::TypeMismatch {
        op,
        left: left.kind(),
        right: right.kind(),
    })?;
    let result = match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Neq => ord != Ordering::Equal,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Geq => ord != Ordering::Less,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Leq => ord != Ordering::Greater,
    };
    Ok(Bool(result))
}

// Lexer

#[derive(Logos, Debug, Clone, PartialEq)]
enum Tok {
    #[error]
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Error,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Ident(String),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse())]
    Float(f64),

    #[regex(r"[0-9]+", |lex| lex.slice().parse())]
    Int(i64),

    #[regex(r"'[^']*'", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_owned()
    })]
    Str(String),

    /// (
    #[token("(")]
    LRound,
    /// )
    #[token(")")]
    RRound,
    #[token(">=")]
    Geq,
    #[token("<=")]
    Leq,
    #[token("!=")]
    Neq,
    #[token("=")]
    Eq,
    #[token(">")]
    Gt,
    #[token("<")]
    Lt,
}

struct Parser {
    toks: Vec<(Tok, std::ops::Range<usize>)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(tok, _)| tok)
    }

    fn at(&self) -> usize {
        self.toks
            .get(self.pos)
            .map(|(_, span)| span.start)
            .unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).map(|(tok, _)| tok.clone());
        self.pos += 1;
        tok
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            at: self.at(),
            message: message.into(),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Tok::Ident(word)) if word.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while self.eat_keyword("or") {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_not()?;
        while self.eat_keyword("and") {
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if self.eat_keyword("not") {
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Tok::Eq) => CmpOp::Eq,
            Some(Tok::Neq) => CmpOp::Neq,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Geq) => CmpOp::Geq,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Leq) => CmpOp::Leq,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_primary()?;
        Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Tok::Ident(word)) => {
                if ["and", "or", "not"]
                    .iter()
                    .any(|kw| word.eq_ignore_ascii_case(kw))
                {
                    return Err(self.error(format!("unexpected keyword \"{word}\"")));
                }
                let name: ArcStr = word.as_str().into();
                self.pos += 1;
                Ok(Expr::Var(name))
            }
            Some(Tok::Int(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(Expr::Lit(Value::Int(n)))
            }
            Some(Tok::Float(n)) => {
                let n = *n;
                self.pos += 1;
                Ok(Expr::Lit(Value::Float(n)))
            }
            Some(Tok::Str(s)) => {
                let s: ArcStr = s.as_str().into();
                self.pos += 1;
                Ok(Expr::Lit(Value::Str(s)))
            }
            Some(Tok::LRound) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Tok::RRound) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            _ => Err(self.error("expected a variable, literal or '('")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn bindings(pairs: &[(&str, Value)]) -> BTreeMap<ArcStr, Value> {
        pairs
            .iter()
            .map(|(name, value)| (ArcStr::from(*name), value.clone()))
            .collect()
    }

    #[test]
    fn population_expression_parses_and_evaluates() {
        let expr = Expr::parse(
            "(age >= 18) AND \n has_follow_up AND NOT \n care_home_type = 'U'",
        )
        .unwrap();
        assert_eq!(
            expr.names(),
            vec![
                ArcStr::from("age"),
                ArcStr::from("has_follow_up"),
                ArcStr::from("care_home_type")
            ]
        );

        let b = bindings(&[
            ("age", Value::Int(44)),
            ("has_follow_up", Value::Bool(true)),
            ("care_home_type", Value::Str("PC".into())),
        ]);
        assert!(expr.eval_bool(&b).unwrap());

        let b = bindings(&[
            ("age", Value::Int(44)),
            ("has_follow_up", Value::Bool(true)),
            ("care_home_type", Value::Str("U".into())),
        ]);
        assert!(!expr.eval_bool(&b).unwrap());

        let b = bindings(&[
            ("age", Value::Int(17)),
            ("has_follow_up", Value::Bool(true)),
            ("care_home_type", Value::Str("PC".into())),
        ]);
        assert!(!expr.eval_bool(&b).unwrap());
    }

    #[test]
    fn or_over_date_variables_uses_truthiness() {
        let expr = Expr::parse(
            "flu_vaccine_tpp_table OR flu_vaccine_med OR flu_vaccine_clinical",
        )
        .unwrap();
        let b = bindings(&[
            ("flu_vaccine_tpp_table", Value::Missing),
            (
                "flu_vaccine_med",
                Value::Date(chrono::NaiveDate::from_ymd_opt(2019, 10, 3).unwrap()),
            ),
            ("flu_vaccine_clinical", Value::Missing),
        ]);
        assert!(expr.eval_bool(&b).unwrap());

        let b = bindings(&[
            ("flu_vaccine_tpp_table", Value::Missing),
            ("flu_vaccine_med", Value::Missing),
            ("flu_vaccine_clinical", Value::Missing),
        ]);
        assert!(!expr.eval_bool(&b).unwrap());
    }

    #[test]
    fn unbound_variable_is_an_error() {
        let expr = Expr::parse("age >= 18").unwrap();
        let b = bindings(&[]);
        assert_eq!(
            expr.eval(&b).unwrap_err(),
            ExprError::Unbound("age".into())
        );
    }

    #[test]
    fn incompatible_comparison_is_an_error() {
        let expr = Expr::parse("age >= 'eighteen'").unwrap();
        let b = bindings(&[("age", Value::Int(20))]);
        assert!(matches!(
            expr.eval(&b).unwrap_err(),
            ExprError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn missing_never_matches_comparisons() {
        let b = bindings(&[("care_home_type", Value::Missing)]);
        let eq = Expr::parse("care_home_type = 'U'").unwrap();
        assert!(!eq.eval_bool(&b).unwrap());
        let neq = Expr::parse("care_home_type != 'U'").unwrap();
        assert!(neq.eval_bool(&b).unwrap());
    }

    #[test]
    fn not_binds_looser_than_comparison() {
        let expr = Expr::parse("NOT care_home_type = 'U'").unwrap();
        let b = bindings(&[("care_home_type", Value::Str("U".into()))]);
        assert!(!expr.eval_bool(&b).unwrap());
        let b = bindings(&[("care_home_type", Value::Str("PS".into()))]);
        assert!(expr.eval_bool(&b).unwrap());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let expr = Expr::parse("weight > 72.5 AND (region = 'London' OR imd < 3)").unwrap();
        let b = bindings(&[
            ("weight", Value::Float(80.0)),
            ("region", Value::Str("London".into())),
            ("imd", Value::Int(5)),
        ]);
        let first = expr.eval(&b).unwrap();
        for _ in 0..10 {
            assert_eq!(expr.eval(&b).unwrap(), first);
        }
    }

    #[test]
    fn parse_errors_carry_positions() {
        assert!(matches!(Expr::parse("age >="), Err(ExprError::Parse { .. })));
        assert!(matches!(Expr::parse("age ? 12"), Err(ExprError::Lex(4))));
        assert!(matches!(
            Expr::parse("(age >= 18"),
            Err(ExprError::Parse { .. })
        ));
    }
}
