//! Predicate expressions over dimension values and record fields.
//!
//! The grammar:
//!
//! ```text
//! expr       := or
//! or         := and ("OR" and)*
//! and        := unary ("AND" unary)*
//! unary      := "NOT"* atom
//! atom       := "(" expr ")" | column ["NOT"] "IN" "(" literal ("," literal)* ")"
//!             | column op literal | literal op column
//! column     := identifier ["." identifier]
//! op         := "=" | "!=" | "<>" | "<" | "<=" | ">" | ">="
//! literal    := integer | decimal | 'string' | "string"
//! ```
//!
//! Keywords are case-insensitive. A bare identifier names a dimension;
//! `element.field` names a field of an element's record. Comparisons between
//! values of different types are false rather than errors.

use std::cmp::Ordering;
use std::fmt;

use chumsky::prelude::*;

use datum_core::{DimensionGraph, Error, Result, Value};

/// A column reference: a dimension, or a field of an element's record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    /// Dimension or element name.
    pub element: String,
    /// Record field, if any.
    pub field: Option<String>,
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{field}", self.element),
            None => f.write_str(&self.element),
        }
    }
}

/// A literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// An integer.
    Int(i64),
    /// A decimal number.
    Float(f64),
    /// A quoted string.
    Str(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{s}'"),
        }
    }
}

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=` or `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CompareOp {
    /// The operator with its operands swapped (`a < b` is `b > a`).
    #[must_use]
    pub const fn flipped(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    const fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => ordering.is_eq(),
            Self::Ne => ordering.is_ne(),
            Self::Lt => ordering.is_lt(),
            Self::Le => ordering.is_le(),
            Self::Gt => ordering.is_gt(),
            Self::Ge => ordering.is_ge(),
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A parsed predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `column op literal`
    Compare {
        /// Left operand.
        column: Identifier,
        /// Operator.
        op: CompareOp,
        /// Right operand.
        value: Literal,
    },
    /// `column [NOT] IN (literal, ...)`
    In {
        /// Tested column.
        column: Identifier,
        /// Allowed values.
        values: Vec<Literal>,
        /// True for `NOT IN`.
        negated: bool,
    },
    /// Conjunction.
    And(Box<Expr>, Box<Expr>),
    /// Disjunction.
    Or(Box<Expr>, Box<Expr>),
    /// Negation.
    Not(Box<Expr>),
}

impl Expr {
    /// Parses an expression.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` describing the first syntax error.
    pub fn parse(text: &str) -> Result<Self> {
        parser().parse(text).map_err(|errors| {
            let detail = errors
                .first()
                .map_or_else(|| "syntax error".to_string(), ToString::to_string);
            Error::InvalidInput(format!("cannot parse expression '{text}': {detail}"))
        })
    }

    /// Every column the expression reads.
    #[must_use]
    pub fn identifiers(&self) -> Vec<&Identifier> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'e>(&'e self, out: &mut Vec<&'e Identifier>) {
        match self {
            Self::Compare { column, .. } | Self::In { column, .. } => out.push(column),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_identifiers(out);
                b.collect_identifiers(out);
            }
            Self::Not(e) => e.collect_identifiers(out),
        }
    }

    /// Checks that every column exists in `graph`: bare names must be
    /// dimensions of the graph, and `element.field` must name a record
    /// field of an element of the graph.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` naming the first unknown column.
    pub fn check(&self, graph: &DimensionGraph) -> Result<()> {
        for id in self.identifiers() {
            let known = match &id.field {
                None => graph.contains(&id.element),
                Some(field) => {
                    graph.contains_element(&id.element)
                        && graph
                            .universe()
                            .get(&id.element)
                            .is_some_and(|e| e.record_fields().iter().any(|f| f.name == *field))
                }
            };
            if !known {
                return Err(Error::InvalidInput(format!(
                    "expression refers to '{id}', which is not in {graph}"
                )));
            }
        }
        Ok(())
    }

    /// Evaluates the expression, reading columns through `resolve`.
    ///
    /// A column that resolves to nothing or to NULL fails every comparison.
    pub fn evaluate<F>(&self, resolve: &F) -> bool
    where
        F: Fn(&Identifier) -> Option<Value>,
    {
        match self {
            Self::Compare { column, op, value } => resolve(column)
                .and_then(|v| compare(&v, value))
                .is_some_and(|ordering| op.accepts(ordering)),
            Self::In {
                column,
                values,
                negated,
            } => {
                let Some(v) = resolve(column) else {
                    return false;
                };
                if v.is_null() {
                    return false;
                }
                let found = values
                    .iter()
                    .any(|literal| compare(&v, literal) == Some(Ordering::Equal));
                found != *negated
            }
            Self::And(a, b) => a.evaluate(resolve) && b.evaluate(resolve),
            Self::Or(a, b) => a.evaluate(resolve) || b.evaluate(resolve),
            Self::Not(e) => !e.evaluate(resolve),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { column, op, value } => write!(f, "{column} {} {value}", op.symbol()),
            Self::In {
                column,
                values,
                negated,
            } => {
                write!(f, "{column} {}IN (", if *negated { "NOT " } else { "" })?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
            Self::And(a, b) => write!(f, "({a} AND {b})"),
            Self::Or(a, b) => write!(f, "({a} OR {b})"),
            Self::Not(e) => write!(f, "NOT {e}"),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn compare(value: &Value, literal: &Literal) -> Option<Ordering> {
    match (value, literal) {
        (Value::Int(a), Literal::Int(b)) => Some(a.cmp(b)),
        (Value::Int(a), Literal::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Literal::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Float(a), Literal::Float(b)) => a.partial_cmp(b),
        (Value::Str(a), Literal::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

const KEYWORDS: [&str; 4] = ["AND", "OR", "NOT", "IN"];

fn keyword(word: &'static str) -> impl Parser<char, (), Error = Simple<char>> + Clone {
    text::ident::<char, Simple<char>>()
        .try_map(move |raw: String, span| {
            if raw.eq_ignore_ascii_case(word) {
                Ok(())
            } else {
                Err(Simple::custom(span, format!("expected {word}")))
            }
        })
        .padded()
}

fn parser() -> impl Parser<char, Expr, Error = Simple<char>> {
    let name = text::ident::<char, Simple<char>>().try_map(|raw: String, span| {
        if KEYWORDS.iter().any(|k| raw.eq_ignore_ascii_case(k)) {
            Err(Simple::custom(span, format!("unexpected keyword {raw}")))
        } else {
            Ok(raw)
        }
    });
    let column = name
        .then(just('.').ignore_then(text::ident()).or_not())
        .map(|(element, field)| Identifier { element, field })
        .padded();

    let number = just('-')
        .or_not()
        .then(text::int::<char, Simple<char>>(10))
        .then(just('.').ignore_then(text::digits(10)).or_not())
        .try_map(|((sign, int), frac), span| {
            let sign = if sign.is_some() { "-" } else { "" };
            match frac {
                None => format!("{sign}{int}")
                    .parse::<i64>()
                    .map(Literal::Int)
                    .map_err(|e| Simple::custom(span, e.to_string())),
                Some(frac) => format!("{sign}{int}.{frac}")
                    .parse::<f64>()
                    .map(Literal::Float)
                    .map_err(|e| Simple::custom(span, e.to_string())),
            }
        });
    let quoted = |q: char| {
        just(q)
            .ignore_then(filter(move |c: &char| *c != q).repeated().collect::<String>())
            .then_ignore(just(q))
    };
    let literal = number
        .or(quoted('\'').map(Literal::Str))
        .or(quoted('"').map(Literal::Str))
        .padded();

    let op = choice((
        just("!=").to(CompareOp::Ne),
        just("<>").to(CompareOp::Ne),
        just("<=").to(CompareOp::Le),
        just(">=").to(CompareOp::Ge),
        just("=").to(CompareOp::Eq),
        just("<").to(CompareOp::Lt),
        just(">").to(CompareOp::Gt),
    ))
    .padded();

    let list = literal
        .clone()
        .separated_by(just(',').padded())
        .at_least(1)
        .delimited_by(just('(').padded(), just(')').padded());

    recursive(|expr| {
        let group = expr.delimited_by(just('(').padded(), just(')').padded());
        let membership = column
            .clone()
            .then(keyword("NOT").or_not())
            .then_ignore(keyword("IN"))
            .then(list)
            .map(|((column, not), values)| Expr::In {
                column,
                values,
                negated: not.is_some(),
            });
        let comparison = column
            .clone()
            .then(op.clone())
            .then(literal.clone())
            .map(|((column, op), value)| Expr::Compare { column, op, value });
        let reversed = literal
            .clone()
            .then(op)
            .then(column)
            .map(|((value, op), column)| Expr::Compare {
                column,
                op: op.flipped(),
                value,
            });
        let atom = choice((group, membership, comparison, reversed));

        let unary = keyword("NOT")
            .repeated()
            .then(atom)
            .foldr(|(), e| Expr::Not(Box::new(e)));
        let and = unary
            .clone()
            .then(keyword("AND").ignore_then(unary).repeated())
            .foldl(|a, b| Expr::And(Box::new(a), Box::new(b)));
        and.clone()
            .then(keyword("OR").ignore_then(and).repeated())
            .foldl(|a, b| Expr::Or(Box::new(a), Box::new(b)))
    })
    .padded()
    .then_ignore(end())
}
