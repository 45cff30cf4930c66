//! SQL text plus bound parameters.
//!
//! Every fragment in this crate renders to a [`Statement`]: SQL text with
//! DB-API style `%s` placeholders and the values bound to them, in order.
//! A literal percent sign in the text is written `%%`. Values only enter SQL
//! text through [`Statement::inline`], which quotes them with the dialect's
//! literal quoter.

pub mod fragment;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};

pub use fragment::{
    Action, AssignAction, Expr, InsertAction, InsertValues, NestedSelect, RandomBigInt, UpdateAction,
};

/// A bound value or a value read back from the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Identity keys of a collection-valued field
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Equality that treats `Int(3)` and `Float(3.0)` as the same number.
    /// Aggregates come back as either depending on the backend and column type.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Which row image a trigger-time reference reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowAlias {
    New,
    Old,
    /// A regular table reference, for predicates evaluated in subqueries
    /// and in full recomputes
    Table(String),
}

impl RowAlias {
    /// The opposite trigger row; table aliases are returned unchanged
    pub fn flip(&self) -> RowAlias {
        match self {
            RowAlias::New => RowAlias::Old,
            RowAlias::Old => RowAlias::New,
            RowAlias::Table(t) => RowAlias::Table(t.clone()),
        }
    }
}

/// `(sql_text, parameter_sequence)`
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self { sql: sql.into(), params }
    }

    /// Statement without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }

    pub fn push_sql(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    /// Append another statement's text and parameters
    pub fn push(&mut self, other: Statement) -> &mut Self {
        self.sql.push_str(&other.sql);
        self.params.extend(other.params);
        self
    }

    /// Join statements with a separator, keeping parameter order
    pub fn join(parts: impl IntoIterator<Item = Statement>, separator: &str) -> Statement {
        let mut out = Statement::default();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                out.sql.push_str(separator);
            }
            out.push(part);
        }
        out
    }

    /// Wrap the text in parentheses
    pub fn parenthesized(self) -> Statement {
        Statement {
            sql: format!("({})", self.sql),
            params: self.params,
        }
    }

    /// Make the text end with exactly one semicolon
    pub fn terminated(self) -> Statement {
        let trimmed = self.sql.trim_end().trim_end_matches(';').trim_end();
        Statement {
            sql: format!("{};", trimmed),
            params: self.params,
        }
    }

    pub fn placeholder_count(&self) -> usize {
        let mut count = 0;
        let mut chars = self.sql.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '%' {
                match chars.peek() {
                    Some('s') => {
                        count += 1;
                        chars.next();
                    }
                    Some('%') => {
                        chars.next();
                    }
                    _ => {}
                }
            }
        }
        count
    }

    /// Final SQL text with every parameter bound client-side as a quoted
    /// literal. DDL cannot take server-side bind parameters (trigger bodies
    /// live inside the DDL text), so installation and `print_sql` use this.
    pub fn inline(&self, dialect: &dyn Dialect) -> DenormResult<String> {
        let mut params = self.params.iter();
        self.substitute(|_| params.next().map(|v| dialect.quote_literal(v)))
    }

    /// `$1, $2, ...` placeholders for native PostgreSQL drivers
    pub fn numbered(&self) -> DenormResult<String> {
        self.substitute(|i| Some(format!("${}", i + 1)))
    }

    /// `?` placeholders for MySQL and SQLite drivers
    pub fn positional(&self) -> DenormResult<String> {
        self.substitute(|_| Some("?".to_string()))
    }

    fn substitute(&self, mut replace: impl FnMut(usize) -> Option<String>) -> DenormResult<String> {
        let expected = self.placeholder_count();
        if expected != self.params.len() {
            return Err(DenormError::ParameterMismatch {
                placeholders: expected,
                params: self.params.len(),
            });
        }

        let mut out = String::with_capacity(self.sql.len());
        let mut index = 0;
        let mut chars = self.sql.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    let text = replace(index).ok_or(DenormError::ParameterMismatch {
                        placeholders: expected,
                        params: index,
                    })?;
                    out.push_str(&text);
                    index += 1;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            }
        }
        Ok(out)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.sql)
        } else {
            let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
            write!(f, "{} -- [{}]", self.sql, params.join(", "))
        }
    }
}
