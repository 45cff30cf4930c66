//! Filter predicates over related rows.
//!
//! Aggregate rules carry a filter (rows that count) and an exclude (rows
//! that do not). The same predicates are compiled against the trigger
//! pseudo-rows for incremental updates and against the related table for
//! full recomputes.

use crate::dialect::Dialect;
use crate::sql::{RowAlias, Statement, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Exact(Value),
    NotEqual(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    In(Vec<Value>),
    IsNull(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub lookup: Lookup,
}

impl Predicate {
    /// Whether the predicate can be true for a NULL column value
    fn matches_null(&self) -> bool {
        matches!(
            self.lookup,
            Lookup::Exact(Value::Null) | Lookup::IsNull(true) | Lookup::NotEqual(Value::Null)
        )
    }

    fn compile(&self, alias: &RowAlias, dialect: &dyn Dialect) -> Statement {
        let column = dialect.row_ref(alias, &self.column);
        let compare = |op: &str, value: &Value| Statement::new(format!("{} {} %s", column, op), vec![value.clone()]);

        match &self.lookup {
            Lookup::Exact(Value::Null) | Lookup::IsNull(true) => Statement::raw(format!("{} IS NULL", column)),
            Lookup::NotEqual(Value::Null) | Lookup::IsNull(false) => {
                Statement::raw(format!("{} IS NOT NULL", column))
            }
            Lookup::Exact(v) => compare("=", v),
            Lookup::NotEqual(v) => compare("<>", v),
            Lookup::Lt(v) => compare("<", v),
            Lookup::Lte(v) => compare("<=", v),
            Lookup::Gt(v) => compare(">", v),
            Lookup::Gte(v) => compare(">=", v),
            Lookup::In(values) if values.is_empty() => Statement::raw("1 = 0"),
            Lookup::In(values) => {
                let placeholders = vec!["%s"; values.len()].join(", ");
                Statement::new(format!("{} IN ({})", column, placeholders), values.clone())
            }
        }
    }
}

/// Conjunction of predicates
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    predicates: Vec<Predicate>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn with(mut self, column: &str, lookup: Lookup) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            lookup,
        });
        self
    }

    pub fn exact(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, Lookup::Exact(value.into()))
    }

    /// Columns the filter reads
    pub fn columns(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for p in &self.predicates {
            if !out.contains(&p.column.as_str()) {
                out.push(&p.column);
            }
        }
        out
    }
}

/// Turns filter/exclude declarations into a WHERE fragment evaluated
/// against one row alias
pub trait PredicateCompiler: Send + Sync {
    /// `None` when neither filter nor exclude constrains anything
    fn compile(&self, filter: &Filter, exclude: &Filter, alias: &RowAlias, dialect: &dyn Dialect) -> Option<Statement>;
}

/// Column comparisons joined with AND. The exclude block is negated as a
/// whole; each comparison inside it also requires a non-NULL column so a
/// NULL does not turn the negation into NULL and drop the row.
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnPredicateCompiler;

impl PredicateCompiler for ColumnPredicateCompiler {
    fn compile(&self, filter: &Filter, exclude: &Filter, alias: &RowAlias, dialect: &dyn Dialect) -> Option<Statement> {
        let mut parts: Vec<Statement> = filter.predicates.iter().map(|p| p.compile(alias, dialect)).collect();

        if !exclude.is_empty() {
            let negated: Vec<Statement> = exclude
                .predicates
                .iter()
                .map(|p| {
                    let mut part = p.compile(alias, dialect);
                    if !p.matches_null() {
                        part.push_sql(&format!(" AND {} IS NOT NULL", dialect.row_ref(alias, &p.column)));
                    }
                    part
                })
                .collect();
            let mut not = Statement::raw("NOT ");
            not.push(Statement::join(negated, " AND ").parenthesized());
            parts.push(not);
        }

        if parts.is_empty() {
            None
        } else {
            Some(Statement::join(parts, " AND "))
        }
    }
}
