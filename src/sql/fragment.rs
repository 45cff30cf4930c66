//! Building blocks of trigger bodies.
//!
//! Fragments are plain data. A [`Dialect`](crate::dialect::Dialect) renders
//! them; nothing here knows about quoting or backend syntax.

use super::{RowAlias, Statement, Value};

/// Database-evaluated random integer over the signed 64-bit range. Each
/// evaluation inside the database yields an independent value, so
/// concurrent trigger firings never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RandomBigInt;

/// Scalar expression used for SET values, SELECT columns and equality
/// filters
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Unqualified column of the statement's target table
    Column(String),
    /// `NEW.col`, `OLD.col` or `table.col`
    Row(RowAlias, String),
    /// Bound parameter
    Param(Value),
    /// Integer constant written into the SQL text
    Int(i64),
    Random(RandomBigInt),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Coalesce(Box<Expr>, Box<Expr>),
    /// Already-rendered scalar subquery
    Subquery(Statement),
}

impl Expr {
    pub fn column(name: &str) -> Expr {
        Expr::Column(name.to_string())
    }

    pub fn row(alias: RowAlias, column: &str) -> Expr {
        Expr::Row(alias, column.to_string())
    }

    pub fn plus(self, other: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(other))
    }

    pub fn minus(self, other: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(other))
    }

    pub fn or_zero(self) -> Expr {
        Expr::Coalesce(Box::new(self), Box::new(Expr::Int(0)))
    }
}

/// `SELECT DISTINCT <columns> FROM <table> WHERE <l1 = r1 AND ...>`
#[derive(Debug, Clone, PartialEq)]
pub struct NestedSelect {
    pub table: String,
    pub columns: Vec<Expr>,
    pub filters: Vec<(Expr, Expr)>,
}

impl NestedSelect {
    pub fn new(table: &str, columns: Vec<Expr>) -> Self {
        Self {
            table: table.to_string(),
            columns,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, left: Expr, right: Expr) -> Self {
        self.filters.push((left, right));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertValues {
    Exprs(Vec<Expr>),
    Select(NestedSelect),
}

/// Insert that treats a unique-constraint violation as "already there"
#[derive(Debug, Clone, PartialEq)]
pub struct InsertAction {
    pub table: String,
    pub columns: Vec<String>,
    pub values: InsertValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAction {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Expr>,
    pub where_clause: Statement,
}

/// Overwrite a column of the row being written. Only valid in a BEFORE
/// trigger on `table`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignAction {
    pub table: String,
    pub column: String,
    pub value: Expr,
}

/// One statement in a trigger body
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Insert(InsertAction),
    Update(UpdateAction),
    Assign(AssignAction),
}

impl Action {
    pub fn insert(table: &str, columns: &[&str], values: InsertValues) -> Action {
        Action::Insert(InsertAction {
            table: table.to_string(),
            columns: columns.iter().map(ToString::to_string).collect(),
            values,
        })
    }

    pub fn update(table: &str, column: &str, value: Expr, where_clause: Statement) -> Action {
        Action::Update(UpdateAction {
            table: table.to_string(),
            columns: vec![column.to_string()],
            values: vec![value],
            where_clause,
        })
    }

    pub fn assign(table: &str, column: &str, value: Expr) -> Action {
        Action::Assign(AssignAction {
            table: table.to_string(),
            column: column.to_string(),
            value,
        })
    }

    pub fn table(&self) -> &str {
        match self {
            Action::Insert(a) => &a.table,
            Action::Update(a) => &a.table,
            Action::Assign(a) => &a.table,
        }
    }
}
