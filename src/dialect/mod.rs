//! Backend SQL dialects.
//!
//! A [`Dialect`] renders the backend-neutral fragment and trigger model to
//! SQL. The provided methods cover syntax both supported backends share;
//! implementations override the rest. Adding a backend means implementing
//! this trait, nothing else.

mod mysql;
mod postgres;

use serde::{Deserialize, Serialize};

use crate::config::DenormConfig;
use crate::error::{DenormError, DenormResult};
use crate::sql::{AssignAction, Expr, InsertAction, NestedSelect, RowAlias, Statement, UpdateAction, Value};
use crate::trigger::{Condition, Trigger};

pub use mysql::MySql;
pub use postgres::Postgres;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    MySql,
    Postgres,
}

impl DialectKind {
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            DialectKind::MySql => &MySql,
            DialectKind::Postgres => &Postgres,
        }
    }
}

/// Something that must exist before triggers can be created
#[derive(Debug, Clone, PartialEq)]
pub struct Prerequisite {
    pub description: String,
    /// Returns at least one row when the prerequisite is present
    pub check: Statement,
    pub create: Statement,
}

pub trait Dialect: Send + Sync {
    fn kind(&self) -> DialectKind;

    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String;

    fn quote_literal(&self, value: &Value) -> String;

    /// Longest identifier the backend keeps
    fn max_identifier_len(&self) -> usize;

    /// Characters the trigger name must leave free for derived names
    /// (e.g. the wrapper function's prefix)
    fn reserved_name_len(&self) -> usize {
        0
    }

    /// Whether DDL participates in transactions
    fn transactional_ddl(&self) -> bool;

    /// NULL-safe "differs" test between two rendered expressions
    fn distinct(&self, left: &str, right: &str) -> String;

    fn random_bigint(&self) -> DenormResult<String> {
        Err(DenormError::UnsupportedFragment {
            fragment: "RandomBigInt".to_string(),
            dialect: self.name().to_string(),
        })
    }

    fn render_insert(&self, action: &InsertAction) -> DenormResult<Statement> {
        Err(DenormError::UnsupportedFragment {
            fragment: format!("insert into {}", action.table),
            dialect: self.name().to_string(),
        })
    }

    /// Whether a row trigger may write to the table it fires on. Where it
    /// may not, rules rewrite the triggering row from a BEFORE trigger.
    fn updates_triggering_table(&self) -> bool {
        true
    }

    fn render_assign(&self, action: &AssignAction) -> DenormResult<Statement> {
        Err(DenormError::UnsupportedFragment {
            fragment: format!("assignment to NEW.{} on {}", action.column, action.table),
            dialect: self.name().to_string(),
        })
    }

    /// Full DDL for one trigger whose action body is already rendered
    fn render_trigger(&self, name: &str, trigger: &Trigger, body: Statement) -> DenormResult<Statement>;

    /// Statements removing one installed trigger (and anything it owns)
    fn drop_trigger(&self, table: &str, name: &str) -> Vec<Statement>;

    /// Catalog query returning `(table, trigger_name)` rows for every
    /// trigger whose name starts with `prefix`
    fn list_triggers(&self, prefix: &str) -> Statement;

    /// Catalog query returning names of helper routines (trigger functions)
    /// whose names start with `prefix`, for backends that create them
    fn list_routines(&self, _prefix: &str) -> Option<Statement> {
        None
    }

    fn drop_routine(&self, _name: &str) -> Option<Statement> {
        None
    }

    fn prerequisites(&self, _config: &DenormConfig) -> Vec<Prerequisite> {
        Vec::new()
    }

    /// Whether a failed prerequisite creation only means it already exists
    fn is_already_exists(&self, _error: &DenormError) -> bool {
        false
    }

    fn row_ref(&self, alias: &RowAlias, column: &str) -> String {
        match alias {
            RowAlias::New => format!("NEW.{}", self.quote_ident(column)),
            RowAlias::Old => format!("OLD.{}", self.quote_ident(column)),
            RowAlias::Table(table) => {
                format!("{}.{}", self.quote_ident(table), self.quote_ident(column))
            }
        }
    }

    fn render_expr(&self, expr: &Expr) -> DenormResult<Statement> {
        Ok(match expr {
            Expr::Column(c) => Statement::raw(self.quote_ident(c)),
            Expr::Row(alias, c) => Statement::raw(self.row_ref(alias, c)),
            Expr::Param(v) => Statement::new("%s", vec![v.clone()]),
            Expr::Int(i) => Statement::raw(i.to_string()),
            Expr::Random(_) => Statement::raw(self.random_bigint()?),
            Expr::Add(l, r) => {
                Statement::join([self.render_expr(l)?, self.render_expr(r)?], " + ")
            }
            Expr::Sub(l, r) => {
                Statement::join([self.render_expr(l)?, self.render_expr(r)?], " - ")
            }
            Expr::Coalesce(l, r) => {
                let mut out = Statement::raw("COALESCE(");
                out.push(Statement::join([self.render_expr(l)?, self.render_expr(r)?], ", "));
                out.push_sql(")");
                out
            }
            Expr::Subquery(s) => s.clone().parenthesized(),
        })
    }

    /// `l1 = r1 AND l2 = r2 ...`
    fn render_equalities(&self, pairs: &[(Expr, Expr)]) -> DenormResult<Statement> {
        let parts = pairs
            .iter()
            .map(|(l, r)| Ok(Statement::join([self.render_expr(l)?, self.render_expr(r)?], " = ")))
            .collect::<DenormResult<Vec<_>>>()?;
        Ok(Statement::join(parts, " AND "))
    }

    fn render_nested_select(&self, select: &NestedSelect) -> DenormResult<Statement> {
        let columns = select
            .columns
            .iter()
            .map(|c| self.render_expr(c))
            .collect::<DenormResult<Vec<_>>>()?;

        let mut out = Statement::raw("SELECT DISTINCT ");
        out.push(Statement::join(columns, ", "));
        out.push_sql(&format!(" FROM {}", self.quote_ident(&select.table)));
        if !select.filters.is_empty() {
            out.push_sql(" WHERE ");
            out.push(self.render_equalities(&select.filters)?);
        }
        Ok(out)
    }

    fn render_update(&self, action: &UpdateAction) -> DenormResult<Statement> {
        if action.columns.len() != action.values.len() {
            return Err(crate::internal_error!(
                "update of {} has {} columns but {} values",
                action.table,
                action.columns.len(),
                action.values.len()
            ));
        }

        let assignments = action
            .columns
            .iter()
            .zip(&action.values)
            .map(|(column, value)| {
                let mut part = Statement::raw(format!("{} = ", self.quote_ident(column)));
                part.push(self.render_expr(value)?);
                Ok(part)
            })
            .collect::<DenormResult<Vec<_>>>()?;

        let mut out = Statement::raw(format!("UPDATE {} SET ", self.quote_ident(&action.table)));
        out.push(Statement::join(assignments, ", "));
        if !action.where_clause.is_empty() {
            out.push_sql(" WHERE ");
            out.push(action.where_clause.clone());
        }
        Ok(out)
    }

    /// `INSERT INTO t (cols) VALUES (...)` / `INSERT INTO t (cols) SELECT ...`
    /// without any duplicate handling; implementations add their own.
    fn render_plain_insert(&self, verb: &str, action: &InsertAction) -> DenormResult<Statement> {
        let columns: Vec<String> = action.columns.iter().map(|c| self.quote_ident(c)).collect();
        let mut out = Statement::raw(format!(
            "{} {} ({}) ",
            verb,
            self.quote_ident(&action.table),
            columns.join(", ")
        ));
        match &action.values {
            crate::sql::InsertValues::Exprs(values) => {
                let values = values
                    .iter()
                    .map(|v| self.render_expr(v))
                    .collect::<DenormResult<Vec<_>>>()?;
                out.push_sql("VALUES (");
                out.push(Statement::join(values, ", "));
                out.push_sql(")");
            }
            crate::sql::InsertValues::Select(select) => {
                out.push(self.render_nested_select(select)?);
            }
        }
        Ok(out)
    }

    /// Guard `body` so it only runs when a tracked field changed
    fn render_condition(&self, condition: &Condition, body: Statement) -> DenormResult<Statement> {
        match condition {
            Condition::FieldChange(change) => {
                let tests: Vec<String> = change
                    .fields()
                    .iter()
                    .map(|f| {
                        format!(
                            "({})",
                            self.distinct(&self.row_ref(&RowAlias::Old, f), &self.row_ref(&RowAlias::New, f))
                        )
                    })
                    .collect();
                let mut out = Statement::raw(format!("IF ({}) THEN\n        ", tests.join(" OR ")));
                out.push(body);
                out.push_sql("\n    END IF;");
                Ok(out)
            }
        }
    }
}
