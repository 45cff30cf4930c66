//! Database access seam.
//!
//! Everything that talks to a live database (install, drop, recompute,
//! flush) does so through [`Connection`]. The crate ships no driver of its
//! own; the `pg` feature adds one backed by the PostgreSQL server
//! programming interface.

#[cfg(test)]
pub mod testing;

use crate::dialect::Dialect;
use crate::error::DenormResult;
use crate::sql::{Statement, Value};

/// One result row, columns in SELECT order
pub type Row = Vec<Value>;

pub trait Connection {
    /// Dialect statements for this connection are rendered in
    fn dialect(&self) -> &'static dyn Dialect;

    /// Run a statement, returning the number of affected rows
    fn execute(&mut self, statement: &Statement) -> DenormResult<u64>;

    fn query(&mut self, statement: &Statement) -> DenormResult<Vec<Row>>;

    /// Run SQL text that may hold several statements and procedural
    /// blocks. Trigger DDL goes through here with parameters already
    /// inlined.
    fn execute_script(&mut self, sql: &str) -> DenormResult<()>;

    fn begin(&mut self) -> DenormResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> DenormResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> DenormResult<()> {
        Ok(())
    }

    /// First column of the first row, `Null` when there is no row
    fn query_value(&mut self, statement: &Statement) -> DenormResult<Value> {
        Ok(self
            .query(statement)?
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(Value::Null))
    }
}
