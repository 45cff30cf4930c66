//! Connections for unit tests.
//!
//! [`CatalogConnection`] keeps an in-memory trigger catalog by reading the
//! DDL it is handed. [`SqliteConnection`] runs MySQL-dialect statements on
//! an in-memory SQLite database, which accepts the row trigger grammar.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dialect::{Dialect, DialectKind};
use crate::error::{DenormError, DenormResult};
use crate::sql::{Statement, Value};

use super::{Connection, Row};

static CREATE_TRIGGER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"CREATE TRIGGER [`"]([^`"]+)[`"]\s+\w+ \w+ ON [`"]([^`"]+)[`"]"#)
        .unwrap_or_else(|e| panic!("create trigger pattern: {e}"))
});

static DROP_TRIGGER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"DROP TRIGGER IF EXISTS [`"]([^`"]+)[`"]"#)
        .unwrap_or_else(|e| panic!("drop trigger pattern: {e}"))
});

static CREATE_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"CREATE OR REPLACE FUNCTION "([^"]+)""#)
        .unwrap_or_else(|e| panic!("create function pattern: {e}"))
});

static DROP_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"DROP FUNCTION IF EXISTS "([^"]+)""#)
        .unwrap_or_else(|e| panic!("drop function pattern: {e}"))
});

/// Fake catalog: tracks triggers and functions created and dropped
/// through it, answers the catalog queries the dialects issue
pub struct CatalogConnection {
    kind: DialectKind,
    /// trigger name -> (table, DDL)
    pub triggers: BTreeMap<String, (String, String)>,
    pub functions: BTreeSet<String>,
    pub executed: Vec<String>,
    pub language_present: bool,
    /// Any SQL containing this text fails with a permission error
    pub fail_on: Option<String>,
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
}

impl CatalogConnection {
    pub fn new(kind: DialectKind) -> Self {
        Self {
            kind,
            triggers: BTreeMap::new(),
            functions: BTreeSet::new(),
            executed: Vec::new(),
            language_present: true,
            fail_on: None,
            begins: 0,
            commits: 0,
            rollbacks: 0,
        }
    }

    /// Trigger name -> DDL, for comparing installations
    pub fn definitions(&self) -> BTreeMap<String, String> {
        self.triggers
            .iter()
            .map(|(name, (_, ddl))| (name.clone(), ddl.clone()))
            .collect()
    }

    fn apply(&mut self, sql: &str) -> DenormResult<()> {
        self.executed.push(sql.to_string());

        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(DenormError::database(
                    "execute",
                    Some("42501".to_string()),
                    format!("permission denied: {}", needle),
                ));
            }
        }

        if sql.starts_with("CREATE LANGUAGE") {
            if self.language_present {
                return Err(DenormError::database(
                    "execute",
                    Some("42710".to_string()),
                    "language \"plpgsql\" already exists",
                ));
            }
            self.language_present = true;
        }

        for caps in DROP_TRIGGER.captures_iter(sql) {
            self.triggers.remove(&caps[1]);
        }
        for caps in DROP_FUNCTION.captures_iter(sql) {
            self.functions.remove(&caps[1]);
        }
        for caps in CREATE_FUNCTION.captures_iter(sql) {
            self.functions.insert(caps[1].to_string());
        }
        for caps in CREATE_TRIGGER.captures_iter(sql) {
            let name = caps[1].to_string();
            if self.triggers.contains_key(&name) {
                return Err(DenormError::database(
                    "execute",
                    Some("42710".to_string()),
                    format!("trigger \"{}\" already exists", name),
                ));
            }
            self.triggers.insert(name, (caps[2].to_string(), sql.to_string()));
        }
        Ok(())
    }

    /// Prefix a catalog LIKE pattern (`denorm\_%`) stands for
    fn like_prefix(statement: &Statement) -> String {
        statement
            .params
            .first()
            .and_then(Value::as_str)
            .map(|p| p.trim_end_matches('%').replace("\\_", "_"))
            .unwrap_or_default()
    }
}

impl Connection for CatalogConnection {
    fn dialect(&self) -> &'static dyn Dialect {
        self.kind.dialect()
    }

    fn execute(&mut self, statement: &Statement) -> DenormResult<u64> {
        let sql = statement.inline(self.dialect())?;
        self.apply(&sql)?;
        Ok(0)
    }

    fn query(&mut self, statement: &Statement) -> DenormResult<Vec<Row>> {
        let sql = &statement.sql;
        if sql.contains("pg_language") {
            return Ok(if self.language_present {
                vec![vec![Value::from("plpgsql")]]
            } else {
                Vec::new()
            });
        }

        let prefix = Self::like_prefix(statement);
        if sql.contains("pg_proc") {
            return Ok(self
                .functions
                .iter()
                .filter(|f| f.starts_with(&prefix))
                .map(|f| vec![Value::from(f.as_str())])
                .collect());
        }

        Ok(self
            .triggers
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, (table, _))| vec![Value::from(table.as_str()), Value::from(name.as_str())])
            .collect())
    }

    fn execute_script(&mut self, sql: &str) -> DenormResult<()> {
        self.apply(sql)
    }

    fn begin(&mut self) -> DenormResult<()> {
        self.begins += 1;
        Ok(())
    }

    fn commit(&mut self) -> DenormResult<()> {
        self.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> DenormResult<()> {
        self.rollbacks += 1;
        Ok(())
    }
}

/// In-memory SQLite speaking the MySQL dialect
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    pub fn open() -> Self {
        let conn = rusqlite::Connection::open_in_memory()
            .unwrap_or_else(|e| panic!("open in-memory sqlite: {e}"));
        Self { conn }
    }

    /// Run fixture SQL directly
    pub fn batch(&self, sql: &str) {
        self.conn
            .execute_batch(sql)
            .unwrap_or_else(|e| panic!("fixture sql failed: {e}\n{sql}"));
    }

    /// SQLite rendition of the default dirty-marker queue table
    pub fn create_dirty_table(&self) {
        self.batch(
            "CREATE TABLE denorm_dirtyinstance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_type_id INTEGER NOT NULL,
                object_id INTEGER NOT NULL,
                marked_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE (content_type_id, object_id)
            );",
        );
    }

    pub fn scalar(&self, sql: &str) -> i64 {
        self.conn
            .query_row(sql, [], |row| row.get(0))
            .unwrap_or_else(|e| panic!("scalar query failed: {e}\n{sql}"))
    }

    fn translate(sql: &str) -> String {
        sql.replace("INSERT IGNORE INTO", "INSERT OR IGNORE INTO")
    }

    fn to_sqlite(value: &Value) -> DenormResult<rusqlite::types::Value> {
        use rusqlite::types::Value as Sql;
        Ok(match value {
            Value::Null => Sql::Null,
            Value::Bool(b) => Sql::Integer(i64::from(*b)),
            Value::Int(i) => Sql::Integer(*i),
            Value::Float(f) => Sql::Real(*f),
            Value::Text(s) => Sql::Text(s.clone()),
            Value::List(_) => {
                return Err(DenormError::UnsupportedFragment {
                    fragment: "list parameter".to_string(),
                    dialect: "sqlite".to_string(),
                })
            }
        })
    }

    fn from_sqlite(value: rusqlite::types::ValueRef<'_>) -> Value {
        use rusqlite::types::ValueRef;
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Int(i),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(t) | ValueRef::Blob(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        }
    }

    fn error(operation: &str, e: rusqlite::Error) -> DenormError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(failure, _) => Some(failure.extended_code.to_string()),
            _ => None,
        };
        DenormError::database(operation, code, e.to_string())
    }

    fn prepare(statement: &Statement) -> DenormResult<(String, Vec<rusqlite::types::Value>)> {
        // trigger catalog lookups map onto sqlite_master
        if statement.sql.contains("information_schema.TRIGGERS") {
            let like = statement.params.first().cloned().unwrap_or(Value::Null);
            return Ok((
                "SELECT tbl_name, name FROM sqlite_master WHERE type = 'trigger' AND name LIKE ? ESCAPE '\\'"
                    .to_string(),
                vec![Self::to_sqlite(&like)?],
            ));
        }

        let sql = Self::translate(&statement.positional()?);
        let params = statement
            .params
            .iter()
            .map(Self::to_sqlite)
            .collect::<DenormResult<Vec<_>>>()?;
        Ok((sql, params))
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> &'static dyn Dialect {
        DialectKind::MySql.dialect()
    }

    fn execute(&mut self, statement: &Statement) -> DenormResult<u64> {
        let (sql, params) = Self::prepare(statement)?;
        let changed = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(params))
            .map_err(|e| Self::error("execute", e))?;
        Ok(changed as u64)
    }

    fn query(&mut self, statement: &Statement) -> DenormResult<Vec<Row>> {
        let (sql, params) = Self::prepare(statement)?;
        let mut stmt = self.conn.prepare(&sql).map_err(|e| Self::error("prepare", e))?;
        let column_count = stmt.column_count();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params))
            .map_err(|e| Self::error("query", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| Self::error("fetch", e))? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = row.get_ref(i).map_err(|e| Self::error("read column", e))?;
                values.push(Self::from_sqlite(value));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute_script(&mut self, sql: &str) -> DenormResult<()> {
        self.conn
            .execute_batch(&Self::translate(sql))
            .map_err(|e| Self::error("execute script", e))
    }
}
