//! PostgreSQL extension surface.
//!
//! [`SpiConnection`] runs statements through the server programming
//! interface inside the calling transaction. The SQL functions here let a
//! fresh backend list and drop installed triggers without any rules
//! registered.

use pgrx::prelude::*;
use pgrx::{AnyNumeric, PgBuiltInOids};
use tracing::debug;

use crate::config::DenormConfig;
use crate::connection::{Connection, Row};
use crate::dialect::{Dialect, DialectKind, Postgres};
use crate::error::{DenormError, DenormResult};
use crate::sql::{Statement, Value};
use crate::trigger::TriggerSet;

/// Connection over SPI. Parameters are bound client-side through the
/// PostgreSQL literal quoter; SPI runs in the caller's transaction, so
/// begin/commit are no-ops.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiConnection;

fn spi_error(operation: &str, e: pgrx::spi::Error) -> DenormError {
    DenormError::database(operation, None, e.to_string())
}

fn read_column(row: &pgrx::spi::SpiHeapTupleData, ordinal: usize) -> Result<Value, pgrx::spi::Error> {
    let entry = row.get_datum_by_ordinal(ordinal)?;
    let oid = entry.oid();

    let value = if oid == PgBuiltInOids::INT2OID.value() {
        entry.value::<i16>()?.map(|v| Value::Int(i64::from(v)))
    } else if oid == PgBuiltInOids::INT4OID.value() {
        entry.value::<i32>()?.map(|v| Value::Int(i64::from(v)))
    } else if oid == PgBuiltInOids::INT8OID.value() {
        entry.value::<i64>()?.map(Value::Int)
    } else if oid == PgBuiltInOids::BOOLOID.value() {
        entry.value::<bool>()?.map(Value::Bool)
    } else if oid == PgBuiltInOids::FLOAT4OID.value() {
        entry.value::<f32>()?.map(|v| Value::Float(f64::from(v)))
    } else if oid == PgBuiltInOids::FLOAT8OID.value() {
        entry.value::<f64>()?.map(Value::Float)
    } else if oid == PgBuiltInOids::NUMERICOID.value() {
        entry.value::<AnyNumeric>()?.map(|v| Value::Text(v.to_string()))
    } else {
        entry.value::<String>()?.map(Value::Text)
    };
    Ok(value.unwrap_or(Value::Null))
}

impl Connection for SpiConnection {
    fn dialect(&self) -> &'static dyn Dialect {
        &Postgres
    }

    fn execute(&mut self, statement: &Statement) -> DenormResult<u64> {
        let sql = statement.inline(&Postgres)?;
        debug!(sql = %sql, "spi execute");
        Spi::connect(|mut client| client.update(&sql, None, None).map(|table| table.len() as u64))
            .map_err(|e| spi_error("execute", e))
    }

    fn query(&mut self, statement: &Statement) -> DenormResult<Vec<Row>> {
        let sql = statement.inline(&Postgres)?;
        Spi::connect(|client| {
            let table = client.select(&sql, None, None)?;
            let columns = table.columns()?;
            let mut rows = Vec::with_capacity(table.len());
            for row in table {
                let values = (1..=columns)
                    .map(|i| read_column(&row, i))
                    .collect::<Result<Row, _>>()?;
                rows.push(values);
            }
            Ok::<_, pgrx::spi::Error>(rows)
        })
        .map_err(|e| spi_error("query", e))
    }

    fn execute_script(&mut self, sql: &str) -> DenormResult<()> {
        Spi::run(sql).map_err(|e| spi_error("execute script", e))
    }
}

fn config_for(prefix: &str) -> Result<DenormConfig, String> {
    DenormConfig {
        trigger_prefix: prefix.to_string(),
        ..DenormConfig::default()
    }
    .normalized()
    .map_err(|e| e.to_string())
}

/// SQL function: drop every trigger and trigger function carrying `prefix`
///
/// Usage: SELECT denorm_drop_triggers();
#[pg_extern]
fn denorm_drop_triggers(prefix: default!(&str, "'denorm'")) -> Result<i64, String> {
    let config = config_for(prefix)?;
    TriggerSet::drop(&mut SpiConnection, &config)
        .map(|n| n as i64)
        .map_err(|e| format!("Failed to drop triggers: {}", e))
}

/// SQL function: installed triggers carrying `prefix`
#[pg_extern]
fn denorm_list_triggers(
    prefix: default!(&str, "'denorm'"),
) -> Result<TableIterator<'static, (name!(table_name, String), name!(trigger_name, String))>, String> {
    let config = config_for(prefix)?;
    let installed = TriggerSet::installed(&mut SpiConnection, &config)
        .map_err(|e| format!("Failed to list triggers: {}", e))?;
    Ok(TableIterator::new(installed))
}

/// SQL function: DDL of the dirty-marker queue table
#[pg_extern]
fn denorm_dirty_table_ddl(table: default!(&str, "'denorm_dirtyinstance'")) -> Result<String, String> {
    let config = DenormConfig {
        dirty_table: table.to_string(),
        ..DenormConfig::default()
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(crate::dirty::dirty_table_ddl(DialectKind::Postgres.dialect(), &config))
}

#[cfg(feature = "pg_test")]
#[pg_schema]
mod tests {
    use std::sync::Arc;

    use pgrx::prelude::*;

    use super::SpiConnection;
    use crate::config::DenormConfig;
    use crate::denorm::{AggregateDenorm, CacheKeyDenorm, Denorm};
    use crate::dependency::DependOn;
    use crate::dialect::DialectKind;
    use crate::model::{Field, ModelGraph, ModelMeta};
    use crate::predicate::Filter;
    use crate::registry::Registry;
    use crate::trigger::TriggerSet;

    fn graph() -> ModelGraph {
        let mut graph = ModelGraph::new();
        graph
            .insert(
                ModelMeta::new("shop.Order", "pg_order", "id", 1)
                    .with_field(Field::plain("total"))
                    .with_field(Field::plain("paid_count"))
                    .with_field(Field::plain("cache_key")),
            )
            .unwrap();
        graph
            .insert(
                ModelMeta::new("shop.Line", "pg_line", "id", 2)
                    .with_field(Field::plain("amount"))
                    .with_field(Field::plain("status"))
                    .with_field(Field::foreign_key("order", "order_id", "shop.Order")),
            )
            .unwrap();
        graph
    }

    fn tables() {
        Spi::run(
            "CREATE TABLE pg_order (id INT8 PRIMARY KEY, total INT8 NOT NULL DEFAULT 0, \
             paid_count INT8 NOT NULL DEFAULT 0, cache_key INT8);
             CREATE TABLE pg_line (id INT8 PRIMARY KEY, amount INT8, status TEXT, order_id INT8);
             INSERT INTO pg_order (id) VALUES (1), (2);",
        )
        .unwrap();
        Spi::run(&crate::dirty::dirty_table_ddl(DialectKind::Postgres.dialect(), &DenormConfig::default())).unwrap();
    }

    fn registry() -> Registry {
        let rules: Vec<Arc<dyn Denorm>> = vec![
            Arc::new(AggregateDenorm::sum("shop.Order", "total", DependOn::new("shop.Line"), "amount")),
            Arc::new(
                AggregateDenorm::count("shop.Order", "paid_count", DependOn::new("shop.Line"))
                    .filter(Filter::new().exact("status", "paid")),
            ),
            Arc::new(CacheKeyDenorm::new("shop.Order", "cache_key", vec![DependOn::new("shop.Line")])),
        ];
        let mut registry = Registry::new();
        for rule in rules {
            registry.register(rule).unwrap();
        }
        registry.setup(graph()).unwrap();
        registry
    }

    fn order(column: &str, id: i64) -> Option<i64> {
        Spi::get_one::<i64>(&format!("SELECT {} FROM pg_order WHERE id = {}", column, id)).unwrap()
    }

    #[pg_test]
    fn test_incremental_sum_and_count() {
        tables();
        registry().install(&mut SpiConnection).unwrap();

        Spi::run(
            "INSERT INTO pg_line VALUES (1, 5, 'paid', 1), (2, 7, 'draft', 1), (3, -2, 'paid', 1)",
        )
        .unwrap();
        assert_eq!(order("total", 1), Some(10));
        assert_eq!(order("paid_count", 1), Some(2));

        Spi::run("UPDATE pg_line SET status = 'paid', amount = 8 WHERE id = 2").unwrap();
        assert_eq!(order("total", 1), Some(11));
        assert_eq!(order("paid_count", 1), Some(3));

        Spi::run("UPDATE pg_line SET order_id = 2 WHERE id = 1").unwrap();
        assert_eq!(order("total", 1), Some(6));
        assert_eq!(order("total", 2), Some(5));

        Spi::run("DELETE FROM pg_line WHERE id = 3").unwrap();
        assert_eq!(order("total", 1), Some(8));
        assert_eq!(order("paid_count", 1), Some(1));
    }

    #[pg_test]
    fn test_cache_key_changes_with_dependency() {
        tables();
        registry().install(&mut SpiConnection).unwrap();

        Spi::run("INSERT INTO pg_order (id) VALUES (3)").unwrap();
        let before = order("cache_key", 3);
        assert!(before.is_some());
        Spi::run("INSERT INTO pg_line VALUES (1, 5, 'paid', 3)").unwrap();
        assert_ne!(order("cache_key", 3), before);
    }

    #[pg_test]
    fn test_rebuild_matches_triggers() {
        tables();
        let registry = registry();
        Spi::run("INSERT INTO pg_line VALUES (1, 5, 'paid', 1), (2, 7, 'draft', 1)").unwrap();
        registry.rebuild_all(&mut SpiConnection, None, None).unwrap();
        assert_eq!(order("total", 1), Some(12));
        assert_eq!(order("paid_count", 1), Some(1));
    }

    #[pg_test]
    fn test_drop_from_sql() {
        tables();
        let installed = registry().install(&mut SpiConnection).unwrap();

        let listed = Spi::get_one::<i64>("SELECT count(*) FROM denorm_list_triggers()").unwrap();
        assert_eq!(listed, Some(installed as i64));

        let dropped = Spi::get_one::<i64>("SELECT denorm_drop_triggers()").unwrap();
        assert_eq!(dropped, Some(installed as i64));

        let functions = Spi::get_one::<i64>(
            "SELECT count(*) FROM pg_catalog.pg_proc WHERE proname LIKE 'func\\_denorm\\_%'",
        )
        .unwrap();
        assert_eq!(functions, Some(0));
        assert!(TriggerSet::installed(&mut SpiConnection, &DenormConfig::default())
            .unwrap()
            .is_empty());
    }

    #[pg_test]
    fn test_install_twice_is_idempotent() {
        tables();
        let registry = registry();
        let first = registry.install(&mut SpiConnection).unwrap();
        let second = registry.install(&mut SpiConnection).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            TriggerSet::installed(&mut SpiConnection, registry.config()).unwrap().len(),
            first
        );
        assert_eq!(registry.build_trigger_set(DialectKind::Postgres).unwrap().len(), first);
    }
}
