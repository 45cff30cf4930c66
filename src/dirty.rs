//! Dirty-marker queue and its reconciliation loop.
//!
//! Callback fields cannot be computed inside a trigger, so their triggers
//! only queue `(content_type_id, object_id)` markers. `flush` drains the
//! queue: each marked instance is loaded, its rules recompute, and changed
//! fields are saved. Saving may mark further instances, so the loop runs
//! until the queue is empty.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DenormConfig;
use crate::connection::{Connection, Row};
use crate::denorm::{ChangedFields, Denorm};
use crate::dialect::{Dialect, DialectKind};
use crate::error::{DenormError, DenormResult};
use crate::model::{Instance, ModelGraph, ModelMeta};
use crate::sql::{Action, Expr, InsertValues, Statement, Value};

/// One queued reference to a possibly stale instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirtyMarker {
    pub id: i64,
    pub content_type_id: i64,
    pub object_id: Value,
    pub marked_at: DateTime<Utc>,
}

impl DirtyMarker {
    fn from_row(row: &Row) -> DenormResult<Self> {
        let int = |i: usize, what: &str| {
            row.get(i)
                .and_then(Value::as_i64)
                .ok_or_else(|| crate::internal_error!("dirty marker row has no {}: {:?}", what, row))
        };
        Ok(Self {
            id: int(0, "id")?,
            content_type_id: int(1, "content_type_id")?,
            object_id: row.get(2).cloned().unwrap_or(Value::Null),
            marked_at: parse_timestamp(row.get(3).unwrap_or(&Value::Null))?,
        })
    }
}

/// Timestamps come back as text; the format depends on the backend
pub fn parse_timestamp(value: &Value) -> DenormResult<DateTime<Utc>> {
    let text = match value {
        Value::Text(s) => s.trim(),
        other => {
            return Err(DenormError::SerializationError {
                message: format!("expected timestamp text, got {}", other),
            })
        }
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| DenormError::SerializationError {
            message: format!("invalid timestamp '{}': {}", text, e),
        })
}

/// DDL creating the queue table. The unique pair lets triggers insert
/// markers without checking for an existing one.
pub fn dirty_table_ddl(dialect: &dyn Dialect, config: &DenormConfig) -> String {
    let q = |ident: &str| dialect.quote_ident(ident);
    let (id, timestamp) = match dialect.kind() {
        DialectKind::MySql => (
            "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
            "TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)",
        ),
        DialectKind::Postgres => ("BIGSERIAL PRIMARY KEY", "TIMESTAMPTZ NOT NULL DEFAULT now()"),
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {} {},\n    {} BIGINT NOT NULL,\n    {} BIGINT NOT NULL,\n    {} {},\n    UNIQUE ({}, {})\n)",
        q(&config.dirty_table),
        q("id"),
        id,
        q("content_type_id"),
        q("object_id"),
        q("marked_at"),
        timestamp,
        q("content_type_id"),
        q("object_id"),
    )
}

/// Queue `pk` of `model` for recomputation. Already-queued instances are
/// left as they are.
pub fn mark_dirty(
    conn: &mut dyn Connection,
    config: &DenormConfig,
    model: &ModelMeta,
    pk: &Value,
) -> DenormResult<()> {
    let dialect = conn.dialect();
    let insert = match Action::insert(
        &config.dirty_table,
        &["content_type_id", "object_id"],
        InsertValues::Exprs(vec![Expr::Param(Value::Int(model.content_type_id)), Expr::Param(pk.clone())]),
    ) {
        Action::Insert(insert) => dialect.render_insert(&insert)?,
        Action::Update(_) | Action::Assign(_) => {
            return Err(crate::internal_error!("insert action built as another kind"))
        }
    };
    conn.execute(&insert)?;
    debug!(model = %model.label, pk = %pk, "marked dirty");
    Ok(())
}

/// Every queued marker, oldest first
pub fn pending(conn: &mut dyn Connection, config: &DenormConfig) -> DenormResult<Vec<DirtyMarker>> {
    let dialect = conn.dialect();
    let marked_at = match dialect.kind() {
        DialectKind::Postgres => format!("{}::text", dialect.quote_ident("marked_at")),
        DialectKind::MySql => dialect.quote_ident("marked_at"),
    };
    let query = Statement::raw(format!(
        "SELECT {}, {}, {}, {} FROM {} ORDER BY {}",
        dialect.quote_ident("id"),
        dialect.quote_ident("content_type_id"),
        dialect.quote_ident("object_id"),
        marked_at,
        dialect.quote_ident(&config.dirty_table),
        dialect.quote_ident("id"),
    ));
    conn.query(&query)?.iter().map(DirtyMarker::from_row).collect()
}

fn remove(conn: &mut dyn Connection, config: &DenormConfig, marker: &DirtyMarker) -> DenormResult<()> {
    let dialect = conn.dialect();
    conn.execute(&Statement::new(
        format!(
            "DELETE FROM {} WHERE {} = %s",
            dialect.quote_ident(&config.dirty_table),
            dialect.quote_ident("id")
        ),
        vec![Value::Int(marker.id)],
    ))?;
    Ok(())
}

/// Run every rule of `instance`'s model and save what changed. Returns
/// whether anything was written.
pub fn refresh_instance(
    conn: &mut dyn Connection,
    model: &ModelMeta,
    rules: &[&Arc<dyn Denorm>],
    instance: &mut Instance,
) -> DenormResult<bool> {
    let mut changed = ChangedFields::new();
    for rule in rules {
        changed.extend(rule.update(conn, instance)?);
    }
    if changed.is_empty() {
        return Ok(false);
    }

    let fields: Vec<&str> = changed.keys().map(String::as_str).collect();
    model.save(conn, instance, &fields).map_err(|e| match e {
        DenormError::SaveFailed { .. } => e,
        other => DenormError::SaveFailed {
            model: model.label.clone(),
            pk: instance.get(&model.pk_column).to_string(),
            reason: other.to_string(),
        },
    })?;
    Ok(true)
}

/// Outcome of one `flush`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlushReport {
    pub passes: usize,
    /// Markers consumed
    pub processed: usize,
    /// Instances written back
    pub saved: usize,
}

/// Drain the queue. A marker is only removed once its instance was saved;
/// a failed save aborts with `SaveFailed` and leaves the marker queued.
pub fn flush(
    conn: &mut dyn Connection,
    graph: &ModelGraph,
    rules: &[Arc<dyn Denorm>],
    config: &DenormConfig,
) -> DenormResult<FlushReport> {
    let mut report = FlushReport::default();

    loop {
        let markers = pending(conn, config)?;
        if markers.is_empty() {
            break;
        }
        if let Some(max_passes) = config.flush_max_passes {
            if report.passes >= max_passes {
                return Err(DenormError::FlushPassesExceeded {
                    max_passes,
                    remaining: markers.len(),
                });
            }
        }
        report.passes += 1;
        debug!(pass = report.passes, markers = markers.len(), "flushing dirty queue");

        for marker in &markers {
            let Some(model) = graph.by_content_type(marker.content_type_id) else {
                warn!(content_type_id = marker.content_type_id, "dirty marker for unknown model dropped");
                remove(conn, config, marker)?;
                report.processed += 1;
                continue;
            };

            let model_rules: Vec<&Arc<dyn Denorm>> = rules.iter().filter(|r| r.model() == model.label).collect();
            for mut instance in model.load(conn, Some(&marker.object_id))? {
                if refresh_instance(conn, &model, &model_rules, &mut instance)? {
                    report.saved += 1;
                }
            }
            remove(conn, config, marker)?;
            report.processed += 1;
        }
    }

    if report.processed > 0 {
        info!(passes = report.passes, processed = report.processed, saved = report.saved, "dirty queue flushed");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::SqliteConnection;
    use crate::denorm::CallbackDenorm;
    use crate::dependency::DependOn;
    use crate::dialect::{MySql, Postgres};
    use crate::error::testing::assert_save_failed;
    use crate::model::fixtures;
    use crate::trigger::{TriggerEvent, TriggerSet};
    use chrono::{Datelike, Timelike};

    const SCHEMA: &str = "
        CREATE TABLE shop_order (
            id INTEGER PRIMARY KEY, total INTEGER, line_count INTEGER, tag_weight INTEGER,
            cache_key INTEGER, summary TEXT, customer_id INTEGER
        );
        CREATE TABLE shop_order_tags (id INTEGER PRIMARY KEY, order_id INTEGER, tag_id INTEGER);
        CREATE TABLE shop_line (id INTEGER PRIMARY KEY, amount INTEGER, status TEXT, note TEXT, order_id INTEGER);
        CREATE TABLE denorm_dirtyinstance (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_type_id INTEGER NOT NULL,
            object_id INTEGER NOT NULL,
            marked_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (content_type_id, object_id)
        );
        INSERT INTO shop_order (id) VALUES (1), (2);
    ";

    fn line_summary() -> Arc<dyn Denorm> {
        Arc::new(CallbackDenorm::new(
            "shop.Order",
            "summary",
            vec![DependOn::new("shop.Line")],
            |conn, order| {
                let count = conn.query_value(&Statement::new(
                    "SELECT COUNT(*) FROM shop_line WHERE order_id = %s",
                    vec![order.get("id").clone()],
                ))?;
                Ok(Value::from(format!("{} lines", count)))
            },
        ))
    }

    fn queued(conn: &SqliteConnection) -> i64 {
        conn.scalar("SELECT COUNT(*) FROM denorm_dirtyinstance")
    }

    #[test]
    fn test_parse_backend_timestamps() {
        let mysql = parse_timestamp(&Value::from("2026-10-16 08:30:00")).unwrap();
        assert_eq!((mysql.year(), mysql.hour()), (2026, 8));

        let postgres = parse_timestamp(&Value::from("2026-10-16 08:30:00.25+02")).unwrap();
        assert_eq!(postgres.hour(), 6);

        assert!(parse_timestamp(&Value::from("2026-10-16T08:30:00Z")).is_ok());
        assert!(parse_timestamp(&Value::Int(3)).is_err());
    }

    #[test]
    fn test_queue_table_ddl() {
        let config = DenormConfig::default();
        let pg = dirty_table_ddl(&Postgres, &config);
        assert!(pg.starts_with("CREATE TABLE IF NOT EXISTS \"denorm_dirtyinstance\""));
        assert!(pg.contains("UNIQUE (\"content_type_id\", \"object_id\")"));

        let mysql = dirty_table_ddl(&MySql, &config);
        assert!(mysql.contains("`id` BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY"));
    }

    #[test]
    fn test_mark_dirty_is_idempotent() {
        let graph = fixtures::shop();
        let order = graph.get("shop.Order").unwrap();
        let mut conn = SqliteConnection::open();
        conn.batch(SCHEMA);

        let config = DenormConfig::default();
        mark_dirty(&mut conn, &config, &order, &Value::Int(1)).unwrap();
        mark_dirty(&mut conn, &config, &order, &Value::Int(1)).unwrap();
        mark_dirty(&mut conn, &config, &order, &Value::Int(2)).unwrap();

        let markers = pending(&mut conn, &config).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].content_type_id, 4);
        assert_eq!(markers[0].object_id, Value::Int(1));
    }

    #[test]
    fn test_triggers_queue_and_flush_recomputes() {
        let graph = fixtures::shop();
        let config = DenormConfig::default();
        let rule = line_summary();
        rule.setup(&graph).unwrap();

        // SQLite has no procedural IF, so only the unconditioned triggers go in
        let mut set = TriggerSet::new(DialectKind::MySql, config.clone());
        set.append(
            rule.get_triggers(&MySql, &config)
                .unwrap()
                .into_iter()
                .filter(|t| t.event() != TriggerEvent::Update),
        );

        let mut conn = SqliteConnection::open();
        conn.batch(SCHEMA);
        set.install(&mut conn).unwrap();

        conn.batch("INSERT INTO shop_line (id, order_id) VALUES (1, 1), (2, 1), (3, 2);");
        assert_eq!(queued(&conn), 2);

        let report = flush(&mut conn, &graph, &[rule.clone()], &config).unwrap();
        assert_eq!(report, FlushReport { passes: 1, processed: 2, saved: 2 });
        assert_eq!(queued(&conn), 0);
        assert_eq!(conn.scalar("SELECT COUNT(*) FROM shop_order WHERE id = 1 AND summary = '2 lines'"), 1);

        conn.batch("DELETE FROM shop_line WHERE id = 3;");
        flush(&mut conn, &graph, &[rule], &config).unwrap();
        assert_eq!(conn.scalar("SELECT COUNT(*) FROM shop_order WHERE id = 2 AND summary = '0 lines'"), 1);
    }

    #[test]
    fn test_cycle_stops_at_max_passes() {
        let graph = Arc::new(fixtures::shop());
        let config = DenormConfig {
            flush_max_passes: Some(3),
            ..DenormConfig::default()
        };

        // each order marks the other one, forever
        let marking_graph = graph.clone();
        let marking_config = config.clone();
        let rule: Arc<dyn Denorm> = Arc::new(CallbackDenorm::new("shop.Order", "summary", vec![], move |conn, order| {
            let other = if order.get("id").as_i64() == Some(1) { 2 } else { 1 };
            let meta = marking_graph.get("shop.Order")?;
            mark_dirty(conn, &marking_config, &meta, &Value::Int(other))?;
            Ok(Value::from("looping"))
        }));
        rule.setup(&graph).unwrap();

        let mut conn = SqliteConnection::open();
        conn.batch(SCHEMA);
        let order = graph.get("shop.Order").unwrap();
        mark_dirty(&mut conn, &config, &order, &Value::Int(1)).unwrap();

        match flush(&mut conn, &graph, &[rule], &config) {
            Err(DenormError::FlushPassesExceeded { max_passes, remaining }) => {
                assert_eq!(max_passes, 3);
                assert!(remaining > 0);
            }
            other => panic!("expected FlushPassesExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_save_keeps_marker() {
        let graph = fixtures::shop();
        let config = DenormConfig::default();
        let rule = line_summary();
        rule.setup(&graph).unwrap();

        let mut conn = SqliteConnection::open();
        conn.batch(SCHEMA);
        conn.batch("CREATE TRIGGER frozen BEFORE UPDATE ON shop_order BEGIN SELECT RAISE(ABORT, 'order is frozen'); END;");

        let order = graph.get("shop.Order").unwrap();
        mark_dirty(&mut conn, &config, &order, &Value::Int(1)).unwrap();

        let reason = assert_save_failed(flush(&mut conn, &graph, &[rule], &config), "shop.Order", "1");
        assert!(reason.contains("order is frozen"));
        assert_eq!(queued(&conn), 1);
    }

    #[test]
    fn test_marker_for_deleted_instance_is_consumed() {
        let graph = fixtures::shop();
        let config = DenormConfig::default();
        let mut conn = SqliteConnection::open();
        conn.batch(SCHEMA);

        let order = graph.get("shop.Order").unwrap();
        mark_dirty(&mut conn, &config, &order, &Value::Int(99)).unwrap();
        conn.batch("INSERT INTO denorm_dirtyinstance (content_type_id, object_id) VALUES (404, 1);");

        let report = flush(&mut conn, &graph, &[line_summary()], &config).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.saved, 0);
        assert_eq!(queued(&conn), 0);
    }
}
