//! Process-wide list of denormalization rules.
//!
//! Rules are registered at startup, set up once the model graph is known,
//! and consumed by install/drop/rebuild/flush. The free functions operate
//! on one global [`Registry`]; tests build their own instances.

use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::config::DenormConfig;
use crate::connection::Connection;
use crate::denorm::Denorm;
use crate::dialect::DialectKind;
use crate::dirty::{self, FlushReport};
use crate::error::{DenormError, DenormResult};
use crate::model::ModelGraph;
use crate::trigger::TriggerSet;

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::new()));

#[derive(Debug, Default)]
pub struct Registry {
    rules: Vec<Arc<dyn Denorm>>,
    config: DenormConfig,
    graph: Option<Arc<ModelGraph>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Registering the same rule instance again is a no-op and
    /// returns `false`; a different rule for an owned (model, field) pair
    /// is refused.
    pub fn register(&mut self, rule: Arc<dyn Denorm>) -> DenormResult<bool> {
        if self.rules.iter().any(|r| Arc::ptr_eq(r, &rule)) {
            return Ok(false);
        }

        if let Some(graph) = &self.graph {
            if let Ok(meta) = graph.get(rule.model()) {
                if meta.swapped {
                    return Err(DenormError::SwappedModel {
                        model: rule.model().to_string(),
                    });
                }
            }
        }

        if self
            .rules
            .iter()
            .any(|r| r.model() == rule.model() && r.field_name() == rule.field_name())
        {
            return Err(DenormError::DuplicateRegistration {
                model: rule.model().to_string(),
                field: rule.field_name().to_string(),
            });
        }

        debug!(model = rule.model(), field = rule.field_name(), "registered denorm");
        self.rules.push(rule);
        Ok(true)
    }

    pub fn reset(&mut self) {
        self.rules.clear();
        self.graph = None;
    }

    pub fn rules(&self) -> &[Arc<dyn Denorm>] {
        &self.rules
    }

    pub fn configure(&mut self, config: DenormConfig) -> DenormResult<()> {
        self.config = config.normalized()?;
        Ok(())
    }

    pub fn config(&self) -> &DenormConfig {
        &self.config
    }

    pub fn graph(&self) -> DenormResult<&ModelGraph> {
        self.graph.as_deref().ok_or_else(|| DenormError::ConfigError {
            setting: "models".to_string(),
            value: "none".to_string(),
            reason: "registry has not been set up with a model graph".to_string(),
        })
    }

    /// Resolve every rule against `graph`
    pub fn setup(&mut self, graph: ModelGraph) -> DenormResult<()> {
        for rule in &self.rules {
            if graph.get(rule.model())?.swapped {
                return Err(DenormError::SwappedModel {
                    model: rule.model().to_string(),
                });
            }
            rule.setup(&graph)?;
        }
        for rule in &self.rules {
            let written: Vec<String> = self
                .rules
                .iter()
                .filter(|r| r.model() == rule.model() && !Arc::ptr_eq(r, rule))
                .filter_map(|r| r.self_written_column().map(str::to_string))
                .collect();
            rule.ignore_owner_columns(&written)?;
        }
        info!(rules = self.rules.len(), "denorm rules set up");
        self.graph = Some(Arc::new(graph));
        Ok(())
    }

    pub fn build_trigger_set(&self, dialect: DialectKind) -> DenormResult<TriggerSet> {
        let mut set = TriggerSet::new(dialect, self.config.clone());
        for rule in &self.rules {
            set.append(rule.get_triggers(dialect.dialect(), &self.config)?);
        }
        Ok(set)
    }

    pub fn install(&self, conn: &mut dyn Connection) -> DenormResult<usize> {
        self.build_trigger_set(conn.dialect().kind())?.install(conn)
    }

    pub fn drop(&self, conn: &mut dyn Connection) -> DenormResult<usize> {
        TriggerSet::drop(conn, &self.config)
    }

    pub fn print_sql(&self, dialect: DialectKind) -> DenormResult<Vec<String>> {
        self.build_trigger_set(dialect)?.print_sql()
    }

    /// Recompute matching rules for every instance of their models, save
    /// changed rows, then flush the dirty queue the saves may have filled.
    /// Returns the number of instances written, flushed ones included.
    pub fn rebuild_all(
        &self,
        conn: &mut dyn Connection,
        model: Option<&str>,
        field: Option<&str>,
    ) -> DenormResult<usize> {
        let graph = self.graph()?;
        let selected: Vec<&Arc<dyn Denorm>> = self
            .rules
            .iter()
            .filter(|r| model.is_none_or(|m| r.model() == m))
            .filter(|r| field.is_none_or(|f| r.field_name() == f))
            .collect();
        if selected.is_empty() {
            warn!(?model, ?field, "no denorm matches rebuild filter");
            return Ok(0);
        }

        let mut models: Vec<&str> = Vec::new();
        for rule in &selected {
            if !models.contains(&rule.model()) {
                models.push(rule.model());
            }
        }

        let mut saved = 0;
        for label in models {
            let meta = graph.get(label)?;
            let rules: Vec<&Arc<dyn Denorm>> = selected.iter().copied().filter(|r| r.model() == label).collect();
            for mut instance in meta.load(conn, None)? {
                if dirty::refresh_instance(conn, &meta, &rules, &mut instance)? {
                    saved += 1;
                }
            }
            debug!(model = label, "rebuilt denormalized fields");
        }

        let flushed = self.flush(conn)?;
        saved += flushed.saved;
        info!(saved, flushed = flushed.processed, "rebuild finished");
        Ok(saved)
    }

    pub fn flush(&self, conn: &mut dyn Connection) -> DenormResult<FlushReport> {
        dirty::flush(conn, self.graph()?, &self.rules, &self.config)
    }
}

fn registry() -> RwLockReadGuard<'static, Registry> {
    REGISTRY.read().unwrap_or_else(PoisonError::into_inner)
}

fn registry_mut() -> RwLockWriteGuard<'static, Registry> {
    REGISTRY.write().unwrap_or_else(PoisonError::into_inner)
}

pub fn register(rule: Arc<dyn Denorm>) -> DenormResult<bool> {
    registry_mut().register(rule)
}

/// Forget every rule and the model graph
pub fn reset() {
    registry_mut().reset();
}

pub fn all() -> Vec<Arc<dyn Denorm>> {
    registry().rules().to_vec()
}

pub fn configure(config: DenormConfig) -> DenormResult<()> {
    registry_mut().configure(config)
}

pub fn config() -> DenormConfig {
    registry().config().clone()
}

pub fn setup(graph: ModelGraph) -> DenormResult<()> {
    registry_mut().setup(graph)
}

pub fn build_trigger_set(dialect: DialectKind) -> DenormResult<TriggerSet> {
    registry().build_trigger_set(dialect)
}

pub fn install_triggers(conn: &mut dyn Connection) -> DenormResult<usize> {
    registry().install(conn)
}

pub fn drop_triggers(conn: &mut dyn Connection) -> DenormResult<usize> {
    Registry::drop(&registry(), conn)
}

pub fn print_sql(dialect: DialectKind) -> DenormResult<Vec<String>> {
    registry().print_sql(dialect)
}

pub fn rebuild_all(conn: &mut dyn Connection, model: Option<&str>, field: Option<&str>) -> DenormResult<usize> {
    registry().rebuild_all(conn, model, field)
}

pub fn flush(conn: &mut dyn Connection) -> DenormResult<FlushReport> {
    registry().flush(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{CatalogConnection, SqliteConnection};
    use crate::denorm::{AggregateDenorm, CacheKeyDenorm, CallbackDenorm};
    use crate::dependency::DependOn;
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::{fixtures, ModelMeta};
    use crate::sql::Value;

    fn order_rules() -> Vec<Arc<dyn Denorm>> {
        vec![
            Arc::new(AggregateDenorm::sum("shop.Order", "total", DependOn::new("shop.Line"), "amount")),
            Arc::new(AggregateDenorm::count("shop.Order", "line_count", DependOn::new("shop.Line"))),
            Arc::new(CacheKeyDenorm::new("shop.Order", "cache_key", vec![DependOn::new("shop.Tag")])),
        ]
    }

    fn populated() -> Registry {
        let mut registry = Registry::new();
        for rule in order_rules() {
            registry.register(rule).unwrap();
        }
        registry.setup(fixtures::shop()).unwrap();
        registry
    }

    #[test]
    fn test_register_dedupes_by_identity() {
        let mut registry = Registry::new();
        let rule: Arc<dyn Denorm> = Arc::new(CallbackDenorm::new("shop.Order", "summary", vec![], |_, _| Ok(Value::Null)));
        assert!(registry.register(rule.clone()).unwrap());
        assert!(!registry.register(rule).unwrap());
        assert_eq!(registry.rules().len(), 1);

        // equal configuration, different instance
        let twin: Arc<dyn Denorm> = Arc::new(CallbackDenorm::new("shop.Order", "summary", vec![], |_, _| Ok(Value::Null)));
        assert_error_sqlstate(registry.register(twin), "42710");
    }

    #[test]
    fn test_swapped_model_refused() {
        let mut graph = ModelGraph::new();
        let mut user = ModelMeta::new("auth.User", "auth_user", "id", 1);
        user.swapped = true;
        graph.insert(user).unwrap();

        let mut registry = Registry::new();
        registry
            .register(Arc::new(CallbackDenorm::new("auth.User", "id", vec![], |_, _| Ok(Value::Null))))
            .unwrap();
        assert_error_sqlstate(registry.setup(graph), "42P16");
    }

    #[test]
    fn test_reset_empties_registry() {
        let mut registry = populated();
        registry.reset();
        assert!(registry.rules().is_empty());
        assert!(registry.graph().is_err());
    }

    #[test]
    fn test_install_and_drop_through_registry() {
        let registry = populated();
        let mut conn = CatalogConnection::new(DialectKind::Postgres);

        let installed = registry.install(&mut conn).unwrap();
        // 3 + 3 aggregate triggers, 2 self + 6 tag triggers for the cache key
        assert_eq!(installed, 14);
        assert_eq!(conn.triggers.len(), 14);

        let sql = registry.print_sql(DialectKind::Postgres).unwrap();
        assert_eq!(sql.len(), 14);
        assert!(sql.iter().all(|s| s.contains("CREATE TRIGGER \"denorm_")));

        assert_eq!(registry.drop(&mut conn).unwrap(), 14);
        assert!(conn.triggers.is_empty());
        assert!(conn.functions.is_empty());
    }

    #[test]
    fn test_rebuild_repairs_drift() {
        let registry = populated();
        let mut conn = SqliteConnection::open();
        conn.batch(
            "CREATE TABLE shop_order (
                id INTEGER PRIMARY KEY, total INTEGER, line_count INTEGER, tag_weight INTEGER,
                cache_key INTEGER, summary TEXT, customer_id INTEGER
            );
            CREATE TABLE shop_order_tags (id INTEGER PRIMARY KEY, order_id INTEGER, tag_id INTEGER);
            CREATE TABLE shop_line (id INTEGER PRIMARY KEY, amount INTEGER, status TEXT, note TEXT, order_id INTEGER);
            INSERT INTO shop_order (id, total, line_count) VALUES (1, 999, 999), (2, 0, 0);
            INSERT INTO shop_line (id, amount, order_id) VALUES (1, 4, 1), (2, 6, 1);",
        );
        conn.create_dirty_table();

        let saved = registry.rebuild_all(&mut conn, Some("shop.Order"), Some("total")).unwrap();
        assert_eq!(saved, 1);
        assert_eq!(conn.scalar("SELECT total FROM shop_order WHERE id = 1"), 10);
        // line_count was not selected
        assert_eq!(conn.scalar("SELECT line_count FROM shop_order WHERE id = 1"), 999);

        registry.rebuild_all(&mut conn, None, None).unwrap();
        assert_eq!(conn.scalar("SELECT line_count FROM shop_order WHERE id = 1"), 2);
        assert_eq!(conn.scalar("SELECT COUNT(*) FROM shop_order WHERE cache_key IS NOT NULL"), 2);

        assert_eq!(registry.rebuild_all(&mut conn, Some("shop.Nope"), None).unwrap(), 0);
    }

    #[test]
    fn test_rebuild_flushes_markers_it_created() {
        let graph = Arc::new(fixtures::shop());
        let config = DenormConfig::default();

        // refreshing order 1 queues order 2
        let marking_graph = graph.clone();
        let marking_config = config.clone();
        let rule: Arc<dyn Denorm> = Arc::new(CallbackDenorm::new("shop.Order", "summary", vec![], move |conn, order| {
            let id = order.get("id").as_i64().unwrap_or_default();
            if id == 1 {
                let meta = marking_graph.get("shop.Order")?;
                dirty::mark_dirty(conn, &marking_config, &meta, &Value::Int(2))?;
            }
            Ok(Value::from(format!("order {}", id)))
        }));

        let mut registry = Registry::new();
        registry.register(rule).unwrap();
        registry.setup(fixtures::shop()).unwrap();

        let mut conn = SqliteConnection::open();
        conn.batch(
            "CREATE TABLE shop_order (
                id INTEGER PRIMARY KEY, total INTEGER, line_count INTEGER, tag_weight INTEGER,
                cache_key INTEGER, summary TEXT, customer_id INTEGER
            );
            INSERT INTO shop_order (id) VALUES (1), (2);",
        );
        conn.create_dirty_table();

        // two rebuilt rows, order 2 found unchanged by the flush
        assert_eq!(registry.rebuild_all(&mut conn, None, None).unwrap(), 2);
        assert!(dirty::pending(&mut conn, &config).unwrap().is_empty());
        assert_eq!(conn.scalar("SELECT COUNT(*) FROM shop_order WHERE summary = 'order 2'"), 1);
    }

    #[test]
    fn test_rebuild_needs_setup() {
        let registry = Registry::new();
        let mut conn = CatalogConnection::new(DialectKind::MySql);
        assert_error_sqlstate(registry.rebuild_all(&mut conn, None, None), "22023");
    }

    #[test]
    fn test_global_registry_round_trip() {
        reset();
        let rule: Arc<dyn Denorm> = Arc::new(AggregateDenorm::count("shop.Order", "line_count", DependOn::new("shop.Line")));
        assert!(register(rule.clone()).unwrap());
        assert!(!register(rule).unwrap());
        setup(fixtures::shop()).unwrap();
        assert_eq!(all().len(), 1);
        assert_eq!(build_trigger_set(DialectKind::MySql).unwrap().len(), 3);
        assert_eq!(config(), DenormConfig::default());
        reset();
        assert!(all().is_empty());
    }
}
