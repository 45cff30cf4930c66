use once_cell::sync::OnceCell;
use rand::Rng;

use crate::config::DenormConfig;
use crate::connection::Connection;
use crate::dependency::{DependOn, Effect};
use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};
use crate::model::{Instance, ModelGraph, ModelMeta};
use crate::sql::{Action, Expr, RandomBigInt, RowAlias, Statement, Value};
use crate::trigger::{Condition, Subject, Trigger, TriggerEvent, TriggerTime};

use super::{Denorm, RuleBase};

/// Integer column rewritten with a fresh random value whenever the owner
/// row or any dependency changes. Readers compare keys to detect staleness
/// of anything cached under them.
#[derive(Debug)]
pub struct CacheKeyDenorm {
    base: RuleBase,
    /// Owner columns whose changes keep the key
    skip: Vec<String>,
    /// Owner columns other rules rewrite on every owner write
    ignored: OnceCell<Vec<String>>,
}

impl CacheKeyDenorm {
    pub fn new(model: &str, field: &str, depend_on: Vec<DependOn>) -> Self {
        Self {
            base: RuleBase::new(model, field, depend_on),
            skip: Vec::new(),
            ignored: OnceCell::new(),
        }
    }

    pub fn skip<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(columns.into_iter().map(Into::into));
        self
    }

    fn touch_row(owner: &ModelMeta, key_column: &str, dialect: &dyn Dialect) -> Action {
        Action::update(
            &owner.table,
            key_column,
            Expr::Random(RandomBigInt),
            Statement::raw(format!(
                "{} = {}",
                dialect.quote_ident(&owner.pk_column),
                dialect.row_ref(&RowAlias::New, &owner.pk_column)
            )),
        )
    }

    /// Triggers on the owner's own table. Inserts always get a new key;
    /// updates only when a tracked column changed. The key column and the
    /// columns other rules rewrite are never tracked, so no trigger write
    /// fires a key trigger again.
    ///
    /// Where a trigger may not write its own table the key is set on the
    /// incoming row from a BEFORE trigger instead.
    fn self_triggers(&self, dialect: &dyn Dialect) -> DenormResult<Vec<Trigger>> {
        let bound = self.base.bound()?;
        let owner = &bound.owner;
        let key_column = self.base.column()?;
        let ignored = self.ignored.get().map(Vec::as_slice).unwrap_or_default();

        let tracked: Vec<String> = owner
            .columns()
            .into_iter()
            .filter(|c| *c != key_column)
            .filter(|c| !self.skip.iter().chain(ignored).any(|s| s == c))
            .map(str::to_string)
            .collect();

        let (time, action) = if dialect.updates_triggering_table() {
            (TriggerTime::After, Self::touch_row(owner, key_column, dialect))
        } else {
            (TriggerTime::Before, Action::assign(&owner.table, key_column, Expr::Random(RandomBigInt)))
        };

        let subject = Subject::for_model(owner);
        let mut triggers = vec![Trigger::new(subject.clone(), time, TriggerEvent::Insert, vec![action.clone()])];
        if !tracked.is_empty() {
            let condition = Condition::field_change(subject.table(), tracked)?;
            triggers.push(Trigger::new(subject, time, TriggerEvent::Update, vec![action]).with_condition(condition));
        }
        Ok(triggers)
    }
}

impl Denorm for CacheKeyDenorm {
    fn model(&self) -> &str {
        &self.base.model
    }

    fn field_name(&self) -> &str {
        &self.base.field
    }

    fn setup(&self, graph: &ModelGraph) -> DenormResult<()> {
        self.base.setup(graph)?;
        self.base.column().map(|_| ())
    }

    fn self_written_column(&self) -> Option<&str> {
        self.base.column().ok()
    }

    fn ignore_owner_columns(&self, columns: &[String]) -> DenormResult<()> {
        let key_column = self.base.column()?;
        let others = columns.iter().filter(|c| *c != key_column).cloned().collect();
        self.ignored.set(others).map_err(|_| DenormError::AlreadySetUp {
            model: self.base.model.clone(),
            field: self.base.field.clone(),
        })
    }

    /// A fresh random key; a recompute always invalidates
    fn value(&self, _conn: &mut dyn Connection, _instance: &Instance) -> DenormResult<Value> {
        Ok(Value::Int(rand::thread_rng().gen::<i64>()))
    }

    fn get_triggers(&self, dialect: &dyn Dialect, config: &DenormConfig) -> DenormResult<Vec<Trigger>> {
        let bound = self.base.bound()?;
        let effect = Effect::TouchCacheKey {
            column: self.base.column()?.to_string(),
        };

        let mut triggers = self.self_triggers(dialect)?;
        for dependency in &bound.dependencies {
            triggers.extend(dependency.triggers(&bound.owner, &effect, dialect, config)?);
        }
        Ok(self.base.stamp(triggers))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::connection::testing::CatalogConnection;
    use crate::dialect::{DialectKind, MySql, Postgres};
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::{fixtures, Field};
    use crate::registry::Registry;

    fn order_key() -> CacheKeyDenorm {
        CacheKeyDenorm::new("shop.Order", "cache_key", vec![DependOn::new("shop.Line")]).skip(["summary"])
    }

    #[test]
    fn test_self_update_ignores_key_and_skipped_columns() {
        let rule = order_key();
        rule.setup(&fixtures::shop()).unwrap();
        let triggers = rule.get_triggers(&Postgres, &DenormConfig::default()).unwrap();

        let update = triggers
            .iter()
            .find(|t| t.table() == "shop_order" && t.event() == TriggerEvent::Update)
            .unwrap();
        match update.condition() {
            Some(Condition::FieldChange(change)) => {
                assert!(!change.fields().iter().any(|f| f == "cache_key" || f == "summary"));
                assert!(change.fields().iter().any(|f| f == "total"));
            }
            None => panic!("self update trigger must be conditioned"),
        }

        let insert = triggers
            .iter()
            .find(|t| t.table() == "shop_order" && t.event() == TriggerEvent::Insert)
            .unwrap();
        assert_eq!(insert.time(), TriggerTime::After);
        assert_eq!(
            insert.body(&Postgres).unwrap().sql,
            "UPDATE \"shop_order\" SET \"cache_key\" = (9223372036854775806::INT8 * ((RANDOM()-0.5)*2.0))::INT8 \
             WHERE \"id\" = NEW.\"id\";"
        );
    }

    #[test]
    fn test_mysql_sets_key_on_incoming_row() {
        let rule = order_key();
        rule.setup(&fixtures::shop()).unwrap();
        let triggers = rule.get_triggers(&MySql, &DenormConfig::default()).unwrap();

        let own: Vec<&Trigger> = triggers.iter().filter(|t| t.table() == "shop_order").collect();
        assert_eq!(own.len(), 2);
        for trigger in &own {
            assert_eq!(trigger.time(), TriggerTime::Before);
            let body = trigger.body(&MySql).unwrap().sql;
            assert!(body.contains("SET NEW.`cache_key` = (9223372036854775806 * ((RAND()-0.5)*2.0));"));
            assert!(!body.contains("UPDATE `shop_order`"));
        }

        let update = own.iter().find(|t| t.event() == TriggerEvent::Update).unwrap();
        assert!(update
            .render("denorm_before_row_update_on_shop_order_0", &MySql)
            .unwrap()
            .sql
            .contains("BEFORE UPDATE ON `shop_order`"));

        // dependency triggers fire on other tables and still update the owner
        let on_line = triggers.iter().find(|t| t.table() == "shop_line").unwrap();
        assert!(on_line.body(&MySql).unwrap().sql.starts_with("UPDATE `shop_order` SET `cache_key`"));
    }

    #[test]
    fn test_sibling_keys_do_not_watch_each_other() {
        let mut graph = ModelGraph::new();
        graph
            .insert(
                ModelMeta::new("cms.Page", "cms_page", "id", 11)
                    .with_field(Field::plain("body"))
                    .with_field(Field::plain("list_key"))
                    .with_field(Field::plain("detail_key")),
            )
            .unwrap();

        let list: Arc<dyn Denorm> = Arc::new(CacheKeyDenorm::new("cms.Page", "list_key", vec![]));
        let detail: Arc<dyn Denorm> = Arc::new(CacheKeyDenorm::new("cms.Page", "detail_key", vec![]));
        let mut registry = Registry::new();
        registry.register(list.clone()).unwrap();
        registry.register(detail.clone()).unwrap();
        registry.setup(graph).unwrap();

        for (rule, other) in [(&list, "detail_key"), (&detail, "list_key")] {
            let triggers = rule.get_triggers(&Postgres, &DenormConfig::default()).unwrap();
            let update = triggers.iter().find(|t| t.event() == TriggerEvent::Update).unwrap();
            match update.condition() {
                Some(Condition::FieldChange(change)) => {
                    assert_eq!(change.fields(), ["id".to_string(), "body".to_string()]);
                    assert!(!change.fields().iter().any(|f| f == other));
                }
                None => panic!("self update trigger must be conditioned"),
            }
        }
        assert_error_sqlstate(list.ignore_owner_columns(&[]), "55006");
    }

    #[test]
    fn test_dependencies_touch_key() {
        let rule = order_key();
        rule.setup(&fixtures::shop()).unwrap();
        let triggers = rule.get_triggers(&Postgres, &DenormConfig::default()).unwrap();

        // 2 self triggers + 3 on the line table
        assert_eq!(triggers.len(), 5);
        let on_line = triggers
            .iter()
            .find(|t| t.table() == "shop_line" && t.event() == TriggerEvent::Delete)
            .unwrap();
        let body = on_line.body(&Postgres).unwrap().sql;
        assert!(body.starts_with("UPDATE \"shop_order\" SET \"cache_key\" = (9223372036854775806::INT8"));
        assert!(body.ends_with("WHERE \"id\" = OLD.\"order_id\";"));
    }

    #[test]
    fn test_collection_field_cannot_hold_key() {
        let rule = CacheKeyDenorm::new("shop.Order", "tags", vec![]);
        assert_error_sqlstate(rule.setup(&fixtures::shop()), "42809");
    }

    #[test]
    fn test_values_are_effectively_unique() {
        let rule = order_key();
        let mut conn = CatalogConnection::new(DialectKind::Postgres);
        let instance = Instance::new("shop.Order");

        let keys: HashSet<i64> = (0..1000)
            .map(|_| rule.value(&mut conn, &instance).unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(keys.len(), 1000);
    }
}
