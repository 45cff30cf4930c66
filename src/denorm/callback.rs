use std::fmt;
use std::sync::Arc;

use crate::config::DenormConfig;
use crate::connection::Connection;
use crate::dependency::{DependOn, Effect};
use crate::dialect::Dialect;
use crate::error::DenormResult;
use crate::model::{Instance, ModelGraph};
use crate::sql::Value;
use crate::trigger::Trigger;

use super::{Denorm, RuleBase};

/// User computation producing the field value for one instance
pub type ValueFn = Arc<dyn Fn(&mut dyn Connection, &Instance) -> DenormResult<Value> + Send + Sync>;

/// Field computed by arbitrary code. Triggers cannot run the code, so
/// changes to dependencies only queue the owner in the dirty table; the
/// value is recomputed on the next flush.
pub struct CallbackDenorm {
    base: RuleBase,
    func: ValueFn,
}

impl CallbackDenorm {
    pub fn new<F>(model: &str, field: &str, depend_on: Vec<DependOn>, func: F) -> Self
    where
        F: Fn(&mut dyn Connection, &Instance) -> DenormResult<Value> + Send + Sync + 'static,
    {
        Self {
            base: RuleBase::new(model, field, depend_on),
            func: Arc::new(func),
        }
    }

    pub fn depend_on(&self) -> &[DependOn] {
        &self.base.depend_on
    }
}

impl fmt::Debug for CallbackDenorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDenorm")
            .field("model", &self.base.model)
            .field("field", &self.base.field)
            .field("depend_on", &self.base.depend_on)
            .finish_non_exhaustive()
    }
}

impl Denorm for CallbackDenorm {
    fn model(&self) -> &str {
        &self.base.model
    }

    fn field_name(&self) -> &str {
        &self.base.field
    }

    fn setup(&self, graph: &ModelGraph) -> DenormResult<()> {
        self.base.setup(graph).map(|_| ())
    }

    fn value(&self, conn: &mut dyn Connection, instance: &Instance) -> DenormResult<Value> {
        (self.func)(conn, instance)
    }

    fn get_triggers(&self, dialect: &dyn Dialect, config: &DenormConfig) -> DenormResult<Vec<Trigger>> {
        let bound = self.base.bound()?;
        let mut triggers = Vec::new();
        for dependency in &bound.dependencies {
            triggers.extend(dependency.triggers(&bound.owner, &Effect::MarkDirty, dialect, config)?);
        }
        Ok(self.base.stamp(triggers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Postgres;
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::fixtures;
    use crate::trigger::TriggerEvent;

    fn line_summary() -> CallbackDenorm {
        CallbackDenorm::new(
            "shop.Order",
            "summary",
            vec![DependOn::new("shop.Line").skip(["note"]), DependOn::new("shop.Customer")],
            |_, instance| Ok(Value::from(format!("order {}", instance.get("id")))),
        )
    }

    #[test]
    fn test_triggers_before_setup_fail() {
        assert_error_sqlstate(line_summary().get_triggers(&Postgres, &DenormConfig::default()), "55000");
    }

    #[test]
    fn test_setup_runs_once() {
        let rule = line_summary();
        let graph = fixtures::shop();
        rule.setup(&graph).unwrap();
        assert_error_sqlstate(rule.setup(&graph), "55006");
    }

    #[test]
    fn test_every_dependency_marks_dirty() {
        let rule = line_summary();
        rule.setup(&fixtures::shop()).unwrap();

        let triggers = rule.get_triggers(&Postgres, &DenormConfig::default()).unwrap();
        assert_eq!(triggers.len(), 6);
        assert!(triggers
            .iter()
            .all(|t| t.owner().model == "shop.Order" && t.owner().field == "summary"));

        let tables: Vec<&str> = triggers.iter().map(Trigger::table).collect();
        assert_eq!(tables.iter().filter(|t| **t == "shop_line").count(), 3);
        assert_eq!(tables.iter().filter(|t| **t == "shop_customer").count(), 3);

        for trigger in triggers.iter().filter(|t| t.event() != TriggerEvent::Update) {
            let body = trigger.body(&Postgres).unwrap();
            assert!(body.sql.starts_with("INSERT INTO \"denorm_dirtyinstance\""));
        }
    }

    #[test]
    fn test_no_dependencies_no_triggers() {
        let rule = CallbackDenorm::new("shop.Order", "summary", vec![], |_, _| Ok(Value::Null));
        rule.setup(&fixtures::shop()).unwrap();
        assert!(rule.get_triggers(&Postgres, &DenormConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_field_rejected_at_setup() {
        let rule = CallbackDenorm::new("shop.Order", "missing", vec![], |_, _| Ok(Value::Null));
        assert_error_sqlstate(rule.setup(&fixtures::shop()), "42703");
    }
}
