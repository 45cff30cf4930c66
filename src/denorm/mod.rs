//! Denormalization rules.
//!
//! A rule owns one field of one model. It can compute the field's value
//! from scratch ([`Denorm::value`]) and it describes the triggers that keep
//! the stored value current ([`Denorm::get_triggers`]).
//!
//! ## Lifecycle
//!
//! 1. Construct and `registry::register` at startup
//! 2. `setup` once the model graph is complete; resolves dependencies
//! 3. `get_triggers` any number of times for install / print
//! 4. `update` during rebuilds and dirty-queue flushes

mod aggregate;
mod cache_key;
mod callback;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::config::DenormConfig;
use crate::connection::Connection;
use crate::dependency::{resolve_all, DependOn, Dependency};
use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};
use crate::model::{Instance, ModelGraph, ModelMeta};
use crate::sql::Value;
use crate::trigger::Trigger;

pub use aggregate::{AggregateDenorm, AggregateKind};
pub use cache_key::CacheKeyDenorm;
pub use callback::{CallbackDenorm, ValueFn};

/// Field name -> new value, for fields whose value changed
pub type ChangedFields = BTreeMap<String, Value>;

pub trait Denorm: Send + Sync + fmt::Debug {
    /// Label of the owning model
    fn model(&self) -> &str;

    fn field_name(&self) -> &str;

    /// Resolve dependencies against the complete model graph. Runs once.
    fn setup(&self, graph: &ModelGraph) -> DenormResult<()>;

    /// Value computed from scratch for `instance`
    fn value(&self, conn: &mut dyn Connection, instance: &Instance) -> DenormResult<Value>;

    /// Triggers maintaining the field. Pure; never touches the database.
    fn get_triggers(&self, dialect: &dyn Dialect, config: &DenormConfig) -> DenormResult<Vec<Trigger>>;

    /// Owner column this rule's triggers rewrite whenever an owner row is
    /// written, if any
    fn self_written_column(&self) -> Option<&str> {
        None
    }

    /// Hand over the owner columns other rules rewrite on every owner row
    /// write. A rule watching owner columns must not fire on them, or two
    /// such rules keep re-firing each other. Called once, after setup.
    fn ignore_owner_columns(&self, _columns: &[String]) -> DenormResult<()> {
        Ok(())
    }

    /// Recompute and store the value on `instance` (not in the database).
    /// Collection values are compared as key sets.
    fn update(&self, conn: &mut dyn Connection, instance: &mut Instance) -> DenormResult<ChangedFields> {
        let new_value = self.value(conn, instance)?;
        let old_value = instance.get(self.field_name());

        let changed = match (old_value, &new_value) {
            (Value::List(old), Value::List(new)) => key_set(old) != key_set(new),
            (old, new) => !old.same_as(new),
        };

        let mut fields = ChangedFields::new();
        if changed {
            instance.set(self.field_name(), new_value.clone());
            fields.insert(self.field_name().to_string(), new_value);
        }
        Ok(fields)
    }
}

fn key_set(values: &[Value]) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| v.as_i64().map_or_else(|| v.to_string(), |i| i.to_string()))
        .collect()
}

/// What setup resolved for a rule
#[derive(Debug)]
pub(crate) struct Bound {
    pub owner: Arc<ModelMeta>,
    pub dependencies: Vec<Dependency>,
    /// Column the field is stored in (empty for many-to-many fields)
    pub column: String,
}

/// State shared by every rule kind
#[derive(Debug)]
pub(crate) struct RuleBase {
    pub model: String,
    pub field: String,
    pub depend_on: Vec<DependOn>,
    bound: OnceCell<Bound>,
}

impl RuleBase {
    pub fn new(model: &str, field: &str, depend_on: Vec<DependOn>) -> Self {
        Self {
            model: model.to_string(),
            field: field.to_string(),
            depend_on,
            bound: OnceCell::new(),
        }
    }

    pub fn setup(&self, graph: &ModelGraph) -> DenormResult<&Bound> {
        if self.bound.get().is_some() {
            return Err(DenormError::AlreadySetUp {
                model: self.model.clone(),
                field: self.field.clone(),
            });
        }

        let owner = graph.get(&self.model)?;
        let field = owner.field(&self.field)?;
        let column = if field.is_concrete() {
            field.column_name().to_string()
        } else {
            String::new()
        };
        let dependencies = resolve_all(graph, &self.model, &self.depend_on)?;

        let bound = Bound {
            owner,
            dependencies,
            column,
        };
        // a concurrent setup of the same rule loses here
        self.bound.try_insert(bound).map_err(|_| DenormError::AlreadySetUp {
            model: self.model.clone(),
            field: self.field.clone(),
        })
    }

    pub fn bound(&self) -> DenormResult<&Bound> {
        self.bound.get().ok_or_else(|| DenormError::NotSetUp {
            model: self.model.clone(),
            field: self.field.clone(),
        })
    }

    /// Stored column of the field, rejecting collection fields
    pub fn column(&self) -> DenormResult<&str> {
        let bound = self.bound()?;
        if bound.column.is_empty() {
            return Err(DenormError::UnsupportedSubject {
                description: format!("{}.{} is not a column", self.model, self.field),
            });
        }
        Ok(&bound.column)
    }

    pub fn stamp(&self, triggers: Vec<Trigger>) -> Vec<Trigger> {
        triggers
            .into_iter()
            .map(|t| t.owned_by(&self.model, &self.field))
            .collect()
    }
}
