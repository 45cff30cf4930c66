//! Declared dependencies of denormalized fields.
//!
//! A rule lists the models whose rows it depends on ([`DependOn`]). Setup
//! resolves each declaration against the model graph into a
//! [`Dependency`], which knows the relation path back to the owning model
//! and produces the triggers reacting to changes of those rows.

pub mod triggers;

use std::sync::Arc;

use crate::error::DenormResult;
use crate::model::{ModelGraph, ModelMeta, Relation};

pub use triggers::Effect;

/// "This field depends on rows of `model`"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependOn {
    pub model: String,
    /// Relation field to follow when several connect the two models
    pub via: Option<String>,
    /// Columns whose changes do not matter
    pub skip: Vec<String>,
}

impl DependOn {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            via: None,
            skip: Vec::new(),
        }
    }

    pub fn via(mut self, field: &str) -> Self {
        self.via = Some(field.to_string());
        self
    }

    pub fn skip<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip.extend(columns.into_iter().map(Into::into));
        self
    }
}

/// A [`DependOn`] resolved for one owning model
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub relation: Relation,
    pub related: Arc<ModelMeta>,
    pub skip: Vec<String>,
}

impl Dependency {
    pub fn resolve(graph: &ModelGraph, owner: &str, declared: &DependOn) -> DenormResult<Self> {
        let related = graph.get(&declared.model)?;
        let relation = graph.relation_between(owner, &declared.model, declared.via.as_deref())?;
        Ok(Self {
            relation,
            related,
            skip: declared.skip.clone(),
        })
    }

    /// Related columns whose changes fire the update trigger
    pub fn tracked_columns(&self) -> Vec<String> {
        self.related
            .columns()
            .into_iter()
            .filter(|c| !self.skip.iter().any(|s| s == c))
            .map(str::to_string)
            .collect()
    }
}

pub fn resolve_all(graph: &ModelGraph, owner: &str, declared: &[DependOn]) -> DenormResult<Vec<Dependency>> {
    declared.iter().map(|d| Dependency::resolve(graph, owner, d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_error_sqlstate;
    use crate::model::fixtures;

    #[test]
    fn test_resolve_backward_dependency() {
        let graph = fixtures::shop();
        let dep = Dependency::resolve(&graph, "shop.Order", &DependOn::new("shop.Line").skip(["note"])).unwrap();
        assert_eq!(dep.related.table, "shop_line");
        assert_eq!(dep.tracked_columns(), vec!["id", "amount", "status", "order_id"]);
    }

    #[test]
    fn test_resolve_reports_missing_model() {
        let graph = fixtures::shop();
        assert_error_sqlstate(
            resolve_all(&graph, "shop.Order", &[DependOn::new("shop.Line"), DependOn::new("shop.Nope")]),
            "42P01",
        );
    }
}
