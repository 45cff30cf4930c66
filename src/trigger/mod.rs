//! Trigger model.
//!
//! A [`Trigger`] is backend-neutral data: which table it fires on, when, and
//! the actions its body runs. Dialects turn it into DDL; [`TriggerSet`]
//! names, installs and drops whole collections of them.

mod condition;
pub mod naming;
mod set;

use std::fmt;

use serde::Serialize;

use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};
use crate::model::{Field, FieldKind, ModelMeta};
use crate::sql::{Action, Statement};

pub use condition::{Condition, FieldChange};
pub use set::{TriggerPlan, TriggerSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerTime {
    Before,
    After,
}

impl TriggerTime {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerTime::Before => "before",
            TriggerTime::After => "after",
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            TriggerTime::Before => "BEFORE",
            TriggerTime::After => "AFTER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

impl TriggerEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerEvent::Insert => "insert",
            TriggerEvent::Update => "update",
            TriggerEvent::Delete => "delete",
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Update => "UPDATE",
            TriggerEvent::Delete => "DELETE",
        }
    }
}

/// What a trigger is attached to. Each variant carries only the table it
/// fires on plus what naming needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// A model's own table
    Model { label: String, table: String },
    /// The table of the model declaring a foreign key
    ForeignKey { model: String, table: String },
    /// A many-to-many join table
    ManyToMany { join_table: String },
    /// The table holding a generic (content type + object id) reference.
    /// Triggers for different target types on one table are kept apart by
    /// the target's content type id.
    Generic { table: String, content_type_id: i64 },
}

impl Subject {
    pub fn for_model(meta: &ModelMeta) -> Subject {
        Subject::Model {
            label: meta.label.clone(),
            table: meta.table.clone(),
        }
    }

    /// Subject for a relation field declared on `meta`. Plain columns are
    /// not relations and are rejected here, before any trigger exists.
    pub fn from_field(meta: &ModelMeta, field: &Field, content_type_id: i64) -> DenormResult<Subject> {
        match &field.kind {
            FieldKind::ForeignKey { .. } => Ok(Subject::ForeignKey {
                model: meta.label.clone(),
                table: meta.table.clone(),
            }),
            FieldKind::ManyToMany { join_table, .. } => Ok(Subject::ManyToMany {
                join_table: join_table.clone(),
            }),
            FieldKind::GenericForeignKey { .. } => Ok(Subject::Generic {
                table: meta.table.clone(),
                content_type_id,
            }),
            FieldKind::Plain => Err(DenormError::UnsupportedSubject {
                description: format!("plain field {}.{}", meta.label, field.name),
            }),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Subject::Model { table, .. }
            | Subject::ForeignKey { table, .. }
            | Subject::Generic { table, .. } => table,
            Subject::ManyToMany { join_table } => join_table,
        }
    }

    fn disambiguator(&self) -> Option<i64> {
        match self {
            Subject::Generic { content_type_id, .. } => Some(*content_type_id),
            _ => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Model { label, .. } => write!(f, "model {}", label),
            Subject::ForeignKey { model, .. } => write!(f, "foreign key on {}", model),
            Subject::ManyToMany { join_table } => write!(f, "join table {}", join_table),
            Subject::Generic { table, content_type_id } => {
                write!(f, "generic relation on {} (content type {})", table, content_type_id)
            }
        }
    }
}

/// Rule a trigger was generated for, reported when installing it fails
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RuleIdentity {
    pub model: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    subject: Subject,
    time: TriggerTime,
    event: TriggerEvent,
    actions: Vec<Action>,
    condition: Option<Condition>,
    owner: RuleIdentity,
}

impl Trigger {
    pub fn new(subject: Subject, time: TriggerTime, event: TriggerEvent, actions: Vec<Action>) -> Self {
        Self {
            subject,
            time,
            event,
            actions,
            condition: None,
            owner: RuleIdentity::default(),
        }
    }

    pub fn after(subject: Subject, event: TriggerEvent, actions: Vec<Action>) -> Self {
        Self::new(subject, TriggerTime::After, event, actions)
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn owned_by(mut self, model: &str, field: &str) -> Self {
        self.owner = RuleIdentity {
            model: model.to_string(),
            field: field.to_string(),
        };
        self
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn table(&self) -> &str {
        self.subject.table()
    }

    pub fn time(&self) -> TriggerTime {
        self.time
    }

    pub fn event(&self) -> TriggerEvent {
        self.event
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub fn owner(&self) -> &RuleIdentity {
        &self.owner
    }

    /// Canonical name shared by every trigger on the same table, time and
    /// event; a [`TriggerSet`] makes it unique
    pub fn name(&self, prefix: &str) -> String {
        naming::base_name(prefix, self.time, self.event, self.table(), self.subject.disambiguator())
    }

    /// Action statements, each terminated once, identical ones kept once
    /// in first-seen order, wrapped in the condition if there is one
    pub fn body(&self, dialect: &dyn Dialect) -> DenormResult<Statement> {
        let mut seen: Vec<Statement> = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            let rendered = match action {
                Action::Insert(insert) => dialect.render_insert(insert)?,
                Action::Update(update) => dialect.render_update(update)?,
                Action::Assign(assign) => dialect.render_assign(assign)?,
            };
            if rendered.is_empty() {
                continue;
            }
            let rendered = rendered.terminated();
            if !seen.contains(&rendered) {
                seen.push(rendered);
            }
        }

        let body = Statement::join(seen, "\n        ");
        match &self.condition {
            Some(condition) => condition.render(dialect, body),
            None => Ok(body),
        }
    }

    /// Complete DDL installing this trigger under `name`
    pub fn render(&self, name: &str, dialect: &dyn Dialect) -> DenormResult<Statement> {
        let body = self.body(dialect)?;
        dialect.render_trigger(name, self, body)
    }
}
