//! Model metadata and row instances.
//!
//! The host application describes its tables once as a [`ModelGraph`];
//! rules resolve their relations against it during setup.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};
use crate::sql::{Statement, Value};
use crate::validation::{validate_model_label, validate_sql_identifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Plain,
    ForeignKey {
        target: String,
    },
    /// `source_column` points at the declaring model, `target_column` at
    /// `target`
    ManyToMany {
        target: String,
        join_table: String,
        source_column: String,
        target_column: String,
    },
    /// Reference to a row of any model by content type and object id
    GenericForeignKey {
        content_type_column: String,
        object_id_column: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Defaults to the field name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl Field {
    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            kind: FieldKind::Plain,
        }
    }

    pub fn foreign_key(name: &str, column: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            column: Some(column.to_string()),
            kind: FieldKind::ForeignKey { target: target.to_string() },
        }
    }

    pub fn many_to_many(name: &str, target: &str, join_table: &str, source_column: &str, target_column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            kind: FieldKind::ManyToMany {
                target: target.to_string(),
                join_table: join_table.to_string(),
                source_column: source_column.to_string(),
                target_column: target_column.to_string(),
            },
        }
    }

    pub fn generic(name: &str, content_type_column: &str, object_id_column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: None,
            kind: FieldKind::GenericForeignKey {
                content_type_column: content_type_column.to_string(),
                object_id_column: object_id_column.to_string(),
            },
        }
    }

    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// Whether the field is a column of the model's own table
    pub fn is_concrete(&self) -> bool {
        matches!(self.kind, FieldKind::Plain | FieldKind::ForeignKey { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// `app.Model`
    pub label: String,
    pub table: String,
    pub pk_column: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Replaced by another model (e.g. a custom user model)
    #[serde(default)]
    pub swapped: bool,
    pub content_type_id: i64,
}

impl ModelMeta {
    pub fn new(label: &str, table: &str, pk_column: &str, content_type_id: i64) -> Self {
        Self {
            label: label.to_string(),
            table: table.to_string(),
            pk_column: pk_column.to_string(),
            fields: Vec::new(),
            swapped: false,
            content_type_id,
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn app_label(&self) -> &str {
        self.label.split_once('.').map_or("", |(app, _)| app)
    }

    pub fn model_name(&self) -> &str {
        self.label.rsplit_once('.').map_or(self.label.as_str(), |(_, name)| name)
    }

    pub fn field(&self, name: &str) -> DenormResult<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| DenormError::FieldNotFound {
                model: self.label.clone(),
                field: name.to_string(),
            })
    }

    /// Primary key column followed by every concrete field column
    pub fn columns(&self) -> Vec<&str> {
        let mut out = vec![self.pk_column.as_str()];
        for field in self.fields.iter().filter(|f| f.is_concrete()) {
            let column = field.column_name();
            if !out.contains(&column) {
                out.push(column);
            }
        }
        out
    }

    pub fn validate(&self) -> DenormResult<()> {
        validate_model_label(&self.label)?;
        validate_sql_identifier(&self.table, "table")?;
        validate_sql_identifier(&self.pk_column, "pk_column")?;
        for field in &self.fields {
            validate_sql_identifier(&field.name, "field")?;
            validate_sql_identifier(field.column_name(), "column")?;
            match &field.kind {
                FieldKind::ManyToMany { join_table, source_column, target_column, target } => {
                    validate_model_label(target)?;
                    validate_sql_identifier(join_table, "join_table")?;
                    validate_sql_identifier(source_column, "source_column")?;
                    validate_sql_identifier(target_column, "target_column")?;
                }
                FieldKind::GenericForeignKey { content_type_column, object_id_column } => {
                    validate_sql_identifier(content_type_column, "content_type_column")?;
                    validate_sql_identifier(object_id_column, "object_id_column")?;
                }
                FieldKind::ForeignKey { target } => validate_model_label(target)?,
                FieldKind::Plain => {}
            }
        }
        Ok(())
    }

    /// `SELECT <columns> FROM <table>`, optionally for one primary key
    pub fn select(&self, dialect: &dyn Dialect, pk: Option<&Value>) -> Statement {
        let columns: Vec<String> = self.columns().iter().map(|c| dialect.quote_ident(c)).collect();
        let mut stmt = Statement::raw(format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            dialect.quote_ident(&self.table)
        ));
        if let Some(pk) = pk {
            stmt.push(Statement::new(
                format!(" WHERE {} = %s", dialect.quote_ident(&self.pk_column)),
                vec![pk.clone()],
            ));
        }
        stmt
    }

    /// Read rows into instances; many-to-many fields are loaded as lists
    /// of target keys
    pub fn load(&self, conn: &mut dyn Connection, pk: Option<&Value>) -> DenormResult<Vec<Instance>> {
        let dialect = conn.dialect();
        let rows = conn.query(&self.select(dialect, pk))?;
        let columns = self.columns();

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut instance = Instance::new(&self.label);
            instance.set(&self.pk_column, row.first().cloned().unwrap_or(Value::Null));
            for field in self.fields.iter().filter(|f| f.is_concrete()) {
                let index = columns.iter().position(|c| *c == field.column_name());
                let value = index.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null);
                instance.set(&field.name, value);
            }
            for field in &self.fields {
                if let FieldKind::ManyToMany { join_table, source_column, target_column, .. } = &field.kind {
                    let pk = instance.get(&self.pk_column).clone();
                    let keys = conn.query(&Statement::new(
                        format!(
                            "SELECT {} FROM {} WHERE {} = %s ORDER BY {}",
                            dialect.quote_ident(target_column),
                            dialect.quote_ident(join_table),
                            dialect.quote_ident(source_column),
                            dialect.quote_ident(target_column),
                        ),
                        vec![pk],
                    ))?;
                    let keys = keys.into_iter().filter_map(|r| r.into_iter().next()).collect();
                    instance.set(&field.name, Value::List(keys));
                }
            }
            out.push(instance);
        }
        Ok(out)
    }

    /// Persist the given fields of `instance`
    pub fn save(&self, conn: &mut dyn Connection, instance: &Instance, fields: &[&str]) -> DenormResult<()> {
        let dialect = conn.dialect();
        let pk = instance.get(&self.pk_column).clone();
        if pk.is_null() {
            return Err(DenormError::SaveFailed {
                model: self.label.clone(),
                pk: "NULL".to_string(),
                reason: "instance has no primary key".to_string(),
            });
        }

        let mut assignments = Vec::new();
        for name in fields {
            let field = self.field(name)?;
            match &field.kind {
                FieldKind::Plain | FieldKind::ForeignKey { .. } => {
                    assignments.push(Statement::new(
                        format!("{} = %s", dialect.quote_ident(field.column_name())),
                        vec![instance.get(name).clone()],
                    ));
                }
                FieldKind::ManyToMany { join_table, source_column, target_column, .. } => {
                    conn.execute(&Statement::new(
                        format!(
                            "DELETE FROM {} WHERE {} = %s",
                            dialect.quote_ident(join_table),
                            dialect.quote_ident(source_column)
                        ),
                        vec![pk.clone()],
                    ))?;
                    let keys = match instance.get(name) {
                        Value::List(keys) => keys.clone(),
                        Value::Null => Vec::new(),
                        other => vec![other.clone()],
                    };
                    for key in keys {
                        conn.execute(&Statement::new(
                            format!(
                                "INSERT INTO {} ({}, {}) VALUES (%s, %s)",
                                dialect.quote_ident(join_table),
                                dialect.quote_ident(source_column),
                                dialect.quote_ident(target_column)
                            ),
                            vec![pk.clone(), key],
                        ))?;
                    }
                }
                FieldKind::GenericForeignKey { .. } => {
                    return Err(DenormError::UnsupportedSubject {
                        description: format!("saving generic relation {}.{}", self.label, name),
                    });
                }
            }
        }

        if assignments.is_empty() {
            return Ok(());
        }

        let mut update = Statement::raw(format!("UPDATE {} SET ", dialect.quote_ident(&self.table)));
        update.push(Statement::join(assignments, ", "));
        update.push(Statement::new(
            format!(" WHERE {} = %s", dialect.quote_ident(&self.pk_column)),
            vec![pk],
        ));
        conn.execute(&update)?;
        Ok(())
    }
}

/// How rows of a related model reach the owning model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Related rows hold a foreign key to the owner
    Backward { related_table: String, fk_column: String },
    /// The owner holds a foreign key to the related row
    Forward {
        owner_fk_column: String,
        related_table: String,
        related_pk: String,
    },
    ManyToMany {
        join_table: String,
        /// Join column pointing at the owner
        owner_column: String,
        /// Join column pointing at the related row
        related_column: String,
        related_table: String,
        related_pk: String,
    },
    /// Related rows reference the owner through content type + object id
    Generic {
        related_table: String,
        content_type_column: String,
        object_id_column: String,
        content_type_id: i64,
    },
}

impl Relation {
    pub fn related_table(&self) -> &str {
        match self {
            Relation::Backward { related_table, .. }
            | Relation::Forward { related_table, .. }
            | Relation::ManyToMany { related_table, .. }
            | Relation::Generic { related_table, .. } => related_table,
        }
    }
}

/// Every model the application knows, by label
#[derive(Debug, Clone, Default)]
pub struct ModelGraph {
    models: BTreeMap<String, Arc<ModelMeta>>,
}

impl ModelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: ModelMeta) -> DenormResult<Arc<ModelMeta>> {
        meta.validate()?;
        let meta = Arc::new(meta);
        self.models.insert(meta.label.clone(), Arc::clone(&meta));
        Ok(meta)
    }

    /// Parse a JSON array of model descriptions
    pub fn from_json(json: &str) -> DenormResult<Self> {
        let models: Vec<ModelMeta> = serde_json::from_str(json)?;
        let mut graph = Self::new();
        for meta in models {
            graph.insert(meta)?;
        }
        Ok(graph)
    }

    pub fn get(&self, label: &str) -> DenormResult<Arc<ModelMeta>> {
        self.models
            .get(label)
            .cloned()
            .ok_or_else(|| DenormError::ModelNotFound { model: label.to_string() })
    }

    pub fn by_content_type(&self, content_type_id: i64) -> Option<Arc<ModelMeta>> {
        self.models.values().find(|m| m.content_type_id == content_type_id).cloned()
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelMeta>> {
        self.models.values()
    }

    /// Resolve how `related` rows reach `owner`. `via` names the field
    /// (on either model) to use when several relations exist; generic
    /// relations are only picked by name or when nothing else connects
    /// the two models.
    pub fn relation_between(&self, owner: &str, related: &str, via: Option<&str>) -> DenormResult<Relation> {
        let owner_meta = self.get(owner)?;
        let related_meta = self.get(related)?;

        let mut candidates: Vec<(String, Relation)> = Vec::new();
        let mut generic: Vec<(String, Relation)> = Vec::new();

        for field in &related_meta.fields {
            match &field.kind {
                FieldKind::ForeignKey { target } if target == owner => candidates.push((
                    field.name.clone(),
                    Relation::Backward {
                        related_table: related_meta.table.clone(),
                        fk_column: field.column_name().to_string(),
                    },
                )),
                FieldKind::ManyToMany { target, join_table, source_column, target_column } if target == owner => {
                    candidates.push((
                        field.name.clone(),
                        Relation::ManyToMany {
                            join_table: join_table.clone(),
                            owner_column: target_column.clone(),
                            related_column: source_column.clone(),
                            related_table: related_meta.table.clone(),
                            related_pk: related_meta.pk_column.clone(),
                        },
                    ))
                }
                FieldKind::GenericForeignKey { content_type_column, object_id_column } => generic.push((
                    field.name.clone(),
                    Relation::Generic {
                        related_table: related_meta.table.clone(),
                        content_type_column: content_type_column.clone(),
                        object_id_column: object_id_column.clone(),
                        content_type_id: owner_meta.content_type_id,
                    },
                )),
                _ => {}
            }
        }

        for field in &owner_meta.fields {
            match &field.kind {
                FieldKind::ForeignKey { target } if target == related => candidates.push((
                    field.name.clone(),
                    Relation::Forward {
                        owner_fk_column: field.column_name().to_string(),
                        related_table: related_meta.table.clone(),
                        related_pk: related_meta.pk_column.clone(),
                    },
                )),
                FieldKind::ManyToMany { target, join_table, source_column, target_column } if target == related => {
                    candidates.push((
                        field.name.clone(),
                        Relation::ManyToMany {
                            join_table: join_table.clone(),
                            owner_column: source_column.clone(),
                            related_column: target_column.clone(),
                            related_table: related_meta.table.clone(),
                            related_pk: related_meta.pk_column.clone(),
                        },
                    ))
                }
                _ => {}
            }
        }

        let mut pool = match via {
            Some(name) => candidates
                .into_iter()
                .chain(generic)
                .filter(|(field, _)| field == name)
                .collect::<Vec<_>>(),
            None if candidates.is_empty() => generic,
            None => candidates,
        };

        match pool.len() {
            0 => Err(DenormError::RelationNotFound {
                from: owner.to_string(),
                to: match via {
                    Some(name) => format!("{}.{}", related, name),
                    None => related.to_string(),
                },
            }),
            1 => Ok(pool.remove(0).1),
            _ => Err(DenormError::AmbiguousRelation {
                from: owner.to_string(),
                to: related.to_string(),
                candidates: pool.into_iter().map(|(field, _)| field).collect(),
            }),
        }
    }
}

/// One row of a model, field name -> value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Instance {
    pub model: String,
    pub values: BTreeMap<String, Value>,
}

impl Instance {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value.into());
        self
    }

    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }
}
