use tracing::warn;

use crate::config::DenormConfig;
use crate::dialect::Dialect;
use crate::error::DenormResult;
use crate::model::{ModelMeta, Relation};
use crate::sql::{Action, Expr, InsertValues, NestedSelect, RandomBigInt, RowAlias, Statement, Value};
use crate::trigger::{Condition, Subject, Trigger, TriggerEvent};

use super::Dependency;

/// What a change to a dependency does to the owning rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Queue the owners for recomputation
    MarkDirty,
    /// Write a fresh random value into the owners' cache key column
    TouchCacheKey { column: String },
}

/// How a trigger row leads to the owner rows it affects
enum Reach<'a> {
    /// `owner.<column> = ROW.<row_column>`
    Column { column: &'a str, row_column: &'a str },
    /// Owners listed in a join table next to the row
    Through {
        join_table: &'a str,
        owner_column: &'a str,
        related_column: &'a str,
        row_column: &'a str,
    },
    /// `owner.pk = ROW.<object_id>` for rows typed as the owner
    Generic {
        object_id_column: &'a str,
        content_type_column: &'a str,
        content_type_id: i64,
    },
}

impl Reach<'_> {
    fn action(
        &self,
        alias: RowAlias,
        owner: &ModelMeta,
        effect: &Effect,
        dialect: &dyn Dialect,
        config: &DenormConfig,
    ) -> Action {
        match effect {
            Effect::MarkDirty => {
                let owner_key = Expr::Int(owner.content_type_id);
                let select = match self {
                    Reach::Column { column, row_column } => {
                        NestedSelect::new(&owner.table, vec![owner_key, Expr::column(&owner.pk_column)])
                            .filter(Expr::column(column), Expr::row(alias, row_column))
                    }
                    Reach::Through { join_table, owner_column, related_column, row_column } => {
                        NestedSelect::new(join_table, vec![owner_key, Expr::column(owner_column)])
                            .filter(Expr::column(related_column), Expr::row(alias, row_column))
                    }
                    Reach::Generic { object_id_column, content_type_column, content_type_id } => {
                        NestedSelect::new(&owner.table, vec![owner_key, Expr::column(&owner.pk_column)])
                            .filter(Expr::column(&owner.pk_column), Expr::row(alias.clone(), object_id_column))
                            .filter(Expr::row(alias, content_type_column), Expr::Int(*content_type_id))
                    }
                };
                Action::insert(
                    &config.dirty_table,
                    &["content_type_id", "object_id"],
                    InsertValues::Select(select),
                )
            }
            Effect::TouchCacheKey { column } => Action::update(
                &owner.table,
                column,
                Expr::Random(RandomBigInt),
                self.owner_where(alias, owner, dialect),
            ),
        }
    }

    fn owner_where(&self, alias: RowAlias, owner: &ModelMeta, dialect: &dyn Dialect) -> Statement {
        match self {
            Reach::Column { column, row_column } => Statement::raw(format!(
                "{} = {}",
                dialect.quote_ident(column),
                dialect.row_ref(&alias, row_column)
            )),
            Reach::Through { join_table, owner_column, related_column, row_column } => Statement::raw(format!(
                "{} IN (SELECT {} FROM {} WHERE {} = {})",
                dialect.quote_ident(&owner.pk_column),
                dialect.quote_ident(owner_column),
                dialect.quote_ident(join_table),
                dialect.quote_ident(related_column),
                dialect.row_ref(&alias, row_column)
            )),
            Reach::Generic { object_id_column, content_type_column, content_type_id } => Statement::new(
                format!(
                    "{} = {} AND {} = %s",
                    dialect.quote_ident(&owner.pk_column),
                    dialect.row_ref(&alias, object_id_column),
                    dialect.row_ref(&alias, content_type_column)
                ),
                vec![Value::Int(*content_type_id)],
            ),
        }
    }
}

/// insert, update (guarded by `tracked`) and delete triggers on `subject`
fn row_triggers(
    subject: Subject,
    tracked: Vec<String>,
    reach: &Reach<'_>,
    owner: &ModelMeta,
    effect: &Effect,
    dialect: &dyn Dialect,
    config: &DenormConfig,
) -> DenormResult<Vec<Trigger>> {
    let act = |alias: RowAlias| reach.action(alias, owner, effect, dialect, config);

    let mut out = vec![
        Trigger::after(subject.clone(), TriggerEvent::Insert, vec![act(RowAlias::New)]),
        Trigger::after(subject.clone(), TriggerEvent::Delete, vec![act(RowAlias::Old)]),
    ];

    if tracked.is_empty() {
        warn!(table = subject.table(), owner = %owner.label, "every column skipped, no update trigger");
    } else {
        let condition = Condition::field_change(subject.table(), tracked)?;
        out.push(
            Trigger::after(subject, TriggerEvent::Update, vec![act(RowAlias::New), act(RowAlias::Old)])
                .with_condition(condition),
        );
    }
    Ok(out)
}

impl Dependency {
    /// Triggers keeping `owner` informed about changes to the dependency's
    /// rows (and its join rows for many-to-many relations)
    pub fn triggers(
        &self,
        owner: &ModelMeta,
        effect: &Effect,
        dialect: &dyn Dialect,
        config: &DenormConfig,
    ) -> DenormResult<Vec<Trigger>> {
        let related = &self.related;
        let tracked = self.tracked_columns();

        match &self.relation {
            Relation::Backward { fk_column, .. } => row_triggers(
                Subject::ForeignKey {
                    model: related.label.clone(),
                    table: related.table.clone(),
                },
                tracked,
                &Reach::Column { column: &owner.pk_column, row_column: fk_column },
                owner,
                effect,
                dialect,
                config,
            ),
            Relation::Forward { owner_fk_column, related_pk, .. } => row_triggers(
                Subject::for_model(related),
                tracked,
                &Reach::Column { column: owner_fk_column, row_column: related_pk },
                owner,
                effect,
                dialect,
                config,
            ),
            Relation::ManyToMany { join_table, owner_column, related_column, related_pk, .. } => {
                let mut out = row_triggers(
                    Subject::for_model(related),
                    tracked,
                    &Reach::Through {
                        join_table,
                        owner_column,
                        related_column,
                        row_column: related_pk,
                    },
                    owner,
                    effect,
                    dialect,
                    config,
                )?;
                out.extend(row_triggers(
                    Subject::ManyToMany { join_table: join_table.clone() },
                    vec![owner_column.clone(), related_column.clone()],
                    &Reach::Column { column: &owner.pk_column, row_column: owner_column },
                    owner,
                    effect,
                    dialect,
                    config,
                )?);
                Ok(out)
            }
            Relation::Generic { content_type_column, object_id_column, content_type_id, .. } => row_triggers(
                Subject::Generic {
                    table: related.table.clone(),
                    content_type_id: *content_type_id,
                },
                tracked,
                &Reach::Generic {
                    object_id_column,
                    content_type_column,
                    content_type_id: *content_type_id,
                },
                owner,
                effect,
                dialect,
                config,
            ),
        }
    }
}
