//! SUM and COUNT over related rows.
//!
//! The stored value is maintained incrementally: inserting a matching
//! related row adds its contribution, deleting one subtracts it, and an
//! update does both (new row in, old row out). Filters are evaluated on the
//! trigger rows, so a row moving in or out of the filter is counted
//! correctly. `value` recomputes from scratch with the same filters.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::DenormConfig;
use crate::connection::Connection;
use crate::dependency::{DependOn, Dependency};
use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};
use crate::model::{Instance, ModelGraph, ModelMeta, Relation};
use crate::predicate::{ColumnPredicateCompiler, Filter, PredicateCompiler};
use crate::sql::{Action, Expr, RowAlias, Statement, Value};
use crate::trigger::{Subject, Trigger, TriggerEvent};

use super::{Bound, Denorm, RuleBase};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateKind {
    /// Sum of a related column, NULLs counting as zero
    Sum { column: String },
    /// Number of related rows
    Count,
}

pub struct AggregateDenorm {
    base: RuleBase,
    kind: AggregateKind,
    filter: Filter,
    exclude: Filter,
    compiler: Arc<dyn PredicateCompiler>,
}

impl AggregateDenorm {
    pub fn sum(model: &str, field: &str, related: DependOn, column: &str) -> Self {
        Self::new(
            model,
            field,
            related,
            AggregateKind::Sum {
                column: column.to_string(),
            },
        )
    }

    pub fn count(model: &str, field: &str, related: DependOn) -> Self {
        Self::new(model, field, related, AggregateKind::Count)
    }

    fn new(model: &str, field: &str, related: DependOn, kind: AggregateKind) -> Self {
        Self {
            base: RuleBase::new(model, field, vec![related]),
            kind,
            filter: Filter::new(),
            exclude: Filter::new(),
            compiler: Arc::new(ColumnPredicateCompiler),
        }
    }

    /// Only related rows matching every predicate contribute
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Related rows matching all of these predicates do not contribute
    pub fn exclude(mut self, exclude: Filter) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_compiler(mut self, compiler: impl PredicateCompiler + 'static) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    pub fn kind(&self) -> &AggregateKind {
        &self.kind
    }

    fn resolved(&self) -> DenormResult<(&Bound, &Dependency)> {
        let bound = self.base.bound()?;
        let dependency = bound
            .dependencies
            .first()
            .ok_or_else(|| crate::internal_error!("aggregate {}.{} has no relation", self.base.model, self.base.field))?;
        Ok((bound, dependency))
    }

    /// Contribution of one related row, given an expression for its
    /// aggregated column
    fn contribution(&self, value: Expr) -> Expr {
        match self.kind {
            AggregateKind::Sum { .. } => value.or_zero(),
            AggregateKind::Count => Expr::Int(1),
        }
    }

    fn filters(&self, alias: &RowAlias, dialect: &dyn Dialect) -> Option<Statement> {
        self.compiler.compile(&self.filter, &self.exclude, alias, dialect)
    }

    fn with_filters(&self, mut clause: Statement, alias: &RowAlias, dialect: &dyn Dialect) -> Statement {
        if let Some(filters) = self.filters(alias, dialect) {
            clause.push_sql(" AND ");
            clause.push(filters);
        }
        clause
    }

    /// Owner rows a related trigger row belongs to
    fn owner_match(
        &self,
        relation: &Relation,
        owner: &ModelMeta,
        alias: &RowAlias,
        dialect: &dyn Dialect,
    ) -> DenormResult<Statement> {
        let pk = dialect.quote_ident(&owner.pk_column);
        let clause = match relation {
            Relation::Backward { fk_column, .. } => {
                Statement::raw(format!("{} = {}", pk, dialect.row_ref(alias, fk_column)))
            }
            Relation::ManyToMany { join_table, owner_column, related_column, related_pk, .. } => {
                Statement::raw(format!(
                    "{} IN (SELECT {} FROM {} WHERE {} = {})",
                    pk,
                    dialect.quote_ident(owner_column),
                    dialect.quote_ident(join_table),
                    dialect.quote_ident(related_column),
                    dialect.row_ref(alias, related_pk)
                ))
            }
            Relation::Generic { content_type_column, object_id_column, content_type_id, .. } => Statement::new(
                format!(
                    "{} = {} AND {} = %s",
                    pk,
                    dialect.row_ref(alias, object_id_column),
                    dialect.row_ref(alias, content_type_column)
                ),
                vec![Value::Int(*content_type_id)],
            ),
            Relation::Forward { .. } => return Err(self.forward_unsupported()),
        };
        Ok(self.with_filters(clause, alias, dialect))
    }

    fn forward_unsupported(&self) -> DenormError {
        DenormError::UnsupportedSubject {
            description: format!(
                "aggregate {}.{} over a forward foreign key",
                self.base.model, self.base.field
            ),
        }
    }

    fn adjust(&self, owner: &ModelMeta, column: &str, delta: Expr, add: bool, clause: Statement) -> Action {
        let current = Expr::column(column);
        let value = if add { current.plus(delta) } else { current.minus(delta) };
        Action::update(&owner.table, column, value, clause)
    }

    /// insert / update / delete triggers on the related table
    fn related_triggers(&self, dialect: &dyn Dialect) -> DenormResult<Vec<Trigger>> {
        let (bound, dependency) = self.resolved()?;
        let owner = &bound.owner;
        let column = self.base.column()?;
        let related = &dependency.related;

        let subject = match &dependency.relation {
            Relation::Backward { .. } => Subject::ForeignKey {
                model: related.label.clone(),
                table: related.table.clone(),
            },
            Relation::ManyToMany { .. } => Subject::for_model(related),
            Relation::Generic { content_type_id, .. } => Subject::Generic {
                table: related.table.clone(),
                content_type_id: *content_type_id,
            },
            Relation::Forward { .. } => return Err(self.forward_unsupported()),
        };

        let step = |alias: RowAlias, add: bool| -> DenormResult<Action> {
            let delta = match &self.kind {
                AggregateKind::Sum { column: summed } => self.contribution(Expr::row(alias.clone(), summed)),
                AggregateKind::Count => self.contribution(Expr::Int(1)),
            };
            let clause = self.owner_match(&dependency.relation, owner, &alias, dialect)?;
            Ok(self.adjust(owner, column, delta, add, clause))
        };

        Ok(vec![
            Trigger::after(subject.clone(), TriggerEvent::Insert, vec![step(RowAlias::New, true)?]),
            Trigger::after(
                subject.clone(),
                TriggerEvent::Update,
                vec![step(RowAlias::New, true)?, step(RowAlias::Old, false)?],
            ),
            Trigger::after(subject, TriggerEvent::Delete, vec![step(RowAlias::Old, false)?]),
        ])
    }

    /// Triggers on a many-to-many join table: adding a link adds the
    /// related row's contribution, removing one subtracts it
    fn join_triggers(&self, dialect: &dyn Dialect) -> DenormResult<Vec<Trigger>> {
        let (bound, dependency) = self.resolved()?;
        let Relation::ManyToMany { join_table, owner_column, related_column, related_table, related_pk } =
            &dependency.relation
        else {
            return Ok(Vec::new());
        };
        let owner = &bound.owner;
        let column = self.base.column()?;
        let related = RowAlias::Table(related_table.clone());

        let link = |alias: &RowAlias| {
            format!(
                "{} = {}",
                dialect.row_ref(&related, related_pk),
                dialect.row_ref(alias, related_column)
            )
        };

        let step = |alias: RowAlias, add: bool| -> Action {
            let delta = match &self.kind {
                AggregateKind::Sum { column: summed } => self.contribution(Expr::Subquery(Statement::raw(format!(
                    "SELECT {} FROM {} WHERE {}",
                    dialect.row_ref(&related, summed),
                    dialect.quote_ident(related_table),
                    link(&alias)
                )))),
                AggregateKind::Count => self.contribution(Expr::Int(1)),
            };

            // the linked row must exist and pass the filters
            let mut matching = Statement::raw(format!(
                "SELECT COUNT(*) FROM {} WHERE {}",
                dialect.quote_ident(related_table),
                link(&alias)
            ));
            matching = self.with_filters(matching, &related, dialect);

            let mut clause = Statement::raw(format!(
                "{} = {} AND ",
                dialect.quote_ident(&owner.pk_column),
                dialect.row_ref(&alias, owner_column)
            ));
            clause.push(matching.parenthesized());
            clause.push_sql(" > 0");

            self.adjust(owner, column, delta, add, clause)
        };

        let subject = Subject::ManyToMany {
            join_table: join_table.clone(),
        };
        Ok(vec![
            Trigger::after(subject.clone(), TriggerEvent::Insert, vec![step(RowAlias::New, true)]),
            Trigger::after(
                subject.clone(),
                TriggerEvent::Update,
                vec![step(RowAlias::New, true), step(RowAlias::Old, false)],
            ),
            Trigger::after(subject, TriggerEvent::Delete, vec![step(RowAlias::Old, false)]),
        ])
    }

    /// Full recompute query for one owner primary key
    pub fn recompute(&self, dialect: &dyn Dialect, pk: &Value) -> DenormResult<Statement> {
        let (_, dependency) = self.resolved()?;
        let related = &dependency.related;
        let table = RowAlias::Table(related.table.clone());

        let aggregate = match &self.kind {
            AggregateKind::Sum { column } => format!("COALESCE(SUM({}), 0)", dialect.row_ref(&table, column)),
            AggregateKind::Count => "COUNT(*)".to_string(),
        };
        let mut stmt = Statement::raw(format!(
            "SELECT {} FROM {}",
            aggregate,
            dialect.quote_ident(&related.table)
        ));

        let clause = match &dependency.relation {
            Relation::Backward { fk_column, .. } => Statement::new(
                format!("{} = %s", dialect.row_ref(&table, fk_column)),
                vec![pk.clone()],
            ),
            Relation::ManyToMany { join_table, owner_column, related_column, related_pk, .. } => {
                let join = RowAlias::Table(join_table.clone());
                stmt.push_sql(&format!(
                    " INNER JOIN {} ON {} = {}",
                    dialect.quote_ident(join_table),
                    dialect.row_ref(&join, related_column),
                    dialect.row_ref(&table, related_pk)
                ));
                Statement::new(format!("{} = %s", dialect.row_ref(&join, owner_column)), vec![pk.clone()])
            }
            Relation::Generic { content_type_column, object_id_column, content_type_id, .. } => Statement::new(
                format!(
                    "{} = %s AND {} = %s",
                    dialect.row_ref(&table, object_id_column),
                    dialect.row_ref(&table, content_type_column)
                ),
                vec![pk.clone(), Value::Int(*content_type_id)],
            ),
            Relation::Forward { .. } => return Err(self.forward_unsupported()),
        };

        stmt.push_sql(" WHERE ");
        stmt.push(self.with_filters(clause, &table, dialect));
        Ok(stmt)
    }
}

/// Aggregates come back as integers, floats or numeric text depending on
/// backend and column type
fn normalize(value: Value) -> Value {
    match value {
        Value::Null => Value::Int(0),
        Value::Text(s) => match s.trim().parse::<i64>() {
            Ok(i) => Value::Int(i),
            Err(_) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::Text(s),
            },
        },
        other => other,
    }
}

impl fmt::Debug for AggregateDenorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateDenorm")
            .field("model", &self.base.model)
            .field("field", &self.base.field)
            .field("kind", &self.kind)
            .field("related", &self.base.depend_on)
            .field("filter", &self.filter)
            .field("exclude", &self.exclude)
            .finish_non_exhaustive()
    }
}

impl Denorm for AggregateDenorm {
    fn model(&self) -> &str {
        &self.base.model
    }

    fn field_name(&self) -> &str {
        &self.base.field
    }

    fn setup(&self, graph: &ModelGraph) -> DenormResult<()> {
        self.base.setup(graph)?;
        self.base.column()?;

        let (_, dependency) = self.resolved()?;
        if matches!(dependency.relation, Relation::Forward { .. }) {
            return Err(self.forward_unsupported());
        }

        let related = &dependency.related;
        let columns = related.columns();
        let mut needed: Vec<&str> = self.filter.columns();
        needed.extend(self.exclude.columns());
        if let AggregateKind::Sum { column } = &self.kind {
            needed.push(column);
        }
        if let Some(missing) = needed.into_iter().find(|c| !columns.contains(c)) {
            return Err(DenormError::FieldNotFound {
                model: related.label.clone(),
                field: missing.to_string(),
            });
        }
        Ok(())
    }

    fn value(&self, conn: &mut dyn Connection, instance: &Instance) -> DenormResult<Value> {
        let (bound, _) = self.resolved()?;
        let pk = instance.get(&bound.owner.pk_column);
        let stmt = self.recompute(conn.dialect(), pk)?;
        debug!(model = %self.base.model, field = %self.base.field, pk = %pk, "recomputing aggregate");
        Ok(normalize(conn.query_value(&stmt)?))
    }

    fn get_triggers(&self, dialect: &dyn Dialect, _config: &DenormConfig) -> DenormResult<Vec<Trigger>> {
        let mut triggers = self.related_triggers(dialect)?;
        triggers.extend(self.join_triggers(dialect)?);
        Ok(self.base.stamp(triggers))
    }
}
