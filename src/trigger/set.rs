//! Named trigger collections and their installation.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DenormConfig;
use crate::connection::Connection;
use crate::dialect::{Dialect, DialectKind};
use crate::error::{DenormError, DenormResult};
use crate::sql::Value;

use super::{naming, RuleIdentity, Trigger, TriggerEvent, TriggerTime};

/// One trigger as it would be installed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerPlan {
    pub name: String,
    pub table: String,
    pub time: TriggerTime,
    pub event: TriggerEvent,
    pub owner: RuleIdentity,
    pub sql: String,
    pub params: Vec<Value>,
}

/// Triggers bucketed by canonical name. Every entry becomes its own
/// database trigger named `<bucket>_<index>`.
#[derive(Debug, Clone)]
pub struct TriggerSet {
    dialect: DialectKind,
    config: DenormConfig,
    triggers: BTreeMap<String, Vec<Trigger>>,
}

impl TriggerSet {
    pub fn new(dialect: DialectKind, config: DenormConfig) -> Self {
        Self {
            dialect,
            config,
            triggers: BTreeMap::new(),
        }
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect.dialect()
    }

    pub fn push(&mut self, trigger: Trigger) {
        let name = trigger.name(&self.config.name_prefix());
        self.triggers.entry(name).or_default().push(trigger);
    }

    pub fn append(&mut self, triggers: impl IntoIterator<Item = Trigger>) {
        for trigger in triggers {
            self.push(trigger);
        }
    }

    /// Number of database triggers the set installs
    pub fn len(&self) -> usize {
        self.triggers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&str, &[Trigger])> {
        self.triggers.iter().map(|(name, list)| (name.as_str(), list.as_slice()))
    }

    fn name_budget(&self) -> usize {
        let dialect = self.dialect();
        self.config
            .identifier_limit
            .unwrap_or_else(|| dialect.max_identifier_len())
            .saturating_sub(dialect.reserved_name_len())
            .max(self.config.suffix_length + 1)
    }

    /// `(final name, trigger)` pairs in installation order
    pub fn named(&self) -> DenormResult<Vec<(String, &Trigger)>> {
        let budget = self.name_budget();
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.len());

        for (bucket, triggers) in &self.triggers {
            for (i, trigger) in triggers.iter().enumerate() {
                let name = naming::fit(&naming::indexed(bucket, i), budget, self.config.suffix_length);
                if !seen.insert(name.clone()) {
                    return Err(crate::internal_error!(
                        "trigger name '{}' produced twice for bucket '{}'",
                        name,
                        bucket
                    ));
                }
                out.push((name, trigger));
            }
        }
        Ok(out)
    }

    pub fn plan(&self) -> DenormResult<Vec<TriggerPlan>> {
        let dialect = self.dialect();
        self.named()?
            .into_iter()
            .map(|(name, trigger)| {
                let ddl = trigger.render(&name, dialect)?;
                Ok(TriggerPlan {
                    table: trigger.table().to_string(),
                    time: trigger.time(),
                    event: trigger.event(),
                    owner: trigger.owner().clone(),
                    sql: ddl.sql,
                    params: ddl.params,
                    name,
                })
            })
            .collect()
    }

    pub fn to_json(&self) -> DenormResult<String> {
        Ok(serde_json::to_string_pretty(&self.plan()?)?)
    }

    /// Final DDL of every trigger with parameters bound, one script per
    /// trigger
    pub fn print_sql(&self) -> DenormResult<Vec<String>> {
        let dialect = self.dialect();
        self.named()?
            .into_iter()
            .map(|(name, trigger)| trigger.render(&name, dialect)?.inline(dialect))
            .collect()
    }

    /// Create every trigger in the set. On backends with transactional DDL
    /// the whole set goes in one transaction; elsewhere each trigger
    /// commits on its own and a failure leaves the earlier ones installed.
    pub fn install(&self, conn: &mut dyn Connection) -> DenormResult<usize> {
        let dialect = self.dialect();
        if conn.dialect().kind() != self.dialect {
            return Err(DenormError::ConfigError {
                setting: "dialect".to_string(),
                value: conn.dialect().name().to_string(),
                reason: format!("trigger set was built for {}", dialect.name()),
            });
        }

        ensure_prerequisites(conn, &self.config)?;

        // render everything before touching the catalog
        let mut scripts = Vec::with_capacity(self.len());
        for (name, trigger) in self.named()? {
            let ddl = trigger.render(&name, dialect)?.inline(dialect)?;
            debug!(trigger = %name, table = trigger.table(), "rendered trigger");
            scripts.push((name, trigger, ddl));
        }

        let transactional = dialect.transactional_ddl();
        if transactional {
            conn.begin()?;
        }

        for (name, trigger, ddl) in &scripts {
            let result = replace_trigger(conn, dialect, trigger.table(), name, ddl);
            if let Err(source) = result {
                if transactional {
                    if let Err(e) = conn.rollback() {
                        warn!(error = %e, "rollback after failed install failed");
                    }
                }
                return Err(DenormError::InstallFailed {
                    model: trigger.owner().model.clone(),
                    field: trigger.owner().field.clone(),
                    trigger: name.clone(),
                    source: Box::new(source),
                });
            }
        }

        if transactional {
            conn.commit()?;
        }

        info!(count = scripts.len(), dialect = dialect.name(), "installed triggers");
        Ok(scripts.len())
    }

    /// `(table, trigger)` pairs of every installed trigger carrying the
    /// configured prefix, read from the catalog
    pub fn installed(conn: &mut dyn Connection, config: &DenormConfig) -> DenormResult<Vec<(String, String)>> {
        let dialect = conn.dialect();
        let rows = conn.query(&dialect.list_triggers(&config.name_prefix()))?;
        let prefix = format!("{}_", config.name_prefix());

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match (row.first().and_then(Value::as_str), row.get(1).and_then(Value::as_str)) {
                (Some(table), Some(name)) if name.starts_with(&prefix) => {
                    out.push((table.to_string(), name.to_string()));
                }
                (Some(_), Some(_)) => {}
                _ => return Err(crate::internal_error!("unexpected trigger catalog row: {:?}", row)),
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Remove every trigger (and trigger function) carrying the configured
    /// prefix. Works from the catalog alone, so no rules need to be
    /// registered; a database without such triggers is left untouched.
    pub fn drop(conn: &mut dyn Connection, config: &DenormConfig) -> DenormResult<usize> {
        let dialect = conn.dialect();
        let installed = Self::installed(conn, config)?;

        let routines = match dialect.list_routines(&config.name_prefix()) {
            Some(query) => conn.query(&query)?,
            None => Vec::new(),
        };

        if installed.is_empty() && routines.is_empty() {
            debug!(prefix = %config.name_prefix(), "no triggers to drop");
            return Ok(0);
        }

        let transactional = dialect.transactional_ddl();
        if transactional {
            conn.begin()?;
        }

        let result = drop_all(conn, dialect, &installed, &routines);
        match result {
            Ok(()) => {
                if transactional {
                    conn.commit()?;
                }
                info!(count = installed.len(), dialect = dialect.name(), "dropped triggers");
                Ok(installed.len())
            }
            Err(e) => {
                if transactional {
                    if let Err(rollback) = conn.rollback() {
                        warn!(error = %rollback, "rollback after failed drop failed");
                    }
                }
                Err(e)
            }
        }
    }
}

fn ensure_prerequisites(conn: &mut dyn Connection, config: &DenormConfig) -> DenormResult<()> {
    let dialect = conn.dialect();
    for prerequisite in dialect.prerequisites(config) {
        if !conn.query(&prerequisite.check)?.is_empty() {
            continue;
        }
        match conn.execute(&prerequisite.create) {
            Ok(_) => info!(prerequisite = %prerequisite.description, "created prerequisite"),
            Err(e) if dialect.is_already_exists(&e) => {
                warn!(prerequisite = %prerequisite.description, error = %e, "prerequisite already exists");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn replace_trigger(
    conn: &mut dyn Connection,
    dialect: &dyn Dialect,
    table: &str,
    name: &str,
    ddl: &str,
) -> DenormResult<()> {
    for statement in dialect.drop_trigger(table, name) {
        conn.execute(&statement)?;
    }
    conn.execute_script(ddl)
}

fn drop_all(
    conn: &mut dyn Connection,
    dialect: &dyn Dialect,
    triggers: &[(String, String)],
    routines: &[Vec<Value>],
) -> DenormResult<()> {
    for (table, name) in triggers {
        for statement in dialect.drop_trigger(table, name) {
            conn.execute(&statement)?;
        }
    }

    // functions whose trigger is already gone
    for name in routines.iter().filter_map(|row| row.first().and_then(Value::as_str)) {
        if let Some(statement) = dialect.drop_routine(name) {
            conn.execute(&statement)?;
        }
    }
    Ok(())
}
