use crate::config::{DenormConfig, POSTGRES_MAX_IDENTIFIER, PROCEDURAL_LANGUAGE, RANDOM_BIGINT_SPAN};
use crate::error::{DenormError, DenormResult};
use crate::sql::{InsertAction, Statement, Value};
use crate::trigger::Trigger;

use super::{Dialect, DialectKind, Prerequisite};

/// Trigger functions are named after their trigger with this prefix
pub const FUNCTION_PREFIX: &str = "func_";

/// Dollar-quote tag around trigger function bodies
const BODY_TAG: &str = "$denorm$";

/// PostgreSQL: a PL/pgSQL function per trigger plus the trigger calling it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Postgres {
    pub fn function_name(trigger_name: &str) -> String {
        format!("{}{}", FUNCTION_PREFIX, trigger_name)
    }
}

impl Dialect for Postgres {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_nan() => "'NaN'::float8".to_string(),
            Value::Float(f) if f.is_infinite() => {
                if *f > 0.0 { "'Infinity'::float8" } else { "'-Infinity'::float8" }.to_string()
            }
            Value::Float(f) => format!("{:?}", f),
            Value::Text(s) if s.contains('$') => {
                // keep dollar signs out of literals that may land inside a
                // dollar-quoted function body
                let pieces: Vec<String> = s
                    .split('$')
                    .map(|p| format!("'{}'", p.replace('\'', "''")))
                    .collect();
                format!("({})", pieces.join(" || chr(36) || "))
            }
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.quote_literal(v)).collect();
                format!("({})", parts.join(", "))
            }
        }
    }

    fn max_identifier_len(&self) -> usize {
        POSTGRES_MAX_IDENTIFIER
    }

    fn reserved_name_len(&self) -> usize {
        FUNCTION_PREFIX.len()
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn distinct(&self, left: &str, right: &str) -> String {
        format!("{} IS DISTINCT FROM {}", left, right)
    }

    fn random_bigint(&self) -> DenormResult<String> {
        Ok(format!("({}::INT8 * ((RANDOM()-0.5)*2.0))::INT8", RANDOM_BIGINT_SPAN))
    }

    fn render_insert(&self, action: &InsertAction) -> DenormResult<Statement> {
        let mut out = self.render_plain_insert("INSERT INTO", action)?;
        out.push_sql(" ON CONFLICT DO NOTHING");
        Ok(out)
    }

    fn render_trigger(&self, name: &str, trigger: &Trigger, body: Statement) -> DenormResult<Statement> {
        let function = self.quote_ident(&Postgres::function_name(name));
        let quoted_name = self.quote_ident(name);
        let table = self.quote_ident(trigger.table());

        let mut out = Statement::raw(format!(
            "CREATE OR REPLACE FUNCTION {function}()\n    RETURNS TRIGGER AS {BODY_TAG}\n    BEGIN\n        "
        ));
        out.push(body);
        out.push_sql(&format!(
            "\n        RETURN NULL;\n    END;\n{BODY_TAG} LANGUAGE {PROCEDURAL_LANGUAGE};\n\
             CREATE TRIGGER {quoted_name}\n    {} {} ON {table}\n    FOR EACH ROW EXECUTE PROCEDURE {function}();",
            trigger.time().as_sql(),
            trigger.event().as_sql(),
        ));
        Ok(out)
    }

    fn drop_trigger(&self, table: &str, name: &str) -> Vec<Statement> {
        vec![
            Statement::raw(format!(
                "DROP TRIGGER IF EXISTS {} ON {}",
                self.quote_ident(name),
                self.quote_ident(table)
            )),
            Statement::raw(format!(
                "DROP FUNCTION IF EXISTS {}()",
                self.quote_ident(&Postgres::function_name(name))
            )),
        ]
    }

    fn list_routines(&self, prefix: &str) -> Option<Statement> {
        Some(Statement::new(
            "SELECT proname::text FROM pg_catalog.pg_proc WHERE proname LIKE %s",
            vec![Value::Text(format!("{}{}\\_%", FUNCTION_PREFIX.replace('_', "\\_"), prefix))],
        ))
    }

    fn drop_routine(&self, name: &str) -> Option<Statement> {
        Some(Statement::raw(format!("DROP FUNCTION IF EXISTS {}()", self.quote_ident(name))))
    }

    fn list_triggers(&self, prefix: &str) -> Statement {
        Statement::new(
            "SELECT pg_class.relname::text, pg_trigger.tgname::text FROM pg_catalog.pg_trigger \
             JOIN pg_catalog.pg_class ON pg_trigger.tgrelid = pg_class.oid \
             WHERE NOT pg_trigger.tgisinternal AND pg_trigger.tgname LIKE %s",
            vec![Value::Text(format!("{}\\_%", prefix))],
        )
    }

    fn prerequisites(&self, _config: &DenormConfig) -> Vec<Prerequisite> {
        vec![Prerequisite {
            description: format!("procedural language {}", PROCEDURAL_LANGUAGE),
            check: Statement::new(
                "SELECT lanname FROM pg_catalog.pg_language WHERE lanname = %s",
                vec![Value::from(PROCEDURAL_LANGUAGE)],
            ),
            create: Statement::raw(format!("CREATE LANGUAGE {}", PROCEDURAL_LANGUAGE)),
        }]
    }

    fn is_already_exists(&self, error: &DenormError) -> bool {
        match error {
            DenormError::Database { code, message, .. } => {
                code.as_deref() == Some("42710") || message.contains("already exists")
            }
            _ => false,
        }
    }
}
