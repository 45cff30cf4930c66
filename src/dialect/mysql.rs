use crate::config::{MYSQL_MAX_IDENTIFIER, RANDOM_BIGINT_SPAN};
use crate::error::DenormResult;
use crate::sql::{AssignAction, InsertAction, RowAlias, Statement, Value};
use crate::trigger::Trigger;

use super::{Dialect, DialectKind};

/// MySQL: the trigger body is the row trigger's own BEGIN ... END block.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySql;

impl Dialect for MySql {
    fn kind(&self) -> DialectKind {
        DialectKind::MySql
    }

    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn quote_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => format!("{:?}", f),
            Value::Float(_) => "NULL".to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.quote_literal(v)).collect();
                format!("({})", parts.join(", "))
            }
        }
    }

    fn max_identifier_len(&self) -> usize {
        MYSQL_MAX_IDENTIFIER
    }

    fn transactional_ddl(&self) -> bool {
        // every CREATE/DROP TRIGGER commits implicitly
        false
    }

    fn distinct(&self, left: &str, right: &str) -> String {
        format!("NOT ({} <=> {})", left, right)
    }

    fn random_bigint(&self) -> DenormResult<String> {
        Ok(format!("({} * ((RAND()-0.5)*2.0))", RANDOM_BIGINT_SPAN))
    }

    fn render_insert(&self, action: &InsertAction) -> DenormResult<Statement> {
        self.render_plain_insert("INSERT IGNORE INTO", action)
    }

    // error 1442: a trigger cannot write the table its statement is writing
    fn updates_triggering_table(&self) -> bool {
        false
    }

    fn render_assign(&self, action: &AssignAction) -> DenormResult<Statement> {
        let mut out = Statement::raw(format!("SET {} = ", self.row_ref(&RowAlias::New, &action.column)));
        out.push(self.render_expr(&action.value)?);
        Ok(out)
    }

    fn render_trigger(&self, name: &str, trigger: &Trigger, body: Statement) -> DenormResult<Statement> {
        let mut out = Statement::raw(format!(
            "CREATE TRIGGER {}\n    {} {} ON {}\n    FOR EACH ROW BEGIN\n        ",
            self.quote_ident(name),
            trigger.time().as_sql(),
            trigger.event().as_sql(),
            self.quote_ident(trigger.table()),
        ));
        out.push(body);
        out.push_sql("\n    END");
        Ok(out)
    }

    fn drop_trigger(&self, _table: &str, name: &str) -> Vec<Statement> {
        vec![Statement::raw(format!("DROP TRIGGER IF EXISTS {}", self.quote_ident(name)))]
    }

    fn list_triggers(&self, prefix: &str) -> Statement {
        Statement::new(
            "SELECT EVENT_OBJECT_TABLE, TRIGGER_NAME FROM information_schema.TRIGGERS \
             WHERE TRIGGER_SCHEMA = DATABASE() AND TRIGGER_NAME LIKE %s",
            vec![Value::Text(format!("{}\\_%", prefix))],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{Expr, InsertValues, NestedSelect, RowAlias};

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(MySql.quote_ident("shop_order"), "`shop_order`");
        assert_eq!(MySql.quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn test_random_bigint_spans_signed_range() {
        let sql = MySql.random_bigint().unwrap();
        assert!(sql.contains("9223372036854775806"));
        assert!(sql.contains("RAND()"));
    }

    #[test]
    fn test_insert_ignores_duplicates() {
        let action = InsertAction {
            table: "denorm_dirtyinstance".to_string(),
            columns: vec!["content_type_id".to_string(), "object_id".to_string()],
            values: InsertValues::Select(
                NestedSelect::new("shop_order", vec![Expr::Int(4), Expr::column("id")])
                    .filter(Expr::column("id"), Expr::row(RowAlias::New, "order_id")),
            ),
        };
        let stmt = MySql.render_insert(&action).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT IGNORE INTO `denorm_dirtyinstance` (`content_type_id`, `object_id`) \
             SELECT DISTINCT 4, `id` FROM `shop_order` WHERE `id` = NEW.`order_id`"
        );
    }

    #[test]
    fn test_assign_sets_new_row() {
        let action = AssignAction {
            table: "shop_order".to_string(),
            column: "cache_key".to_string(),
            value: Expr::Random(crate::sql::RandomBigInt),
        };
        assert_eq!(
            MySql.render_assign(&action).unwrap().sql,
            "SET NEW.`cache_key` = (9223372036854775806 * ((RAND()-0.5)*2.0))"
        );
        assert!(!MySql.updates_triggering_table());
    }

    #[test]
    fn test_null_safe_inequality() {
        assert_eq!(MySql.distinct("OLD.`a`", "NEW.`a`"), "NOT (OLD.`a` <=> NEW.`a`)");
    }

    #[test]
    fn test_list_triggers_escapes_underscore() {
        let stmt = MySql.list_triggers("denorm");
        assert_eq!(stmt.params, vec![Value::Text("denorm\\_%".to_string())]);
        assert!(stmt.inline(&MySql).unwrap().contains("LIKE 'denorm\\\\_%'"));
    }
}
