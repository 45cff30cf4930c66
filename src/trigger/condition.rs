use crate::dialect::Dialect;
use crate::error::{DenormError, DenormResult};
use crate::sql::Statement;

/// Guard around a trigger body
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// True when any listed column differs between `OLD` and `NEW`
    FieldChange(FieldChange),
}

impl Condition {
    pub fn field_change<I, S>(table: &str, fields: I) -> DenormResult<Condition>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Condition::FieldChange(FieldChange::new(table, fields)?))
    }

    pub fn render(&self, dialect: &dyn Dialect, body: Statement) -> DenormResult<Statement> {
        dialect.render_condition(self, body)
    }
}

/// Ordered, duplicate-free, never empty list of column names
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    fields: Vec<String>,
}

impl FieldChange {
    pub fn new<I, S>(table: &str, fields: I) -> DenormResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for field in fields {
            let field = field.into();
            if !out.contains(&field) {
                out.push(field);
            }
        }

        if out.is_empty() {
            return Err(DenormError::EmptyFieldChange { table: table.to_string() });
        }
        Ok(Self { fields: out })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}
