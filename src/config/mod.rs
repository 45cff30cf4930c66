//! Process-wide settings for trigger naming, the dirty queue and
//! reconciliation.

use serde::{Deserialize, Serialize};

use crate::error::{DenormError, DenormResult};

/// Prefix every installed trigger and trigger function starts with.
/// `drop` finds previous installations by this prefix alone.
pub const DEFAULT_TRIGGER_PREFIX: &str = "denorm";

/// MySQL identifier limit (bytes)
pub const MYSQL_MAX_IDENTIFIER: usize = 64;

/// PostgreSQL identifier limit (NAMEDATALEN - 1)
pub const POSTGRES_MAX_IDENTIFIER: usize = 63;

/// Magnitude used by the database-side random expression; spans the
/// signed 64-bit range without overflowing it.
pub const RANDOM_BIGINT_SPAN: i64 = 9_223_372_036_854_775_806;

/// Alphabet for truncation suffixes; trigger names stay lowercase
pub const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Language of PostgreSQL trigger functions
pub const PROCEDURAL_LANGUAGE: &str = "plpgsql";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenormConfig {
    pub trigger_prefix: String,
    /// Overrides the dialect identifier limit when set
    pub identifier_limit: Option<usize>,
    pub suffix_length: usize,
    pub dirty_table: String,
    /// `None` keeps flushing until the queue is empty
    pub flush_max_passes: Option<usize>,
}

impl Default for DenormConfig {
    fn default() -> Self {
        Self {
            trigger_prefix: DEFAULT_TRIGGER_PREFIX.to_string(),
            identifier_limit: None,
            suffix_length: 5,
            dirty_table: "denorm_dirtyinstance".to_string(),
            flush_max_passes: None,
        }
    }
}

impl DenormConfig {
    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> DenormResult<Self> {
        let config: DenormConfig = serde_json::from_str(json)?;
        config.normalized()
    }

    /// Lowercase the trigger prefix, then validate. Trigger names are
    /// always lowercase, so a mixed-case prefix would never match the
    /// catalog on drop.
    pub fn normalized(mut self) -> DenormResult<Self> {
        self.trigger_prefix = self.trigger_prefix.to_lowercase();
        self.validate()?;
        Ok(self)
    }

    /// Prefix in the form installed trigger names carry
    pub fn name_prefix(&self) -> String {
        self.trigger_prefix.to_lowercase()
    }

    pub fn validate(&self) -> DenormResult<()> {
        crate::validation::validate_sql_identifier(&self.trigger_prefix, "trigger_prefix")?;
        crate::validation::validate_sql_identifier(&self.dirty_table, "dirty_table")?;

        if self.suffix_length == 0 || self.suffix_length > 16 {
            return Err(DenormError::ConfigError {
                setting: "suffix_length".to_string(),
                value: self.suffix_length.to_string(),
                reason: "must be between 1 and 16".to_string(),
            });
        }

        if let Some(limit) = self.identifier_limit {
            // the prefix plus a suffix must still fit
            let floor = self.trigger_prefix.len() + self.suffix_length + 1;
            if limit <= floor {
                return Err(DenormError::ConfigError {
                    setting: "identifier_limit".to_string(),
                    value: limit.to_string(),
                    reason: format!("must exceed {}", floor),
                });
            }
        }

        if self.flush_max_passes == Some(0) {
            return Err(DenormError::ConfigError {
                setting: "flush_max_passes".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::testing::assert_error_contains;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = DenormConfig::from_json(r#"{"identifier_limit": 30}"#).unwrap();
        assert_eq!(config.identifier_limit, Some(30));
        assert_eq!(config.trigger_prefix, "denorm");
        assert_eq!(config.suffix_length, 5);
        assert_eq!(config.flush_max_passes, None);
    }

    #[test]
    fn test_limit_too_small_rejected() {
        assert_error_contains(
            DenormConfig::from_json(r#"{"identifier_limit": 8}"#),
            "identifier_limit",
        );
    }

    #[test]
    fn test_prefix_lowercased() {
        let config = DenormConfig::from_json(r#"{"trigger_prefix": "Shop_Denorm"}"#).unwrap();
        assert_eq!(config.trigger_prefix, "shop_denorm");

        let raw = DenormConfig {
            trigger_prefix: "Shop".to_string(),
            ..DenormConfig::default()
        };
        assert_eq!(raw.name_prefix(), "shop");
        assert_eq!(raw.normalized().unwrap().trigger_prefix, "shop");
    }

    #[test]
    fn test_prefix_must_be_identifier() {
        assert_error_contains(
            DenormConfig::from_json(r#"{"trigger_prefix": "denorm; drop"}"#),
            "trigger_prefix",
        );
    }
}
