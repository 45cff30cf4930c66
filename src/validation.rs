//! Input Validation Module
//!
//! Every table, column and trigger name that reaches generated SQL passes
//! through here first. Identifiers are still quoted by the dialect at render
//! time; validation rejects names the quoting would have to escape.
//!
//! ## Usage
//!
//! ```rust
//! use denorm::validation::validate_sql_identifier;
//!
//! validate_sql_identifier("shop_order", "table").unwrap();
//! assert!(validate_sql_identifier("shop_order; DROP", "table").is_err());
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::MYSQL_MAX_IDENTIFIER;
use crate::error::{DenormError, DenormResult};

static MODEL_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .unwrap_or_else(|e| panic!("model label pattern: {e}"))
});

/// Validate a SQL identifier (table, column, trigger names)
///
/// Allows ASCII alphanumerics and underscores, not starting with a digit,
/// at most 64 bytes (the larger of the two supported backends' limits).
pub fn validate_sql_identifier(identifier: &str, param_name: &str) -> DenormResult<()> {
    if identifier.is_empty() {
        return Err(DenormError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: format!("{param_name} cannot be empty"),
        });
    }

    if !identifier.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DenormError::InvalidIdentifier {
            identifier: sanitize_for_logging(identifier),
            reason: format!("{param_name} must contain only alphanumeric characters and underscores"),
        });
    }

    if identifier.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(DenormError::InvalidIdentifier {
            identifier: sanitize_for_logging(identifier),
            reason: format!("{param_name} cannot start with a digit"),
        });
    }

    if identifier.len() > MYSQL_MAX_IDENTIFIER {
        return Err(DenormError::InvalidIdentifier {
            identifier: format!("{}... ({} chars)", &identifier[..20], identifier.len()),
            reason: format!("{param_name} too long (max {MYSQL_MAX_IDENTIFIER} characters)"),
        });
    }

    Ok(())
}

/// Validate a model label such as `shop.Order`
pub fn validate_model_label(label: &str) -> DenormResult<()> {
    if MODEL_LABEL.is_match(label) {
        Ok(())
    } else {
        Err(DenormError::InvalidIdentifier {
            identifier: sanitize_for_logging(label),
            reason: "model label must be dotted identifiers".to_string(),
        })
    }
}

/// Sanitize string for logging (truncate, escape control chars)
pub(crate) fn sanitize_for_logging(s: &str) -> String {
    let max_len = 50;
    let truncated = if s.len() > max_len {
        let cut = (0..=max_len).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &s[..cut])
    } else {
        s.to_string()
    };

    truncated
        .replace('\0', "\\0")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
}
