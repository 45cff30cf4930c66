//! Assertions on `DenormResult` values shared by the unit tests.

#![cfg(test)]

use std::fmt::Debug;

use super::DenormError;
use crate::DenormResult;

fn expect_err<T: Debug>(result: DenormResult<T>, expected: &str) -> DenormError {
    match result {
        Err(e) => e,
        Ok(v) => panic!("expected {expected}, but the operation succeeded: {v:?}"),
    }
}

/// # Panics
/// Panics unless `result` is an error with SQLSTATE `expected_sqlstate`.
pub fn assert_error_sqlstate<T: Debug>(result: DenormResult<T>, expected_sqlstate: &str) {
    let e = expect_err(result, &format!("SQLSTATE {expected_sqlstate}"));
    assert_eq!(
        e.sqlstate(),
        expected_sqlstate,
        "expected SQLSTATE {expected_sqlstate}, got {}: {e}",
        e.sqlstate()
    );
}

/// # Panics
/// Panics unless `result` is an error whose message contains `expected_substring`.
pub fn assert_error_contains<T: Debug>(result: DenormResult<T>, expected_substring: &str) {
    let message = expect_err(result, &format!("an error containing '{expected_substring}'")).to_string();
    assert!(
        message.contains(expected_substring),
        "error message '{message}' does not contain '{expected_substring}'"
    );
}

/// Check that an install failed on `trigger` of the rule owning
/// `model.field`, and hand back the database error underneath.
///
/// # Panics
/// Panics on success or on any other error.
pub fn assert_install_failed<T: Debug>(
    result: DenormResult<T>,
    model: &str,
    field: &str,
    trigger: &str,
) -> DenormError {
    match expect_err(result, "InstallFailed") {
        DenormError::InstallFailed {
            model: failed_model,
            field: failed_field,
            trigger: failed_trigger,
            source,
        } => {
            assert_eq!(
                (failed_model.as_str(), failed_field.as_str()),
                (model, field),
                "install failure blamed the wrong rule"
            );
            assert_eq!(failed_trigger, trigger, "install failure names the wrong trigger");
            *source
        }
        other => panic!("expected InstallFailed for {model}.{field}, got {other:?}"),
    }
}

/// Check that saving instance `pk` of `model` failed; returns the reason.
///
/// # Panics
/// Panics on success or on any other error.
pub fn assert_save_failed<T: Debug>(result: DenormResult<T>, model: &str, pk: &str) -> String {
    match expect_err(result, "SaveFailed") {
        DenormError::SaveFailed {
            model: failed_model,
            pk: failed_pk,
            reason,
        } => {
            assert_eq!((failed_model.as_str(), failed_pk.as_str()), (model, pk));
            reason
        }
        other => panic!("expected SaveFailed for {model} {pk}, got {other:?}"),
    }
}

mod tests {
    use super::*;

    #[test]
    fn test_install_failed_hands_back_source() {
        let failed: DenormResult<()> = Err(DenormError::InstallFailed {
            model: "shop.Order".to_string(),
            field: "total".to_string(),
            trigger: "denorm_after_row_insert_on_shop_line_0".to_string(),
            source: Box::new(DenormError::database("create trigger", Some("42501".to_string()), "denied")),
        });
        let source = assert_install_failed(failed, "shop.Order", "total", "denorm_after_row_insert_on_shop_line_0");
        assert_eq!(source.database_code(), Some("42501"));
    }

    #[test]
    #[should_panic(expected = "wrong trigger")]
    fn test_install_failed_checks_trigger_name() {
        let failed: DenormResult<()> = Err(DenormError::InstallFailed {
            model: "shop.Order".to_string(),
            field: "total".to_string(),
            trigger: "denorm_after_row_delete_on_shop_line_0".to_string(),
            source: Box::new(DenormError::database("create trigger", None, "denied")),
        });
        assert_install_failed(failed, "shop.Order", "total", "denorm_after_row_insert_on_shop_line_0");
    }
}
