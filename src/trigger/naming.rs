//! Database-visible trigger names.
//!
//! Base names are `<prefix>_<time>_row_<event>_on_<table>[_<content type>]`,
//! lowercase. A trigger set appends `_<index>` per bucket entry. Names over
//! the backend limit are cut and given a suffix derived from a digest of the
//! full name, so the same rule set always installs under the same names.

use sha2::{Digest, Sha256};

use crate::config::SUFFIX_ALPHABET;

use super::{TriggerEvent, TriggerTime};

pub fn base_name(
    prefix: &str,
    time: TriggerTime,
    event: TriggerEvent,
    table: &str,
    disambiguator: Option<i64>,
) -> String {
    let mut name = format!("{}_{}_row_{}_on_{}", prefix, time.as_str(), event.as_str(), table);
    if let Some(tag) = disambiguator {
        name.push_str(&format!("_{}", tag));
    }
    name.to_lowercase()
}

pub fn indexed(bucket: &str, index: usize) -> String {
    format!("{}_{}", bucket, index)
}

/// Fit `name` into `budget` characters
pub fn fit(name: &str, budget: usize, suffix_length: usize) -> String {
    if name.len() <= budget {
        return name.to_string();
    }

    let keep = budget.saturating_sub(suffix_length);
    let cut = (0..=keep).rev().find(|i| name.is_char_boundary(*i)).unwrap_or(0);
    format!("{}{}", &name[..cut], suffix(name, suffix_length))
}

fn suffix(name: &str, length: usize) -> String {
    let digest = Sha256::digest(name.as_bytes());
    (0..length)
        .map(|i| {
            let byte = digest[i % digest.len()];
            SUFFIX_ALPHABET[usize::from(byte) % SUFFIX_ALPHABET.len()] as char
        })
        .collect()
}
