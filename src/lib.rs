//! Trigger-maintained denormalized fields.
//!
//! A rule ([`denorm::Denorm`]) declares a field on one model whose value is
//! derived from rows of related models: a sum, a count, a cache key, or an
//! arbitrary callback. Rules are registered with the [`registry`], bound
//! to a [`model::ModelGraph`], and turned into a [`trigger::TriggerSet`]
//! rendered for MySQL or PostgreSQL. Aggregates are kept current by the
//! triggers themselves; callback fields are queued as dirty markers and
//! recomputed by [`dirty::flush`].

pub mod config;
pub mod connection;
pub mod denorm;
pub mod dependency;
pub mod dialect;
pub mod dirty;
pub mod error;
pub mod model;
pub mod predicate;
pub mod registry;
pub mod sql;
pub mod trigger;
pub mod validation;

#[cfg(feature = "pg")]
pub mod spi;

pub use error::{DenormError, DenormResult};

#[cfg(feature = "pg")]
pgrx::pg_module_magic!();

#[cfg(feature = "pg")]
#[pgrx::pg_extern]
fn denorm_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
