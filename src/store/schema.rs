//! Validate-before-persist contract for stored entities.

use serde::Serialize;

use crate::error::{Error, Result};

/// A persisted entity with a named schema.
pub trait Record: Serialize {
    /// Schema identifier reported in validation errors.
    const SCHEMA: &'static str;

    /// Check structural invariants. Called by [`super::Store::write`].
    fn validate(&self) -> Result<()>;
}

/// Fail with a schema error unless `cond` holds.
pub fn require(cond: bool, schema: &'static str, message: impl Into<String>) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(Error::Schema {
            schema,
            message: message.into(),
        })
    }
}

/// Fail unless `value` is a non-blank string.
pub fn require_non_empty(value: &str, schema: &'static str, field: &str) -> Result<()> {
    require(
        !value.trim().is_empty(),
        schema,
        format!("{field} must be a non-empty string"),
    )
}

/// Fail unless `value` lies in `[0, 1]`.
pub fn require_unit_interval(value: f64, schema: &'static str, field: &str) -> Result<()> {
    require(
        (0.0..=1.0).contains(&value),
        schema,
        format!("{field} must be between 0 and 1"),
    )
}
