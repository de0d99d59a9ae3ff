//! Persistence layer modules.

pub mod db;
pub mod execution_repo;
pub mod retention;
pub mod schema;
pub mod session_repo;
pub mod work_item_repo;

use chrono::{DateTime, SecondsFormat, Utc};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

use crate::{AppError, Result};

/// Encode a timestamp for storage.
///
/// Fixed-width UTC with microseconds so lexicographic comparison in SQL
/// matches chronological order.
#[must_use]
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

pub(crate) fn parse_opt_ts(field: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(field, s)).transpose()
}
