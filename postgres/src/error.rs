//! Translation of `sqlx` failures into [`StoreError`].

use admission_core::error::StoreError;

/// Unique constraint guarding idempotency keys.
pub(crate) const IDEMPOTENCY_CONSTRAINT: &str = "registrations_idempotency_key_unique";

/// Unique constraint guarding referral codes within an event.
pub(crate) const REFERRAL_CODE_CONSTRAINT: &str = "registrations_referral_code_unique";

// serialization_failure, deadlock_detected, lock_not_available
const CONFLICT_CODES: [&str; 3] = ["40001", "40P01", "55P03"];

/// Map a `sqlx` error raised while doing `context`.
///
/// - Serialization failures, deadlocks and lock timeouts become
///   [`StoreError::Conflict`]
/// - Pool exhaustion and connection failures become
///   [`StoreError::Unavailable`]
/// - Everything else becomes [`StoreError::Database`]
pub(crate) fn map_sqlx(context: &str, error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db_err) => {
            let is_conflict = db_err
                .code()
                .is_some_and(|code| CONFLICT_CODES.iter().any(|c| *c == code));
            if is_conflict {
                metrics::counter!("admission_store_conflicts_total").increment(1);
                StoreError::Conflict(format!("{context}: {error}"))
            } else {
                StoreError::Database(format!("{context}: {error}"))
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(format!("{context}: {error}")),
        _ => StoreError::Database(format!("{context}: {error}")),
    }
}

/// Whether `error` is a unique violation of `constraint`.
pub(crate) fn is_unique_violation_of(error: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = error {
        return db_err.is_unique_violation() && db_err.constraint() == Some(constraint);
    }
    false
}

/// Convert a counter column to `u32`.
pub(crate) fn counter(column: &'static str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Database(format!("negative value {value} in column {column}")))
}

/// Convert a `u32` counter to its column type.
pub(crate) fn column(column: &'static str, value: u32) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Database(format!("value {value} overflows column {column}")))
}
