//! Error types for admission control.
//!
//! Three layers, narrowing toward the caller:
//!
//! - [`StoreError`]: what a store adapter may report. Adapters translate their
//!   driver errors into it so nothing above them sees `sqlx` types.
//! - [`RejectionReason`]: expected, user-facing refusals. Returned, never thrown.
//! - [`RegistrationError`]: the single outward taxonomy of the commit pipeline
//!   (rejection / try again / fatal).

use std::fmt;
use thiserror::Error;

/// Expected, user-facing refusal of a registration attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    /// No capacity left on the ticket.
    TicketSoldOut,
    /// Outside the sale window, or the ticket is inactive.
    TicketNotOnSale,
    /// The invitation or referral code is unknown, inactive, out of scope or
    /// outside its validity window.
    CodeInvalid,
    /// The invitation code has no remaining uses.
    CodeExhausted,
    /// SMS verification is required and the phone is not verified.
    PhoneNotVerified,
    /// Form data failed the event's field schema.
    FormInvalid,
}

impl RejectionReason {
    /// Stable machine-readable code for clients and metric labels.
    #[must_use]
    pub const fn as_code(&self) -> &'static str {
        match self {
            Self::TicketSoldOut => "TICKET_SOLD_OUT",
            Self::TicketNotOnSale => "TICKET_NOT_ON_SALE",
            Self::CodeInvalid => "CODE_INVALID",
            Self::CodeExhausted => "CODE_EXHAUSTED",
            Self::PhoneNotVerified => "PHONE_NOT_VERIFIED",
            Self::FormInvalid => "FORM_INVALID",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// Errors a store adapter may surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Serialization failure, deadlock or lock timeout caused by a concurrent
    /// writer. Safe to retry.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    /// The store could not be reached (pool exhausted, connection lost).
    /// Safe to retry.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("ticket", "registration")
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Another registration already committed with this idempotency key; the
    /// whole unit was rolled back.
    #[error("Idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    /// The new registration's referral code is already taken within its
    /// event; nothing was written.
    #[error("Referral code already issued: {0}")]
    DuplicateReferralCode(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Returns `true` for errors that a retry may resolve.
    ///
    /// # Examples
    ///
    /// ```
    /// # use admission_core::StoreError;
    /// assert!(StoreError::Conflict("40001".into()).is_transient());
    /// assert!(!StoreError::Database("syntax error".into()).is_transient());
    /// ```
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_))
    }
}

/// Coarse category of a [`RegistrationError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Expected refusal, safe to show to the end user.
    Rejection,
    /// Retryable; the caller should try again shortly.
    Transient,
    /// Programmer error or broken reference; logged, shown generically.
    Fatal,
}

/// Outcome of a failed registration as seen by the pipeline's caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The attempt was refused for an expected reason.
    #[error("Registration rejected: {reason}{}", detail_suffix(.detail))]
    Rejected {
        /// Why the attempt was refused
        reason: RejectionReason,
        /// Extra context (which field failed, which check)
        detail: Option<String>,
    },

    /// Contention or store unavailability outlasted the retry budget.
    /// Distinct from `TicketSoldOut`: capacity may well remain.
    #[error("Try again: {detail}")]
    TryAgain {
        /// Last transient error observed
        detail: String,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// Malformed request or unexpected store failure.
    #[error("Registration failed: {detail}")]
    Fatal {
        /// Server-side detail; never shown to end users verbatim
        detail: String,
    },
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default()
}

impl RegistrationError {
    /// Rejection without extra detail.
    #[must_use]
    pub const fn rejected(reason: RejectionReason) -> Self {
        Self::Rejected {
            reason,
            detail: None,
        }
    }

    /// Rejection with detail.
    #[must_use]
    pub fn rejected_with(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            detail: Some(detail.into()),
        }
    }

    /// Fatal error with detail.
    #[must_use]
    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal {
            detail: detail.into(),
        }
    }

    /// Which of the three categories this error belongs to.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Rejected { .. } => ErrorCategory::Rejection,
            Self::TryAgain { .. } => ErrorCategory::Transient,
            Self::NotFound { .. } | Self::Fatal { .. } => ErrorCategory::Fatal,
        }
    }

    /// The rejection reason, if this is a rejection.
    #[must_use]
    pub const fn rejection(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// HTTP status an outer layer should answer with.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::Rejected {
                reason: RejectionReason::TicketSoldOut | RejectionReason::CodeExhausted,
                ..
            } => 409,
            Self::Rejected { .. } => 422,
            Self::TryAgain { .. } => 503,
            Self::NotFound { .. } => 404,
            Self::Fatal { .. } => 500,
        }
    }
}

impl From<StoreError> for RegistrationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(detail) | StoreError::Unavailable(detail) => {
                Self::TryAgain { detail }
            }
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::DuplicateIdempotencyKey(key) => {
                Self::fatal(format!("unresolved duplicate idempotency key {key}"))
            }
            StoreError::DuplicateReferralCode(code) => {
                Self::fatal(format!("could not issue a unique referral code, last tried {code}"))
            }
            StoreError::Database(detail) => Self::Fatal { detail },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_codes_are_stable() {
        assert_eq!(RejectionReason::TicketSoldOut.as_code(), "TICKET_SOLD_OUT");
        assert_eq!(RejectionReason::CodeExhausted.to_string(), "CODE_EXHAUSTED");
        assert_eq!(RejectionReason::FormInvalid.as_code(), "FORM_INVALID");
    }

    #[test]
    fn transient_store_errors_become_try_again() {
        let error: RegistrationError = StoreError::Conflict("serialization failure".into()).into();
        assert_eq!(error.category(), ErrorCategory::Transient);
        assert_eq!(error.http_status(), 503);
        assert_ne!(error.rejection(), Some(RejectionReason::TicketSoldOut));
    }

    #[test]
    fn missing_entities_are_fatal_not_rejections() {
        let error: RegistrationError = StoreError::NotFound {
            entity: "ticket",
            id: "abc".into(),
        }
        .into();
        assert_eq!(error.category(), ErrorCategory::Fatal);
        assert_eq!(error.http_status(), 404);
    }

    #[test]
    fn referral_code_collision_is_neither_transient_nor_rejection() {
        let store_error = StoreError::DuplicateReferralCode("AB12CD34".into());
        assert!(!store_error.is_transient());
        let error: RegistrationError = store_error.into();
        assert_eq!(error.category(), ErrorCategory::Fatal);
        assert_eq!(error.rejection(), None);
    }

    #[test]
    fn rejection_display_includes_detail() {
        let error = RegistrationError::rejected_with(RejectionReason::FormInvalid, "email is required");
        let display = error.to_string();
        assert!(display.contains("FORM_INVALID"));
        assert!(display.contains("email is required"));
        assert_eq!(error.http_status(), 422);
        assert_eq!(
            RegistrationError::rejected(RejectionReason::TicketSoldOut).http_status(),
            409
        );
    }
}
