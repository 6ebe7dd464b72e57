//! External collaborators consumed by the commit pipeline.
//!
//! Form validation, SMS verification and notification delivery are
//! capabilities the admission core depends on but does not implement.

use crate::types::{EventId, FormData, Registration};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors reported by collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached; the caller may retry.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered with a failure.
    #[error("Collaborator failed: {0}")]
    Failed(String),
}

/// Boxed future returned by collaborator methods.
pub type CollaboratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// A single form field that failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Field name
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    /// Create a field error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result of validating form data against an event's field schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormValidation {
    /// All fields passed.
    Valid,
    /// One or more fields failed.
    Invalid(Vec<FieldError>),
}

impl FormValidation {
    /// Build from a list of errors; empty means valid.
    #[must_use]
    pub fn from_errors(errors: Vec<FieldError>) -> Self {
        if errors.is_empty() {
            Self::Valid
        } else {
            Self::Invalid(errors)
        }
    }

    /// One-line summary of the failures, `None` when valid.
    #[must_use]
    pub fn summary(&self) -> Option<String> {
        match self {
            Self::Valid => None,
            Self::Invalid(errors) => Some(
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        }
    }
}

/// Validates form data against the field schema configured for an event.
pub trait FormValidator: Send + Sync {
    /// Validate `form` for `event_id`.
    fn validate<'a>(
        &'a self,
        event_id: EventId,
        form: &'a FormData,
    ) -> CollaboratorFuture<'a, FormValidation>;
}

/// Answers whether a phone number has a verified, unexpired verification.
pub trait PhoneVerifier: Send + Sync {
    /// Whether `phone` is currently verified.
    fn is_phone_verified<'a>(&'a self, phone: &'a str) -> CollaboratorFuture<'a, bool>;
}

/// Delivers confirmation messages (email, SMS) for committed registrations.
///
/// Called after commit, outside the admission unit; failures never undo the
/// registration.
pub trait Notifier: Send + Sync {
    /// Send the confirmation for `registration`.
    fn notify<'a>(&'a self, registration: &'a Registration) -> CollaboratorFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_error_list_is_valid() {
        assert_eq!(FormValidation::from_errors(vec![]), FormValidation::Valid);
        assert_eq!(FormValidation::Valid.summary(), None);
    }

    #[test]
    fn summary_lists_every_field() {
        let validation = FormValidation::from_errors(vec![
            FieldError::new("name", "is required"),
            FieldError::new("company", "is too long"),
        ]);
        assert_eq!(
            validation.summary().as_deref(),
            Some("name: is required; company: is too long")
        );
    }
}
