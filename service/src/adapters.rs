//! Production collaborators for the registration pipeline.
//!
//! Phone verification and form schemas are read from the same database as the
//! admission store. Notification delivery is a logging stand-in until an
//! email/SMS provider is wired in.

use admission_core::collaborators::{
    CollaboratorError, CollaboratorFuture, FieldError, FormValidation, FormValidator, Notifier,
    PhoneVerifier,
};
use admission_core::types::{EventId, FormData, Registration};
use sqlx::{PgPool, Row};

/// Map a query failure to a collaborator error.
///
/// Connection-level failures are retryable; anything else is a hard failure.
fn collaborator_error(context: &str, error: &sqlx::Error) -> CollaboratorError {
    match error {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => CollaboratorError::Unavailable(format!("{context}: {error}")),
        _ => CollaboratorError::Failed(format!("{context}: {error}")),
    }
}

/// Notifier that logs confirmations instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, registration: &'a Registration) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            tracing::info!(
                registration_id = %registration.id,
                ticket_id = %registration.ticket_id,
                email = %registration.email,
                status = %registration.status,
                referral_code = %registration.referral_code,
                "Registration confirmation sent"
            );
            Ok(())
        })
    }
}

/// Phone verifier backed by the `phone_verifications` table.
///
/// A phone counts as verified while it has a completed verification that has
/// not yet expired.
#[derive(Debug, Clone)]
pub struct PostgresPhoneVerifier {
    pool: PgPool,
}

impl PostgresPhoneVerifier {
    /// Create a verifier over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PhoneVerifier for PostgresPhoneVerifier {
    fn is_phone_verified<'a>(&'a self, phone: &'a str) -> CollaboratorFuture<'a, bool> {
        Box::pin(async move {
            sqlx::query_scalar(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM phone_verifications
                    WHERE phone = $1 AND verified_at IS NOT NULL AND expires_at > now()
                )
                ",
            )
            .bind(phone)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| collaborator_error("check phone verification", &e))
        })
    }
}

/// One configured field of an event's registration form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    /// Key in the submitted form data
    pub name: String,
    /// Whether a non-empty value must be present
    pub required: bool,
    /// Maximum length of string values, in characters
    pub max_length: Option<usize>,
}

/// Check `form` against `fields`.
///
/// Required fields must be present and not blank. String values longer than
/// their field's `max_length` fail. Keys with no configured field are
/// accepted as-is.
#[must_use]
pub fn validate_form(fields: &[FormField], form: &FormData) -> FormValidation {
    let mut errors = Vec::new();
    for field in fields {
        let value = form.get(&field.name);
        let blank = match value {
            None | Some(serde_json::Value::Null) => true,
            Some(serde_json::Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if blank {
            if field.required {
                errors.push(FieldError::new(&field.name, "is required"));
            }
            continue;
        }
        if let (Some(max), Some(serde_json::Value::String(s))) = (field.max_length, value) {
            if s.chars().count() > max {
                errors.push(FieldError::new(
                    &field.name,
                    format!("must be at most {max} characters"),
                ));
            }
        }
    }
    FormValidation::from_errors(errors)
}

/// Form validator backed by the `event_form_fields` table.
#[derive(Debug, Clone)]
pub struct PostgresFormValidator {
    pool: PgPool,
}

impl PostgresFormValidator {
    /// Create a validator over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_fields(&self, event_id: EventId) -> Result<Vec<FormField>, CollaboratorError> {
        let rows = sqlx::query(
            "SELECT name, required, max_length FROM event_form_fields WHERE event_id = $1",
        )
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| collaborator_error("load form fields", &e))?;

        rows.iter()
            .map(|row| {
                let max_length: Option<i32> = row
                    .try_get("max_length")
                    .map_err(|e| collaborator_error("decode form field", &e))?;
                Ok(FormField {
                    name: row
                        .try_get("name")
                        .map_err(|e| collaborator_error("decode form field", &e))?,
                    required: row
                        .try_get("required")
                        .map_err(|e| collaborator_error("decode form field", &e))?,
                    max_length: max_length.and_then(|len| usize::try_from(len).ok()),
                })
            })
            .collect()
    }
}

impl FormValidator for PostgresFormValidator {
    fn validate<'a>(
        &'a self,
        event_id: EventId,
        form: &'a FormData,
    ) -> CollaboratorFuture<'a, FormValidation> {
        Box::pin(async move {
            let fields = self.load_fields(event_id).await?;
            Ok(validate_form(&fields, form))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use admission_core::types::TicketId;
    use admission_testing::fixtures::existing_registration;

    fn fields() -> Vec<FormField> {
        vec![
            FormField {
                name: "name".to_string(),
                required: true,
                max_length: Some(10),
            },
            FormField {
                name: "company".to_string(),
                required: false,
                max_length: Some(5),
            },
        ]
    }

    #[test]
    fn complete_form_is_valid() {
        let form = FormData::new().with("name", "Ada").with("company", "ACME");
        assert_eq!(validate_form(&fields(), &form), FormValidation::Valid);
    }

    #[test]
    fn blank_required_field_fails() {
        let form = FormData::new().with("name", "   ");
        let validation = validate_form(&fields(), &form);
        assert_eq!(validation.summary().as_deref(), Some("name: is required"));
    }

    #[test]
    fn optional_field_may_be_missing_but_not_too_long() {
        let form = FormData::new().with("name", "Ada");
        assert_eq!(validate_form(&fields(), &form), FormValidation::Valid);

        let form = FormData::new().with("name", "Ada").with("company", "Analytical");
        let FormValidation::Invalid(errors) = validate_form(&fields(), &form) else {
            panic!("expected an invalid form");
        };
        assert_eq!(errors, vec![FieldError::new("company", "must be at most 5 characters")]);
    }

    #[test]
    fn unknown_keys_and_non_strings_are_accepted() {
        let form = FormData::new()
            .with("name", "Ada")
            .with("company", 12_345_678)
            .with("newsletter", true);
        assert_eq!(validate_form(&fields(), &form), FormValidation::Valid);
    }

    #[test]
    fn pool_exhaustion_is_retryable() {
        let error = collaborator_error("check phone verification", &sqlx::Error::PoolTimedOut);
        assert!(matches!(error, CollaboratorError::Unavailable(_)));
        let error = collaborator_error("load form fields", &sqlx::Error::RowNotFound);
        assert!(matches!(error, CollaboratorError::Failed(_)));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        let registration = existing_registration(EventId::new(), TicketId::new(), "ada@example.com");
        assert!(LogNotifier.notify(&registration).await.is_ok());
    }
}
