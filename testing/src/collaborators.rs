//! Mock collaborators for pipeline tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use admission_core::collaborators::{
    CollaboratorError, CollaboratorFuture, FieldError, FormValidation, FormValidator, Notifier,
    PhoneVerifier,
};
use admission_core::types::{EventId, FormData, Registration, RegistrationId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Form validator with a fixed list of required fields per event.
///
/// Events without configured fields accept any form.
#[derive(Clone, Debug, Default)]
pub struct StaticFormValidator {
    required: Arc<Mutex<HashMap<EventId, Vec<String>>>>,
}

impl StaticFormValidator {
    /// Create a validator that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `fields` to be present and non-empty for `event_id`.
    #[must_use]
    pub fn require(self, event_id: EventId, fields: &[&str]) -> Self {
        self.required
            .lock()
            .unwrap()
            .insert(event_id, fields.iter().map(ToString::to_string).collect());
        self
    }
}

impl FormValidator for StaticFormValidator {
    fn validate<'a>(
        &'a self,
        event_id: EventId,
        form: &'a FormData,
    ) -> CollaboratorFuture<'a, FormValidation> {
        let required = self
            .required
            .lock()
            .unwrap()
            .get(&event_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move {
            let errors = required
                .into_iter()
                .filter(|field| match form.get(field) {
                    None | Some(serde_json::Value::Null) => true,
                    Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                    Some(_) => false,
                })
                .map(|field| FieldError::new(field, "is required"))
                .collect();
            Ok(FormValidation::from_errors(errors))
        })
    }
}

/// Phone verifier backed by a set of verified numbers.
#[derive(Clone, Debug, Default)]
pub struct MockPhoneVerifier {
    verified: Arc<Mutex<HashSet<String>>>,
    unavailable: Arc<Mutex<bool>>,
    lookups: Arc<Mutex<usize>>,
}

impl MockPhoneVerifier {
    /// Create a verifier with no verified numbers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `phone` as verified.
    #[must_use]
    pub fn with_verified(self, phone: &str) -> Self {
        self.verified.lock().unwrap().insert(phone.to_string());
        self
    }

    /// Simulate an SMS provider outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }

    /// Number of lookups performed.
    #[must_use]
    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

impl PhoneVerifier for MockPhoneVerifier {
    fn is_phone_verified<'a>(&'a self, phone: &'a str) -> CollaboratorFuture<'a, bool> {
        Box::pin(async move {
            *self.lookups.lock().unwrap() += 1;
            if *self.unavailable.lock().unwrap() {
                return Err(CollaboratorError::Unavailable("sms provider offline".into()));
            }
            Ok(self.verified.lock().unwrap().contains(phone))
        })
    }
}

/// Notifier that records deliveries and can fail a number of attempts first.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    delivered: Arc<Mutex<Vec<RegistrationId>>>,
    attempts: Arc<Mutex<usize>>,
    failures_remaining: Arc<Mutex<usize>>,
}

impl RecordingNotifier {
    /// Create a notifier that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `count` attempts.
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        *self.failures_remaining.lock().unwrap() = count;
        self
    }

    /// Registrations successfully notified.
    #[must_use]
    pub fn delivered(&self) -> Vec<RegistrationId> {
        self.delivered.lock().unwrap().clone()
    }

    /// Total attempts, failed or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }

    /// Poll until at least `count` deliveries happened or `timeout` passes.
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.delivered.lock().unwrap().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.delivered.lock().unwrap().len() >= count
    }
}

impl Notifier for RecordingNotifier {
    fn notify<'a>(&'a self, registration: &'a Registration) -> CollaboratorFuture<'a, ()> {
        Box::pin(async move {
            *self.attempts.lock().unwrap() += 1;
            {
                let mut remaining = self.failures_remaining.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CollaboratorError::Failed("smtp relay refused".into()));
                }
            }
            self.delivered.lock().unwrap().push(registration.id);
            Ok(())
        })
    }
}
