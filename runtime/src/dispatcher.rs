//! Post-commit notification dispatch.
//!
//! Notifications are sent after the registration has committed and never
//! affect its outcome: a delivery failure is retried in the background and,
//! if retries run out, logged and counted.

use crate::metrics::NotificationMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use admission_core::collaborators::{CollaboratorError, Notifier};
use admission_core::types::Registration;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Sends confirmation notifications without blocking the caller.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    /// Create a dispatcher delivering through `notifier`.
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, retry: RetryPolicy) -> Self {
        Self { notifier, retry }
    }

    /// Spawn delivery of a notification for `registration`.
    ///
    /// Returns immediately. The handle resolves once delivery succeeded or
    /// was abandoned; callers may drop it.
    pub fn dispatch(&self, registration: Registration) -> JoinHandle<Result<(), CollaboratorError>> {
        let notifier = Arc::clone(&self.notifier);
        let retry = self.retry.clone();

        tokio::spawn(async move {
            let result = retry_with_backoff(retry, || notifier.notify(&registration)).await;
            match &result {
                Ok(()) => {
                    NotificationMetrics::record_sent();
                    tracing::debug!(registration_id = %registration.id, "Notification delivered");
                }
                Err(error) => {
                    NotificationMetrics::record_failed();
                    tracing::error!(
                        registration_id = %registration.id,
                        email = %registration.email,
                        error = %error,
                        "Notification abandoned after retries"
                    );
                }
            }
            result
        })
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
