//! Reservation coordinator: the only writer of admission counters.
//!
//! Each call to [`ReservationCoordinator::try_reserve`] runs one admission
//! unit against the store and retries it, with jittered backoff, when the
//! store reports a transient failure. Rejections are final and never retried.
//!
//! Serialization itself lives in the store (row locks and conditional
//! increments); the coordinator holds no in-process lock, so any number of
//! instances may run side by side.

use crate::metrics::AdmissionMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use admission_core::decision::AdmissionCounters;
use admission_core::environment::Clock;
use admission_core::error::{RegistrationError, RejectionReason, StoreError};
use admission_core::store::{AdmissionStore, ReservationClaim, ReservationOutcome};
use admission_core::types::Registration;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Successful outcome of [`ReservationCoordinator::try_reserve`].
#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    /// The slot (and code use, if any) was claimed and the registration
    /// committed.
    Admitted {
        /// The committed registration
        registration: Registration,
        /// Counter values after the increments
        counters: AdmissionCounters,
    },
    /// The locked state refused the attempt. Nothing was written.
    Rejected(RejectionReason),
}

/// Failure of [`ReservationCoordinator::try_reserve`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReserveError {
    /// Transient failures outlasted the retry budget. Capacity may remain.
    #[error("Reservation retries exhausted after {attempts} attempts: {last_error}")]
    TryAgain {
        /// Attempts made, the first one included
        attempts: usize,
        /// Last transient error seen
        last_error: StoreError,
    },

    /// A non-transient store failure. Nothing was written.
    #[error(transparent)]
    Store(StoreError),
}

impl From<ReserveError> for RegistrationError {
    fn from(error: ReserveError) -> Self {
        match error {
            ReserveError::TryAgain {
                attempts,
                last_error,
            } => Self::TryAgain {
                detail: format!("{last_error} (after {attempts} attempts)"),
            },
            ReserveError::Store(error) => error.into(),
        }
    }
}

/// Atomically claims ticket slots and invitation code uses.
#[derive(Clone)]
pub struct ReservationCoordinator {
    store: Arc<dyn AdmissionStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl ReservationCoordinator {
    /// Create a coordinator over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AdmissionStore>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            retry,
        }
    }

    /// Retry policy applied to transient store failures.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Claim one slot on the claim's ticket, and one use of its invitation
    /// code if it carries one, committing the claim's rows with them.
    ///
    /// The admission decision is re-evaluated under the store's locks on
    /// every attempt, at the clock's current time, so a sale window that
    /// closes during a retry is honored.
    ///
    /// # Errors
    ///
    /// - [`ReserveError::TryAgain`] when every attempt failed transiently;
    ///   nothing was written
    /// - [`ReserveError::Store`] for any other store failure, including
    ///   `DuplicateIdempotencyKey`; nothing was written
    #[tracing::instrument(
        skip(self, claim),
        fields(
            ticket_id = %claim.ticket_id(),
            registration_id = %claim.registration().id,
            code_id = ?claim.invitation_code_id(),
        )
    )]
    pub async fn try_reserve(&self, claim: &ReservationClaim) -> Result<Reservation, ReserveError> {
        AdmissionMetrics::record_attempt();
        let started = Instant::now();
        let mut attempts = 0usize;

        let result = retry_with_predicate(
            self.retry.clone(),
            || {
                attempts += 1;
                self.store.reserve(claim, self.clock.now())
            },
            StoreError::is_transient,
        )
        .await;

        match result {
            Ok(ReservationOutcome::Admitted {
                registration,
                counters,
            }) => {
                AdmissionMetrics::record_admitted(started.elapsed());
                tracing::info!(
                    attempts,
                    sold_count = counters.ticket_sold_count,
                    remaining = counters.remaining(),
                    code_used_count = ?counters.code_used_count,
                    "Reservation admitted"
                );
                Ok(Reservation::Admitted {
                    registration,
                    counters,
                })
            }
            Ok(ReservationOutcome::Rejected(reason)) => {
                AdmissionMetrics::record_rejected(reason);
                tracing::info!(attempts, reason = reason.as_code(), "Reservation rejected");
                Ok(Reservation::Rejected(reason))
            }
            Err(error) if error.is_transient() => {
                AdmissionMetrics::record_try_again(started.elapsed());
                tracing::warn!(attempts, error = %error, "Reservation retries exhausted");
                Err(ReserveError::TryAgain {
                    attempts,
                    last_error: error,
                })
            }
            Err(error) => {
                tracing::debug!(attempts, error = %error, "Reservation failed");
                Err(ReserveError::Store(error))
            }
        }
    }
}

impl std::fmt::Debug for ReservationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationCoordinator")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
