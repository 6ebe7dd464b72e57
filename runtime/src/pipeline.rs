//! Registration commit pipeline.
//!
//! Orchestrates one registration attempt from request to committed row:
//!
//! 1. Replay: a known idempotency key returns the registration it created
//! 2. Ticket lookup and advisory availability check (fail fast, no lock)
//! 3. Form validation ([`FormValidator`]) then SMS verification
//!    ([`PhoneVerifier`]) when the ticket requires it
//! 4. Invitation and referral code validation (advisory; the budget is
//!    re-checked under lock)
//! 5. The admission unit through the [`ReservationCoordinator`], bounded by
//!    the request timeout
//! 6. Notification dispatch after commit
//!
//! Only step 5 writes. Every rejection before it leaves all counters and
//! rows untouched.
//!
//! A referral code that collides within the event is redrawn and the unit
//! retried a bounded number of times. A rejection of a keyed submission is
//! replaced by the registration holding that key, if one was committed
//! concurrently.
//!
//! When the request timeout fires the caller gets `TryAgain`, but the unit
//! may still commit afterwards. That registration is not notified; a
//! resubmission with the same key returns it and does not dispatch again,
//! since replays never notify.

use crate::coordinator::{Reservation, ReservationCoordinator, ReserveError};
use crate::dispatcher::NotificationDispatcher;
use crate::metrics::AdmissionMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use admission_core::availability::Availability;
use admission_core::codes::{
    CodeScope, generate_referral_code, validate_invitation_code, validate_referral,
};
use admission_core::collaborators::{
    CollaboratorError, FormValidation, FormValidator, Notifier, PhoneVerifier,
};
use admission_core::environment::Clock;
use admission_core::error::{RegistrationError, RejectionReason, StoreError};
use admission_core::store::{AdmissionStore, CancellationOutcome, ReservationClaim};
use admission_core::types::{
    EventId, FormData, IdempotencyKey, InvitationCode, ReferralUsage, ReferralUsageId,
    Registration, RegistrationId, Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Referral codes drawn per submission before a collision is reported.
const REFERRAL_CODE_ATTEMPTS: u32 = 3;

/// A registration attempt as submitted by an attendee.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationRequest {
    /// Event being registered for
    pub event_id: EventId,
    /// Ticket being claimed
    pub ticket_id: TicketId,
    /// Attendee email
    pub email: String,
    /// Authenticated user, if any
    pub user_id: Option<Uuid>,
    /// Phone number for SMS-verified tickets
    pub phone: Option<String>,
    /// Invitation code to redeem
    pub invitation_code: Option<String>,
    /// Referral code of the registration that referred this attendee
    pub referral_code: Option<String>,
    /// Form answers
    pub form_data: FormData,
    /// Client-chosen key that makes resubmission safe
    pub idempotency_key: Option<IdempotencyKey>,
}

impl RegistrationRequest {
    /// Start a request with only the required fields.
    #[must_use]
    pub fn new(event_id: EventId, ticket_id: TicketId, email: impl Into<String>) -> Self {
        Self {
            event_id,
            ticket_id,
            email: email.into(),
            user_id: None,
            phone: None,
            invitation_code: None,
            referral_code: None,
            form_data: FormData::new(),
            idempotency_key: None,
        }
    }

    /// Attach an authenticated user.
    #[must_use]
    pub const fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attach a phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Redeem an invitation code.
    #[must_use]
    pub fn with_invitation_code(mut self, code: impl Into<String>) -> Self {
        self.invitation_code = Some(code.into());
        self
    }

    /// Credit a referrer.
    #[must_use]
    pub fn with_referral_code(mut self, code: impl Into<String>) -> Self {
        self.referral_code = Some(code.into());
        self
    }

    /// Attach form answers.
    #[must_use]
    pub fn with_form_data(mut self, form_data: FormData) -> Self {
        self.form_data = form_data;
        self
    }

    /// Make the submission idempotent.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    fn invitation_code(&self) -> Option<&str> {
        non_blank(self.invitation_code.as_deref())
    }

    fn referral_code(&self) -> Option<&str> {
        non_blank(self.referral_code.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Tuning for [`RegistrationPipeline`].
///
/// # Default Values
///
/// - `request_timeout`: 750ms
/// - `reserve_retry`: 5 retries, 10ms initial, 200ms cap, 50% jitter
/// - `notify_retry`: 5 retries, 500ms initial, 30s cap, 20% jitter
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Upper bound on the admission unit, retries included
    pub request_timeout: Duration,
    /// Retries for transient store failures during admission and cancellation
    pub reserve_retry: RetryPolicy,
    /// Retries for notification delivery
    pub notify_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(750),
            reserve_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(200))
                .multiplier(2.0)
                .jitter(0.5)
                .build(),
            notify_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .multiplier(2.0)
                .jitter(0.2)
                .build(),
        }
    }
}

impl PipelineConfig {
    /// Create a new config builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Clone, Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Set the admission timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the retry policy for store contention.
    #[must_use]
    pub fn reserve_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.reserve_retry = policy;
        self
    }

    /// Set the retry policy for notification delivery.
    #[must_use]
    pub fn notify_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.notify_retry = policy;
        self
    }

    /// Build the [`PipelineConfig`].
    #[must_use]
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

/// Injected dependencies of the pipeline.
#[derive(Clone)]
pub struct PipelineEnvironment {
    /// Transactional store
    pub store: Arc<dyn AdmissionStore>,
    /// Time source for sale windows and code validity
    pub clock: Arc<dyn Clock>,
    /// Form validation
    pub forms: Arc<dyn FormValidator>,
    /// SMS verification lookup
    pub phones: Arc<dyn PhoneVerifier>,
    /// Confirmation delivery
    pub notifier: Arc<dyn Notifier>,
}

/// Entry point for registration attempts and cancellations.
#[derive(Clone)]
pub struct RegistrationPipeline {
    store: Arc<dyn AdmissionStore>,
    clock: Arc<dyn Clock>,
    forms: Arc<dyn FormValidator>,
    phones: Arc<dyn PhoneVerifier>,
    coordinator: ReservationCoordinator,
    dispatcher: NotificationDispatcher,
    config: PipelineConfig,
}

impl RegistrationPipeline {
    /// Assemble a pipeline from its environment.
    #[must_use]
    pub fn new(env: PipelineEnvironment, config: PipelineConfig) -> Self {
        let coordinator = ReservationCoordinator::new(
            Arc::clone(&env.store),
            Arc::clone(&env.clock),
            config.reserve_retry.clone(),
        );
        let dispatcher = NotificationDispatcher::new(env.notifier, config.notify_retry.clone());
        Self {
            store: env.store,
            clock: env.clock,
            forms: env.forms,
            phones: env.phones,
            coordinator,
            dispatcher,
            config,
        }
    }

    /// Pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Submit a registration attempt.
    ///
    /// On success the registration is committed (status `Confirmed`, or
    /// `Pending` for tickets that require approval) and a confirmation is
    /// dispatched in the background. Resubmitting with the same idempotency
    /// key returns the same registration without claiming another slot.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Rejected`] for expected refusals: sold out, not
    ///   on sale, bad or exhausted code, unverified phone, invalid form
    /// - [`RegistrationError::TryAgain`] when contention, an unreachable
    ///   collaborator or the request timeout prevented a decision
    /// - [`RegistrationError::NotFound`] for an unknown ticket
    /// - [`RegistrationError::Fatal`] for malformed requests and unexpected
    ///   store failures
    #[tracing::instrument(
        skip(self, request),
        fields(
            event_id = %request.event_id,
            ticket_id = %request.ticket_id,
            idempotent = request.idempotency_key.is_some(),
        )
    )]
    pub async fn submit_registration(
        &self,
        request: RegistrationRequest,
    ) -> Result<Registration, RegistrationError> {
        let result = match self.run_submission(&request).await {
            Err(error) if error.rejection().is_some() => {
                self.replay_after_rejection(&request, error).await
            }
            other => other,
        };
        match &result {
            Ok(registration) => {
                tracing::info!(
                    registration_id = %registration.id,
                    status = %registration.status,
                    "Registration committed"
                );
            }
            Err(error) => match error.rejection() {
                Some(reason) => {
                    tracing::info!(reason = reason.as_code(), error = %error, "Registration rejected");
                }
                None => tracing::warn!(error = %error, "Registration failed"),
            },
        }
        result
    }

    async fn run_submission(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Registration, RegistrationError> {
        validate_shape(request)?;

        if let Some(existing) = self.replay(request).await? {
            return Ok(existing);
        }

        let ticket = self.load_ticket(request).await?;
        let now = self.clock.now();

        let availability = Availability::calculate(&ticket, now);
        if !availability.is_on_sale {
            return Err(self.reject(RejectionReason::TicketNotOnSale, None));
        }
        if availability.is_sold_out {
            return Err(self.reject(RejectionReason::TicketSoldOut, None));
        }

        self.check_form(request).await?;
        self.check_phone(&ticket, request).await?;
        let code = self.check_invitation_code(&ticket, request, now).await?;
        let referrer = self.check_referral(request).await?;

        let mut registration = Registration {
            id: RegistrationId::new(),
            event_id: ticket.event_id,
            ticket_id: ticket.id,
            email: request.email.trim().to_string(),
            user_id: request.user_id,
            phone: non_blank(request.phone.as_deref()).map(ToString::to_string),
            invitation_code_id: code.as_ref().map(|c| c.id),
            referral_code: generate_referral_code(),
            referred_by: referrer.as_ref().map(|r| r.referral_code.clone()),
            form_data: request.form_data.clone(),
            status: ticket.initial_registration_status(),
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
        };
        let referral = referrer.map(|referrer| ReferralUsage {
            id: ReferralUsageId::new(),
            event_id: ticket.event_id,
            referrer_registration_id: referrer.id,
            registration_id: registration.id,
            used_at: now,
        });

        let mut attempt: u32 = 1;
        let registration = loop {
            let claim = ReservationClaim::new(registration.clone(), referral.clone());
            let reserved = tokio::time::timeout(
                self.config.request_timeout,
                self.coordinator.try_reserve(&claim),
            )
            .await;

            match reserved {
                Err(_elapsed) => {
                    return Err(RegistrationError::TryAgain {
                        detail: format!(
                            "reservation timed out after {}ms",
                            self.config.request_timeout.as_millis()
                        ),
                    });
                }
                Ok(Ok(Reservation::Admitted { registration, .. })) => break registration,
                Ok(Ok(Reservation::Rejected(reason))) => {
                    return Err(RegistrationError::rejected(reason));
                }
                Ok(Err(ReserveError::Store(StoreError::DuplicateIdempotencyKey(key)))) => {
                    // A concurrent submission with the same key won the race.
                    return self.replay(request).await?.ok_or_else(|| {
                        RegistrationError::fatal(format!(
                            "idempotency key {key} collided but no registration holds it"
                        ))
                    });
                }
                Ok(Err(ReserveError::Store(StoreError::DuplicateReferralCode(code))))
                    if attempt < REFERRAL_CODE_ATTEMPTS =>
                {
                    tracing::debug!(%code, attempt, "Referral code collided, drawing another");
                    registration.referral_code = generate_referral_code();
                    attempt += 1;
                }
                Ok(Err(error)) => return Err(error.into()),
            }
        };

        // Fire and forget: delivery never affects the committed registration.
        drop(self.dispatcher.dispatch(registration.clone()));
        Ok(registration)
    }

    /// A rejection may have been caused by a concurrent submission with the
    /// same key taking the last slot; that submission's registration wins.
    async fn replay_after_rejection(
        &self,
        request: &RegistrationRequest,
        rejection: RegistrationError,
    ) -> Result<Registration, RegistrationError> {
        if request.idempotency_key.is_none() {
            return Err(rejection);
        }
        if let Ok(Some(existing)) = self.replay(request).await {
            return Ok(existing);
        }
        Err(rejection)
    }

    async fn replay(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Option<Registration>, RegistrationError> {
        let Some(key) = &request.idempotency_key else {
            return Ok(None);
        };
        let Some(existing) = self.store.find_registration_by_idempotency_key(key).await? else {
            return Ok(None);
        };
        if existing.ticket_id != request.ticket_id || existing.event_id != request.event_id {
            return Err(RegistrationError::fatal(format!(
                "idempotency key {key} was used for a different ticket"
            )));
        }
        tracing::debug!(registration_id = %existing.id, "Replaying idempotent submission");
        Ok(Some(existing))
    }

    async fn load_ticket(&self, request: &RegistrationRequest) -> Result<Ticket, RegistrationError> {
        let ticket = self
            .store
            .load_ticket(request.ticket_id)
            .await?
            .ok_or_else(|| RegistrationError::NotFound {
                entity: "ticket",
                id: request.ticket_id.to_string(),
            })?;
        if ticket.event_id != request.event_id {
            return Err(RegistrationError::fatal(format!(
                "ticket {} does not belong to event {}",
                ticket.id, request.event_id
            )));
        }
        Ok(ticket)
    }

    async fn check_form(&self, request: &RegistrationRequest) -> Result<(), RegistrationError> {
        let validation = self
            .forms
            .validate(request.event_id, &request.form_data)
            .await
            .map_err(|e| collaborator_failure("form validation", e))?;
        match validation {
            FormValidation::Valid => Ok(()),
            invalid @ FormValidation::Invalid(_) => {
                Err(self.reject(RejectionReason::FormInvalid, invalid.summary()))
            }
        }
    }

    async fn check_phone(
        &self,
        ticket: &Ticket,
        request: &RegistrationRequest,
    ) -> Result<(), RegistrationError> {
        if !ticket.require_sms_verification {
            return Ok(());
        }
        let Some(phone) = non_blank(request.phone.as_deref()) else {
            return Err(self.reject(
                RejectionReason::PhoneNotVerified,
                Some("a verified phone number is required".into()),
            ));
        };
        let verified = self
            .phones
            .is_phone_verified(phone)
            .await
            .map_err(|e| collaborator_failure("phone verification", e))?;
        if verified {
            Ok(())
        } else {
            Err(self.reject(RejectionReason::PhoneNotVerified, None))
        }
    }

    async fn check_invitation_code(
        &self,
        ticket: &Ticket,
        request: &RegistrationRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<InvitationCode>, RegistrationError> {
        let Some(code) = request.invitation_code() else {
            if ticket.require_invite_code {
                return Err(self.reject(
                    RejectionReason::CodeInvalid,
                    Some("an invitation code is required".into()),
                ));
            }
            return Ok(None);
        };
        let found = self.store.find_invitation_code(ticket.event_id, code).await?;
        if let Err(rejection) =
            validate_invitation_code(found.as_ref(), CodeScope::Ticket(ticket.id), now)
                .into_result()
        {
            return Err(self.reject(rejection.reason(), Some(rejection.describe().into())));
        }
        Ok(found)
    }

    async fn check_referral(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Option<Registration>, RegistrationError> {
        let Some(code) = request.referral_code() else {
            return Ok(None);
        };
        let referrer = self
            .store
            .find_registration_by_referral_code(request.event_id, code)
            .await?;
        if let Err(rejection) = validate_referral(referrer.as_ref(), request.event_id).into_result()
        {
            return Err(self.reject(
                rejection.reason(),
                Some(format!("referral code {}", rejection.describe())),
            ));
        }
        Ok(referrer)
    }

    #[allow(clippy::unused_self)]
    fn reject(&self, reason: RejectionReason, detail: Option<String>) -> RegistrationError {
        AdmissionMetrics::record_rejected(reason);
        RegistrationError::Rejected { reason, detail }
    }

    /// Cancel a registration, releasing its ticket slot.
    ///
    /// Cancelling an already-cancelled registration is a no-op that returns
    /// it unchanged. Invitation code uses are not restored.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::NotFound`] for an unknown registration
    /// - [`RegistrationError::TryAgain`] when contention outlasted retries
    /// - [`RegistrationError::Fatal`] for unexpected store failures
    #[tracing::instrument(skip(self), fields(registration_id = %registration_id))]
    pub async fn cancel_registration(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Registration, RegistrationError> {
        let outcome = retry_with_predicate(
            self.config.reserve_retry.clone(),
            || self.store.cancel_registration(registration_id),
            StoreError::is_transient,
        )
        .await?;

        match outcome {
            CancellationOutcome::Cancelled {
                registration,
                ticket_sold_count,
            } => {
                AdmissionMetrics::record_cancelled();
                tracing::info!(
                    ticket_id = %registration.ticket_id,
                    sold_count = ticket_sold_count,
                    "Registration cancelled"
                );
                Ok(registration)
            }
            CancellationOutcome::AlreadyCancelled(registration) => {
                tracing::debug!("Registration was already cancelled");
                Ok(registration)
            }
        }
    }

    /// Load a registration by id.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] if it does not exist; store failures
    /// as for [`submit_registration`](Self::submit_registration).
    pub async fn get_registration(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Registration, RegistrationError> {
        self.store
            .get_registration(registration_id)
            .await?
            .ok_or_else(|| RegistrationError::NotFound {
                entity: "registration",
                id: registration_id.to_string(),
            })
    }

    /// Current availability of a ticket. Advisory: it may be stale by the
    /// time a reservation runs.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NotFound`] for an unknown ticket; store failures
    /// as for [`submit_registration`](Self::submit_registration).
    pub async fn availability(&self, ticket_id: TicketId) -> Result<Availability, RegistrationError> {
        let ticket = self
            .store
            .load_ticket(ticket_id)
            .await?
            .ok_or_else(|| RegistrationError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            })?;
        Ok(Availability::calculate(&ticket, self.clock.now()))
    }
}

impl std::fmt::Debug for RegistrationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationPipeline")
            .field("coordinator", &self.coordinator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_shape(request: &RegistrationRequest) -> Result<(), RegistrationError> {
    let email = request.email.trim();
    let well_formed = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if well_formed {
        Ok(())
    } else {
        Err(RegistrationError::fatal("malformed email address"))
    }
}

fn collaborator_failure(step: &str, error: CollaboratorError) -> RegistrationError {
    match error {
        CollaboratorError::Unavailable(detail) => RegistrationError::TryAgain {
            detail: format!("{step} unavailable: {detail}"),
        },
        CollaboratorError::Failed(detail) => {
            RegistrationError::fatal(format!("{step} failed: {detail}"))
        }
    }
}
