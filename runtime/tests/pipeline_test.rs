//! Integration tests for the registration commit pipeline.
//!
//! Each test drives `RegistrationPipeline::submit_registration` (or
//! `cancel_registration`) against the in-memory store and asserts both the
//! outward result and the counters left behind.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use admission_core::error::{ErrorCategory, RegistrationError, RejectionReason};
use admission_core::store::{
    AdmissionStore, CancellationOutcome, ReservationClaim, ReservationOutcome, StoreFuture,
};
use admission_core::types::{
    EventId, FormData, IdempotencyKey, InvitationCode, Registration, RegistrationId,
    RegistrationStatus, Ticket, TicketId,
};
use admission_runtime::{
    PipelineConfig, PipelineEnvironment, RegistrationPipeline, RegistrationRequest, RetryPolicy,
};
use admission_testing::fixtures::{InvitationCodeBuilder, TicketBuilder, existing_registration};
use admission_testing::{
    InMemoryAdmissionStore, MockPhoneVerifier, RecordingNotifier, StaticFormValidator, test_clock,
    test_time,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Harness {
    store: InMemoryAdmissionStore,
    phones: MockPhoneVerifier,
    notifier: RecordingNotifier,
    pipeline: RegistrationPipeline,
}

fn fast_config() -> PipelineConfig {
    PipelineConfig::builder()
        .request_timeout(Duration::from_secs(5))
        .reserve_retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(4))
                .jitter(0.5)
                .build(),
        )
        .notify_retry(
            RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(1))
                .build(),
        )
        .build()
}

fn harness_with(forms: StaticFormValidator, phones: MockPhoneVerifier, config: PipelineConfig) -> Harness {
    admission_testing::init_test_tracing();
    let store = InMemoryAdmissionStore::new();
    let notifier = RecordingNotifier::new();
    let pipeline = RegistrationPipeline::new(
        PipelineEnvironment {
            store: Arc::new(store.clone()),
            clock: Arc::new(test_clock()),
            forms: Arc::new(forms),
            phones: Arc::new(phones.clone()),
            notifier: Arc::new(notifier.clone()),
        },
        config,
    );
    Harness {
        store,
        phones,
        notifier,
        pipeline,
    }
}

fn harness() -> Harness {
    harness_with(StaticFormValidator::new(), MockPhoneVerifier::new(), fast_config())
}

impl Harness {
    fn seed(&self, ticket: Ticket) -> Ticket {
        self.store.insert_ticket(ticket.clone());
        ticket
    }

    fn sold(&self, ticket: &Ticket) -> u32 {
        self.store.ticket(ticket.id).unwrap().sold_count
    }
}

fn request(ticket: &Ticket, email: &str) -> RegistrationRequest {
    RegistrationRequest::new(ticket.event_id, ticket.id, email)
}

fn rejection(result: Result<Registration, RegistrationError>) -> RejectionReason {
    match result {
        Err(error) => error
            .rejection()
            .unwrap_or_else(|| panic!("expected a rejection, got {error:?}")),
        Ok(registration) => panic!("expected a rejection, got {registration:?}"),
    }
}

fn key(value: &str) -> IdempotencyKey {
    IdempotencyKey::parse(format!("{value:0>16}")).unwrap()
}

/// Store that hands out a taken referral code for the first `collisions`
/// admission units by registering it just before delegating.
struct CollidingReferralStore {
    inner: InMemoryAdmissionStore,
    collisions: Mutex<usize>,
}

impl CollidingReferralStore {
    fn new(inner: InMemoryAdmissionStore, collisions: usize) -> Self {
        Self {
            inner,
            collisions: Mutex::new(collisions),
        }
    }
}

impl AdmissionStore for CollidingReferralStore {
    fn load_ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        self.inner.load_ticket(ticket_id)
    }

    fn find_invitation_code<'a>(
        &'a self,
        event_id: EventId,
        code: &'a str,
    ) -> StoreFuture<'a, Option<InvitationCode>> {
        self.inner.find_invitation_code(event_id, code)
    }

    fn find_registration_by_referral_code<'a>(
        &'a self,
        event_id: EventId,
        referral_code: &'a str,
    ) -> StoreFuture<'a, Option<Registration>> {
        self.inner.find_registration_by_referral_code(event_id, referral_code)
    }

    fn find_registration_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Registration>> {
        self.inner.find_registration_by_idempotency_key(key)
    }

    fn get_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, Option<Registration>> {
        self.inner.get_registration(registration_id)
    }

    fn reserve<'a>(
        &'a self,
        claim: &'a ReservationClaim,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ReservationOutcome> {
        let collide = {
            let mut remaining = self.collisions.lock().unwrap();
            let collide = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            collide
        };
        if collide {
            let wanted = claim.registration();
            let mut taken = existing_registration(wanted.event_id, wanted.ticket_id, "taken@example.com");
            taken.referral_code.clone_from(&wanted.referral_code);
            self.inner.insert_registration(taken);
        }
        self.inner.reserve(claim, now)
    }

    fn cancel_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, CancellationOutcome> {
        self.inner.cancel_registration(registration_id)
    }
}

fn colliding_pipeline(store: &InMemoryAdmissionStore, collisions: usize) -> RegistrationPipeline {
    admission_testing::init_test_tracing();
    RegistrationPipeline::new(
        PipelineEnvironment {
            store: Arc::new(CollidingReferralStore::new(store.clone(), collisions)),
            clock: Arc::new(test_clock()),
            forms: Arc::new(StaticFormValidator::new()),
            phones: Arc::new(MockPhoneVerifier::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        },
        fast_config(),
    )
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn admits_confirms_and_notifies() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(3).build());

    let registration = assert_ok!(h.pipeline.submit_registration(request(&ticket, "ada@example.com")).await);

    assert_eq!(registration.status, RegistrationStatus::Confirmed);
    assert_eq!(registration.referral_code.len(), 8);
    assert_eq!(registration.created_at, test_time());
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(h.store.registration(registration.id), Some(registration.clone()));
    assert!(h.notifier.wait_for_deliveries(1, Duration::from_secs(2)).await);
    assert_eq!(h.notifier.delivered(), vec![registration.id]);
}

#[tokio::test]
async fn approval_tickets_start_pending_and_hold_a_slot() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(1).requires_approval().build());

    let registration = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap();

    assert_eq!(registration.status, RegistrationStatus::Pending);
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(
        rejection(h.pipeline.submit_registration(request(&ticket, "bob@example.com")).await),
        RejectionReason::TicketSoldOut
    );
}

#[tokio::test]
async fn sold_out_is_a_conflict_rejection() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(2).sold(2).build());

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap_err();

    assert_eq!(error.rejection(), Some(RejectionReason::TicketSoldOut));
    assert_eq!(error.http_status(), 409);
    assert_eq!(h.sold(&ticket), 2);
    assert_eq!(h.store.reserve_calls(), 0);
}

#[tokio::test]
async fn ended_sale_is_not_on_sale() {
    let h = harness();
    let ticket = h.seed(
        TicketBuilder::new()
            .sale_window(None, Some(test_time() - ChronoDuration::hours(1)))
            .build(),
    );

    assert_eq!(
        rejection(h.pipeline.submit_registration(request(&ticket, "ada@example.com")).await),
        RejectionReason::TicketNotOnSale
    );
    assert_eq!(h.sold(&ticket), 0);
}

#[tokio::test]
async fn sale_not_started_and_inactive_tickets_are_not_on_sale() {
    let h = harness();
    let upcoming = h.seed(
        TicketBuilder::new()
            .sale_window(Some(test_time() + ChronoDuration::days(1)), None)
            .build(),
    );
    let inactive = h.seed(TicketBuilder::new().inactive().build());

    for ticket in [&upcoming, &inactive] {
        assert_eq!(
            rejection(h.pipeline.submit_registration(request(ticket, "ada@example.com")).await),
            RejectionReason::TicketNotOnSale
        );
    }
}

#[tokio::test]
async fn unknown_ticket_is_not_found() {
    let h = harness();
    let ticket = TicketBuilder::new().build();

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(error, RegistrationError::NotFound { entity: "ticket", .. }));
    assert_eq!(error.category(), ErrorCategory::Fatal);
}

#[tokio::test]
async fn ticket_from_another_event_is_fatal() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().build());

    let error = h
        .pipeline
        .submit_registration(RegistrationRequest::new(EventId::new(), ticket.id, "ada@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(error, RegistrationError::Fatal { .. }));
    assert_eq!(h.sold(&ticket), 0);
}

// ============================================================================
// Invitation Codes
// ============================================================================

#[tokio::test]
async fn redeeming_a_code_moves_both_counters() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(10).invite_only().build());
    let code = InvitationCodeBuilder::for_ticket(&ticket, "VIP2025").limit(3).build();
    h.store.insert_invitation_code(code.clone());

    let registration = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com").with_invitation_code("VIP2025"))
        .await
        .unwrap();

    assert_eq!(registration.invitation_code_id, Some(code.id));
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(h.store.invitation_code(code.id).unwrap().used_count, 1);
}

#[tokio::test]
async fn exhausted_code_leaves_sold_count_untouched() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(10).invite_only().build());
    let code = InvitationCodeBuilder::for_ticket(&ticket, "FRIENDS").limit(2).used(2).build();
    h.store.insert_invitation_code(code.clone());

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com").with_invitation_code("FRIENDS"))
        .await
        .unwrap_err();

    assert_eq!(error.rejection(), Some(RejectionReason::CodeExhausted));
    assert_eq!(error.http_status(), 409);
    assert_eq!(h.sold(&ticket), 0);
    assert_eq!(h.store.invitation_code(code.id).unwrap().used_count, 2);
}

#[tokio::test]
async fn invite_only_ticket_requires_a_valid_code() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().invite_only().build());
    let other = h.seed(TicketBuilder::new().event(ticket.event_id).build());
    h.store
        .insert_invitation_code(InvitationCodeBuilder::for_ticket(&other, "OTHER").build());
    h.store.insert_invitation_code(
        InvitationCodeBuilder::for_ticket(&ticket, "OLD")
            .valid_between(None, Some(test_time() - ChronoDuration::minutes(1)))
            .build(),
    );
    h.store
        .insert_invitation_code(InvitationCodeBuilder::for_ticket(&ticket, "OFF").inactive().build());

    let attempts = [
        request(&ticket, "a@example.com"),
        request(&ticket, "b@example.com").with_invitation_code("   "),
        request(&ticket, "c@example.com").with_invitation_code("NOPE"),
        request(&ticket, "d@example.com").with_invitation_code("OTHER"),
        request(&ticket, "e@example.com").with_invitation_code("OLD"),
        request(&ticket, "f@example.com").with_invitation_code("OFF"),
    ];
    for attempt in attempts {
        assert_eq!(
            rejection(h.pipeline.submit_registration(attempt).await),
            RejectionReason::CodeInvalid
        );
    }
    assert_eq!(h.sold(&ticket), 0);
    assert_eq!(h.store.reserve_calls(), 0);
}

// ============================================================================
// Form and Phone Verification
// ============================================================================

#[tokio::test]
async fn missing_required_field_is_form_invalid() {
    let ticket = TicketBuilder::new().build();
    let forms = StaticFormValidator::new().require(ticket.event_id, &["company", "title"]);
    let h = harness_with(forms, MockPhoneVerifier::new(), fast_config());
    h.seed(ticket.clone());

    let error = h
        .pipeline
        .submit_registration(
            request(&ticket, "ada@example.com").with_form_data(FormData::new().with("company", "Acme")),
        )
        .await
        .unwrap_err();

    assert_eq!(error.rejection(), Some(RejectionReason::FormInvalid));
    assert!(error.to_string().contains("title"));
    assert_eq!(h.store.reserve_calls(), 0);

    let ok = request(&ticket, "ada@example.com")
        .with_form_data(FormData::new().with("company", "Acme").with("title", "CTO"));
    assert!(h.pipeline.submit_registration(ok).await.is_ok());
}

#[tokio::test]
async fn sms_tickets_require_a_verified_phone() {
    let phones = MockPhoneVerifier::new().with_verified("+15550001");
    let h = harness_with(StaticFormValidator::new(), phones, fast_config());
    let ticket = h.seed(TicketBuilder::new().sms_verified().build());

    assert_eq!(
        rejection(h.pipeline.submit_registration(request(&ticket, "a@example.com")).await),
        RejectionReason::PhoneNotVerified
    );
    assert_eq!(
        rejection(
            h.pipeline
                .submit_registration(request(&ticket, "b@example.com").with_phone("+15559999"))
                .await
        ),
        RejectionReason::PhoneNotVerified
    );
    assert_eq!(h.sold(&ticket), 0);

    let registration = h
        .pipeline
        .submit_registration(request(&ticket, "c@example.com").with_phone("+15550001"))
        .await
        .unwrap();
    assert_eq!(registration.phone.as_deref(), Some("+15550001"));
    assert_eq!(h.sold(&ticket), 1);
}

#[tokio::test]
async fn sms_provider_outage_is_transient() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().sms_verified().build());
    h.phones.set_unavailable(true);

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "a@example.com").with_phone("+15550001"))
        .await
        .unwrap_err();

    assert_eq!(error.category(), ErrorCategory::Transient);
    assert_eq!(h.phones.lookups(), 1);
    assert_eq!(h.sold(&ticket), 0);
}

#[tokio::test]
async fn phone_is_not_checked_when_not_required() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().build());

    h.pipeline
        .submit_registration(request(&ticket, "a@example.com").with_phone("+15559999"))
        .await
        .unwrap();

    assert_eq!(h.phones.lookups(), 0);
}

// ============================================================================
// Referrals
// ============================================================================

#[tokio::test]
async fn referral_is_recorded_with_the_registration() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().build());
    let referrer = existing_registration(ticket.event_id, ticket.id, "referrer@example.com");
    h.store.insert_registration(referrer.clone());

    let registration = h
        .pipeline
        .submit_registration(request(&ticket, "friend@example.com").with_referral_code(&referrer.referral_code))
        .await
        .unwrap();

    assert_eq!(registration.referred_by.as_deref(), Some(referrer.referral_code.as_str()));
    let usages = h.store.referral_usages();
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].referrer_registration_id, referrer.id);
    assert_eq!(usages[0].registration_id, registration.id);
}

#[tokio::test]
async fn unusable_referral_codes_are_invalid() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().build());
    let mut cancelled = existing_registration(ticket.event_id, ticket.id, "gone@example.com");
    cancelled.status = RegistrationStatus::Cancelled;
    h.store.insert_registration(cancelled.clone());
    let foreign = existing_registration(EventId::new(), ticket.id, "elsewhere@example.com");
    h.store.insert_registration(foreign.clone());

    for code in ["ZZZZZZZZ", cancelled.referral_code.as_str(), foreign.referral_code.as_str()] {
        assert_eq!(
            rejection(
                h.pipeline
                    .submit_registration(request(&ticket, "a@example.com").with_referral_code(code))
                    .await
            ),
            RejectionReason::CodeInvalid
        );
    }
    assert!(h.store.referral_usages().is_empty());
    assert_eq!(h.sold(&ticket), 0);
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn resubmission_returns_the_same_registration() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(5).build());
    let submit = request(&ticket, "ada@example.com").with_idempotency_key(key("checkout-1"));

    let first = h.pipeline.submit_registration(submit.clone()).await.unwrap();
    let second = h.pipeline.submit_registration(submit).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(h.store.reserve_calls(), 1);
}

#[tokio::test]
async fn concurrent_resubmissions_claim_one_slot() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(10).build());
    let submit = request(&ticket, "ada@example.com").with_idempotency_key(key("double-click"));

    let results = futures::future::join_all(
        (0..10).map(|_| h.pipeline.submit_registration(submit.clone())),
    )
    .await;

    let ids: Vec<RegistrationId> = results.into_iter().map(|r| r.unwrap().id).collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(h.store.registrations_for_ticket(ticket.id).len(), 1);
}

#[tokio::test]
async fn resubmissions_racing_for_the_last_slot_share_the_winner() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(1).build());
    let submit = request(&ticket, "ada@example.com").with_idempotency_key(key("last-slot"));

    let (first, second) = futures::join!(
        h.pipeline.submit_registration(submit.clone()),
        h.pipeline.submit_registration(submit.clone()),
    );

    assert_eq!(first.unwrap().id, second.unwrap().id);
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(h.store.registrations_for_ticket(ticket.id).len(), 1);
}

#[tokio::test]
async fn resubmissions_racing_for_the_last_code_use_share_the_winner() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(10).invite_only().build());
    let code = InvitationCodeBuilder::for_ticket(&ticket, "SOLO").limit(1).build();
    h.store.insert_invitation_code(code.clone());
    let submit = request(&ticket, "ada@example.com")
        .with_invitation_code("SOLO")
        .with_idempotency_key(key("last-code"));

    let (first, second) = futures::join!(
        h.pipeline.submit_registration(submit.clone()),
        h.pipeline.submit_registration(submit.clone()),
    );

    assert_eq!(first.unwrap().id, second.unwrap().id);
    assert_eq!(h.sold(&ticket), 1);
    assert_eq!(h.store.invitation_code(code.id).unwrap().used_count, 1);
}

#[tokio::test]
async fn another_key_for_a_taken_last_slot_is_still_sold_out() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(1).build());
    h.pipeline
        .submit_registration(request(&ticket, "ada@example.com").with_idempotency_key(key("first")))
        .await
        .unwrap();

    let result = h
        .pipeline
        .submit_registration(request(&ticket, "grace@example.com").with_idempotency_key(key("second")))
        .await;

    assert_eq!(rejection(result), RejectionReason::TicketSoldOut);
}

#[tokio::test]
async fn replayed_submission_is_not_notified_again() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(5).build());
    let submit = request(&ticket, "ada@example.com").with_idempotency_key(key("notify-once"));

    let first = h.pipeline.submit_registration(submit.clone()).await.unwrap();
    assert!(h.notifier.wait_for_deliveries(1, Duration::from_secs(2)).await);
    let replayed = h.pipeline.submit_registration(submit).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(replayed.id, first.id);
    assert_eq!(h.notifier.attempts(), 1);
    assert_eq!(h.notifier.delivered(), vec![first.id]);
}

#[tokio::test]
async fn key_reused_for_another_ticket_is_fatal() {
    let h = harness();
    let first = h.seed(TicketBuilder::new().build());
    let second = h.seed(TicketBuilder::new().event(first.event_id).build());

    h.pipeline
        .submit_registration(request(&first, "ada@example.com").with_idempotency_key(key("shared")))
        .await
        .unwrap();
    let error = h
        .pipeline
        .submit_registration(request(&second, "ada@example.com").with_idempotency_key(key("shared")))
        .await
        .unwrap_err();

    assert!(matches!(error, RegistrationError::Fatal { .. }));
    assert_eq!(h.sold(&second), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_releases_the_slot_but_not_the_code() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(2).build());
    let code = InvitationCodeBuilder::for_ticket(&ticket, "ONCE").limit(1).build();
    h.store.insert_invitation_code(code.clone());

    let registration = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com").with_invitation_code("ONCE"))
        .await
        .unwrap();
    let cancelled = h.pipeline.cancel_registration(registration.id).await.unwrap();

    assert_eq!(cancelled.status, RegistrationStatus::Cancelled);
    assert_eq!(h.sold(&ticket), 0);
    assert_eq!(h.store.invitation_code(code.id).unwrap().used_count, 1);

    // The slot is reusable, the code use is not.
    assert!(h.pipeline.submit_registration(request(&ticket, "bob@example.com")).await.is_ok());
    assert_eq!(
        rejection(
            h.pipeline
                .submit_registration(request(&ticket, "eve@example.com").with_invitation_code("ONCE"))
                .await
        ),
        RejectionReason::CodeExhausted
    );
}

#[tokio::test]
async fn cancelling_twice_is_a_no_op() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(3).build());
    let registration = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap();

    h.pipeline.cancel_registration(registration.id).await.unwrap();
    let again = h.pipeline.cancel_registration(registration.id).await.unwrap();

    assert_eq!(again.status, RegistrationStatus::Cancelled);
    assert_eq!(h.sold(&ticket), 0);
}

#[tokio::test]
async fn cancelling_unknown_registration_is_not_found() {
    let h = harness();

    let error = h.pipeline.cancel_registration(RegistrationId::new()).await.unwrap_err();

    assert_eq!(error.http_status(), 404);
}

// ============================================================================
// Transient Failures
// ============================================================================

#[tokio::test]
async fn contention_outlasting_retries_is_try_again_not_sold_out() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(5).build());
    h.store.inject_conflicts(100);

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap_err();

    assert_eq!(error.category(), ErrorCategory::Transient);
    assert_eq!(error.http_status(), 503);
    assert_ne!(error.rejection(), Some(RejectionReason::TicketSoldOut));
    assert_eq!(h.store.reserve_calls(), 4);
    assert_eq!(h.sold(&ticket), 0);
}

#[tokio::test]
async fn brief_contention_is_absorbed_by_retries() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(5).build());
    h.store.inject_conflicts(2);

    let registration = h.pipeline.submit_registration(request(&ticket, "ada@example.com")).await;

    assert!(registration.is_ok());
    assert_eq!(h.store.reserve_calls(), 3);
    assert_eq!(h.sold(&ticket), 1);
}

#[tokio::test]
async fn slow_commit_times_out_without_writing() {
    let config = PipelineConfig::builder()
        .request_timeout(Duration::from_millis(20))
        .reserve_retry(RetryPolicy::no_retries())
        .build();
    let h = harness_with(StaticFormValidator::new(), MockPhoneVerifier::new(), config);
    let ticket = h.seed(TicketBuilder::new().quantity(5).build());
    h.store.set_commit_delay(Some(Duration::from_millis(500)));

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(error, RegistrationError::TryAgain { .. }));
    assert_eq!(h.sold(&ticket), 0);
    assert!(h.store.registrations_for_ticket(ticket.id).is_empty());
}

#[tokio::test]
async fn colliding_referral_code_is_redrawn() {
    let store = InMemoryAdmissionStore::new();
    let ticket = TicketBuilder::new().quantity(5).build();
    store.insert_ticket(ticket.clone());
    let pipeline = colliding_pipeline(&store, 1);

    let registration = pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap();

    let holders = store.registrations_for_ticket(ticket.id);
    let taken = holders
        .iter()
        .find(|r| r.email == "taken@example.com")
        .unwrap();
    assert_ne!(registration.referral_code, taken.referral_code);
    assert_eq!(store.reserve_calls(), 2);
    assert_eq!(store.ticket(ticket.id).unwrap().sold_count, 1);
}

#[tokio::test]
async fn persistent_referral_collisions_are_fatal_and_write_nothing() {
    let store = InMemoryAdmissionStore::new();
    let ticket = TicketBuilder::new().quantity(5).build();
    store.insert_ticket(ticket.clone());
    let pipeline = colliding_pipeline(&store, usize::MAX);

    let error = pipeline
        .submit_registration(request(&ticket, "ada@example.com"))
        .await
        .unwrap_err();

    assert_eq!(error.category(), ErrorCategory::Fatal);
    assert_eq!(store.reserve_calls(), 3);
    assert_eq!(store.ticket(ticket.id).unwrap().sold_count, 0);
    assert!(
        store
            .registrations_for_ticket(ticket.id)
            .iter()
            .all(|r| r.email == "taken@example.com")
    );
}

#[tokio::test]
async fn malformed_email_is_fatal_and_writes_nothing() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().build());

    let error = h
        .pipeline
        .submit_registration(request(&ticket, "not-an-email"))
        .await
        .unwrap_err();

    assert_eq!(error.category(), ErrorCategory::Fatal);
    assert_eq!(h.store.reserve_calls(), 0);
}

#[tokio::test]
async fn availability_reflects_committed_registrations() {
    let h = harness();
    let ticket = h.seed(TicketBuilder::new().quantity(2).build());

    h.pipeline.submit_registration(request(&ticket, "a@example.com")).await.unwrap();
    let availability = h.pipeline.availability(ticket.id).await.unwrap();

    assert_eq!(availability.available, 1);
    assert!(availability.is_on_sale);
    assert!(!availability.is_sold_out);
}
