//! In-memory admission store for fast, deterministic testing.
//!
//! Mirrors the locking discipline of the Postgres adapter: one async mutex per
//! ticket serializes admission units for that ticket while unrelated tickets
//! proceed in parallel. Writes of a unit are staged and published together, so
//! an injected fault anywhere before publish leaves no trace.
//!
//! Faults can be injected to exercise retry and rollback paths:
//! - [`inject_conflicts`](InMemoryAdmissionStore::inject_conflicts)
//! - [`set_unavailable`](InMemoryAdmissionStore::set_unavailable)
//! - [`fail_after_increment`](InMemoryAdmissionStore::fail_after_increment)
//! - [`set_commit_delay`](InMemoryAdmissionStore::set_commit_delay)

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use admission_core::decision::decide_admission;
use admission_core::error::StoreError;
use admission_core::store::{
    AdmissionStore, CancellationOutcome, ReservationClaim, ReservationOutcome, StoreFuture,
};
use admission_core::types::{
    EventId, IdempotencyKey, InvitationCode, InvitationCodeId, ReferralUsage, Registration,
    RegistrationId, RegistrationStatus, Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    tickets: HashMap<TicketId, Ticket>,
    codes: HashMap<InvitationCodeId, InvitationCode>,
    registrations: HashMap<RegistrationId, Registration>,
    referral_usages: Vec<ReferralUsage>,
}

#[derive(Debug, Default)]
struct Faults {
    conflicts_remaining: usize,
    unavailable: bool,
    failures_after_increment: usize,
    commit_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: RwLock<Tables>,
    ticket_locks: Mutex<HashMap<TicketId, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<Faults>,
    reserve_calls: Mutex<usize>,
}

/// In-memory [`AdmissionStore`] with per-ticket locking and fault injection.
///
/// Cloning is cheap and clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAdmissionStore {
    inner: Arc<Inner>,
}

impl InMemoryAdmissionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding ────────────────────────────────────────────────────────

    /// Insert or replace a ticket.
    pub fn insert_ticket(&self, ticket: Ticket) {
        self.inner.tables.write().unwrap().tickets.insert(ticket.id, ticket);
    }

    /// Insert or replace an invitation code.
    pub fn insert_invitation_code(&self, code: InvitationCode) {
        self.inner.tables.write().unwrap().codes.insert(code.id, code);
    }

    /// Insert a registration row directly, bypassing admission and counters.
    pub fn insert_registration(&self, registration: Registration) {
        self.inner
            .tables
            .write()
            .unwrap()
            .registrations
            .insert(registration.id, registration);
    }

    // ── Inspection ─────────────────────────────────────────────────────

    /// Current ticket row.
    #[must_use]
    pub fn ticket(&self, ticket_id: TicketId) -> Option<Ticket> {
        self.inner.tables.read().unwrap().tickets.get(&ticket_id).cloned()
    }

    /// Current invitation code row.
    #[must_use]
    pub fn invitation_code(&self, code_id: InvitationCodeId) -> Option<InvitationCode> {
        self.inner.tables.read().unwrap().codes.get(&code_id).cloned()
    }

    /// Current registration row.
    #[must_use]
    pub fn registration(&self, registration_id: RegistrationId) -> Option<Registration> {
        self.inner
            .tables
            .read()
            .unwrap()
            .registrations
            .get(&registration_id)
            .cloned()
    }

    /// All registrations for a ticket, in no particular order.
    #[must_use]
    pub fn registrations_for_ticket(&self, ticket_id: TicketId) -> Vec<Registration> {
        self.inner
            .tables
            .read()
            .unwrap()
            .registrations
            .values()
            .filter(|r| r.ticket_id == ticket_id)
            .cloned()
            .collect()
    }

    /// Number of registrations on a ticket whose status holds a slot.
    #[must_use]
    pub fn slot_holders(&self, ticket_id: TicketId) -> usize {
        self.registrations_for_ticket(ticket_id)
            .iter()
            .filter(|r| r.status.holds_slot())
            .count()
    }

    /// All referral usage rows.
    #[must_use]
    pub fn referral_usages(&self) -> Vec<ReferralUsage> {
        self.inner.tables.read().unwrap().referral_usages.clone()
    }

    /// How many admission units were started, including failed ones.
    #[must_use]
    pub fn reserve_calls(&self) -> usize {
        *self.inner.reserve_calls.lock().unwrap()
    }

    // ── Fault injection ────────────────────────────────────────────────

    /// Make the next `count` admission or cancellation units fail with
    /// [`StoreError::Conflict`]. Reads are unaffected.
    pub fn inject_conflicts(&self, count: usize) {
        self.inner.faults.lock().unwrap().conflicts_remaining = count;
    }

    /// Make every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unwrap().unavailable = unavailable;
    }

    /// Make the next `count` admitting units fail after applying both
    /// increments but before inserting the registration row.
    pub fn fail_after_increment(&self, count: usize) {
        self.inner.faults.lock().unwrap().failures_after_increment = count;
    }

    /// Sleep for `delay` while holding the ticket lock, before publishing.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        self.inner.faults.lock().unwrap().commit_delay = delay;
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.faults.lock().unwrap().unavailable {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }

    // Conflicts only arise in locking units, never in plain reads.
    fn check_transient_faults(&self) -> Result<(), StoreError> {
        self.check_available()?;
        let mut faults = self.inner.faults.lock().unwrap();
        if faults.conflicts_remaining > 0 {
            faults.conflicts_remaining -= 1;
            return Err(StoreError::Conflict("injected serialization failure".into()));
        }
        Ok(())
    }

    fn take_failure_after_increment(&self) -> bool {
        let mut faults = self.inner.faults.lock().unwrap();
        if faults.failures_after_increment > 0 {
            faults.failures_after_increment -= 1;
            true
        } else {
            false
        }
    }

    fn commit_delay(&self) -> Option<Duration> {
        self.inner.faults.lock().unwrap().commit_delay
    }

    fn ticket_lock(&self, ticket_id: TicketId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.inner
                .ticket_locks
                .lock()
                .unwrap()
                .entry(ticket_id)
                .or_default(),
        )
    }

    async fn run_reserve(
        &self,
        claim: &ReservationClaim,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, StoreError> {
        *self.inner.reserve_calls.lock().unwrap() += 1;
        self.check_transient_faults()?;

        let ticket_id = claim.ticket_id();
        let lock = self.ticket_lock(ticket_id);
        let _guard = lock.lock().await;

        // Let waiting tasks pile up on the lock between read and write.
        tokio::task::yield_now().await;

        let (mut ticket, mut code) = {
            let tables = self.inner.tables.read().unwrap();
            let ticket = tables
                .tickets
                .get(&ticket_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    entity: "ticket",
                    id: ticket_id.to_string(),
                })?;
            // A committed duplicate must be reported before its increment
            // can turn this attempt into a rejection.
            check_unique(&tables, claim.registration())?;
            let code = claim
                .invitation_code_id()
                .and_then(|id| tables.codes.get(&id).cloned());
            (ticket, code)
        };

        let counters = match decide_admission(
            &ticket,
            code.as_ref(),
            claim.invitation_code_id().is_some(),
            now,
        ) {
            Ok(counters) => counters,
            Err(reason) => return Ok(ReservationOutcome::Rejected(reason)),
        };

        // Stage both increments.
        ticket.sold_count = counters.ticket_sold_count;
        if let (Some(code), Some(used)) = (code.as_mut(), counters.code_used_count) {
            code.used_count = used;
        }

        if self.take_failure_after_increment() {
            tracing::debug!(%ticket_id, "Injected fault between increment and insert");
            return Err(StoreError::Database(
                "injected fault after counter increment".into(),
            ));
        }

        if let Some(delay) = self.commit_delay() {
            tokio::time::sleep(delay).await;
        }

        let registration = claim.registration().clone();
        let mut tables = self.inner.tables.write().unwrap();
        // Registrations on other tickets are not serialized by this lock.
        check_unique(&tables, &registration)?;

        tables.tickets.insert(ticket.id, ticket);
        if let Some(code) = code {
            tables.codes.insert(code.id, code);
        }
        tables
            .registrations
            .insert(registration.id, registration.clone());
        if let Some(referral) = claim.referral() {
            tables.referral_usages.push(referral.clone());
        }

        Ok(ReservationOutcome::Admitted {
            registration,
            counters,
        })
    }

    async fn run_cancel(
        &self,
        registration_id: RegistrationId,
    ) -> Result<CancellationOutcome, StoreError> {
        self.check_transient_faults()?;

        let not_found = || StoreError::NotFound {
            entity: "registration",
            id: registration_id.to_string(),
        };
        let ticket_id = self
            .registration(registration_id)
            .map(|r| r.ticket_id)
            .ok_or_else(not_found)?;

        let lock = self.ticket_lock(ticket_id);
        let _guard = lock.lock().await;

        let mut tables = self.inner.tables.write().unwrap();
        let mut registration = tables
            .registrations
            .get(&registration_id)
            .cloned()
            .ok_or_else(not_found)?;
        if registration.status == RegistrationStatus::Cancelled {
            return Ok(CancellationOutcome::AlreadyCancelled(registration));
        }

        let ticket = tables
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            })?;
        ticket.sold_count = ticket.sold_count.saturating_sub(1);
        let ticket_sold_count = ticket.sold_count;

        registration.status = RegistrationStatus::Cancelled;
        tables
            .registrations
            .insert(registration_id, registration.clone());

        Ok(CancellationOutcome::Cancelled {
            registration,
            ticket_sold_count,
        })
    }
}

impl AdmissionStore for InMemoryAdmissionStore {
    fn load_ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.ticket(ticket_id))
        })
    }

    fn find_invitation_code<'a>(
        &'a self,
        event_id: EventId,
        code: &'a str,
    ) -> StoreFuture<'a, Option<InvitationCode>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .inner
                .tables
                .read()
                .unwrap()
                .codes
                .values()
                .find(|c| c.event_id == event_id && c.code == code)
                .cloned())
        })
    }

    fn find_registration_by_referral_code<'a>(
        &'a self,
        event_id: EventId,
        referral_code: &'a str,
    ) -> StoreFuture<'a, Option<Registration>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .inner
                .tables
                .read()
                .unwrap()
                .registrations
                .values()
                .find(|r| r.event_id == event_id && r.referral_code == referral_code)
                .cloned())
        })
    }

    fn find_registration_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Registration>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .inner
                .tables
                .read()
                .unwrap()
                .registrations
                .values()
                .find(|r| r.idempotency_key.as_ref() == Some(key))
                .cloned())
        })
    }

    fn get_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, Option<Registration>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.registration(registration_id))
        })
    }

    fn reserve<'a>(
        &'a self,
        claim: &'a ReservationClaim,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ReservationOutcome> {
        Box::pin(self.run_reserve(claim, now))
    }

    fn cancel_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, CancellationOutcome> {
        Box::pin(self.run_cancel(registration_id))
    }
}


/// Enforce the unique idempotency key and per-event referral code.
fn check_unique(tables: &Tables, registration: &Registration) -> Result<(), StoreError> {
    if let Some(key) = &registration.idempotency_key {
        let taken = tables
            .registrations
            .values()
            .any(|r| r.idempotency_key.as_ref() == Some(key));
        if taken {
            return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
        }
    }
    let code_taken = tables.registrations.values().any(|r| {
        r.event_id == registration.event_id && r.referral_code == registration.referral_code
    });
    if code_taken {
        return Err(StoreError::DuplicateReferralCode(
            registration.referral_code.clone(),
        ));
    }
    Ok(())
}
