//! Transactional data-access interface for admission control.
//!
//! The store is the authoritative serialization point: correctness must hold
//! across processes and server instances, so no in-process lock may stand in
//! for it. An implementation must provide:
//!
//! - a row-scoped lock on the ticket (and then on the code, always in that
//!   order) for the duration of one admission unit
//! - conditional increments (`x = x + 1 WHERE x < limit`) on `sold_count` and
//!   `used_count`
//! - one commit covering both increments, the registration row and the
//!   optional referral usage row
//!
//! # Implementations
//!
//! - `PostgresAdmissionStore` (in `admission-postgres`): production
//! - `InMemoryAdmissionStore` (in `admission-testing`): deterministic tests
//!   with fault injection
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` rather than using `async fn` so the
//! store can be shared as `Arc<dyn AdmissionStore>` across the coordinator,
//! the pipeline and spawned tasks.

use crate::decision::AdmissionCounters;
use crate::error::{RejectionReason, StoreError};
use crate::types::{
    EventId, IdempotencyKey, InvitationCode, InvitationCodeId, ReferralUsage, Registration,
    RegistrationId, Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Everything one admission unit must write if it admits.
///
/// The ticket and code being claimed are read from the registration itself,
/// so a claim cannot reserve one ticket while recording another.
#[derive(Clone, Debug)]
pub struct ReservationClaim {
    registration: Registration,
    referral: Option<ReferralUsage>,
}

impl ReservationClaim {
    /// Claim a slot for `registration`, optionally recording a referral.
    #[must_use]
    pub const fn new(registration: Registration, referral: Option<ReferralUsage>) -> Self {
        Self {
            registration,
            referral,
        }
    }

    /// Ticket whose `sold_count` is claimed.
    #[must_use]
    pub const fn ticket_id(&self) -> TicketId {
        self.registration.ticket_id
    }

    /// Invitation code whose `used_count` is claimed, if any.
    #[must_use]
    pub const fn invitation_code_id(&self) -> Option<InvitationCodeId> {
        self.registration.invitation_code_id
    }

    /// Registration row to insert on admission.
    #[must_use]
    pub const fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Referral usage row to insert on admission.
    #[must_use]
    pub const fn referral(&self) -> Option<&ReferralUsage> {
        self.referral.as_ref()
    }
}

/// Result of one admission unit.
#[derive(Clone, Debug, PartialEq)]
pub enum ReservationOutcome {
    /// Both counters moved and all rows were committed.
    Admitted {
        /// The committed registration
        registration: Registration,
        /// Counter values after the increments
        counters: AdmissionCounters,
    },
    /// Nothing was written.
    Rejected(RejectionReason),
}

/// Result of a cancellation unit.
#[derive(Clone, Debug, PartialEq)]
pub enum CancellationOutcome {
    /// The registration released its slot.
    Cancelled {
        /// The registration with status `Cancelled`
        registration: Registration,
        /// Ticket `sold_count` after the decrement
        ticket_sold_count: u32,
    },
    /// The registration had already been cancelled; nothing changed.
    AlreadyCancelled(Registration),
}

/// Transactional store behind admission control.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// request handler.
pub trait AdmissionStore: Send + Sync {
    /// Load a ticket snapshot (no lock held afterwards).
    fn load_ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>>;

    /// Find an invitation code by its string within an event.
    fn find_invitation_code<'a>(
        &'a self,
        event_id: EventId,
        code: &'a str,
    ) -> StoreFuture<'a, Option<InvitationCode>>;

    /// Find the registration that owns a referral code within an event.
    fn find_registration_by_referral_code<'a>(
        &'a self,
        event_id: EventId,
        referral_code: &'a str,
    ) -> StoreFuture<'a, Option<Registration>>;

    /// Find the registration created by a submission with this key.
    fn find_registration_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Registration>>;

    /// Load a registration by id.
    fn get_registration(&self, registration_id: RegistrationId)
    -> StoreFuture<'_, Option<Registration>>;

    /// Run one admission unit.
    ///
    /// Locks the ticket row, then the code row, evaluates
    /// [`decide_admission`](crate::decision::decide_admission) against the
    /// locked values at `now`, and if admitted applies both conditional
    /// increments and inserts the claim's rows in a single commit.
    ///
    /// # Errors
    ///
    /// - `Conflict` / `Unavailable`: transient, nothing written
    /// - `NotFound`: the ticket does not exist
    /// - `DuplicateIdempotencyKey`: another unit committed with the same key;
    ///   nothing written. Checked under the ticket lock before the decision,
    ///   so a duplicate never surfaces as a rejection
    /// - `DuplicateReferralCode`: the registration's referral code is already
    ///   issued within the event; nothing written
    /// - `Database`: anything else; nothing written
    fn reserve<'a>(
        &'a self,
        claim: &'a ReservationClaim,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ReservationOutcome>;

    /// Cancel a registration and release its ticket slot in one unit.
    ///
    /// `sold_count` is decremented but never below zero. Invitation code
    /// budgets are not restored.
    ///
    /// # Errors
    ///
    /// - `NotFound`: no such registration
    /// - `Conflict` / `Unavailable`: transient, nothing written
    fn cancel_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, CancellationOutcome>;
}
