//! Code validator for invitation and referral codes.
//!
//! Validation is an advisory pass: it runs against a snapshot read outside the
//! ticket lock, so the remaining-use check can be stale under concurrency. The
//! authoritative budget check is the conditional increment inside the
//! admission unit.
//!
//! Invalid codes are a normal input, so results are values
//! ([`CodeValidation`]) rather than errors.

use crate::error::RejectionReason;
use crate::types::{EventId, InvitationCode, Registration, TicketId};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;

/// Scope a code must belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeScope {
    /// The code must unlock this exact ticket.
    Ticket(TicketId),
    /// Any code of this event is acceptable.
    Event(EventId),
}

/// Why a code failed validation. Each check has its own reason so callers can
/// present precise errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeRejection {
    /// No code with that value exists.
    NotFound,
    /// The code was deactivated by the organizer.
    Inactive,
    /// The code belongs to another ticket or event.
    WrongScope,
    /// `now` is before `valid_from`.
    NotYetValid,
    /// `now` is after `valid_until`.
    Expired,
    /// `used_count` has reached `usage_limit`.
    Exhausted,
    /// The referring registration was cancelled.
    ReferrerCancelled,
}

impl CodeRejection {
    /// Map to the user-facing rejection reason.
    #[must_use]
    pub const fn reason(&self) -> RejectionReason {
        match self {
            Self::Exhausted => RejectionReason::CodeExhausted,
            _ => RejectionReason::CodeInvalid,
        }
    }

    /// Short human-readable description.
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        match self {
            Self::NotFound => "code does not exist",
            Self::Inactive => "code is no longer active",
            Self::WrongScope => "code is not valid for this ticket",
            Self::NotYetValid => "code is not valid yet",
            Self::Expired => "code has expired",
            Self::Exhausted => "code has no remaining uses",
            Self::ReferrerCancelled => "referring registration was cancelled",
        }
    }
}

impl fmt::Display for CodeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Result of validating a code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeValidation {
    /// All checks passed.
    Valid,
    /// The first failing check.
    Invalid(CodeRejection),
}

impl CodeValidation {
    /// Whether all checks passed.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Convert into a `Result` for `?` chaining.
    ///
    /// # Errors
    ///
    /// Returns the failing [`CodeRejection`].
    pub const fn into_result(self) -> Result<(), CodeRejection> {
        match self {
            Self::Valid => Ok(()),
            Self::Invalid(rejection) => Err(rejection),
        }
    }
}

/// Validate an invitation code against `scope` at `now`.
///
/// Checks run in order and stop at the first failure:
///
/// 1. the code exists and is active
/// 2. it belongs to `scope`
/// 3. `now` lies within `[valid_from, valid_until]` (open bounds unbounded)
/// 4. `usage_limit` is unset or `used_count < usage_limit` (advisory)
#[must_use]
pub fn validate_invitation_code(
    code: Option<&InvitationCode>,
    scope: CodeScope,
    now: DateTime<Utc>,
) -> CodeValidation {
    let Some(code) = code else {
        return CodeValidation::Invalid(CodeRejection::NotFound);
    };
    if !code.is_active {
        return CodeValidation::Invalid(CodeRejection::Inactive);
    }
    let in_scope = match scope {
        CodeScope::Ticket(ticket_id) => code.ticket_id == ticket_id,
        CodeScope::Event(event_id) => code.event_id == event_id,
    };
    if !in_scope {
        return CodeValidation::Invalid(CodeRejection::WrongScope);
    }
    if code.valid_from.is_some_and(|from| now < from) {
        return CodeValidation::Invalid(CodeRejection::NotYetValid);
    }
    if code.valid_until.is_some_and(|until| now > until) {
        return CodeValidation::Invalid(CodeRejection::Expired);
    }
    if !code.has_remaining_uses() {
        return CodeValidation::Invalid(CodeRejection::Exhausted);
    }
    CodeValidation::Valid
}

/// Validate a referral code resolved to its referring registration.
///
/// Referral codes carry no budget; they must exist, belong to `event_id`, and
/// the referrer must still hold its registration.
#[must_use]
pub fn validate_referral(referrer: Option<&Registration>, event_id: EventId) -> CodeValidation {
    let Some(referrer) = referrer else {
        return CodeValidation::Invalid(CodeRejection::NotFound);
    };
    if referrer.event_id != event_id {
        return CodeValidation::Invalid(CodeRejection::WrongScope);
    }
    if !referrer.status.holds_slot() {
        return CodeValidation::Invalid(CodeRejection::ReferrerCancelled);
    }
    CodeValidation::Valid
}

/// Length of generated referral codes.
pub const REFERRAL_CODE_LEN: usize = 8;

// No 0/O or 1/I so codes survive being read aloud.
const REFERRAL_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a fresh shareable referral code.
#[must_use]
pub fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LEN)
        .map(|_| char::from(REFERRAL_ALPHABET[rng.gen_range(0..REFERRAL_ALPHABET.len())]))
        .collect()
}
