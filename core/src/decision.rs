//! Post-lock admission decision.
//!
//! Store adapters call [`decide_admission`] after acquiring the ticket lock
//! (and the code lock, always in that order) and before writing anything.
//! The decision evaluates both conditions of the admission pair together:
//! the ticket must have a free slot and, when a code is redeemed, the code
//! must have a remaining use. Either both counters move or neither does.

use crate::availability::Availability;
use crate::codes::{CodeScope, validate_invitation_code};
use crate::error::RejectionReason;
use crate::types::{InvitationCode, Ticket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counter values after a successful admission, for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCounters {
    /// Ticket `sold_count` after the increment
    pub ticket_sold_count: u32,
    /// Ticket capacity
    pub ticket_quantity: u32,
    /// Code `used_count` after the increment, when a code was redeemed
    pub code_used_count: Option<u32>,
}

impl AdmissionCounters {
    /// Slots left after this admission.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.ticket_quantity.saturating_sub(self.ticket_sold_count)
    }
}

/// Conditional increment: `value + 1` if `value < limit`, `None` otherwise.
///
/// A `None` limit means unlimited. This is the in-process statement of the
/// `UPDATE .. SET x = x + 1 WHERE x < limit` primitive the store relies on.
#[must_use]
pub fn increment_if_below(value: u32, limit: Option<u32>) -> Option<u32> {
    match limit {
        Some(limit) if value >= limit => None,
        _ => value.checked_add(1),
    }
}

/// Decide whether one admission may proceed against the locked rows.
///
/// Checks, in order:
///
/// 1. the ticket is active and inside its sale window
/// 2. a code is present when the ticket requires one
/// 3. the code (if any) is valid for this ticket and has a remaining use
/// 4. the ticket has a free slot
///
/// # Errors
///
/// Returns the [`RejectionReason`] of the first failing check. Nothing has
/// been written when this returns, so the caller only needs to roll back.
pub fn decide_admission(
    ticket: &Ticket,
    code: Option<&InvitationCode>,
    code_requested: bool,
    now: DateTime<Utc>,
) -> Result<AdmissionCounters, RejectionReason> {
    let availability = Availability::calculate(ticket, now);
    if !availability.is_on_sale {
        return Err(RejectionReason::TicketNotOnSale);
    }

    if (ticket.require_invite_code || code_requested) && code.is_none() {
        return Err(RejectionReason::CodeInvalid);
    }

    let code_used_count = match code {
        Some(code) => {
            validate_invitation_code(Some(code), CodeScope::Ticket(ticket.id), now)
                .into_result()
                .map_err(|rejection| rejection.reason())?;
            Some(
                increment_if_below(code.used_count, code.usage_limit)
                    .ok_or(RejectionReason::CodeExhausted)?,
            )
        }
        None => None,
    };

    let ticket_sold_count = increment_if_below(ticket.sold_count, Some(ticket.quantity))
        .ok_or(RejectionReason::TicketSoldOut)?;

    Ok(AdmissionCounters {
        ticket_sold_count,
        ticket_quantity: ticket.quantity,
        code_used_count,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use crate::types::EventId;
    use chrono::Duration;

    #[test]
    fn increment_if_below_respects_limit() {
        assert_eq!(increment_if_below(0, Some(1)), Some(1));
        assert_eq!(increment_if_below(1, Some(1)), None);
        assert_eq!(increment_if_below(5, Some(2)), None);
        assert_eq!(increment_if_below(41, None), Some(42));
        assert_eq!(increment_if_below(u32::MAX, None), None);
    }

    #[test]
    fn admits_and_reports_post_increment_counters() {
        let mut ticket = Ticket::new(EventId::new(), "General", 2);
        ticket.sold_count = 1;

        let counters = decide_admission(&ticket, None, false, Utc::now()).unwrap();
        assert_eq!(counters.ticket_sold_count, 2);
        assert_eq!(counters.remaining(), 0);
        assert_eq!(counters.code_used_count, None);
    }

    #[test]
    fn last_slot_then_sold_out() {
        let mut ticket = Ticket::new(EventId::new(), "General", 1);
        assert!(decide_admission(&ticket, None, false, Utc::now()).is_ok());

        ticket.sold_count = 1;
        assert_eq!(
            decide_admission(&ticket, None, false, Utc::now()),
            Err(RejectionReason::TicketSoldOut)
        );
    }

    #[test]
    fn not_on_sale_wins_over_stock() {
        let now = Utc::now();
        let mut ticket = Ticket::new(EventId::new(), "General", 10);
        ticket.sale_end = Some(now - Duration::hours(1));

        assert_eq!(
            decide_admission(&ticket, None, false, now),
            Err(RejectionReason::TicketNotOnSale)
        );
    }

    #[test]
    fn required_code_missing_is_invalid() {
        let mut ticket = Ticket::new(EventId::new(), "Invite only", 10);
        ticket.require_invite_code = true;

        assert_eq!(
            decide_admission(&ticket, None, false, Utc::now()),
            Err(RejectionReason::CodeInvalid)
        );
    }

    #[test]
    fn requested_code_that_vanished_is_invalid() {
        let ticket = Ticket::new(EventId::new(), "General", 10);
        assert_eq!(
            decide_admission(&ticket, None, true, Utc::now()),
            Err(RejectionReason::CodeInvalid)
        );
    }

    #[test]
    fn exhausted_code_rejects_even_with_ticket_stock() {
        let ticket = Ticket::new(EventId::new(), "Invite only", 10);
        let mut code = InvitationCode::new(&ticket, "VIP");
        code.usage_limit = Some(2);
        code.used_count = 2;

        assert_eq!(
            decide_admission(&ticket, Some(&code), true, Utc::now()),
            Err(RejectionReason::CodeExhausted)
        );
    }

    #[test]
    fn both_counters_advance_together() {
        let ticket = Ticket::new(EventId::new(), "Invite only", 10);
        let mut code = InvitationCode::new(&ticket, "VIP");
        code.usage_limit = Some(2);
        code.used_count = 1;

        let counters = decide_admission(&ticket, Some(&code), true, Utc::now()).unwrap();
        assert_eq!(counters.ticket_sold_count, 1);
        assert_eq!(counters.code_used_count, Some(2));
    }
}
