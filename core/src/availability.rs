//! Availability calculator.
//!
//! Derives a ticket's live status from a snapshot of its row and a timestamp.
//! The function is total and side-effect free; identical inputs always give
//! identical output.
//!
//! Results computed from a snapshot read *before* the ticket lock are only
//! good for display and fail-fast checks. The admission decision re-runs the
//! calculation on the locked row (see [`crate::decision`]).

use crate::types::Ticket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live status of a ticket at one instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// Remaining slots, `max(0, quantity - sold_count)`
    pub available: u32,
    /// Active and inside the sale window
    pub is_on_sale: bool,
    /// No slots remain
    pub is_sold_out: bool,
}

impl Availability {
    /// Calculate availability of `ticket` at `now`.
    ///
    /// Both sale bounds are inclusive; a missing bound is unbounded.
    #[must_use]
    pub fn calculate(ticket: &Ticket, now: DateTime<Utc>) -> Self {
        let available = ticket.quantity.saturating_sub(ticket.sold_count);
        Self {
            available,
            is_on_sale: is_within_sale_window(ticket, now) && ticket.is_active,
            is_sold_out: available == 0,
        }
    }

    /// Whether a new admission could succeed right now.
    #[must_use]
    pub const fn can_admit(&self) -> bool {
        self.is_on_sale && !self.is_sold_out
    }
}

fn is_within_sale_window(ticket: &Ticket, now: DateTime<Utc>) -> bool {
    ticket.sale_start.is_none_or(|start| now >= start)
        && ticket.sale_end.is_none_or(|end| now <= end)
}
