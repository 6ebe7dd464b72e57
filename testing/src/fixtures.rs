//! Fixture builders for admission tests.

use admission_core::codes::generate_referral_code;
use admission_core::types::{
    EventId, FormData, InvitationCode, Registration, RegistrationId, RegistrationStatus, Ticket,
    TicketId,
};
use chrono::{DateTime, Utc};

/// Fluent builder for [`Ticket`]s. Defaults: active, open window, capacity 10.
#[derive(Debug, Clone)]
pub struct TicketBuilder {
    ticket: Ticket,
}

impl TicketBuilder {
    /// Start from a fresh ticket on a new event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticket: Ticket::new(EventId::new(), "General Admission", 10),
        }
    }

    /// Attach to an existing event.
    #[must_use]
    pub const fn event(mut self, event_id: EventId) -> Self {
        self.ticket.event_id = event_id;
        self
    }

    /// Set capacity.
    #[must_use]
    pub const fn quantity(mut self, quantity: u32) -> Self {
        self.ticket.quantity = quantity;
        self
    }

    /// Set the starting sold count.
    #[must_use]
    pub const fn sold(mut self, sold_count: u32) -> Self {
        self.ticket.sold_count = sold_count;
        self
    }

    /// Set the sale window.
    #[must_use]
    pub const fn sale_window(
        mut self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.ticket.sale_start = start;
        self.ticket.sale_end = end;
        self
    }

    /// Require an invitation code.
    #[must_use]
    pub const fn invite_only(mut self) -> Self {
        self.ticket.require_invite_code = true;
        self
    }

    /// Require SMS verification.
    #[must_use]
    pub const fn sms_verified(mut self) -> Self {
        self.ticket.require_sms_verification = true;
        self
    }

    /// Start registrations as pending.
    #[must_use]
    pub const fn requires_approval(mut self) -> Self {
        self.ticket.requires_approval = true;
        self
    }

    /// Deactivate the ticket.
    #[must_use]
    pub const fn inactive(mut self) -> Self {
        self.ticket.is_active = false;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Ticket {
        self.ticket
    }
}

impl Default for TicketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Fluent builder for [`InvitationCode`]s scoped to one ticket.
#[derive(Debug, Clone)]
pub struct InvitationCodeBuilder {
    code: InvitationCode,
}

impl InvitationCodeBuilder {
    /// Start an active, unlimited code for `ticket`.
    #[must_use]
    pub fn for_ticket(ticket: &Ticket, code: &str) -> Self {
        Self {
            code: InvitationCode::new(ticket, code),
        }
    }

    /// Set the usage limit.
    #[must_use]
    pub const fn limit(mut self, usage_limit: u32) -> Self {
        self.code.usage_limit = Some(usage_limit);
        self
    }

    /// Set the starting used count.
    #[must_use]
    pub const fn used(mut self, used_count: u32) -> Self {
        self.code.used_count = used_count;
        self
    }

    /// Set the validity window.
    #[must_use]
    pub const fn valid_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.code.valid_from = from;
        self.code.valid_until = until;
        self
    }

    /// Deactivate the code.
    #[must_use]
    pub const fn inactive(mut self) -> Self {
        self.code.is_active = false;
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> InvitationCode {
        self.code
    }
}

/// An existing confirmed registration, e.g. to act as a referrer.
///
/// Seeding it does not touch any counter; use it for rows that predate the
/// test.
#[must_use]
pub fn existing_registration(event_id: EventId, ticket_id: TicketId, email: &str) -> Registration {
    Registration {
        id: RegistrationId::new(),
        event_id,
        ticket_id,
        email: email.to_string(),
        user_id: None,
        phone: None,
        invitation_code_id: None,
        referral_code: generate_referral_code(),
        referred_by: None,
        form_data: FormData::new(),
        status: RegistrationStatus::Confirmed,
        idempotency_key: None,
        created_at: Utc::now(),
    }
}
