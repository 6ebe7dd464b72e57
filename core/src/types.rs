//! Domain types for ticket admission.
//!
//! Tickets and invitation codes carry the only contended counters
//! (`sold_count`, `used_count`). Registrations and referral usages are written
//! once by the admission unit and read thereafter, apart from the status
//! transition to `Cancelled`.

use crate::error::RegistrationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an event
    EventId
);
uuid_id!(
    /// Unique identifier for a ticket type within an event
    TicketId
);
uuid_id!(
    /// Unique identifier for an invitation code
    InvitationCodeId
);
uuid_id!(
    /// Unique identifier for a registration
    RegistrationId
);
uuid_id!(
    /// Unique identifier for a referral usage record
    ReferralUsageId
);

/// Client-supplied key that makes repeated submissions return the same
/// registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Minimum accepted key length.
    pub const MIN_LEN: usize = 16;
    /// Maximum accepted key length.
    pub const MAX_LEN: usize = 128;

    /// Parse a key, rejecting values outside `MIN_LEN..=MAX_LEN` characters.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::Fatal`] for malformed keys: a bad key is a
    /// malformed request, not something to retry.
    pub fn parse(key: impl Into<String>) -> Result<Self, RegistrationError> {
        let key = key.into();
        let len = key.chars().count();
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
            return Err(RegistrationError::fatal(format!(
                "idempotency key must be between {} and {} characters, got {len}",
                Self::MIN_LEN,
                Self::MAX_LEN
            )));
        }
        Ok(Self(key))
    }

    /// Borrow the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Ticket
// ============================================================================

/// A purchasable ticket type with a fixed capacity.
///
/// `sold_count` is owned by the admission unit of the store adapter; nothing
/// else may write it. `0 <= sold_count <= quantity` holds at all times.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket identifier
    pub id: TicketId,
    /// Owning event
    pub event_id: EventId,
    /// Display name ("General Admission")
    pub name: String,
    /// Total capacity
    pub quantity: u32,
    /// Slots currently held by non-cancelled registrations
    pub sold_count: u32,
    /// Sales open at this instant (open bound when `None`)
    pub sale_start: Option<DateTime<Utc>>,
    /// Sales close after this instant (open bound when `None`)
    pub sale_end: Option<DateTime<Utc>>,
    /// Registrations must redeem an invitation code scoped to this ticket
    pub require_invite_code: bool,
    /// Registrations must present a verified phone number
    pub require_sms_verification: bool,
    /// New registrations start as `Pending` instead of `Confirmed`
    pub requires_approval: bool,
    /// Organizer-controlled kill switch
    pub is_active: bool,
}

impl Ticket {
    /// Create an active ticket with an open sale window and nothing sold.
    #[must_use]
    pub fn new(event_id: EventId, name: impl Into<String>, quantity: u32) -> Self {
        Self {
            id: TicketId::new(),
            event_id,
            name: name.into(),
            quantity,
            sold_count: 0,
            sale_start: None,
            sale_end: None,
            require_invite_code: false,
            require_sms_verification: false,
            requires_approval: false,
            is_active: true,
        }
    }

    /// Status a fresh registration for this ticket starts in.
    #[must_use]
    pub const fn initial_registration_status(&self) -> RegistrationStatus {
        if self.requires_approval {
            RegistrationStatus::Pending
        } else {
            RegistrationStatus::Confirmed
        }
    }
}

// ============================================================================
// Invitation codes
// ============================================================================

/// A limited-use code gating access to a restricted ticket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitationCode {
    /// Code identifier
    pub id: InvitationCodeId,
    /// Event the code belongs to
    pub event_id: EventId,
    /// Ticket the code unlocks
    pub ticket_id: TicketId,
    /// The code string users type in (unique per event)
    pub code: String,
    /// Maximum redemptions, `None` for unlimited
    pub usage_limit: Option<u32>,
    /// Successful redemptions so far; never decremented
    pub used_count: u32,
    /// Start of the validity window (open bound when `None`)
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window (open bound when `None`)
    pub valid_until: Option<DateTime<Utc>>,
    /// Organizer-controlled kill switch
    pub is_active: bool,
}

impl InvitationCode {
    /// Create an active, unlimited, always-valid code for `ticket`.
    #[must_use]
    pub fn new(ticket: &Ticket, code: impl Into<String>) -> Self {
        Self {
            id: InvitationCodeId::new(),
            event_id: ticket.event_id,
            ticket_id: ticket.id,
            code: code.into(),
            usage_limit: None,
            used_count: 0,
            valid_from: None,
            valid_until: None,
            is_active: true,
        }
    }

    /// Whether another redemption fits in the budget.
    #[must_use]
    pub fn has_remaining_uses(&self) -> bool {
        self.usage_limit.is_none_or(|limit| self.used_count < limit)
    }
}

// ============================================================================
// Registrations
// ============================================================================

/// Lifecycle state of a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Awaiting organizer approval; holds a slot
    Pending,
    /// Admitted; holds a slot
    Confirmed,
    /// Released its slot
    Cancelled,
}

impl RegistrationStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether a registration in this state holds a ticket slot.
    #[must_use]
    pub const fn holds_slot(&self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attendee-supplied form answers.
///
/// The shape differs per event; the field schema lives with the form
/// validation collaborator, so this stays an ordered key-value map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormData(BTreeMap<String, serde_json::Value>);

impl FormData {
    /// Create empty form data.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Iterate fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no fields were supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.clone().into_iter().collect())
    }

    /// Build from a JSON value; non-object values yield empty form data.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self(map.into_iter().collect()),
            _ => Self::new(),
        }
    }
}

impl From<BTreeMap<String, serde_json::Value>> for FormData {
    fn from(map: BTreeMap<String, serde_json::Value>) -> Self {
        Self(map)
    }
}

/// A persisted registration.
///
/// While its status holds a slot it corresponds to exactly one increment of
/// its ticket's `sold_count`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Registration identifier
    pub id: RegistrationId,
    /// Event registered for
    pub event_id: EventId,
    /// Ticket holding the slot
    pub ticket_id: TicketId,
    /// Attendee email
    pub email: String,
    /// Authenticated user, if any
    pub user_id: Option<Uuid>,
    /// Phone number used for SMS verification, if any
    pub phone: Option<String>,
    /// Invitation code redeemed by this registration
    pub invitation_code_id: Option<InvitationCodeId>,
    /// This registration's own shareable referral code
    pub referral_code: String,
    /// Referral code of the registration that referred this one
    pub referred_by: Option<String>,
    /// Form answers
    pub form_data: FormData,
    /// Lifecycle state
    pub status: RegistrationStatus,
    /// Key of the submission that created this registration
    pub idempotency_key: Option<IdempotencyKey>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Attribution of a new registration to the registration that referred it.
///
/// At most one per new registration, written in the same unit as it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralUsage {
    /// Usage identifier
    pub id: ReferralUsageId,
    /// Event both registrations belong to
    pub event_id: EventId,
    /// Registration whose referral code was used
    pub referrer_registration_id: RegistrationId,
    /// Registration produced by the referral
    pub registration_id: RegistrationId,
    /// When the referral was redeemed
    pub used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_length_bounds() {
        assert!(IdempotencyKey::parse("short").is_err());
        assert!(IdempotencyKey::parse("a".repeat(16)).is_ok());
        assert!(IdempotencyKey::parse("a".repeat(128)).is_ok());
        assert!(IdempotencyKey::parse("a".repeat(129)).is_err());
    }

    #[test]
    fn approval_tickets_start_pending() {
        let mut ticket = Ticket::new(EventId::new(), "VIP", 10);
        assert_eq!(ticket.initial_registration_status(), RegistrationStatus::Confirmed);

        ticket.requires_approval = true;
        assert_eq!(ticket.initial_registration_status(), RegistrationStatus::Pending);
    }

    #[test]
    fn status_string_roundtrip_and_slot_holding() {
        for status in [
            RegistrationStatus::Pending,
            RegistrationStatus::Confirmed,
            RegistrationStatus::Cancelled,
        ] {
            assert_eq!(RegistrationStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RegistrationStatus::parse("refunded"), None);
        assert!(!RegistrationStatus::Cancelled.holds_slot());
    }

    #[test]
    fn form_data_json_is_an_object() {
        let form = FormData::new().with("name", "Ada").with("age", 36);
        let json = form.to_json();

        assert_eq!(json["name"], "Ada");
        assert_eq!(FormData::from_json(json), form);
        assert!(FormData::from_json(serde_json::json!([1, 2])).is_empty());
    }

    #[test]
    fn unlimited_codes_always_have_remaining_uses() {
        let ticket = Ticket::new(EventId::new(), "Invite only", 5);
        let mut code = InvitationCode::new(&ticket, "FRIENDS");
        code.used_count = 10_000;
        assert!(code.has_remaining_uses());

        code.usage_limit = Some(10_000);
        assert!(!code.has_remaining_uses());
    }
}
