//! # Admission Core
//!
//! Domain types and pure admission rules for ticket registration.
//!
//! This crate decides *whether* a registration attempt may proceed. It owns no
//! I/O: persistence, SMS verification, form validation and notification
//! delivery are reached through the traits in [`store`] and [`collaborators`],
//! and time through [`environment::Clock`].
//!
//! ## Components
//!
//! - [`availability`]: live sale-window and remaining-quantity status of a ticket
//! - [`codes`]: invitation and referral code validation with precise reasons
//! - [`decision`]: the post-lock admission decision every store adapter runs
//! - [`error`]: rejection reasons, store errors and the outward error taxonomy
//!
//! ## Example
//!
//! ```
//! use admission_core::availability::Availability;
//! use admission_core::types::{EventId, Ticket};
//! use chrono::Utc;
//!
//! let ticket = Ticket::new(EventId::new(), "General", 100);
//! let availability = Availability::calculate(&ticket, Utc::now());
//!
//! assert_eq!(availability.available, 100);
//! assert!(availability.is_on_sale);
//! assert!(!availability.is_sold_out);
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod availability;
pub mod codes;
pub mod collaborators;
pub mod decision;
pub mod error;
pub mod store;
pub mod types;

/// Environment module - injected time source.
///
/// Every rule in this crate takes `now` explicitly; callers obtain it from a
/// [`Clock`](environment::Clock) so tests can pin time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use admission_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use availability::Availability;
pub use codes::{CodeRejection, CodeScope, CodeValidation};
pub use decision::{AdmissionCounters, decide_admission};
pub use error::{ErrorCategory, RegistrationError, RejectionReason, StoreError};
pub use types::{
    EventId, FormData, IdempotencyKey, InvitationCode, InvitationCodeId, ReferralUsage,
    ReferralUsageId, Registration, RegistrationId, RegistrationStatus, Ticket, TicketId,
};
