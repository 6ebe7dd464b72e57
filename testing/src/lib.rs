//! # Admission Testing
//!
//! Testing utilities for ticket admission control.
//!
//! This crate provides:
//! - [`InMemoryAdmissionStore`]: per-ticket locking store with fault injection
//! - Fixed clocks for deterministic sale windows
//! - Fixture builders for tickets, codes and registrations
//! - Mock collaborators (form validation, SMS verification, notification)
//!
//! ## Example
//!
//! ```
//! use admission_testing::{InMemoryAdmissionStore, fixtures::TicketBuilder};
//!
//! let store = InMemoryAdmissionStore::new();
//! let ticket = TicketBuilder::new().quantity(1).build();
//! store.insert_ticket(ticket.clone());
//!
//! assert_eq!(store.ticket(ticket.id).map(|t| t.sold_count), Some(0));
//! ```

use admission_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod collaborators;
pub mod fixtures;
pub mod memory_store;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use admission_testing::mocks::FixedClock;
    /// use admission_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_time())
    }

    /// The instant [`test_clock`] is pinned to.
    ///
    /// # Panics
    ///
    /// Panics only if the hardcoded timestamp fails to parse.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
/// Filter with `RUST_LOG` (defaults to `warn`).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use collaborators::{MockPhoneVerifier, RecordingNotifier, StaticFormValidator};
pub use memory_store::InMemoryAdmissionStore;
pub use mocks::{FixedClock, test_clock, test_time};
