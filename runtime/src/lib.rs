//! # Admission Runtime
//!
//! Runtime for ticket admission control.
//!
//! This crate turns the pure rules of `admission-core` into a running
//! registration flow: it retries contended admission units, bounds them with
//! a timeout, dispatches notifications after commit and records metrics.
//!
//! ## Core Components
//!
//! - **Coordinator**: runs admission units and retries transient failures
//! - **Pipeline**: orchestrates validation, reservation and notification
//! - **Dispatcher**: post-commit notification delivery in the background
//!
//! ## Example
//!
//! ```ignore
//! use admission_runtime::{PipelineConfig, PipelineEnvironment, RegistrationPipeline};
//! use admission_runtime::RegistrationRequest;
//!
//! let pipeline = RegistrationPipeline::new(environment, PipelineConfig::default());
//!
//! let registration = pipeline
//!     .submit_registration(RegistrationRequest::new(event_id, ticket_id, "ada@example.com"))
//!     .await?;
//! ```

/// Retry logic with jittered exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Reservation coordinator
pub mod coordinator;

/// Post-commit notification dispatch
pub mod dispatcher;

/// Registration commit pipeline
pub mod pipeline;

pub use coordinator::{Reservation, ReservationCoordinator, ReserveError};
pub use dispatcher::NotificationDispatcher;
pub use pipeline::{
    PipelineConfig, PipelineConfigBuilder, PipelineEnvironment, RegistrationPipeline,
    RegistrationRequest,
};
pub use retry::RetryPolicy;
