//! # Ticket Admission Service
//!
//! Deployment wiring for the registration pipeline: environment
//! configuration, the `PostgreSQL`-backed store and collaborators, and the
//! metrics exporter.
//!
//! The admission guarantees themselves live in `admission-runtime` and
//! `admission-postgres`; this crate only assembles them.

pub mod adapters;
pub mod bootstrap;
pub mod config;

pub use bootstrap::{Services, start_metrics};
pub use config::Config;
