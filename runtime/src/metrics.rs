//! Prometheus metrics for admission control.
//!
//! Metrics recorded by the coordinator, the pipeline and the notification
//! dispatcher:
//! - Admission attempts, admissions, rejections by reason, try-again outcomes
//! - Reservation latency (lock wait included)
//! - Cancellations
//! - Notification deliveries and failures
//!
//! # Example
//!
//! ```rust,no_run
//! use admission_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Serve metrics on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use admission_core::RejectionReason;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// [`start`](Self::start) installs the recorder only, so the host can render
/// metrics itself. [`serve`](Self::serve) also exposes them over HTTP for
/// Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the HTTP listener binds to.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Register metric descriptions and install the recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs
    /// a warning and keeps using the existing one.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a
    /// spawned task for the life of the process.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or a recorder is already
    /// installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = Self::builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|_| MetricsError::Install("metrics recorder already installed".into()))?;
        self.handle = Some(handle);

        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics listener stopped");
            }
        });
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        PrometheusBuilder::new()
            // Reservation latency is dominated by lock waits, hence the low buckets
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Admission Metrics
    describe_counter!(
        "admission_attempts_total",
        "Total number of reservation attempts reaching the coordinator"
    );
    describe_counter!(
        "admission_admitted_total",
        "Total number of registrations admitted"
    );
    describe_counter!(
        "admission_rejected_total",
        "Total number of rejected registration attempts, by reason"
    );
    describe_counter!(
        "admission_try_again_total",
        "Total number of attempts that exhausted transient retries"
    );
    describe_histogram!(
        "admission_reserve_duration_seconds",
        "Time taken by one reservation, retries and lock waits included"
    );
    describe_counter!(
        "admission_store_conflicts_total",
        "Total number of lock timeouts, deadlocks and serialization failures seen by the store"
    );

    // Lifecycle Metrics
    describe_counter!(
        "registration_cancelled_total",
        "Total number of registrations cancelled"
    );

    // Notification Metrics
    describe_counter!(
        "notification_sent_total",
        "Total number of confirmation notifications delivered"
    );
    describe_counter!(
        "notification_failed_total",
        "Total number of notifications abandoned after retries"
    );
}

/// Admission metrics recorder.
pub struct AdmissionMetrics;

impl AdmissionMetrics {
    /// Record a reservation attempt.
    pub fn record_attempt() {
        counter!("admission_attempts_total").increment(1);
    }

    /// Record an admitted registration.
    pub fn record_admitted(duration: Duration) {
        counter!("admission_admitted_total").increment(1);
        histogram!("admission_reserve_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejection, labelled with its stable code.
    pub fn record_rejected(reason: RejectionReason) {
        counter!("admission_rejected_total", "reason" => reason.as_code()).increment(1);
    }

    /// Record a reservation that ran out of transient retries.
    pub fn record_try_again(duration: Duration) {
        counter!("admission_try_again_total").increment(1);
        histogram!("admission_reserve_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a cancellation that released a slot.
    pub fn record_cancelled() {
        counter!("registration_cancelled_total").increment(1);
    }
}

/// Notification metrics recorder.
pub struct NotificationMetrics;

impl NotificationMetrics {
    /// Record a delivered notification.
    pub fn record_sent() {
        counter!("notification_sent_total").increment(1);
    }

    /// Record a notification abandoned after retries.
    pub fn record_failed() {
        counter!("notification_failed_total").increment(1);
    }
}
