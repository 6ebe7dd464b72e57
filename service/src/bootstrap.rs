//! Wiring of the registration pipeline against `PostgreSQL`.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = Config::from_env();
//! let services = Services::from_config(&config).await?;
//! let registration = services.pipeline.submit_registration(request).await?;
//! ```

use crate::adapters::{LogNotifier, PostgresFormValidator, PostgresPhoneVerifier};
use crate::config::Config;
use admission_core::environment::SystemClock;
use admission_postgres::PostgresAdmissionStore;
use admission_runtime::metrics::MetricsServer;
use admission_runtime::{PipelineEnvironment, RegistrationPipeline};
use anyhow::Context;
use std::sync::Arc;

/// Everything a request handler needs, built once at startup.
#[derive(Debug, Clone)]
pub struct Services {
    /// The admission store, also used for seeding and inspection
    pub store: PostgresAdmissionStore,
    /// The registration commit pipeline
    pub pipeline: RegistrationPipeline,
}

impl Services {
    /// Connect to the database, run migrations and build the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or a migration fails.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        tracing::info!("Connecting to admission database...");
        let store = PostgresAdmissionStore::connect(&config.postgres.url, &config.store_settings())
            .await
            .context("Failed to connect to the admission database")?;
        store
            .migrate()
            .await
            .context("Failed to run admission migrations")?;
        tracing::info!("Admission database ready");

        let pool = store.pool().clone();
        let pipeline = RegistrationPipeline::new(
            PipelineEnvironment {
                store: Arc::new(store.clone()),
                clock: Arc::new(SystemClock),
                forms: Arc::new(PostgresFormValidator::new(pool.clone())),
                phones: Arc::new(PostgresPhoneVerifier::new(pool)),
                notifier: Arc::new(LogNotifier),
            },
            config.pipeline_config(),
        );

        Ok(Self { store, pipeline })
    }
}

/// Start the Prometheus exporter on the configured address.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics(config: &Config) -> anyhow::Result<MetricsServer> {
    let mut server = MetricsServer::new(config.metrics_addr());
    server
        .serve()
        .context("Failed to start the metrics exporter")?;
    tracing::info!(addr = %server.addr(), "Metrics exporter listening");
    Ok(server)
}
