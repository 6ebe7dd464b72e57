//! Admission load test.
//!
//! Seeds a fresh event with one ticket of capacity `LOADTEST_CAPACITY` (and,
//! when `LOADTEST_CODE_LIMIT` is set, an invitation code with that usage
//! limit), fires `LOADTEST_REQUESTS` concurrent registrations at it and
//! checks the counters afterwards.
//!
//! # Usage
//!
//! ```bash
//! # Start a database
//! docker compose up -d postgres
//!
//! # Run the load test
//! LOADTEST_REQUESTS=2000 LOADTEST_CAPACITY=150 cargo run --release --bin loadtest
//! ```

use admission_core::error::{RegistrationError, RejectionReason};
use admission_core::store::AdmissionStore;
use admission_core::types::{EventId, InvitationCode, Registration, Ticket};
use admission_runtime::RegistrationRequest;
use admission_runtime::metrics::MetricsServer;
use anyhow::Context;
use std::env;
use std::time::Instant;
use ticket_admission::{Config, Services, start_metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const INVITATION_CODE: &str = "LOADTEST";

#[derive(Debug, Default)]
struct Tally {
    admitted: u32,
    sold_out: u32,
    code_exhausted: u32,
    other_rejections: u32,
    try_again: u32,
    fatal: u32,
}

impl Tally {
    fn record(&mut self, result: &Result<Registration, RegistrationError>) {
        match result {
            Ok(_) => self.admitted += 1,
            Err(RegistrationError::Rejected {
                reason: RejectionReason::TicketSoldOut,
                ..
            }) => self.sold_out += 1,
            Err(RegistrationError::Rejected {
                reason: RejectionReason::CodeExhausted,
                ..
            }) => self.code_exhausted += 1,
            Err(RegistrationError::Rejected { .. }) => self.other_rejections += 1,
            Err(RegistrationError::TryAgain { .. }) => self.try_again += 1,
            Err(RegistrationError::NotFound { .. } | RegistrationError::Fatal { .. }) => {
                self.fatal += 1;
            }
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.server.log_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let requests: u32 = env_or("LOADTEST_REQUESTS", 500);
    let capacity: u32 = env_or("LOADTEST_CAPACITY", 100);
    let code_limit: Option<u32> = env::var("LOADTEST_CODE_LIMIT")
        .ok()
        .and_then(|s| s.parse().ok());

    let metrics = match start_metrics(&config) {
        Ok(server) => Some(server),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics exporter disabled");
            None
        }
    };

    let services = Services::from_config(&config).await?;

    let mut ticket = Ticket::new(EventId::new(), "Load test admission", capacity);
    ticket.require_invite_code = code_limit.is_some();
    services
        .store
        .insert_ticket(&ticket)
        .await
        .context("Failed to seed ticket")?;
    if let Some(limit) = code_limit {
        let mut code = InvitationCode::new(&ticket, INVITATION_CODE);
        code.usage_limit = Some(limit);
        services
            .store
            .insert_invitation_code(&code)
            .await
            .context("Failed to seed invitation code")?;
    }

    tracing::info!(
        ticket_id = %ticket.id,
        requests,
        capacity,
        code_limit = ?code_limit,
        "Starting load test"
    );

    let started = Instant::now();
    let handles: Vec<_> = (0..requests)
        .map(|i| {
            let pipeline = services.pipeline.clone();
            let mut request = RegistrationRequest::new(
                ticket.event_id,
                ticket.id,
                format!("attendee{i}@loadtest.example.com"),
            );
            if code_limit.is_some() {
                request = request.with_invitation_code(INVITATION_CODE);
            }
            tokio::spawn(async move { pipeline.submit_registration(request).await })
        })
        .collect();

    let mut tally = Tally::default();
    for result in futures::future::join_all(handles).await {
        tally.record(&result.context("Registration task panicked")?);
    }
    let elapsed = started.elapsed();

    let stored = services
        .store
        .load_ticket(ticket.id)
        .await?
        .context("Seeded ticket disappeared")?;
    let holders = services.store.count_slot_holders(ticket.id).await?;

    println!("\n============================================");
    println!("   Admission load test");
    println!("============================================");
    println!("requests          {requests}");
    println!("capacity          {capacity}");
    if let Some(limit) = code_limit {
        println!("code limit        {limit}");
    }
    println!("elapsed           {elapsed:.2?}");
    println!("admitted          {}", tally.admitted);
    println!("sold out          {}", tally.sold_out);
    println!("code exhausted    {}", tally.code_exhausted);
    println!("other rejections  {}", tally.other_rejections);
    println!("try again         {}", tally.try_again);
    println!("fatal             {}", tally.fatal);
    println!("sold_count        {}", stored.sold_count);
    println!("slot holders      {holders}");

    if let Some(rendered) = metrics.as_ref().and_then(MetricsServer::render) {
        println!("\n--- metrics ---");
        rendered
            .lines()
            .filter(|line| line.starts_with("admission_"))
            .for_each(|line| println!("{line}"));
    }

    anyhow::ensure!(
        stored.sold_count == tally.admitted,
        "sold_count {} does not match {} admitted registrations",
        stored.sold_count,
        tally.admitted
    );
    anyhow::ensure!(
        holders == tally.admitted,
        "{holders} slot holders for {} admitted registrations",
        tally.admitted
    );
    anyhow::ensure!(
        tally.admitted <= capacity,
        "admitted {} exceeds capacity {capacity}",
        tally.admitted
    );
    if let Some(limit) = code_limit {
        anyhow::ensure!(
            tally.admitted <= limit,
            "admitted {} exceeds code limit {limit}",
            tally.admitted
        );
    }

    println!("\nCounters consistent.");
    Ok(())
}
