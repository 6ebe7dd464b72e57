//! `PostgreSQL` admission store for ticket registration.
//!
//! This crate provides the production implementation of the
//! [`AdmissionStore`] trait from `admission-core`. Correctness rests on the
//! database, not on any process-local state, so any number of service
//! instances may share one database:
//!
//! - `SELECT ... FOR UPDATE` on the ticket row, then the invitation code row
//! - conditional increments (`x = x + 1 WHERE x < limit`)
//! - one transaction covering both increments, the registration row and the
//!   referral usage row
//! - a bounded `lock_timeout`, surfaced as a retryable conflict
//!
//! # Example
//!
//! ```ignore
//! use admission_postgres::{PostgresAdmissionStore, StoreSettings};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresAdmissionStore::connect(
//!         "postgres://localhost/tickets",
//!         &StoreSettings::default(),
//!     )
//!     .await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod error;
mod rows;

use crate::error::{
    IDEMPOTENCY_CONSTRAINT, REFERRAL_CODE_CONSTRAINT, column, counter, is_unique_violation_of,
    map_sqlx,
};
use crate::rows::{CODE_COLUMNS, REGISTRATION_COLUMNS, TICKET_COLUMNS};
use admission_core::decision::{AdmissionCounters, decide_admission};
use admission_core::error::{RejectionReason, StoreError};
use admission_core::store::{
    AdmissionStore, CancellationOutcome, ReservationClaim, ReservationOutcome, StoreFuture,
};
use admission_core::types::{
    EventId, IdempotencyKey, InvitationCode, InvitationCodeId, Registration, RegistrationId,
    RegistrationStatus, Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Transaction};
use std::time::Duration;

/// Connection pool and locking settings.
///
/// # Default Values
///
/// - `max_connections`: 10
/// - `min_connections`: 2
/// - `connect_timeout`: 30 seconds
/// - `lock_timeout`: 250ms
#[derive(Clone, Debug)]
pub struct StoreSettings {
    /// Maximum pool size
    pub max_connections: u32,
    /// Connections kept open while idle
    pub min_connections: u32,
    /// How long to wait for a pooled connection
    pub connect_timeout: Duration,
    /// How long one statement may wait for a row lock
    pub lock_timeout: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            connect_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_millis(250),
        }
    }
}

/// `PostgreSQL`-backed [`AdmissionStore`].
#[derive(Clone, Debug)]
pub struct PostgresAdmissionStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresAdmissionStore {
    /// Connect a new pool using `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, settings: &StoreSettings) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.connect_timeout)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx("connect", e))?;

        tracing::info!(
            max_connections = settings.max_connections,
            lock_timeout_ms = settings.lock_timeout.as_millis(),
            "Connected admission store"
        );
        Ok(Self {
            pool,
            lock_timeout: settings.lock_timeout,
        })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// The underlying pool, shared with the service's Postgres adapters.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Insert a ticket row as-is.
    ///
    /// Used to seed load tests and integration tests; production tickets are
    /// managed elsewhere.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the insert fails.
    pub async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO tickets (
                id, event_id, name, quantity, sold_count, sale_start, sale_end,
                require_invite_code, require_sms_verification, requires_approval, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(ticket.id.as_uuid())
        .bind(ticket.event_id.as_uuid())
        .bind(&ticket.name)
        .bind(column("quantity", ticket.quantity)?)
        .bind(column("sold_count", ticket.sold_count)?)
        .bind(ticket.sale_start)
        .bind(ticket.sale_end)
        .bind(ticket.require_invite_code)
        .bind(ticket.require_sms_verification)
        .bind(ticket.requires_approval)
        .bind(ticket.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert ticket", e))?;
        Ok(())
    }

    /// Insert an invitation code row as-is.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the insert fails.
    pub async fn insert_invitation_code(&self, code: &InvitationCode) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO invitation_codes (
                id, event_id, ticket_id, code, usage_limit, used_count,
                valid_from, valid_until, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(code.id.as_uuid())
        .bind(code.event_id.as_uuid())
        .bind(code.ticket_id.as_uuid())
        .bind(&code.code)
        .bind(code.usage_limit.map(|l| column("usage_limit", l)).transpose()?)
        .bind(column("used_count", code.used_count)?)
        .bind(code.valid_from)
        .bind(code.valid_until)
        .bind(code.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("insert invitation code", e))?;
        Ok(())
    }

    /// Count registrations on a ticket that currently hold a slot.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the query fails.
    pub async fn count_slot_holders(&self, ticket_id: TicketId) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM registrations WHERE ticket_id = $1 AND status <> 'cancelled'",
        )
        .bind(ticket_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("count slot holders", e))?;
        u32::try_from(count)
            .map_err(|_| StoreError::Database(format!("slot count {count} out of range")))
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("begin transaction", e))?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("set lock_timeout", e))?;
        Ok(tx)
    }

    async fn lock_ticket(
        tx: &mut Transaction<'static, Postgres>,
        ticket_id: TicketId,
    ) -> Result<Ticket, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1 FOR UPDATE"
        ))
        .bind(ticket_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx("lock ticket", e))?
        .ok_or_else(|| StoreError::NotFound {
            entity: "ticket",
            id: ticket_id.to_string(),
        })?;
        rows::ticket(&row)
    }

    async fn lock_code(
        tx: &mut Transaction<'static, Postgres>,
        code_id: InvitationCodeId,
    ) -> Result<Option<InvitationCode>, StoreError> {
        sqlx::query(&format!(
            "SELECT {CODE_COLUMNS} FROM invitation_codes WHERE id = $1 FOR UPDATE"
        ))
        .bind(code_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx("lock invitation code", e))?
        .as_ref()
        .map(rows::invitation_code)
        .transpose()
    }

    async fn run_reserve(
        &self,
        claim: &ReservationClaim,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, StoreError> {
        let mut tx = self.begin().await?;

        // Lock order: ticket, then code.
        let ticket = Self::lock_ticket(&mut tx, claim.ticket_id()).await?;

        // A committed duplicate must be reported before its increment can turn
        // this attempt into a rejection. Same-ticket duplicates are serialized
        // by the ticket lock; the unique constraint covers the rest.
        if let Some(key) = &claim.registration().idempotency_key {
            let taken: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM registrations WHERE idempotency_key = $1)",
            )
            .bind(key.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx("check idempotency key", e))?;
            if taken {
                tx.rollback().await.map_err(|e| map_sqlx("rollback", e))?;
                return Err(StoreError::DuplicateIdempotencyKey(key.to_string()));
            }
        }

        let code = match claim.invitation_code_id() {
            Some(code_id) => Self::lock_code(&mut tx, code_id).await?,
            None => None,
        };

        let decided = match decide_admission(
            &ticket,
            code.as_ref(),
            claim.invitation_code_id().is_some(),
            now,
        ) {
            Ok(counters) => counters,
            Err(reason) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx("rollback", e))?;
                return Ok(ReservationOutcome::Rejected(reason));
            }
        };

        let mut code_used_count = None;
        if let Some(code_id) = claim.invitation_code_id() {
            let used: Option<i32> = sqlx::query_scalar(
                r"
                UPDATE invitation_codes
                SET used_count = used_count + 1
                WHERE id = $1 AND (usage_limit IS NULL OR used_count < usage_limit)
                RETURNING used_count
                ",
            )
            .bind(code_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx("increment used_count", e))?;
            let Some(used) = used else {
                return Ok(ReservationOutcome::Rejected(RejectionReason::CodeExhausted));
            };
            code_used_count = Some(counter("used_count", used)?);
        }

        let sold: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE tickets
            SET sold_count = sold_count + 1
            WHERE id = $1 AND sold_count < quantity
            RETURNING sold_count
            ",
        )
        .bind(claim.ticket_id().as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx("increment sold_count", e))?;
        let Some(sold) = sold else {
            return Ok(ReservationOutcome::Rejected(RejectionReason::TicketSoldOut));
        };
        let counters = AdmissionCounters {
            ticket_sold_count: counter("sold_count", sold)?,
            ticket_quantity: decided.ticket_quantity,
            code_used_count,
        };
        tracing::debug!(
            ticket_id = %claim.ticket_id(),
            sold_count = counters.ticket_sold_count,
            quantity = counters.ticket_quantity,
            "Slot claimed"
        );

        let registration = claim.registration();
        Self::insert_registration(&mut tx, registration).await?;

        if let Some(referral) = claim.referral() {
            sqlx::query(
                r"
                INSERT INTO referral_usages (id, event_id, referrer_registration_id, registration_id, used_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(referral.id.as_uuid())
            .bind(referral.event_id.as_uuid())
            .bind(referral.referrer_registration_id.as_uuid())
            .bind(referral.registration_id.as_uuid())
            .bind(referral.used_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("insert referral usage", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;

        Ok(ReservationOutcome::Admitted {
            registration: registration.clone(),
            counters,
        })
    }

    async fn insert_registration(
        tx: &mut Transaction<'static, Postgres>,
        registration: &Registration,
    ) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO registrations ({REGISTRATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(registration.id.as_uuid())
        .bind(registration.event_id.as_uuid())
        .bind(registration.ticket_id.as_uuid())
        .bind(&registration.email)
        .bind(registration.user_id)
        .bind(&registration.phone)
        .bind(registration.invitation_code_id.map(|id| *id.as_uuid()))
        .bind(&registration.referral_code)
        .bind(&registration.referred_by)
        .bind(registration.form_data.to_json())
        .bind(registration.status.as_str())
        .bind(registration.idempotency_key.as_ref().map(IdempotencyKey::as_str))
        .bind(registration.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation_of(&e, IDEMPOTENCY_CONSTRAINT) {
                let key = registration
                    .idempotency_key
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                return StoreError::DuplicateIdempotencyKey(key);
            }
            if is_unique_violation_of(&e, REFERRAL_CODE_CONSTRAINT) {
                return StoreError::DuplicateReferralCode(registration.referral_code.clone());
            }
            map_sqlx("insert registration", e)
        })?;
        Ok(())
    }

    async fn run_cancel(
        &self,
        registration_id: RegistrationId,
    ) -> Result<CancellationOutcome, StoreError> {
        let not_found = || StoreError::NotFound {
            entity: "registration",
            id: registration_id.to_string(),
        };

        let mut tx = self.begin().await?;

        let ticket_id: uuid::Uuid =
            sqlx::query_scalar("SELECT ticket_id FROM registrations WHERE id = $1")
                .bind(registration_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx("find registration", e))?
                .ok_or_else(not_found)?;
        let ticket_id = TicketId::from_uuid(ticket_id);

        // Same lock order as admission: ticket first.
        Self::lock_ticket(&mut tx, ticket_id).await?;
        let row = sqlx::query(&format!(
            "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1 FOR UPDATE"
        ))
        .bind(registration_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx("lock registration", e))?
        .ok_or_else(not_found)?;
        let mut registration = rows::registration(&row)?;

        if registration.status == RegistrationStatus::Cancelled {
            tx.rollback().await.map_err(|e| map_sqlx("rollback", e))?;
            return Ok(CancellationOutcome::AlreadyCancelled(registration));
        }

        sqlx::query("UPDATE registrations SET status = 'cancelled' WHERE id = $1")
            .bind(registration_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("cancel registration", e))?;
        let sold: i32 = sqlx::query_scalar(
            r"
            UPDATE tickets
            SET sold_count = GREATEST(sold_count - 1, 0)
            WHERE id = $1
            RETURNING sold_count
            ",
        )
        .bind(ticket_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx("release slot", e))?;

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;

        registration.status = RegistrationStatus::Cancelled;
        Ok(CancellationOutcome::Cancelled {
            registration,
            ticket_sold_count: counter("sold_count", sold)?,
        })
    }

    async fn fetch_registration(
        &self,
        query: Query<'_, Postgres, PgArguments>,
    ) -> Result<Option<Registration>, StoreError> {
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("load registration", e))?
            .as_ref()
            .map(rows::registration)
            .transpose()
    }
}

impl AdmissionStore for PostgresAdmissionStore {
    fn load_ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            sqlx::query(&format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = $1"))
                .bind(ticket_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx("load ticket", e))?
                .as_ref()
                .map(rows::ticket)
                .transpose()
        })
    }

    fn find_invitation_code<'a>(
        &'a self,
        event_id: EventId,
        code: &'a str,
    ) -> StoreFuture<'a, Option<InvitationCode>> {
        Box::pin(async move {
            sqlx::query(&format!(
                "SELECT {CODE_COLUMNS} FROM invitation_codes WHERE event_id = $1 AND code = $2"
            ))
            .bind(event_id.as_uuid())
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx("find invitation code", e))?
            .as_ref()
            .map(rows::invitation_code)
            .transpose()
        })
    }

    fn find_registration_by_referral_code<'a>(
        &'a self,
        event_id: EventId,
        referral_code: &'a str,
    ) -> StoreFuture<'a, Option<Registration>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {REGISTRATION_COLUMNS} FROM registrations \
                 WHERE event_id = $1 AND referral_code = $2"
            );
            self.fetch_registration(
                sqlx::query(&sql)
                    .bind(*event_id.as_uuid())
                    .bind(referral_code),
            )
            .await
        })
    }

    fn find_registration_by_idempotency_key<'a>(
        &'a self,
        key: &'a IdempotencyKey,
    ) -> StoreFuture<'a, Option<Registration>> {
        Box::pin(async move {
            let sql =
                format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE idempotency_key = $1");
            self.fetch_registration(sqlx::query(&sql).bind(key.as_str()))
                .await
        })
    }

    fn get_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, Option<Registration>> {
        Box::pin(async move {
            let sql = format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = $1");
            self.fetch_registration(sqlx::query(&sql).bind(*registration_id.as_uuid()))
                .await
        })
    }

    fn reserve<'a>(
        &'a self,
        claim: &'a ReservationClaim,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ReservationOutcome> {
        Box::pin(self.run_reserve(claim, now))
    }

    fn cancel_registration(
        &self,
        registration_id: RegistrationId,
    ) -> StoreFuture<'_, CancellationOutcome> {
        Box::pin(self.run_cancel(registration_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = StoreSettings::default();
        assert_eq!(settings.max_connections, 10);
        assert_eq!(settings.min_connections, 2);
        assert_eq!(settings.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn registration_columns_match_insert_arity() {
        assert_eq!(REGISTRATION_COLUMNS.split(',').count(), 13);
    }
}
