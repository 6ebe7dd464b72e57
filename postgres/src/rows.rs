//! Column lists and row decoding.

use crate::error::{counter, map_sqlx};
use admission_core::error::StoreError;
use admission_core::types::{
    EventId, FormData, IdempotencyKey, InvitationCode, InvitationCodeId, Registration,
    RegistrationId, RegistrationStatus, Ticket, TicketId,
};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

pub(crate) const TICKET_COLUMNS: &str = "id, event_id, name, quantity, sold_count, sale_start, \
     sale_end, require_invite_code, require_sms_verification, requires_approval, is_active";

pub(crate) const CODE_COLUMNS: &str = "id, event_id, ticket_id, code, usage_limit, used_count, \
     valid_from, valid_until, is_active";

pub(crate) const REGISTRATION_COLUMNS: &str = "id, event_id, ticket_id, email, user_id, phone, \
     invitation_code_id, referral_code, referred_by, form_data, status, idempotency_key, created_at";

fn get<'r, T>(row: &'r PgRow, column: &'static str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| map_sqlx(&format!("decode column {column}"), e))
}

pub(crate) fn ticket(row: &PgRow) -> Result<Ticket, StoreError> {
    Ok(Ticket {
        id: TicketId::from_uuid(get(row, "id")?),
        event_id: EventId::from_uuid(get(row, "event_id")?),
        name: get(row, "name")?,
        quantity: counter("quantity", get(row, "quantity")?)?,
        sold_count: counter("sold_count", get(row, "sold_count")?)?,
        sale_start: get(row, "sale_start")?,
        sale_end: get(row, "sale_end")?,
        require_invite_code: get(row, "require_invite_code")?,
        require_sms_verification: get(row, "require_sms_verification")?,
        requires_approval: get(row, "requires_approval")?,
        is_active: get(row, "is_active")?,
    })
}

pub(crate) fn invitation_code(row: &PgRow) -> Result<InvitationCode, StoreError> {
    let usage_limit: Option<i32> = get(row, "usage_limit")?;
    Ok(InvitationCode {
        id: InvitationCodeId::from_uuid(get(row, "id")?),
        event_id: EventId::from_uuid(get(row, "event_id")?),
        ticket_id: TicketId::from_uuid(get(row, "ticket_id")?),
        code: get(row, "code")?,
        usage_limit: usage_limit
            .map(|limit| counter("usage_limit", limit))
            .transpose()?,
        used_count: counter("used_count", get(row, "used_count")?)?,
        valid_from: get(row, "valid_from")?,
        valid_until: get(row, "valid_until")?,
        is_active: get(row, "is_active")?,
    })
}

pub(crate) fn registration(row: &PgRow) -> Result<Registration, StoreError> {
    let status: String = get(row, "status")?;
    let status = RegistrationStatus::parse(&status)
        .ok_or_else(|| StoreError::Database(format!("unknown registration status {status}")))?;
    let idempotency_key: Option<String> = get(row, "idempotency_key")?;
    let idempotency_key = idempotency_key
        .map(IdempotencyKey::parse)
        .transpose()
        .map_err(|e| StoreError::Database(format!("stored idempotency key is invalid: {e}")))?;
    let invitation_code_id: Option<Uuid> = get(row, "invitation_code_id")?;
    let created_at: DateTime<Utc> = get(row, "created_at")?;

    Ok(Registration {
        id: RegistrationId::from_uuid(get(row, "id")?),
        event_id: EventId::from_uuid(get(row, "event_id")?),
        ticket_id: TicketId::from_uuid(get(row, "ticket_id")?),
        email: get(row, "email")?,
        user_id: get(row, "user_id")?,
        phone: get(row, "phone")?,
        invitation_code_id: invitation_code_id.map(InvitationCodeId::from_uuid),
        referral_code: get(row, "referral_code")?,
        referred_by: get(row, "referred_by")?,
        form_data: FormData::from_json(get(row, "form_data")?),
        status,
        idempotency_key,
        created_at,
    })
}
