//! PostgreSQL ledger using sqlx
//!
//! Monotonic status and the single end stamp are enforced in the `WHERE`
//! clause of each update, so they hold across server instances too.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;

use crate::models::*;
use crate::server::markup::Markup;
use super::{CallTurn, Ledger, LedgerResult};

const CONTACT_COLUMNS: &str = "id, business_id, phone, phone_key, first_name, last_name, email, \
     contact_type, relationship_status, source, total_calls, total_sms, last_contacted_at, created_at";

const CALL_COLUMNS: &str = "id, business_id, call_sid, from_number, to_number, direction, status, phase, \
     contact_id, started_at, ended_at, duration_seconds, transcript, handled_by, transfer_target, \
     recording_url, recording_duration, summary, appointment_at, updated_at";

const SMS_COLUMNS: &str = "id, business_id, message_sid, thread_id, direction, from_number, to_number, \
     body, status, contact_id, is_auto_response, in_reply_to, analysis, created_at, updated_at";

const BUSINESS_COLUMNS: &str = "id, name, phone_number, personality, timezone, hours, \
     forwarding_number, greeting, voicemail_prompt, auto_response_enabled";

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the pool and apply embedded migrations.
    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| super::LedgerError::Unavailable(e.to_string()))?;

        Ok(Self::new(pool))
    }

    /// Create or refresh a business profile keyed by its phone number.
    pub async fn upsert_business(&self, business: &BusinessProfile) -> LedgerResult<BusinessProfile> {
        let row = sqlx::query_as::<_, BusinessRow>(&format!(
            r"
            INSERT INTO businesses (name, phone_number, phone_key, personality, timezone, hours,
                                    forwarding_number, greeting, voicemail_prompt, auto_response_enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (phone_key) DO UPDATE SET
                name = EXCLUDED.name,
                personality = EXCLUDED.personality,
                timezone = EXCLUDED.timezone,
                hours = EXCLUDED.hours,
                forwarding_number = EXCLUDED.forwarding_number,
                greeting = EXCLUDED.greeting,
                voicemail_prompt = EXCLUDED.voicemail_prompt,
                auto_response_enabled = EXCLUDED.auto_response_enabled
            RETURNING {BUSINESS_COLUMNS}
            "
        ))
        .bind(&business.name)
        .bind(&business.phone_number)
        .bind(crate::server::contacts::phone_key(&business.phone_number))
        .bind(&business.personality)
        .bind(&business.timezone)
        .bind(business.hours.clone().map(Json))
        .bind(&business.forwarding_number)
        .bind(&business.greeting)
        .bind(&business.voicemail_prompt)
        .bind(business.auto_response_enabled)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }
}

#[async_trait::async_trait]
impl Ledger for PgLedger {
    async fn find_business_by_number(&self, number: &str) -> LedgerResult<Option<BusinessProfile>> {
        let key = crate::server::contacts::phone_key(number);
        if key.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, BusinessRow>(&format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses WHERE phone_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_business(&self, id: i64) -> LedgerResult<Option<BusinessProfile>> {
        let row = sqlx::query_as::<_, BusinessRow>(&format!(
            "SELECT {BUSINESS_COLUMNS} FROM businesses WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_contact(&self, business_id: i64, phone_key: &str) -> LedgerResult<Option<Contact>> {
        let row = sqlx::query_as::<_, ContactRow>(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE business_id = $1 AND phone_key = $2"
        ))
        .bind(business_id)
        .bind(phone_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_contact_if_absent(&self, contact: NewContact) -> LedgerResult<Contact> {
        let inserted = sqlx::query_as::<_, ContactRow>(&format!(
            r"
            INSERT INTO contacts (business_id, phone, phone_key, first_name, contact_type,
                                  relationship_status, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (business_id, phone_key) DO NOTHING
            RETURNING {CONTACT_COLUMNS}
            "
        ))
        .bind(contact.business_id)
        .bind(&contact.phone)
        .bind(&contact.phone_key)
        .bind(PLACEHOLDER_FIRST_NAME)
        .bind(ContactType::Lead.as_str())
        .bind(RelationshipStatus::Cold.as_str())
        .bind(contact.source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(row.into()),
            // Lost the race; the winner's row is there now
            None => self
                .find_contact(contact.business_id, &contact.phone_key)
                .await?
                .ok_or_else(|| super::LedgerError::NotFound(format!("contact {}", contact.phone_key))),
        }
    }

    async fn record_interaction(
        &self,
        contact_id: i64,
        kind: InteractionKind,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let sql = match kind {
            InteractionKind::Call => {
                "UPDATE contacts SET total_calls = total_calls + 1, last_contacted_at = $2 WHERE id = $1"
            }
            InteractionKind::Sms => {
                "UPDATE contacts SET total_sms = total_sms + 1, last_contacted_at = $2 WHERE id = $1"
            }
        };
        sqlx::query(sql)
            .bind(contact_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_contact_identity(
        &self,
        contact_id: i64,
        first_name: Option<&str>,
        last_name: Option<&str>,
        email: Option<&str>,
    ) -> LedgerResult<Option<Contact>> {
        let row = sqlx::query_as::<_, ContactRow>(&format!(
            r"
            UPDATE contacts SET
                first_name = COALESCE($2, first_name),
                last_name = COALESCE($3, last_name),
                email = COALESCE($4, email)
            WHERE id = $1
            RETURNING {CONTACT_COLUMNS}
            "
        ))
        .bind(contact_id)
        .bind(first_name)
        .bind(last_name)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn create_call_if_absent(&self, call: NewCall) -> LedgerResult<(CallSession, bool)> {
        let inserted = sqlx::query_as::<_, CallRow>(&format!(
            r"
            INSERT INTO calls (business_id, call_sid, from_number, to_number, direction, status,
                               phase, contact_id, handled_by)
            VALUES ($1, $2, $3, $4, $5, 'answered', $6, $7, $8)
            ON CONFLICT (call_sid) DO NOTHING
            RETURNING {CALL_COLUMNS}
            "
        ))
        .bind(call.business_id)
        .bind(&call.call_sid)
        .bind(&call.from_number)
        .bind(&call.to_number)
        .bind(call.direction.as_str())
        .bind(call.phase.as_str())
        .bind(call.contact_id)
        .bind(call.handled_by.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = self
            .get_call(&call.call_sid)
            .await?
            .ok_or_else(|| super::LedgerError::NotFound(format!("call {}", call.call_sid)))?;
        Ok((existing, false))
    }

    async fn get_call(&self, call_sid: &str) -> LedgerResult<Option<CallSession>> {
        let row = sqlx::query_as::<_, CallRow>(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE call_sid = $1"
        ))
        .bind(call_sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn append_transcript(&self, call_sid: &str, fragment: &str) -> LedgerResult<Option<CallSession>> {
        let row = sqlx::query_as::<_, CallRow>(&format!(
            r"
            UPDATE calls SET
                transcript = CASE WHEN transcript = '' THEN $2 ELSE transcript || E'\n' || $2 END,
                updated_at = NOW()
            WHERE call_sid = $1
            RETURNING {CALL_COLUMNS}
            "
        ))
        .bind(call_sid)
        .bind(fragment)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn begin_turn(&self, call_sid: &str, key: &str) -> LedgerResult<Option<CallTurn>> {
        let started = sqlx::query(
            r"
            UPDATE calls SET last_turn_key = $2, last_turn_reply = NULL
            WHERE call_sid = $1 AND last_turn_key IS DISTINCT FROM $2
            ",
        )
        .bind(call_sid)
        .bind(key)
        .execute(&self.pool)
        .await?;
        if started.rows_affected() > 0 {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, TurnRow>(
            "SELECT last_turn_key, last_turn_reply FROM calls WHERE call_sid = $1",
        )
        .bind(call_sid)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(TurnRow {
                last_turn_key: Some(key),
                last_turn_reply,
            }) => Ok(Some(CallTurn {
                key,
                reply: last_turn_reply.map(|Json(markup)| markup),
            })),
            _ => Err(super::LedgerError::NotFound(format!("call {}", call_sid))),
        }
    }

    async fn finish_turn(&self, call_sid: &str, key: &str, reply: &Markup) -> LedgerResult<()> {
        sqlx::query("UPDATE calls SET last_turn_reply = $3 WHERE call_sid = $1 AND last_turn_key = $2")
            .bind(call_sid)
            .bind(key)
            .bind(Json(reply))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_call(&self, call_sid: &str, update: &CallUpdate) -> LedgerResult<Option<CallSession>> {
        let predecessors: Vec<String> = update
            .status
            .map(CallStatus::predecessors_of)
            .unwrap_or_default()
            .into_iter()
            .map(String::from)
            .collect();

        let row = sqlx::query_as::<_, CallRow>(&format!(
            r"
            UPDATE calls SET
                status = CASE WHEN $2::text IS NOT NULL AND status = ANY($3) THEN $2 ELSE status END,
                phase = COALESCE($4, phase),
                handled_by = COALESCE($5, handled_by),
                transfer_target = COALESCE($6, transfer_target),
                recording_url = COALESCE($7, recording_url),
                recording_duration = COALESCE($8, recording_duration),
                summary = COALESCE($9, summary),
                appointment_at = COALESCE($10, appointment_at),
                updated_at = NOW()
            WHERE call_sid = $1
            RETURNING {CALL_COLUMNS}
            "
        ))
        .bind(call_sid)
        .bind(update.status.map(|s| s.as_str()))
        .bind(predecessors)
        .bind(update.phase.map(|p| p.as_str()))
        .bind(update.handled_by.map(|h| h.as_str()))
        .bind(&update.transfer_target)
        .bind(&update.recording_url)
        .bind(update.recording_duration)
        .bind(update.summary.clone().map(Json))
        .bind(update.appointment_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn stamp_call_ended(
        &self,
        call_sid: &str,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        provider_duration: Option<i32>,
    ) -> LedgerResult<Option<CallSession>> {
        let predecessors: Vec<String> = CallStatus::predecessors_of(status)
            .into_iter()
            .map(String::from)
            .collect();

        let row = sqlx::query_as::<_, CallRow>(&format!(
            r"
            UPDATE calls SET
                status = $2,
                ended_at = $3,
                duration_seconds = COALESCE($4, GREATEST(0, EXTRACT(EPOCH FROM ($3 - started_at)))::int),
                phase = 'completed',
                updated_at = NOW()
            WHERE call_sid = $1 AND ended_at IS NULL AND status = ANY($5)
            RETURNING {CALL_COLUMNS}
            "
        ))
        .bind(call_sid)
        .bind(status.as_str())
        .bind(ended_at)
        .bind(provider_duration)
        .bind(predecessors)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_sms_if_absent(&self, sms: NewSms) -> LedgerResult<(SmsMessage, bool)> {
        let inserted = sqlx::query_as::<_, SmsRow>(&format!(
            r"
            INSERT INTO sms_messages (business_id, message_sid, thread_id, direction, from_number,
                                      to_number, body, status, contact_id, is_auto_response, in_reply_to)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (message_sid) DO NOTHING
            RETURNING {SMS_COLUMNS}
            "
        ))
        .bind(sms.business_id)
        .bind(&sms.message_sid)
        .bind(&sms.thread_id)
        .bind(sms.direction.as_str())
        .bind(&sms.from_number)
        .bind(&sms.to_number)
        .bind(&sms.body)
        .bind(sms.status.as_str())
        .bind(sms.contact_id)
        .bind(sms.is_auto_response)
        .bind(sms.in_reply_to)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let sid = sms.message_sid.unwrap_or_default();
        let existing = self
            .get_sms_by_sid(&sid)
            .await?
            .ok_or_else(|| super::LedgerError::NotFound(format!("sms {}", sid)))?;
        Ok((existing, false))
    }

    async fn get_sms_by_sid(&self, message_sid: &str) -> LedgerResult<Option<SmsMessage>> {
        let row = sqlx::query_as::<_, SmsRow>(&format!(
            "SELECT {SMS_COLUMNS} FROM sms_messages WHERE message_sid = $1"
        ))
        .bind(message_sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_auto_reply(&self, inbound_id: i64) -> LedgerResult<Option<SmsMessage>> {
        let row = sqlx::query_as::<_, SmsRow>(&format!(
            r"
            SELECT {SMS_COLUMNS} FROM sms_messages
            WHERE in_reply_to = $1 AND is_auto_response
            ORDER BY id
            LIMIT 1
            "
        ))
        .bind(inbound_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn assign_sms_sid(&self, id: i64, message_sid: &str) -> LedgerResult<Option<SmsMessage>> {
        let row = sqlx::query_as::<_, SmsRow>(&format!(
            r"
            UPDATE sms_messages SET message_sid = $2, updated_at = NOW()
            WHERE id = $1 AND message_sid IS NULL
              AND NOT EXISTS (SELECT 1 FROM sms_messages WHERE message_sid = $2)
            RETURNING {SMS_COLUMNS}
            "
        ))
        .bind(id)
        .bind(message_sid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn update_sms_status(&self, message_sid: &str, status: SmsStatus) -> LedgerResult<Option<SmsMessage>> {
        let predecessors: Vec<String> = SmsStatus::predecessors_of(status)
            .into_iter()
            .map(String::from)
            .collect();

        let row = sqlx::query_as::<_, SmsRow>(&format!(
            r"
            UPDATE sms_messages SET status = $2, updated_at = NOW()
            WHERE message_sid = $1 AND status = ANY($3)
            RETURNING {SMS_COLUMNS}
            "
        ))
        .bind(message_sid)
        .bind(status.as_str())
        .bind(predecessors)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn set_sms_analysis(&self, id: i64, analysis: &SmsAnalysis) -> LedgerResult<()> {
        sqlx::query("UPDATE sms_messages SET analysis = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(Json(analysis))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn book_appointment(&self, appointment: NewAppointment) -> LedgerResult<Appointment> {
        let row = sqlx::query_as::<_, AppointmentRow>(
            r"
            INSERT INTO appointments (business_id, contact_id, call_sid, starts_at, status, notes)
            VALUES ($1, $2, $3, $4, 'scheduled', $5)
            RETURNING id, business_id, contact_id, call_sid, starts_at, status, notes, created_at
            ",
        )
        .bind(appointment.business_id)
        .bind(appointment.contact_id)
        .bind(&appointment.call_sid)
        .bind(appointment.starts_at)
        .bind(&appointment.notes)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}

// ============== Row types ==============

#[derive(sqlx::FromRow)]
struct BusinessRow {
    id: i64,
    name: String,
    phone_number: String,
    personality: String,
    timezone: String,
    hours: Option<Json<WeeklyHours>>,
    forwarding_number: Option<String>,
    greeting: Option<String>,
    voicemail_prompt: Option<String>,
    auto_response_enabled: bool,
}

impl From<BusinessRow> for BusinessProfile {
    fn from(row: BusinessRow) -> Self {
        BusinessProfile {
            id: row.id,
            name: row.name,
            phone_number: row.phone_number,
            personality: row.personality,
            timezone: row.timezone,
            hours: row.hours.map(|h| h.0),
            forwarding_number: row.forwarding_number,
            greeting: row.greeting,
            voicemail_prompt: row.voicemail_prompt,
            auto_response_enabled: row.auto_response_enabled,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ContactRow {
    id: i64,
    business_id: i64,
    phone: String,
    phone_key: String,
    first_name: String,
    last_name: Option<String>,
    email: Option<String>,
    contact_type: String,
    relationship_status: String,
    source: String,
    total_calls: i32,
    total_sms: i32,
    last_contacted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: row.id,
            business_id: row.business_id,
            phone: row.phone,
            phone_key: row.phone_key,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            contact_type: ContactType::parse(&row.contact_type),
            relationship_status: RelationshipStatus::parse(&row.relationship_status),
            source: ContactSource::parse(&row.source),
            total_calls: row.total_calls,
            total_sms: row.total_sms,
            last_contacted_at: row.last_contacted_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TurnRow {
    last_turn_key: Option<String>,
    last_turn_reply: Option<Json<Markup>>,
}

#[derive(sqlx::FromRow)]
struct CallRow {
    id: i64,
    business_id: i64,
    call_sid: String,
    from_number: String,
    to_number: String,
    direction: String,
    status: String,
    phase: String,
    contact_id: Option<i64>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i32>,
    transcript: String,
    handled_by: String,
    transfer_target: Option<String>,
    recording_url: Option<String>,
    recording_duration: Option<i32>,
    summary: Option<Json<CallSummary>>,
    appointment_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<CallRow> for CallSession {
    fn from(row: CallRow) -> Self {
        CallSession {
            id: row.id,
            business_id: row.business_id,
            call_sid: row.call_sid,
            from_number: row.from_number,
            to_number: row.to_number,
            direction: CallDirection::from_provider(&row.direction),
            status: CallStatus::from_provider(&row.status).unwrap_or(CallStatus::Queued),
            phase: CallPhase::parse(&row.phase).unwrap_or(CallPhase::Ringing),
            contact_id: row.contact_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_seconds: row.duration_seconds,
            transcript: row.transcript,
            handled_by: HandledBy::parse(&row.handled_by).unwrap_or(HandledBy::Ai),
            transfer_target: row.transfer_target,
            recording_url: row.recording_url,
            recording_duration: row.recording_duration,
            summary: row.summary.map(|s| s.0),
            appointment_at: row.appointment_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SmsRow {
    id: i64,
    business_id: i64,
    message_sid: Option<String>,
    thread_id: String,
    direction: String,
    from_number: String,
    to_number: String,
    body: String,
    status: String,
    contact_id: Option<i64>,
    is_auto_response: bool,
    in_reply_to: Option<i64>,
    analysis: Option<Json<SmsAnalysis>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SmsRow> for SmsMessage {
    fn from(row: SmsRow) -> Self {
        SmsMessage {
            id: row.id,
            business_id: row.business_id,
            message_sid: row.message_sid,
            thread_id: row.thread_id,
            direction: if row.direction == "outbound" {
                SmsDirection::Outbound
            } else {
                SmsDirection::Inbound
            },
            from_number: row.from_number,
            to_number: row.to_number,
            body: row.body,
            status: SmsStatus::from_provider(&row.status).unwrap_or(SmsStatus::Received),
            contact_id: row.contact_id,
            is_auto_response: row.is_auto_response,
            in_reply_to: row.in_reply_to,
            analysis: row.analysis.map(|a| a.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AppointmentRow {
    id: i64,
    business_id: i64,
    contact_id: Option<i64>,
    call_sid: Option<String>,
    starts_at: DateTime<Utc>,
    status: String,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<AppointmentRow> for Appointment {
    fn from(row: AppointmentRow) -> Self {
        Appointment {
            id: row.id,
            business_id: row.business_id,
            contact_id: row.contact_id,
            call_sid: row.call_sid,
            starts_at: row.starts_at,
            status: row.status,
            notes: row.notes,
            created_at: row.created_at,
        }
    }
}
