//! Call/message ledger
//!
//! Durable record of calls, messages, contacts and appointments. Every write
//! that must not race (status moves, end stamp, first insert) is conditional
//! inside the store itself, so two webhook deliveries for the same id cannot
//! both apply it.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::*;
use super::markup::Markup;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    // Businesses

    /// Business whose line was dialed; numbers compare by phone key.
    async fn find_business_by_number(&self, number: &str) -> LedgerResult<Option<BusinessProfile>>;

    async fn get_business(&self, id: i64) -> LedgerResult<Option<BusinessProfile>>;

    // Contacts

    async fn find_contact(&self, business_id: i64, phone_key: &str) -> LedgerResult<Option<Contact>>;

    /// Insert unless (business, phone key) exists; either way return the stored row.
    async fn insert_contact_if_absent(&self, contact: NewContact) -> LedgerResult<Contact>;

    /// Bump `totalCalls` or `totalSms` and `lastContactedAt`.
    async fn record_interaction(
        &self,
        contact_id: i64,
        kind: InteractionKind,
        at: DateTime<Utc>,
    ) -> LedgerResult<()>;

    /// Fill in name/email. `None` leaves a field unchanged.
    async fn update_contact_identity(
        &self,
        contact_id: i64,
        first_name: Option<&str>,
        last_name: Option<&str>,
        email: Option<&str>,
    ) -> LedgerResult<Option<Contact>>;

    // Calls

    /// Returns the stored call and whether this request created it.
    async fn create_call_if_absent(&self, call: NewCall) -> LedgerResult<(CallSession, bool)>;

    async fn get_call(&self, call_sid: &str) -> LedgerResult<Option<CallSession>>;

    async fn append_transcript(&self, call_sid: &str, fragment: &str) -> LedgerResult<Option<CallSession>>;

    /// Apply `update`. A status is applied only when it moves strictly forward.
    async fn update_call(&self, call_sid: &str, update: &CallUpdate) -> LedgerResult<Option<CallSession>>;

    /// Set terminal status, end time and duration once. `Some` only for the
    /// request that actually applied the stamp.
    async fn stamp_call_ended(
        &self,
        call_sid: &str,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        provider_duration: Option<i32>,
    ) -> LedgerResult<Option<CallSession>>;

    /// Start a caller turn keyed by `key`. A key equal to the call's last
    /// turn returns that turn instead and changes nothing.
    async fn begin_turn(&self, call_sid: &str, key: &str) -> LedgerResult<Option<CallTurn>>;

    /// Store the reply of a turn, unless a newer turn has replaced it.
    async fn finish_turn(&self, call_sid: &str, key: &str, reply: &Markup) -> LedgerResult<()>;

    // Messages

    /// Idempotent by provider message id when present.
    async fn insert_sms_if_absent(&self, sms: NewSms) -> LedgerResult<(SmsMessage, bool)>;

    async fn get_sms_by_sid(&self, message_sid: &str) -> LedgerResult<Option<SmsMessage>>;

    async fn find_auto_reply(&self, inbound_id: i64) -> LedgerResult<Option<SmsMessage>>;

    /// Attach the provider id to an outbound message stored before it was sent.
    /// Never overwrites an id already set.
    async fn assign_sms_sid(&self, id: i64, message_sid: &str) -> LedgerResult<Option<SmsMessage>>;

    /// Monotonic delivery status. `Some` only when the status changed.
    async fn update_sms_status(&self, message_sid: &str, status: SmsStatus) -> LedgerResult<Option<SmsMessage>>;

    async fn set_sms_analysis(&self, id: i64, analysis: &SmsAnalysis) -> LedgerResult<()>;

    // Appointments

    async fn book_appointment(&self, appointment: NewAppointment) -> LedgerResult<Appointment>;
}

/// Last caller turn of a call. `reply` is `None` while the decision is pending.
#[derive(Debug, Clone, PartialEq)]
pub struct CallTurn {
    pub key: String,
    pub reply: Option<Markup>,
}

/// A ledger write that failed and was not retried.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MissedWrite {
    pub operation: &'static str,
    pub key: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Failed writes kept for reconciliation. Only the most recent are retained;
/// `total` counts all of them.
pub struct MissedWrites {
    recent: Mutex<VecDeque<MissedWrite>>,
    total: AtomicU64,
    capacity: usize,
}

impl MissedWrites {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            total: AtomicU64::new(0),
            capacity,
        }
    }

    pub async fn record(&self, operation: &'static str, key: &str, error: &LedgerError) {
        tracing::error!("Ledger write {} for {} failed: {}", operation, key, error);
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut recent = self.recent.lock().await;
        if recent.len() == self.capacity {
            recent.pop_front();
        }
        recent.push_back(MissedWrite {
            operation,
            key: key.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub async fn recent(&self) -> Vec<MissedWrite> {
        self.recent.lock().await.iter().cloned().collect()
    }
}
