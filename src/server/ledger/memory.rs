//! In-memory ledger for tests and local runs without a database.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::*;
use crate::server::contacts::phone_key;
use crate::server::markup::Markup;
use super::{CallTurn, Ledger, LedgerError, LedgerResult};

#[derive(Default)]
struct Tables {
    businesses: Vec<BusinessProfile>,
    contacts: HashMap<i64, Contact>,
    calls: HashMap<String, CallSession>,
    turns: HashMap<String, CallTurn>,
    sms: Vec<SmsMessage>,
    appointments: Vec<Appointment>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_business(business: BusinessProfile) -> Self {
        Self {
            tables: RwLock::new(Tables {
                businesses: vec![business],
                ..Tables::default()
            }),
        }
    }

    #[cfg(test)]
    pub async fn add_business(&self, business: BusinessProfile) {
        self.tables.write().await.businesses.push(business);
    }

    #[cfg(test)]
    pub async fn appointments(&self) -> Vec<Appointment> {
        self.tables.read().await.appointments.clone()
    }

    #[cfg(test)]
    pub async fn messages(&self) -> Vec<SmsMessage> {
        self.tables.read().await.sms.clone()
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn find_business_by_number(&self, number: &str) -> LedgerResult<Option<BusinessProfile>> {
        let key = phone_key(number);
        if key.is_empty() {
            return Ok(None);
        }
        let tables = self.tables.read().await;
        Ok(tables
            .businesses
            .iter()
            .find(|b| phone_key(&b.phone_number) == key)
            .cloned())
    }

    async fn get_business(&self, id: i64) -> LedgerResult<Option<BusinessProfile>> {
        let tables = self.tables.read().await;
        Ok(tables.businesses.iter().find(|b| b.id == id).cloned())
    }

    async fn find_contact(&self, business_id: i64, phone_key: &str) -> LedgerResult<Option<Contact>> {
        let tables = self.tables.read().await;
        Ok(tables
            .contacts
            .values()
            .find(|c| c.business_id == business_id && c.phone_key == phone_key)
            .cloned())
    }

    async fn insert_contact_if_absent(&self, contact: NewContact) -> LedgerResult<Contact> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .contacts
            .values()
            .find(|c| c.business_id == contact.business_id && c.phone_key == contact.phone_key)
        {
            return Ok(existing.clone());
        }

        let id = tables.next_id();
        let row = Contact {
            id,
            business_id: contact.business_id,
            phone: contact.phone,
            phone_key: contact.phone_key,
            first_name: PLACEHOLDER_FIRST_NAME.to_string(),
            last_name: None,
            email: None,
            contact_type: ContactType::Lead,
            relationship_status: RelationshipStatus::Cold,
            source: contact.source,
            total_calls: 0,
            total_sms: 0,
            last_contacted_at: None,
            created_at: Utc::now(),
        };
        tables.contacts.insert(id, row.clone());
        Ok(row)
    }

    async fn record_interaction(
        &self,
        contact_id: i64,
        kind: InteractionKind,
        at: DateTime<Utc>,
    ) -> LedgerResult<()> {
        let mut tables = self.tables.write().await;
        let contact = tables
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| LedgerError::NotFound(format!("contact {}", contact_id)))?;
        match kind {
            InteractionKind::Call => contact.total_calls += 1,
            InteractionKind::Sms => contact.total_sms += 1,
        }
        contact.last_contacted_at = Some(at);
        Ok(())
    }

    async fn update_contact_identity(
        &self,
        contact_id: i64,
        first_name: Option<&str>,
        last_name: Option<&str>,
        email: Option<&str>,
    ) -> LedgerResult<Option<Contact>> {
        let mut tables = self.tables.write().await;
        let Some(contact) = tables.contacts.get_mut(&contact_id) else {
            return Ok(None);
        };
        if let Some(first) = first_name {
            contact.first_name = first.to_string();
        }
        if let Some(last) = last_name {
            contact.last_name = Some(last.to_string());
        }
        if let Some(email) = email {
            contact.email = Some(email.to_string());
        }
        Ok(Some(contact.clone()))
    }

    async fn create_call_if_absent(&self, call: NewCall) -> LedgerResult<(CallSession, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.calls.get(&call.call_sid) {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let id = tables.next_id();
        let row = CallSession {
            id,
            business_id: call.business_id,
            call_sid: call.call_sid.clone(),
            from_number: call.from_number,
            to_number: call.to_number,
            direction: call.direction,
            status: CallStatus::Answered,
            phase: call.phase,
            contact_id: call.contact_id,
            started_at: now,
            ended_at: None,
            duration_seconds: None,
            transcript: String::new(),
            handled_by: call.handled_by,
            transfer_target: None,
            recording_url: None,
            recording_duration: None,
            summary: None,
            appointment_at: None,
            updated_at: now,
        };
        tables.calls.insert(call.call_sid, row.clone());
        Ok((row, true))
    }

    async fn get_call(&self, call_sid: &str) -> LedgerResult<Option<CallSession>> {
        Ok(self.tables.read().await.calls.get(call_sid).cloned())
    }

    async fn append_transcript(&self, call_sid: &str, fragment: &str) -> LedgerResult<Option<CallSession>> {
        let mut tables = self.tables.write().await;
        let Some(call) = tables.calls.get_mut(call_sid) else {
            return Ok(None);
        };
        call.append_transcript(fragment);
        call.updated_at = Utc::now();
        Ok(Some(call.clone()))
    }

    async fn begin_turn(&self, call_sid: &str, key: &str) -> LedgerResult<Option<CallTurn>> {
        let mut tables = self.tables.write().await;
        if !tables.calls.contains_key(call_sid) {
            return Err(LedgerError::NotFound(format!("call {}", call_sid)));
        }
        if let Some(turn) = tables.turns.get(call_sid).filter(|t| t.key == key) {
            return Ok(Some(turn.clone()));
        }
        tables.turns.insert(
            call_sid.to_string(),
            CallTurn {
                key: key.to_string(),
                reply: None,
            },
        );
        Ok(None)
    }

    async fn finish_turn(&self, call_sid: &str, key: &str, reply: &Markup) -> LedgerResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(turn) = tables.turns.get_mut(call_sid).filter(|t| t.key == key) {
            turn.reply = Some(reply.clone());
        }
        Ok(())
    }

    async fn update_call(&self, call_sid: &str, update: &CallUpdate) -> LedgerResult<Option<CallSession>> {
        let mut tables = self.tables.write().await;
        let Some(call) = tables.calls.get_mut(call_sid) else {
            return Ok(None);
        };

        if let Some(status) = update.status {
            if call.status.can_advance_to(status) {
                call.status = status;
            }
        }
        if let Some(phase) = update.phase {
            call.phase = phase;
        }
        if let Some(handled_by) = update.handled_by {
            call.handled_by = handled_by;
        }
        if let Some(target) = &update.transfer_target {
            call.transfer_target = Some(target.clone());
        }
        if let Some(url) = &update.recording_url {
            call.recording_url = Some(url.clone());
        }
        if let Some(duration) = update.recording_duration {
            call.recording_duration = Some(duration);
        }
        if let Some(summary) = &update.summary {
            call.summary = Some(summary.clone());
        }
        if let Some(at) = update.appointment_at {
            call.appointment_at = Some(at);
        }
        call.updated_at = Utc::now();
        Ok(Some(call.clone()))
    }

    async fn stamp_call_ended(
        &self,
        call_sid: &str,
        status: CallStatus,
        ended_at: DateTime<Utc>,
        provider_duration: Option<i32>,
    ) -> LedgerResult<Option<CallSession>> {
        let mut tables = self.tables.write().await;
        let Some(call) = tables.calls.get_mut(call_sid) else {
            return Ok(None);
        };
        if call.ended_at.is_some() || !call.status.can_advance_to(status) {
            return Ok(None);
        }

        call.status = status;
        call.ended_at = Some(ended_at);
        call.duration_seconds = Some(
            provider_duration
                .unwrap_or_else(|| (ended_at - call.started_at).num_seconds().max(0) as i32),
        );
        call.phase = CallPhase::Completed;
        call.updated_at = Utc::now();
        Ok(Some(call.clone()))
    }

    async fn insert_sms_if_absent(&self, sms: NewSms) -> LedgerResult<(SmsMessage, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(sid) = &sms.message_sid {
            if let Some(existing) = tables.sms.iter().find(|m| m.message_sid.as_ref() == Some(sid)) {
                return Ok((existing.clone(), false));
            }
        }

        let now = Utc::now();
        let id = tables.next_id();
        let row = SmsMessage {
            id,
            business_id: sms.business_id,
            message_sid: sms.message_sid,
            thread_id: sms.thread_id,
            direction: sms.direction,
            from_number: sms.from_number,
            to_number: sms.to_number,
            body: sms.body,
            status: sms.status,
            contact_id: sms.contact_id,
            is_auto_response: sms.is_auto_response,
            in_reply_to: sms.in_reply_to,
            analysis: None,
            created_at: now,
            updated_at: now,
        };
        tables.sms.push(row.clone());
        Ok((row, true))
    }

    async fn get_sms_by_sid(&self, message_sid: &str) -> LedgerResult<Option<SmsMessage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sms
            .iter()
            .find(|m| m.message_sid.as_deref() == Some(message_sid))
            .cloned())
    }

    async fn find_auto_reply(&self, inbound_id: i64) -> LedgerResult<Option<SmsMessage>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sms
            .iter()
            .find(|m| m.is_auto_response && m.in_reply_to == Some(inbound_id))
            .cloned())
    }

    async fn assign_sms_sid(&self, id: i64, message_sid: &str) -> LedgerResult<Option<SmsMessage>> {
        let mut tables = self.tables.write().await;
        if tables.sms.iter().any(|m| m.message_sid.as_deref() == Some(message_sid)) {
            return Ok(None);
        }
        let Some(message) = tables
            .sms
            .iter_mut()
            .find(|m| m.id == id && m.message_sid.is_none())
        else {
            return Ok(None);
        };
        message.message_sid = Some(message_sid.to_string());
        message.updated_at = Utc::now();
        Ok(Some(message.clone()))
    }

    async fn update_sms_status(&self, message_sid: &str, status: SmsStatus) -> LedgerResult<Option<SmsMessage>> {
        let mut tables = self.tables.write().await;
        let Some(message) = tables
            .sms
            .iter_mut()
            .find(|m| m.message_sid.as_deref() == Some(message_sid))
        else {
            return Ok(None);
        };
        if !message.status.can_advance_to(status) {
            return Ok(None);
        }
        message.status = status;
        message.updated_at = Utc::now();
        Ok(Some(message.clone()))
    }

    async fn set_sms_analysis(&self, id: i64, analysis: &SmsAnalysis) -> LedgerResult<()> {
        let mut tables = self.tables.write().await;
        let message = tables
            .sms
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("sms {}", id)))?;
        message.analysis = Some(analysis.clone());
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn book_appointment(&self, appointment: NewAppointment) -> LedgerResult<Appointment> {
        let mut tables = self.tables.write().await;
        let id = tables.next_id();
        let row = Appointment {
            id,
            business_id: appointment.business_id,
            contact_id: appointment.contact_id,
            call_sid: appointment.call_sid,
            starts_at: appointment.starts_at,
            status: "scheduled".to_string(),
            notes: appointment.notes,
            created_at: Utc::now(),
        };
        tables.appointments.push(row.clone());
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_call(sid: &str) -> NewCall {
        NewCall {
            business_id: 1,
            call_sid: sid.to_string(),
            from_number: "+15551234567".to_string(),
            to_number: "+15550001111".to_string(),
            direction: CallDirection::Inbound,
            contact_id: None,
            phase: CallPhase::InConversation,
            handled_by: HandledBy::Ai,
        }
    }

    #[tokio::test]
    async fn test_one_call_per_sid() {
        let ledger = MemoryLedger::new();
        let (first, created) = ledger.create_call_if_absent(new_call("CA1")).await.unwrap();
        assert!(created);
        let (second, created) = ledger.create_call_if_absent(new_call("CA1")).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let ledger = MemoryLedger::new();
        ledger.create_call_if_absent(new_call("CA1")).await.unwrap();

        let update = CallUpdate {
            status: Some(CallStatus::Ringing),
            ..CallUpdate::default()
        };
        let call = ledger.update_call("CA1", &update).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Answered);

        let stamped = ledger
            .stamp_call_ended("CA1", CallStatus::Completed, Utc::now(), Some(42))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stamped.duration_seconds, Some(42));

        let again = ledger
            .stamp_call_ended("CA1", CallStatus::Failed, Utc::now(), Some(99))
            .await
            .unwrap();
        assert!(again.is_none());
        let stored = ledger.get_call("CA1").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
        assert_eq!(stored.duration_seconds, Some(42));
    }

    #[tokio::test]
    async fn test_turn_replays_until_replaced() {
        let ledger = MemoryLedger::new();
        ledger.create_call_if_absent(new_call("CA1")).await.unwrap();

        assert!(ledger.begin_turn("CA1", "speech:a").await.unwrap().is_none());
        let pending = ledger.begin_turn("CA1", "speech:a").await.unwrap().unwrap();
        assert!(pending.reply.is_none());

        let reply = Markup::new().say("Yes we do.");
        ledger.finish_turn("CA1", "speech:a", &reply).await.unwrap();
        let done = ledger.begin_turn("CA1", "speech:a").await.unwrap().unwrap();
        assert_eq!(done.reply, Some(reply));

        assert!(ledger.begin_turn("CA1", "speech:b").await.unwrap().is_none());
        // A late finish for the replaced turn is dropped
        ledger.finish_turn("CA1", "speech:a", &Markup::new().hangup()).await.unwrap();
        let current = ledger.begin_turn("CA1", "speech:b").await.unwrap().unwrap();
        assert!(current.reply.is_none());
    }

    #[tokio::test]
    async fn test_sms_insert_idempotent_by_sid() {
        let ledger = MemoryLedger::new();
        let sms = NewSms {
            business_id: 1,
            message_sid: Some("SM1".to_string()),
            thread_id: "1-5551234567".to_string(),
            direction: SmsDirection::Inbound,
            from_number: "+15551234567".to_string(),
            to_number: "+15550001111".to_string(),
            body: "hello".to_string(),
            status: SmsStatus::Received,
            contact_id: None,
            is_auto_response: false,
            in_reply_to: None,
        };
        let (_, created) = ledger.insert_sms_if_absent(sms.clone()).await.unwrap();
        assert!(created);
        let (_, created) = ledger.insert_sms_if_absent(sms).await.unwrap();
        assert!(!created);
        assert_eq!(ledger.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_business_lookup_by_phone_key() {
        let ledger = MemoryLedger::new();
        ledger
            .add_business(BusinessProfile {
                id: 7,
                name: "Acme".to_string(),
                phone_number: "+1 555 000 1111".to_string(),
                personality: "calm".to_string(),
                timezone: "UTC".to_string(),
                hours: None,
                forwarding_number: None,
                greeting: None,
                voicemail_prompt: None,
                auto_response_enabled: false,
            })
            .await;
        let found = ledger.find_business_by_number("+15550001111").await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(7));
        assert!(ledger.find_business_by_number("+15559999999").await.unwrap().is_none());
    }
}
