//! SMS webhooks
//!
//! Inbound texts are stored once per provider message id. When the business
//! has auto-response turned on, the orchestrator drafts a reply that goes back
//! as `<Message>` markup and is stored as a linked outbound message. The
//! reply is stored before the provider has assigned it an id, so its status
//! callback carries the stored row id and the first status report fills in
//! the provider id.

use axum::{
    extract::{Query, State},
    Form,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::models::*;
use super::contacts::phone_key;
use super::markup::Markup;
use super::orchestrator::{Channel, ConversationState};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct InboundSmsForm {
    #[serde(rename = "MessageSid", default)]
    pub message_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Body", default)]
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct SmsStatusForm {
    #[serde(rename = "MessageSid", default)]
    pub message_sid: String,
    #[serde(rename = "MessageStatus", default)]
    pub message_status: Option<String>,
    #[serde(rename = "SmsStatus", default)]
    pub sms_status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "replyId")]
    pub reply_id: Option<i64>,
}

/// One conversation per business line and remote number.
pub fn thread_id(business_id: i64, remote_number: &str) -> String {
    format!("{}-{}", business_id, phone_key(remote_number))
}

/// `POST /sms/inbound`
pub async fn inbound_message(
    State(state): State<Arc<AppState>>,
    Form(form): Form<InboundSmsForm>,
) -> Markup {
    let business = match state.ledger.find_business_by_number(&form.to).await {
        Ok(Some(business)) => business,
        Ok(None) => {
            tracing::warn!("Text {} to unknown number {}", form.message_sid, form.to);
            return Markup::empty();
        }
        Err(e) => {
            tracing::error!("Business lookup for {} failed: {}", form.to, e);
            return Markup::empty();
        }
    };

    let message_sid = Some(form.message_sid.trim().to_string()).filter(|s| !s.is_empty());
    // Serializes duplicate deliveries so only one drafts a reply
    let _guard = match &message_sid {
        Some(sid) => Some(state.locks.lock(&format!("sms:{}", sid)).await),
        None => None,
    };

    let contact = match state
        .contacts
        .resolve(business.id, &form.from, ContactSource::Sms)
        .await
    {
        Ok(contact) => contact,
        Err(e) => {
            state.write_failed("resolve_contact", &form.message_sid, &e).await;
            None
        }
    };

    let inbound = NewSms {
        business_id: business.id,
        message_sid,
        thread_id: thread_id(business.id, &form.from),
        direction: SmsDirection::Inbound,
        from_number: form.from.clone(),
        to_number: form.to.clone(),
        body: form.body.clone(),
        status: SmsStatus::Received,
        contact_id: contact.as_ref().map(|c| c.id),
        is_auto_response: false,
        in_reply_to: None,
    };

    let stored = match state.ledger.insert_sms_if_absent(inbound).await {
        Ok((message, true)) => Some(message),
        Ok((message, false)) => {
            tracing::info!("Duplicate delivery of text {}", form.message_sid);
            return previous_reply(&state, &message).await;
        }
        Err(e) => {
            state.write_failed("insert_sms", &form.message_sid, &e).await;
            None
        }
    };

    if let Some(message) = &stored {
        tracing::info!("Text {} received for business {}", message.id, business.id);
        if let Some(contact_id) = message.contact_id {
            if let Err(e) = state
                .ledger
                .record_interaction(contact_id, InteractionKind::Sms, message.created_at)
                .await
            {
                state.write_failed("record_interaction", &form.message_sid, &e).await;
            }
        }
        state.publish(DashboardEvent::NewSms { message: message.clone() }).await;
    }

    if !business.auto_response_enabled {
        return Markup::empty();
    }

    let contact_name = contact
        .as_ref()
        .filter(|c| !c.has_placeholder_name())
        .map(|c| c.full_name());
    let conversation = ConversationState {
        channel: Channel::Sms,
        transcript: "",
        contact_name,
        now: Utc::now(),
    };

    let decision = match state.orchestrator.decide(&form.body, &business, &conversation).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::warn!("No auto-reply for text {}: {}", form.message_sid, e);
            return Markup::empty();
        }
    };

    if let Some(contact) = &contact {
        if let Err(e) = state.contacts.enrich(contact, &decision.extracted_info).await {
            state.write_failed("enrich_contact", &form.message_sid, &e).await;
        }
    }

    let Some(inbound) = stored else {
        // Nothing to link the reply to, but the texter still gets an answer
        return reply_markup(&decision, None);
    };

    let analysis = decision.to_sms_analysis();
    match state.ledger.set_sms_analysis(inbound.id, &analysis).await {
        Ok(()) => {
            let message = SmsMessage {
                analysis: Some(analysis),
                ..inbound.clone()
            };
            state.publish(DashboardEvent::SmsUpdated { message }).await;
        }
        Err(e) => state.write_failed("set_sms_analysis", &form.message_sid, &e).await,
    }

    if !decision.should_respond || decision.message.is_empty() {
        return Markup::empty();
    }

    let reply = NewSms {
        business_id: business.id,
        message_sid: None,
        thread_id: inbound.thread_id.clone(),
        direction: SmsDirection::Outbound,
        from_number: inbound.to_number.clone(),
        to_number: inbound.from_number.clone(),
        body: decision.message.clone(),
        status: SmsStatus::Queued,
        contact_id: inbound.contact_id,
        is_auto_response: true,
        in_reply_to: Some(inbound.id),
    };
    match state.ledger.insert_sms_if_absent(reply).await {
        Ok((message, _)) => {
            tracing::info!("Auto-reply {} drafted for text {}", message.id, inbound.id);
            let markup = reply_markup(&decision, Some(status_callback(&state, message.id)));
            state.publish(DashboardEvent::NewSms { message }).await;
            markup
        }
        Err(e) => {
            state.write_failed("insert_auto_reply", &form.message_sid, &e).await;
            reply_markup(&decision, None)
        }
    }
}

fn reply_markup(decision: &OrchestratorDecision, status_callback: Option<String>) -> Markup {
    if decision.should_respond && !decision.message.is_empty() {
        Markup::new().message(decision.message.clone(), status_callback)
    } else {
        Markup::empty()
    }
}

fn status_callback(state: &AppState, reply_id: i64) -> String {
    format!("{}?replyId={}", state.urls.sms_status, reply_id)
}

/// A repeated delivery gets the reply drafted the first time, if any.
async fn previous_reply(state: &AppState, inbound: &SmsMessage) -> Markup {
    match state.ledger.find_auto_reply(inbound.id).await {
        Ok(Some(reply)) => {
            let callback = reply.message_sid.is_none().then(|| status_callback(state, reply.id));
            Markup::new().message(reply.body, callback)
        }
        Ok(None) => Markup::empty(),
        Err(e) => {
            tracing::error!("Looking up reply to text {} failed: {}", inbound.id, e);
            Markup::empty()
        }
    }
}

/// `POST /sms/status`
pub async fn message_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    Form(form): Form<SmsStatusForm>,
) -> Markup {
    let raw = form
        .message_status
        .as_deref()
        .or(form.sms_status.as_deref())
        .unwrap_or_default();

    let Some(status) = SmsStatus::from_provider(raw) else {
        tracing::warn!("Unknown message status '{}' for {}", raw, form.message_sid);
        return Markup::empty();
    };

    if let Some(reply_id) = query.reply_id.filter(|_| !form.message_sid.is_empty()) {
        match state.ledger.assign_sms_sid(reply_id, &form.message_sid).await {
            Ok(Some(_)) => tracing::debug!("Auto-reply {} sent as {}", reply_id, form.message_sid),
            Ok(None) => {}
            Err(e) => state.write_failed("assign_sms_sid", &form.message_sid, &e).await,
        }
    }

    match state.ledger.update_sms_status(&form.message_sid, status).await {
        Ok(Some(message)) => {
            tracing::debug!("Text {} is now {}", form.message_sid, status.as_str());
            state.publish(DashboardEvent::SmsUpdated { message }).await;
        }
        Ok(None) => tracing::debug!("Status {} for {} not applied", status.as_str(), form.message_sid),
        Err(e) => state.write_failed("update_sms_status", &form.message_sid, &e).await,
    }

    Markup::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_uses_phone_key() {
        assert_eq!(thread_id(4, "+1 (555) 123-4567"), "4-5551234567");
        assert_eq!(thread_id(4, "5551234567"), thread_id(4, "+15551234567"));
    }
}
