//! Voice webhooks
//!
//! Each handler loads the call from the ledger, runs one state-machine
//! transition under the call's lock and answers with markup. Ledger failures
//! are logged and recorded but never keep the caller from hearing something.

use axum::{extract::State, http::HeaderMap, Form};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::models::*;
use super::call_flow::{self, CallEvent, Effect, FlowContext, Notify, Transition};
use super::contacts::phone_key;
use super::markup::Markup;
use super::orchestrator::{Channel, ConversationState};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "Direction", default)]
    pub direction: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpeechForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "SpeechResult", default)]
    pub speech_result: Option<String>,
    #[serde(rename = "Digits", default)]
    pub digits: Option<String>,
}

impl SpeechForm {
    /// What the caller said, falling back to keypad digits.
    fn caller_input(&self) -> Option<&str> {
        [self.speech_result.as_deref(), self.digits.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct CallSidForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordingForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "RecordingUrl", default)]
    pub recording_url: Option<String>,
    #[serde(rename = "RecordingDuration", default)]
    pub recording_duration: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallStatusForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "CallStatus", default)]
    pub call_status: String,
    #[serde(rename = "CallDuration", default)]
    pub call_duration: Option<String>,
}

/// Header the provider repeats unchanged on every retry of one webhook.
pub const IDEMPOTENCY_HEADER: &str = "i-twilio-idempotency-token";

/// Identity of one caller turn: the provider's retry token when sent,
/// otherwise the words themselves.
fn turn_key(headers: &HeaderMap, channel: Channel, fragment: &str) -> String {
    let endpoint = match channel {
        Channel::Appointment => "appointment",
        _ => "speech",
    };
    match headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        Some(token) => format!("{}:token:{}", endpoint, token),
        None => format!("{}:said:{}", endpoint, fragment),
    }
}

fn parse_seconds(value: Option<&str>) -> Option<i32> {
    value.and_then(|v| v.trim().parse().ok())
}

/// `POST /voice`
pub async fn incoming_call(
    State(state): State<Arc<AppState>>,
    Form(form): Form<IncomingCallForm>,
) -> Markup {
    let business = match state.ledger.find_business_by_number(&form.to).await {
        Ok(Some(business)) => business,
        Ok(None) => {
            tracing::warn!("Call {} to unknown number {}", form.call_sid, form.to);
            return call_flow::not_in_service();
        }
        Err(e) => {
            tracing::error!("Business lookup for {} failed: {}", form.to, e);
            return fallback(&state);
        }
    };

    if form.call_sid.is_empty() {
        tracing::warn!("Incoming call without CallSid for business {}", business.id);
        return fallback(&state);
    }

    let _guard = state.locks.lock(&form.call_sid).await;

    let contact = match state
        .contacts
        .resolve(business.id, &form.from, ContactSource::Phone)
        .await
    {
        Ok(contact) => contact,
        Err(e) => {
            state.write_failed("resolve_contact", &form.call_sid, &e).await;
            None
        }
    };

    let new_call = NewCall {
        business_id: business.id,
        call_sid: form.call_sid.clone(),
        from_number: form.from.clone(),
        to_number: form.to.clone(),
        direction: form
            .direction
            .as_deref()
            .map(CallDirection::from_provider)
            .unwrap_or(CallDirection::Inbound),
        contact_id: contact.as_ref().map(|c| c.id),
        phase: CallPhase::Ringing,
        handled_by: HandledBy::Ai,
    };

    let (call, created) = match state.ledger.create_call_if_absent(new_call.clone()).await {
        Ok(result) => result,
        Err(e) => {
            state.write_failed("create_call", &form.call_sid, &e).await;
            (provisional_call(&new_call), true)
        }
    };

    if created {
        tracing::info!(
            "Incoming call {} from {} for business {}",
            call.call_sid,
            call.from_number,
            business.id
        );
    }

    let event = if created {
        CallEvent::Incoming
    } else {
        CallEvent::Redelivered
    };
    let ctx = FlowContext {
        business: &business,
        urls: &state.urls,
        now: Utc::now(),
    };
    let t = call_flow::transition(&ctx, &call, event);
    apply(&state, &business, call, t).await
}

/// `POST /voice/speech`
pub async fn speech_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<SpeechForm>,
) -> Markup {
    let input = form.caller_input().map(str::to_string);
    converse(&state, &headers, &form.call_sid, input, Channel::Voice).await
}

/// `POST /voice/appointment`
pub async fn appointment_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<SpeechForm>,
) -> Markup {
    let input = form.caller_input().map(str::to_string);
    converse(&state, &headers, &form.call_sid, input, Channel::Appointment).await
}

/// Shared body of the speech and appointment webhooks.
///
/// The lock is taken twice: once to append the fragment, once to apply the
/// decision. The model call in between runs unlocked. A redelivered turn
/// gets the stored reply, or the phase's replay while the first delivery
/// is still waiting on the model.
async fn converse(
    state: &AppState,
    headers: &HeaderMap,
    call_sid: &str,
    input: Option<String>,
    channel: Channel,
) -> Markup {
    let (call, business, key) = {
        let _guard = state.locks.lock(call_sid).await;
        let Some((call, business)) = load(state, call_sid).await else {
            return fallback(state);
        };

        let Some(fragment) = input.as_deref() else {
            let event = match channel {
                Channel::Appointment => CallEvent::AppointmentUnavailable,
                _ => CallEvent::NoSpeech,
            };
            let ctx = FlowContext {
                business: &business,
                urls: &state.urls,
                now: Utc::now(),
            };
            let t = call_flow::transition(&ctx, &call, event);
            return apply(state, &business, call, t).await;
        };

        if call.is_terminal() {
            tracing::info!("Speech for ended call {} ignored", call_sid);
            return Markup::new().hangup();
        }

        let key = turn_key(headers, channel, fragment);
        match state.ledger.begin_turn(call_sid, &key).await {
            Ok(None) => {}
            Ok(Some(turn)) => {
                tracing::info!("Redelivered turn for call {} replayed", call_sid);
                return match turn.reply {
                    Some(reply) => reply,
                    None => {
                        let ctx = FlowContext {
                            business: &business,
                            urls: &state.urls,
                            now: Utc::now(),
                        };
                        call_flow::replay_markup(&ctx, &call)
                    }
                };
            }
            Err(e) => state.write_failed("begin_turn", call_sid, &e).await,
        }

        if let Err(e) = state.ledger.append_transcript(call_sid, fragment).await {
            state.write_failed("append_transcript", call_sid, &e).await;
        }
        (call, business, key)
    };

    let fragment = input.unwrap_or_default();
    let contact_name = contact_display_name(state, &call).await;
    let conversation = ConversationState {
        channel,
        transcript: &call.transcript,
        contact_name,
        now: Utc::now(),
    };
    let outcome = state.orchestrator.decide(&fragment, &business, &conversation).await;

    let _guard = state.locks.lock(call_sid).await;
    // Re-read: the caller may have hung up while the model was thinking
    let current = match state.ledger.get_call(call_sid).await {
        Ok(Some(current)) => current,
        Ok(None) => call,
        Err(e) => {
            tracing::error!("Re-reading call {} failed: {}", call_sid, e);
            call
        }
    };

    let event = match (&outcome, channel) {
        (Ok(decision), Channel::Appointment) => CallEvent::AppointmentDecision {
            decision,
            caller_words: &fragment,
        },
        (Ok(decision), _) => CallEvent::Decision(decision),
        (Err(e), Channel::Appointment) => {
            tracing::warn!("Appointment decision for {} unavailable: {}", call_sid, e);
            CallEvent::AppointmentUnavailable
        }
        (Err(e), _) => {
            tracing::warn!("Decision for {} unavailable: {}", call_sid, e);
            CallEvent::DecisionUnavailable
        }
    };

    if let Ok(decision) = &outcome {
        tracing::info!(
            "Call {}: action={} confidence={:.2}{}",
            call_sid,
            decision.action.as_str(),
            decision.confidence,
            if decision.fallback { " (safe default)" } else { "" }
        );
    }

    let ctx = FlowContext {
        business: &business,
        urls: &state.urls,
        now: Utc::now(),
    };
    let t = call_flow::transition(&ctx, &current, event);
    let markup = apply(state, &business, current, t).await;
    if let Err(e) = state.ledger.finish_turn(call_sid, &key, &markup).await {
        state.write_failed("finish_turn", call_sid, &e).await;
    }
    markup
}

/// `POST /voice/voicemail`
pub async fn voicemail(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallSidForm>,
) -> Markup {
    let _guard = state.locks.lock(&form.call_sid).await;
    let Some((call, business)) = load(&state, &form.call_sid).await else {
        return fallback(&state);
    };

    let ctx = FlowContext {
        business: &business,
        urls: &state.urls,
        now: Utc::now(),
    };
    let t = call_flow::transition(&ctx, &call, CallEvent::VoicemailRequested);
    apply(&state, &business, call, t).await
}

/// `POST /voice/recording`
pub async fn recording_finished(
    State(state): State<Arc<AppState>>,
    Form(form): Form<RecordingForm>,
) -> Markup {
    let goodbye = Markup::new().say(call_flow::RECORDING_THANKS).hangup();

    let Some(url) = form.recording_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        tracing::warn!("Recording webhook for {} without a URL", form.call_sid);
        return goodbye;
    };

    let _guard = state.locks.lock(&form.call_sid).await;
    let Some((call, business)) = load(&state, &form.call_sid).await else {
        tracing::error!("Recording {} for unknown call {} not stored", url, form.call_sid);
        return goodbye;
    };

    tracing::info!("Voicemail recorded for call {}", call.call_sid);
    let ctx = FlowContext {
        business: &business,
        urls: &state.urls,
        now: Utc::now(),
    };
    let event = CallEvent::RecordingFinished {
        url,
        duration: parse_seconds(form.recording_duration.as_deref()),
    };
    let t = call_flow::transition(&ctx, &call, event);
    apply(&state, &business, call, t).await
}

/// `POST /voice/status`
pub async fn call_status(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallStatusForm>,
) -> Markup {
    let Some(status) = CallStatus::from_provider(&form.call_status) else {
        tracing::warn!("Unknown call status '{}' for {}", form.call_status, form.call_sid);
        return Markup::empty();
    };

    let _guard = state.locks.lock(&form.call_sid).await;
    let Some((call, business)) = load(&state, &form.call_sid).await else {
        tracing::warn!("Status {} for unknown call {}", status, form.call_sid);
        return Markup::empty();
    };

    let ctx = FlowContext {
        business: &business,
        urls: &state.urls,
        now: Utc::now(),
    };
    let event = CallEvent::StatusChanged {
        status,
        provider_duration: parse_seconds(form.call_duration.as_deref()),
    };
    let t = call_flow::transition(&ctx, &call, event);
    apply(&state, &business, call, t).await
}

/// Load a call and its business. `None` means the caller gets the fallback.
async fn load(state: &AppState, call_sid: &str) -> Option<(CallSession, BusinessProfile)> {
    if call_sid.is_empty() {
        tracing::warn!("Webhook without CallSid");
        return None;
    }

    let call = match state.ledger.get_call(call_sid).await {
        Ok(Some(call)) => call,
        Ok(None) => {
            tracing::warn!("Webhook for unknown call {}", call_sid);
            return None;
        }
        Err(e) => {
            tracing::error!("Loading call {} failed: {}", call_sid, e);
            return None;
        }
    };

    match state.ledger.get_business(call.business_id).await {
        Ok(Some(business)) => Some((call, business)),
        Ok(None) => {
            tracing::error!("Call {} belongs to missing business {}", call_sid, call.business_id);
            None
        }
        Err(e) => {
            tracing::error!("Loading business {} failed: {}", call.business_id, e);
            None
        }
    }
}

/// Perform a transition's writes and effects, then hand back its markup.
async fn apply(state: &AppState, business: &BusinessProfile, call: CallSession, t: Transition) -> Markup {
    let call_sid = call.call_sid.clone();
    let mut current = call;

    if !t.update.is_empty() {
        match state.ledger.update_call(&call_sid, &t.update).await {
            Ok(Some(updated)) => current = updated,
            Ok(None) => tracing::warn!("Update for missing call {} dropped", call_sid),
            Err(e) => state.write_failed("update_call", &call_sid, &e).await,
        }
    }

    let mut notifications = Vec::new();
    let mut already_stamped = false;
    for effect in t.effects {
        match effect {
            Effect::Publish(notify) => notifications.push(notify),

            Effect::BookAppointment { starts_at, notes } => {
                let appointment = NewAppointment {
                    business_id: business.id,
                    contact_id: current.contact_id,
                    call_sid: Some(call_sid.clone()),
                    starts_at,
                    notes,
                };
                match state.ledger.book_appointment(appointment).await {
                    Ok(booked) => tracing::info!(
                        "Appointment {} booked for call {} at {}",
                        booked.id,
                        call_sid,
                        booked.starts_at
                    ),
                    Err(e) => state.write_failed("book_appointment", &call_sid, &e).await,
                }
            }

            Effect::EnrichContact(info) => {
                let key = phone_key(&current.from_number);
                match state.ledger.find_contact(business.id, &key).await {
                    Ok(Some(contact)) => {
                        if let Err(e) = state.contacts.enrich(&contact, &info).await {
                            state.write_failed("enrich_contact", &call_sid, &e).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Contact lookup for {} failed: {}", call_sid, e),
                }
            }

            Effect::StampEnded {
                status,
                provider_duration,
            } => match state
                .ledger
                .stamp_call_ended(&call_sid, status, Utc::now(), provider_duration)
                .await
            {
                Ok(Some(stamped)) => {
                    tracing::info!(
                        "Call {} ended: {} after {}s",
                        call_sid,
                        stamped.status,
                        stamped.duration_seconds.unwrap_or(0)
                    );
                    if let Some(contact_id) = stamped.contact_id {
                        let at = stamped.ended_at.unwrap_or_else(Utc::now);
                        if let Err(e) = state
                            .ledger
                            .record_interaction(contact_id, InteractionKind::Call, at)
                            .await
                        {
                            state.write_failed("record_interaction", &call_sid, &e).await;
                        }
                    }
                    current = stamped;
                }
                Ok(None) => {
                    tracing::debug!("Call {} already stamped", call_sid);
                    already_stamped = true;
                }
                Err(e) => state.write_failed("stamp_call_ended", &call_sid, &e).await,
            },
        }
    }

    // A duplicate status delivery changed nothing worth announcing
    if already_stamped {
        notifications.clear();
    }

    for notify in notifications {
        let event = match notify {
            Notify::NewCall => DashboardEvent::NewCall { call: current.clone() },
            Notify::CallUpdated => DashboardEvent::CallUpdated { call: current.clone() },
            Notify::VoicemailReceived => DashboardEvent::VoicemailReceived { call: current.clone() },
        };
        state.publish(event).await;
    }

    t.markup
}

async fn contact_display_name(state: &AppState, call: &CallSession) -> Option<String> {
    let key = phone_key(&call.from_number);
    match state.ledger.find_contact(call.business_id, &key).await {
        Ok(Some(contact)) if !contact.has_placeholder_name() => Some(contact.full_name()),
        _ => None,
    }
}

/// Markup when the call or its business cannot be loaded.
fn fallback(state: &AppState) -> Markup {
    call_flow::terminal_fallback(
        state.config.fallback_forward_number.as_deref(),
        &state.urls.recording,
    )
}

/// Stand-in used to keep answering when the ledger cannot create the call.
fn provisional_call(call: &NewCall) -> CallSession {
    let now = Utc::now();
    CallSession {
        id: 0,
        business_id: call.business_id,
        call_sid: call.call_sid.clone(),
        from_number: call.from_number.clone(),
        to_number: call.to_number.clone(),
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_input_prefers_speech() {
        let form = SpeechForm {
            call_sid: "CA1".to_string(),
            speech_result: Some("  ".to_string()),
            digits: Some("2".to_string()),
        };
        assert_eq!(form.caller_input(), Some("2"));

        let form = SpeechForm {
            call_sid: "CA1".to_string(),
            speech_result: None,
            digits: None,
        };
        assert_eq!(form.caller_input(), None);
    }

    #[test]
    fn test_turn_key_prefers_provider_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(turn_key(&headers, Channel::Voice, "hello"), "speech:said:hello");

        headers.insert(IDEMPOTENCY_HEADER, "abc-1".parse().unwrap());
        assert_eq!(turn_key(&headers, Channel::Voice, "hello"), "speech:token:abc-1");
        assert_eq!(
            turn_key(&headers, Channel::Appointment, "hello"),
            "appointment:token:abc-1"
        );
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds(Some(" 42 ")), Some(42));
        assert_eq!(parse_seconds(Some("abc")), None);
        assert_eq!(parse_seconds(None), None);
    }
}
