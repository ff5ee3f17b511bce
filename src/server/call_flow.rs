//! Call state machine
//!
//! `transition` is pure: given the persisted call and one webhook event it
//! returns the next phase, the markup to send back and the effects the
//! webhook layer must apply. No I/O happens here.
//!
//! ```text
//! ringing -> in_conversation (loops) -> transferring | recording_voicemail | ending -> completed
//!                 \-> appointment -> ending | transferring | recording_voicemail
//! ```

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::models::*;
use super::config::ServerConfig;
use super::hours;
use super::markup::Markup;

pub const APOLOGY: &str =
    "I'm sorry, I'm having trouble understanding right now. Let me connect you with someone who can help.";
pub const APOLOGY_NO_TRANSFER: &str =
    "I'm sorry, I'm having trouble understanding right now.";
pub const NO_ONE_AVAILABLE: &str = "No one is available to take your call right now.";
pub const NOT_IN_SERVICE: &str = "We're sorry, the number you have dialed is not in service. Goodbye.";
pub const APPOINTMENT_PROMPT: &str = "What day and time would work best for you?";
pub const RECORDING_THANKS: &str = "Thank you, your message has been recorded. Goodbye.";

/// Action URLs the markup points the provider at.
#[derive(Debug, Clone)]
pub struct WebhookUrls {
    pub speech: String,
    pub appointment: String,
    pub voicemail: String,
    pub recording: String,
    pub sms_status: String,
}

impl WebhookUrls {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            speech: config.webhook_url("/voice/speech"),
            appointment: config.webhook_url("/voice/appointment"),
            voicemail: config.webhook_url("/voice/voicemail"),
            recording: config.webhook_url("/voice/recording"),
            sms_status: config.webhook_url("/sms/status"),
        }
    }
}

pub struct FlowContext<'a> {
    pub business: &'a BusinessProfile,
    pub urls: &'a WebhookUrls,
    pub now: DateTime<Utc>,
}

/// One webhook, already reduced to what the state machine needs.
#[derive(Debug, Clone)]
pub enum CallEvent<'a> {
    /// First `/voice` delivery for this call.
    Incoming,
    /// Repeated `/voice` delivery for a call that already exists.
    Redelivered,
    /// Gather finished with nothing said.
    NoSpeech,
    Decision(&'a OrchestratorDecision),
    /// Orchestrator ran out of attempts.
    DecisionUnavailable,
    AppointmentDecision {
        decision: &'a OrchestratorDecision,
        caller_words: &'a str,
    },
    AppointmentUnavailable,
    VoicemailRequested,
    RecordingFinished {
        url: &'a str,
        duration: Option<i32>,
    },
    StatusChanged {
        status: CallStatus,
        provider_duration: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    BookAppointment {
        starts_at: DateTime<Utc>,
        notes: Option<String>,
    },
    EnrichContact(ExtractedInfo),
    /// Set terminal status + end time once, then bump the contact's call counter.
    StampEnded {
        status: CallStatus,
        provider_duration: Option<i32>,
    },
    Publish(Notify),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notify {
    NewCall,
    CallUpdated,
    VoicemailReceived,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub phase: CallPhase,
    pub markup: Markup,
    /// Applied to the call under its lock. Always carries `phase` when it changes.
    pub update: CallUpdate,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(phase: CallPhase, markup: Markup) -> Self {
        Self {
            phase,
            markup,
            update: CallUpdate {
                phase: Some(phase),
                ..CallUpdate::default()
            },
            effects: vec![Effect::Publish(Notify::CallUpdated)],
        }
    }

    fn handled_by(mut self, handled_by: HandledBy) -> Self {
        self.update.handled_by = Some(handled_by);
        self
    }

    fn with_summary(mut self, decision: &OrchestratorDecision) -> Self {
        self.update.summary = Some(decision.to_call_summary());
        let info = &decision.extracted_info;
        if info.name.is_some() || info.email.is_some() {
            self.effects.push(Effect::EnrichContact(info.clone()));
        }
        self
    }
}

pub fn transition(ctx: &FlowContext<'_>, call: &CallSession, event: CallEvent<'_>) -> Transition {
    match event {
        CallEvent::StatusChanged {
            status,
            provider_duration,
        } => status_changed(call, status, provider_duration),

        // Anything else arriving after the call ended only gets a hangup
        _ if call.is_terminal() => ended(call, &event),

        CallEvent::Incoming => {
            let mut t = if hours::is_open(ctx.business, ctx.now) {
                Transition::to(
                    CallPhase::InConversation,
                    Markup::new().gather(&ctx.urls.speech, ctx.business.greeting_text()),
                )
                .handled_by(HandledBy::Ai)
            } else {
                Transition::to(CallPhase::RecordingVoicemail, voicemail_markup(ctx))
                    .handled_by(HandledBy::Voicemail)
            };
            t.effects = vec![Effect::Publish(Notify::NewCall)];
            t
        }

        CallEvent::Redelivered => Transition {
            phase: call.phase,
            markup: replay_markup(ctx, call),
            update: CallUpdate::default(),
            effects: Vec::new(),
        },

        CallEvent::NoSpeech => Transition::to(
            CallPhase::Ending,
            Markup::new().say(closing(ctx.business)).hangup(),
        ),

        CallEvent::Decision(decision) => conversation_decision(ctx, decision).with_summary(decision),

        CallEvent::DecisionUnavailable | CallEvent::AppointmentUnavailable => {
            orchestrator_fallback(ctx)
        }

        CallEvent::AppointmentDecision {
            decision,
            caller_words,
        } => appointment_decision(ctx, decision, caller_words).with_summary(decision),

        CallEvent::VoicemailRequested => {
            Transition::to(CallPhase::RecordingVoicemail, voicemail_markup(ctx))
        }

        CallEvent::RecordingFinished { url, duration } => {
            let mut t = Transition::to(
                CallPhase::Ending,
                Markup::new().say(RECORDING_THANKS).hangup(),
            )
            .handled_by(HandledBy::Voicemail);
            t.update.recording_url = Some(url.to_string());
            t.update.recording_duration = duration;
            t.effects = vec![Effect::Publish(Notify::VoicemailReceived)];
            t
        }
    }
}

fn conversation_decision(ctx: &FlowContext<'_>, decision: &OrchestratorDecision) -> Transition {
    match decision.action {
        DecisionAction::Transfer => transfer_or_voicemail(ctx, &decision.message),

        DecisionAction::Appointment => Transition::to(
            CallPhase::Appointment,
            Markup::new().gather(&ctx.urls.appointment, appointment_prompt(&decision.message)),
        ),

        DecisionAction::Information => Transition::to(
            CallPhase::InConversation,
            Markup::new().gather(&ctx.urls.speech, decision.message.clone()),
        ),

        DecisionAction::Voicemail => Transition::to(
            CallPhase::RecordingVoicemail,
            Markup::new()
                .say(decision.message.clone())
                .record(&ctx.urls.recording),
        ),

        DecisionAction::End => Transition::to(
            CallPhase::Ending,
            Markup::new().say(decision.message.clone()).hangup(),
        ),
    }
}

fn appointment_decision(
    ctx: &FlowContext<'_>,
    decision: &OrchestratorDecision,
    caller_words: &str,
) -> Transition {
    match decision.appointment_time.filter(|t| *t > ctx.now) {
        Some(starts_at) => {
            let confirmation = format!(
                "You're all set for {}. We look forward to seeing you. Goodbye.",
                spoken_time(ctx.business, starts_at)
            );
            let mut t = Transition::to(CallPhase::Ending, Markup::new().say(confirmation).hangup());
            t.update.appointment_at = Some(starts_at);
            t.effects.push(Effect::BookAppointment {
                starts_at,
                notes: Some(caller_words.trim().to_string()).filter(|n| !n.is_empty()),
            });
            t
        }
        None => transfer_or_voicemail(ctx, "I wasn't able to find a time that works."),
    }
}

/// Dial the forwarding number when there is one, otherwise take a message.
fn transfer_or_voicemail(ctx: &FlowContext<'_>, lead_in: &str) -> Transition {
    match ctx.business.forwarding() {
        Some(number) => {
            let mut t = Transition::to(
                CallPhase::Transferring,
                Markup::new().say(lead_in.to_string()).dial(number),
            )
            .handled_by(HandledBy::Human);
            t.update.transfer_target = Some(number.to_string());
            t
        }
        None => Transition::to(
            CallPhase::RecordingVoicemail,
            Markup::new().say(NO_ONE_AVAILABLE).redirect(&ctx.urls.voicemail),
        ),
    }
}

/// The model could not be reached: apologize, then transfer or take a message.
/// The call stays attributed to the assistant.
fn orchestrator_fallback(ctx: &FlowContext<'_>) -> Transition {
    let t = match ctx.business.forwarding() {
        Some(number) => {
            let mut t = Transition::to(
                CallPhase::Transferring,
                Markup::new().say(APOLOGY).dial(number),
            );
            t.update.transfer_target = Some(number.to_string());
            t
        }
        None => Transition::to(
            CallPhase::RecordingVoicemail,
            Markup::new()
                .say(APOLOGY_NO_TRANSFER)
                .say(ctx.business.voicemail_text())
                .record(&ctx.urls.recording),
        ),
    };
    t.handled_by(HandledBy::Ai)
}

fn status_changed(call: &CallSession, status: CallStatus, provider_duration: Option<i32>) -> Transition {
    let mut t = Transition {
        phase: call.phase,
        markup: Markup::empty(),
        update: CallUpdate::default(),
        effects: Vec::new(),
    };

    if status.is_terminal() {
        if call.ended_at.is_none() && call.status.can_advance_to(status) {
            t.phase = CallPhase::Completed;
            t.effects = vec![
                Effect::StampEnded {
                    status,
                    provider_duration,
                },
                Effect::Publish(Notify::CallUpdated),
            ];
        }
    } else if call.status.can_advance_to(status) {
        t.update.status = Some(status);
        t.effects = vec![Effect::Publish(Notify::CallUpdated)];
    }
    t
}

fn ended(call: &CallSession, event: &CallEvent<'_>) -> Transition {
    tracing::info!("Call {} already {}, discarding {}", call.call_sid, call.status, event_name(event));

    let mut t = Transition {
        phase: call.phase,
        markup: Markup::new().hangup(),
        update: CallUpdate::default(),
        effects: Vec::new(),
    };
    // Keep what the model learned even though the caller is gone
    if let CallEvent::Decision(decision) | CallEvent::AppointmentDecision { decision, .. } = event {
        t.update.summary = Some(decision.to_call_summary());
    }
    if let CallEvent::RecordingFinished { url, duration } = event {
        t.update.recording_url = Some(url.to_string());
        t.update.recording_duration = *duration;
        t.update.handled_by = Some(HandledBy::Voicemail);
        t.effects.push(Effect::Publish(Notify::VoicemailReceived));
    }
    t
}

fn event_name(event: &CallEvent<'_>) -> &'static str {
    match event {
        CallEvent::Incoming => "incoming",
        CallEvent::Redelivered => "redelivered",
        CallEvent::NoSpeech => "no_speech",
        CallEvent::Decision(_) => "decision",
        CallEvent::DecisionUnavailable => "decision_unavailable",
        CallEvent::AppointmentDecision { .. } => "appointment_decision",
        CallEvent::AppointmentUnavailable => "appointment_unavailable",
        CallEvent::VoicemailRequested => "voicemail_requested",
        CallEvent::RecordingFinished { .. } => "recording_finished",
        CallEvent::StatusChanged { .. } => "status_changed",
    }
}

/// Markup for a repeated delivery, derived from where the call already is.
pub fn replay_markup(ctx: &FlowContext<'_>, call: &CallSession) -> Markup {
    match call.phase {
        CallPhase::RecordingVoicemail => voicemail_markup(ctx),
        CallPhase::Transferring => match &call.transfer_target {
            Some(target) => Markup::new().dial(target.clone()),
            None => voicemail_markup(ctx),
        },
        CallPhase::Ending | CallPhase::Completed => Markup::new().hangup(),
        CallPhase::Appointment => Markup::new().gather(&ctx.urls.appointment, APPOINTMENT_PROMPT),
        CallPhase::Ringing | CallPhase::InConversation => {
            Markup::new().gather(&ctx.urls.speech, ctx.business.greeting_text())
        }
    }
}

pub fn voicemail_markup(ctx: &FlowContext<'_>) -> Markup {
    Markup::new()
        .say(ctx.business.voicemail_text())
        .record(&ctx.urls.recording)
}

/// Said to callers whose dialed number belongs to no business.
pub fn not_in_service() -> Markup {
    Markup::new().say(NOT_IN_SERVICE).hangup()
}

/// For follow-up webhooks whose call or business cannot be loaded.
pub fn terminal_fallback(forward_number: Option<&str>, recording_url: &str) -> Markup {
    match forward_number.map(str::trim).filter(|n| !n.is_empty()) {
        Some(number) => Markup::new().say(APOLOGY).dial(number),
        None => Markup::new()
            .say(APOLOGY_NO_TRANSFER)
            .say("Please leave a message after the tone.")
            .record(recording_url),
    }
}

fn closing(business: &BusinessProfile) -> String {
    format!("Thank you for calling {}. Goodbye.", business.name)
}

/// The model's words, followed by the date question unless they already ask one.
fn appointment_prompt(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        APPOINTMENT_PROMPT.to_string()
    } else if message.ends_with('?') {
        message.to_string()
    } else {
        format!("{} {}", message, APPOINTMENT_PROMPT)
    }
}

fn spoken_time(business: &BusinessProfile, at: DateTime<Utc>) -> String {
    let tz: Tz = business.timezone.parse().unwrap_or(Tz::UTC);
    at.with_timezone(&tz).format("%A, %B %-d at %-I:%M %p").to_string()
}
