use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use super::decision::Sentiment;

/// One phone call, keyed by the provider's call identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSession {
    pub id: i64,
    #[serde(rename = "businessId")]
    pub business_id: i64,
    #[serde(rename = "callSid")]
    pub call_sid: String,
    #[serde(rename = "fromNumber")]
    pub from_number: String,
    #[serde(rename = "toNumber")]
    pub to_number: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub phase: CallPhase,
    #[serde(rename = "contactId")]
    pub contact_id: Option<i64>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endedAt")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: Option<i32>,
    pub transcript: String,
    #[serde(rename = "handledBy")]
    pub handled_by: HandledBy,
    #[serde(rename = "transferTarget")]
    pub transfer_target: Option<String>,
    #[serde(rename = "recordingUrl")]
    pub recording_url: Option<String>,
    #[serde(rename = "recordingDuration")]
    pub recording_duration: Option<i32>,
    pub summary: Option<CallSummary>,
    #[serde(rename = "appointmentAt")]
    pub appointment_at: Option<DateTime<Utc>>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    /// Append one speech fragment; fragments are newline separated.
    pub fn append_transcript(&mut self, fragment: &str) {
        if !self.transcript.is_empty() {
            self.transcript.push('\n');
        }
        self.transcript.push_str(fragment);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fields needed to open a new call record.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub business_id: i64,
    pub call_sid: String,
    pub from_number: String,
    pub to_number: String,
    pub direction: CallDirection,
    pub contact_id: Option<i64>,
    pub phase: CallPhase,
    pub handled_by: HandledBy,
}

/// Partial update applied to a call under its lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallUpdate {
    pub status: Option<CallStatus>,
    pub phase: Option<CallPhase>,
    pub handled_by: Option<HandledBy>,
    pub transfer_target: Option<String>,
    pub recording_url: Option<String>,
    pub recording_duration: Option<i32>,
    pub summary: Option<CallSummary>,
    pub appointment_at: Option<DateTime<Utc>>,
}

impl CallUpdate {
    pub fn is_empty(&self) -> bool {
        *self == CallUpdate::default()
    }
}

/// AI-derived summary of the conversation so far.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CallSummary {
    pub intent: Option<String>,
    pub sentiment: Sentiment,
    pub keywords: Vec<String>,
    #[serde(rename = "actionItems")]
    pub action_items: Vec<String>,
    #[serde(rename = "followUpRequired")]
    pub follow_up_required: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }

    /// Provider directions look like `inbound`, `outbound-api`, `outbound-dial`.
    pub fn from_provider(value: &str) -> Self {
        if value.trim().to_ascii_lowercase().starts_with("outbound") {
            CallDirection::Outbound
        } else {
            CallDirection::Inbound
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Queued,
    Ringing,
    Answered,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Ringing => "ringing",
            CallStatus::Answered => "answered",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no-answer",
            CallStatus::Canceled => "canceled",
        }
    }

    /// Parse a provider status. `in-progress` is the provider's word for answered.
    pub fn from_provider(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" | "initiated" => Some(CallStatus::Queued),
            "ringing" => Some(CallStatus::Ringing),
            "answered" | "in-progress" => Some(CallStatus::Answered),
            "completed" => Some(CallStatus::Completed),
            "busy" => Some(CallStatus::Busy),
            "failed" => Some(CallStatus::Failed),
            "no-answer" | "no_answer" => Some(CallStatus::NoAnswer),
            "canceled" | "cancelled" => Some(CallStatus::Canceled),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Queued => 0,
            CallStatus::Ringing => 1,
            CallStatus::Answered => 2,
            _ => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Monotonic rule: only strictly forward moves, nothing leaves a terminal status.
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses from which `next` may be reached.
    pub fn predecessors_of(next: CallStatus) -> Vec<&'static str> {
        [
            CallStatus::Queued,
            CallStatus::Ringing,
            CallStatus::Answered,
        ]
        .iter()
        .filter(|s| s.can_advance_to(next))
        .map(|s| s.as_str())
        .collect()
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the call sits in the conversation flow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Ringing,
    InConversation,
    Appointment,
    Transferring,
    RecordingVoicemail,
    Ending,
    Completed,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Ringing => "ringing",
            CallPhase::InConversation => "in_conversation",
            CallPhase::Appointment => "appointment",
            CallPhase::Transferring => "transferring",
            CallPhase::RecordingVoicemail => "recording_voicemail",
            CallPhase::Ending => "ending",
            CallPhase::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ringing" => Some(CallPhase::Ringing),
            "in_conversation" => Some(CallPhase::InConversation),
            "appointment" => Some(CallPhase::Appointment),
            "transferring" => Some(CallPhase::Transferring),
            "recording_voicemail" => Some(CallPhase::RecordingVoicemail),
            "ending" => Some(CallPhase::Ending),
            "completed" => Some(CallPhase::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandledBy {
    Ai,
    Human,
    Voicemail,
}

impl HandledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandledBy::Ai => "ai",
            HandledBy::Human => "human",
            HandledBy::Voicemail => "voicemail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ai" => Some(HandledBy::Ai),
            "human" => Some(HandledBy::Human),
            "voicemail" => Some(HandledBy::Voicemail),
            _ => None,
        }
    }
}
