use serde::Serialize;

use super::call::CallSession;
use super::sms::SmsMessage;

/// Live update pushed to dashboard listeners of one business.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    NewCall { call: CallSession },
    CallUpdated { call: CallSession },
    VoicemailReceived { call: CallSession },
    NewSms { message: SmsMessage },
    SmsUpdated { message: SmsMessage },
}

impl DashboardEvent {
    pub fn business_id(&self) -> i64 {
        match self {
            DashboardEvent::NewCall { call }
            | DashboardEvent::CallUpdated { call }
            | DashboardEvent::VoicemailReceived { call } => call.business_id,
            DashboardEvent::NewSms { message } | DashboardEvent::SmsUpdated { message } => {
                message.business_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DashboardEvent::NewCall { .. } => "new_call",
            DashboardEvent::CallUpdated { .. } => "call_updated",
            DashboardEvent::VoicemailReceived { .. } => "voicemail_received",
            DashboardEvent::NewSms { .. } => "new_sms",
            DashboardEvent::SmsUpdated { .. } => "sms_updated",
        }
    }
}
