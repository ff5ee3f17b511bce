use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use super::call::CallSummary;
use super::sms::SmsAnalysis;

pub const DEFAULT_ACKNOWLEDGEMENT: &str =
    "Thank you for reaching out. I'd be happy to help you with that.";

/// What the state machine should do next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionAction {
    Transfer,
    Appointment,
    Information,
    Voicemail,
    End,
}

impl DecisionAction {
    pub const VOCABULARY: &'static str = "transfer|appointment|information|voicemail|end";

    /// Unknown actions are read as `information`.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "transfer" => DecisionAction::Transfer,
            "appointment" => DecisionAction::Appointment,
            "voicemail" => DecisionAction::Voicemail,
            "end" => DecisionAction::End,
            _ => DecisionAction::Information,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Transfer => "transfer",
            DecisionAction::Appointment => "appointment",
            DecisionAction::Information => "information",
            DecisionAction::Voicemail => "voicemail",
            DecisionAction::End => "end",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Medium,
    High,
}

impl Urgency {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Urgency::Low,
            "high" | "urgent" => Urgency::High,
            _ => Urgency::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "negative" => Sentiment::Negative,
            _ => Sentiment::Neutral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtractedInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub intent: Option<String>,
    pub urgency: Urgency,
    pub sentiment: Sentiment,
}

/// Structured result of one language-model turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorDecision {
    pub action: DecisionAction,
    pub message: String,
    #[serde(rename = "shouldRespond")]
    pub should_respond: bool,
    #[serde(rename = "extractedInfo")]
    pub extracted_info: ExtractedInfo,
    #[serde(rename = "appointmentTime")]
    pub appointment_time: Option<DateTime<Utc>>,
    pub keywords: Vec<String>,
    #[serde(rename = "actionItems")]
    pub action_items: Vec<String>,
    #[serde(rename = "followUpRequired")]
    pub follow_up_required: bool,
    pub confidence: f32,
    /// Set when the reply could not be parsed and this is the safe default.
    pub fallback: bool,
}

impl OrchestratorDecision {
    /// Used whenever the model's reply cannot be read.
    pub fn safe_default() -> Self {
        Self {
            action: DecisionAction::Information,
            message: DEFAULT_ACKNOWLEDGEMENT.to_string(),
            should_respond: true,
            extracted_info: ExtractedInfo {
                intent: Some("general inquiry".to_string()),
                ..ExtractedInfo::default()
            },
            appointment_time: None,
            keywords: Vec::new(),
            action_items: Vec::new(),
            follow_up_required: false,
            confidence: 0.0,
            fallback: true,
        }
    }

    pub fn to_call_summary(&self) -> CallSummary {
        CallSummary {
            intent: self.extracted_info.intent.clone(),
            sentiment: self.extracted_info.sentiment,
            keywords: self.keywords.clone(),
            action_items: self.action_items.clone(),
            follow_up_required: self.needs_follow_up(),
        }
    }

    pub fn to_sms_analysis(&self) -> SmsAnalysis {
        SmsAnalysis {
            intent: self.extracted_info.intent.clone(),
            sentiment: self.extracted_info.sentiment,
            suggested_response: Some(self.message.clone()).filter(|m| !m.is_empty()),
            confidence: self.confidence,
            requires_response: self.should_respond || self.needs_follow_up(),
        }
    }

    pub fn needs_follow_up(&self) -> bool {
        self.follow_up_required
            || self.extracted_info.urgency == Urgency::High
            || matches!(self.action, DecisionAction::Transfer | DecisionAction::Voicemail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_default_shape() {
        let d = OrchestratorDecision::safe_default();
        assert_eq!(d.action, DecisionAction::Information);
        assert_eq!(d.extracted_info.urgency, Urgency::Medium);
        assert_eq!(d.extracted_info.sentiment, Sentiment::Neutral);
        assert!(d.fallback);
        assert!(!d.message.is_empty());
    }

    #[test]
    fn test_unknown_action_reads_as_information() {
        assert_eq!(DecisionAction::parse_lenient("dance"), DecisionAction::Information);
        assert_eq!(DecisionAction::parse_lenient(" Transfer "), DecisionAction::Transfer);
    }

    #[test]
    fn test_follow_up_from_urgency() {
        let mut d = OrchestratorDecision::safe_default();
        assert!(!d.to_call_summary().follow_up_required);
        d.extracted_info.urgency = Urgency::High;
        assert!(d.to_call_summary().follow_up_required);
    }
}
