use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use super::decision::Sentiment;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmsMessage {
    pub id: i64,
    #[serde(rename = "businessId")]
    pub business_id: i64,
    #[serde(rename = "messageSid")]
    pub message_sid: Option<String>,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub direction: SmsDirection,
    #[serde(rename = "fromNumber")]
    pub from_number: String,
    #[serde(rename = "toNumber")]
    pub to_number: String,
    pub body: String,
    pub status: SmsStatus,
    #[serde(rename = "contactId")]
    pub contact_id: Option<i64>,
    #[serde(rename = "isAutoResponse")]
    pub is_auto_response: bool,
    #[serde(rename = "inReplyTo")]
    pub in_reply_to: Option<i64>,
    pub analysis: Option<SmsAnalysis>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSms {
    pub business_id: i64,
    pub message_sid: Option<String>,
    pub thread_id: String,
    pub direction: SmsDirection,
    pub from_number: String,
    pub to_number: String,
    pub body: String,
    pub status: SmsStatus,
    pub contact_id: Option<i64>,
    pub is_auto_response: bool,
    pub in_reply_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SmsAnalysis {
    pub intent: Option<String>,
    pub sentiment: Sentiment,
    #[serde(rename = "suggestedResponse")]
    pub suggested_response: Option<String>,
    pub confidence: f32,
    #[serde(rename = "requiresResponse")]
    pub requires_response: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmsDirection {
    Inbound,
    Outbound,
}

impl SmsDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsDirection::Inbound => "inbound",
            SmsDirection::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmsStatus {
    Received,
    Queued,
    Sending,
    Sent,
    Delivered,
    Undelivered,
    Failed,
}

impl SmsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsStatus::Received => "received",
            SmsStatus::Queued => "queued",
            SmsStatus::Sending => "sending",
            SmsStatus::Sent => "sent",
            SmsStatus::Delivered => "delivered",
            SmsStatus::Undelivered => "undelivered",
            SmsStatus::Failed => "failed",
        }
    }

    pub fn from_provider(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "received" | "receiving" => Some(SmsStatus::Received),
            "queued" | "accepted" | "scheduled" => Some(SmsStatus::Queued),
            "sending" => Some(SmsStatus::Sending),
            "sent" => Some(SmsStatus::Sent),
            "delivered" | "read" => Some(SmsStatus::Delivered),
            "undelivered" => Some(SmsStatus::Undelivered),
            "failed" | "canceled" => Some(SmsStatus::Failed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SmsStatus::Queued => 0,
            SmsStatus::Sending => 1,
            SmsStatus::Sent => 2,
            _ => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn can_advance_to(&self, next: SmsStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn predecessors_of(next: SmsStatus) -> Vec<&'static str> {
        [SmsStatus::Queued, SmsStatus::Sending, SmsStatus::Sent]
            .iter()
            .filter(|s| s.can_advance_to(next))
            .map(|s| s.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_status_monotonic() {
        assert!(SmsStatus::Queued.can_advance_to(SmsStatus::Sent));
        assert!(SmsStatus::Sent.can_advance_to(SmsStatus::Delivered));
        assert!(!SmsStatus::Delivered.can_advance_to(SmsStatus::Sent));
        assert!(!SmsStatus::Failed.can_advance_to(SmsStatus::Delivered));
        assert!(!SmsStatus::Received.can_advance_to(SmsStatus::Delivered));
    }

    #[test]
    fn test_provider_sms_status() {
        assert_eq!(SmsStatus::from_provider("accepted"), Some(SmsStatus::Queued));
        assert_eq!(SmsStatus::from_provider("DELIVERED"), Some(SmsStatus::Delivered));
        assert_eq!(SmsStatus::from_provider("nope"), None);
    }
}
