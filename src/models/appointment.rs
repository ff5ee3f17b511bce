use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    pub id: i64,
    #[serde(rename = "businessId")]
    pub business_id: i64,
    #[serde(rename = "contactId")]
    pub contact_id: Option<i64>,
    #[serde(rename = "callSid")]
    pub call_sid: Option<String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    pub status: String,
    pub notes: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub business_id: i64,
    pub contact_id: Option<i64>,
    pub call_sid: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub notes: Option<String>,
}
