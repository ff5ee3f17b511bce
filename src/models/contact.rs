use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// First name given to contacts created from an unknown number.
pub const PLACEHOLDER_FIRST_NAME: &str = "Unknown";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    #[serde(rename = "businessId")]
    pub business_id: i64,
    pub phone: String,
    /// Trailing ten digits of `phone`; unique per business.
    #[serde(rename = "phoneKey")]
    pub phone_key: String,
    #[serde(rename = "firstName")]
    pub first_name: String,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "contactType")]
    pub contact_type: ContactType,
    #[serde(rename = "relationshipStatus")]
    pub relationship_status: RelationshipStatus,
    pub source: ContactSource,
    #[serde(rename = "totalCalls")]
    pub total_calls: i32,
    #[serde(rename = "totalSms")]
    pub total_sms: i32,
    #[serde(rename = "lastContactedAt")]
    pub last_contacted_at: Option<DateTime<Utc>>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Contact {
    pub fn full_name(&self) -> String {
        let last = self.last_name.as_deref().unwrap_or("");
        format!("{} {}", self.first_name, last).trim().to_string()
    }

    pub fn has_placeholder_name(&self) -> bool {
        self.first_name == PLACEHOLDER_FIRST_NAME && self.last_name.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub business_id: i64,
    pub phone: String,
    pub phone_key: String,
    pub source: ContactSource,
}

/// Which counter an interaction bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Call,
    Sms,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContactType {
    Lead,
    Customer,
    Vendor,
    Other,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Lead => "lead",
            ContactType::Customer => "customer",
            ContactType::Vendor => "vendor",
            ContactType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "customer" => ContactType::Customer,
            "vendor" => ContactType::Vendor,
            "other" => ContactType::Other,
            _ => ContactType::Lead,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    Cold,
    Warm,
    Hot,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Cold => "cold",
            RelationshipStatus::Warm => "warm",
            RelationshipStatus::Hot => "hot",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "warm" => RelationshipStatus::Warm,
            "hot" => RelationshipStatus::Hot,
            _ => RelationshipStatus::Cold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContactSource {
    Phone,
    Sms,
}

impl ContactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactSource::Phone => "phone",
            ContactSource::Sms => "sms",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "sms" => ContactSource::Sms,
            _ => ContactSource::Phone,
        }
    }
}
