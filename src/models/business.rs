use serde::{Deserialize, Serialize};
use chrono::NaiveTime;

/// Business account settings the call and SMS flows depend on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessProfile {
    pub id: i64,
    pub name: String,
    #[serde(rename = "phoneNumber")]
    pub phone_number: String,
    pub personality: String,
    /// IANA zone name, e.g. `America/New_York`.
    pub timezone: String,
    /// `None` means the line is always open.
    pub hours: Option<WeeklyHours>,
    #[serde(rename = "forwardingNumber")]
    pub forwarding_number: Option<String>,
    pub greeting: Option<String>,
    #[serde(rename = "voicemailPrompt")]
    pub voicemail_prompt: Option<String>,
    #[serde(rename = "autoResponseEnabled")]
    pub auto_response_enabled: bool,
}

impl BusinessProfile {
    pub fn greeting_text(&self) -> String {
        self.greeting.clone().unwrap_or_else(|| {
            format!("Thank you for calling {}. How can I help you today?", self.name)
        })
    }

    pub fn voicemail_text(&self) -> String {
        self.voicemail_prompt.clone().unwrap_or_else(|| {
            format!(
                "Thank you for calling {}. We're unable to take your call right now. \
                 Please leave a message after the tone and we'll get back to you.",
                self.name
            )
        })
    }

    pub fn forwarding(&self) -> Option<&str> {
        self.forwarding_number
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
    }
}

/// Opening hours indexed Monday = 0 .. Sunday = 6.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WeeklyHours {
    pub days: [Option<DayHours>; 7],
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DayHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}
