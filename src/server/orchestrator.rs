//! Language-model orchestrator
//!
//! Turns one piece of caller/texter input into an [`OrchestratorDecision`]:
//! - builds the business-context prompt
//! - calls the model with a per-attempt timeout and linear backoff
//! - switches to [`DegradedInput`] after the first failed attempt
//! - parses the JSON reply, falling back to a safe default when it is unreadable
//!
//! Running out of attempts is the only error; callers must map it to a
//! deterministic fallback instead of letting a live call stall.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::models::{
    BusinessProfile, DecisionAction, ExtractedInfo, OrchestratorDecision, Sentiment, Urgency,
    DEFAULT_ACKNOWLEDGEMENT,
};
use super::config::LlmConfig;
use super::hours;
use super::llm::{CompletionRequest, LanguageModel, Message};
use super::sanitizer::ContentSanitizer;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Language model unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

/// Which flow is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Voice,
    Appointment,
    Sms,
}

/// Conversation context for one turn.
#[derive(Debug, Clone)]
pub struct ConversationState<'a> {
    pub channel: Channel,
    /// Prior caller fragments, newline separated
    pub transcript: &'a str,
    pub contact_name: Option<String>,
    pub now: DateTime<Utc>,
}

/// Bounded retries with linear backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_step: config.backoff_step,
            attempt_timeout: config.timeout,
        }
    }

    /// Wait after failed attempt `attempt` (1-based): `attempt * step`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }

    /// Upper bound on time spent in one `decide` call.
    pub fn ceiling(&self) -> Duration {
        let waits: u32 = (1..self.max_attempts).sum();
        self.attempt_timeout * self.max_attempts + self.backoff_step * waits
    }
}

/// Retry-with-degraded-input strategy.
///
/// The first attempt sends the caller's sanitized words. Later attempts send
/// only a category-level description, which is far less likely to be rejected
/// by the service's content filter.
pub struct DegradedInput;

impl DegradedInput {
    pub const GENERIC: &'static str = "customer inquiry about services";

    pub fn input_for_attempt(attempt: u32, original: &str) -> Cow<'_, str> {
        if attempt <= 1 {
            Cow::Borrowed(original)
        } else {
            Cow::Borrowed(Self::categorize(original))
        }
    }

    pub fn categorize(original: &str) -> &'static str {
        let lower = original.to_ascii_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["appointment", "schedule", "book", "reschedule"]) {
            "customer inquiry about scheduling an appointment"
        } else if has(&["person", "human", "representative", "someone", "transfer", "manager"]) {
            "customer asking to speak with a staff member"
        } else if has(&["price", "cost", "quote", "how much"]) {
            "customer inquiry about pricing"
        } else if has(&["open", "hours", "close"]) {
            "customer inquiry about business hours"
        } else {
            Self::GENERIC
        }
    }
}

pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    sanitizer: Arc<ContentSanitizer>,
    policy: RetryPolicy,
    max_tokens: i32,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        sanitizer: Arc<ContentSanitizer>,
        policy: RetryPolicy,
        max_tokens: i32,
    ) -> Self {
        Self {
            model,
            sanitizer,
            policy,
            max_tokens,
        }
    }

    /// Decide the next action for `input`.
    pub async fn decide(
        &self,
        input: &str,
        business: &BusinessProfile,
        state: &ConversationState<'_>,
    ) -> Result<OrchestratorDecision, OrchestratorError> {
        let sanitized = self.sanitizer.sanitize_inbound(input);
        let system = build_system_prompt(business, state);
        let history = self.sanitizer.sanitize_inbound(state.transcript);
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            let turn_input = DegradedInput::input_for_attempt(attempt, &sanitized);
            // Degraded attempts drop the verbatim history too
            let turn_history = if attempt == 1 { history.as_str() } else { "" };

            let request = CompletionRequest {
                system: system.clone(),
                messages: vec![Message::user(build_user_prompt(&turn_input, turn_history, state))],
                max_tokens: self.max_tokens,
                temperature: Some(0.3),
                json_only: true,
            };

            match tokio::time::timeout(self.policy.attempt_timeout, self.model.complete(request)).await {
                Ok(Ok(reply)) => {
                    tracing::debug!("Model reply on attempt {}: {}", attempt, reply);
                    return Ok(self.finish(&reply, business, state));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.policy.attempt_timeout)
                }
            }

            tracing::warn!(
                "Language model attempt {}/{} failed: {}",
                attempt,
                self.policy.max_attempts,
                last_error
            );

            if attempt < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff(attempt)).await;
            }
        }

        tracing::error!(
            "Language model unavailable after {} attempts",
            self.policy.max_attempts
        );
        Err(OrchestratorError::Unavailable {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    fn finish(
        &self,
        reply: &str,
        business: &BusinessProfile,
        state: &ConversationState<'_>,
    ) -> OrchestratorDecision {
        let mut decision = parse_decision(reply, &business.timezone).unwrap_or_else(|| {
            tracing::warn!("Unparseable model reply, using safe default");
            OrchestratorDecision::safe_default()
        });

        // A time in the past is not a bookable appointment
        if decision.appointment_time.is_some_and(|t| t <= state.now) {
            decision.appointment_time = None;
        }

        decision.message = self.sanitizer.sanitize_outbound(&decision.message);
        if decision.message.is_empty() {
            decision.message = DEFAULT_ACKNOWLEDGEMENT.to_string();
        }
        decision
    }
}

fn build_system_prompt(business: &BusinessProfile, state: &ConversationState<'_>) -> String {
    let tz: Tz = business.timezone.parse().unwrap_or(Tz::UTC);
    let local_now = state.now.with_timezone(&tz);

    let mut prompt = format!(
        "You are the virtual receptionist for {name}. Personality: {personality}.\n\
         Business hours: {hours}.\n\
         Current local date and time: {now}.\n",
        name = business.name,
        personality = business.personality,
        hours = hours::describe(business),
        now = local_now.format("%A %Y-%m-%d %H:%M %Z"),
    );

    if let Some(name) = &state.contact_name {
        prompt.push_str(&format!("You are speaking with {}.\n", name));
    }

    prompt.push_str(match state.channel {
        Channel::Voice => "\nThis is a live phone call. Keep the message to one or two short spoken sentences.\n\
             Choose \"transfer\" when the caller asks for a person, \"appointment\" when they want to book,\n\
             \"voicemail\" when they want to leave a message, \"end\" when they are done.\n",
        Channel::Appointment => "\nThe caller is giving a date and time for an appointment.\n\
             Set action to \"appointment\" and appointmentTime to an ISO 8601 timestamp with offset\n\
             when a specific future date and time can be determined; otherwise set appointmentTime to null\n\
             and use the message to ask them to repeat it.\n",
        Channel::Sms => "\nThis is a text message conversation. Keep replies under 300 characters.\n\
             Set shouldRespond to false for messages that need no reply (thanks, ok, stop).\n",
    });

    prompt.push_str(&format!(
        "\nRespond ONLY with a JSON object:\n\
         {{\"action\": \"{vocab}\", \"message\": string, \"shouldRespond\": boolean,\n\
          \"extractedInfo\": {{\"name\": string|null, \"phone\": string|null, \"email\": string|null,\n\
            \"intent\": string, \"urgency\": \"low|medium|high\", \"sentiment\": \"positive|neutral|negative\"}},\n\
          \"appointmentTime\": string|null, \"keywords\": [string], \"actionItems\": [string],\n\
          \"followUpRequired\": boolean, \"confidence\": number}}",
        vocab = DecisionAction::VOCABULARY,
    ));

    prompt
}

fn build_user_prompt(input: &str, history: &str, state: &ConversationState<'_>) -> String {
    let speaker = match state.channel {
        Channel::Sms => "Customer text",
        _ => "Caller said",
    };
    if history.trim().is_empty() {
        format!("{}: {}", speaker, input)
    } else {
        format!(
            "Earlier in this conversation the customer said:\n{}\n\n{}: {}",
            history, speaker, input
        )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawDecision {
    action: Option<String>,
    #[serde(alias = "response")]
    message: Option<String>,
    should_respond: Option<bool>,
    extracted_info: Option<RawExtractedInfo>,
    appointment_time: Option<String>,
    keywords: Option<Vec<String>>,
    action_items: Option<Vec<String>>,
    follow_up_required: Option<bool>,
    confidence: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawExtractedInfo {
    name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    intent: Option<String>,
    urgency: Option<String>,
    sentiment: Option<String>,
}

/// Parse a model reply. `None` means the reply is unusable.
pub fn parse_decision(reply: &str, timezone: &str) -> Option<OrchestratorDecision> {
    let json = extract_json_object(reply)?;
    let raw: RawDecision = serde_json::from_str(json).ok()?;

    if raw.action.is_none() && raw.message.is_none() {
        return None;
    }

    let info = raw.extracted_info.unwrap_or_default();
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    Some(OrchestratorDecision {
        action: raw
            .action
            .as_deref()
            .map(DecisionAction::parse_lenient)
            .unwrap_or(DecisionAction::Information),
        message: raw.message.unwrap_or_default(),
        should_respond: raw.should_respond.unwrap_or(true),
        extracted_info: ExtractedInfo {
            name: non_empty(info.name),
            phone: non_empty(info.phone),
            email: non_empty(info.email),
            intent: non_empty(info.intent),
            urgency: info.urgency.as_deref().map(Urgency::parse_lenient).unwrap_or_default(),
            sentiment: info
                .sentiment
                .as_deref()
                .map(Sentiment::parse_lenient)
                .unwrap_or_default(),
        },
        appointment_time: raw
            .appointment_time
            .as_deref()
            .and_then(|t| parse_appointment_time(t, timezone)),
        keywords: raw.keywords.unwrap_or_default(),
        action_items: raw.action_items.unwrap_or_default(),
        follow_up_required: raw.follow_up_required.unwrap_or(false),
        confidence: raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        fallback: false,
    })
}

/// Slice out the outermost `{...}`, tolerating code fences and chatter.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// RFC 3339, or a naive local time interpreted in the business timezone.
pub fn parse_appointment_time(value: &str, timezone: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }

    let tz: Tz = timezone.parse().unwrap_or(Tz::UTC);
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::llm::LanguageModelError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    pub(crate) fn business() -> BusinessProfile {
        BusinessProfile {
            id: 1,
            name: "Acme Plumbing".to_string(),
            phone_number: "+15550001111".to_string(),
            personality: "warm and efficient".to_string(),
            timezone: "America/Chicago".to_string(),
            hours: None,
            forwarding_number: None,
            greeting: None,
            voicemail_prompt: None,
            auto_response_enabled: false,
        }
    }

    fn state(channel: Channel) -> ConversationState<'static> {
        ConversationState {
            channel,
            transcript: "",
            contact_name: None,
            now: Utc::now(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    /// Replays scripted results and records what it was sent.
    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, LanguageModelError>>>,
        calls: AtomicU32,
        inputs: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, LanguageModelError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicU32::new(0),
                inputs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, request: CompletionRequest) -> Result<String, LanguageModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs
                .lock()
                .unwrap()
                .push(request.messages[0].content.clone());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Err(LanguageModelError::NetworkError("no script".into()))
            } else {
                replies.remove(0)
            }
        }
    }

    struct HangingModel;

    #[async_trait::async_trait]
    impl LanguageModel for HangingModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, LanguageModelError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn orchestrator(model: Arc<dyn LanguageModel>, policy: RetryPolicy) -> Orchestrator {
        Orchestrator::new(model, Arc::new(ContentSanitizer::new()), policy, 200)
    }

    fn overloaded() -> LanguageModelError {
        LanguageModelError::ApiError {
            status: 529,
            message: "Overloaded".into(),
            error_type: "overloaded_error".into(),
        }
    }

    #[tokio::test]
    async fn test_parses_structured_reply() {
        let model = ScriptedModel::new(vec![Ok(r#"{"action":"transfer","message":"Connecting you now.","shouldRespond":true,
            "extractedInfo":{"name":"Dana","intent":"speak to a person","urgency":"high","sentiment":"negative"}}"#
            .to_string())]);
        let orch = orchestrator(model.clone(), fast_policy());

        let d = orch
            .decide("I'd like to transfer to a person", &business(), &state(Channel::Voice))
            .await
            .unwrap();
        assert_eq!(d.action, DecisionAction::Transfer);
        assert_eq!(d.message, "Connecting you now.");
        assert_eq!(d.extracted_info.name.as_deref(), Some("Dana"));
        assert_eq!(d.extracted_info.urgency, Urgency::High);
        assert!(!d.fallback);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_becomes_safe_default() {
        let model = ScriptedModel::new(vec![Ok("Sure! I can help with that.".to_string())]);
        let orch = orchestrator(model, fast_policy());

        let d = orch.decide("hello", &business(), &state(Channel::Voice)).await.unwrap();
        assert_eq!(d, {
            let mut expected = OrchestratorDecision::safe_default();
            expected.message = ContentSanitizer::new().sanitize_outbound(&expected.message);
            expected
        });
    }

    #[tokio::test]
    async fn test_retries_with_degraded_input() {
        let model = ScriptedModel::new(vec![
            Err(overloaded()),
            Ok(r#"{"action":"information","message":"We are open until five."}"#.to_string()),
        ]);
        let orch = orchestrator(model.clone(), fast_policy());

        let d = orch
            .decide("my boiler might explode, are you open", &business(), &state(Channel::Voice))
            .await
            .unwrap();
        assert_eq!(d.action, DecisionAction::Information);

        let inputs = model.inputs.lock().unwrap();
        assert_eq!(inputs.len(), 2);
        assert!(inputs[0].contains("my boiler might break"));
        assert!(inputs[1].contains("customer inquiry about business hours"));
        assert!(!inputs[1].contains("boiler"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_typed_error() {
        let model = ScriptedModel::new(vec![Err(overloaded()), Err(overloaded()), Err(overloaded())]);
        let orch = orchestrator(model.clone(), fast_policy());

        let err = orch.decide("hello", &business(), &state(Channel::Voice)).await.unwrap_err();
        let OrchestratorError::Unavailable { attempts, .. } = err;
        assert_eq!(attempts, 3);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returns_within_ceiling() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(8),
        };
        let orch = orchestrator(Arc::new(HangingModel), policy);

        let started = tokio::time::Instant::now();
        let result = orch.decide("hello", &business(), &state(Channel::Voice)).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        // 3 timeouts of 8s plus backoffs of 1s and 2s
        assert_eq!(policy.ceiling(), Duration::from_secs(27));
        assert!(elapsed <= policy.ceiling() + Duration::from_millis(50), "{elapsed:?}");
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_tolerates_fences_and_unknowns() {
        let reply = "```json\n{\"action\":\"celebrate\",\"message\":\"Hi\",\"keywords\":null}\n```";
        let d = parse_decision(reply, "UTC").unwrap();
        assert_eq!(d.action, DecisionAction::Information);
        assert!(d.keywords.is_empty());

        assert!(parse_decision("{}", "UTC").is_none());
        assert!(parse_decision("no json here", "UTC").is_none());
        assert!(parse_decision("{\"action\": }", "UTC").is_none());
    }

    #[test]
    fn test_appointment_time_formats() {
        let t = parse_appointment_time("2030-03-05T14:00:00-05:00", "UTC").unwrap();
        assert_eq!(t.to_rfc3339(), "2030-03-05T19:00:00+00:00");

        let local = parse_appointment_time("2030-03-05 14:00", "America/Chicago").unwrap();
        assert_eq!(local.to_rfc3339(), "2030-03-05T20:00:00+00:00");

        assert!(parse_appointment_time("next tuesday", "UTC").is_none());
    }

    #[tokio::test]
    async fn test_past_appointment_dropped() {
        let model = ScriptedModel::new(vec![Ok(
            r#"{"action":"appointment","message":"Booked","appointmentTime":"2001-01-01T10:00:00Z"}"#.to_string(),
        )]);
        let orch = orchestrator(model, fast_policy());
        let d = orch
            .decide("January first 2001", &business(), &state(Channel::Appointment))
            .await
            .unwrap();
        assert!(d.appointment_time.is_none());
    }

    #[test]
    fn test_degraded_categories() {
        assert_eq!(
            DegradedInput::input_for_attempt(1, "can I book Tuesday"),
            "can I book Tuesday"
        );
        assert_eq!(
            DegradedInput::input_for_attempt(2, "can I book Tuesday"),
            "customer inquiry about scheduling an appointment"
        );
        assert_eq!(DegradedInput::categorize("blah"), DegradedInput::GENERIC);
    }
}
