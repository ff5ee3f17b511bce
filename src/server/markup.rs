//! Provider response markup
//!
//! Typed verbs rendered to the telephony provider's XML response document.

use axum::{
    http::header,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

const SPEECH_TIMEOUT_SECS: u32 = 5;
const VOICEMAIL_MAX_SECS: u32 = 120;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verb {
    Say(String),
    /// Collect speech (and keypad digits) and post the result to `action`.
    Gather {
        action: String,
        timeout_secs: u32,
        prompt: Vec<Verb>,
    },
    Dial(String),
    Record { action: String, max_length_secs: u32 },
    /// Outbound text. `status_callback` receives its delivery updates.
    Message {
        body: String,
        status_callback: Option<String>,
    },
    Redirect(String),
    Hangup,
}

/// A complete `<Response>` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Markup {
    verbs: Vec<Verb>,
}

impl Markup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty acknowledgement.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn say(mut self, text: impl Into<String>) -> Self {
        self.verbs.push(Verb::Say(text.into()));
        self
    }

    pub fn gather(mut self, action: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.verbs.push(Verb::Gather {
            action: action.into(),
            timeout_secs: SPEECH_TIMEOUT_SECS,
            prompt: vec![Verb::Say(prompt.into())],
        });
        self
    }

    pub fn dial(mut self, number: impl Into<String>) -> Self {
        self.verbs.push(Verb::Dial(number.into()));
        self
    }

    pub fn record(mut self, action: impl Into<String>) -> Self {
        self.verbs.push(Verb::Record {
            action: action.into(),
            max_length_secs: VOICEMAIL_MAX_SECS,
        });
        self
    }

    pub fn message(mut self, body: impl Into<String>, status_callback: Option<String>) -> Self {
        self.verbs.push(Verb::Message {
            body: body.into(),
            status_callback,
        });
        self
    }

    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.verbs.push(Verb::Redirect(url.into()));
        self
    }

    pub fn hangup(mut self) -> Self {
        self.verbs.push(Verb::Hangup);
        self
    }

    #[cfg(test)]
    pub fn verbs(&self) -> &[Verb] {
        &self.verbs
    }

    #[cfg(test)]
    pub fn has_gather(&self) -> bool {
        self.verbs.iter().any(|v| matches!(v, Verb::Gather { .. }))
    }

    #[cfg(test)]
    pub fn dialed_number(&self) -> Option<&str> {
        self.verbs.iter().find_map(|v| match v {
            Verb::Dial(n) => Some(n.as_str()),
            _ => None,
        })
    }

    pub fn render(&self) -> String {
        let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#);
        for verb in &self.verbs {
            render_verb(verb, &mut xml);
        }
        xml.push_str("</Response>");
        xml
    }
}

fn render_verb(verb: &Verb, out: &mut String) {
    match verb {
        Verb::Say(text) => out.push_str(&format!("<Say>{}</Say>", escape(text))),
        Verb::Gather {
            action,
            timeout_secs,
            prompt,
        } => {
            out.push_str(&format!(
                r#"<Gather input="speech dtmf" action="{}" method="POST" timeout="{}" speechTimeout="auto" actionOnEmptyResult="true">"#,
                escape(action),
                timeout_secs
            ));
            for inner in prompt {
                render_verb(inner, out);
            }
            out.push_str("</Gather>");
        }
        Verb::Dial(number) => out.push_str(&format!("<Dial>{}</Dial>", escape(number))),
        Verb::Record {
            action,
            max_length_secs,
        } => out.push_str(&format!(
            r#"<Record action="{}" method="POST" maxLength="{}" playBeep="true"/>"#,
            escape(action),
            max_length_secs
        )),
        Verb::Message {
            body,
            status_callback: Some(url),
        } => out.push_str(&format!(
            r#"<Message statusCallback="{}">{}</Message>"#,
            escape(url),
            escape(body)
        )),
        Verb::Message {
            body,
            status_callback: None,
        } => out.push_str(&format!("<Message>{}</Message>", escape(body))),
        Verb::Redirect(url) => {
            out.push_str(&format!(r#"<Redirect method="POST">{}</Redirect>"#, escape(url)))
        }
        Verb::Hangup => out.push_str("<Hangup/>"),
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl IntoResponse for Markup {
    fn into_response(self) -> Response {
        ([(header::CONTENT_TYPE, "text/xml")], self.render()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_nests_prompt() {
        let xml = Markup::new()
            .gather("/voice/speech", "How can I help?")
            .render();
        assert!(xml.contains(r#"action="/voice/speech""#));
        assert!(xml.contains("<Gather"));
        assert!(xml.contains("<Say>How can I help?</Say></Gather>"));
    }

    #[test]
    fn test_text_is_escaped() {
        let xml = Markup::new().say("Tom & Jerry's <plumbing>").render();
        assert!(xml.contains("<Say>Tom &amp; Jerry&apos;s &lt;plumbing&gt;</Say>"));
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(
            Markup::empty().render(),
            r#"<?xml version="1.0" encoding="UTF-8"?><Response></Response>"#
        );
    }

    #[test]
    fn test_message_status_callback() {
        let xml = Markup::new()
            .message("See you Monday", Some("/sms/status?replyId=4&x=1".to_string()))
            .render();
        assert!(xml.contains(
            r#"<Message statusCallback="/sms/status?replyId=4&amp;x=1">See you Monday</Message>"#
        ));
        let plain = Markup::new().message("Hi", None).render();
        assert!(plain.contains("<Message>Hi</Message>"));
    }

    #[test]
    fn test_inspection_helpers() {
        let m = Markup::new().say("Connecting").dial("+15550002222");
        assert_eq!(m.dialed_number(), Some("+15550002222"));
        assert!(!m.has_gather());
    }
}
