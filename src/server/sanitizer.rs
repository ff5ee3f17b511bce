//! Content sanitizer
//!
//! Best-effort text normalization applied around the language-model call:
//! - `prefilter`: swaps risk-coded words for neutral ones (inbound and outbound)
//! - `polish`: keeps outbound speech speakable and short (outbound only)
//!
//! This lowers the odds of a content-filter rejection. It is not a security or
//! policy boundary and is trivially bypassed.

use regex::{Captures, Regex};
use std::collections::HashMap;

/// Word substitutions. Kept as data so the list can be reviewed in one place.
/// Support vocabulary ("password", "account", "card") is intentionally absent.
pub const SUBSTITUTIONS: &[(&str, &str)] = &[
    ("kill", "stop"),
    ("killing", "stopping"),
    ("killed", "stopped"),
    ("die", "stop working"),
    ("dying", "failing"),
    ("dead", "not working"),
    ("attack", "issue"),
    ("attacked", "affected"),
    ("shoot", "send"),
    ("shot", "sent"),
    ("bomb", "failure"),
    ("explode", "break"),
    ("exploded", "broke"),
    ("hack", "access"),
    ("hacked", "accessed"),
    ("exploit", "use"),
    ("weapon", "tool"),
    ("destroy", "remove"),
    ("destroyed", "removed"),
    ("steal", "take"),
    ("stolen", "missing"),
    ("threat", "concern"),
    ("threaten", "warn"),
    ("murder", "problem"),
    ("hate", "dislike"),
    ("damn", "darn"),
    ("hell", "heck"),
];

/// Spoken replies longer than this are cut at a sentence boundary.
pub const MAX_SPOKEN_CHARS: usize = 480;

pub struct ContentSanitizer {
    pattern: Regex,
    replacements: HashMap<&'static str, &'static str>,
    markup_noise: Regex,
    whitespace: Regex,
}

impl Default for ContentSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentSanitizer {
    pub fn new() -> Self {
        let alternation = SUBSTITUTIONS
            .iter()
            .map(|(word, _)| regex::escape(word))
            .collect::<Vec<_>>()
            .join("|");

        Self {
            pattern: Regex::new(&format!(r"(?i)\b({})\b", alternation))
                .expect("substitution list builds a valid pattern"),
            replacements: SUBSTITUTIONS.iter().copied().collect(),
            markup_noise: Regex::new(r"[*_`#>|~\[\]]+").expect("static pattern"),
            whitespace: Regex::new(r"\s+").expect("static pattern"),
        }
    }

    /// Deny-list stage: neutral synonyms for risk-coded words.
    pub fn prefilter(&self, text: &str) -> String {
        self.pattern
            .replace_all(text, |caps: &Captures| {
                let matched = &caps[0];
                let replacement = self
                    .replacements
                    .get(matched.to_ascii_lowercase().as_str())
                    .copied()
                    .unwrap_or(matched);
                match_case(matched, replacement)
            })
            .into_owned()
    }

    /// Tone stage for outbound text: no markdown, single spaces, bounded length.
    pub fn polish(&self, text: &str) -> String {
        let stripped = self.markup_noise.replace_all(text, "");
        let collapsed = self.whitespace.replace_all(stripped.trim(), " ");
        truncate_at_sentence(&collapsed, MAX_SPOKEN_CHARS)
    }

    /// Inbound caller text going to the model.
    pub fn sanitize_inbound(&self, text: &str) -> String {
        self.prefilter(text.trim())
    }

    /// Model text going back to the caller.
    pub fn sanitize_outbound(&self, text: &str) -> String {
        self.polish(&self.prefilter(text))
    }
}

fn match_case(original: &str, replacement: &str) -> String {
    if original.len() > 1 && original.chars().all(|c| !c.is_alphabetic() || c.is_uppercase()) {
        return replacement.to_uppercase();
    }
    match original.chars().next() {
        Some(first) if first.is_uppercase() => {
            let mut chars = replacement.chars();
            match chars.next() {
                Some(r) => r.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
        _ => replacement.to_string(),
    }
}

fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut: String = text.chars().take(max_chars).collect();
    match cut.rfind(['.', '!', '?']) {
        Some(idx) if idx > max_chars / 3 => cut[..=idx].to_string(),
        _ => match cut.rfind(' ') {
            Some(idx) => format!("{}.", cut[..idx].trim_end_matches([',', ';', ':'])),
            None => cut,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_word_substitution() {
        let s = ContentSanitizer::new();
        assert_eq!(
            s.prefilter("my water heater is dead and the pipe might explode"),
            "my water heater is not working and the pipe might break"
        );
        // Substrings are left alone
        assert_eq!(s.prefilter("the skill level"), "the skill level");
        assert_eq!(s.prefilter("Shelly called"), "Shelly called");
    }

    #[test]
    fn test_case_preserved() {
        let s = ContentSanitizer::new();
        assert_eq!(s.prefilter("Kill the power"), "Stop the power");
        assert_eq!(s.prefilter("KILL"), "STOP");
    }

    #[test]
    fn test_support_vocabulary_untouched() {
        let s = ContentSanitizer::new();
        let text = "I forgot my password and my account is locked";
        assert_eq!(s.prefilter(text), text);
    }

    #[test]
    fn test_polish_strips_markdown() {
        let s = ContentSanitizer::new();
        assert_eq!(
            s.polish("**Great news!**  We're   open\n\n# today"),
            "Great news! We're open today"
        );
    }

    #[test]
    fn test_polish_truncates_at_sentence() {
        let s = ContentSanitizer::new();
        let long = "This is a sentence. ".repeat(60);
        let out = s.polish(&long);
        assert!(out.chars().count() <= MAX_SPOKEN_CHARS);
        assert!(out.ends_with('.'));
    }
}
