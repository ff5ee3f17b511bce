//! Contact resolution
//!
//! Maps a raw phone number to the business's contact, creating a placeholder
//! lead the first time a number is seen.

use std::sync::Arc;

use crate::models::{Contact, ContactSource, ExtractedInfo, NewContact, PLACEHOLDER_FIRST_NAME};
use super::ledger::{Ledger, LedgerResult};

/// Digits only.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Trailing ten digits of the normalized number, so `+1 (555) 123-4567` and
/// `5551234567` share a key.
pub fn phone_key(raw: &str) -> String {
    let digits = normalize_phone(raw);
    let skip = digits.len().saturating_sub(10);
    digits[skip..].to_string()
}

pub struct ContactResolver {
    ledger: Arc<dyn Ledger>,
}

impl ContactResolver {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Find or create. Numbers without digits (withheld caller id) have no contact.
    pub async fn resolve(
        &self,
        business_id: i64,
        raw_phone: &str,
        source: ContactSource,
    ) -> LedgerResult<Option<Contact>> {
        let key = phone_key(raw_phone);
        if key.is_empty() {
            return Ok(None);
        }

        if let Some(existing) = self.ledger.find_contact(business_id, &key).await? {
            return Ok(Some(existing));
        }

        let contact = self
            .ledger
            .insert_contact_if_absent(NewContact {
                business_id,
                phone: raw_phone.trim().to_string(),
                phone_key: key,
                source,
            })
            .await?;

        if contact.has_placeholder_name() {
            tracing::info!("New contact {} for business {}", contact.id, business_id);
        }
        Ok(Some(contact))
    }

    /// Fill placeholder name / missing email from what the model extracted.
    pub async fn enrich(&self, contact: &Contact, info: &ExtractedInfo) -> LedgerResult<Option<Contact>> {
        let name = info
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty() && contact.has_placeholder_name());
        let email = info
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| e.contains('@') && contact.email.is_none());

        if name.is_none() && email.is_none() {
            return Ok(None);
        }

        let (first, last) = match name {
            Some(full) => split_name(full),
            None => (None, None),
        };

        self.ledger
            .update_contact_identity(contact.id, first, last, email)
            .await
    }
}

fn split_name(full: &str) -> (Option<&str>, Option<&str>) {
    match full.split_once(char::is_whitespace) {
        Some((first, rest)) => (Some(first), Some(rest.trim()).filter(|r| !r.is_empty())),
        None if full != PLACEHOLDER_FIRST_NAME => (Some(full), None),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InteractionKind;
    use crate::server::ledger::MemoryLedger;
    use chrono::Utc;

    fn resolver() -> (ContactResolver, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        (ContactResolver::new(ledger.clone()), ledger)
    }

    #[test]
    fn test_phone_key() {
        assert_eq!(phone_key("+1 (555) 123-4567"), "5551234567");
        assert_eq!(phone_key("5551234567"), "5551234567");
        assert_eq!(phone_key("123"), "123");
        assert_eq!(phone_key("anonymous"), "");
    }

    #[tokio::test]
    async fn test_formats_resolve_to_same_contact() {
        let (resolver, _) = resolver();
        let a = resolver
            .resolve(1, "+1 (555) 123-4567", ContactSource::Phone)
            .await
            .unwrap()
            .unwrap();
        let b = resolver
            .resolve(1, "5551234567", ContactSource::Sms)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.source, ContactSource::Phone);
        assert_eq!(a.first_name, PLACEHOLDER_FIRST_NAME);
    }

    #[tokio::test]
    async fn test_contacts_scoped_per_business() {
        let (resolver, _) = resolver();
        let a = resolver.resolve(1, "5551234567", ContactSource::Phone).await.unwrap().unwrap();
        let b = resolver.resolve(2, "5551234567", ContactSource::Phone).await.unwrap().unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_withheld_number_has_no_contact() {
        let (resolver, _) = resolver();
        assert!(resolver.resolve(1, "anonymous", ContactSource::Phone).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enrich_only_fills_placeholders() {
        let (resolver, ledger) = resolver();
        let contact = resolver.resolve(1, "5551234567", ContactSource::Phone).await.unwrap().unwrap();

        let info = ExtractedInfo {
            name: Some("Dana Scully".to_string()),
            email: Some("dana@example.com".to_string()),
            ..ExtractedInfo::default()
        };
        let updated = resolver.enrich(&contact, &info).await.unwrap().unwrap();
        assert_eq!(updated.first_name, "Dana");
        assert_eq!(updated.last_name.as_deref(), Some("Scully"));
        assert_eq!(updated.email.as_deref(), Some("dana@example.com"));

        let again = ExtractedInfo {
            name: Some("Fox".to_string()),
            ..ExtractedInfo::default()
        };
        assert!(resolver.enrich(&updated, &again).await.unwrap().is_none());

        ledger
            .record_interaction(updated.id, InteractionKind::Call, Utc::now())
            .await
            .unwrap();
        let stored = ledger.find_contact(1, "5551234567").await.unwrap().unwrap();
        assert_eq!(stored.total_calls, 1);
        assert_eq!(stored.first_name, "Dana");
    }
}
