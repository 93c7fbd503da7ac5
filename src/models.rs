use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single message header, in the order the provider returned it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Provider-independent view of a fetched message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl Message {
    pub fn new(id: impl Into<String>, headers: Vec<Header>, body: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            headers,
            body,
        }
    }

    /// All headers in provider order
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// First header with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// The From header, or an empty string when absent
    pub fn sender(&self) -> &str {
        self.header("From").unwrap_or("")
    }

    /// Normalized RFC 2919 list identifier, if the message carries one
    ///
    /// `List-Id: Weekly News <weekly.news.example.com>` yields
    /// `weekly.news.example.com`.
    pub fn list_id(&self) -> Option<String> {
        let raw = self.header("List-Id")?.trim();
        let id = match (raw.rfind('<'), raw.rfind('>')) {
            (Some(start), Some(end)) if start < end => &raw[start + 1..end],
            _ => raw,
        };
        let id = id.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_lowercase())
        }
    }
}

/// Closed set of supported inbox providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gmail => "gmail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gmail" => Some(ProviderKind::Gmail),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mail account and the provider that serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbox {
    pub id: i64,
    pub provider: ProviderKind,
    pub address: String,
}

/// OAuth bearer credential for one inbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Both tokens present, so the credential can be used without re-authorizing
    pub fn is_complete(&self) -> bool {
        !self.access_token.is_empty()
            && self
                .refresh_token
                .as_deref()
                .is_some_and(|token| !token.is_empty())
    }
}

/// A resolved unsubscribe request, ready to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// "Message was seen for recipient"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub message_id: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
}

/// "Recipient unsubscribed from list"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeRecord {
    pub message_id: String,
    pub list_id: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: Vec<Header>) -> Message {
        Message::new("m1", headers, Vec::new())
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let msg = message(vec![
            Header::new("from", "News <news@example.com>"),
            Header::new("LIST-UNSUBSCRIBE", "<mailto:u@example.com>"),
        ]);

        assert_eq!(msg.header("From"), Some("News <news@example.com>"));
        assert_eq!(msg.header("List-Unsubscribe"), Some("<mailto:u@example.com>"));
        assert_eq!(msg.header("Subject"), None);
    }

    #[test]
    fn test_header_lookup_returns_first_match() {
        let msg = message(vec![
            Header::new("Received", "first"),
            Header::new("Received", "second"),
        ]);
        assert_eq!(msg.header("received"), Some("first"));
        assert_eq!(msg.headers().len(), 2);
    }

    #[test]
    fn test_sender_defaults_to_empty() {
        assert_eq!(message(vec![]).sender(), "");
    }

    #[test]
    fn test_list_id_extraction() {
        let bracketed = message(vec![Header::new(
            "List-Id",
            "Weekly News <Weekly.News.Example.com>",
        )]);
        assert_eq!(bracketed.list_id().as_deref(), Some("weekly.news.example.com"));

        let bare = message(vec![Header::new("List-Id", "  updates.example.org ")]);
        assert_eq!(bare.list_id().as_deref(), Some("updates.example.org"));

        let empty = message(vec![Header::new("List-Id", "<>")]);
        assert_eq!(empty.list_id(), None);

        assert_eq!(message(vec![]).list_id(), None);
    }

    #[test]
    fn test_provider_kind_round_trip() {
        assert_eq!(ProviderKind::parse("gmail"), Some(ProviderKind::Gmail));
        assert_eq!(ProviderKind::parse("imap"), None);
        assert_eq!(ProviderKind::Gmail.to_string(), "gmail");

        let json = serde_json::to_string(&ProviderKind::Gmail).unwrap();
        assert_eq!(json, "\"gmail\"");
    }

    #[test]
    fn test_credential_completeness() {
        let mut credential = Credential {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: None,
        };
        assert!(credential.is_complete());

        credential.refresh_token = Some(String::new());
        assert!(!credential.is_complete());

        credential.refresh_token = None;
        assert!(!credential.is_complete());
    }
}
