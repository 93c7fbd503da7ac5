//! List-Unsubscribe resolution
//!
//! Turns a message's `List-Unsubscribe` header into something the
//! orchestrator can execute. Only `mailto:` candidates are actionable; the
//! first one, in header order, wins.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::models::{Action, Message};

pub const DEFAULT_SUBJECT: &str = "Unsubscribe Request";
pub const DEFAULT_BODY: &str = "Please unsubscribe me from this mailing list.";

static BRACKETED_URI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^>]+)>").expect("bracketed URI pattern is valid"));

/// A comma that starts another URI, e.g. `, https:`
static URI_SEPARATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r",\s*[a-zA-Z][a-zA-Z0-9+.-]*:").expect("URI separator pattern is valid")
});

/// Parsed `List-Unsubscribe` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Candidate URIs in header order
    pub candidates: Vec<String>,
    /// `List-Unsubscribe-Post` was present (RFC 8058); informational only
    pub one_click: bool,
}

impl Directive {
    /// Extract candidates from a header value
    ///
    /// Bracketed URIs are preferred. A value without any brackets is split
    /// only at commas that begin another URI, so a comma inside an unquoted
    /// subject or body stays in its candidate. This accepts the common
    /// malformed `List-Unsubscribe: mailto:...` form.
    pub fn parse(value: &str, one_click: bool) -> Self {
        let mut candidates: Vec<String> = BRACKETED_URI
            .captures_iter(value)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        if candidates.is_empty() {
            candidates = split_bare(value);
        }

        Self {
            candidates,
            one_click,
        }
    }

    pub fn from_message(message: &Message) -> Option<Self> {
        let value = message.header("List-Unsubscribe")?;
        Some(Self::parse(
            value,
            message.header("List-Unsubscribe-Post").is_some(),
        ))
    }
}

fn split_bare(value: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut start = 0;
    for separator in URI_SEPARATOR.find_iter(value) {
        segments.push(&value[start..separator.start()]);
        start = separator.start() + 1;
    }
    segments.push(&value[start..]);

    segments
        .into_iter()
        .map(|segment| segment.trim().trim_end_matches(',').trim_end())
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// An executable unsubscribe, with the list it applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub action: Action,
    /// Dedup key: the message's List-Id, or the mailto target without one
    pub list_id: String,
    pub one_click: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No List-Unsubscribe header
    NoDirective,
    Actionable(Unsubscribe),
    /// Header present but nothing in it can be executed
    Unusable { reasons: Vec<String> },
}

/// Resolve the unsubscribe action for a message
pub fn resolve(message: &Message) -> Resolution {
    let Some(directive) = Directive::from_message(message) else {
        return Resolution::NoDirective;
    };

    let mut reasons = Vec::new();
    for candidate in &directive.candidates {
        match mailto_action(candidate) {
            Ok(action) => {
                let list_id = message
                    .list_id()
                    .unwrap_or_else(|| action.recipient.to_lowercase());
                debug!(
                    "Message {} resolved to mailto:{} (list {})",
                    message.id, action.recipient, list_id
                );
                return Resolution::Actionable(Unsubscribe {
                    action,
                    list_id,
                    one_click: directive.one_click,
                });
            }
            Err(reason) => {
                warn!("Message {}: skipping unsubscribe candidate: {}", message.id, reason);
                reasons.push(reason);
            }
        }
    }

    if reasons.is_empty() {
        reasons.push("List-Unsubscribe header has no candidates".to_string());
    }
    Resolution::Unusable { reasons }
}

fn mailto_action(candidate: &str) -> std::result::Result<Action, String> {
    let uri = Url::parse(candidate).map_err(|e| format!("'{}' is not a URI: {}", candidate, e))?;

    if uri.scheme() != "mailto" {
        return Err(format!("'{}' uses unsupported scheme {}", candidate, uri.scheme()));
    }

    let recipient = uri.path().trim();
    if recipient.is_empty() {
        return Err(format!("'{}' has no target address", candidate));
    }

    let mut subject = None;
    let mut body = None;
    for (key, value) in uri.query_pairs() {
        if key.eq_ignore_ascii_case("subject") && subject.is_none() {
            subject = Some(value.into_owned());
        } else if key.eq_ignore_ascii_case("body") && body.is_none() {
            body = Some(value.into_owned());
        }
    }

    Ok(Action {
        recipient: recipient.to_string(),
        subject: subject
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string()),
        body: body
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| DEFAULT_BODY.to_string()),
    })
}
