//! Gmail REST provider
//!
//! Talks to the Gmail v1 API directly over [`HttpClient`], attaching the
//! inbox's bearer token to every call. A 401 triggers one refresh and one
//! retry of the same request; a second 401 ends the run.

use async_trait::async_trait;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::CredentialManager;
use crate::config::GmailConfig;
use crate::error::{GoAwayError, Result};
use crate::http::{ApiRequest, HttpClient, HttpResponse};
use crate::models::{Header, Message};
use crate::provider::MailProvider;

/// Gmail emits URL-safe base64 with or without padding
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    #[serde(default)]
    result_size_estimate: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(default)]
    payload: Option<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(default)]
    headers: Vec<MessagePartHeader>,
    #[serde(default)]
    body: Option<MessagePartBody>,
}

#[derive(Debug, Deserialize)]
struct MessagePartHeader {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct MessagePartBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendRequest {
    raw: String,
}

/// [`MailProvider`] for one Gmail inbox
pub struct GmailProvider {
    address: String,
    api_base: Url,
    page_size: u32,
    query: Option<String>,
    credentials: Arc<CredentialManager>,
    http: HttpClient,
}

impl GmailProvider {
    pub fn new(
        address: &str,
        config: &GmailConfig,
        credentials: Arc<CredentialManager>,
        http: HttpClient,
    ) -> Result<Self> {
        let api_base = Url::parse(&config.api_base).map_err(|e| {
            GoAwayError::Config(format!("Invalid gmail.api_base '{}': {}", config.api_base, e))
        })?;
        if api_base.cannot_be_a_base() {
            return Err(GoAwayError::Config(format!(
                "Invalid gmail.api_base '{}'",
                config.api_base
            )));
        }

        Ok(Self {
            address: address.to_string(),
            api_base,
            page_size: config.page_size,
            query: config.query.clone().filter(|q| !q.trim().is_empty()),
            credentials,
            http,
        })
    }

    /// `{api_base}/gmail/v1/users/me/{segments...}`
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.api_base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend(["gmail", "v1", "users", "me"])
                .extend(segments);
        }
        url
    }

    /// Send with the current bearer token, refreshing once on 401
    async fn execute(&self, request: &ApiRequest) -> Result<HttpResponse> {
        let mut token = self.credentials.bearer().await?;
        let mut refreshed = false;

        loop {
            let response = self.http.send(&request.with_bearer(&token.access_token)).await?;

            if response.status == StatusCode::UNAUTHORIZED {
                if refreshed {
                    return Err(GoAwayError::Unauthorized(format!(
                        "{} {} rejected again after refreshing the access token",
                        request.method,
                        request.url
                    )));
                }
                debug!("{} {} returned 401", request.method, request.url);
                token = self.credentials.refresh_rejected(&token).await?;
                refreshed = true;
                continue;
            }

            if !response.is_success() {
                return Err(response.into_error());
            }
            return Ok(response);
        }
    }

    async fn list_message_ids(&self) -> Result<Vec<String>> {
        let mut url = self.endpoint(&["messages"]);
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("maxResults", &self.page_size.to_string());
            if let Some(query) = &self.query {
                pairs.append_pair("q", query);
            }
        }

        let response = self.execute(&ApiRequest::get(url.as_str())).await?;
        let list: ListMessagesResponse = response.json()?;
        debug!(
            "Listed {} messages for {} (estimate {:?})",
            list.messages.len(),
            self.address,
            list.result_size_estimate
        );
        Ok(list.messages.into_iter().map(|m| m.id).collect())
    }

    async fn get_message(&self, id: &str) -> Result<Message> {
        let mut url = self.endpoint(&["messages", id]);
        url.query_pairs_mut().append_pair("format", "metadata");

        let response = self.execute(&ApiRequest::get(url.as_str())).await?;
        let message: GmailMessage = response.json()?;
        convert_message(message)
    }
}

fn convert_message(message: GmailMessage) -> Result<Message> {
    let part = message.payload.ok_or_else(|| {
        GoAwayError::InvalidMessageFormat(format!("message {} has no payload", message.id))
    })?;

    let headers = part
        .headers
        .into_iter()
        .map(|h| Header::new(h.name, h.value))
        .collect();

    let body = match part.body.and_then(|b| b.data) {
        Some(data) if !data.is_empty() => GMAIL_BASE64.decode(data.as_bytes()).map_err(|e| {
            GoAwayError::InvalidMessageFormat(format!(
                "message {} has an undecodable body: {}",
                message.id, e
            ))
        })?,
        _ => Vec::new(),
    };

    Ok(Message::new(message.id, headers, body))
}

/// Header values must stay on one line
fn header_value(value: &str) -> String {
    let single_line: String = value
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();
    if single_line.is_ascii() {
        single_line
    } else {
        format!("=?UTF-8?B?{}?=", base64::engine::general_purpose::STANDARD.encode(single_line))
    }
}

/// Minimal RFC 5322 plain-text message
fn build_raw_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\n\
         Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
        header_value(from),
        header_value(to),
        header_value(subject),
        body.replace("\r\n", "\n").replace('\n', "\r\n")
    )
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn get_mail(&self) -> Result<Vec<Message>> {
        let ids = self.list_message_ids().await?;
        let mut messages = Vec::with_capacity(ids.len());

        for id in ids {
            match self.get_message(&id).await {
                Ok(message) => messages.push(message),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Skipping message {} in {}: {}", id, self.address, e),
            }
        }

        info!("Fetched {} messages from {}", messages.len(), self.address);
        Ok(messages)
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let raw = build_raw_message(&self.address, to, subject, body);
        let request = ApiRequest::post_json(
            self.endpoint(&["messages", "send"]).as_str(),
            &SendRequest {
                raw: URL_SAFE.encode(raw.as_bytes()),
            },
        )?;

        self.execute(&request).await?;
        debug!("Sent message from {} to {}", self.address, to);
        Ok(())
    }
}
