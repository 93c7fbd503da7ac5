//! Minimal HTTPS client for the token endpoint and the Gmail REST API
//!
//! Requests are plain values so a caller can resend the same request after
//! swapping the bearer token.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{GoAwayError, Result};

/// One outbound request, cheap to clone and resend
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub content_type: Option<&'static str>,
    pub body: Bytes,
    bearer: Option<String>,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            content_type: None,
            body: Bytes::new(),
            bearer: None,
        }
    }

    pub fn post_json<T: Serialize>(url: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self {
            method: Method::POST,
            url: url.into(),
            content_type: Some("application/json"),
            body: Bytes::from(serde_json::to_vec(payload)?),
            bearer: None,
        })
    }

    /// `application/x-www-form-urlencoded` POST, as token endpoints expect
    pub fn post_form<'a>(
        url: impl Into<String>,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        Self {
            method: Method::POST,
            url: url.into(),
            content_type: Some("application/x-www-form-urlencoded"),
            body: Bytes::from(body),
            bearer: None,
        }
    }

    /// The same request, authorized with the given access token
    pub fn with_bearer(&self, access_token: &str) -> Self {
        Self {
            bearer: Some(access_token.to_string()),
            ..self.clone()
        }
    }

    fn build(&self) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str());
        if let Some(content_type) = self.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(token) = &self.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| GoAwayError::Auth(format!("access token is not a valid header: {}", e)))?;
            builder = builder.header(AUTHORIZATION, value);
        }
        Ok(builder.body(Full::new(self.body.clone()))?)
    }
}

/// Fully buffered response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Typed error for a non-success response
    pub fn into_error(self) -> GoAwayError {
        GoAwayError::from_response(self.status, &self.headers, &self.body)
    }
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// HTTP/1 client over rustls with a per-request deadline
#[derive(Clone)]
pub struct HttpClient {
    client: HttpsClient,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Prefer the platform trust store; containers often ship without one
        let builder = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!("Failed to load native TLS roots ({}), using bundled webpki roots", e);
                HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let connector = builder.https_or_http().enable_http1().build();
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self { client, timeout })
    }

    /// Send the request and buffer the whole response body
    ///
    /// Only transport failures are errors here; any HTTP status is returned
    /// to the caller.
    pub async fn send(&self, request: &ApiRequest) -> Result<HttpResponse> {
        let hyper_request = request.build()?;
        debug!("{} {}", request.method, request.url);

        let exchange = async {
            let response = self.client.request(hyper_request).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, GoAwayError>(HttpResponse {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} {} timed out after {:?}",
                    request.method, request.url, self.timeout
                );
                Err(GoAwayError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}
