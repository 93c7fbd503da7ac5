//! One-shot HTTP listener that captures an OAuth authorization-code redirect

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{GoAwayError, Result};

const DONE_PAGE: &str = "You can close this page now.";
const DENIED_PAGE: &str = "Authorization was denied. You can close this page now.";

type CodeSender = Arc<Mutex<Option<oneshot::Sender<Result<String>>>>>;

/// Listener bound to an ephemeral loopback port
///
/// The first redirect carrying `code` (or `error`) completes the wait; any
/// later request just gets the closing page.
pub struct LoopbackListener {
    addr: SocketAddr,
    code_rx: oneshot::Receiver<Result<String>>,
    stop_tx: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl LoopbackListener {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let (code_tx, code_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let code_tx: CodeSender = Arc::new(Mutex::new(Some(code_tx)));

        let server = tokio::spawn(serve(listener, code_tx, stop_rx));
        debug!("Loopback listener bound on {}", addr);

        Ok(Self {
            addr,
            code_rx,
            stop_tx: Some(stop_tx),
            server,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Redirect URI to register with the authorization request
    pub fn redirect_uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Wait for the redirect, at most `timeout`
    pub async fn wait_for_code(&mut self, timeout: Duration) -> Result<String> {
        match tokio::time::timeout(timeout, &mut self.code_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GoAwayError::Auth(
                "loopback listener stopped before receiving a redirect".to_string(),
            )),
            Err(_) => Err(GoAwayError::AuthorizationTimeout(timeout.as_secs())),
        }
    }

    /// Stop accepting, let in-flight responses finish for up to `grace`
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if tokio::time::timeout(grace, &mut self.server).await.is_err() {
            warn!("Loopback listener did not stop within {:?}, aborting", grace);
            self.server.abort();
        }
        debug!("Loopback listener on {} shut down", self.addr);
    }
}

async fn serve(listener: TcpListener, code_tx: CodeSender, mut stop_rx: oneshot::Receiver<()>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Loopback accept failed: {}", e);
                        continue;
                    }
                };
                debug!("Loopback connection from {}", peer);

                let code_tx = Arc::clone(&code_tx);
                connections.spawn(async move {
                    let service = service_fn(move |request| {
                        let response = handle_redirect(&request, &code_tx);
                        async move { Ok::<_, Infallible>(response) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Loopback connection error: {}", e);
                    }
                });
            }
        }
    }

    while connections.join_next().await.is_some() {}
}

fn handle_redirect(request: &Request<Incoming>, code_tx: &CodeSender) -> Response<Full<Bytes>> {
    let query = request.uri().query().unwrap_or("");
    let mut code = None;
    let mut error = None;
    let mut error_description = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" if !value.is_empty() => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    let outcome = match (code, error) {
        (Some(code), _) => Ok(code),
        (None, Some(error)) => Err(GoAwayError::AuthorizationDenied(match error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        })),
        (None, None) => {
            debug!("Ignoring loopback request without code: {}", request.uri());
            return page(StatusCode::BAD_REQUEST, "Missing authorization code.");
        }
    };

    let denied = outcome.is_err();
    let sender = code_tx.lock().ok().and_then(|mut slot| slot.take());
    match sender {
        Some(sender) => {
            info!("Received authorization redirect");
            let _ = sender.send(outcome);
        }
        None => debug!("Authorization redirect already received, ignoring repeat"),
    }

    if denied {
        page(StatusCode::OK, DENIED_PAGE)
    } else {
        page(StatusCode::OK, DONE_PAGE)
    }
}

fn page(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ApiRequest, HttpClient};

    async fn get(url: String) -> crate::http::HttpResponse {
        HttpClient::new(Duration::from_secs(5))
            .unwrap()
            .send(&ApiRequest::get(url))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_captures_code() {
        let mut listener = LoopbackListener::bind().await.unwrap();
        assert!(listener.redirect_uri().starts_with("http://127.0.0.1:"));

        let response = get(format!("{}/?state=xyz&code=4%2Fabc", listener.redirect_uri())).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], DONE_PAGE.as_bytes());

        let code = listener.wait_for_code(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "4/abc");

        listener.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_request_without_code_keeps_waiting() {
        let mut listener = LoopbackListener::bind().await.unwrap();

        let response = get(format!("{}/favicon.ico", listener.redirect_uri())).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);

        get(format!("{}/?code=later", listener.redirect_uri())).await;
        let code = listener.wait_for_code(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "later");

        listener.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_error_redirect_is_denied() {
        let mut listener = LoopbackListener::bind().await.unwrap();

        get(format!(
            "{}/?error=access_denied&error_description=user+said+no",
            listener.redirect_uri()
        ))
        .await;

        match listener.wait_for_code(Duration::from_secs(5)).await {
            Err(GoAwayError::AuthorizationDenied(reason)) => {
                assert_eq!(reason, "access_denied: user said no")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        listener.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut listener = LoopbackListener::bind().await.unwrap();
        let result = listener.wait_for_code(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(GoAwayError::AuthorizationTimeout(_))));
        listener.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let listener = LoopbackListener::bind().await.unwrap();
        let addr = listener.local_addr();

        tokio::time::timeout(Duration::from_secs(3), listener.shutdown(Duration::from_secs(1)))
            .await
            .unwrap();

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
