use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};

use super::{AuthError, AuthorizationCode, CallbackOutcome, CodeSlot};
use crate::config::AuthorizationConfig;

pub const CONFIRMATION_BODY: &str = "Auth done, you can close this window";
const NOT_FOUND_BODY: &str = "Not found";
const MAX_REQUEST_BYTES: usize = 16 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Loopback HTTP listener that waits for the identity provider's redirect.
///
/// The accept loop runs on its own task; every redirect to the configured path
/// is offered to the shared [`CodeSlot`]. Dropping the handle stops the loop.
#[derive(Debug)]
pub struct RedirectListener {
    local_addr: SocketAddr,
    redirect_uri: Url,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RedirectListener {
    /// Bind `redirect_host:redirect_port` and start serving in the background.
    pub async fn start(config: &AuthorizationConfig, slot: CodeSlot) -> Result<Self, AuthError> {
        config.validate()?;
        let addr = format!("{}:{}", config.redirect_host, config.redirect_port);
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| AuthError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let redirect_uri = config.redirect_url_for_port(local_addr.port())?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let path: Arc<str> = Arc::from(config.redirect_path.as_str());
        let task = tokio::spawn(accept_loop(listener, path, slot, shutdown_rx));
        info!(%local_addr, path = %config.redirect_path, "redirect listener started");

        Ok(Self {
            local_addr,
            redirect_uri,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Redirect URI pointing at the port actually bound.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Stop accepting, let in-flight requests finish, and release the port.
    ///
    /// If that takes longer than `grace` the listener is aborted and
    /// [`AuthError::ShutdownTimeout`] is returned.
    pub async fn shutdown(self, grace: Duration) -> Result<(), AuthError> {
        let Self {
            local_addr,
            shutdown_tx,
            mut task,
            ..
        } = self;
        let _ = shutdown_tx.send(());

        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {
                info!(%local_addr, "redirect listener stopped");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(%local_addr, error = %err, "redirect listener task failed");
                Err(AuthError::ListenerClosed)
            }
            Err(_) => {
                task.abort();
                warn!(%local_addr, ?grace, "redirect listener did not stop in time; aborted");
                Err(AuthError::ShutdownTimeout {
                    addr: local_addr,
                    grace,
                })
            }
        }
    }

    /// Stop immediately, dropping any in-flight connections.
    ///
    /// Resolves once the accept loop has been torn down and the port released.
    pub async fn abort(self) {
        let Self {
            local_addr, task, ..
        } = self;
        debug!(%local_addr, "aborting redirect listener");
        task.abort();
        // Cancellation surfaces as a `JoinError` once the task is dropped.
        let _ = task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    path: Arc<str>,
    slot: CodeSlot,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (closing_tx, closing_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            // Resolves on an explicit shutdown and when the handle is dropped.
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted redirect connection");
                    connections.spawn(handle_connection(
                        stream,
                        path.clone(),
                        slot.clone(),
                        closing_rx.clone(),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "failed to accept redirect connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_join(joined);
            }
        }
    }

    drop(listener);
    let _ = closing_tx.send(true);
    while let Some(joined) = connections.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        warn!(error = %err, "redirect connection task failed");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    path: Arc<str>,
    slot: CodeSlot,
    mut closing: watch::Receiver<bool>,
) {
    let head = tokio::select! {
        head = tokio::time::timeout(REQUEST_READ_TIMEOUT, read_head(&mut stream)) => {
            head.unwrap_or(Err(RequestError::TimedOut))
        }
        // Idle connections (browser pre-connects) must not hold up shutdown.
        _ = closing.wait_for(|closing| *closing) => {
            debug!("dropping idle redirect connection during shutdown");
            return;
        }
    };

    // Once the head is in, the request runs to completion even while closing.
    let read = match head {
        Ok((mut request, leftover)) => {
            tokio::time::timeout(
                REQUEST_READ_TIMEOUT,
                read_body(&mut stream, &mut request, leftover),
            )
            .await
            .unwrap_or(Err(RequestError::TimedOut))
            .map(|()| request)
        }
        Err(err) => Err(err),
    };

    let (status, body) = match read {
        Ok(request) => route(&request, &path, &slot),
        Err(RequestError::Closed) => {
            debug!("redirect connection closed without a request");
            return;
        }
        Err(err) => {
            warn!(error = %err, "ignoring malformed redirect request");
            (Status::BadRequest, CONFIRMATION_BODY)
        }
    };

    if let Err(err) = respond(&mut stream, status, body).await {
        warn!(error = %err, "failed to answer redirect request");
    }
    let _ = stream.shutdown().await;
}

fn route(request: &RedirectRequest, path: &str, slot: &CodeSlot) -> (Status, &'static str) {
    let url = match Url::parse("http://127.0.0.1").and_then(|base| base.join(&request.target)) {
        Ok(url) => url,
        Err(err) => {
            warn!(error = %err, "ignoring redirect request with invalid target");
            return (Status::BadRequest, CONFIRMATION_BODY);
        }
    };

    if url.path() != path {
        debug!(path = url.path(), "request for unknown path");
        return (Status::NotFound, NOT_FOUND_BODY);
    }

    let form_body = request.is_form_post().then(|| form_urlencoded::parse(&request.body));
    let params = form_body.into_iter().flatten().chain(url.query_pairs());
    match callback_outcome(params) {
        Some(outcome) => {
            slot.record(outcome);
        }
        None => debug!("redirect request carried neither code nor error"),
    }
    (Status::Ok, CONFIRMATION_BODY)
}

/// Pick the outcome out of redirect parameters. The first `code` value wins;
/// an `error` parameter takes precedence over any code.
fn callback_outcome<'a, I>(params: I) -> Option<CallbackOutcome>
where
    I: IntoIterator<Item = (Cow<'a, str>, Cow<'a, str>)>,
{
    let mut code: Option<String> = None;
    let mut error: Option<String> = None;
    let mut description: Option<String> = None;

    for (key, value) in params {
        match key.as_ref() {
            "code" if code.is_none() && !value.is_empty() => code = Some(value.into_owned()),
            "error" if error.is_none() => error = Some(value.into_owned()),
            "error_description" if description.is_none() => {
                description = Some(value.into_owned())
            }
            _ => {}
        }
    }

    if let Some(error) = error {
        return Some(CallbackOutcome::Denied { error, description });
    }
    code.and_then(|code| AuthorizationCode::new(code).ok())
        .map(CallbackOutcome::Code)
}

#[derive(Debug)]
struct RedirectRequest {
    method: String,
    target: String,
    content_type: Option<String>,
    content_length: Option<usize>,
    body: Vec<u8>,
}

impl RedirectRequest {
    fn is_form_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
            && self
                .content_type
                .as_deref()
                .is_some_and(|value| value.starts_with("application/x-www-form-urlencoded"))
    }
}

#[derive(Debug, Error)]
enum RequestError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("timed out reading request")]
    TimedOut,
    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

/// Read up to the end of the request head. Returns the parsed head and any
/// body bytes that arrived with it.
async fn read_head(stream: &mut TcpStream) -> Result<(RedirectRequest, Vec<u8>), RequestError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_head_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Err(RequestError::Malformed("request head too large"));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(RequestError::Closed);
            }
            return Err(RequestError::Malformed("connection closed mid-request"));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buffer[..head_end])
        .map_err(|_| RequestError::Malformed("request head is not valid UTF-8"))?;
    let request = parse_head(head)?;
    let leftover = buffer.split_off(head_end + 4);
    Ok((request, leftover))
}

async fn read_body(
    stream: &mut TcpStream,
    request: &mut RedirectRequest,
    mut body: Vec<u8>,
) -> Result<(), RequestError> {
    let mut chunk = [0u8; 1024];
    if let Some(length) = request.content_length {
        if length > MAX_REQUEST_BYTES {
            return Err(RequestError::Malformed("request body too large"));
        }
        while body.len() < length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(RequestError::Malformed("connection closed mid-body"));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(length);
        request.body = body;
    }

    Ok(())
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_head(head: &str) -> Result<RedirectRequest, RequestError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::Malformed("invalid request line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(RequestError::Malformed("invalid HTTP version"));
    }

    let mut content_type = None;
    let mut content_length = None;
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(RequestError::Malformed("invalid header line"))?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            let length = value
                .parse::<usize>()
                .map_err(|_| RequestError::Malformed("invalid Content-Length"))?;
            content_length = Some(length);
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_ascii_lowercase());
        }
    }

    Ok(RedirectRequest {
        method: method.to_owned(),
        target: target.to_owned(),
        content_type,
        content_length,
        body: Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    BadRequest,
    NotFound,
}

async fn respond(stream: &mut TcpStream, status: Status, body: &str) -> std::io::Result<()> {
    let status_line = match status {
        Status::Ok => "HTTP/1.1 200 OK",
        Status::BadRequest => "HTTP/1.1 400 Bad Request",
        Status::NotFound => "HTTP/1.1 404 Not Found",
    };
    let response = format!(
        "{status_line}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}
