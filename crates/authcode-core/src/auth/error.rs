use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the login flow and token exchanges.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to bind redirect listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to read token endpoint response: {0}")]
    ResponseBody(#[source] reqwest::Error),
    #[error("token endpoint error {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },
    #[error("malformed token response: {source}")]
    MalformedTokenResponse {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("authorization request denied ({0})")]
    AccessDenied(String),
    #[error("no authorization redirect received within {0:?}")]
    Timeout(Duration),
    #[error("redirect listener on {addr} did not stop within {grace:?}")]
    ShutdownTimeout { addr: SocketAddr, grace: Duration },
    #[error("authorization listener terminated before receiving redirect")]
    ListenerClosed,
    #[error("authorization response missing code parameter")]
    MissingAuthorizationCode,
}

impl AuthError {
    /// Whether the failure happened on the wire rather than in the response payload.
    pub fn is_transport(&self) -> bool {
        matches!(self, AuthError::Http(_) | AuthError::ResponseBody(_))
    }
}
