use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_REDIRECT_HOST: &str = "127.0.0.1";
pub const DEFAULT_REDIRECT_PATH: &str = "/callback";
pub const DEFAULT_REDIRECT_PORT: u16 = 9999;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub const DEFAULT_AUTHORIZATION_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Client settings for one authorization-code login.
#[derive(Debug, Clone)]
pub struct AuthorizationConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_host: String,
    pub redirect_port: u16,
    pub redirect_path: String,
    pub scopes: Vec<String>,
    /// Program used to open the authorization URL. `None` means the system default browser.
    pub open_command: Option<String>,
    /// Upper bound on waiting for the browser redirect. `None` waits indefinitely.
    pub login_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl AuthorizationConfig {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_host: DEFAULT_REDIRECT_HOST.to_owned(),
            redirect_port: DEFAULT_REDIRECT_PORT,
            redirect_path: DEFAULT_REDIRECT_PATH.to_owned(),
            scopes: vec![],
            open_command: None,
            login_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_redirect<S: Into<String>>(mut self, port: u16, path: S) -> Self {
        self.redirect_port = port;
        self.redirect_path = path.into();
        self
    }

    pub fn with_open_command<S: Into<String>>(mut self, command: S) -> Self {
        self.open_command = Some(command.into());
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Space-separated scope string as sent on the wire.
    pub fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Redirect URI registered with the provider, e.g. `http://127.0.0.1:9999/callback`.
    pub fn redirect_url(&self) -> Result<Url, ConfigError> {
        self.redirect_url_for_port(self.redirect_port)
    }

    pub(crate) fn redirect_url_for_port(&self, port: u16) -> Result<Url, ConfigError> {
        let raw = format!(
            "http://{}:{port}{}",
            self.redirect_host, self.redirect_path
        );
        Url::parse(&raw).map_err(|source| ConfigError::InvalidRedirect { raw, source })
    }

    /// Reject settings that cannot produce a working login.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if !self.redirect_path.starts_with('/') {
            return Err(ConfigError::InvalidRedirectPath(self.redirect_path.clone()));
        }
        self.redirect_url()?;
        Ok(())
    }
}

/// Identity provider endpoints.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorization_url: Url,
    pub token_url: Url,
}

impl OAuthEndpoints {
    pub fn new(authorization_url: &str, token_url: &str) -> Result<Self, ConfigError> {
        let parse = |raw: &str| {
            Url::parse(raw).map_err(|source| ConfigError::InvalidEndpoint {
                raw: raw.to_owned(),
                source,
            })
        };
        Ok(Self {
            authorization_url: parse(authorization_url)?,
            token_url: parse(token_url)?,
        })
    }
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorization_url: Url::parse(DEFAULT_AUTHORIZATION_URL).unwrap(),
            token_url: Url::parse(DEFAULT_TOKEN_URL).unwrap(),
        }
    }
}

/// Errors raised while validating authorization settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("client id must not be empty")]
    MissingClientId,
    #[error("redirect path '{0}' must start with '/'")]
    InvalidRedirectPath(String),
    #[error("invalid redirect URI '{raw}': {source}")]
    InvalidRedirect {
        raw: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid endpoint URL '{raw}': {source}")]
    InvalidEndpoint {
        raw: String,
        #[source]
        source: url::ParseError,
    },
}
