use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{AuthError, AuthorizationCode};
use crate::config::{AuthorizationConfig, OAuthEndpoints};

const DEFAULT_USER_AGENT: &str = concat!("authcode/", env!("CARGO_PKG_VERSION"));
const TOKEN_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Access/refresh tokens returned by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Vec<String>,
}

/// Talks to the provider's authorization and token endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    config: AuthorizationConfig,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(config: AuthorizationConfig) -> Result<Self, AuthError> {
        Self::with_endpoints(config, OAuthEndpoints::default())
    }

    pub fn with_endpoints(
        config: AuthorizationConfig,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            config,
            endpoints,
        })
    }

    /// Clone the client with the redirect port replaced, for listeners bound to an ephemeral port.
    pub fn clone_with_port(&self, port: u16) -> Self {
        let mut config = self.config.clone();
        config.redirect_port = port;
        Self {
            http: self.http.clone(),
            config,
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn config(&self) -> &AuthorizationConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    pub fn authorization_url(&self) -> Result<Url, AuthError> {
        let redirect_uri = self.config.redirect_url()?;
        let mut url = self.endpoints.authorization_url.clone();
        url.query_pairs_mut()
            .append_pair("grant_type", "authorization_code")
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("scope", &self.config.scope())
            .append_pair("response_type", "code")
            .append_pair("response_mode", "query")
            .append_pair("client_id", &self.config.client_id);
        Ok(url)
    }

    /// Exchange an authorization code for tokens covering `scope`.
    pub async fn exchange_code(
        &self,
        code: &AuthorizationCode,
        scope: &str,
    ) -> Result<TokenPair, AuthError> {
        let mut form = vec![
            ("code", code.value().to_owned()),
            ("grant_type", "authorization_code".to_owned()),
            ("redirect_uri", self.config.redirect_url()?.to_string()),
            ("scope", scope.to_owned()),
        ];
        form.extend(self.client_credentials());

        debug!(token_url = %self.endpoints.token_url, "exchanging authorization code");
        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .send()
            .await?;

        let tokens = handle_token_response(response).await?;
        info!("authorization code exchanged for tokens");
        Ok(tokens)
    }

    /// Trade a refresh token for a new token pair. The old refresh token is kept
    /// when the provider does not rotate it.
    pub async fn refresh_tokens(
        &self,
        refresh_token: &str,
        scope: &str,
    ) -> Result<TokenPair, AuthError> {
        let mut form = vec![
            ("refresh_token", refresh_token.to_owned()),
            ("grant_type", "refresh_token".to_owned()),
            ("scope", scope.to_owned()),
        ];
        form.extend(self.client_credentials());

        debug!(token_url = %self.endpoints.token_url, "refreshing tokens");
        let response = self
            .http
            .post(self.endpoints.token_url.clone())
            .form(&form)
            .send()
            .await?;

        let mut tokens = handle_token_response(response).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_owned());
        }
        Ok(tokens)
    }

    fn client_credentials(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(2);
        if let Some(secret) = &self.config.client_secret {
            pairs.push(("client_secret", secret.clone()));
        }
        pairs.push(("client_id", self.config.client_id.clone()));
        pairs
    }
}

async fn handle_token_response(response: reqwest::Response) -> Result<TokenPair, AuthError> {
    let status = response.status();
    let received_at = Utc::now();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                debug!(%status, error = %err, "failed to read token endpoint error body");
                String::new()
            }
        };
        return Err(AuthError::TokenEndpoint { status, body });
    }

    let body = response.text().await.map_err(AuthError::ResponseBody)?;
    let payload: TokenResponse = serde_json::from_str(&body)
        .map_err(|source| AuthError::MalformedTokenResponse {
            source,
            body: body.clone(),
        })?;
    payload.into_pair(received_at).map_err(|source| AuthError::MalformedTokenResponse {
        source,
        body,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_pair(self, received_at: DateTime<Utc>) -> Result<TokenPair, serde_json::Error> {
        if self.access_token.is_empty() {
            return Err(serde::de::Error::custom("access_token is empty"));
        }

        let expires_at = match self.expires_in {
            Some(seconds) => Some(
                Duration::try_seconds(seconds)
                    .and_then(|lifetime| received_at.checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        <serde_json::Error as serde::de::Error>::custom("expires_in out of range")
                    })?,
            ),
            None => None,
        };

        let scope = self
            .scope
            .unwrap_or_default()
            .split_whitespace()
            .map(ToOwned::to_owned)
            .collect();

        Ok(TokenPair {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|token| !token.is_empty()),
            token_type: self.token_type,
            expires_at,
            scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::StatusCode;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        Runtime::new().unwrap()
    }

    fn test_client(token_url: &str) -> OAuthClient {
        let config = AuthorizationConfig::new("client-id")
            .with_redirect(9999, "/callback")
            .with_scopes(["offline_access", "User.Read"]);
        let endpoints = OAuthEndpoints::new("http://localhost/authorize", token_url).unwrap();
        OAuthClient::with_endpoints(config, endpoints).unwrap()
    }

    fn code(value: &str) -> AuthorizationCode {
        AuthorizationCode::new(value).unwrap()
    }

    #[test]
    fn authorization_url_carries_request_parameters() {
        let client = test_client("http://localhost/token");
        let url = client.authorization_url().unwrap();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let get = |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(url.path(), "/authorize");
        assert_eq!(get("grant_type"), Some("authorization_code"));
        assert_eq!(get("redirect_uri"), Some("http://127.0.0.1:9999/callback"));
        assert_eq!(get("scope"), Some("offline_access User.Read"));
        assert_eq!(get("response_type"), Some("code"));
        assert_eq!(get("response_mode"), Some("query"));
        assert_eq!(get("client_id"), Some("client-id"));
    }

    #[test]
    fn clone_with_port_rewrites_redirect() {
        let client = test_client("http://localhost/token").clone_with_port(4321);
        assert_eq!(
            client.config().redirect_url().unwrap().as_str(),
            "http://127.0.0.1:4321/callback"
        );
    }

    #[test]
    fn exchange_code_success() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST)
                    .path("/token")
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body_contains("code=XYZ123")
                    .body_contains("grant_type=authorization_code")
                    .body_contains("client_id=client-id");
                then.status(200)
                    .json_body_obj(&serde_json::json!({"access_token": "A", "refresh_token": "B"}));
            });

            let client = test_client(&server.url("/token"));
            let tokens = client
                .exchange_code(&code("XYZ123"), "User.Read")
                .await
                .unwrap();
            mock.assert();
            assert_eq!(tokens.access_token, "A");
            assert_eq!(tokens.refresh_token.as_deref(), Some("B"));
            assert!(tokens.expires_at.is_none());
        });
    }

    #[test]
    fn exchange_code_sends_secret_when_configured() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("client_secret=shh");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "A",
                    "refresh_token": "B",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "scope": "User.Read offline_access"
                }));
            });

            let config = AuthorizationConfig::new("client-id").with_secret("shh");
            let endpoints =
                OAuthEndpoints::new("http://localhost/authorize", &server.url("/token")).unwrap();
            let client = OAuthClient::with_endpoints(config, endpoints).unwrap();
            let tokens = client.exchange_code(&code("c"), "User.Read").await.unwrap();
            mock.assert();
            assert_eq!(tokens.token_type.as_deref(), Some("Bearer"));
            assert_eq!(tokens.scope, vec!["User.Read", "offline_access"]);
            assert!(tokens.expires_at.is_some());
        });
    }

    #[test]
    fn network_failure_is_transport_error() {
        let rt = runtime();
        let err = rt.block_on(async {
            let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = closed.local_addr().unwrap().port();
            drop(closed);
            let client = test_client(&format!("http://127.0.0.1:{port}/token"));
            client.exchange_code(&code("c"), "User.Read").await.unwrap_err()
        });
        assert!(matches!(err, AuthError::Http(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn malformed_json_is_reported() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            server.mock(|when, then| {
                when.method(POST).path("/token");
                then.status(200).body("<html>not json</html>");
            });

            let client = test_client(&server.url("/token"));
            let err = client
                .exchange_code(&code("c"), "User.Read")
                .await
                .unwrap_err();
            match err {
                AuthError::MalformedTokenResponse { body, .. } => {
                    assert_eq!(body, "<html>not json</html>")
                }
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }

    #[test]
    fn empty_access_token_is_rejected() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            server.mock(|when, then| {
                when.method(POST).path("/token");
                then.status(200)
                    .json_body_obj(&serde_json::json!({"access_token": "", "refresh_token": "B"}));
            });

            let client = test_client(&server.url("/token"));
            let err = client
                .exchange_code(&code("c"), "User.Read")
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::MalformedTokenResponse { .. }));
        });
    }

    #[test]
    fn truncated_error_body_keeps_status() {
        let rt = runtime();
        rt.block_on(async {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            // Promises more body than it sends, so reading it fails.
            let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = server.local_addr().unwrap();
            tokio::spawn(async move {
                let (mut stream, _) = server.accept().await.unwrap();
                let mut request = [0u8; 4096];
                let _ = stream.read(&mut request).await;
                stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 100\r\n\r\n{\"err")
                    .await
                    .unwrap();
            });

            let client = test_client(&format!("http://{addr}/token"));
            let err = client
                .exchange_code(&code("c"), "User.Read")
                .await
                .unwrap_err();
            match err {
                AuthError::TokenEndpoint { status, body } => {
                    assert_eq!(status, StatusCode::BAD_REQUEST);
                    assert!(body.is_empty());
                }
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }

    #[test]
    fn overflowing_expires_in_is_rejected() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            server.mock(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "A",
                    "expires_in": i64::MAX,
                }));
            });

            let client = test_client(&server.url("/token"));
            let err = client
                .exchange_code(&code("c"), "User.Read")
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::MalformedTokenResponse { .. }));
        });
    }

    #[test]
    fn token_endpoint_failure() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST).path("/token");
                then.status(400).body("invalid_grant");
            });

            let client = test_client(&server.url("/token"));
            let err = client
                .exchange_code(&code("bad"), "User.Read")
                .await
                .unwrap_err();
            mock.assert();
            match err {
                AuthError::TokenEndpoint { status, body } => {
                    assert_eq!(status, StatusCode::BAD_REQUEST);
                    assert_eq!(body, "invalid_grant");
                }
                other => panic!("unexpected error: {other:?}"),
            }
        });
    }

    #[test]
    fn refresh_keeps_refresh_token_when_not_rotated() {
        let rt = runtime();
        rt.block_on(async {
            let server = MockServer::start();
            let mock = server.mock(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=refresh_token")
                    .body_contains("refresh_token=old-refresh");
                then.status(200).json_body_obj(&serde_json::json!({
                    "access_token": "new-access",
                    "expires_in": 3600
                }));
            });

            let client = test_client(&server.url("/token"));
            let tokens = client
                .refresh_tokens("old-refresh", "User.Read")
                .await
                .unwrap();
            mock.assert();
            assert_eq!(tokens.access_token, "new-access");
            assert_eq!(tokens.refresh_token.as_deref(), Some("old-refresh"));
        });
    }
}
