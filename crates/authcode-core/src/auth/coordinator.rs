use tracing::{debug, info, warn};

use super::{
    AuthError, AuthorizationCode, BrowserLauncher, CodeSlot, OAuthClient, RedirectListener,
    TokenPair,
};

/// Progress of one login attempt. Attempts only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    NotStarted,
    ListenerActive,
    BrowserLaunched,
    CodeCaptured,
    ListenerStopped,
    Done,
    Failed,
}

impl LoginState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoginState::Done | LoginState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: LoginState) -> bool {
        use LoginState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (NotStarted, ListenerActive)
            | (ListenerActive, BrowserLaunched)
            | (BrowserLaunched, CodeCaptured)
            | (CodeCaptured, ListenerStopped)
            | (ListenerStopped, Done) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct LoginAttempt {
    state: LoginState,
}

impl LoginAttempt {
    fn new() -> Self {
        Self {
            state: LoginState::NotStarted,
        }
    }

    fn advance(&mut self, next: LoginState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal login transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "login state");
        self.state = next;
    }
}

/// Drives a browser login: listener up, browser out, code back, listener down.
#[derive(Debug)]
pub struct LoginCoordinator<L> {
    client: OAuthClient,
    launcher: L,
}

impl<L> LoginCoordinator<L>
where
    L: BrowserLauncher,
{
    pub fn new(client: OAuthClient, launcher: L) -> Self {
        Self { client, launcher }
    }

    pub fn client(&self) -> &OAuthClient {
        &self.client
    }

    /// Run one login attempt and return the captured authorization code.
    ///
    /// Waits for the redirect for at most `login_timeout` when configured,
    /// otherwise indefinitely.
    pub async fn run_login(&self) -> Result<AuthorizationCode, AuthError> {
        self.run_attempt().await.map(|(code, _)| code)
    }

    /// Run a login attempt and exchange the code for tokens with the configured scopes.
    pub async fn login_and_exchange(&self) -> Result<TokenPair, AuthError> {
        let (code, client) = self.run_attempt().await?;
        client.exchange_code(&code, &client.config().scope()).await
    }

    async fn run_attempt(&self) -> Result<(AuthorizationCode, OAuthClient), AuthError> {
        let mut attempt = LoginAttempt::new();
        let result = self.drive(&mut attempt).await;
        if let Err(err) = &result {
            warn!(error = %err, state = ?attempt.state, "login attempt failed");
            attempt.advance(LoginState::Failed);
        }
        result
    }

    async fn drive(
        &self,
        attempt: &mut LoginAttempt,
    ) -> Result<(AuthorizationCode, OAuthClient), AuthError> {
        let config = self.client.config();
        let slot = CodeSlot::new();
        let listener = RedirectListener::start(config, slot.clone()).await?;
        attempt.advance(LoginState::ListenerActive);

        // The listener may have been given an ephemeral port.
        let client = self.client.clone_with_port(listener.local_addr().port());
        let launched = client
            .authorization_url()
            .and_then(|url| self.launcher.open_url(&url));
        if let Err(err) = launched {
            listener.abort().await;
            return Err(err);
        }
        attempt.advance(LoginState::BrowserLaunched);
        info!(redirect_uri = %listener.redirect_uri(), "waiting for authorization redirect");

        let outcome = match config.login_timeout {
            Some(limit) => match tokio::time::timeout(limit, slot.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    listener.abort().await;
                    return Err(AuthError::Timeout(limit));
                }
            },
            None => slot.wait().await,
        };
        attempt.advance(LoginState::CodeCaptured);

        listener.shutdown(config.shutdown_grace).await?;
        attempt.advance(LoginState::ListenerStopped);

        let code = outcome.into_code()?;
        attempt.advance(LoginState::Done);
        Ok((code, client))
    }
}
