use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use super::AuthError;

/// Single-use proof of consent issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationCode(String);

impl AuthorizationCode {
    pub fn new<S: Into<String>>(value: S) -> Result<Self, AuthError> {
        let value = value.into();
        if value.is_empty() {
            return Err(AuthError::MissingAuthorizationCode);
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

// Codes are credentials; keep them out of logs.
impl fmt::Debug for AuthorizationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorizationCode(<{} bytes>)", self.0.len())
    }
}

/// What a redirect to the callback path delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code(AuthorizationCode),
    Denied {
        error: String,
        description: Option<String>,
    },
}

impl CallbackOutcome {
    pub fn into_code(self) -> Result<AuthorizationCode, AuthError> {
        match self {
            CallbackOutcome::Code(code) => Ok(code),
            CallbackOutcome::Denied { error, description } => Err(AuthError::AccessDenied(
                match description {
                    Some(description) => format!("{error}: {description}"),
                    None => error,
                },
            )),
        }
    }
}

/// Write-once slot shared between the redirect listener and the login coordinator.
///
/// The first recorded outcome wins; anything recorded afterwards is dropped.
/// Clones share the same slot.
#[derive(Debug, Clone)]
pub struct CodeSlot {
    tx: Arc<watch::Sender<Option<CallbackOutcome>>>,
}

impl CodeSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Store `outcome` if the slot is still empty. Returns whether it was stored.
    pub fn record(&self, outcome: CallbackOutcome) -> bool {
        let stored = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
        if stored {
            info!("authorization redirect captured");
        } else {
            warn!("ignoring additional authorization redirect; an outcome was already captured");
        }
        stored
    }

    pub fn current(&self) -> Option<CallbackOutcome> {
        self.tx.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_none()
    }

    /// Resolve once an outcome has been recorded.
    pub async fn wait(&self) -> CallbackOutcome {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CodeSlot {
    fn default() -> Self {
        Self::new()
    }
}
