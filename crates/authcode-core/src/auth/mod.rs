mod code;
mod coordinator;
mod error;
mod launcher;
mod listener;
mod oauth;

pub use code::{AuthorizationCode, CallbackOutcome, CodeSlot};
pub use coordinator::{LoginCoordinator, LoginState};
pub use error::AuthError;
pub use launcher::{BrowserLauncher, CommandLauncher, ConfiguredLauncher, SystemBrowser};
pub use listener::{RedirectListener, CONFIRMATION_BODY};
pub use oauth::{OAuthClient, TokenPair};
