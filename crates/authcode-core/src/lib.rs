//! OAuth2 authorization-code login for desktop clients.
//!
//! [`auth::LoginCoordinator`] opens the provider's authorization page, catches the
//! redirect on a loopback [`auth::RedirectListener`], and hands the code to
//! [`auth::OAuthClient`] for the token exchange.

pub mod auth;
pub mod config;
