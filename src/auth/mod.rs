//! OAuth engines
//!
//! - `pkce`: Authorization-Code + PKCE with refresh
//! - `oauth1`: OAuth 1.0a HMAC-SHA1 signer
//! - `listener`: single-shot loopback redirect listener
//! - `refresh`: per-service single-flight latch
//! - `session`: stored OAuth2 session

mod listener;
mod oauth1;
mod pkce;
mod refresh;
mod session;

pub use listener::{CallbackListener, CallbackParams};
pub use oauth1::{OAuth1Credentials, OAuth1Signer, SignedRequest};
pub use pkce::{random_token, OAuth2Provider, PkceChallenge, PkceEngine};
pub use refresh::RefreshCoordinator;
pub use session::{OAuthSession, TokenResponse, CLIENT_SECRET};

use crate::error::AuthError;

/// Opens authorization URLs for the user
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> Result<(), AuthError>;
}

/// The platform's default browser
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), AuthError> {
        webbrowser::open(url).map_err(|e| AuthError::Browser(e.to_string()))
    }
}

/// Never opens anything; the flow logs the URL instead
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualBrowser;

impl BrowserLauncher for ManualBrowser {
    fn open(&self, _url: &str) -> Result<(), AuthError> {
        Err(AuthError::Browser("automatic browser launch disabled".to_string()))
    }
}
