//! Authorization-Code + PKCE engine
//!
//! Runs the interactive browser flow, persists the resulting session and
//! refreshes the access token for the HTTP envelope. Refreshes of one service
//! go through the shared [`RefreshCoordinator`] so concurrent callers that
//! observed the same 401 trigger a single token request and share its result.

use super::listener::CallbackListener;
use super::refresh::RefreshCoordinator;
use super::session::{OAuthSession, TokenResponse, CLIENT_ID, CLIENT_SECRET};
use super::BrowserLauncher;
use crate::config::OAuthConfig;
use crate::error::{AuthError, ToolError};
use crate::secrets::Namespace;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::FutureExt;
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::ACCEPT;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

/// A PKCE verifier and its S256 challenge
#[derive(Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl std::fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("challenge", &self.challenge)
            .finish()
    }
}

impl PkceChallenge {
    /// 256-bit random verifier
    pub fn generate() -> Self {
        Self::from_verifier(&random_token(32))
    }

    pub fn from_verifier(verifier: &str) -> Self {
        let digest = Sha256::digest(verifier.as_bytes());
        Self {
            verifier: verifier.to_string(),
            challenge: URL_SAFE_NO_PAD.encode(digest),
        }
    }
}

/// base64url of `bytes` random bytes
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Endpoints and client registration of an OAuth2 provider
#[derive(Debug, Clone, Default)]
pub struct OAuth2Provider {
    /// Secret Store namespace the session lives in
    pub service: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Falls back to the stored `client_id`
    pub client_id: Option<String>,
    /// Falls back to the stored `client_secret`, read at each grant
    pub client_secret: Option<String>,
    /// Extra authorization parameters such as `access_type=offline`
    pub extra_params: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct PkceEngine {
    provider: OAuth2Provider,
    namespace: Namespace,
    client: reqwest::Client,
    oauth: OAuthConfig,
    refresh: RefreshCoordinator,
}

impl std::fmt::Debug for PkceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceEngine")
            .field("service", &self.provider.service)
            .finish()
    }
}

impl PkceEngine {
    pub fn new(
        provider: OAuth2Provider,
        namespace: Namespace,
        client: reqwest::Client,
        oauth: OAuthConfig,
        refresh: RefreshCoordinator,
    ) -> Self {
        Self {
            provider,
            namespace,
            client,
            oauth,
            refresh,
        }
    }

    pub fn service(&self) -> &str {
        &self.provider.service
    }

    pub fn provider(&self) -> &OAuth2Provider {
        &self.provider
    }

    /// Stored session, if any
    pub async fn session(&self) -> Result<Option<OAuthSession>, ToolError> {
        Ok(OAuthSession::load(&self.namespace).await?)
    }

    async fn client_id(&self) -> Result<String, AuthError> {
        if let Some(id) = &self.provider.client_id {
            return Ok(id.clone());
        }
        self.namespace
            .get(CLIENT_ID)
            .await?
            .ok_or_else(|| AuthError::MissingClientId(self.provider.service.clone()))
    }

    async fn client_secret(&self) -> Result<Option<String>, AuthError> {
        if let Some(secret) = &self.provider.client_secret {
            return Ok(Some(secret.clone()));
        }
        Ok(self.namespace.get(CLIENT_SECRET).await?)
    }

    /// Authorization URL for one flow
    pub fn authorization_url(
        &self,
        client_id: &str,
        pkce: &PkceChallenge,
        state: &str,
        redirect_uri: &str,
    ) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.provider.authorize_url)
            .map_err(|e| AuthError::Provider(format!("invalid authorize_url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256")
                .append_pair("state", state);
            if !self.provider.scopes.is_empty() {
                query.append_pair("scope", &self.provider.scopes.join(" "));
            }
            for (key, value) in &self.provider.extra_params {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Run the interactive flow and persist the session
    pub async fn authorize(
        &self,
        browser: &dyn BrowserLauncher,
    ) -> Result<OAuthSession, AuthError> {
        let client_id = self.client_id().await?;
        let pkce = PkceChallenge::generate();
        let state = random_token(16);

        let listener = CallbackListener::bind(
            &self.oauth.redirect_host,
            self.oauth.redirect_port,
            &self.provider.service,
        )
        .await?;
        let redirect_uri = listener.redirect_uri();
        let url = self.authorization_url(&client_id, &pkce, &state, &redirect_uri)?;

        info!("Authorizing '{}' via {}", self.provider.service, redirect_uri);
        if let Err(e) = browser.open(url.as_str()) {
            warn!("{}; open this URL to continue: {}", e, url);
        }

        let params = listener.wait(self.oauth.callback_timeout()).await?;
        if let Some(error) = params.error {
            let detail = params.error_description.unwrap_or_default();
            return Err(AuthError::Provider(format!("{} {}", error, detail).trim().to_string()));
        }
        if params.state.as_deref() != Some(state.as_str()) {
            return Err(AuthError::StateMismatch);
        }
        let code = params
            .code
            .ok_or_else(|| AuthError::Provider("redirect carried no code".to_string()))?;

        let token = self
            .exchange_code(&code, &pkce.verifier, &redirect_uri, &client_id)
            .await?;
        let session = OAuthSession::from_token(token, Some(client_id));
        session.save(&self.namespace).await?;
        info!("Stored authorization for '{}'", self.provider.service);
        Ok(session)
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
        client_id: &str,
    ) -> Result<TokenResponse, AuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("code_verifier", verifier.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("client_id", client_id.to_string()),
        ];
        if let Some(secret) = self.client_secret().await? {
            form.push(("client_secret", secret));
        }
        self.request_token(&form).await
    }

    /// Access token for the next outbound call
    pub async fn access_token(&self) -> Result<String, ToolError> {
        match self.session().await? {
            Some(session) => Ok(session.access_token),
            None => Err(self.expired("no stored authorization")),
        }
    }

    /// Whether the stored session can be refreshed
    pub async fn can_refresh(&self) -> Result<bool, ToolError> {
        Ok(self
            .session()
            .await?
            .map(|s| !s.is_manual())
            .unwrap_or(false))
    }

    /// Whether the stored access token is past its expiry
    pub async fn is_expired(&self) -> Result<bool, ToolError> {
        Ok(self
            .session()
            .await?
            .map(|s| s.is_expired())
            .unwrap_or(false))
    }

    /// Replace `stale` with a fresh access token
    ///
    /// Joins an in-flight refresh of the same service and shares its outcome.
    /// A stored token that already differs from `stale` is returned as is.
    pub async fn refresh(&self, stale: &str) -> Result<String, ToolError> {
        let engine = self.clone();
        let rejected = stale.to_string();
        self.refresh
            .single_flight(&self.provider.service, stale, move || {
                async move { engine.refresh_stored(&rejected).await }.boxed()
            })
            .await
    }

    async fn refresh_stored(&self, stale: &str) -> Result<String, ToolError> {
        let session = self
            .session()
            .await?
            .ok_or_else(|| self.expired("no stored authorization"))?;
        if session.access_token != stale {
            debug!("Token for '{}' was already refreshed", self.provider.service);
            return Ok(session.access_token);
        }
        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or_else(|| self.expired("no refresh token"))?;

        let token = self
            .refresh_grant(&refresh_token, session.client_id.as_deref())
            .await
            .map_err(|e| e.into_tool_error(&self.provider.service))?;
        let next = session.refreshed(token);
        next.save(&self.namespace).await?;
        info!("Refreshed access token for '{}'", self.provider.service);
        Ok(next.access_token)
    }

    async fn refresh_grant(
        &self,
        refresh_token: &str,
        stored_client_id: Option<&str>,
    ) -> Result<TokenResponse, AuthError> {
        let client_id = self
            .provider
            .client_id
            .as_deref()
            .or(stored_client_id)
            .ok_or_else(|| AuthError::MissingClientId(self.provider.service.clone()))?;
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
            ("client_id", client_id.to_string()),
        ];
        if let Some(secret) = self.client_secret().await? {
            form.push(("client_secret", secret));
        }
        self.request_token(&form).await
    }

    async fn request_token(&self, form: &[(&str, String)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .post(&self.provider.token_url)
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        if !status.is_success() {
            let message = token_error_message(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            let scrubbed = self.namespace.redactor().scrub_upstream(&message);
            return Err(AuthError::Exchange(format!("{}: {}", status.as_u16(), scrubbed)));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AuthError::Exchange(format!("invalid token response: {}", e)))?;
        self.namespace.redactor().register(&token.access_token);
        Ok(token)
    }

    fn expired(&self, reason: &str) -> ToolError {
        ToolError::AuthExpired {
            service: self.provider.service.clone(),
            reason: reason.to_string(),
        }
    }
}

/// `error_description` or `error` from a token endpoint error body
fn token_error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    json.get("error_description")
        .or_else(|| json.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Redactor;
    use crate::secrets::{CredentialBroker, MasterKey, SecretStore};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn namespace(dir: &TempDir) -> Namespace {
        let store = SecretStore::open(dir.path(), MasterKey::generate()).unwrap();
        CredentialBroker::new(store, Redactor::new(false))
            .keychain("drive", ["google"])
            .namespace("google")
            .unwrap()
    }

    fn engine(ns: Namespace, server_url: &str) -> PkceEngine {
        let provider = OAuth2Provider {
            service: "google".to_string(),
            authorize_url: format!("{}/authorize", server_url),
            token_url: format!("{}/token", server_url),
            scopes: vec!["drive.readonly".to_string(), "email".to_string()],
            client_id: Some("C".to_string()),
            ..Default::default()
        };
        let oauth = OAuthConfig {
            redirect_port: 0,
            callback_timeout: 5,
            ..OAuthConfig::default()
        };
        PkceEngine::new(provider, ns, reqwest::Client::new(), oauth, RefreshCoordinator::new())
    }

    /// Follows the redirect the way a browser would
    struct RedirectingBrowser;

    impl BrowserLauncher for RedirectingBrowser {
        fn open(&self, url: &str) -> Result<(), AuthError> {
            let url = Url::parse(url).map_err(|e| AuthError::Browser(e.to_string()))?;
            let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
            let target = format!(
                "{}?code=the-code&state={}",
                params["redirect_uri"], params["state"]
            );
            tokio::spawn(async move {
                let _ = reqwest::get(target).await;
            });
            Ok(())
        }
    }

    #[test]
    fn test_known_challenge() {
        let pkce = PkceChallenge::from_verifier("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(pkce.challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_generated_verifier_shape() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.verifier.len(), 43);
        assert!(pkce
            .verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(pkce.verifier, PkceChallenge::generate().verifier);
    }

    #[tokio::test]
    async fn test_authorization_url() {
        let temp_dir = TempDir::new().unwrap();
        let engine = engine(namespace(&temp_dir), "https://accounts.example.com");
        let pkce = PkceChallenge::from_verifier("v");
        let url = engine
            .authorization_url("C", &pkce, "st", "http://127.0.0.1:4839/google/callback")
            .unwrap();

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], pkce.challenge);
        assert_eq!(params["state"], "st");
        assert_eq!(params["scope"], "drive.readonly email");
        assert_eq!(params["redirect_uri"], "http://127.0.0.1:4839/google/callback");
    }

    #[tokio::test]
    async fn test_authorize_flow_persists_session() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "the-code".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"A","refresh_token":"R","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);
        let engine = engine(ns.clone(), &server.url());

        let session = engine.authorize(&RedirectingBrowser).await.unwrap();
        assert_eq!(session.access_token, "A");
        token.assert_async().await;

        assert_eq!(ns.get("access_token").await.unwrap().as_deref(), Some("A"));
        assert_eq!(ns.get("refresh_token").await.unwrap().as_deref(), Some("R"));
        assert_eq!(ns.get("client_id").await.unwrap().as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn test_refresh_joins_when_token_changed() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .expect(0)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);
        OAuthSession {
            access_token: "B".into(),
            refresh_token: Some("R".into()),
            client_id: Some("C".into()),
            expires_at: None,
        }
        .save(&ns)
        .await
        .unwrap();

        let engine = engine(ns, &server.url());
        assert_eq!(engine.refresh("A").await.unwrap(), "B");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_is_auth_expired() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);
        OAuthSession {
            access_token: "A".into(),
            refresh_token: Some("R".into()),
            client_id: None,
            expires_at: None,
        }
        .save(&ns)
        .await
        .unwrap();

        let err = engine(ns, &server.url()).refresh("A").await.unwrap_err();
        match err {
            ToolError::AuthExpired { service, reason } => {
                assert_eq!(service, "google");
                assert!(reason.contains("invalid_grant"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refresh_reads_rotated_client_secret() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("client_secret".into(), "S2".into()),
            ]))
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"B","expires_in":3600}"#)
            .expect(1)
            .create_async()
            .await;

        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);
        ns.set(CLIENT_SECRET, "S1").await.unwrap();
        OAuthSession {
            access_token: "A".into(),
            refresh_token: Some("R".into()),
            client_id: Some("C".into()),
            expires_at: None,
        }
        .save(&ns)
        .await
        .unwrap();

        let engine = engine(ns.clone(), &server.url());
        ns.set(CLIENT_SECRET, "S2").await.unwrap();

        assert_eq!(engine.refresh("A").await.unwrap(), "B");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_manual_session_cannot_refresh() {
        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);
        ns.set("access_token", "A").await.unwrap();

        let engine = engine(ns, "http://127.0.0.1:9");
        assert!(!engine.can_refresh().await.unwrap());
        assert!(matches!(
            engine.refresh("A").await,
            Err(ToolError::AuthExpired { .. })
        ));
    }
}
