//! Stored OAuth2 session

use crate::error::StorageError;
use crate::secrets::Namespace;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

pub const ACCESS_TOKEN: &str = "access_token";
pub const REFRESH_TOKEN: &str = "refresh_token";
pub const CLIENT_ID: &str = "client_id";
pub const CLIENT_SECRET: &str = "client_secret";
pub const EXPIRES_AT: &str = "expires_at";

/// Clock skew tolerated before an access token counts as expired
const EXPIRY_SKEW_SECS: i64 = 30;

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// `{access_token, refresh_token?, client_id, expires_at?}` under a service
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for OAuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("client_id", &self.client_id)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl OAuthSession {
    /// Session from a fresh authorization-code exchange
    pub fn from_token(token: TokenResponse, client_id: Option<String>) -> Self {
        Self {
            expires_at: expiry(token.expires_in),
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            client_id,
        }
    }

    /// Apply a refresh response; an absent refresh token keeps the old one
    pub fn refreshed(&self, token: TokenResponse) -> Self {
        Self {
            expires_at: expiry(token.expires_in),
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| self.refresh_token.clone()),
            client_id: self.client_id.clone(),
        }
    }

    /// No refresh token: the user re-authorizes when it stops working
    pub fn is_manual(&self) -> bool {
        self.refresh_token.is_none()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) <= now)
            .unwrap_or(false)
    }

    /// Load the session; `None` without an access token
    pub async fn load(ns: &Namespace) -> Result<Option<Self>, StorageError> {
        let Some(access_token) = ns.get(ACCESS_TOKEN).await? else {
            return Ok(None);
        };
        let expires_at = ns
            .get(EXPIRES_AT)
            .await?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc));

        Ok(Some(Self {
            access_token,
            refresh_token: ns.get(REFRESH_TOKEN).await?,
            client_id: ns.get(CLIENT_ID).await?,
            expires_at,
        }))
    }

    /// Persist every present field in one store write
    pub async fn save(&self, ns: &Namespace) -> Result<(), StorageError> {
        let mut entries = vec![(ACCESS_TOKEN.to_string(), self.access_token.clone(), true)];
        if let Some(refresh) = &self.refresh_token {
            entries.push((REFRESH_TOKEN.to_string(), refresh.clone(), true));
        }
        if let Some(client_id) = &self.client_id {
            entries.push((CLIENT_ID.to_string(), client_id.clone(), false));
        }
        if let Some(at) = &self.expires_at {
            entries.push((EXPIRES_AT.to_string(), at.to_rfc3339(), false));
        }
        ns.set_many(entries).await?;

        if self.refresh_token.is_none() {
            ns.delete(REFRESH_TOKEN).await?;
        }
        if self.expires_at.is_none() {
            ns.delete(EXPIRES_AT).await?;
        }
        Ok(())
    }
}

fn expiry(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| Utc::now() + Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Redactor;
    use crate::secrets::{CredentialBroker, MasterKey, SecretStore};
    use tempfile::TempDir;

    fn namespace(dir: &TempDir) -> Namespace {
        let store = SecretStore::open(dir.path(), MasterKey::generate()).unwrap();
        CredentialBroker::new(store, Redactor::new(false))
            .keychain("mail", ["google"])
            .namespace("google")
            .unwrap()
    }

    fn token(access: &str, refresh: Option<&str>) -> TokenResponse {
        TokenResponse {
            access_token: access.to_string(),
            refresh_token: refresh.map(str::to_string),
            expires_in: Some(3600),
            token_type: Some("Bearer".to_string()),
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);

        let session = OAuthSession::from_token(token("A", Some("R")), Some("C".into()));
        session.save(&ns).await.unwrap();

        let loaded = OAuthSession::load(&ns).await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "A");
        assert_eq!(loaded.refresh_token.as_deref(), Some("R"));
        assert_eq!(loaded.client_id.as_deref(), Some("C"));
        assert!(!loaded.is_expired());
        assert!(!loaded.is_manual());
    }

    #[tokio::test]
    async fn test_missing_access_token_is_absent() {
        let temp_dir = TempDir::new().unwrap();
        let ns = namespace(&temp_dir);
        ns.set(CLIENT_ID, "C").await.unwrap();
        assert!(OAuthSession::load(&ns).await.unwrap().is_none());
    }

    #[test]
    fn test_refresh_keeps_refresh_token() {
        let session = OAuthSession::from_token(token("A", Some("R")), None);
        let next = session.refreshed(token("B", None));
        assert_eq!(next.access_token, "B");
        assert_eq!(next.refresh_token.as_deref(), Some("R"));

        let rotated = session.refreshed(token("B", Some("R2")));
        assert_eq!(rotated.refresh_token.as_deref(), Some("R2"));
    }

    #[test]
    fn test_expiry_skew() {
        let now = Utc::now();
        let mut session = OAuthSession::from_token(token("A", None), None);
        session.expires_at = Some(now + Duration::seconds(10));
        assert!(session.is_expired_at(now));
        session.expires_at = Some(now + Duration::seconds(120));
        assert!(!session.is_expired_at(now));
        session.expires_at = None;
        assert!(!session.is_expired_at(now));
    }

    #[test]
    fn test_debug_hides_tokens() {
        let session = OAuthSession::from_token(token("secret-access", Some("secret-refresh")), None);
        let shown = format!("{:?}", session);
        assert!(!shown.contains("secret-access"));
        assert!(!shown.contains("secret-refresh"));
    }
}
