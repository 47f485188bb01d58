//! OAuth 1.0a HMAC-SHA1 request signing

use crate::error::{AuthError, StorageError};
use crate::secrets::Namespace;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

pub const CONSUMER_KEY: &str = "consumer_key";
pub const CONSUMER_SECRET: &str = "consumer_secret";
pub const TOKEN: &str = "access_token";
pub const TOKEN_SECRET: &str = "access_token_secret";

/// Consumer and token credentials
#[derive(Clone)]
pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token: String,
    pub token_secret: String,
}

impl std::fmt::Debug for OAuth1Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Credentials")
            .field("consumer_key", &self.consumer_key)
            .finish()
    }
}

impl OAuth1Credentials {
    /// Load all four values; `None` if any is missing
    pub async fn load(ns: &Namespace) -> Result<Option<Self>, StorageError> {
        let (Some(consumer_key), Some(consumer_secret), Some(token), Some(token_secret)) = (
            ns.get(CONSUMER_KEY).await?,
            ns.get(CONSUMER_SECRET).await?,
            ns.get(TOKEN).await?,
            ns.get(TOKEN_SECRET).await?,
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            consumer_key,
            consumer_secret,
            token,
            token_secret,
        }))
    }
}

/// Result of signing one request
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Value for the `Authorization` header
    pub header: String,
    pub signature: String,
    pub base_string: String,
}

#[derive(Debug, Clone)]
pub struct OAuth1Signer {
    credentials: OAuth1Credentials,
}

impl OAuth1Signer {
    pub fn new(credentials: OAuth1Credentials) -> Self {
        Self { credentials }
    }

    /// `Authorization` header for a request, with a fresh nonce and timestamp
    ///
    /// `params` are form body parameters; query parameters are read from
    /// `url`.
    pub fn authorization_header(
        &self,
        method: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<String, AuthError> {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let timestamp = chrono::Utc::now().timestamp().max(0) as u64;
        Ok(self
            .sign_with(method, url, params, &hex::encode(nonce), timestamp)?
            .header)
    }

    /// Sign with an explicit nonce and timestamp
    pub fn sign_with(
        &self,
        method: &str,
        url: &str,
        params: &[(String, String)],
        nonce: &str,
        timestamp: u64,
    ) -> Result<SignedRequest, AuthError> {
        let parsed = Url::parse(url).map_err(|e| AuthError::Signing(e.to_string()))?;
        let base_url = normalized_base_url(&parsed)?;

        let creds = &self.credentials;
        let oauth_params: Vec<(String, String)> = vec![
            ("oauth_consumer_key".into(), creds.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_token".into(), creds.token.clone()),
            ("oauth_version".into(), "1.0".into()),
        ];

        let mut encoded: Vec<(String, String)> = oauth_params
            .iter()
            .cloned()
            .chain(parsed.query_pairs().into_owned())
            .chain(params.iter().cloned())
            .map(|(k, v)| (percent(&k), percent(&v)))
            .collect();
        encoded.sort();
        let param_string = encoded
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let base_string = format!(
            "{}&{}&{}",
            method.to_uppercase(),
            percent(&base_url),
            percent(&param_string)
        );
        let signing_key = format!(
            "{}&{}",
            percent(&creds.consumer_secret),
            percent(&creds.token_secret)
        );

        let mut mac = HmacSha1::new_from_slice(signing_key.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(base_string.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let mut header_params = oauth_params;
        header_params.push(("oauth_signature".into(), signature.clone()));
        header_params.sort();
        let header = format!(
            "OAuth {}",
            header_params
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", percent(k), percent(v)))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(SignedRequest {
            header,
            signature,
            base_string,
        })
    }
}

/// RFC 3986 encoding: everything but unreserved characters
fn percent(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Scheme and host lowercased, default port dropped, no query or fragment
fn normalized_base_url(url: &Url) -> Result<String, AuthError> {
    let host = url
        .host_str()
        .ok_or_else(|| AuthError::Signing("url has no host".to_string()))?;
    let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
    Ok(format!(
        "{}://{}{}{}",
        url.scheme(),
        host.to_lowercase(),
        port,
        url.path()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> OAuth1Signer {
        OAuth1Signer::new(OAuth1Credentials {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".into(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".into(),
            token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".into(),
            token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".into(),
        })
    }

    #[test]
    fn test_published_signature() {
        let signed = signer()
            .sign_with(
                "post",
                "https://api.twitter.com/1/statuses/update.json?include_entities=true",
                &[(
                    "status".into(),
                    "Hello Ladies + Gentlemen, a signed OAuth request!".into(),
                )],
                "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg",
                1318622958,
            )
            .unwrap();

        assert_eq!(signed.signature, "tnnArxj06cWHq44gCs1OSKk/jLY=");
        assert!(signed.base_string.starts_with(
            "POST&https%3A%2F%2Fapi.twitter.com%2F1%2Fstatuses%2Fupdate.json&include_entities%3Dtrue%26oauth_consumer_key"
        ));
        assert!(signed
            .base_string
            .ends_with("status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"));
    }

    #[test]
    fn test_header_shape() {
        let signed = signer()
            .sign_with("GET", "https://api.example.com/1/r", &[], "abc", 1)
            .unwrap();
        assert!(signed.header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\", "));
        assert!(signed.header.contains("oauth_nonce=\"abc\""));
        assert!(signed.header.contains("oauth_signature_method=\"HMAC-SHA1\""));
        assert!(signed.header.contains(&format!(
            "oauth_signature=\"{}\"",
            urlencoding::encode(&signed.signature)
        )));
        assert!(signed.header.ends_with("oauth_version=\"1.0\""));
    }

    #[test]
    fn test_base_url_normalization() {
        let url = Url::parse("HTTPS://API.Example.com:443/a/b?x=1#frag").unwrap();
        assert_eq!(normalized_base_url(&url).unwrap(), "https://api.example.com/a/b");
        let url = Url::parse("http://example.com:8080/p").unwrap();
        assert_eq!(normalized_base_url(&url).unwrap(), "http://example.com:8080/p");
    }

    #[test]
    fn test_fresh_nonce_each_call() {
        let signer = signer();
        let a = signer.authorization_header("GET", "https://api.example.com/r", &[]).unwrap();
        let b = signer.authorization_header("GET", "https://api.example.com/r", &[]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            signer().sign_with("GET", "not a url", &[], "n", 1),
            Err(AuthError::Signing(_))
        ));
    }
}
