//! Per-plugin HTTP call envelope
//!
//! Composes URLs, attaches credentials, maps upstream responses onto the
//! tool error taxonomy and refreshes OAuth2 tokens on 401 with a budget of
//! one refresh per logical call.

use super::retry::{with_retry, Idempotency, RetryPolicy};
use crate::auth::{OAuth1Signer, PkceEngine};
use crate::error::ToolError;
use crate::logging::Redactor;
use crate::secrets::Namespace;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// How outbound calls are authenticated
#[derive(Debug, Clone)]
pub enum AuthStrategy {
    None,
    /// `Authorization: Bearer <value of key>`
    Bearer { namespace: Namespace, key: String },
    /// `<header>: <value of key>`
    ApiKeyHeader {
        header: String,
        namespace: Namespace,
        key: String,
    },
    /// Bearer token from a PKCE session, refreshed on 401
    OAuth2(Arc<PkceEngine>),
    /// Signed `Authorization: OAuth ...`
    OAuth1 {
        service: String,
        signer: Arc<OAuth1Signer>,
    },
}

impl AuthStrategy {
    fn service(&self) -> Option<&str> {
        match self {
            AuthStrategy::None => None,
            AuthStrategy::Bearer { namespace, .. } => Some(namespace.service()),
            AuthStrategy::ApiKeyHeader { namespace, .. } => Some(namespace.service()),
            AuthStrategy::OAuth2(engine) => Some(engine.service()),
            AuthStrategy::OAuth1 { service, .. } => Some(service),
        }
    }
}

/// Options of one call
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Defaults to GET
    pub method: Option<Method>,
    /// Serialized as JSON
    pub body: Option<Value>,
    /// Appended in order
    pub query: Vec<(String, String)>,
    /// Sent as is, bypassing JSON serialization
    pub raw_body: Option<Vec<u8>>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Allow `call_with_retry` to repeat a non-idempotent request
    pub retry_non_idempotent: bool,
}

impl CallOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn method(method: Method) -> Self {
        Self {
            method: Some(method),
            ..Self::default()
        }
    }

    pub fn json(method: Method, body: Value) -> Self {
        Self {
            method: Some(method),
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn raw_body(mut self, body: Vec<u8>, content_type: impl Into<String>) -> Self {
        self.raw_body = Some(body);
        self.content_type = Some(content_type.into());
        self
    }

    pub fn retry_non_idempotent(mut self) -> Self {
        self.retry_non_idempotent = true;
        self
    }

    fn http_method(&self) -> Method {
        self.method.clone().unwrap_or(Method::GET)
    }
}

/// Token refreshes left to one logical call, shared by its retries
#[derive(Debug)]
struct RefreshBudget(AtomicU8);

impl RefreshBudget {
    fn new() -> Self {
        Self(AtomicU8::new(1))
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

/// HTTP helper bound to one base URL and auth strategy
#[derive(Debug, Clone)]
pub struct HttpEnvelope {
    client: reqwest::Client,
    base_url: String,
    auth: AuthStrategy,
    redactor: Redactor,
    retry: RetryPolicy,
}

impl HttpEnvelope {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        auth: AuthStrategy,
        redactor: Redactor,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            auth,
            redactor,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform one logical call
    pub async fn call(&self, path: &str, options: CallOptions) -> Result<Value, ToolError> {
        self.attempt(path, &options, &RefreshBudget::new()).await
    }

    /// [`HttpEnvelope::call`] with retries for idempotent requests
    ///
    /// All attempts draw on the same single refresh.
    pub async fn call_with_retry(
        &self,
        path: &str,
        options: CallOptions,
    ) -> Result<Value, ToolError> {
        let idempotency = if options.retry_non_idempotent {
            Idempotency::Idempotent
        } else {
            Idempotency::of_method(&options.http_method())
        };
        let budget = RefreshBudget::new();
        with_retry(&self.retry, idempotency, || {
            self.attempt(path, &options, &budget)
        })
        .await
    }

    async fn attempt(
        &self,
        path: &str,
        options: &CallOptions,
        budget: &RefreshBudget,
    ) -> Result<Value, ToolError> {
        let url = self.url_for(path, &options.query)?;
        let method = options.http_method();
        debug!("{} {}", method, url.path());

        match &self.auth {
            AuthStrategy::OAuth2(engine) => {
                self.call_oauth2(engine, &method, &url, options, budget).await
            }
            _ => {
                let auth_header = self.static_auth_header(&method, &url, options).await?;
                let response = self.send(&method, &url, options, auth_header).await?;
                self.translate(response).await
            }
        }
    }

    async fn call_oauth2(
        &self,
        engine: &PkceEngine,
        method: &Method,
        url: &Url,
        options: &CallOptions,
        budget: &RefreshBudget,
    ) -> Result<Value, ToolError> {
        let session = engine.session().await?.ok_or_else(|| ToolError::AuthExpired {
            service: engine.service().to_string(),
            reason: "no stored authorization".to_string(),
        })?;
        let can_refresh = !session.is_manual();
        let mut token = session.access_token.clone();

        if can_refresh && session.is_expired() && budget.take() {
            debug!("Access token for '{}' expired, refreshing", engine.service());
            token = engine.refresh(&token).await?;
        }

        loop {
            let response = self
                .send(
                    method,
                    url,
                    options,
                    Some((AUTHORIZATION.to_string(), format!("Bearer {}", token))),
                )
                .await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return self.translate(response).await;
            }

            if can_refresh && budget.take() {
                debug!("401 from upstream, refreshing '{}'", engine.service());
                token = engine.refresh(&token).await?;
                continue;
            }

            let message = self.error_message(response).await;
            return Err(ToolError::AuthExpired {
                service: engine.service().to_string(),
                reason: message,
            });
        }
    }

    async fn static_auth_header(
        &self,
        method: &Method,
        url: &Url,
        options: &CallOptions,
    ) -> Result<Option<(String, String)>, ToolError> {
        match &self.auth {
            AuthStrategy::None | AuthStrategy::OAuth2(_) => Ok(None),
            AuthStrategy::Bearer { namespace, key } => {
                let value = stored(namespace, key).await?;
                Ok(Some((AUTHORIZATION.to_string(), format!("Bearer {}", value))))
            }
            AuthStrategy::ApiKeyHeader {
                header,
                namespace,
                key,
            } => {
                let value = stored(namespace, key).await?;
                Ok(Some((header.clone(), value)))
            }
            AuthStrategy::OAuth1 { service, signer } => {
                let form_params = signed_form_params(options);
                let header = signer
                    .authorization_header(method.as_str(), url.as_str(), &form_params)
                    .map_err(|e| e.into_tool_error(service))?;
                Ok(Some((AUTHORIZATION.to_string(), header)))
            }
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        options: &CallOptions,
        auth_header: Option<(String, String)>,
    ) -> Result<reqwest::Response, ToolError> {
        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header(ACCEPT, "application/json");

        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some((name, value)) = auth_header {
            request = request.header(name.as_str(), value);
        }

        if let Some(raw) = &options.raw_body {
            if let Some(content_type) = &options.content_type {
                request = request.header(CONTENT_TYPE, content_type.as_str());
            }
            request = request.body(raw.clone());
        } else if let Some(body) = &options.body {
            request = request.json(body);
        }

        request.send().await.map_err(|e| {
            let message = self.redactor.scrub_upstream(&e.to_string());
            warn!("Request to {} failed: {}", url.path(), message);
            ToolError::Transient(message)
        })
    }

    /// Map a response onto a payload or a typed error
    async fn translate(&self, response: reqwest::Response) -> Result<Value, ToolError> {
        let status = response.status();

        if status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| ToolError::Transient(e.to_string()))?;
            if text.trim().is_empty() {
                return Ok(json!({}));
            }
            return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
        }

        if status == StatusCode::UNAUTHORIZED {
            if let Some(service) = self.auth.service() {
                let service = service.to_string();
                let reason = self.error_message(response).await;
                return Err(ToolError::AuthExpired { service, reason });
            }
        }

        let message = self.error_message(response).await;
        if status.is_server_error() {
            Err(ToolError::Transient(format!("{}: {}", status.as_u16(), message)))
        } else {
            Err(ToolError::Client {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Scrubbed server message, falling back to the status reason
    async fn error_message(&self, response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = extract_error_message(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        self.redactor.scrub_upstream(&message)
    }

    fn url_for(&self, path: &str, query: &[(String, String)]) -> Result<Url, ToolError> {
        let joined = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };
        let mut url = Url::parse(&joined).map_err(|e| ToolError::invalid("url", e.to_string()))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

async fn stored(namespace: &Namespace, key: &str) -> Result<String, ToolError> {
    namespace
        .get(key)
        .await?
        .ok_or_else(|| ToolError::NotConfigured {
            plugin: namespace.service().to_string(),
            hint: format!("no '{}' stored for service '{}'", key, namespace.service()),
        })
}

/// Form body parameters take part in the OAuth1 signature
fn signed_form_params(options: &CallOptions) -> Vec<(String, String)> {
    match (&options.raw_body, options.content_type.as_deref()) {
        (Some(raw), Some(content_type)) if content_type.starts_with(FORM_CONTENT_TYPE) => {
            url::form_urlencoded::parse(raw).into_owned().collect()
        }
        _ => Vec::new(),
    }
}

/// `detail`, `title`, `error.message`, `error` or `message` of an error body
fn extract_error_message(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    let candidates = [
        json.get("detail"),
        json.get("title"),
        json.get("error").and_then(|e| e.get("message")),
        json.get("error"),
        json.get("message"),
    ];
    let found = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string));
    found
}
