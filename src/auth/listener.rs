//! Single-shot loopback listener for OAuth redirects
//!
//! Serves exactly one `GET /<service>/callback`, hands its query parameters
//! to the waiting flow and shuts down. Dropping the listener also shuts it
//! down, so a timed-out flow never leaves a port bound.

use crate::error::AuthError;
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::debug;

const SUCCESS_PAGE: &str = "<html><body><h3>Authorization complete.</h3>\
<p>You can close this window and return to the terminal.</p></body></html>";

/// Query parameters of the redirect
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

type CallbackSender = Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>;

pub struct CallbackListener {
    addr: SocketAddr,
    host: String,
    service: String,
    rx: oneshot::Receiver<CallbackParams>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CallbackListener {
    /// Bind `host:port`; port 0 picks a free one
    pub async fn bind(host: &str, port: u16, service: &str) -> Result<Self, AuthError> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| AuthError::Listener(format!("{}:{}: {}", host, port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::Listener(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let sender: CallbackSender = Arc::new(Mutex::new(Some(tx)));

        let app = Router::new()
            .route(&format!("/{}/callback", service), get(handle_callback))
            .with_state(sender);

        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                debug!("Redirect listener stopped with error: {}", e);
            }
        });

        debug!("Redirect listener bound on {}", addr);
        Ok(Self {
            addr,
            host: host.to_string(),
            service: service.to_string(),
            rx,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The redirect URI to register with the provider
    pub fn redirect_uri(&self) -> String {
        format!(
            "http://{}:{}/{}/callback",
            self.host,
            self.addr.port(),
            self.service
        )
    }

    /// Wait for the redirect, then dispose of the listener
    pub async fn wait(mut self, timeout: Duration) -> Result<CallbackParams, AuthError> {
        let result = tokio::time::timeout(timeout, &mut self.rx).await;
        self.stop();
        match result {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(AuthError::Listener("listener closed".to_string())),
            Err(_) => Err(AuthError::Timeout),
        }
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_callback(
    State(sender): State<CallbackSender>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let tx = sender.lock().ok().and_then(|mut slot| slot.take());
    if let Some(tx) = tx {
        let _ = tx.send(params);
    }
    Html(SUCCESS_PAGE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receives_callback() {
        let listener = CallbackListener::bind("127.0.0.1", 0, "google").await.unwrap();
        let uri = listener.redirect_uri();
        assert!(uri.starts_with("http://127.0.0.1:"));
        assert!(uri.ends_with("/google/callback"));

        let request = tokio::spawn(async move {
            reqwest::get(format!("{}?code=abc&state=xyz", uri))
                .await
                .unwrap()
                .text()
                .await
                .unwrap()
        });

        let params = listener.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert!(request.await.unwrap().contains("Authorization complete"));
    }

    #[tokio::test]
    async fn test_times_out() {
        let listener = CallbackListener::bind("127.0.0.1", 0, "github").await.unwrap();
        let err = listener.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, AuthError::Timeout));
    }

    #[tokio::test]
    async fn test_other_paths_not_served() {
        let listener = CallbackListener::bind("127.0.0.1", 0, "google").await.unwrap();
        let addr = listener.local_addr();
        let response = reqwest::get(format!("http://{}/other/callback?code=x", addr))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
        assert!(matches!(
            listener.wait(Duration::from_millis(50)).await,
            Err(AuthError::Timeout)
        ));
    }
}
