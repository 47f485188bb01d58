//! Per-service single-flight token refresh

use crate::error::ToolError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a settled refresh keeps answering callers with the same stale token
const JOIN_WINDOW: Duration = Duration::from_secs(2);

type Outcome = (Result<String, ToolError>, Instant);

struct Flight {
    stale: String,
    outcome: Shared<BoxFuture<'static, Outcome>>,
}

impl Flight {
    fn start(stale: &str, refresh: BoxFuture<'static, Result<String, ToolError>>) -> Self {
        let outcome = async move { (refresh.await, Instant::now()) }
            .boxed()
            .shared();
        Self {
            stale: stale.to_string(),
            outcome,
        }
    }

    /// Still running, or settled moments ago for the same stale token
    fn joinable(&self, stale: &str) -> bool {
        match self.outcome.peek() {
            None => true,
            Some((_, settled)) => self.stale == stale && settled.elapsed() < JOIN_WINDOW,
        }
    }
}

/// Coalesces concurrent refreshes of the same service
///
/// The first caller starts the refresh; callers arriving while it runs await
/// the same outcome, success or failure, instead of contacting the token
/// endpoint themselves.
#[derive(Clone, Default)]
pub struct RefreshCoordinator {
    flights: Arc<DashMap<String, Flight>>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("services", &self.flights.len())
            .finish()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `refresh` for `service` unless a refresh is already in flight
    ///
    /// `stale` is the access token the caller saw rejected.
    pub async fn single_flight<F>(
        &self,
        service: &str,
        stale: &str,
        refresh: F,
    ) -> Result<String, ToolError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<String, ToolError>>,
    {
        let outcome = match self.flights.entry(service.to_string()) {
            Entry::Occupied(entry) if entry.get().joinable(stale) => {
                debug!("Joining refresh of '{}'", service);
                entry.get().outcome.clone()
            }
            Entry::Occupied(mut entry) => {
                let flight = Flight::start(stale, refresh());
                let outcome = flight.outcome.clone();
                entry.insert(flight);
                outcome
            }
            Entry::Vacant(entry) => {
                let flight = Flight::start(stale, refresh());
                let outcome = flight.outcome.clone();
                entry.insert(flight);
                outcome
            }
        };
        outcome.await.0
    }
}
