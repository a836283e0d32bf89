use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{info, warn};

use super::Target;

/// How long before expiry the cached token is considered stale.
const RENEW_MARGIN_MINUTES: i64 = 30;

#[derive(Debug, Clone)]
struct RegToken {
    value: String,
    renew_at: DateTime<Utc>,
}

type FetchResult = Result<RegToken, Arc<anyhow::Error>>;
type FetchFuture = Shared<BoxFuture<'static, FetchResult>>;

/// Process-wide cache of the target's registration token.
///
/// `get` returns the cached value until `renew_at` (expiry minus
/// 30 minutes). Past that, all callers join a single in-flight fetch:
/// exactly one request reaches the target and every waiter receives the
/// same token or the same error.
pub struct RegistrationTokenStore {
    target: Arc<dyn Target>,
    cached: Arc<RwLock<Option<RegToken>>>,
    inflight: Arc<Mutex<Option<FetchFuture>>>,
}

impl RegistrationTokenStore {
    pub fn new(target: Arc<dyn Target>) -> Self {
        Self {
            target,
            cached: Arc::new(RwLock::new(None)),
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get(&self) -> Result<String> {
        if let Some(value) = self.fresh() {
            return Ok(value);
        }

        match self.join_flight().await {
            Ok(token) => Ok(token.value),
            Err(err) => Err(anyhow!(err)),
        }
    }

    fn fresh(&self) -> Option<String> {
        let cached = self.cached.read().expect("token cache lock poisoned");
        cached
            .as_ref()
            .filter(|token| Utc::now() < token.renew_at)
            .map(|token| token.value.clone())
    }

    /// Joins the in-flight fetch, starting one if none exists. The fetch
    /// runs as its own task so it completes (and fills the cache) even
    /// if every waiter goes away.
    fn join_flight(&self) -> FetchFuture {
        let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
        if let Some(flight) = inflight.as_ref() {
            return flight.clone();
        }

        let target = Arc::clone(&self.target);
        let cached = Arc::clone(&self.cached);
        let slot = Arc::clone(&self.inflight);
        let task = tokio::spawn(async move {
            let result = renew(target.as_ref()).await;
            if let Ok(token) = &result {
                *cached.write().expect("token cache lock poisoned") = Some(token.clone());
            }
            *slot.lock().expect("inflight lock poisoned") = None;
            result.map_err(Arc::new)
        });

        let flight: FetchFuture = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(Arc::new(anyhow!("token fetch task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        *inflight = Some(flight.clone());
        flight
    }
}

async fn renew(target: &dyn Target) -> Result<RegToken> {
    info!("fetching registration token");

    let payload = match target.get_registration_token().await {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "registration token fetch failed");
            return Err(err);
        }
    };

    info!(expires_at = %payload.expires_at, "registration token fetched");
    Ok(RegToken {
        value: payload.token,
        renew_at: payload.expires_at - ChronoDuration::minutes(RENEW_MARGIN_MINUTES),
    })
}
