//! Daemon-originated replay of a captured request.
//!
//! The engine loads the original row, applies overrides, mints a one-shot
//! token, and issues the new request through the local proxy with the token
//! in the internal replay header. The proxy's intake then attributes the new
//! row via the token; the engine waits only for that registration, never for
//! the response (callers poll separately).

use crate::interceptors::SharedStore;
use crate::replay::ReplayTracker;
use base64::Engine as _;
use procsi_protocol::{internal_headers, ReplayRequestParams};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_POLL: Duration = Duration::from_millis(25);
const REGISTRATION_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_INITIATOR: &str = "replay-cli";

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("request {0} not found")]
    NotFound(i64),
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
    #[error("bodyBase64 is not valid base64")]
    InvalidBase64,
    #[error("body and bodyBase64 are mutually exclusive")]
    ConflictingBodies,
    #[error("http client: {0}")]
    Client(String),
    #[error("replay did not register at the proxy in time")]
    NotRegistered,
}

pub struct ReplayEngine {
    store: SharedStore,
    tracker: Arc<ReplayTracker>,
    proxy_port: u16,
}

impl ReplayEngine {
    pub fn new(store: SharedStore, tracker: Arc<ReplayTracker>, proxy_port: u16) -> Self {
        Self {
            store,
            tracker,
            proxy_port,
        }
    }

    /// Re-issue request `params.id` through the proxy. Resolves with the new
    /// row id once the intake path has registered it.
    pub async fn replay_request(&self, params: ReplayRequestParams) -> Result<i64, ReplayError> {
        let original = self
            .store
            .lock()
            .await
            .get_request(params.id)
            .map_err(|e| ReplayError::Client(e.to_string()))?
            .ok_or(ReplayError::NotFound(params.id))?;

        let method = params.method.as_deref().unwrap_or(&original.method);
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ReplayError::InvalidMethod(method.to_owned()))?;
        let url = params.url.as_deref().unwrap_or(&original.url);
        let url = reqwest::Url::parse(url).map_err(|_| ReplayError::InvalidUrl(url.to_owned()))?;

        // Header overrides: removals first, then sets (replace-or-append).
        let mut headers = original.request_headers.clone();
        if let Some(removals) = &params.remove_headers {
            headers.retain(|(name, _)| !removals.iter().any(|r| r.eq_ignore_ascii_case(name)));
        }
        if let Some(sets) = &params.set_headers {
            for (name, value) in sets {
                match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                    Some(slot) => slot.1 = value.clone(),
                    None => headers.push((name.clone(), value.clone())),
                }
            }
        }
        // The stored body is decoded and the replayed one is sent plain.
        headers.retain(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("content-encoding")
        });

        let body: Option<Vec<u8>> = match (&params.body, &params.body_base64) {
            (Some(_), Some(_)) => return Err(ReplayError::ConflictingBodies),
            (Some(text), None) => Some(text.clone().into_bytes()),
            (None, Some(b64)) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64.as_bytes())
                    .map_err(|_| ReplayError::InvalidBase64)?,
            ),
            (None, None) => original.request_body.as_ref().map(|b| b.as_bytes().to_vec()),
        };

        let initiator = params
            .initiator
            .clone()
            .unwrap_or_else(|| DEFAULT_INITIATOR.to_owned());
        let token = self.tracker.issue(params.id, &initiator);

        let timeout = params
            .timeout_ms
            .map_or(DEFAULT_TIMEOUT, Duration::from_millis)
            .max(DEFAULT_TIMEOUT);
        let client = reqwest::Client::builder()
            .proxy(
                reqwest::Proxy::all(format!("http://127.0.0.1:{}", self.proxy_port))
                    .map_err(|e| ReplayError::Client(e.to_string()))?,
            )
            // The leaf is signed by the project MITM CA, not a public root.
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| ReplayError::Client(e.to_string()))?;

        let mut builder = client.request(method, url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.header(internal_headers::REPLAY_TOKEN, &token);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let original_id = params.id;
        let registered_after = crate::storage::now_ms();
        tokio::spawn(async move {
            match builder.send().await {
                Ok(response) => {
                    debug!(original_id, status = response.status().as_u16(), "replay completed");
                }
                Err(e) => {
                    warn!(original_id, error = %e, "replay request failed");
                }
            }
        });

        self.await_registration(original_id, registered_after).await
    }

    /// Poll until the intake path has written the replayed row.
    async fn await_registration(&self, original_id: i64, since_ts: i64) -> Result<i64, ReplayError> {
        let deadline = tokio::time::Instant::now() + REGISTRATION_WINDOW;
        loop {
            let found = self
                .store
                .lock()
                .await
                .find_replay_of(original_id, since_ts)
                .map_err(|e| ReplayError::Client(e.to_string()))?;
            if let Some(id) = found {
                return Ok(id);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ReplayError::NotRegistered);
            }
            tokio::time::sleep(REGISTRATION_POLL).await;
        }
    }
}
