//! The proxy data plane.
//!
//! [`ProxyPipeline`] implements intake, response, and abort over plain
//! daemon-owned types so the whole flow is testable without a socket; the
//! [`mitm`] module adapts it to the host MITM library's hooks.
//!
//! Storage failures inside the pipeline are logged and swallowed: the
//! proxied exchange always completes even when capture does not.

use crate::interceptors::{
    HandlerResponse, InterceptRequest, InterceptorRunner, RequestDecision, ResponseDecision,
    SharedStore, UpstreamResponse,
};
use crate::replay::ReplayTracker;
use crate::storage::{NewRequest, ResponseUpdate};
use procsi_protocol::{content_type, internal_headers, InterceptionType};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tracing::{debug, error, warn};

pub mod decode;
pub mod mitm;

use decode::{decode_body, flatten_headers, header_value, strip_headers};

// ---------------------------------------------------------------------------
// Adapter-facing types
// ---------------------------------------------------------------------------

/// A request as the MITM adapter hands it over: headers as received (possibly
/// duplicated names), body bytes still encoded, truncation already detected
/// when the body exceeded the capture cap.
#[derive(Debug, Clone, Default)]
pub struct RawRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_truncated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_truncated: bool,
}

/// What the adapter should do after intake.
#[derive(Debug)]
pub enum IntakeOutcome {
    /// Proceed upstream. `request_id` is `None` only when the capture row
    /// could not be written (the exchange still proxies).
    Forward { request_id: Option<i64> },
    /// Answer with this response; no upstream call.
    Mock {
        request_id: i64,
        response: HandlerResponse,
    },
}

/// What the adapter should emit downstream after the response phase.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// Emit the upstream response unchanged.
    Upstream,
    /// Emit this handler-supplied response instead.
    Override(HandlerResponse),
}

struct InflightEntry {
    request_id: i64,
    started: Instant,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct ProxyPipeline {
    store: SharedStore,
    runner: Option<Arc<InterceptorRunner>>,
    tracker: Option<Arc<ReplayTracker>>,
    default_session_id: String,
    max_body_size: usize,
    /// Positive `(session_id, token)` verifications only; tokens are
    /// immutable once issued so entries never need invalidation.
    auth_cache: Mutex<HashMap<(String, String), Option<String>>>,
    inflight: Mutex<HashMap<u64, InflightEntry>>,
}

impl ProxyPipeline {
    pub fn new(
        store: SharedStore,
        default_session_id: String,
        runner: Option<Arc<InterceptorRunner>>,
        tracker: Option<Arc<ReplayTracker>>,
        max_body_size: usize,
    ) -> Self {
        Self {
            store,
            runner,
            tracker,
            default_session_id,
            max_body_size,
            auth_cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Number of exchanges between intake and response.
    pub fn inflight_len(&self) -> usize {
        self.lock_inflight().len()
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    pub async fn before_request(&self, correlation: u64, raw: RawRequest) -> IntakeOutcome {
        let timestamp = crate::storage::now_ms();
        let started = Instant::now();

        let mut headers = flatten_headers(&raw.headers);
        let (host, path) = split_url(&raw.url, &headers);

        let content_length: Option<u64> =
            header_value(&headers, "content-length").and_then(|v| v.parse().ok());
        let body_truncated =
            raw.body_truncated || (raw.body.is_empty() && content_length.is_some_and(|l| l > 0));

        // Stored bodies are decoded, so the stored headers lose their
        // content-encoding; the wire bytes keep theirs.
        let encoding = header_value(&headers, "content-encoding").map(str::to_owned);
        let body = if body_truncated || raw.body.is_empty() {
            None
        } else {
            Some(decode_body(encoding.as_deref(), &raw.body))
        };

        let internal = strip_headers(&mut headers, &internal_headers::ALL);
        strip_headers(&mut headers, &["content-encoding"]);

        let session_header = lookup(&internal, internal_headers::SESSION_ID);
        let token_header = lookup(&internal, internal_headers::SESSION_TOKEN);
        let runtime_source = lookup(&internal, internal_headers::RUNTIME_SOURCE);
        let replay_token = lookup(&internal, internal_headers::REPLAY_TOKEN);

        let (session_id, source) = self
            .resolve_attribution(session_header, token_header, runtime_source)
            .await;

        let req_content_type = header_value(&headers, "content-type")
            .map(content_type::essence);

        let new_request = NewRequest {
            session_id,
            label: None,
            source,
            timestamp,
            method: raw.method.clone(),
            url: raw.url.clone(),
            host: host.clone(),
            path: path.clone(),
            headers: headers.clone(),
            body: body.clone(),
            body_truncated,
            content_type: req_content_type,
        };

        let request_id = match self.store.lock().await.save_request(&new_request) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, url = %raw.url, "failed to persist request intake");
                return IntakeOutcome::Forward { request_id: None };
            }
        };

        if let (Some(tracker), Some(token)) = (&self.tracker, replay_token) {
            if let Some(origin) = tracker.consume(&token) {
                if let Err(e) = self.store.lock().await.update_request_replay(
                    request_id,
                    origin.replayed_from_id,
                    &origin.initiator,
                ) {
                    warn!(error = %e, request_id, "failed to persist replay attribution");
                }
            } else {
                warn!(request_id, "unknown or already-consumed replay token");
            }
        }

        if let Some(runner) = &self.runner {
            let frozen = Arc::new(InterceptRequest {
                id: request_id,
                method: raw.method,
                url: raw.url,
                host,
                path,
                headers: headers.clone(),
                body: body.clone(),
            });
            match runner.handle_request(frozen).await {
                RequestDecision::Mock { name, response } => {
                    self.persist_interception(request_id, &name, InterceptionType::Mocked)
                        .await;
                    self.persist_response(
                        request_id,
                        handler_response_update(&response, elapsed_ms(started)),
                    )
                    .await;
                    return IntakeOutcome::Mock {
                        request_id,
                        response,
                    };
                }
                RequestDecision::Forward { name } => {
                    // Provisional: may downgrade to observed at response time.
                    self.persist_interception(request_id, &name, InterceptionType::Modified)
                        .await;
                }
                RequestDecision::Passthrough => {}
            }
        }

        self.lock_inflight().insert(
            correlation,
            InflightEntry {
                request_id,
                started,
            },
        );
        IntakeOutcome::Forward {
            request_id: Some(request_id),
        }
    }

    // -----------------------------------------------------------------------
    // Response
    // -----------------------------------------------------------------------

    pub async fn before_response(&self, correlation: u64, raw: RawResponse) -> ResponseOutcome {
        let Some(entry) = self.lock_inflight().remove(&correlation) else {
            debug!(correlation, "response for unknown exchange");
            return ResponseOutcome::Upstream;
        };
        let duration_ms = elapsed_ms(entry.started);

        let mut headers = flatten_headers(&raw.headers);
        let content_length: Option<u64> =
            header_value(&headers, "content-length").and_then(|v| v.parse().ok());
        let body_truncated =
            raw.body_truncated || (raw.body.is_empty() && content_length.is_some_and(|l| l > 0));

        let encoding = header_value(&headers, "content-encoding").map(str::to_owned);
        let body = if body_truncated || raw.body.is_empty() {
            None
        } else {
            Some(decode_body(encoding.as_deref(), &raw.body))
        };
        strip_headers(&mut headers, &["content-encoding"]);

        let resp_content_type = header_value(&headers, "content-type")
            .map(content_type::essence);

        let upstream_update = ResponseUpdate {
            status: i64::from(raw.status),
            headers: headers.clone(),
            body: body.clone(),
            body_truncated,
            content_type: resp_content_type,
            duration_ms,
        };

        let decision = match &self.runner {
            Some(runner) => {
                let view = Arc::new(UpstreamResponse {
                    status: raw.status,
                    headers,
                    body: body.unwrap_or_default(),
                    body_truncated,
                });
                runner.handle_response(entry.request_id, view).await
            }
            None => ResponseDecision::Passthrough,
        };

        match decision {
            ResponseDecision::Override { name, response } => {
                self.persist_interception(entry.request_id, &name, InterceptionType::Modified)
                    .await;
                self.persist_response(
                    entry.request_id,
                    handler_response_update(&response, duration_ms),
                )
                .await;
                ResponseOutcome::Override(response)
            }
            ResponseDecision::Observed { name } => {
                self.persist_interception(entry.request_id, &name, InterceptionType::Observed)
                    .await;
                self.persist_response(entry.request_id, upstream_update).await;
                ResponseOutcome::Upstream
            }
            ResponseDecision::Passthrough => {
                self.persist_response(entry.request_id, upstream_update).await;
                ResponseOutcome::Upstream
            }
        }
    }

    // -----------------------------------------------------------------------
    // Abort
    // -----------------------------------------------------------------------

    /// The client went away (or the upstream failed) before a response.
    /// The row stays with NULL response columns, marking an aborted exchange.
    pub async fn abort(&self, correlation: u64) {
        let entry = self.lock_inflight().remove(&correlation);
        if let (Some(entry), Some(runner)) = (entry, &self.runner) {
            runner.cleanup(entry.request_id);
        }
    }

    // -----------------------------------------------------------------------
    // Attribution
    // -----------------------------------------------------------------------

    async fn resolve_attribution(
        &self,
        session_id: Option<String>,
        token: Option<String>,
        runtime_source: Option<String>,
    ) -> (String, Option<String>) {
        let (Some(id), Some(token)) = (session_id, token) else {
            return (self.default_session_id.clone(), None);
        };

        let cache_key = (id.clone(), token.clone());
        let cached = self
            .auth_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&cache_key)
            .cloned();

        let session_source = match cached {
            Some(source) => Some(source),
            None => match self.store.lock().await.get_session_auth(&id, &token) {
                Ok(Some(auth)) => {
                    self.auth_cache
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(cache_key, auth.source.clone());
                    Some(auth.source)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, session_id = %id, "session auth lookup failed");
                    None
                }
            },
        };

        match session_source {
            Some(source) => {
                let source = match runtime_source.filter(|s| valid_runtime_source(s)) {
                    Some(runtime) => Some(runtime),
                    None => source,
                };
                (id, source)
            }
            None => {
                warn!(
                    session_id = %id,
                    "session attribution rejected, falling back to default session"
                );
                (self.default_session_id.clone(), None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence helpers (log-and-continue)
    // -----------------------------------------------------------------------

    async fn persist_interception(&self, request_id: i64, name: &str, kind: InterceptionType) {
        if let Err(e) = self
            .store
            .lock()
            .await
            .update_request_interception(request_id, name, kind)
        {
            warn!(error = %e, request_id, "failed to persist interception metadata");
        }
    }

    async fn persist_response(&self, request_id: i64, update: ResponseUpdate) {
        if let Err(e) = self
            .store
            .lock()
            .await
            .update_request_response(request_id, &update)
        {
            warn!(error = %e, request_id, "failed to persist response");
        }
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<u64, InflightEntry>> {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn lookup(pairs: &[(String, String)], name: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

fn handler_response_update(response: &HandlerResponse, duration_ms: i64) -> ResponseUpdate {
    ResponseUpdate {
        status: i64::from(response.status),
        headers: response.headers.clone(),
        body: response.body.clone(),
        body_truncated: false,
        content_type: header_value(&response.headers, "content-type")
            .map(content_type::essence),
        duration_ms,
    }
}

/// `^[a-z0-9._-]{1,32}$`
fn valid_runtime_source(source: &str) -> bool {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| regex::Regex::new(r"^[a-z0-9._-]{1,32}$").expect("static pattern"))
        .is_match(source)
}

fn split_url(url: &str, headers: &[(String, String)]) -> (String, String) {
    match reqwest::Url::parse(url) {
        Ok(parsed) => {
            let host = parsed
                .host_str()
                .map(str::to_owned)
                .or_else(|| header_value(headers, "host").map(str::to_owned))
                .unwrap_or_default();
            (host, parsed.path().to_owned())
        }
        Err(_) => {
            let host = header_value(headers, "host").unwrap_or_default().to_owned();
            (host, url.to_owned())
        }
    }
}
