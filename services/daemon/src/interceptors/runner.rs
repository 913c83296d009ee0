//! Per-request interceptor dispatch.
//!
//! For each request at most one interceptor executes. The runner races the
//! handler against its `forward()` call under an overall deadline:
//!
//! - handler settles first  -> mock (validated) or passthrough
//! - `forward()` fires first -> pending entry; the decision completes at the
//!   response phase with the remaining deadline
//! - deadline fires first   -> `handler_timeout`, passthrough
//!
//! Every failure path emits exactly one structured event and the request
//! always proceeds; handler misbehaviour never reaches the wire.

use super::{
    ForwardError, ForwardHandle, ForwardResult, HandlerCtx, HandlerError, HandlerResponse,
    InterceptRequest, Interceptor, InterceptorLoader, SharedStore, UpstreamResponse,
};
use crate::events::{EventDraft, EventLog};
use procsi_protocol::{EventLevel, EventType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

pub const MATCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const HANDLER_DEADLINE: Duration = Duration::from_secs(30);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const SLOW_MATCH_THRESHOLD: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outcome of the request phase.
#[derive(Debug)]
pub enum RequestDecision {
    /// No interceptor claimed the request; proxy upstream untouched.
    Passthrough,
    /// Answer with this response; no upstream call is made.
    Mock {
        name: String,
        response: HandlerResponse,
    },
    /// `forward()` was requested; proceed upstream. Interception type is
    /// provisionally `modified` and may downgrade to `observed` later.
    Forward { name: String },
}

/// Outcome of the response phase.
#[derive(Debug)]
pub enum ResponseDecision {
    /// No pending handler (or it failed); emit the upstream response as-is.
    Passthrough,
    /// Handler saw the response and declined to change it.
    Observed { name: String },
    /// Handler replaced the upstream response.
    Override {
        name: String,
        response: HandlerResponse,
    },
}

// ---------------------------------------------------------------------------
// Pending state
// ---------------------------------------------------------------------------

struct PendingEntry {
    interceptor: String,
    request: Arc<InterceptRequest>,
    handler: JoinHandle<Result<Option<HandlerResponse>, HandlerError>>,
    response_tx: watch::Sender<Option<ForwardResult>>,
    completed: Arc<AtomicBool>,
    started: Instant,
}

pub struct InterceptorRunner {
    loader: Arc<InterceptorLoader>,
    events: Arc<EventLog>,
    store: SharedStore,
    pending: Arc<Mutex<HashMap<i64, PendingEntry>>>,
    match_timeout: Duration,
    handler_deadline: Duration,
    sweeper_shutdown: watch::Sender<bool>,
}

impl InterceptorRunner {
    pub fn new(loader: Arc<InterceptorLoader>, events: Arc<EventLog>, store: SharedStore) -> Self {
        Self::with_timeouts(loader, events, store, MATCH_TIMEOUT, HANDLER_DEADLINE)
    }

    /// Timeout-injectable constructor for tests.
    pub fn with_timeouts(
        loader: Arc<InterceptorLoader>,
        events: Arc<EventLog>,
        store: SharedStore,
        match_timeout: Duration,
        handler_deadline: Duration,
    ) -> Self {
        let (sweeper_shutdown, _) = watch::channel(false);
        Self {
            loader,
            events,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            match_timeout,
            handler_deadline,
            sweeper_shutdown,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    // -----------------------------------------------------------------------
    // Request phase
    // -----------------------------------------------------------------------

    pub async fn handle_request(&self, request: Arc<InterceptRequest>) -> RequestDecision {
        let Some(interceptor) = self.find_match(&request).await else {
            return RequestDecision::Passthrough;
        };
        let name = interceptor.name().to_owned();
        self.emit(
            EventDraft::new(
                EventType::Matched,
                EventLevel::Info,
                name.clone(),
                "matched",
            ),
            &request,
        );

        // Plumbing shared with the handler: the forward-requested signal, the
        // response slot, and the completion latch guarding late forwards.
        let (request_tx, mut request_rx) = oneshot::channel::<()>();
        let (response_tx, response_rx) = watch::channel::<Option<ForwardResult>>(None);
        let completed = Arc::new(AtomicBool::new(false));

        let forward = ForwardHandle::new(
            request_tx,
            response_rx,
            Arc::clone(&completed),
            self.late_forward_sink(&name, &request),
        );
        let ctx = HandlerCtx::new(
            Arc::clone(&request),
            forward,
            Arc::clone(&self.store),
            self.user_log_sink(&name, &request),
        );

        let mut handler = tokio::spawn(interceptor.handle(ctx));
        let started = Instant::now();
        let deadline = tokio::time::sleep(self.handler_deadline);
        tokio::pin!(deadline);

        // The signal sender drops with the handler's ctx, so the channel can
        // close without ever firing; keep waiting on the other arms then.
        let mut forward_closed = false;
        loop {
            tokio::select! {
                joined = &mut handler => {
                    completed.store(true, Ordering::SeqCst);
                    return self.mock_decision(&name, &request, flatten_join(joined));
                }
                signal = &mut request_rx, if !forward_closed => {
                    match signal {
                        Ok(()) => {
                            self.lock_pending().insert(request.id, PendingEntry {
                                interceptor: name.clone(),
                                request: Arc::clone(&request),
                                handler,
                                response_tx,
                                completed,
                                started,
                            });
                            return RequestDecision::Forward { name };
                        }
                        Err(_) => forward_closed = true,
                    }
                }
                () = &mut deadline => {
                    completed.store(true, Ordering::SeqCst);
                    self.emit(
                        EventDraft::new(
                            EventType::HandlerTimeout,
                            EventLevel::Warn,
                            name.clone(),
                            format!(
                                "handler did not settle within {}ms",
                                self.handler_deadline.as_millis()
                            ),
                        ),
                        &request,
                    );
                    return RequestDecision::Passthrough;
                }
            }
        }
    }

    /// First interceptor whose predicate accepts the request, with each
    /// predicate bounded by the match timeout.
    async fn find_match(&self, request: &Arc<InterceptRequest>) -> Option<Arc<dyn Interceptor>> {
        let interceptors = self.loader.get_interceptors();
        let evaluation_started = Instant::now();
        let mut matched = None;

        for interceptor in interceptors.iter() {
            match tokio::time::timeout(self.match_timeout, interceptor.matches(request)).await {
                Ok(Ok(true)) => {
                    matched = Some(Arc::clone(interceptor));
                    break;
                }
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    self.emit(
                        EventDraft::new(
                            EventType::MatchError,
                            EventLevel::Warn,
                            interceptor.name(),
                            "match predicate failed",
                        )
                        .with_error(e.to_string()),
                        request,
                    );
                }
                Err(_) => {
                    self.emit(
                        EventDraft::new(
                            EventType::MatchTimeout,
                            EventLevel::Warn,
                            interceptor.name(),
                            format!(
                                "match predicate exceeded {}ms",
                                self.match_timeout.as_millis()
                            ),
                        ),
                        request,
                    );
                }
            }
        }

        let elapsed = evaluation_started.elapsed();
        if elapsed > SLOW_MATCH_THRESHOLD {
            warn!(
                request_id = request.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow interceptor match evaluation"
            );
        }
        matched
    }

    fn mock_decision(
        &self,
        name: &str,
        request: &Arc<InterceptRequest>,
        joined: Result<Option<HandlerResponse>, HandlerError>,
    ) -> RequestDecision {
        match joined {
            Ok(Some(response)) => match response.validate() {
                Ok(()) => {
                    self.emit(
                        EventDraft::new(
                            EventType::Mocked,
                            EventLevel::Info,
                            name,
                            format!("mocked with status {}", response.status),
                        ),
                        request,
                    );
                    RequestDecision::Mock {
                        name: name.to_owned(),
                        response,
                    }
                }
                Err(reason) => {
                    self.emit(
                        EventDraft::new(
                            EventType::InvalidResponse,
                            EventLevel::Warn,
                            name,
                            "mock response rejected",
                        )
                        .with_error(reason),
                        request,
                    );
                    RequestDecision::Passthrough
                }
            },
            // A handler that settles with nothing and never forwards opted
            // out; the request proceeds as if unmatched.
            Ok(None) => RequestDecision::Passthrough,
            Err(e) => {
                self.emit(
                    EventDraft::new(
                        EventType::HandlerError,
                        EventLevel::Warn,
                        name,
                        "handler failed before forwarding",
                    )
                    .with_error(e.to_string()),
                    request,
                );
                RequestDecision::Passthrough
            }
        }
    }

    // -----------------------------------------------------------------------
    // Response phase
    // -----------------------------------------------------------------------

    pub async fn handle_response(
        &self,
        request_id: i64,
        upstream: Arc<UpstreamResponse>,
    ) -> ResponseDecision {
        let Some(entry) = self.lock_pending().remove(&request_id) else {
            return ResponseDecision::Passthrough;
        };
        let name = entry.interceptor.clone();
        let request = Arc::clone(&entry.request);

        let _ = entry.response_tx.send(Some(Ok(upstream)));
        let remaining = self
            .handler_deadline
            .saturating_sub(entry.started.elapsed());

        let mut handler = entry.handler;
        let joined = tokio::time::timeout(remaining, &mut handler).await;
        entry.completed.store(true, Ordering::SeqCst);

        match joined {
            Err(_) => {
                handler.abort();
                self.emit(
                    EventDraft::new(
                        EventType::HandlerTimeout,
                        EventLevel::Warn,
                        name,
                        "handler did not settle after the upstream response",
                    ),
                    &request,
                );
                ResponseDecision::Passthrough
            }
            Ok(joined) => match flatten_join(joined) {
                Ok(Some(response)) => match response.validate() {
                    Ok(()) => {
                        self.emit(
                            EventDraft::new(
                                EventType::Modified,
                                EventLevel::Info,
                                name.clone(),
                                format!("response overridden with status {}", response.status),
                            ),
                            &request,
                        );
                        ResponseDecision::Override { name, response }
                    }
                    Err(reason) => {
                        self.emit(
                            EventDraft::new(
                                EventType::InvalidResponse,
                                EventLevel::Warn,
                                name.clone(),
                                "override response rejected, passing upstream through",
                            )
                            .with_error(reason),
                            &request,
                        );
                        ResponseDecision::Observed { name }
                    }
                },
                Ok(None) => {
                    self.emit(
                        EventDraft::new(
                            EventType::Observed,
                            EventLevel::Info,
                            name.clone(),
                            "observed",
                        ),
                        &request,
                    );
                    ResponseDecision::Observed { name }
                }
                Err(e) => {
                    self.emit(
                        EventDraft::new(
                            EventType::HandlerError,
                            EventLevel::Warn,
                            name,
                            "handler failed after the upstream response",
                        )
                        .with_error(e.to_string()),
                        &request,
                    );
                    ResponseDecision::Passthrough
                }
            },
        }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Drop the pending entry for an aborted exchange; the handler's pending
    /// `forward()` rejects with an abort error.
    pub fn cleanup(&self, request_id: i64) {
        if let Some(entry) = self.lock_pending().remove(&request_id) {
            entry.completed.store(true, Ordering::SeqCst);
            let _ = entry.response_tx.send(Some(Err(ForwardError::Aborted)));
        }
    }

    /// Last-resort safety net: evict pending entries older than twice the
    /// handler deadline. Runs until [`stop_sweeper`](Self::stop_sweeper).
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        let mut shutdown_rx = self.sweeper_shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = ticker.tick() => runner.sweep_stale(),
                }
            }
        })
    }

    pub fn stop_sweeper(&self) {
        let _ = self.sweeper_shutdown.send(true);
    }

    fn sweep_stale(&self) {
        let stale_after = self.handler_deadline * 2;
        let stale: Vec<(i64, PendingEntry)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<i64> = pending
                .iter()
                .filter(|(_, e)| e.started.elapsed() > stale_after)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (id, entry) in stale {
            entry.completed.store(true, Ordering::SeqCst);
            let _ = entry.response_tx.send(Some(Err(ForwardError::Aborted)));
            entry.handler.abort();
            self.events.append(
                EventDraft::new(
                    EventType::HandlerTimeout,
                    EventLevel::Warn,
                    entry.interceptor,
                    "stale pending entry swept",
                )
                .with_request(id, entry.request.url.clone(), entry.request.method.clone()),
            );
        }
    }

    // -----------------------------------------------------------------------
    // Event plumbing
    // -----------------------------------------------------------------------

    fn emit(&self, draft: EventDraft, request: &InterceptRequest) {
        self.events.append(draft.with_request(
            request.id,
            request.url.clone(),
            request.method.clone(),
        ));
    }

    fn user_log_sink(
        &self,
        name: &str,
        request: &Arc<InterceptRequest>,
    ) -> Arc<dyn Fn(&str) + Send + Sync> {
        let events = Arc::clone(&self.events);
        let name = name.to_owned();
        let request = Arc::clone(request);
        Arc::new(move |message: &str| {
            events.append(
                EventDraft::new(EventType::UserLog, EventLevel::Info, name.clone(), message)
                    .with_request(request.id, request.url.clone(), request.method.clone()),
            );
        })
    }

    fn late_forward_sink(
        &self,
        name: &str,
        request: &Arc<InterceptRequest>,
    ) -> Arc<dyn Fn() + Send + Sync> {
        let events = Arc::clone(&self.events);
        let name = name.to_owned();
        let request = Arc::clone(request);
        Arc::new(move || {
            events.append(
                EventDraft::new(
                    EventType::ForwardAfterComplete,
                    EventLevel::Warn,
                    name.clone(),
                    "forward() called after the handler completed",
                )
                .with_request(request.id, request.url.clone(), request.method.clone()),
            );
        })
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<i64, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn flatten_join(
    joined: Result<Result<Option<HandlerResponse>, HandlerError>, tokio::task::JoinError>,
) -> Result<Option<HandlerResponse>, HandlerError> {
    match joined {
        Ok(result) => result,
        Err(join_err) => Err(HandlerError(format!("handler task failed: {join_err}"))),
    }
}
