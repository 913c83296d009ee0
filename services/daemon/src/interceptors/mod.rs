//! Interceptor model: the handler contract, the `forward()` capability, and
//! the request/response views handlers see.
//!
//! At most one interceptor runs per request. A handler either answers
//! immediately (mock), calls `forward()` and replaces the upstream response
//! (modify), or calls `forward()` and returns nothing (observe). Handler
//! misbehaviour is contained by the runner; nothing a handler does can stall
//! the wire.

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

pub mod definition;
pub mod loader;
pub mod runner;

pub use loader::InterceptorLoader;
pub use runner::{InterceptorRunner, RequestDecision, ResponseDecision};

/// Shared handle to the repository, as handlers and the control plane see it.
pub type SharedStore = Arc<tokio::sync::Mutex<crate::storage::Store>>;

// ---------------------------------------------------------------------------
// Request / response views
// ---------------------------------------------------------------------------

/// Frozen view of an intercepted request. Body bytes are copied at intake,
/// so later proxy-side mutation cannot change what a handler observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptRequest {
    pub id: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    /// As received, duplicates already joined with `", "`.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl InterceptRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The decoded upstream response a `forward()` call resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_truncated: bool,
}

/// A response produced by a handler, either as a mock or as an override.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HandlerResponse {
    /// The contract a handler-supplied response must satisfy before the
    /// proxy will emit it.
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=599).contains(&self.status) {
            return Err(format!("status {} outside 100..=599", self.status));
        }
        for (name, _) in &self.headers {
            if name.is_empty() || name.contains(|c: char| c.is_whitespace()) {
                return Err(format!("invalid header name {name:?}"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handler contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<ForwardError> for HandlerError {
    fn from(e: ForwardError) -> Self {
        HandlerError(e.to_string())
    }
}

/// Everything a handler gets: the frozen request, the `forward()` capability,
/// a structured log sink, and read access to the repository.
pub struct HandlerCtx {
    pub request: Arc<InterceptRequest>,
    pub forward: ForwardHandle,
    pub store: SharedStore,
    log: Arc<dyn Fn(&str) + Send + Sync>,
}

impl HandlerCtx {
    pub(crate) fn new(
        request: Arc<InterceptRequest>,
        forward: ForwardHandle,
        store: SharedStore,
        log: Arc<dyn Fn(&str) + Send + Sync>,
    ) -> Self {
        Self {
            request,
            forward,
            store,
            log,
        }
    }

    /// Emit a `user_log` event attributed to this interceptor and request.
    pub fn log(&self, message: &str) {
        (self.log)(message);
    }
}

/// One loaded interceptor. Directory definitions and natively registered
/// handlers both come through this trait; evaluation order is the loader's.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    fn source_file(&self) -> &str;

    /// `mock`, `modify`, `observe`, or `native`.
    fn action_kind(&self) -> &'static str;

    /// Match predicate. A missing predicate reports `Ok(true)`. The runner
    /// bounds each call with its own timeout.
    fn matches<'a>(&'a self, request: &'a InterceptRequest)
        -> BoxFuture<'a, Result<bool, HandlerError>>;

    /// The handler body. Resolving with `Some` before `forward()` mocks;
    /// after `forward()` it overrides; `None` after `forward()` observes.
    fn handle(&self, ctx: HandlerCtx) -> BoxFuture<'static, Result<Option<HandlerResponse>, HandlerError>>;
}

// ---------------------------------------------------------------------------
// The forward() capability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForwardError {
    /// The client went away before the upstream answered.
    #[error("request aborted before the upstream response arrived")]
    Aborted,
    /// `forward()` was called after the handler was marked complete.
    #[error("forward() called after the handler completed")]
    AfterComplete,
    /// The runner went away without delivering a response.
    #[error("forward channel closed")]
    Closed,
}

pub(crate) type ForwardResult = Result<Arc<UpstreamResponse>, ForwardError>;

/// The callable `forward()` token handed to a handler.
///
/// The first call signals the runner to let the request proceed upstream and
/// waits for the decoded response; repeated calls wait on the same shared
/// response. Calls after the handler is marked complete fail.
#[derive(Clone)]
pub struct ForwardHandle {
    inner: Arc<ForwardShared>,
}

struct ForwardShared {
    requested: Mutex<Option<oneshot::Sender<()>>>,
    response_rx: watch::Receiver<Option<ForwardResult>>,
    completed: Arc<AtomicBool>,
    on_late_call: Arc<dyn Fn() + Send + Sync>,
}

impl ForwardHandle {
    pub(crate) fn new(
        requested: oneshot::Sender<()>,
        response_rx: watch::Receiver<Option<ForwardResult>>,
        completed: Arc<AtomicBool>,
        on_late_call: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(ForwardShared {
                requested: Mutex::new(Some(requested)),
                response_rx,
                completed,
                on_late_call,
            }),
        }
    }

    /// Let the upstream request proceed and resolve with its decoded
    /// response. Idempotent; see the type docs.
    pub async fn forward(&self) -> ForwardResult {
        if self.inner.completed.load(Ordering::SeqCst) {
            (self.inner.on_late_call)();
            return Err(ForwardError::AfterComplete);
        }

        // First caller fires the signal; later callers just wait.
        let sender = self
            .inner
            .requested
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(());
        }

        let mut rx = self.inner.response_rx.clone();
        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ForwardError::Closed)?;
        settled.clone().unwrap_or(Err(ForwardError::Closed))
    }
}
