//! Pipeline-level capture semantics: passthrough, attribution, replay
//! stamping, truncation, and decode-on-store. These drive the pipeline
//! directly so every assertion is deterministic.

use daemon::events::EventLog;
use daemon::interceptors::{InterceptorLoader, InterceptorRunner, SharedStore};
use daemon::proxy::{IntakeOutcome, ProxyPipeline, RawRequest, RawResponse, ResponseOutcome};
use daemon::replay::ReplayTracker;
use daemon::storage::Store;
use procsi_protocol::internal_headers;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const MAX_BODY: usize = 1024;

struct Harness {
    store: SharedStore,
    tracker: Arc<ReplayTracker>,
    pipeline: Arc<ProxyPipeline>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open_in_memory(100).unwrap();
    store.ensure_session("default", Some("procsi"), Some("proxy")).unwrap();
    let store: SharedStore = Arc::new(tokio::sync::Mutex::new(store));

    let events = Arc::new(EventLog::default());
    let loader = InterceptorLoader::new(dir.path().to_path_buf(), Arc::clone(&events));
    let runner = Arc::new(InterceptorRunner::with_timeouts(
        loader,
        events,
        Arc::clone(&store),
        Duration::from_millis(200),
        Duration::from_millis(500),
    ));
    let tracker = Arc::new(ReplayTracker::new());
    let pipeline = Arc::new(ProxyPipeline::new(
        Arc::clone(&store),
        "default".to_owned(),
        Some(runner),
        Some(Arc::clone(&tracker)),
        MAX_BODY,
    ));

    Harness {
        store,
        tracker,
        pipeline,
        _dir: dir,
    }
}

fn get_request(method: &str, url: &str) -> RawRequest {
    RawRequest {
        method: method.to_owned(),
        url: url.to_owned(),
        headers: vec![("accept".to_owned(), "*/*".to_owned())],
        body: Vec::new(),
        body_truncated: false,
    }
}

fn json_response(status: u16, body: &[u8]) -> RawResponse {
    RawResponse {
        status,
        headers: vec![("content-type".to_owned(), "application/json".to_owned())],
        body: body.to_vec(),
        body_truncated: false,
    }
}

async fn intake_id(h: &Harness, correlation: u64, raw: RawRequest) -> i64 {
    match h.pipeline.before_request(correlation, raw).await {
        IntakeOutcome::Forward { request_id } => request_id.expect("row persisted"),
        IntakeOutcome::Mock { .. } => panic!("unexpected mock"),
    }
}

#[tokio::test]
async fn passthrough_round_trip_persists_the_exchange() {
    let h = harness();
    let id = intake_id(
        &h,
        1,
        get_request("GET", "http://127.0.0.1:9000/api/users"),
    )
    .await;

    // In flight: response columns still NULL.
    {
        let store = h.store.lock().await;
        let row = store.get_request(id).unwrap().unwrap();
        assert!(row.response_status.is_none());
        assert_eq!(row.method, "GET");
        assert_eq!(row.host, "127.0.0.1");
        assert_eq!(row.path, "/api/users");
    }

    let outcome = h
        .pipeline
        .before_response(1, json_response(200, br#"{"ok":true}"#))
        .await;
    assert!(matches!(outcome, ResponseOutcome::Upstream));

    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert_eq!(row.response_status, Some(200));
    assert_eq!(
        row.response_body.as_ref().map(|b| b.as_bytes().to_vec()),
        Some(br#"{"ok":true}"#.to_vec())
    );
    assert!(row.interception.is_none());
    assert_eq!(row.session_id, "default");
    assert!(row.duration_ms.is_some());
}

#[tokio::test]
async fn attribution_with_valid_pair_and_runtime_source() {
    let h = harness();
    let (session, token) = h
        .store
        .lock()
        .await
        .register_session(Some("client"), Some(4242), Some("cli"))
        .unwrap();

    let mut raw = get_request("GET", "http://api.test/whoami");
    raw.headers.push((internal_headers::SESSION_ID.to_owned(), session.id.clone()));
    raw.headers.push((internal_headers::SESSION_TOKEN.to_owned(), token.clone()));
    raw.headers.push((internal_headers::RUNTIME_SOURCE.to_owned(), "node".to_owned()));
    raw.headers.push((internal_headers::LEGACY.to_owned(), "ignored".to_owned()));

    let id = intake_id(&h, 1, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert_eq!(row.session_id, session.id);
    assert_eq!(row.source.as_deref(), Some("node"));
    // None of the internal headers survive into the stored request.
    for name in internal_headers::ALL {
        assert!(
            !row.request_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)),
            "stored headers leak {name}"
        );
    }
}

#[tokio::test]
async fn attribution_with_wrong_token_falls_back_to_default() {
    let h = harness();
    let (session, _token) = h
        .store
        .lock()
        .await
        .register_session(None, None, Some("cli"))
        .unwrap();

    let mut raw = get_request("GET", "http://api.test/whoami");
    raw.headers.push((internal_headers::SESSION_ID.to_owned(), session.id.clone()));
    raw.headers.push((
        internal_headers::SESSION_TOKEN.to_owned(),
        "00000000000000000000000000000000".to_owned(),
    ));

    let id = intake_id(&h, 1, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert_eq!(row.session_id, "default");
    assert!(row.source.is_none());
}

#[tokio::test]
async fn invalid_runtime_source_is_ignored() {
    let h = harness();
    let (session, token) = h
        .store
        .lock()
        .await
        .register_session(None, None, Some("cli"))
        .unwrap();

    let mut raw = get_request("GET", "http://api.test/x");
    raw.headers.push((internal_headers::SESSION_ID.to_owned(), session.id.clone()));
    raw.headers.push((internal_headers::SESSION_TOKEN.to_owned(), token));
    raw.headers.push((internal_headers::RUNTIME_SOURCE.to_owned(), "Not Valid!".to_owned()));

    let id = intake_id(&h, 1, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    // Falls back to the session's own source.
    assert_eq!(row.source.as_deref(), Some("cli"));
}

#[tokio::test]
async fn replay_token_stamps_the_new_row_once() {
    let h = harness();
    let original = intake_id(&h, 1, get_request("GET", "http://api.test/orig")).await;

    let token = h.tracker.issue(original, "tui");
    let mut raw = get_request("GET", "http://api.test/orig");
    raw.headers.push((internal_headers::REPLAY_TOKEN.to_owned(), token.clone()));
    let replayed = intake_id(&h, 2, raw).await;

    {
        let store = h.store.lock().await;
        let row = store.get_request(replayed).unwrap().unwrap();
        assert_eq!(row.replayed_from_id, Some(original));
        assert_eq!(row.replay_initiator.as_deref(), Some("tui"));
    }

    // The token is single-use: a second presentation stamps nothing.
    let mut raw = get_request("GET", "http://api.test/orig");
    raw.headers.push((internal_headers::REPLAY_TOKEN.to_owned(), token));
    let second = intake_id(&h, 3, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(second).unwrap().unwrap();
    assert!(row.replayed_from_id.is_none());
}

#[tokio::test]
async fn truncated_bodies_keep_headers_but_not_bytes() {
    let h = harness();
    let mut raw = get_request("POST", "http://api.test/upload");
    raw.headers.push(("content-length".to_owned(), "5000000".to_owned()));
    raw.body = Vec::new();
    raw.body_truncated = true;

    let id = intake_id(&h, 1, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert!(row.request_body.is_none());
    assert!(row.request_body_truncated);
    assert_eq!(
        row.request_headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map(|(_, v)| v.as_str()),
        Some("5000000")
    );
}

#[tokio::test]
async fn empty_body_with_content_length_marks_truncation() {
    let h = harness();
    let mut raw = get_request("POST", "http://api.test/upload");
    raw.headers.push(("content-length".to_owned(), "42".to_owned()));

    let id = intake_id(&h, 1, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert!(row.request_body_truncated);
}

#[tokio::test]
async fn gzip_responses_store_decoded_without_content_encoding() {
    let h = harness();
    let id = intake_id(&h, 1, get_request("GET", "http://api.test/data")).await;

    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(br#"{"compressed":true}"#).unwrap();
    let gz = enc.finish().unwrap();

    let raw = RawResponse {
        status: 200,
        headers: vec![
            ("content-type".to_owned(), "application/json".to_owned()),
            ("content-encoding".to_owned(), "gzip".to_owned()),
        ],
        body: gz,
        body_truncated: false,
    };
    let outcome = h.pipeline.before_response(1, raw).await;
    assert!(matches!(outcome, ResponseOutcome::Upstream));

    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert_eq!(
        row.response_body.as_ref().map(|b| b.as_bytes().to_vec()),
        Some(br#"{"compressed":true}"#.to_vec())
    );
    let resp_headers = row.response_headers.unwrap();
    assert!(!resp_headers.iter().any(|(n, _)| n == "content-encoding"));
}

#[tokio::test]
async fn duplicate_headers_flatten_joined() {
    let h = harness();
    let mut raw = get_request("GET", "http://api.test/cookies");
    raw.headers.push(("x-tag".to_owned(), "one".to_owned()));
    raw.headers.push(("X-Tag".to_owned(), "two".to_owned()));

    let id = intake_id(&h, 1, raw).await;
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    let tag = row
        .request_headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("x-tag"))
        .map(|(_, v)| v.clone());
    assert_eq!(tag.as_deref(), Some("one, two"));
}

#[tokio::test]
async fn abort_drops_the_inflight_entry() {
    let h = harness();
    let id = intake_id(&h, 1, get_request("GET", "http://api.test/hang")).await;
    assert_eq!(h.pipeline.inflight_len(), 1);

    h.pipeline.abort(1).await;
    assert_eq!(h.pipeline.inflight_len(), 0);

    // The row stays with NULL response columns: an aborted exchange.
    let store = h.store.lock().await;
    let row = store.get_request(id).unwrap().unwrap();
    assert!(row.response_status.is_none());
}
