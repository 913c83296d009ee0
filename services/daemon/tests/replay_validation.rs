//! Replay engine validation paths: everything that must fail synchronously
//! before any request leaves the daemon.

use daemon::interceptors::SharedStore;
use daemon::replay::{ReplayEngine, ReplayError, ReplayTracker};
use daemon::storage::{NewRequest, Store};
use procsi_protocol::ReplayRequestParams;
use std::sync::Arc;

fn engine() -> (ReplayEngine, SharedStore) {
    let mut store = Store::open_in_memory(100).unwrap();
    store.ensure_session("default", None, None).unwrap();
    let store: SharedStore = Arc::new(tokio::sync::Mutex::new(store));
    let tracker = Arc::new(ReplayTracker::new());
    // Port 1 is never contacted by these tests.
    let engine = ReplayEngine::new(Arc::clone(&store), tracker, 1);
    (engine, store)
}

async fn seed(store: &SharedStore) -> i64 {
    store
        .lock()
        .await
        .save_request(&NewRequest {
            session_id: "default".to_owned(),
            timestamp: 1,
            method: "POST".to_owned(),
            url: "http://seed.test/api".to_owned(),
            host: "seed.test".to_owned(),
            path: "/api".to_owned(),
            headers: vec![("content-type".to_owned(), "application/json".to_owned())],
            body: Some(br#"{"n":1}"#.to_vec()),
            ..NewRequest::default()
        })
        .unwrap()
}

fn params(id: i64) -> ReplayRequestParams {
    ReplayRequestParams {
        id,
        method: None,
        url: None,
        set_headers: None,
        remove_headers: None,
        body: None,
        body_base64: None,
        timeout_ms: None,
        initiator: None,
    }
}

#[tokio::test]
async fn missing_row_is_reported() {
    let (engine, _store) = engine();
    assert!(matches!(
        engine.replay_request(params(999)).await,
        Err(ReplayError::NotFound(999))
    ));
}

#[tokio::test]
async fn conflicting_body_overrides_are_rejected() {
    let (engine, store) = engine();
    let id = seed(&store).await;
    let mut p = params(id);
    p.body = Some("text".to_owned());
    p.body_base64 = Some("dGV4dA==".to_owned());
    assert!(matches!(
        engine.replay_request(p).await,
        Err(ReplayError::ConflictingBodies)
    ));
}

#[tokio::test]
async fn invalid_base64_is_rejected() {
    let (engine, store) = engine();
    let id = seed(&store).await;
    let mut p = params(id);
    p.body_base64 = Some("%%% not base64 %%%".to_owned());
    assert!(matches!(
        engine.replay_request(p).await,
        Err(ReplayError::InvalidBase64)
    ));
}

#[tokio::test]
async fn invalid_method_is_rejected() {
    let (engine, store) = engine();
    let id = seed(&store).await;
    let mut p = params(id);
    p.method = Some("NOT A METHOD".to_owned());
    assert!(matches!(
        engine.replay_request(p).await,
        Err(ReplayError::InvalidMethod(_))
    ));
}

#[tokio::test]
async fn invalid_url_is_rejected() {
    let (engine, store) = engine();
    let id = seed(&store).await;
    let mut p = params(id);
    p.url = Some("::not a url::".to_owned());
    assert!(matches!(
        engine.replay_request(p).await,
        Err(ReplayError::InvalidUrl(_))
    ));
}
