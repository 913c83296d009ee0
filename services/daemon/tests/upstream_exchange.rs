//! Full exchange against a real upstream socket: intake through the
//! pipeline, an actual HTTP round trip to a recording stub (standing in for
//! the MITM adapter's upstream leg), and response finalization. Asserts the
//! wire invariant: no internal attribution header ever reaches upstream.

use daemon::events::EventLog;
use daemon::interceptors::{InterceptorLoader, InterceptorRunner, SharedStore};
use daemon::proxy::{IntakeOutcome, ProxyPipeline, RawRequest, RawResponse, ResponseOutcome};
use daemon::storage::Store;
use procsi_protocol::internal_headers;
use procsi_test_utils::UpstreamStub;
use std::sync::Arc;
use std::time::Duration;

fn pipeline() -> (Arc<ProxyPipeline>, SharedStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open_in_memory(100).unwrap();
    store.ensure_session("default", None, None).unwrap();
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
    let pipeline = Arc::new(ProxyPipeline::new(
        Arc::clone(&store),
        "default".to_owned(),
        Some(runner),
        None,
        1024 * 1024,
    ));
    (pipeline, store, dir)
}

#[tokio::test]
async fn passthrough_exchange_against_live_upstream() {
    let stub = UpstreamStub::start().await;
    let (pipeline, store, _dir) = pipeline();

    // Intake carries attribution headers the way a client process would.
    let raw = RawRequest {
        method: "GET".to_owned(),
        url: stub.url("/api/users"),
        headers: vec![
            ("accept".to_owned(), "*/*".to_owned()),
            (internal_headers::SESSION_ID.to_owned(), "nope".to_owned()),
            (internal_headers::SESSION_TOKEN.to_owned(), "nope".to_owned()),
            (internal_headers::LEGACY.to_owned(), "v0".to_owned()),
        ],
        body: Vec::new(),
        body_truncated: false,
    };
    let request_id = match pipeline.before_request(1, raw).await {
        IntakeOutcome::Forward { request_id } => request_id.unwrap(),
        IntakeOutcome::Mock { .. } => panic!("no interceptors loaded"),
    };

    // The upstream leg, as the adapter performs it: the stored (stripped)
    // header view is what gets forwarded.
    let stored = store
        .lock()
        .await
        .get_request(request_id)
        .unwrap()
        .unwrap();
    let client = reqwest::Client::new();
    let mut upstream_request = client.get(stub.url("/api/users"));
    for (name, value) in &stored.request_headers {
        if !name.eq_ignore_ascii_case("host") {
            upstream_request = upstream_request.header(name.as_str(), value.as_str());
        }
    }
    let upstream = upstream_request.send().await.expect("upstream round trip");
    let status = upstream.status().as_u16();
    let headers: Vec<(String, String)> = upstream
        .headers()
        .iter()
        .map(|(n, v)| {
            (
                n.as_str().to_owned(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = upstream.bytes().await.unwrap().to_vec();

    let outcome = pipeline
        .before_response(
            1,
            RawResponse {
                status,
                headers,
                body,
                body_truncated: false,
            },
        )
        .await;
    assert!(matches!(outcome, ResponseOutcome::Upstream));

    // The stub saw exactly one request, with none of the internal names.
    let received = stub.received();
    assert_eq!(received.len(), 1);
    for name in internal_headers::ALL {
        assert!(
            received[0].header(name).is_none(),
            "upstream received {name}"
        );
    }

    let row = store
        .lock()
        .await
        .get_request(request_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.response_status, Some(200));
    assert_eq!(
        row.response_body.as_ref().map(|b| b.as_bytes().to_vec()),
        Some(br#"{"ok":true}"#.to_vec())
    );
    assert!(row.interception.is_none());
}
