//! Contract golden tests: deserialize representative control-socket payloads,
//! serialize back, and verify round-trip fidelity against the frozen shapes.

use procsi_protocol::{
    Body, EventLevel, EventType, GetInterceptorEventsParams, InterceptionType,
    InterceptorEventRecord, ListRequestsParams, RegisterSessionResult, ReplayRequestParams,
    RequestRecord, RpcRequest, RpcResponse,
};

/// Deserialize `json` into `T`, serialize back, and assert the JSON values
/// are identical. Returns the typed value for field inspection.
fn round_trip<T>(json: &str) -> T
where
    T: serde::de::DeserializeOwned + serde::Serialize,
{
    let value: T = serde_json::from_str(json).unwrap_or_else(|e| panic!("deserialize: {e}"));
    let serialized = serde_json::to_string(&value).unwrap();
    let original: serde_json::Value = serde_json::from_str(json).unwrap();
    let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, roundtripped, "round-trip mismatch");
    value
}

#[test]
fn rpc_request_round_trip() {
    let req: RpcRequest = round_trip(
        r#"{"id":"7f3a","method":"listRequestsSummary","params":{"filter":{"statusRange":"2xx"},"limit":50}}"#,
    );
    assert_eq!(req.method, "listRequestsSummary");
    let params: ListRequestsParams = serde_json::from_value(req.params.unwrap()).unwrap();
    assert_eq!(params.limit, Some(50));
    assert_eq!(params.filter.status_range.as_deref(), Some("2xx"));
}

#[test]
fn rpc_error_response_round_trip() {
    let resp: RpcResponse =
        round_trip(r#"{"id":"7f3a","error":{"code":-32601,"message":"unknown method"}}"#);
    assert_eq!(resp.error.unwrap().code, -32601);
    assert!(resp.result.is_none());
}

#[test]
fn register_session_result_round_trip() {
    let result: RegisterSessionResult = round_trip(
        r#"{"id":"b2f6c1d0-9c1e-4f31-9c50-1f9be3b2a111","authToken":"9f8e7d6c5b4a39281716051403f2e1d0"}"#,
    );
    assert_eq!(result.auth_token.len(), 32);
}

#[test]
fn request_record_with_buffer_bodies_round_trip() {
    let record: RequestRecord = round_trip(
        r#"{
            "id": 42,
            "sessionId": "b2f6c1d0-9c1e-4f31-9c50-1f9be3b2a111",
            "timestamp": 1754006400123,
            "method": "POST",
            "url": "https://api.example.com/v1/users",
            "host": "api.example.com",
            "path": "/v1/users",
            "requestHeaders": [["content-type", "application/json"], ["accept", "*/*"]],
            "requestBody": {"type": "Buffer", "data": [123, 125]},
            "requestBodyTruncated": false,
            "responseStatus": 201,
            "responseHeaders": [["content-type", "application/json"]],
            "responseBody": {"type": "Buffer", "data": [123, 34, 111, 107, 34, 58, 116, 114, 117, 101, 125]},
            "responseBodyTruncated": false,
            "durationMs": 38,
            "interception": {"name": "tag-users", "type": "modified"},
            "saved": false
        }"#,
    );
    assert_eq!(record.request_body.as_ref().unwrap().as_bytes(), b"{}");
    assert_eq!(
        record.response_body.as_ref().unwrap().as_bytes(),
        br#"{"ok":true}"#
    );
    assert_eq!(
        record.interception.as_ref().unwrap().kind,
        InterceptionType::Modified
    );
}

#[test]
fn interceptor_event_round_trip() {
    let event: InterceptorEventRecord = round_trip(
        r#"{
            "seq": 17,
            "timestamp": 1754006401000,
            "type": "handler_timeout",
            "level": "warn",
            "interceptor": "slow-mock",
            "message": "handler did not settle within 30000ms",
            "requestId": 42,
            "requestUrl": "https://api.example.com/v1/users",
            "requestMethod": "POST"
        }"#,
    );
    assert_eq!(event.kind, EventType::HandlerTimeout);
    assert_eq!(event.level, EventLevel::Warn);
    assert_eq!(event.request_id, Some(42));
}

#[test]
fn replay_params_accept_base64_body() {
    let params: ReplayRequestParams = round_trip(
        r#"{"id":42,"setHeaders":[["x-debug","1"]],"removeHeaders":["authorization"],"bodyBase64":"e30=","timeoutMs":15000}"#,
    );
    assert_eq!(params.id, 42);
    assert_eq!(params.timeout_ms, Some(15000));
    assert!(params.body.is_none());
}

#[test]
fn event_query_params_default_empty() {
    let params: GetInterceptorEventsParams = round_trip(r#"{}"#);
    assert!(params.after_seq.is_none());
    assert!(params.kind.is_none());
}

#[test]
fn body_survives_full_byte_range() {
    let body = Body((0u8..=255).collect());
    let json = serde_json::to_string(&body).unwrap();
    let back: Body = serde_json::from_str(&json).unwrap();
    assert_eq!(back, body);
}
