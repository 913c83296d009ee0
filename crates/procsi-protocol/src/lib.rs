// procsi-protocol: control-socket wire types and shared data model.
//
// Every message on the control socket is one newline-delimited JSON object.
// Requests carry a caller-chosen `id` echoed back on the matching response;
// responses for one connection may arrive in any order.

use serde::de::Error as DeError;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod content_type;
pub mod filter;

pub use filter::{FilterError, RequestFilter, StatusFilter};

// ---------------------------------------------------------------------------
// RPC envelope
// ---------------------------------------------------------------------------

/// A single control-socket request.
///
/// `id` is opaque to the daemon; it is echoed verbatim on the response so a
/// client can multiplex many in-flight calls over one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A single control-socket response. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Frozen error codes for control-socket failures.
pub mod error_codes {
    /// The line was not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown `method`.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// `params` failed validation for the method.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Uncaught internal failure; `message` carries a one-line summary.
    pub const INTERNAL: i64 = -32000;
}

/// Control method names. Names are contracts; clients dispatch on them.
pub mod methods {
    pub const PING: &str = "ping";
    pub const STATUS: &str = "status";
    pub const REGISTER_SESSION: &str = "registerSession";
    pub const LIST_SESSIONS: &str = "listSessions";
    pub const LIST_REQUESTS: &str = "listRequests";
    pub const LIST_REQUESTS_SUMMARY: &str = "listRequestsSummary";
    pub const GET_REQUEST: &str = "getRequest";
    pub const COUNT_REQUESTS: &str = "countRequests";
    pub const SEARCH_BODIES: &str = "searchBodies";
    pub const QUERY_JSON_BODIES: &str = "queryJsonBodies";
    pub const CLEAR_REQUESTS: &str = "clearRequests";
    pub const REPLAY_REQUEST: &str = "replayRequest";
    pub const SAVE_REQUEST: &str = "saveRequest";
    pub const UNSAVE_REQUEST: &str = "unsaveRequest";
    pub const LIST_INTERCEPTORS: &str = "listInterceptors";
    pub const RELOAD_INTERCEPTORS: &str = "reloadInterceptors";
    pub const GET_INTERCEPTOR_EVENTS: &str = "getInterceptorEvents";
    pub const CLEAR_INTERCEPTOR_EVENTS: &str = "clearInterceptorEvents";
}

// ---------------------------------------------------------------------------
// Binary body encoding
// ---------------------------------------------------------------------------

/// Captured body bytes as they cross the control socket.
///
/// Bodies are not text; they serialize as `{"type":"Buffer","data":[..]}` so
/// a client can reconstitute the exact bytes. The empty body serializes the
/// same way with an empty `data` array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body(pub Vec<u8>);

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body(bytes)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body(s.as_bytes().to_vec())
    }
}

impl Serialize for Body {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Body", 2)?;
        st.serialize_field("type", "Buffer")?;
        st.serialize_field("data", &self.0)?;
        st.end()
    }
}

impl<'de> Deserialize<'de> for Body {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(rename = "type")]
            kind: String,
            data: Vec<u8>,
        }
        let raw = Raw::deserialize(deserializer)?;
        if raw.kind != "Buffer" {
            return Err(D::Error::custom(format!(
                "expected type \"Buffer\", got {:?}",
                raw.kind
            )));
        }
        Ok(Body(raw.data))
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// An attribution context for requests proxied by one client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    /// Free-form attribution string, e.g. a runtime name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Epoch milliseconds.
    pub started_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterSessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The `(id, auth_token)` pair is the capability a client presents via the
/// internal attribution headers. The token is returned exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSessionResult {
    pub id: String,
    pub auth_token: String,
}

// ---------------------------------------------------------------------------
// Captured requests
// ---------------------------------------------------------------------------

/// How an interceptor disposed of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptionType {
    /// The handler answered before any upstream call was made.
    Mocked,
    /// `forward()` was called and the handler replaced the upstream response.
    Modified,
    /// `forward()` was called and the handler returned nothing.
    Observed,
}

impl InterceptionType {
    pub fn as_str(self) -> &'static str {
        match self {
            InterceptionType::Mocked => "mocked",
            InterceptionType::Modified => "modified",
            InterceptionType::Observed => "observed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mocked" => Some(Self::Mocked),
            "modified" => Some(Self::Modified),
            "observed" => Some(Self::Observed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptionInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InterceptionType,
}

/// List-view projection of a captured request. Never carries bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    pub id: i64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Epoch milliseconds at intake.
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interception: Option<InterceptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_from_id: Option<i64>,
    pub saved: bool,
}

/// Full captured request, bodies included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: i64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    /// Header names as received; duplicate values joined with `", "`.
    pub request_headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<Body>,
    pub request_body_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<Body>,
    pub response_body_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interception: Option<InterceptionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed_from_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_initiator: Option<String>,
    pub saved: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListRequestsParams {
    #[serde(default)]
    pub filter: RequestFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdParams {
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountRequestsParams {
    #[serde(default)]
    pub filter: RequestFilter,
}

// ---------------------------------------------------------------------------
// Body search / JSON query
// ---------------------------------------------------------------------------

/// Which side of the exchange a body predicate inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyTarget {
    Request,
    Response,
    #[default]
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchBodiesParams {
    /// Case-sensitive substring matched against text-classified bodies.
    pub query: String,
    #[serde(default)]
    pub target: BodyTarget,
    #[serde(default)]
    pub filter: RequestFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchBodiesMatch {
    pub request: RequestSummary,
    /// `request` or `response`, whichever body matched first.
    pub matched_in: String,
    /// A short excerpt around the first match.
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJsonBodiesParams {
    /// Dotted object path with numeric array indices, e.g. `user.roles.0`.
    /// A leading `$.` is accepted and stripped.
    pub json_path: String,
    /// Optional equality filter applied to the extracted value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub target: BodyTarget,
    #[serde(default)]
    pub filter: RequestFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryJsonBodiesMatch {
    pub request: RequestSummary,
    pub matched_in: String,
    /// The value extracted at `json_path`.
    pub extracted: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Interceptor events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

/// Structured runtime events emitted by the interceptor subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Loaded,
    Matched,
    Mocked,
    Modified,
    Observed,
    HandlerTimeout,
    HandlerError,
    MatchTimeout,
    MatchError,
    InvalidResponse,
    ForwardAfterComplete,
    UserLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorEventRecord {
    /// Monotonic per-process sequence, starting at 1. Never reset, even by
    /// `clearInterceptorEvents`: pollers using `afterSeq` observe a gap,
    /// not a repeat.
    pub seq: u64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub level: EventLevel,
    pub interceptor: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
}

/// Total events currently buffered, per level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub info: u64,
    pub warn: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetInterceptorEventsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<EventLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interceptor: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<EventType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptorEventsResult {
    pub events: Vec<InterceptorEventRecord>,
    pub counts: EventCounts,
}

/// One loaded interceptor as reported by `listInterceptors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorInfo {
    pub name: String,
    pub source_file: String,
    /// `mock`, `modify`, `observe`, or `native`.
    pub action: String,
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequestParams {
    /// Row id of the request to re-issue.
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Headers set (or overwritten) on the replayed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_headers: Option<Vec<(String, String)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_headers: Option<Vec<String>>,
    /// UTF-8 body override. Mutually exclusive with `bodyBase64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Attribution recorded on the new row; defaults to `replay-cli`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequestResult {
    pub request_id: i64,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub version: String,
    pub proxy_port: u16,
    pub request_count: i64,
    pub session_count: i64,
    pub interceptor_count: usize,
    pub default_session_id: String,
}

// ---------------------------------------------------------------------------
// Internal attribution headers
// ---------------------------------------------------------------------------

/// Headers stripped at the proxy and never forwarded upstream.
pub mod internal_headers {
    pub const SESSION_ID: &str = "x-procsi-internal-session-id";
    pub const SESSION_TOKEN: &str = "x-procsi-internal-session-token";
    pub const RUNTIME_SOURCE: &str = "x-procsi-internal-runtime-source";
    pub const REPLAY_TOKEN: &str = "x-procsi-internal-replay-token";
    /// Legacy combined form. Accepted-then-dropped, never trusted.
    pub const LEGACY: &str = "x-procsi-internal";

    pub const ALL: [&str; 5] = [SESSION_ID, SESSION_TOKEN, RUNTIME_SOURCE, REPLAY_TOKEN, LEGACY];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_serializes_as_buffer_object() {
        let body = Body(vec![0, 159, 255]);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "Buffer", "data": [0, 159, 255]})
        );
    }

    #[test]
    fn body_round_trips_bytes_losslessly() {
        let original = Body((0u8..=255).collect());
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: Body = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn body_rejects_wrong_type_tag() {
        let result: Result<Body, _> =
            serde_json::from_str(r#"{"type":"Blob","data":[1,2]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn rpc_response_serializes_only_one_arm() {
        let ok = RpcResponse::ok("a1", serde_json::json!({"pong": true}));
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("result"));
        assert!(!json.contains("error"));

        let err = RpcResponse::err("a2", error_codes::METHOD_NOT_FOUND, "no such method");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("error"));
        assert!(!json.contains("result"));
    }

    #[test]
    fn interception_type_round_trips_through_str() {
        for t in [
            InterceptionType::Mocked,
            InterceptionType::Modified,
            InterceptionType::Observed,
        ] {
            assert_eq!(InterceptionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(InterceptionType::parse("mutated"), None);
    }

    #[test]
    fn event_type_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&EventType::ForwardAfterComplete).unwrap();
        assert_eq!(json, "\"forward_after_complete\"");
        let back: EventType = serde_json::from_str("\"handler_timeout\"").unwrap();
        assert_eq!(back, EventType::HandlerTimeout);
    }

    #[test]
    fn list_params_default_to_empty_filter() {
        let params: ListRequestsParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.filter, RequestFilter::default());
        assert!(params.limit.is_none());
    }
}
