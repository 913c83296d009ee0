//! Shared test helpers: a scripted upstream HTTP stub that records what it
//! received, and a minimal control-socket client.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use procsi_protocol::{RpcRequest, RpcResponse};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixStream};

// ---------------------------------------------------------------------------
// Upstream stub
// ---------------------------------------------------------------------------

/// One request as the stub upstream received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct StubState {
    received: Arc<Mutex<Vec<RecordedRequest>>>,
    status: u16,
    content_type: String,
    body: Vec<u8>,
}

/// A loopback HTTP server answering every path with one scripted response
/// and recording everything it receives.
pub struct UpstreamStub {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl UpstreamStub {
    /// Start a stub answering `200 {"ok":true}`.
    pub async fn start() -> Self {
        Self::with_response(200, "application/json", br#"{"ok":true}"#).await
    }

    pub async fn with_response(status: u16, content_type: &str, body: &[u8]) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let state = StubState {
            received: Arc::clone(&received),
            status,
            content_type: content_type.to_owned(),
            body: body.to_vec(),
        };

        let app = Router::new().fallback(record).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, received }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Snapshot of everything received so far.
    pub fn received(&self) -> Vec<RecordedRequest> {
        self.received
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

async fn record(
    State(state): State<StubState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let recorded = RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_owned(),
        headers: headers
            .iter()
            .map(|(n, v)| {
                (
                    n.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: body.to_vec(),
    };
    state
        .received
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .push(recorded);

    (
        StatusCode::from_u16(state.status).unwrap_or(StatusCode::OK),
        [("content-type", state.content_type.clone())],
        state.body.clone(),
    )
}

// ---------------------------------------------------------------------------
// Control-socket client
// ---------------------------------------------------------------------------

/// Serial control client: one request, one response. Good enough for tests;
/// the server itself supports interleaving.
pub struct ControlClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
    next_id: u64,
}

impl ControlClient {
    pub async fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_id: 1,
        })
    }

    pub async fn call(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> std::io::Result<RpcResponse> {
        let id = format!("t{}", self.next_id);
        self.next_id += 1;
        let request = RpcRequest {
            id,
            method: method.to_owned(),
            params,
        };
        let mut line = serde_json::to_string(&request).expect("serialize request");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut response_line = String::new();
        self.reader.read_line(&mut response_line).await?;
        Ok(serde_json::from_str(&response_line).expect("parse response"))
    }

    /// Send a raw line (protocol-violation tests).
    pub async fn send_raw(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await
    }

    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        Ok((n > 0).then_some(line))
    }
}
