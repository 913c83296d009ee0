//! Control server: newline-delimited JSON-RPC over a local Unix socket.
//!
//! Connections multiplex: every request line dispatches on its own task and
//! responses serialize back through a shared writer, so per-connection
//! ordering is not guaranteed. A line beyond the 1 MiB cap drops the
//! connection; everything else becomes a structured error response.

use futures_util::StreamExt;
use procsi_protocol::{error_codes, RpcRequest, RpcResponse};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

pub mod methods;

pub use methods::ControlContext;

pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("binding control socket {path}: {source}")]
    Bind {
        path: String,
        source: std::io::Error,
    },
}

pub struct ControlServer {
    path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ControlServer {
    /// Bind the socket (replacing a stale file from a dead daemon) and start
    /// accepting connections.
    pub fn bind(path: PathBuf, ctx: Arc<ControlContext>) -> Result<Self, ControlError> {
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = UnixListener::bind(&path).map_err(|source| ControlError::Bind {
            path: path.display().to_string(),
            source,
        })?;
        info!(path = %path.display(), "control socket listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                debug!("control client connected");
                                tokio::spawn(serve_connection(stream, Arc::clone(&ctx)));
                            }
                            Err(e) => warn!(error = %e, "control accept error"),
                        }
                    }
                }
            }
        });

        Ok(Self {
            path,
            shutdown_tx,
            accept_task,
        })
    }

    /// Stop accepting and remove the socket file. In-flight requests finish
    /// on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn serve_connection(stream: UnixStream, ctx: Arc<ControlContext>) {
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(
        read_half,
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    );
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let ctx = Arc::clone(&ctx);
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let response = handle_line(&ctx, &line).await;
                    write_response(&writer, &response).await;
                });
            }
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("control client exceeded the line cap, dropping connection");
                break;
            }
            Err(LinesCodecError::Io(e)) => {
                debug!(error = %e, "control connection read error");
                break;
            }
        }
    }
}

async fn handle_line(ctx: &ControlContext, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            // Best effort: echo the id back if the line at least had one.
            let id = serde_json::from_str::<serde_json::Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_str().map(str::to_owned)))
                .unwrap_or_default();
            return RpcResponse::err(
                id,
                error_codes::INVALID_REQUEST,
                format!("malformed request: {e}"),
            );
        }
    };

    let id = request.id.clone();
    match methods::dispatch(ctx, &request.method, request.params).await {
        Ok(result) => RpcResponse::ok(id, result),
        Err(error) => RpcResponse {
            id,
            result: None,
            error: Some(error),
        },
    }
}

async fn write_response(
    writer: &Arc<tokio::sync::Mutex<tokio::net::unix::OwnedWriteHalf>>,
    response: &RpcResponse,
) {
    let mut line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "failed to serialize control response");
            return;
        }
    };
    line.push('\n');
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        debug!(error = %e, "control connection write error");
    }
}
