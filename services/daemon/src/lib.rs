//! procsi daemon: a project-scoped HTTP/HTTPS interception toolkit.
//!
//! The daemon runs a local MITM proxy, captures every exchange (decoded
//! bodies included) into an embedded SQLite store, dispatches user
//! interceptors that can mock, modify, or observe traffic, and serves a
//! JSON-RPC control socket for the front-ends. See each module for the
//! component contracts.

pub mod config;
pub mod control;
pub mod events;
pub mod interceptors;
pub mod proxy;
pub mod replay;
pub mod storage;

use crate::config::{DaemonConfig, ProjectPaths};
use crate::control::{ControlContext, ControlServer};
use crate::events::EventLog;
use crate::interceptors::{InterceptorLoader, InterceptorRunner, SharedStore};
use crate::proxy::mitm::MitmError;
use crate::proxy::ProxyPipeline;
use crate::replay::{ReplayEngine, ReplayTracker};
use crate::storage::Store;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("project directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository: {0}")]
    Store(#[from] storage::StoreError),
    #[error("mitm proxy: {0}")]
    Mitm(#[from] MitmError),
    #[error("control server: {0}")]
    Control(#[from] control::ControlError),
}

/// The assembled daemon. Construction order follows the dependency graph
/// (leaves first); shutdown reverses it.
pub struct Daemon {
    pub store: SharedStore,
    pub events: Arc<EventLog>,
    pub loader: Arc<InterceptorLoader>,
    pub runner: Arc<InterceptorRunner>,
    pub tracker: Arc<ReplayTracker>,
    pub pipeline: Arc<ProxyPipeline>,
    pub replay: Arc<ReplayEngine>,
    control: ControlServer,
    proxy_shutdown: watch::Sender<bool>,
    proxy_task: tokio::task::JoinHandle<()>,
    watcher_task: tokio::task::JoinHandle<()>,
    sweeper_task: tokio::task::JoinHandle<()>,
    proxy_port: u16,
}

impl Daemon {
    pub async fn start(paths: &ProjectPaths, config: DaemonConfig) -> Result<Self, DaemonError> {
        paths.ensure()?;

        let mut store = Store::open(&paths.requests_db(), config.max_stored_requests)?;
        store.ensure_session(DEFAULT_SESSION_ID, Some("procsi"), Some("proxy"))?;
        let store: SharedStore = Arc::new(tokio::sync::Mutex::new(store));

        let events = Arc::new(EventLog::default());
        let loader = InterceptorLoader::new(paths.interceptors_dir(), Arc::clone(&events));
        let watcher_task =
            loader.spawn_watcher(Duration::from_millis(config.poll_interval_ms));

        let runner = Arc::new(InterceptorRunner::new(
            Arc::clone(&loader),
            Arc::clone(&events),
            Arc::clone(&store),
        ));
        let sweeper_task = runner.spawn_sweeper(interceptors::runner::SWEEP_INTERVAL);

        let tracker = Arc::new(ReplayTracker::new());
        let pipeline = Arc::new(ProxyPipeline::new(
            Arc::clone(&store),
            DEFAULT_SESSION_ID.to_owned(),
            Some(Arc::clone(&runner)),
            Some(Arc::clone(&tracker)),
            config.max_body_size as usize,
        ));

        let proxy_port = free_loopback_port()?;
        let addr: SocketAddr = ([127, 0, 0, 1], proxy_port).into();
        let (proxy_shutdown, proxy_shutdown_rx) = watch::channel(false);
        let proxy_task = proxy::mitm::start_proxy(
            addr,
            &paths.ca_cert(),
            &paths.ca_key(),
            Arc::clone(&pipeline),
            proxy_shutdown_rx,
        )
        .await?;
        std::fs::write(paths.proxy_port_file(), proxy_port.to_string())?;

        let replay = Arc::new(ReplayEngine::new(
            Arc::clone(&store),
            Arc::clone(&tracker),
            proxy_port,
        ));

        let control = ControlServer::bind(
            paths.control_socket(),
            Arc::new(ControlContext {
                store: Arc::clone(&store),
                events: Arc::clone(&events),
                loader: Arc::clone(&loader),
                replay: Some(Arc::clone(&replay)),
                proxy_port,
                default_session_id: DEFAULT_SESSION_ID.to_owned(),
            }),
        )?;

        info!(proxy_port, "daemon started");
        Ok(Self {
            store,
            events,
            loader,
            runner,
            tracker,
            pipeline,
            replay,
            control,
            proxy_shutdown,
            proxy_task,
            watcher_task,
            sweeper_task,
            proxy_port,
        })
    }

    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// Ordered shutdown: refuse new control connections, stop the proxy,
    /// then the background tasks. Storage closes when the last Arc drops.
    pub async fn shutdown(self) {
        self.control.shutdown().await;

        let _ = self.proxy_shutdown.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.proxy_task).await;

        self.loader.close();
        self.runner.stop_sweeper();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.watcher_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), self.sweeper_task).await;
        info!("daemon stopped");
    }
}

/// Pick a free loopback port by binding and releasing it. The proxy binds
/// the same port immediately after.
fn free_loopback_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
