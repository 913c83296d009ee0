// procsi-daemon: capture daemon for one project directory.
//
// Usage: procsi-daemon [project-dir]
//
// The supervisor (PID file, CA generation, log rotation) lives outside this
// binary; it expects `.procsi/ca.pem` and `.procsi/ca-key.pem` to exist and
// reads `.procsi/proxy.port` once the proxy is up.

use daemon::config::{DaemonConfig, ProjectPaths};
use daemon::Daemon;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() {
    let project_dir = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    let paths = ProjectPaths::new(&project_dir);

    if let Err(e) = paths.ensure() {
        eprintln!("FATAL: cannot create {}: {}", paths.root().display(), e);
        std::process::exit(1);
    }
    init_tracing(&paths);

    let config = match DaemonConfig::load(&paths.config_file()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "cannot read config.json");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        project = %project_dir.display(),
        "procsi daemon starting"
    );

    let daemon = match Daemon::start(&paths, config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "daemon failed to start");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    info!("shutting down");
    daemon.shutdown().await;
}

/// JSON lines to `.procsi/procsi.log`, human-readable filtered output on
/// stderr. `RUST_LOG` controls both.
fn init_tracing(paths: &ProjectPaths) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file());

    match file {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            tracing::warn!(error = %e, "log file unavailable, stderr only");
        }
    }
}
