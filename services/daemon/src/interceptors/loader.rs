//! Interceptor loader: keeps the current interceptor list in sync with the
//! definition directory.
//!
//! The directory is polled (mtime + size fingerprint) on the configured
//! interval; a change reloads every definition and atomically swaps the
//! list. Order is stable: definition files lexicographically by file name,
//! then natively registered handlers in registration order.

use super::definition;
use super::Interceptor;
use crate::events::{EventDraft, EventLog};
use procsi_protocol::{EventLevel, EventType};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

type InterceptorList = Arc<Vec<Arc<dyn Interceptor>>>;
type Fingerprint = Vec<(PathBuf, u64, u64)>;

pub struct InterceptorLoader {
    dir: PathBuf,
    events: Arc<EventLog>,
    current: RwLock<InterceptorList>,
    native: Mutex<Vec<Arc<dyn Interceptor>>>,
    fingerprint: Mutex<Fingerprint>,
    shutdown_tx: watch::Sender<bool>,
}

impl InterceptorLoader {
    /// Create the loader and perform the initial load. Call
    /// [`spawn_watcher`](Self::spawn_watcher) to start polling.
    pub fn new(dir: PathBuf, events: Arc<EventLog>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let loader = Arc::new(Self {
            dir,
            events,
            current: RwLock::new(Arc::new(Vec::new())),
            native: Mutex::new(Vec::new()),
            fingerprint: Mutex::new(Vec::new()),
            shutdown_tx,
        });
        loader.reload();
        loader
    }

    /// The current list. Cheap: clones an `Arc`.
    pub fn get_interceptors(&self) -> InterceptorList {
        self.current
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Register a handler built in code rather than loaded from disk.
    /// Natives evaluate after all directory definitions.
    pub fn register_native(&self, interceptor: Arc<dyn Interceptor>) {
        self.native
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(interceptor);
        self.reload();
    }

    /// Re-read the directory and swap the current list.
    pub fn reload(&self) {
        let fingerprint = scan_fingerprint(&self.dir);
        let mut list: Vec<Arc<dyn Interceptor>> = Vec::new();

        for (path, _, _) in &fingerprint {
            match std::fs::read_to_string(path) {
                Ok(text) => match definition::compile(path, &text) {
                    Ok(compiled) => {
                        self.events.append(EventDraft::new(
                            EventType::Loaded,
                            EventLevel::Info,
                            compiled.name(),
                            format!("loaded from {}", path.display()),
                        ));
                        list.push(Arc::new(compiled));
                    }
                    Err(e) => {
                        self.events.append(
                            EventDraft::new(
                                EventType::Loaded,
                                EventLevel::Error,
                                file_stem(path),
                                format!("failed to load {}", path.display()),
                            )
                            .with_error(e.to_string()),
                        );
                    }
                },
                Err(e) => {
                    self.events.append(
                        EventDraft::new(
                            EventType::Loaded,
                            EventLevel::Error,
                            file_stem(path),
                            format!("failed to read {}", path.display()),
                        )
                        .with_error(e.to_string()),
                    );
                }
            }
        }

        list.extend(
            self.native
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .cloned(),
        );

        debug!(count = list.len(), dir = %self.dir.display(), "interceptors loaded");
        *self
            .current
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(list);
        *self
            .fingerprint
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fingerprint;
    }

    /// Start the poll task. The task stops when [`close`](Self::close) is
    /// called; it never keeps the process alive on its own.
    pub fn spawn_watcher(self: &Arc<Self>, poll_interval: Duration) -> tokio::task::JoinHandle<()> {
        let loader = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        let on_disk = scan_fingerprint(&loader.dir);
                        let changed = {
                            let held = loader
                                .fingerprint
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            *held != on_disk
                        };
                        if changed {
                            debug!("interceptor directory changed, reloading");
                            loader.reload();
                        }
                    }
                }
            }
        })
    }

    /// Stop the watcher task.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// `(path, mtime_ms, len)` for every `.toml` in the directory, sorted by
/// path. A missing directory scans as empty.
fn scan_fingerprint(dir: &Path) -> Fingerprint {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            warn!(path = %path.display(), "unreadable interceptor file metadata");
            continue;
        };
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as u64);
        out.push((path, mtime_ms, meta.len()));
    }
    out.sort();
    out
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_owned()
}
