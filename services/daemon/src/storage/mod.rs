//! Request repository on embedded SQLite.
//!
//! # Schema
//! - `sessions`: attribution contexts with an optional hashed auth token.
//! - `requests`: one row per proxied exchange; response columns start NULL
//!   and are filled by `update_request_response`.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=NORMAL, foreign_keys=ON.
//! `PRAGMA integrity_check` runs at open; on failure the daemon refuses to
//! start (a corrupt capture database is fatal).
//!
//! # Concurrency
//! One `Connection` owned by `Store`; the daemon shares it behind
//! `Arc<tokio::sync::Mutex<Store>>`. Writers serialize on the lock; the
//! insert-then-evict pair runs in a single transaction.

use procsi_protocol::filter::FilterError;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

mod query;

pub use query::{SearchHit, JsonHit};

const SCHEMA_SQL: &str = include_str!("schema.sql");

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),
    #[error("header serialization: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid filter: {0}")]
    Filter(#[from] FilterError),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub id: String,
    pub label: Option<String>,
    pub pid: Option<i64>,
    pub source: Option<String>,
    pub started_at: i64,
}

/// Fields written at intake. Response columns stay NULL until the upstream
/// (or mock) response lands.
#[derive(Debug, Clone, Default)]
pub struct NewRequest {
    pub session_id: String,
    pub label: Option<String>,
    pub source: Option<String>,
    pub timestamp: i64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_truncated: bool,
    pub content_type: Option<String>,
}

/// Fields written when a response (upstream, override, or mock) completes
/// the exchange. Last writer wins.
#[derive(Debug, Clone, Default)]
pub struct ResponseUpdate {
    pub status: i64,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_truncated: bool,
    pub content_type: Option<String>,
    pub duration_ms: i64,
}

/// Outcome of a successful `(session_id, token)` verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAuth {
    pub source: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
    max_stored_requests: i64,
}

impl Store {
    /// Open (or create) the repository at `path`.
    ///
    /// Applies PRAGMAs, runs the integrity check, and applies the schema.
    pub fn open(path: &Path, max_stored_requests: u64) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn, max_stored_requests)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(max_stored_requests: u64) -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, max_stored_requests)
    }

    fn init(conn: Connection, max_stored_requests: u64) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        let check: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if check != "ok" {
            return Err(StoreError::IntegrityCheckFailed(check));
        }
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn,
            max_stored_requests: max_stored_requests as i64,
        })
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Create a session and mint its auth token.
    ///
    /// The raw token is returned exactly once; only its SHA-256 lands in the
    /// database.
    pub fn register_session(
        &mut self,
        label: Option<&str>,
        pid: Option<i64>,
        source: Option<&str>,
    ) -> StoreResult<(SessionRow, String)> {
        let id = uuid::Uuid::new_v4().to_string();
        let token = mint_token();
        let token_hash = Sha256::digest(token.as_bytes()).to_vec();
        let started_at = now_ms();
        self.conn.execute(
            "INSERT INTO sessions (id, label, pid, source, started_at, auth_token_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, label, pid, source, started_at, token_hash],
        )?;
        Ok((
            SessionRow {
                id,
                label: label.map(str::to_owned),
                pid,
                source: source.map(str::to_owned),
                started_at,
            },
            token,
        ))
    }

    /// Create a session with a fixed id if it does not exist yet.
    ///
    /// Used for the daemon's default session; idempotent on `id`.
    pub fn ensure_session(
        &mut self,
        id: &str,
        label: Option<&str>,
        source: Option<&str>,
    ) -> StoreResult<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sessions (id, label, pid, source, started_at, auth_token_hash)
             VALUES (?1, ?2, NULL, ?3, ?4, NULL)",
            params![id, label, source, now_ms()],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> StoreResult<Option<SessionRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, label, pid, source, started_at FROM sessions WHERE id = ?1",
                params![id],
                map_session,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sessions(&self) -> StoreResult<Vec<SessionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, label, pid, source, started_at FROM sessions ORDER BY started_at ASC",
        )?;
        let rows = stmt.query_map([], map_session)?;
        let mut sessions = Vec::new();
        for r in rows {
            sessions.push(r?);
        }
        Ok(sessions)
    }

    /// Verify a `(session_id, token)` pair. Returns the session source only
    /// when the pair matches; a wrong token and an unknown id are
    /// indistinguishable to the caller.
    pub fn get_session_auth(&self, id: &str, token: &str) -> StoreResult<Option<SessionAuth>> {
        let row: Option<(Option<Vec<u8>>, Option<String>)> = self
            .conn
            .query_row(
                "SELECT auth_token_hash, source FROM sessions WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((Some(stored_hash), source)) = row else {
            return Ok(None);
        };
        let presented = Sha256::digest(token.as_bytes());
        if presented.as_slice() == stored_hash.as_slice() {
            Ok(Some(SessionAuth { source }))
        } else {
            Ok(None)
        }
    }

    pub fn session_count(&self) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?)
    }

    // -----------------------------------------------------------------------
    // Request mutations
    // -----------------------------------------------------------------------

    /// Insert an intake row and return its id.
    ///
    /// If the insert pushes the non-saved row count past the cap, the oldest
    /// non-saved rows are deleted in the same transaction. Saved rows are
    /// exempt and do not count toward the cap.
    pub fn save_request(&mut self, req: &NewRequest) -> StoreResult<i64> {
        let headers_json = serde_json::to_string(&req.headers)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO requests
                 (session_id, label, source, timestamp, method, url, host, path,
                  req_headers_json, req_body, req_body_truncated, req_content_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                req.session_id,
                req.label,
                req.source,
                req.timestamp,
                req.method,
                req.url,
                req.host,
                req.path,
                headers_json,
                req.body,
                req.body_truncated,
                req.content_type,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let unsaved: i64 =
            tx.query_row("SELECT COUNT(*) FROM requests WHERE saved = 0", [], |r| {
                r.get(0)
            })?;
        if unsaved > self.max_stored_requests {
            let excess = unsaved - self.max_stored_requests;
            tx.execute(
                "DELETE FROM requests
                 WHERE saved = 0
                   AND id IN (
                       SELECT id FROM requests
                       WHERE saved = 0
                       ORDER BY timestamp ASC, id ASC
                       LIMIT ?1
                   )",
                params![excess],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    /// Record the response side of an exchange. Last writer wins; an unknown
    /// id is a logged no-op (the row may have been evicted mid-flight).
    pub fn update_request_response(&mut self, id: i64, update: &ResponseUpdate) -> StoreResult<()> {
        let headers_json = serde_json::to_string(&update.headers)?;
        let changed = self.conn.execute(
            "UPDATE requests
             SET resp_status = ?2, resp_headers_json = ?3, resp_body = ?4,
                 resp_body_truncated = ?5, resp_content_type = ?6, duration_ms = ?7
             WHERE id = ?1",
            params![
                id,
                update.status,
                headers_json,
                update.body,
                update.body_truncated,
                update.content_type,
                update.duration_ms,
            ],
        )?;
        if changed == 0 {
            warn!(request_id = id, "response update for missing row");
        }
        Ok(())
    }

    /// Record interceptor metadata. Separate from the response update so a
    /// mock decision is visible even before any response columns exist.
    pub fn update_request_interception(
        &mut self,
        id: i64,
        name: &str,
        kind: procsi_protocol::InterceptionType,
    ) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE requests SET interception_name = ?2, interception_type = ?3 WHERE id = ?1",
            params![id, name, kind.as_str()],
        )?;
        if changed == 0 {
            warn!(request_id = id, "interception update for missing row");
        }
        Ok(())
    }

    pub fn update_request_replay(
        &mut self,
        id: i64,
        replayed_from_id: i64,
        initiator: &str,
    ) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE requests SET replayed_from_id = ?2, replay_initiator = ?3 WHERE id = ?1",
            params![id, replayed_from_id, initiator],
        )?;
        if changed == 0 {
            warn!(request_id = id, "replay update for missing row");
        }
        Ok(())
    }

    /// Set or clear the bookmark flag. Idempotent.
    pub fn set_request_saved(&mut self, id: i64, saved: bool) -> StoreResult<()> {
        let changed = self.conn.execute(
            "UPDATE requests SET saved = ?2 WHERE id = ?1",
            params![id, saved],
        )?;
        if changed == 0 {
            warn!(request_id = id, "bookmark update for missing row");
        }
        Ok(())
    }

    /// Delete all non-saved rows; sessions are retained.
    pub fn clear_requests(&mut self) -> StoreResult<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM requests WHERE saved = 0", [])?)
    }

    pub fn request_count(&self) -> StoreResult<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM requests", [], |r| r.get(0))?)
    }

    /// Newest row recorded as a replay of `original_id` at or after
    /// `since_ts`. The replay engine polls this to learn the id the proxy
    /// intake assigned.
    pub fn find_replay_of(&self, original_id: i64, since_ts: i64) -> StoreResult<Option<i64>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM requests
                 WHERE replayed_from_id = ?1 AND timestamp >= ?2
                 ORDER BY id DESC LIMIT 1",
                params![original_id, since_ts],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn map_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, rusqlite::Error> {
    Ok(SessionRow {
        id: row.get(0)?,
        label: row.get(1)?,
        pid: row.get(2)?,
        source: row.get(3)?,
        started_at: row.get(4)?,
    })
}

/// 32 hex chars from 16 random bytes.
fn mint_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
