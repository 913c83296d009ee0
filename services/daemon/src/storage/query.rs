//! Read-side of the repository: filter translation, list/count, body search,
//! and JSON-path extraction.
//!
//! The filter splits into a SQL product (everything SQLite can index or scan
//! cheaply) and Rust-side predicates (URL regex, header name/value) applied
//! while iterating rows newest-first. Paging offsets count rows that passed
//! *all* predicates, so results are stable for a fixed dataset.

use super::{Store, StoreError, StoreResult};
use procsi_protocol::content_type;
use procsi_protocol::filter::{FilterError, HeaderTarget, RequestFilter};
use procsi_protocol::{
    Body, BodyTarget, InterceptionInfo, InterceptionType, RequestRecord, RequestSummary,
};
use rusqlite::types::Value as SqlValue;

const DEFAULT_LIST_LIMIT: u32 = 100;
const DEFAULT_SEARCH_LIMIT: u32 = 50;

const REQUEST_COLUMNS: &str = "id, session_id, label, source, timestamp, method, url, host, path, \
     req_headers_json, req_body, req_body_truncated, req_content_type, \
     resp_status, resp_headers_json, resp_body, resp_body_truncated, resp_content_type, \
     duration_ms, interception_name, interception_type, replayed_from_id, replay_initiator, saved";

/// A body-search hit: the summary plus where and what matched.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub summary: RequestSummary,
    pub matched_in: &'static str,
    pub excerpt: String,
}

/// A JSON-path hit: the summary plus the extracted value.
#[derive(Debug, Clone)]
pub struct JsonHit {
    pub summary: RequestSummary,
    pub matched_in: &'static str,
    pub extracted: serde_json::Value,
}

impl Store {
    // -----------------------------------------------------------------------
    // Point reads
    // -----------------------------------------------------------------------

    pub fn get_request(&self, id: i64) -> StoreResult<Option<RequestRecord>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM requests WHERE id = ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_map(rusqlite::params![id], map_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // List / count
    // -----------------------------------------------------------------------

    pub fn list_requests(
        &self,
        filter: &RequestFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> StoreResult<Vec<RequestRecord>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT) as usize;
        let offset = offset.unwrap_or(0) as usize;
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        self.scan_filtered(
            filter,
            |record| {
                out.push(record.clone());
                out.len() < limit
            },
            offset,
        )?;
        Ok(out)
    }

    pub fn list_requests_summary(
        &self,
        filter: &RequestFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> StoreResult<Vec<RequestSummary>> {
        Ok(self
            .list_requests(filter, limit, offset)?
            .into_iter()
            .map(|r| summarize(&r))
            .collect())
    }

    pub fn count_requests(&self, filter: &RequestFilter) -> StoreResult<i64> {
        filter.validate()?;
        let post = PostPredicates::compile(filter)?;
        let (clauses, params) = sql_clauses(filter)?;

        // Pure-SQL filters count without materializing rows.
        if post.is_empty() {
            let sql = format!("SELECT COUNT(*) FROM requests{}", where_sql(&clauses));
            let count =
                self.conn
                    .query_row(&sql, rusqlite::params_from_iter(params.iter()), |r| {
                        r.get(0)
                    })?;
            return Ok(count);
        }

        let mut count = 0i64;
        self.scan_filtered(
            filter,
            |_| {
                count += 1;
                true
            },
            0,
        )?;
        Ok(count)
    }

    // -----------------------------------------------------------------------
    // Body search
    // -----------------------------------------------------------------------

    /// Substring search over text-classified bodies, newest first.
    pub fn search_bodies(
        &self,
        query: &str,
        target: BodyTarget,
        filter: &RequestFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> StoreResult<Vec<SearchHit>> {
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT) as usize;
        let mut skip = offset.unwrap_or(0) as usize;
        let mut hits = Vec::new();
        if limit == 0 {
            return Ok(hits);
        }

        self.scan_filtered(
            filter,
            |record| {
                if let Some((matched_in, excerpt)) = search_record(record, query, target) {
                    if skip > 0 {
                        skip -= 1;
                    } else {
                        hits.push(SearchHit {
                            summary: summarize(record),
                            matched_in,
                            excerpt,
                        });
                    }
                }
                hits.len() < limit
            },
            0,
        )?;
        Ok(hits)
    }

    /// Extract `json_path` from JSON-classified bodies; optionally keep only
    /// rows where the extracted value equals `value`.
    pub fn query_json_bodies(
        &self,
        json_path: &str,
        value: Option<&serde_json::Value>,
        target: BodyTarget,
        filter: &RequestFilter,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> StoreResult<Vec<JsonHit>> {
        let segments = parse_json_path(json_path);
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT) as usize;
        let mut skip = offset.unwrap_or(0) as usize;
        let mut hits = Vec::new();
        if limit == 0 {
            return Ok(hits);
        }

        self.scan_filtered(
            filter,
            |record| {
                if let Some((matched_in, extracted)) =
                    extract_from_record(record, &segments, target)
                {
                    if value.is_none() || value == Some(&extracted) {
                        if skip > 0 {
                            skip -= 1;
                        } else {
                            hits.push(JsonHit {
                                summary: summarize(record),
                                matched_in,
                                extracted,
                            });
                        }
                    }
                }
                hits.len() < limit
            },
            0,
        )?;
        Ok(hits)
    }

    // -----------------------------------------------------------------------
    // Shared scan
    // -----------------------------------------------------------------------

    /// Iterate rows matching `filter` newest-first, skipping the first
    /// `offset` matches, calling `visit` until it returns false.
    fn scan_filtered(
        &self,
        filter: &RequestFilter,
        mut visit: impl FnMut(&RequestRecord) -> bool,
        mut offset: usize,
    ) -> StoreResult<()> {
        filter.validate()?;
        let post = PostPredicates::compile(filter)?;
        let (clauses, params) = sql_clauses(filter)?;
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM requests{} ORDER BY timestamp DESC, id DESC",
            where_sql(&clauses)
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), map_record)?;
        for row in rows {
            let record = row?;
            if !post.matches(&record) {
                continue;
            }
            if offset > 0 {
                offset -= 1;
                continue;
            }
            if !visit(&record) {
                break;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQL translation
// ---------------------------------------------------------------------------

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn sql_clauses(filter: &RequestFilter) -> StoreResult<(Vec<String>, Vec<SqlValue>)> {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(session_id) = &filter.session_id {
        params.push(SqlValue::Text(session_id.clone()));
        clauses.push(format!("session_id = ?{}", params.len()));
    }
    if !filter.methods.is_empty() {
        let mut placeholders = Vec::new();
        for method in &filter.methods {
            params.push(SqlValue::Text(method.to_ascii_uppercase()));
            placeholders.push(format!("?{}", params.len()));
        }
        clauses.push(format!("upper(method) IN ({})", placeholders.join(", ")));
    }
    if let Some(status) = filter.status()? {
        let (lo, hi) = status.bounds();
        params.push(SqlValue::Integer(lo));
        let lo_idx = params.len();
        params.push(SqlValue::Integer(hi));
        let hi_idx = params.len();
        clauses.push(format!(
            "resp_status IS NOT NULL AND resp_status BETWEEN ?{lo_idx} AND ?{hi_idx}"
        ));
    }
    if let Some(host) = &filter.host {
        // Substring semantics, case-insensitive.
        params.push(SqlValue::Text(host.to_ascii_lowercase()));
        clauses.push(format!("instr(lower(host), ?{}) > 0", params.len()));
    }
    if let Some(prefix) = &filter.path_prefix {
        params.push(SqlValue::Text(format!("{}%", escape_like(prefix))));
        clauses.push(format!("path LIKE ?{} ESCAPE '\\'", params.len()));
    }
    if let Some(since) = filter.since {
        params.push(SqlValue::Integer(since));
        clauses.push(format!("timestamp >= ?{}", params.len()));
    }
    if let Some(before) = filter.before {
        params.push(SqlValue::Integer(before));
        clauses.push(format!("timestamp < ?{}", params.len()));
    }
    if let Some(search) = &filter.search {
        params.push(SqlValue::Text(search.clone()));
        clauses.push(format!("instr(url, ?{}) > 0", params.len()));
    }
    if let Some(saved) = filter.saved {
        params.push(SqlValue::Integer(i64::from(saved)));
        clauses.push(format!("saved = ?{}", params.len()));
    }
    if let Some(source) = &filter.source {
        params.push(SqlValue::Text(source.clone()));
        clauses.push(format!("source = ?{}", params.len()));
    }

    Ok((clauses, params))
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ---------------------------------------------------------------------------
// Rust-side predicates
// ---------------------------------------------------------------------------

struct PostPredicates {
    url_regex: Option<regex::Regex>,
    header: Option<(String, Option<String>, HeaderTarget)>,
}

impl PostPredicates {
    fn compile(filter: &RequestFilter) -> Result<Self, StoreError> {
        let url_regex = match &filter.regex {
            Some(pattern) => {
                let flags = filter.regex_flags.as_deref().unwrap_or("");
                let compiled = regex::RegexBuilder::new(pattern)
                    .case_insensitive(flags.contains('i'))
                    .multi_line(flags.contains('m'))
                    .dot_matches_new_line(flags.contains('s'))
                    .build()
                    .map_err(|e| FilterError::InvalidRegex(e.to_string()))?;
                Some(compiled)
            }
            None => None,
        };
        let header = filter.header_name.as_ref().map(|name| {
            (
                name.to_ascii_lowercase(),
                filter.header_value.as_ref().map(|v| v.to_ascii_lowercase()),
                filter.header_target.unwrap_or_default(),
            )
        });
        Ok(Self { url_regex, header })
    }

    fn is_empty(&self) -> bool {
        self.url_regex.is_none() && self.header.is_none()
    }

    fn matches(&self, record: &RequestRecord) -> bool {
        if let Some(re) = &self.url_regex {
            if !re.is_match(&record.url) {
                return false;
            }
        }
        if let Some((name, value, target)) = &self.header {
            let headers = match target {
                HeaderTarget::Request => Some(&record.request_headers),
                HeaderTarget::Response => record.response_headers.as_ref(),
            };
            let Some(headers) = headers else {
                return false;
            };
            let found = headers.iter().any(|(n, v)| {
                n.eq_ignore_ascii_case(name)
                    && value
                        .as_ref()
                        .map_or(true, |want| v.to_ascii_lowercase() == *want)
            });
            if !found {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Wrap a stored-JSON decode failure as a column conversion error so it
/// surfaces through the normal rusqlite error path.
fn json_column_error(index: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn map_record(row: &rusqlite::Row<'_>) -> Result<RequestRecord, rusqlite::Error> {
    let req_headers_json: String = row.get(9)?;
    let request_headers =
        serde_json::from_str(&req_headers_json).map_err(|e| json_column_error(9, e))?;
    let response_headers = row
        .get::<_, Option<String>>(14)?
        .map(|json| serde_json::from_str(&json).map_err(|e| json_column_error(14, e)))
        .transpose()?;

    let interception_name: Option<String> = row.get(19)?;
    let interception_type: Option<String> = row.get(20)?;
    let interception = match (interception_name, interception_type.as_deref()) {
        (Some(name), Some(kind)) => {
            InterceptionType::parse(kind).map(|kind| InterceptionInfo { name, kind })
        }
        _ => None,
    };

    Ok(RequestRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        label: row.get(2)?,
        source: row.get(3)?,
        timestamp: row.get(4)?,
        method: row.get(5)?,
        url: row.get(6)?,
        host: row.get(7)?,
        path: row.get(8)?,
        request_headers,
        request_body: row.get::<_, Option<Vec<u8>>>(10)?.map(Body),
        request_body_truncated: row.get(11)?,
        response_status: row.get(13)?,
        response_headers,
        response_body: row.get::<_, Option<Vec<u8>>>(15)?.map(Body),
        response_body_truncated: row.get(16)?,
        duration_ms: row.get(18)?,
        interception,
        replayed_from_id: row.get(21)?,
        replay_initiator: row.get(22)?,
        saved: row.get(23)?,
    })
}

pub(super) fn summarize(record: &RequestRecord) -> RequestSummary {
    RequestSummary {
        id: record.id,
        session_id: record.session_id.clone(),
        label: record.label.clone(),
        source: record.source.clone(),
        timestamp: record.timestamp,
        method: record.method.clone(),
        url: record.url.clone(),
        host: record.host.clone(),
        path: record.path.clone(),
        response_status: record.response_status,
        duration_ms: record.duration_ms,
        interception: record.interception.clone(),
        replayed_from_id: record.replayed_from_id,
        saved: record.saved,
    }
}

// ---------------------------------------------------------------------------
// Body search helpers
// ---------------------------------------------------------------------------

fn search_record(
    record: &RequestRecord,
    query: &str,
    target: BodyTarget,
) -> Option<(&'static str, String)> {
    let req_ct = header_value(&record.request_headers, "content-type");
    let resp_ct = record
        .response_headers
        .as_ref()
        .and_then(|h| header_value(h, "content-type"));

    if matches!(target, BodyTarget::Request | BodyTarget::Both) {
        if let Some(body) = &record.request_body {
            if content_type::is_text(req_ct.as_deref()) {
                if let Some(excerpt) = find_excerpt(body.as_bytes(), query) {
                    return Some(("request", excerpt));
                }
            }
        }
    }
    if matches!(target, BodyTarget::Response | BodyTarget::Both) {
        if let Some(body) = &record.response_body {
            if content_type::is_text(resp_ct.as_deref()) {
                if let Some(excerpt) = find_excerpt(body.as_bytes(), query) {
                    return Some(("response", excerpt));
                }
            }
        }
    }
    None
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Locate `query` in the body and return up to 40 chars of context on each
/// side, respecting UTF-8 boundaries.
fn find_excerpt(body: &[u8], query: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let pos = text.find(query)?;
    let start = text[..pos]
        .char_indices()
        .rev()
        .take(40)
        .last()
        .map_or(pos, |(i, _)| i);
    let end_base = pos + query.len();
    let end = text[end_base..]
        .char_indices()
        .take(41)
        .last()
        .map_or(end_base, |(i, c)| end_base + i + c.len_utf8());
    Some(text[start..end].to_string())
}

// ---------------------------------------------------------------------------
// JSON path extraction
// ---------------------------------------------------------------------------

/// Path language: dotted object segments with bare numeric array indices
/// (`a.b.0.c`); an optional `$.` prefix is stripped.
fn parse_json_path(path: &str) -> Vec<String> {
    let trimmed = path.strip_prefix("$.").unwrap_or(path);
    trimmed
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn walk_path<'v>(
    root: &'v serde_json::Value,
    segments: &[String],
) -> Option<&'v serde_json::Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn extract_from_record(
    record: &RequestRecord,
    segments: &[String],
    target: BodyTarget,
) -> Option<(&'static str, serde_json::Value)> {
    let req_ct = header_value(&record.request_headers, "content-type");
    let resp_ct = record
        .response_headers
        .as_ref()
        .and_then(|h| header_value(h, "content-type"));

    if matches!(target, BodyTarget::Request | BodyTarget::Both) {
        if let Some(body) = &record.request_body {
            if content_type::is_json(req_ct.as_deref()) {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body.as_bytes()) {
                    if let Some(found) = walk_path(&value, segments) {
                        return Some(("request", found.clone()));
                    }
                }
            }
        }
    }
    if matches!(target, BodyTarget::Response | BodyTarget::Both) {
        if let Some(body) = &record.response_body {
            if content_type::is_json(resp_ct.as_deref()) {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body.as_bytes()) {
                    if let Some(found) = walk_path(&value, segments) {
                        return Some(("response", found.clone()));
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::super::{NewRequest, ResponseUpdate, Store};
    use procsi_protocol::filter::RequestFilter;
    use procsi_protocol::BodyTarget;

    fn seeded_store() -> Store {
        let mut s = Store::open_in_memory(100).unwrap();
        s.ensure_session("default", None, None).unwrap();

        let mut insert = |ts: i64, method: &str, host: &str, path: &str, body: &[u8], ct: &str| {
            let id = s
                .save_request(&NewRequest {
                    session_id: "default".to_owned(),
                    timestamp: ts,
                    method: method.to_owned(),
                    url: format!("http://{host}{path}"),
                    host: host.to_owned(),
                    path: path.to_owned(),
                    headers: vec![("content-type".to_owned(), ct.to_owned())],
                    body: Some(body.to_vec()),
                    ..NewRequest::default()
                })
                .unwrap();
            s.update_request_response(
                id,
                &ResponseUpdate {
                    status: 200,
                    headers: vec![("content-type".to_owned(), ct.to_owned())],
                    body: Some(body.to_vec()),
                    content_type: Some(ct.to_owned()),
                    duration_ms: 5,
                    ..ResponseUpdate::default()
                },
            )
            .unwrap();
            id
        };

        insert(1, "GET", "api.example.com", "/v1/users", br#"{"user":{"name":"ada"}}"#, "application/json");
        insert(2, "POST", "api.example.com", "/v1/orders", br#"{"order":{"total":9}}"#, "application/json");
        insert(3, "GET", "cdn.example.com", "/logo.png", &[0x89, 0x50, 0x4e, 0x47], "image/png");
        s
    }

    #[test]
    fn list_orders_newest_first() {
        let s = seeded_store();
        let rows = s
            .list_requests_summary(&RequestFilter::default(), None, None)
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].timestamp > rows[2].timestamp);
    }

    #[test]
    fn host_filter_uses_substring_semantics() {
        let s = seeded_store();
        let filter = RequestFilter {
            host: Some("API.example".to_owned()),
            ..RequestFilter::default()
        };
        let rows = s.list_requests_summary(&filter, None, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.host == "api.example.com"));
    }

    #[test]
    fn method_and_path_prefix_filters_compose() {
        let s = seeded_store();
        let filter = RequestFilter {
            methods: vec!["post".to_owned()],
            path_prefix: Some("/v1".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(s.count_requests(&filter).unwrap(), 1);
    }

    #[test]
    fn regex_filter_applies_rust_side() {
        let s = seeded_store();
        let filter = RequestFilter {
            regex: Some(r"/v1/(users|orders)$".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(s.count_requests(&filter).unwrap(), 2);
    }

    #[test]
    fn header_filter_matches_case_insensitively() {
        let s = seeded_store();
        let filter = RequestFilter {
            header_name: Some("Content-Type".to_owned()),
            header_value: Some("APPLICATION/JSON".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(s.count_requests(&filter).unwrap(), 2);
    }

    #[test]
    fn catastrophic_regex_is_rejected() {
        let s = seeded_store();
        let filter = RequestFilter {
            regex: Some("(a+)+$".to_owned()),
            ..RequestFilter::default()
        };
        assert!(s.count_requests(&filter).is_err());
    }

    #[test]
    fn search_skips_binary_bodies() {
        let s = seeded_store();
        // The PNG body contains 0x50 0x4e 0x47 ("PNG") but is not text-classified.
        let hits = s
            .search_bodies("PNG", BodyTarget::Both, &RequestFilter::default(), None, None)
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn search_finds_substring_with_excerpt() {
        let s = seeded_store();
        let hits = s
            .search_bodies("\"ada\"", BodyTarget::Both, &RequestFilter::default(), None, None)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched_in, "request");
        assert!(hits[0].excerpt.contains("ada"));
    }

    #[test]
    fn json_query_walks_dotted_paths() {
        let s = seeded_store();
        let hits = s
            .query_json_bodies(
                "user.name",
                None,
                BodyTarget::Request,
                &RequestFilter::default(),
                None,
                None,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].extracted, serde_json::json!("ada"));
    }

    #[test]
    fn json_query_equality_filter() {
        let s = seeded_store();
        let wanted = serde_json::json!(9);
        let hits = s
            .query_json_bodies(
                "$.order.total",
                Some(&wanted),
                BodyTarget::Both,
                &RequestFilter::default(),
                None,
                None,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);

        let unwanted = serde_json::json!(10);
        let hits = s
            .query_json_bodies(
                "$.order.total",
                Some(&unwanted),
                BodyTarget::Both,
                &RequestFilter::default(),
                None,
                None,
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn status_filter_ignores_inflight_rows() {
        let mut s = seeded_store();
        // In-flight row: no response yet.
        s.save_request(&NewRequest {
            session_id: "default".to_owned(),
            timestamp: 9,
            method: "GET".to_owned(),
            url: "http://api.example.com/pending".to_owned(),
            host: "api.example.com".to_owned(),
            path: "/pending".to_owned(),
            ..NewRequest::default()
        })
        .unwrap();

        let filter = RequestFilter {
            status_range: Some("2xx".to_owned()),
            ..RequestFilter::default()
        };
        assert_eq!(s.count_requests(&filter).unwrap(), 3);
    }
}
