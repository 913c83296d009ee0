//! Control method dispatch.
//!
//! Method names are contracts (see `procsi_protocol::methods`). Validation
//! failures map to `INVALID_PARAMS`, unknown methods to `METHOD_NOT_FOUND`,
//! anything uncaught to `INTERNAL` with a one-line summary.

use crate::events::EventLog;
use crate::interceptors::{InterceptorLoader, SharedStore};
use crate::replay::{ReplayEngine, ReplayError};
use crate::storage::{SessionRow, StoreError};
use procsi_protocol::{
    error_codes, methods, CountRequestsParams, GetInterceptorEventsParams, InterceptorInfo,
    ListRequestsParams, QueryJsonBodiesMatch, QueryJsonBodiesParams, RegisterSessionParams,
    RegisterSessionResult, ReplayRequestParams, ReplayRequestResult, RequestIdParams, RpcError,
    SearchBodiesMatch, SearchBodiesParams, SessionInfo, StatusResult,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// Everything the control methods reach into.
pub struct ControlContext {
    pub store: SharedStore,
    pub events: Arc<EventLog>,
    pub loader: Arc<InterceptorLoader>,
    pub replay: Option<Arc<ReplayEngine>>,
    pub proxy_port: u16,
    pub default_session_id: String,
}

pub async fn dispatch(
    ctx: &ControlContext,
    method: &str,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    match method {
        methods::PING => Ok(json!("pong")),
        methods::STATUS => status(ctx).await,
        methods::REGISTER_SESSION => register_session(ctx, params).await,
        methods::LIST_SESSIONS => list_sessions(ctx).await,
        methods::LIST_REQUESTS => list_requests(ctx, params, false).await,
        methods::LIST_REQUESTS_SUMMARY => list_requests(ctx, params, true).await,
        methods::GET_REQUEST => get_request(ctx, params).await,
        methods::COUNT_REQUESTS => count_requests(ctx, params).await,
        methods::SEARCH_BODIES => search_bodies(ctx, params).await,
        methods::QUERY_JSON_BODIES => query_json_bodies(ctx, params).await,
        methods::CLEAR_REQUESTS => clear_requests(ctx).await,
        methods::REPLAY_REQUEST => replay_request(ctx, params).await,
        methods::SAVE_REQUEST => set_saved(ctx, params, true).await,
        methods::UNSAVE_REQUEST => set_saved(ctx, params, false).await,
        methods::LIST_INTERCEPTORS => Ok(list_interceptors(ctx)),
        methods::RELOAD_INTERCEPTORS => {
            ctx.loader.reload();
            Ok(list_interceptors(ctx))
        }
        methods::GET_INTERCEPTOR_EVENTS => get_interceptor_events(ctx, params),
        methods::CLEAR_INTERCEPTOR_EVENTS => {
            ctx.events.clear();
            Ok(json!({"ok": true}))
        }
        unknown => Err(RpcError {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("unknown method {unknown:?}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Method bodies
// ---------------------------------------------------------------------------

async fn status(ctx: &ControlContext) -> Result<Value, RpcError> {
    let store = ctx.store.lock().await;
    let result = StatusResult {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        proxy_port: ctx.proxy_port,
        request_count: store.request_count().map_err(internal)?,
        session_count: store.session_count().map_err(internal)?,
        interceptor_count: ctx.loader.get_interceptors().len(),
        default_session_id: ctx.default_session_id.clone(),
    };
    to_value(result)
}

async fn register_session(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: RegisterSessionParams = parse_params_or_default(params)?;
    let (session, auth_token) = ctx
        .store
        .lock()
        .await
        .register_session(params.label.as_deref(), params.pid, params.source.as_deref())
        .map_err(internal)?;
    to_value(RegisterSessionResult {
        id: session.id,
        auth_token,
    })
}

async fn list_sessions(ctx: &ControlContext) -> Result<Value, RpcError> {
    let sessions = ctx.store.lock().await.list_sessions().map_err(internal)?;
    to_value(sessions.into_iter().map(session_info).collect::<Vec<_>>())
}

async fn list_requests(
    ctx: &ControlContext,
    params: Option<Value>,
    summary: bool,
) -> Result<Value, RpcError> {
    let params: ListRequestsParams = parse_params_or_default(params)?;
    let store = ctx.store.lock().await;
    if summary {
        let rows = store
            .list_requests_summary(&params.filter, params.limit, params.offset)
            .map_err(store_error)?;
        to_value(rows)
    } else {
        let rows = store
            .list_requests(&params.filter, params.limit, params.offset)
            .map_err(store_error)?;
        to_value(rows)
    }
}

async fn get_request(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: RequestIdParams = parse_params(params)?;
    let record = ctx
        .store
        .lock()
        .await
        .get_request(params.id)
        .map_err(internal)?
        .ok_or_else(|| RpcError {
            code: error_codes::INTERNAL,
            message: format!("request {} not found", params.id),
        })?;
    to_value(record)
}

async fn count_requests(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: CountRequestsParams = parse_params_or_default(params)?;
    let count = ctx
        .store
        .lock()
        .await
        .count_requests(&params.filter)
        .map_err(store_error)?;
    Ok(json!({ "count": count }))
}

async fn search_bodies(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: SearchBodiesParams = parse_params(params)?;
    let hits = ctx
        .store
        .lock()
        .await
        .search_bodies(
            &params.query,
            params.target,
            &params.filter,
            params.limit,
            params.offset,
        )
        .map_err(store_error)?;
    let matches: Vec<SearchBodiesMatch> = hits
        .into_iter()
        .map(|hit| SearchBodiesMatch {
            request: hit.summary,
            matched_in: hit.matched_in.to_owned(),
            excerpt: hit.excerpt,
        })
        .collect();
    to_value(matches)
}

async fn query_json_bodies(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: QueryJsonBodiesParams = parse_params(params)?;
    let hits = ctx
        .store
        .lock()
        .await
        .query_json_bodies(
            &params.json_path,
            params.value.as_ref(),
            params.target,
            &params.filter,
            params.limit,
            params.offset,
        )
        .map_err(store_error)?;
    let matches: Vec<QueryJsonBodiesMatch> = hits
        .into_iter()
        .map(|hit| QueryJsonBodiesMatch {
            request: hit.summary,
            matched_in: hit.matched_in.to_owned(),
            extracted: hit.extracted,
        })
        .collect();
    to_value(matches)
}

async fn clear_requests(ctx: &ControlContext) -> Result<Value, RpcError> {
    let cleared = ctx.store.lock().await.clear_requests().map_err(internal)?;
    Ok(json!({ "cleared": cleared }))
}

async fn replay_request(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: ReplayRequestParams = parse_params(params)?;
    let engine = ctx.replay.as_ref().ok_or_else(|| RpcError {
        code: error_codes::INTERNAL,
        message: "replay engine unavailable".to_owned(),
    })?;
    let request_id = engine.replay_request(params).await.map_err(replay_error)?;
    to_value(ReplayRequestResult { request_id })
}

async fn set_saved(
    ctx: &ControlContext,
    params: Option<Value>,
    saved: bool,
) -> Result<Value, RpcError> {
    let params: RequestIdParams = parse_params(params)?;
    ctx.store
        .lock()
        .await
        .set_request_saved(params.id, saved)
        .map_err(internal)?;
    Ok(json!({ "ok": true }))
}

fn list_interceptors(ctx: &ControlContext) -> Value {
    let list: Vec<InterceptorInfo> = ctx
        .loader
        .get_interceptors()
        .iter()
        .map(|i| InterceptorInfo {
            name: i.name().to_owned(),
            source_file: i.source_file().to_owned(),
            action: i.action_kind().to_owned(),
        })
        .collect();
    serde_json::to_value(list).unwrap_or(Value::Null)
}

fn get_interceptor_events(ctx: &ControlContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: GetInterceptorEventsParams = parse_params_or_default(params)?;
    to_value(ctx.events.query(&params))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Required params: absence is a validation error.
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.ok_or_else(|| RpcError {
        code: error_codes::INVALID_PARAMS,
        message: "params object required".to_owned(),
    })?;
    serde_json::from_value(value).map_err(|e| RpcError {
        code: error_codes::INVALID_PARAMS,
        message: format!("invalid params: {e}"),
    })
}

/// Optional params: absence means the method's defaults.
fn parse_params_or_default<T: DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, RpcError> {
    match params {
        None => Ok(T::default()),
        Some(value) => parse_params(Some(value)),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(internal)
}

fn internal(e: impl std::fmt::Display) -> RpcError {
    RpcError {
        code: error_codes::INTERNAL,
        message: e.to_string(),
    }
}

fn store_error(e: StoreError) -> RpcError {
    match e {
        StoreError::Filter(inner) => RpcError {
            code: error_codes::INVALID_PARAMS,
            message: inner.to_string(),
        },
        other => internal(other),
    }
}

fn replay_error(e: ReplayError) -> RpcError {
    match e {
        ReplayError::InvalidMethod(_)
        | ReplayError::InvalidUrl(_)
        | ReplayError::InvalidBase64
        | ReplayError::ConflictingBodies => RpcError {
            code: error_codes::INVALID_PARAMS,
            message: e.to_string(),
        },
        other => internal(other),
    }
}

fn session_info(row: SessionRow) -> SessionInfo {
    SessionInfo {
        id: row.id,
        label: row.label,
        pid: row.pid,
        source: row.source,
        started_at: row.started_at,
    }
}
