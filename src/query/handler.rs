use crate::error::{AppError, AppResult, LoggedPath, LoggedQuery};
use crate::query::cache::StatsCache;
use crate::query::stats;
use crate::storage::{page_views, sessions, sqlite};
use crate::types::{
    HealthResponse, SessionQueryParams, StatsQueryParams, StatsResponse, TrafficSource,
    VisitorSession,
};
use axum::extract::State;
use axum::Json;
use deadpool_sqlite::Pool;
use std::sync::Arc;

pub struct QueryState {
    pub pool: Pool,
    pub cache: StatsCache,
}

/// GET /v1/sessions - List sessions with filters and pagination, newest first.
pub async fn list_sessions(
    State(state): State<Arc<QueryState>>,
    LoggedQuery(params): LoggedQuery<SessionQueryParams>,
) -> AppResult<Json<Vec<VisitorSession>>> {
    if let Some(ref source) = params.source {
        if TrafficSource::parse(source).is_none() {
            return Err(AppError::Validation(format!("unknown source: {source}")));
        }
    }

    let results = sqlite::interact(&state.pool, move |conn| {
        Ok(sessions::list(conn, &params)?)
    })
    .await?;

    Ok(Json(results))
}

/// GET /v1/sessions/{session_id} - One session with its page views in order.
pub async fn get_session(
    State(state): State<Arc<QueryState>>,
    LoggedPath(session_id): LoggedPath<String>,
) -> AppResult<Json<serde_json::Value>> {
    let (session, views) = sqlite::interact(&state.pool, move |conn| {
        let session = sessions::find_by_session_id(conn, &session_id)?
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        let views = page_views::list_for_session(conn, session.id)?;
        Ok((session, views))
    })
    .await?;

    Ok(Json(serde_json::json!({
        "session": session,
        "pageViews": views,
    })))
}

/// GET /v1/stats - Aggregate overview for the last `hours` hours.
pub async fn stats(
    State(state): State<Arc<QueryState>>,
    LoggedQuery(params): LoggedQuery<StatsQueryParams>,
) -> AppResult<Json<StatsResponse>> {
    let hours = params.hours();
    if let Some(cached) = state.cache.get(hours) {
        return Ok(Json(cached));
    }

    let since_ms = chrono::Utc::now().timestamp_millis() - hours * 3_600_000;
    let result = sqlite::interact(&state.pool, move |conn| {
        Ok(stats::compute(conn, since_ms, hours)?)
    })
    .await?;

    state.cache.insert(hours, result.clone());
    Ok(Json(result))
}

/// GET /health - Health check.
pub async fn health(State(state): State<Arc<QueryState>>) -> Json<HealthResponse> {
    let db_ok = sqlite::interact(&state.pool, |conn| Ok(conn.execute_batch("SELECT 1")?))
        .await
        .is_ok();

    Json(HealthResponse {
        status: if db_ok {
            "ok".into()
        } else {
            "degraded".into()
        },
        db_ok,
    })
}
