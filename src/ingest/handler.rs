use crate::attribution::{self, UtmParams};
use crate::client_info::ClientInfo;
use crate::config::IngestConfig;
use crate::error::{AppError, AppResult, LoggedBytes, LoggedJson, LoggedPath};
use crate::tracker::SessionTracker;
use crate::types::{
    parse_timestamp, EndSessionRequest, EngagementUpdate, GeoInfo, PageViewEvent, RecordOutcome,
    TrackedEvent, TrafficSource, VisitorSession,
};
use axum::extract::{ConnectInfo, FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct IngestState {
    pub config: IngestConfig,
    pub tracker: SessionTracker,
}

/// Request-level context used to fill in what the tracking snippet left out.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

impl RequestContext {
    fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Self {
            user_agent,
            ip: forwarded.or_else(|| peer.map(|addr| addr.ip().to_string())),
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_headers(&parts.headers, peer))
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> AppResult<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::Validation(format!("{name} is required"))),
    }
}

fn check_len(value: Option<&str>, name: &str, max: usize) -> AppResult<()> {
    match value {
        Some(v) if v.len() > max => Err(AppError::Validation(format!(
            "{name} exceeds {max} bytes"
        ))),
        _ => Ok(()),
    }
}

fn check_time_on_page(value: Option<f64>) -> AppResult<()> {
    match value {
        Some(t) if !t.is_finite() || t < 0.0 => Err(AppError::Validation(
            "timeOnPage must be a non-negative number of seconds".to_string(),
        )),
        _ => Ok(()),
    }
}

fn check_scroll_depth(value: Option<f64>) -> AppResult<()> {
    match value {
        Some(d) if !(0.0..=100.0).contains(&d) => Err(AppError::Validation(
            "scrollDepth must be between 0 and 100".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Validate an event against required fields, size limits and numeric ranges.
/// Returns the parsed timestamp in Unix milliseconds.
fn validate_event(event: &PageViewEvent, config: &IngestConfig) -> AppResult<i64> {
    required(&event.visitor_id, "visitorId")?;
    required(&event.session_id, "sessionId")?;
    let path = required(&event.path, "path")?;
    let timestamp = required(&event.timestamp, "timestamp")?;

    if path.len() > config.max_path_bytes {
        return Err(AppError::Validation(format!(
            "path exceeds {} bytes",
            config.max_path_bytes
        )));
    }
    check_len(event.session_referrer.as_deref(), "sessionReferrer", config.max_path_bytes)?;
    check_len(event.referrer.as_deref(), "referrer", config.max_path_bytes)?;

    let max = config.max_field_bytes;
    for (name, value) in [
        ("visitorId", &event.visitor_id),
        ("sessionId", &event.session_id),
        ("title", &event.title),
        ("utmSource", &event.utm_source),
        ("utmMedium", &event.utm_medium),
        ("utmCampaign", &event.utm_campaign),
        ("utmTerm", &event.utm_term),
        ("utmContent", &event.utm_content),
        ("userAgent", &event.user_agent),
        ("browser", &event.browser),
        ("os", &event.os),
        ("ip", &event.ip),
        ("country", &event.country),
        ("city", &event.city),
        ("region", &event.region),
        ("userId", &event.user_id),
        ("postId", &event.post_id),
        ("categoryId", &event.category_id),
    ] {
        check_len(value.as_deref(), name, max)?;
    }

    check_time_on_page(event.time_on_page)?;
    check_scroll_depth(event.scroll_depth)?;

    parse_timestamp(timestamp).map_err(AppError::Validation)
}

fn validate_engagement(update: &EngagementUpdate) -> AppResult<()> {
    check_time_on_page(update.time_on_page)?;
    check_scroll_depth(update.scroll_depth)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validate and enrich a raw event into what the tracker stores.
fn process_event(
    event: PageViewEvent,
    config: &IngestConfig,
    ctx: &RequestContext,
) -> AppResult<TrackedEvent> {
    let timestamp = validate_event(&event, config)?;

    let path = event.path.unwrap_or_default().trim().to_string();

    let utm = UtmParams {
        source: non_empty(event.utm_source),
        medium: non_empty(event.utm_medium),
        campaign: non_empty(event.utm_campaign),
        term: non_empty(event.utm_term),
        content: non_empty(event.utm_content),
        click_id: None,
    }
    .or(UtmParams::from_path(&path));

    let session_referrer = non_empty(event.session_referrer);

    let source = event
        .source
        .as_deref()
        .and_then(TrafficSource::parse)
        .unwrap_or_else(|| {
            attribution::classify(&utm, session_referrer.as_deref(), &config.site_hosts)
        });

    let user_agent = non_empty(event.user_agent).or_else(|| ctx.user_agent.clone());
    let mut client = ClientInfo::from_user_agent(user_agent.as_deref()).with_overrides(
        event.device_type.as_deref(),
        event.browser.as_deref(),
        event.os.as_deref(),
    );
    client.ip = non_empty(event.ip).or_else(|| ctx.ip.clone());

    Ok(TrackedEvent {
        visitor_id: event.visitor_id.unwrap_or_default().trim().to_string(),
        session_id: event.session_id.unwrap_or_default().trim().to_string(),
        path,
        timestamp,
        title: non_empty(event.title),
        referrer: non_empty(event.referrer),
        session_referrer,
        utm,
        source,
        client,
        geo: GeoInfo {
            country: non_empty(event.country),
            city: non_empty(event.city),
            region: non_empty(event.region),
        },
        user_id: non_empty(event.user_id),
        post_id: non_empty(event.post_id),
        category_id: non_empty(event.category_id),
        time_on_page: event.time_on_page,
        scroll_depth: event.scroll_depth,
    })
}

/// POST /v1/pageviews - Record a single page view.
pub async fn record_single(
    State(state): State<Arc<IngestState>>,
    ctx: RequestContext,
    LoggedJson(event): LoggedJson<PageViewEvent>,
) -> AppResult<Json<RecordOutcome>> {
    let tracked = process_event(event, &state.config, &ctx).inspect_err(|e| {
        tracing::warn!(error = %e, "rejected page view");
    })?;

    let outcome = state.tracker.record_page_view(tracked).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct BatchPayload {
    pub events: Vec<PageViewEvent>,
}

/// POST /v1/pageviews/batch - Record up to `max_batch_size` page views.
/// Events are recorded independently; one failure does not reject the rest.
pub async fn record_batch(
    State(state): State<Arc<IngestState>>,
    ctx: RequestContext,
    LoggedJson(payload): LoggedJson<BatchPayload>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.events.len() > state.config.max_batch_size {
        return Err(AppError::Validation(format!(
            "batch exceeds max size of {}",
            state.config.max_batch_size
        )));
    }

    let mut accepted = 0u64;
    let mut errors = Vec::new();

    for (i, event) in payload.events.into_iter().enumerate() {
        let result = match process_event(event, &state.config, &ctx) {
            Ok(tracked) => state.tracker.record_page_view(tracked).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => accepted += 1,
            Err(e) => {
                errors.push(serde_json::json!({
                    "index": i,
                    "error": e.to_string(),
                    "reason": e.reason(),
                }));
            }
        }
    }

    if !errors.is_empty() {
        tracing::warn!(accepted, rejected = errors.len(), "partially rejected batch");
    }

    Ok(Json(serde_json::json!({
        "accepted": accepted,
        "errors": errors,
    })))
}

/// POST /v1/pageviews/{id}/engagement - Late time-on-page / scroll-depth update.
pub async fn update_engagement(
    State(state): State<Arc<IngestState>>,
    LoggedPath(page_view_id): LoggedPath<i64>,
    LoggedJson(update): LoggedJson<EngagementUpdate>,
) -> AppResult<Json<serde_json::Value>> {
    validate_engagement(&update)?;

    let view = state.tracker.update_engagement(page_view_id, update).await?;
    Ok(Json(serde_json::json!({
        "pageViewId": view.id,
        "updated": true,
    })))
}

/// POST /v1/sessions/{session_id}/end - Explicit leave signal from the client.
pub async fn end_session(
    State(state): State<Arc<IngestState>>,
    LoggedPath(session_id): LoggedPath<String>,
    LoggedBytes(body): LoggedBytes,
) -> AppResult<Json<VisitorSession>> {
    // The body is optional; an empty one closes the session at its last event.
    let request: EndSessionRequest = if body.iter().all(u8::is_ascii_whitespace) {
        EndSessionRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("invalid end-session body: {e}")))?
    };

    let at = match request.timestamp {
        Some(ts) => Some(parse_timestamp(&ts).map_err(AppError::Validation)?),
        None => None,
    };

    let session = state.tracker.end_session(session_id, at).await?;
    Ok(Json(session))
}
