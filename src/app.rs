use crate::auth::{self, AdminTokens};
use crate::config::AppConfig;
use crate::ingest::handler::{self as ingest_handler, IngestState};
use crate::query::cache::StatsCache;
use crate::query::handler::{self as query_handler, QueryState};
use crate::tracker::SessionTracker;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use deadpool_sqlite::Pool;
use std::sync::Arc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Assemble the HTTP router. The server must be started with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the rate limiter
/// and the ingest handlers can see the peer address.
pub fn build_router(
    config: &AppConfig,
    pool: Pool,
    tracker: SessionTracker,
) -> Result<Router, Box<dyn std::error::Error>> {
    let ingest_state = Arc::new(IngestState {
        config: config.ingest.clone(),
        tracker,
    });

    let query_state = Arc::new(QueryState {
        pool,
        cache: StatsCache::new(config.query.cache_ttl_secs),
    });

    let admin_tokens = Arc::new(AdminTokens::new(&config.auth.admin_tokens));

    // Rate limiter for ingest routes
    let governor_conf = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_second(config.rate_limit.per_second)
        .burst_size(config.rate_limit.burst_size)
        .finish()
        .ok_or("rate_limit.per_second and rate_limit.burst_size must be greater than zero")?;

    // CORS for ingest: any origin, the snippet runs on the tracked site
    let ingest_cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([axum::http::Method::POST, axum::http::Method::OPTIONS])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    // ── Ingest routes (public, rate-limited) ──
    let ingest_routes = Router::new()
        .route("/v1/pageviews", post(ingest_handler::record_single))
        .route("/v1/pageviews/batch", post(ingest_handler::record_batch))
        .route(
            "/v1/pageviews/{id}/engagement",
            post(ingest_handler::update_engagement),
        )
        .route(
            "/v1/sessions/{session_id}/end",
            post(ingest_handler::end_session),
        )
        .layer(DefaultBodyLimit::max(config.ingest.max_payload_bytes))
        .layer(GovernorLayer::new(governor_conf))
        .layer(ingest_cors)
        .with_state(ingest_state);

    // ── Health route (public) ──
    let health_route = Router::new()
        .route("/health", get(query_handler::health))
        .with_state(query_state.clone());

    // ── Admin read routes (bearer token) ──
    let query_routes = Router::new()
        .route("/v1/sessions", get(query_handler::list_sessions))
        .route("/v1/sessions/{session_id}", get(query_handler::get_session))
        .route("/v1/stats", get(query_handler::stats))
        .layer(middleware::from_fn(auth::require_admin_token))
        .layer(axum::Extension(admin_tokens))
        .with_state(query_state);

    Ok(Router::new()
        .merge(ingest_routes)
        .merge(health_route)
        .merge(query_routes))
}
