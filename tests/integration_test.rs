use pagetrail::config::{
    AppConfig, AuthConfig, DatabaseConfig, IngestConfig, QueryConfig, RateLimitConfig,
    ServerConfig, SessionsConfig,
};
use pagetrail::tracker::SessionTracker;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;

const ADMIN_TOKEN: &str = "test-admin-token-0123456789abcdef";

struct TestServer {
    addr: SocketAddr,
    pool: deadpool_sqlite::Pool,
    client: reqwest::Client,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn admin_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
    }

    async fn count(&self, sql: &'static str) -> i64 {
        let conn = self.pool.get().await.unwrap();
        conn.interact(move |conn| conn.query_row(sql, [], |row| row.get(0)))
            .await
            .unwrap()
            .unwrap()
    }
}

fn test_config(db_path: std::path::PathBuf) -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        database: DatabaseConfig {
            path: db_path,
            pool_size: 8,
        },
        ingest: IngestConfig {
            site_hosts: vec!["blog.example.com".to_string()],
            ..IngestConfig::default()
        },
        sessions: SessionsConfig::default(),
        auth: AuthConfig {
            admin_tokens: vec![ADMIN_TOKEN.to_string()],
        },
        rate_limit: RateLimitConfig {
            per_second: 1,
            burst_size: 1000,
        },
        query: QueryConfig { cache_ttl_secs: 1 },
    }
}

/// Spawn the server on a random port backed by a temp database.
async fn spawn_server() -> TestServer {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let db_path = tmp.path().to_path_buf();
    // Keep tmp alive by leaking it (test only)
    std::mem::forget(tmp);

    let config = test_config(db_path);
    let pool = pagetrail::storage::sqlite::create_pool(&config.database).unwrap();
    pagetrail::storage::sqlite::init_pool(&pool).await.unwrap();

    let tracker = SessionTracker::new(pool.clone());
    let app = pagetrail::app::build_router(&config, pool.clone(), tracker).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        addr,
        pool,
        client: reqwest::Client::new(),
    }
}

fn view(session: &str, path: &str, timestamp: &str) -> Value {
    json!({
        "visitorId": "v1",
        "sessionId": session,
        "path": path,
        "timestamp": timestamp,
    })
}

async fn session_detail(server: &TestServer, session: &str) -> Value {
    let resp = server.admin_get(&format!("/v1/sessions/{session}")).await;
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_health() {
    let server = spawn_server().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db_ok"], true);
}

#[tokio::test]
async fn test_first_view_creates_session() {
    let server = spawn_server().await;

    let resp = server
        .post("/v1/pageviews", view("s1", "/a", "2024-03-01T10:00:00Z"))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sessionId"], "s1");
    assert_eq!(body["isNewSession"], true);
    assert_eq!(body["isNewVisitor"], true);
    assert_eq!(body["pageViews"], 1);
    assert!(body["pageViewId"].as_i64().unwrap() > 0);

    let detail = session_detail(&server, "s1").await;
    let session = &detail["session"];
    assert_eq!(session["pageViews"], 1);
    assert_eq!(session["bounced"], true);
    assert_eq!(session["entryPage"], "/a");
    assert_eq!(session["duration"], 0);
    assert_eq!(session["isActive"], true);
    assert_eq!(detail["pageViews"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_view_extends_session() {
    let server = spawn_server().await;

    server
        .post("/v1/pageviews", view("s1", "/a", "2024-03-01T10:00:00Z"))
        .await;
    let resp = server
        .post("/v1/pageviews", view("s1", "/b", "2024-03-01T10:01:30Z"))
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["isNewSession"], false);
    assert_eq!(body["pageViews"], 2);

    let session = &session_detail(&server, "s1").await["session"];
    assert_eq!(session["pageViews"], 2);
    assert_eq!(session["bounced"], false);
    assert_eq!(session["exitPage"], "/b");
    assert_eq!(session["duration"], 90);
}

#[tokio::test]
async fn test_missing_session_id_is_rejected_without_writes() {
    let server = spawn_server().await;

    let resp = server
        .post(
            "/v1/pageviews",
            json!({
                "visitorId": "v1",
                "path": "/a",
                "timestamp": "2024-03-01T10:00:00Z",
            }),
        )
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "validation");
    assert!(body["error"].as_str().unwrap().contains("sessionId"));

    assert_eq!(server.count("SELECT COUNT(*) FROM visitor_sessions").await, 0);
    assert_eq!(server.count("SELECT COUNT(*) FROM page_views").await, 0);
}

#[tokio::test]
async fn test_malformed_json_is_validation_error() {
    let server = spawn_server().await;
    let resp = server
        .client
        .post(server.url("/v1/pageviews"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_bad_path_query_and_body_are_validation_errors() {
    let server = spawn_server().await;

    let resp = server
        .post("/v1/pageviews/abc/engagement", json!({ "timeOnPage": 1 }))
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "validation");
    assert_eq!(body["retryable"], false);

    let resp = server.admin_get("/v1/sessions?limit=abc").await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "validation");

    let resp = server.admin_get("/v1/stats?hours=-x").await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "validation");

    let resp = server
        .client
        .post(server.url("/v1/sessions/s1/end"))
        .header("content-type", "application/json")
        .body(" ".repeat(40 * 1024))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "validation");
}

#[tokio::test]
async fn test_late_event_keeps_duration() {
    let server = spawn_server().await;

    server
        .post("/v1/pageviews", view("s1", "/a", "2024-03-01T10:00:00Z"))
        .await;
    server
        .post("/v1/pageviews", view("s1", "/b", "2024-03-01T10:05:00Z"))
        .await;
    let resp = server
        .post("/v1/pageviews", view("s1", "/late", "2024-03-01T10:02:00Z"))
        .await;
    assert_eq!(resp.status(), 200);

    let session = &session_detail(&server, "s1").await["session"];
    assert_eq!(session["duration"], 300);
    assert_eq!(session["exitPage"], "/b");
    assert_eq!(session["pageViews"], 3);
}

#[tokio::test]
async fn test_concurrent_first_views_create_one_session() {
    let server = spawn_server().await;

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = server.client.clone();
        let url = server.url("/v1/pageviews");
        handles.push(tokio::spawn(async move {
            client
                .post(url)
                .json(&view("race", &format!("/p{i}"), "2024-03-01T10:00:00Z"))
                .send()
                .await
                .unwrap()
                .status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), 200);
    }

    assert_eq!(
        server
            .count("SELECT COUNT(*) FROM visitor_sessions WHERE session_id = 'race'")
            .await,
        1
    );
    assert_eq!(
        server
            .count("SELECT page_views FROM visitor_sessions WHERE session_id = 'race'")
            .await,
        10
    );
    assert_eq!(
        server
            .count("SELECT COUNT(*) FROM page_views WHERE session_id = 'race'")
            .await,
        10
    );
}

#[tokio::test]
async fn test_batch_reports_per_event_errors() {
    let server = spawn_server().await;

    let resp = server
        .post(
            "/v1/pageviews/batch",
            json!({
                "events": [
                    view("b1", "/a", "2024-03-01T10:00:00Z"),
                    { "visitorId": "v1", "sessionId": "b1", "path": "/x" },
                    view("b1", "/b", "2024-03-01T10:00:10Z"),
                ]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], 2);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["index"], 1);
    assert_eq!(errors[0]["reason"], "validation");
}

#[tokio::test]
async fn test_batch_over_limit_is_rejected() {
    let server = spawn_server().await;
    let events: Vec<Value> = (0..51)
        .map(|i| view(&format!("s{i}"), "/", "2024-03-01T10:00:00Z"))
        .collect();
    let resp = server
        .post("/v1/pageviews/batch", json!({ "events": events }))
        .await;
    assert_eq!(resp.status(), 400);
    assert_eq!(server.count("SELECT COUNT(*) FROM page_views").await, 0);
}

#[tokio::test]
async fn test_engagement_update() {
    let server = spawn_server().await;

    let body: Value = server
        .post("/v1/pageviews", view("s1", "/a", "2024-03-01T10:00:00Z"))
        .await
        .json()
        .await
        .unwrap();
    let id = body["pageViewId"].as_i64().unwrap();

    let resp = server
        .post(
            &format!("/v1/pageviews/{id}/engagement"),
            json!({ "scrollDepth": 150 }),
        )
        .await;
    assert_eq!(resp.status(), 400);

    let resp = server
        .post(
            &format!("/v1/pageviews/{id}/engagement"),
            json!({ "timeOnPage": 42.5, "scrollDepth": 75 }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let detail = session_detail(&server, "s1").await;
    let pv = &detail["pageViews"][0];
    assert_eq!(pv["timeOnPage"], 42.5);
    assert_eq!(pv["scrollDepth"], 75.0);

    let resp = server
        .post("/v1/pageviews/999999/engagement", json!({ "timeOnPage": 1 }))
        .await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_end_session_marks_one_exit_view() {
    let server = spawn_server().await;

    server
        .post("/v1/pageviews", view("s1", "/a", "2024-03-01T10:00:00Z"))
        .await;
    server
        .post("/v1/pageviews", view("s1", "/b", "2024-03-01T10:00:20Z"))
        .await;

    let resp = server
        .post(
            "/v1/sessions/s1/end",
            json!({ "timestamp": "2024-03-01T10:01:00Z" }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let session: Value = resp.json().await.unwrap();
    assert_eq!(session["isActive"], false);
    assert_eq!(session["duration"], 60);
    assert_eq!(session["exitPage"], "/b");

    let detail = session_detail(&server, "s1").await;
    let exits: Vec<&Value> = detail["pageViews"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|pv| pv["exitPage"] == true)
        .collect();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0]["path"], "/b");

    // Without a body the session closes at its last event.
    let resp = server
        .client
        .post(server.url("/v1/sessions/s1/end"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server.post("/v1/sessions/unknown/end", json!({})).await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_source_attribution() {
    let server = spawn_server().await;

    let mut paid = view("paid", "/landing?utm_source=google&utm_medium=cpc", "2024-03-01T10:00:00Z");
    paid["sessionReferrer"] = json!("https://www.google.com/");
    server.post("/v1/pageviews", paid).await;

    let mut organic = view("organic", "/post", "2024-03-01T10:00:00Z");
    organic["sessionReferrer"] = json!("https://www.google.com/");
    server.post("/v1/pageviews", organic).await;

    let mut own = view("own", "/post", "2024-03-01T10:00:00Z");
    own["sessionReferrer"] = json!("https://blog.example.com/previous");
    server.post("/v1/pageviews", own).await;

    server
        .post("/v1/pageviews", view("direct", "/", "2024-03-01T10:00:00Z"))
        .await;

    for (session, expected) in [
        ("paid", "paid"),
        ("organic", "organic"),
        ("own", "direct"),
        ("direct", "direct"),
    ] {
        let detail = session_detail(&server, session).await;
        assert_eq!(detail["session"]["source"], expected, "session {session}");
    }

    let detail = session_detail(&server, "paid").await;
    assert_eq!(detail["session"]["utmCampaign"], Value::Null);
    assert_eq!(detail["session"]["utmMedium"], "cpc");
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let server = spawn_server().await;

    let resp = server.client.get(server.url("/v1/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .get(server.url("/v1/stats"))
        .bearer_auth("wrong-token-wrong-token-wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "unauthorized");

    let resp = server.admin_get("/v1/sessions").await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_list_sessions_filters() {
    let server = spawn_server().await;

    server
        .post("/v1/pageviews", view("s1", "/a", "2024-03-01T10:00:00Z"))
        .await;
    server
        .post("/v1/pageviews", view("s2", "/a", "2024-03-01T11:00:00Z"))
        .await;
    server.post("/v1/sessions/s1/end", json!({})).await;

    let sessions: Vec<Value> = server
        .admin_get("/v1/sessions")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["sessionId"], "s2");
    assert_eq!(sessions[1]["isNewVisitor"], true);
    assert_eq!(sessions[0]["isNewVisitor"], false);

    let active: Vec<Value> = server
        .admin_get("/v1/sessions?active=true")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["sessionId"], "s2");

    let resp = server.admin_get("/v1/sessions?source=carrier-pigeon").await;
    assert_eq!(resp.status(), 400);

    let resp = server.admin_get("/v1/sessions/nope").await;
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_stats_overview() {
    let server = spawn_server().await;

    let now = chrono::Utc::now();
    let t0 = (now - chrono::Duration::minutes(10)).to_rfc3339();
    let t1 = (now - chrono::Duration::minutes(9)).to_rfc3339();

    server.post("/v1/pageviews", view("s1", "/a", &t0)).await;
    server.post("/v1/pageviews", view("s1", "/b", &t1)).await;
    server.post("/v1/pageviews", view("s2", "/a", &t0)).await;

    let resp = server.admin_get("/v1/stats?hours=1").await;
    assert_eq!(resp.status(), 200);
    let stats: Value = resp.json().await.unwrap();
    assert_eq!(stats["hours"], 1);
    assert_eq!(stats["sessions"], 2);
    assert_eq!(stats["pageViews"], 3);
    assert_eq!(stats["uniqueVisitors"], 1);
    assert_eq!(stats["bounceRate"], 0.5);
    assert_eq!(stats["topPages"][0]["path"], "/a");
}
