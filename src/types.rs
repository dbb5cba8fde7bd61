use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::attribution::UtmParams;
use crate::client_info::ClientInfo;

/// Traffic source attributed to a session's first view.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrafficSource {
    Direct,
    Organic,
    Social,
    Referral,
    Email,
    Paid,
}

impl TrafficSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficSource::Direct => "direct",
            TrafficSource::Organic => "organic",
            TrafficSource::Social => "social",
            TrafficSource::Referral => "referral",
            TrafficSource::Email => "email",
            TrafficSource::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(TrafficSource::Direct),
            "organic" => Some(TrafficSource::Organic),
            "social" => Some(TrafficSource::Social),
            "referral" => Some(TrafficSource::Referral),
            "email" => Some(TrafficSource::Email),
            "paid" => Some(TrafficSource::Paid),
            _ => None,
        }
    }
}

impl std::fmt::Display for TrafficSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    Bot,
    Other,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Bot => "bot",
            DeviceType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "desktop" => Some(DeviceType::Desktop),
            "mobile" => Some(DeviceType::Mobile),
            "tablet" => Some(DeviceType::Tablet),
            "bot" => Some(DeviceType::Bot),
            "other" => Some(DeviceType::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Page-view event as posted by the tracking snippet.
///
/// The four identity fields are optional here so that a missing one can be
/// reported by name instead of as a generic JSON rejection.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewEvent {
    pub visitor_id: Option<String>,
    pub session_id: Option<String>,
    pub path: Option<String>,
    /// ISO-8601 / RFC 3339 timestamp of the page load.
    pub timestamp: Option<String>,

    pub title: Option<String>,
    /// In-site previous path.
    pub referrer: Option<String>,
    /// External referrer URL (document.referrer on the entry page).
    pub session_referrer: Option<String>,

    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub source: Option<String>,

    pub device_type: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,

    pub user_id: Option<String>,
    pub post_id: Option<String>,
    pub category_id: Option<String>,

    pub time_on_page: Option<f64>,
    pub scroll_depth: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
}

/// A validated, enriched event ready for the tracker.
#[derive(Debug, Clone)]
pub struct TrackedEvent {
    pub visitor_id: String,
    pub session_id: String,
    pub path: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub title: Option<String>,
    pub referrer: Option<String>,
    pub session_referrer: Option<String>,
    pub utm: UtmParams,
    pub source: TrafficSource,
    pub client: ClientInfo,
    pub geo: GeoInfo,
    pub user_id: Option<String>,
    pub post_id: Option<String>,
    pub category_id: Option<String>,
    pub time_on_page: Option<f64>,
    pub scroll_depth: Option<f64>,
}

/// Persisted visitor session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorSession {
    pub id: i64,
    pub visitor_id: String,
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds between start and end.
    pub duration: i64,
    pub page_views: i64,
    pub bounced: bool,
    pub is_active: bool,
    pub is_new_visitor: bool,
    pub source: TrafficSource,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub entry_page: String,
    pub exit_page: Option<String>,
    pub device_type: Option<DeviceType>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub user_id: Option<String>,
}

/// Persisted page view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageView {
    pub id: i64,
    pub session_ref: Option<i64>,
    pub visitor_id: String,
    pub session_id: String,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub post_id: Option<String>,
    pub category_id: Option<String>,
    pub title: Option<String>,
    pub referrer: Option<String>,
    pub time_on_page: Option<f64>,
    pub scroll_depth: Option<f64>,
    pub exit_page: bool,
}

/// Result of recording one page view.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecordOutcome {
    pub session_id: String,
    pub page_view_id: i64,
    pub is_new_session: bool,
    pub is_new_visitor: bool,
    pub page_views: i64,
}

/// Late engagement data for an existing page view.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementUpdate {
    pub time_on_page: Option<f64>,
    pub scroll_depth: Option<f64>,
    pub exit_page: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRequest {
    pub timestamp: Option<String>,
}

/// Query filters for listing sessions.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQueryParams {
    pub visitor_id: Option<String>,
    pub source: Option<String>,
    pub active: Option<bool>,
    /// Unix milliseconds, inclusive lower bound on start time.
    pub since: Option<i64>,
    /// Unix milliseconds, inclusive upper bound on start time.
    pub until: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl SessionQueryParams {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 200)
    }
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsQueryParams {
    pub hours: Option<i64>,
}

impl StatsQueryParams {
    pub fn hours(&self) -> i64 {
        self.hours.unwrap_or(24).clamp(1, 8760)
    }
}

/// Aggregate overview returned by the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub hours: i64,
    pub sessions: i64,
    pub page_views: i64,
    pub unique_visitors: i64,
    pub new_visitors: i64,
    pub active_sessions: i64,
    /// Fraction of sessions in the window with exactly one view.
    pub bounce_rate: f64,
    pub avg_duration_secs: f64,
    pub top_pages: Vec<PathCount>,
    pub sources: Vec<LabelCount>,
    pub devices: Vec<LabelCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathCount {
    pub path: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelCount {
    pub label: String,
    pub count: i64,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub db_ok: bool,
}

/// Parse an ISO-8601 timestamp into Unix milliseconds.
pub fn parse_timestamp(value: &str) -> Result<i64, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|e| format!("timestamp '{value}' is not a valid ISO-8601 datetime: {e}"))
}

/// Convert stored Unix milliseconds back into a UTC datetime.
pub fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_with_offset() {
        let ms = parse_timestamp("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(ms, parse_timestamp("2024-03-01T10:00:00Z").unwrap());
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn test_millis_roundtrip() {
        let ms = parse_timestamp("2024-03-01T10:00:00.250Z").unwrap();
        assert_eq!(millis_to_datetime(ms).timestamp_millis(), ms);
    }

    #[test]
    fn test_source_parse_is_lenient_on_case() {
        assert_eq!(TrafficSource::parse("Organic"), Some(TrafficSource::Organic));
        assert_eq!(TrafficSource::parse("carrier-pigeon"), None);
    }

    #[test]
    fn test_event_uses_camel_case() {
        let json = serde_json::json!({
            "visitorId": "v1",
            "sessionId": "s1",
            "path": "/a",
            "timestamp": "2024-03-01T10:00:00Z",
            "scrollDepth": 40.0,
        });
        let event: PageViewEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.visitor_id.as_deref(), Some("v1"));
        assert_eq!(event.session_id.as_deref(), Some("s1"));
        assert_eq!(event.scroll_depth, Some(40.0));
    }

    #[test]
    fn test_session_query_limits_are_clamped() {
        let params = SessionQueryParams {
            limit: Some(10_000),
            offset: Some(-5),
            ..Default::default()
        };
        assert_eq!(params.limit(), 200);
        assert_eq!(params.offset(), 0);
    }
}
