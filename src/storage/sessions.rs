//! Typed data access for the `visitor_sessions` table.
//!
//! Every function takes a plain `&Connection` so callers can compose them
//! inside one transaction (`Transaction` derefs to `Connection`).

use crate::types::{
    millis_to_datetime, DeviceType, SessionQueryParams, TrackedEvent, TrafficSource,
    VisitorSession,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

const SESSION_COLUMNS: &str = "id, visitor_id, session_id, start_time, end_time, duration,
    page_views, bounced, is_active, is_new_visitor, source, referrer,
    utm_source, utm_medium, utm_campaign, utm_term, utm_content,
    entry_page, exit_page, device_type, browser, os, user_agent, ip,
    country, city, region, user_id";

fn from_row(row: &Row<'_>) -> rusqlite::Result<VisitorSession> {
    let source: String = row.get(10)?;
    let device_type: Option<String> = row.get(19)?;
    Ok(VisitorSession {
        id: row.get(0)?,
        visitor_id: row.get(1)?,
        session_id: row.get(2)?,
        start_time: millis_to_datetime(row.get(3)?),
        end_time: millis_to_datetime(row.get(4)?),
        duration: row.get(5)?,
        page_views: row.get(6)?,
        bounced: row.get(7)?,
        is_active: row.get(8)?,
        is_new_visitor: row.get(9)?,
        source: TrafficSource::parse(&source).unwrap_or(TrafficSource::Direct),
        referrer: row.get(11)?,
        utm_source: row.get(12)?,
        utm_medium: row.get(13)?,
        utm_campaign: row.get(14)?,
        utm_term: row.get(15)?,
        utm_content: row.get(16)?,
        entry_page: row.get(17)?,
        exit_page: row.get(18)?,
        device_type: device_type.as_deref().and_then(DeviceType::parse),
        browser: row.get(20)?,
        os: row.get(21)?,
        user_agent: row.get(22)?,
        ip: row.get(23)?,
        country: row.get(24)?,
        city: row.get(25)?,
        region: row.get(26)?,
        user_id: row.get(27)?,
    })
}

/// True when the error is a UNIQUE constraint violation (a concurrent insert won).
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

pub fn find_by_session_id(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Option<VisitorSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM visitor_sessions WHERE session_id = ?1");
    conn.query_row(&sql, params![session_id], from_row).optional()
}

pub fn find_by_id(conn: &Connection, id: i64) -> rusqlite::Result<Option<VisitorSession>> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM visitor_sessions WHERE id = ?1");
    conn.query_row(&sql, params![id], from_row).optional()
}

/// Whether any session other than `session_id` exists for this visitor.
pub fn visitor_seen_before(
    conn: &Connection,
    visitor_id: &str,
    session_id: &str,
) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM visitor_sessions WHERE visitor_id = ?1 AND session_id != ?2)",
        params![visitor_id, session_id],
        |row| row.get(0),
    )
}

/// Insert a fresh session for the event's first view. Fails with a UNIQUE
/// violation if the session id already exists.
pub fn insert(conn: &Connection, event: &TrackedEvent, is_new_visitor: bool) -> rusqlite::Result<i64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO visitor_sessions (
            visitor_id, session_id, start_time, end_time, duration,
            page_views, bounced, is_active, is_new_visitor, source, referrer,
            utm_source, utm_medium, utm_campaign, utm_term, utm_content,
            entry_page, exit_page, device_type, browser, os, user_agent, ip,
            country, city, region, user_id
        ) VALUES (?1, ?2, ?3, ?3, 0, 1, 1, 1, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                  ?12, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
    )?;
    stmt.execute(params![
        event.visitor_id,
        event.session_id,
        event.timestamp,
        is_new_visitor,
        event.source.as_str(),
        event.session_referrer,
        event.utm.source,
        event.utm.medium,
        event.utm.campaign,
        event.utm.term,
        event.utm.content,
        event.path,
        event.client.device_type.map(|d| d.as_str()),
        event.client.browser,
        event.client.os,
        event.client.user_agent,
        event.client.ip,
        event.geo.country,
        event.geo.city,
        event.geo.region,
        event.user_id,
    ])?;
    Ok(conn.last_insert_rowid())
}

/// Extend a session with one more view.
///
/// `end_time` only moves forward, so `duration` never shrinks when events
/// arrive out of order; the exit page follows the newest view. `bounced` is
/// recomputed from the new count. A late view re-opens a swept session.
pub fn apply_view(conn: &Connection, id: i64, timestamp: i64, path: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE visitor_sessions SET
            page_views = page_views + 1,
            bounced    = (page_views + 1) = 1,
            exit_page  = CASE WHEN ?2 >= end_time THEN ?3 ELSE exit_page END,
            end_time   = MAX(end_time, ?2),
            duration   = MAX(duration, (MAX(end_time, ?2) - start_time) / 1000),
            is_active  = 1
         WHERE id = ?1",
    )?;
    stmt.execute(params![id, timestamp, path])?;
    Ok(())
}

/// Close a session and reconcile its aggregates against its page-view rows.
///
/// `page_views`, `bounced` and `exit_page` are recomputed from the rows
/// rather than trusted, which also repairs counters after replayed events.
pub fn finalize(conn: &Connection, id: i64, at: Option<i64>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE visitor_sessions SET
            is_active  = 0,
            end_time   = MAX(end_time, COALESCE(?2, end_time)),
            duration   = MAX(duration, (MAX(end_time, COALESCE(?2, end_time)) - start_time) / 1000),
            page_views = (SELECT COUNT(*) FROM page_views WHERE session_ref = ?1),
            bounced    = (SELECT COUNT(*) FROM page_views WHERE session_ref = ?1) = 1,
            exit_page  = COALESCE(
                (SELECT path FROM page_views WHERE session_ref = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1),
                exit_page)
         WHERE id = ?1",
        params![id, at],
    )?;
    Ok(())
}

pub fn set_exit_page(conn: &Connection, id: i64, path: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE visitor_sessions SET exit_page = ?2 WHERE id = ?1",
        params![id, path],
    )?;
    Ok(())
}

/// Row ids of active sessions whose last event is older than `cutoff_ms`.
pub fn idle_before(conn: &Connection, cutoff_ms: i64, limit: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM visitor_sessions
         WHERE is_active = 1 AND end_time < ?1
         ORDER BY end_time ASC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![cutoff_ms, limit], |row| row.get(0))?;
    rows.collect()
}

/// List sessions, newest first.
pub fn list(conn: &Connection, params: &SessionQueryParams) -> rusqlite::Result<Vec<VisitorSession>> {
    let mut sql = format!("SELECT {SESSION_COLUMNS} FROM visitor_sessions WHERE 1=1");
    let mut bind_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(ref visitor_id) = params.visitor_id {
        sql.push_str(&format!(" AND visitor_id = ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(visitor_id.clone()));
    }
    if let Some(ref source) = params.source {
        sql.push_str(&format!(" AND source = ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(source.to_ascii_lowercase()));
    }
    if let Some(active) = params.active {
        sql.push_str(&format!(" AND is_active = ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(active));
    }
    if let Some(since) = params.since {
        sql.push_str(&format!(" AND start_time >= ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(since));
    }
    if let Some(until) = params.until {
        sql.push_str(&format!(" AND start_time <= ?{}", bind_values.len() + 1));
        bind_values.push(Box::new(until));
    }

    sql.push_str(&format!(
        " ORDER BY start_time DESC, id DESC LIMIT ?{} OFFSET ?{}",
        bind_values.len() + 1,
        bind_values.len() + 2
    ));
    bind_values.push(Box::new(params.limit()));
    bind_values.push(Box::new(params.offset()));

    let params_ref: Vec<&dyn rusqlite::types::ToSql> =
        bind_values.iter().map(|b| b.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_ref.as_slice(), from_row)?;
    rows.collect()
}
