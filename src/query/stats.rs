//! Aggregate overview of sessions and page views over a recent window.

use crate::types::{LabelCount, PathCount, StatsResponse};
use rusqlite::{params, Connection};

const TOP_PAGES_LIMIT: i64 = 10;

/// Compute the stats overview for sessions started at or after `since_ms`.
pub fn compute(conn: &Connection, since_ms: i64, hours: i64) -> rusqlite::Result<StatsResponse> {
    let (sessions, unique_visitors, new_visitors, bounced, avg_duration): (
        i64,
        i64,
        i64,
        i64,
        f64,
    ) = conn.query_row(
        "SELECT COUNT(*),
                COUNT(DISTINCT visitor_id),
                COALESCE(SUM(is_new_visitor), 0),
                COALESCE(SUM(bounced), 0),
                COALESCE(AVG(duration), 0.0)
         FROM visitor_sessions
         WHERE start_time >= ?1",
        params![since_ms],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
    )?;

    let page_views: i64 = conn.query_row(
        "SELECT COUNT(*) FROM page_views WHERE timestamp >= ?1",
        params![since_ms],
        |row| row.get(0),
    )?;

    let active_sessions: i64 = conn.query_row(
        "SELECT COUNT(*) FROM visitor_sessions WHERE is_active = 1",
        [],
        |row| row.get(0),
    )?;

    let top_pages = {
        let mut stmt = conn.prepare(
            "SELECT path, COUNT(*) AS views FROM page_views
             WHERE timestamp >= ?1
             GROUP BY path
             ORDER BY views DESC, path ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since_ms, TOP_PAGES_LIMIT], |row| {
            Ok(PathCount {
                path: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let sources = breakdown(
        conn,
        "SELECT source, COUNT(*) AS n FROM visitor_sessions
         WHERE start_time >= ?1
         GROUP BY source ORDER BY n DESC, source ASC",
        since_ms,
    )?;

    let devices = breakdown(
        conn,
        "SELECT COALESCE(device_type, 'unknown') AS d, COUNT(*) AS n FROM visitor_sessions
         WHERE start_time >= ?1
         GROUP BY d ORDER BY n DESC, d ASC",
        since_ms,
    )?;

    let bounce_rate = if sessions > 0 {
        bounced as f64 / sessions as f64
    } else {
        0.0
    };

    Ok(StatsResponse {
        hours,
        sessions,
        page_views,
        unique_visitors,
        new_visitors,
        active_sessions,
        bounce_rate,
        avg_duration_secs: avg_duration,
        top_pages,
        sources,
        devices,
    })
}

fn breakdown(conn: &Connection, sql: &str, since_ms: i64) -> rusqlite::Result<Vec<LabelCount>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![since_ms], |row| {
        Ok(LabelCount {
            label: row.get(0)?,
            count: row.get(1)?,
        })
    })?;
    rows.collect()
}
