//! Typed data access for the `page_views` table.

use crate::types::{millis_to_datetime, EngagementUpdate, PageView, TrackedEvent};
use rusqlite::{params, Connection, OptionalExtension, Row};

const PAGE_VIEW_COLUMNS: &str = "id, session_ref, visitor_id, session_id, path, timestamp,
    user_id, post_id, category_id, title, referrer, time_on_page, scroll_depth, exit_page";

fn from_row(row: &Row<'_>) -> rusqlite::Result<PageView> {
    Ok(PageView {
        id: row.get(0)?,
        session_ref: row.get(1)?,
        visitor_id: row.get(2)?,
        session_id: row.get(3)?,
        path: row.get(4)?,
        timestamp: millis_to_datetime(row.get(5)?),
        user_id: row.get(6)?,
        post_id: row.get(7)?,
        category_id: row.get(8)?,
        title: row.get(9)?,
        referrer: row.get(10)?,
        time_on_page: row.get(11)?,
        scroll_depth: row.get(12)?,
        exit_page: row.get(13)?,
    })
}

pub fn insert(conn: &Connection, session_ref: i64, event: &TrackedEvent) -> rusqlite::Result<i64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO page_views (
            session_ref, visitor_id, session_id, path, timestamp,
            user_id, post_id, category_id, title, referrer,
            time_on_page, scroll_depth, exit_page
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)",
    )?;
    stmt.execute(params![
        session_ref,
        event.visitor_id,
        event.session_id,
        event.path,
        event.timestamp,
        event.user_id,
        event.post_id,
        event.category_id,
        event.title,
        event.referrer,
        event.time_on_page,
        event.scroll_depth,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub fn find(conn: &Connection, id: i64) -> rusqlite::Result<Option<PageView>> {
    let sql = format!("SELECT {PAGE_VIEW_COLUMNS} FROM page_views WHERE id = ?1");
    conn.query_row(&sql, params![id], from_row).optional()
}

pub fn count_for_session(conn: &Connection, session_ref: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM page_views WHERE session_ref = ?1",
        params![session_ref],
        |row| row.get(0),
    )
}

/// All views of a session in the order they happened.
pub fn list_for_session(conn: &Connection, session_ref: i64) -> rusqlite::Result<Vec<PageView>> {
    let sql = format!(
        "SELECT {PAGE_VIEW_COLUMNS} FROM page_views
         WHERE session_ref = ?1
         ORDER BY timestamp ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![session_ref], from_row)?;
    rows.collect()
}

/// Apply late engagement fields. Absent fields keep their stored value.
/// Returns the number of rows touched (0 when the id is unknown).
pub fn update_engagement(
    conn: &Connection,
    id: i64,
    update: &EngagementUpdate,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE page_views SET
            time_on_page = COALESCE(?2, time_on_page),
            scroll_depth = COALESCE(?3, scroll_depth),
            exit_page    = COALESCE(?4, exit_page)
         WHERE id = ?1",
        params![id, update.time_on_page, update.scroll_depth, update.exit_page],
    )
}

/// Make `id` the only exit view of its session.
pub fn mark_exit(conn: &Connection, session_ref: i64, id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE page_views SET exit_page = (id = ?2) WHERE session_ref = ?1",
        params![session_ref, id],
    )?;
    Ok(())
}

/// Id of the most recent view of a session, ties broken by insertion order.
pub fn latest_id(conn: &Connection, session_ref: i64) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM page_views WHERE session_ref = ?1
         ORDER BY timestamp DESC, id DESC LIMIT 1",
        params![session_ref],
        |row| row.get(0),
    )
    .optional()
}

/// Flag the most recent view of a session as its exit view.
/// Returns the id of that view, or `None` for a session without views.
pub fn mark_latest_exit(conn: &Connection, session_ref: i64) -> rusqlite::Result<Option<i64>> {
    let latest = latest_id(conn, session_ref)?;
    if let Some(id) = latest {
        mark_exit(conn, session_ref, id)?;
    }
    Ok(latest)
}

/// Drop the exit flag from every view of a session except the most recent one.
pub fn clear_stale_exit(conn: &Connection, session_ref: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE page_views SET exit_page = 0
         WHERE session_ref = ?1 AND exit_page = 1
           AND id != (SELECT id FROM page_views WHERE session_ref = ?1
                      ORDER BY timestamp DESC, id DESC LIMIT 1)",
        params![session_ref],
    )
}
