//! Session tracking: decides per page view whether to open a new visitor
//! session or extend an existing one, and keeps session aggregates in step
//! with the page-view rows.
//!
//! Every operation runs in a single `BEGIN IMMEDIATE` transaction, so the
//! session upsert and the page-view insert commit together or not at all.

use crate::error::{AppError, AppResult};
use crate::storage::{page_views, sessions, sqlite};
use crate::types::{EngagementUpdate, PageView, RecordOutcome, TrackedEvent, VisitorSession};
use deadpool_sqlite::Pool;
use rusqlite::{Connection, TransactionBehavior};
use std::time::Duration;

/// Sessions closed per transaction by the idle sweep.
const SWEEP_BATCH: i64 = 500;

/// Entry point for all session writes. Holds the injected connection pool.
#[derive(Clone)]
pub struct SessionTracker {
    pool: Pool,
}

impl SessionTracker {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Record one page view, creating or extending its session.
    pub async fn record_page_view(&self, event: TrackedEvent) -> AppResult<RecordOutcome> {
        let outcome = sqlite::interact(&self.pool, move |conn| record_in_tx(conn, &event)).await?;

        tracing::debug!(
            session_id = %outcome.session_id,
            page_view_id = outcome.page_view_id,
            new_session = outcome.is_new_session,
            page_views = outcome.page_views,
            "recorded page view"
        );
        Ok(outcome)
    }

    /// Apply late-arriving engagement data to a page view.
    pub async fn update_engagement(
        &self,
        page_view_id: i64,
        update: EngagementUpdate,
    ) -> AppResult<PageView> {
        sqlite::interact(&self.pool, move |conn| {
            engagement_in_tx(conn, page_view_id, &update)
        })
        .await
    }

    /// Close a session on an explicit leave signal.
    pub async fn end_session(&self, session_id: String, at: Option<i64>) -> AppResult<VisitorSession> {
        let closed = sqlite::interact(&self.pool, move |conn| end_in_tx(conn, &session_id, at)).await?;
        tracing::debug!(
            session_id = %closed.session_id,
            page_views = closed.page_views,
            duration = closed.duration,
            "session ended"
        );
        Ok(closed)
    }

    /// Close every active session with no event for `idle_timeout` before `now_ms`.
    pub async fn close_idle_sessions(&self, idle_timeout: Duration, now_ms: i64) -> AppResult<usize> {
        let cutoff = now_ms - idle_timeout.as_millis() as i64;
        let mut total = 0usize;

        loop {
            let closed = sqlite::interact(&self.pool, move |conn| sweep_in_tx(conn, cutoff)).await?;
            total += closed;
            if (closed as i64) < SWEEP_BATCH {
                break;
            }
        }

        Ok(total)
    }
}

fn begin(conn: &mut Connection) -> rusqlite::Result<rusqlite::Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

pub fn record_in_tx(conn: &mut Connection, event: &TrackedEvent) -> AppResult<RecordOutcome> {
    let tx = begin(conn)?;
    let outcome = record(&tx, event)?;
    tx.commit()?;
    Ok(outcome)
}

fn record(conn: &Connection, event: &TrackedEvent) -> AppResult<RecordOutcome> {
    let (session_ref, is_new_session, is_new_visitor) =
        match sessions::find_by_session_id(conn, &event.session_id)? {
            Some(existing) => {
                sessions::apply_view(conn, existing.id, event.timestamp, &event.path)?;
                (existing.id, false, existing.is_new_visitor)
            }
            None => open_session(conn, event)?,
        };

    let page_view_id = page_views::insert(conn, session_ref, event)?;
    if !is_new_session {
        page_views::clear_stale_exit(conn, session_ref)?;
    }

    let session = sessions::find_by_id(conn, session_ref)?.ok_or_else(|| {
        AppError::Internal(format!("session row {session_ref} missing after write"))
    })?;

    Ok(RecordOutcome {
        session_id: session.session_id,
        page_view_id,
        is_new_session,
        is_new_visitor,
        page_views: session.page_views,
    })
}

/// Insert a new session. When the insert loses a uniqueness race, the view
/// is applied to the winning row instead.
///
/// Returns `(session_ref, is_new_session, is_new_visitor)`.
fn open_session(conn: &Connection, event: &TrackedEvent) -> AppResult<(i64, bool, bool)> {
    let is_new_visitor =
        !sessions::visitor_seen_before(conn, &event.visitor_id, &event.session_id)?;

    match sessions::insert(conn, event, is_new_visitor) {
        Ok(id) => Ok((id, true, is_new_visitor)),
        Err(e) if sessions::is_unique_violation(&e) => {
            tracing::debug!(
                session_id = %event.session_id,
                "session created concurrently, extending existing row"
            );
            let existing = sessions::find_by_session_id(conn, &event.session_id)?.ok_or_else(|| {
                AppError::Conflict(format!(
                    "session {} conflicted on insert but is not readable",
                    event.session_id
                ))
            })?;
            sessions::apply_view(conn, existing.id, event.timestamp, &event.path)?;
            Ok((existing.id, false, existing.is_new_visitor))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn engagement_in_tx(
    conn: &mut Connection,
    page_view_id: i64,
    update: &EngagementUpdate,
) -> AppResult<PageView> {
    let tx = begin(conn)?;

    let view = page_views::find(&tx, page_view_id)?
        .ok_or_else(|| AppError::NotFound(format!("page view {page_view_id}")))?;

    // Only the most recent view of a session can become its exit page.
    let is_latest = match view.session_ref {
        Some(session_ref) => page_views::latest_id(&tx, session_ref)? == Some(page_view_id),
        None => true,
    };
    let mut update = update.clone();
    if update.exit_page == Some(true) && !is_latest {
        tracing::debug!(page_view_id, "ignoring exit flag on a superseded page view");
        update.exit_page = None;
    }

    page_views::update_engagement(&tx, page_view_id, &update)?;

    if update.exit_page == Some(true) {
        if let Some(session_ref) = view.session_ref {
            page_views::mark_exit(&tx, session_ref, page_view_id)?;
            sessions::set_exit_page(&tx, session_ref, &view.path)?;
        }
    }

    let updated = page_views::find(&tx, page_view_id)?
        .ok_or_else(|| AppError::Internal(format!("page view {page_view_id} missing after update")))?;

    tx.commit()?;
    Ok(updated)
}

pub fn end_in_tx(conn: &mut Connection, session_id: &str, at: Option<i64>) -> AppResult<VisitorSession> {
    let tx = begin(conn)?;

    let session = sessions::find_by_session_id(&tx, session_id)?
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;

    close(&tx, session.id, at)?;

    let closed = sessions::find_by_id(&tx, session.id)?
        .ok_or_else(|| AppError::Internal(format!("session {session_id} missing after close")))?;

    tx.commit()?;
    Ok(closed)
}

fn sweep_in_tx(conn: &mut Connection, cutoff_ms: i64) -> AppResult<usize> {
    let tx = begin(conn)?;
    let ids = sessions::idle_before(&tx, cutoff_ms, SWEEP_BATCH)?;
    for &id in &ids {
        close(&tx, id, None)?;
    }
    tx.commit()?;
    Ok(ids.len())
}

fn close(conn: &Connection, session_ref: i64, at: Option<i64>) -> rusqlite::Result<()> {
    page_views::mark_latest_exit(conn, session_ref)?;
    sessions::finalize(conn, session_ref, at)
}
