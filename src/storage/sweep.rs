use crate::tracker::SessionTracker;
use std::time::Duration;
use tokio::time;

/// Background task that closes sessions with no activity for `idle_timeout_secs`.
pub async fn session_sweep_loop(tracker: SessionTracker, idle_timeout_secs: u64, interval_secs: u64) {
    let idle_timeout = Duration::from_secs(idle_timeout_secs);
    let mut interval = time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        let now_ms = chrono::Utc::now().timestamp_millis();
        match tracker.close_idle_sessions(idle_timeout, now_ms).await {
            Ok(closed) if closed > 0 => {
                tracing::info!(closed, "closed idle sessions");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "session sweep failed"),
        }
    }
}
