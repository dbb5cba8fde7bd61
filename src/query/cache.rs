use crate::types::StatsResponse;
use moka::sync::Cache;
use std::time::Duration;

/// TTL cache for stats overviews, keyed on the window size in hours.
pub struct StatsCache {
    inner: Cache<i64, StatsResponse>,
}

impl StatsCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Cache::builder()
                .time_to_live(Duration::from_secs(ttl_secs))
                .max_capacity(64)
                .build(),
        }
    }

    pub fn get(&self, hours: i64) -> Option<StatsResponse> {
        self.inner.get(&hours)
    }

    pub fn insert(&self, hours: i64, value: StatsResponse) {
        self.inner.insert(hours, value);
    }
}
