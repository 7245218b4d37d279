use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// In-process sliding-window rate limiter keyed by client identifier
/// (IP or `client_id`). Replaces the Valkey `INCR`+`EXPIRE` limiter the
/// wider stack uses with an equivalent in-memory structure, since this
/// service's Store is itself in-memory.
pub struct RateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self { per_minute, windows: Mutex::new(HashMap::new()) }
    }

    /// Record a request attempt for `key`; returns `true` if it is
    /// within the limit, `false` if the caller should be rejected.
    pub fn check(&self, key: &str) -> bool {
        let now = Utc::now();
        let window_start = now - Duration::minutes(1);
        let mut windows = self.windows.lock().unwrap();
        let entries = windows.entry(key.to_owned()).or_default();
        entries.retain(|ts| *ts > window_start);
        if entries.len() as u32 >= self.per_minute {
            return false;
        }
        entries.push(now);
        true
    }
}
