//! In-memory request/error counters, drained periodically by the flusher
//!
//! Increments happen on the request path and must never block on I/O, so the
//! aggregator is a plain mutex around plain maps. The flusher swaps the
//! window out and publishes it; a failed publish merges the window back so
//! delivery stays at-least-once.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Unique-user sets stop growing past this; the window is marked sampled
const MAX_TRACKED_USERS: usize = 10_000;

/// Counters for one target within the current flush window
#[derive(Debug, Default, Clone)]
pub struct TargetWindow {
    pub requests: u64,
    pub errors: u64,
    pub users: HashSet<String>,
    pub users_sampled: bool,
    pub latency_ms_sum: f64,
    pub latency_samples: u64,
}

impl TargetWindow {
    fn track_user(&mut self, user_id: &str) {
        if user_id.is_empty() {
            return;
        }
        if self.users.len() >= MAX_TRACKED_USERS {
            self.users_sampled = true;
            return;
        }
        if !self.users.contains(user_id) {
            self.users.insert(user_id.to_string());
        }
    }

    fn merge(&mut self, other: TargetWindow) {
        self.requests += other.requests;
        self.errors += other.errors;
        self.users_sampled |= other.users_sampled;
        for user in other.users {
            if self.users.len() >= MAX_TRACKED_USERS {
                self.users_sampled = true;
                break;
            }
            self.users.insert(user);
        }
        self.latency_ms_sum += other.latency_ms_sum;
        self.latency_samples += other.latency_samples;
    }
}

/// One flush window of a proxy's counters
#[derive(Debug, Default, Clone)]
pub struct StatsWindow {
    pub per_target: HashMap<String, TargetWindow>,
    /// Errors that happened before a target was known
    pub proxy_errors: u64,
    /// Users attributed to those errors (empty user IDs are dropped)
    pub error_users: HashSet<String>,
}

impl StatsWindow {
    pub fn is_empty(&self) -> bool {
        self.per_target.is_empty() && self.proxy_errors == 0
    }

    fn merge(&mut self, other: StatsWindow) {
        for (target_id, window) in other.per_target {
            self.per_target.entry(target_id).or_default().merge(window);
        }
        self.proxy_errors += other.proxy_errors;
        self.error_users.extend(other.error_users);
    }
}

/// Per-proxy stats aggregator
#[derive(Debug)]
pub struct ProxyStats {
    proxy_id: String,
    window: Mutex<StatsWindow>,
}

impl ProxyStats {
    pub fn new(proxy_id: &str) -> Self {
        Self {
            proxy_id: proxy_id.to_string(),
            window: Mutex::new(StatsWindow::default()),
        }
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    /// Count one routed request against (target, user)
    pub fn record_request(&self, target_id: &str, user_id: &str) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let target = window.per_target.entry(target_id.to_string()).or_default();
        target.requests += 1;
        target.track_user(user_id);
    }

    /// Count one failed request. `target_id` is `None` when the failure
    /// happened before a target was selected.
    pub fn record_error(&self, target_id: Option<&str>, user_id: &str) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        match target_id {
            Some(target_id) => {
                let target = window.per_target.entry(target_id.to_string()).or_default();
                target.errors += 1;
                target.track_user(user_id);
            }
            None => {
                window.proxy_errors += 1;
                if !user_id.is_empty() && window.error_users.len() < MAX_TRACKED_USERS {
                    window.error_users.insert(user_id.to_string());
                }
            }
        }
    }

    /// Record how long the selection-and-redirect path took for a target
    pub fn observe_latency(&self, target_id: &str, elapsed: Duration) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let target = window.per_target.entry(target_id.to_string()).or_default();
        target.latency_ms_sum += elapsed.as_secs_f64() * 1000.0;
        target.latency_samples += 1;
    }

    /// Swap the current window out, leaving an empty one behind
    pub fn drain(&self) -> StatsWindow {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *window)
    }

    /// Return a drained window that could not be delivered
    pub fn restore(&self, undelivered: StatsWindow) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.merge(undelivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_requests_and_unique_users() {
        let stats = ProxyStats::new("p1");
        stats.record_request("t1", "u1");
        stats.record_request("t1", "u1");
        stats.record_request("t1", "u2");
        stats.record_request("t2", "u1");

        let window = stats.drain();
        assert_eq!(window.per_target["t1"].requests, 3);
        assert_eq!(window.per_target["t1"].users.len(), 2);
        assert_eq!(window.per_target["t2"].requests, 1);

        // Draining leaves an empty window behind
        assert!(stats.drain().is_empty());
    }

    #[test]
    fn proxy_level_errors_keep_empty_user_attribution() {
        let stats = ProxyStats::new("p1");
        stats.record_error(None, "");
        stats.record_error(None, "ruid-1");
        stats.record_error(Some("t1"), "ruid-1");

        let window = stats.drain();
        assert_eq!(window.proxy_errors, 2);
        assert_eq!(window.error_users.len(), 1);
        assert_eq!(window.per_target["t1"].errors, 1);
    }

    #[test]
    fn restore_merges_back_for_redelivery() {
        let stats = ProxyStats::new("p1");
        stats.record_request("t1", "u1");

        let undelivered = stats.drain();
        stats.record_request("t1", "u2");
        stats.restore(undelivered);

        let window = stats.drain();
        assert_eq!(window.per_target["t1"].requests, 2);
        assert_eq!(window.per_target["t1"].users.len(), 2);
    }

    #[test]
    fn latency_accumulates_per_target() {
        let stats = ProxyStats::new("p1");
        stats.observe_latency("t1", Duration::from_millis(2));
        stats.observe_latency("t1", Duration::from_millis(4));

        let window = stats.drain();
        assert_eq!(window.per_target["t1"].latency_samples, 2);
        assert!((window.per_target["t1"].latency_ms_sum - 6.0).abs() < 1e-6);
    }
}
