//! Dynamic tool enablement and usage statistics.
//!
//! This is the runtime layer of tool enablement. The gateway combines it with
//! the persisted disabled-tools list: a tool is usable only when neither layer
//! blocks it.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// Per-tool call statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsageStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: u64,
    pub last_duration_ms: u64,
    /// Milliseconds since the Unix epoch
    pub last_used_at: Option<i64>,
}

impl ToolUsageStats {
    pub fn calls(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn average_duration_ms(&self) -> u64 {
        match self.calls() {
            0 => 0,
            n => self.total_duration_ms / n,
        }
    }
}

#[derive(Default)]
struct Inner {
    disabled: HashSet<String>,
    disabled_until: HashMap<String, Instant>,
    stats: HashMap<String, ToolUsageStats>,
}

/// Runtime enable/disable state with time-boxed disables.
#[derive(Default)]
pub struct ToolEnablement {
    inner: Mutex<Inner>,
}

impl ToolEnablement {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_enabled(&self, tool: &str, enabled: bool) {
        let mut inner = self.lock();
        if enabled {
            inner.disabled.remove(tool);
            inner.disabled_until.remove(tool);
        } else {
            inner.disabled.insert(tool.to_string());
        }
    }

    /// Disable a tool until `duration` has passed. Expires on its own.
    pub fn disable_for(&self, tool: &str, duration: Duration) {
        info!(tool = %tool, secs = duration.as_secs(), "Tool temporarily disabled");
        self.lock()
            .disabled_until
            .insert(tool.to_string(), Instant::now() + duration);
    }

    pub fn is_enabled(&self, tool: &str) -> bool {
        let mut inner = self.lock();
        if inner.disabled.contains(tool) {
            return false;
        }
        match inner.disabled_until.get(tool) {
            Some(until) if Instant::now() < *until => false,
            Some(_) => {
                inner.disabled_until.remove(tool);
                true
            }
            None => true,
        }
    }

    pub fn record(&self, tool: &str, success: bool, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let mut inner = self.lock();
        let stats = inner.stats.entry(tool.to_string()).or_default();
        if success {
            stats.success_count += 1;
        } else {
            stats.failure_count += 1;
        }
        stats.total_duration_ms += ms;
        stats.last_duration_ms = ms;
        stats.last_used_at = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn stats(&self, tool: &str) -> Option<ToolUsageStats> {
        self.lock().stats.get(tool).cloned()
    }

    pub fn all_stats(&self) -> HashMap<String, ToolUsageStats> {
        self.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable() {
        let e = ToolEnablement::new();
        assert!(e.is_enabled("a:b"));
        e.set_enabled("a:b", false);
        assert!(!e.is_enabled("a:b"));
        e.set_enabled("a:b", true);
        assert!(e.is_enabled("a:b"));
    }

    #[test]
    fn test_temporary_disable_expires() {
        let e = ToolEnablement::new();
        e.disable_for("a:b", Duration::from_millis(20));
        assert!(!e.is_enabled("a:b"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(e.is_enabled("a:b"));
    }

    #[test]
    fn test_enable_clears_temporary_disable() {
        let e = ToolEnablement::new();
        e.disable_for("a:b", Duration::from_secs(60));
        e.set_enabled("a:b", true);
        assert!(e.is_enabled("a:b"));
    }

    #[test]
    fn test_usage_stats() {
        let e = ToolEnablement::new();
        assert!(e.stats("a:b").is_none());
        e.record("a:b", true, Duration::from_millis(10));
        e.record("a:b", false, Duration::from_millis(30));
        let stats = e.stats("a:b").unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.last_duration_ms, 30);
        assert_eq!(stats.average_duration_ms(), 20);
        assert!(stats.last_used_at.is_some());
        assert_eq!(e.all_stats().len(), 1);
    }
}
