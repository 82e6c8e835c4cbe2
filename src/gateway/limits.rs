use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::GatewayError;

fn default_window_seconds() -> u64 {
    60
}

/// `requests` per `window_seconds`; `requests: None` disables limiting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<u32>,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: None,
            window_seconds: default_window_seconds(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(requests: u32, window_seconds: u64) -> Self {
        Self {
            requests: Some(requests),
            window_seconds,
        }
    }
}

/// Fixed-window request counter keyed by account. Not persisted.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    usage: HashMap<String, WindowUsage>,
    last_gc_window: u64,
}

#[derive(Debug, Clone)]
struct WindowUsage {
    window: u64,
    requests: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            usage: HashMap::new(),
            last_gc_window: 0,
        }
    }

    /// Counts one request for `account_id` unless that would exceed the window's budget.
    pub fn check(&mut self, account_id: &str, now_epoch_seconds: u64) -> Result<(), GatewayError> {
        let Some(limit) = self.config.requests else {
            return Ok(());
        };

        let window = now_epoch_seconds / self.config.window_seconds.max(1);
        if window != self.last_gc_window {
            // Only the active window is meaningful; older/future buckets are stale.
            self.usage.retain(|_, usage| usage.window == window);
            self.last_gc_window = window;
        }

        let usage = self
            .usage
            .entry(account_id.to_string())
            .or_insert(WindowUsage {
                window,
                requests: 0,
            });

        if usage.window != window {
            usage.window = window;
            usage.requests = 0;
        }

        let next_requests = usage.requests.saturating_add(1);
        if limit == 0 || next_requests > limit {
            return Err(GatewayError::RateLimited {
                limit: format!("{limit} requests per {}s", self.config.window_seconds),
            });
        }

        usage.requests = next_requests;
        Ok(())
    }

    #[cfg(test)]
    pub fn remaining(&self, account_id: &str, now_epoch_seconds: u64) -> Option<u32> {
        let limit = self.config.requests?;
        let window = now_epoch_seconds / self.config.window_seconds.max(1);
        let used = self
            .usage
            .get(account_id)
            .filter(|usage| usage.window == window)
            .map(|usage| usage.requests)
            .unwrap_or(0);
        Some(limit.saturating_sub(used))
    }
}
