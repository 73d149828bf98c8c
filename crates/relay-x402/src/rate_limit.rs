//! Per-identity request rate limiting.
//!
//! Fixed one-minute windows keyed by `(identity, minute bucket)`. Windows
//! are ephemeral, never persisted, and garbage-collected lazily on each
//! check.

use dashmap::DashMap;

use crate::error::X402Error;
use crate::unix_now;

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u64,
    reset_at: u64,
}

pub struct RateLimiter {
    windows: DashMap<String, WindowCounter>,
    limit_per_minute: u64,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u64) -> Self {
        Self {
            windows: DashMap::new(),
            limit_per_minute,
        }
    }

    /// Count a request for `identity` (caller IP or tenant id).
    ///
    /// Over the ceiling, fails with [`X402Error::RateLimitExceeded`]
    /// carrying the seconds until the window resets.
    pub fn check(&self, identity: &str) -> Result<(), X402Error> {
        let now = unix_now()?;
        let bucket = now / 60;
        let window_key = format!("{identity}:{bucket}");

        let counter = {
            let mut entry = self.windows.entry(window_key).or_insert(WindowCounter {
                count: 0,
                reset_at: (bucket + 1) * 60,
            });
            entry.count += 1;
            *entry
        };

        // Drop windows from past minutes.
        self.windows.retain(|_, w| w.reset_at > now);

        if counter.count > self.limit_per_minute {
            return Err(X402Error::RateLimitExceeded {
                retry_after: counter.reset_at.saturating_sub(now).max(1),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    fn window_count(&self) -> usize {
        self.windows.len()
    }
}
