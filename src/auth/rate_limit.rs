//! Fixed-window rate limiting per endpoint class
//!
//! Each endpoint class has its own quota and key scheme: unauthenticated
//! classes key by client address, authenticated ones by identity id.
//! Counting is check-and-increment in one step; classes that only meter
//! failures call [`RateLimiter::forgive`] after a success.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::clock::Clock;

/// Endpoint class with an independent rate window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateClass {
    /// Login / token issuance attempts
    Auth,
    /// General API traffic
    Api,
    /// Profile picture and similar uploads
    Upload,
    /// Stream start requests
    StreamStart,
    /// Device registration
    DeviceRegister,
}

impl RateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateClass::Auth => "auth",
            RateClass::Api => "api",
            RateClass::Upload => "upload",
            RateClass::StreamStart => "stream_start",
            RateClass::DeviceRegister => "device_register",
        }
    }
}

/// What a class keys its windows by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBy {
    /// Client address, for endpoints reached without credentials
    Address,
    /// Authenticated identity id
    Identity,
}

/// Per-class quota configuration
#[derive(Debug, Clone, Copy)]
pub struct RateQuota {
    pub max_requests: u32,
    pub window: Duration,
    pub key_by: KeyBy,
    /// Whether successful requests are refunded from the window
    pub forgive_success: bool,
}

impl RateQuota {
    pub fn for_class(class: RateClass) -> Self {
        match class {
            RateClass::Auth => Self {
                max_requests: 5,
                window: Duration::seconds(60),
                key_by: KeyBy::Address,
                forgive_success: true,
            },
            RateClass::Api => Self {
                max_requests: 120,
                window: Duration::seconds(60),
                key_by: KeyBy::Identity,
                forgive_success: false,
            },
            RateClass::Upload => Self {
                max_requests: 20,
                window: Duration::hours(1),
                key_by: KeyBy::Identity,
                forgive_success: false,
            },
            RateClass::StreamStart => Self {
                max_requests: 10,
                window: Duration::seconds(60),
                key_by: KeyBy::Identity,
                forgive_success: false,
            },
            RateClass::DeviceRegister => Self {
                max_requests: 10,
                window: Duration::hours(24),
                key_by: KeyBy::Address,
                forgive_success: false,
            },
        }
    }
}

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the window resets; meaningful when rejected
    pub retry_after_seconds: u64,
}

/// Counter backend
///
/// The in-process [`MemoryCounters`] suits a single node; a deployment
/// spanning nodes swaps in a shared backend behind the same interface.
pub trait CounterStore: Send + Sync {
    /// Count one request against the window for `key`
    ///
    /// Increments only when the count is below `max`, so a stored count
    /// never exceeds the maximum between resets. Returns whether the
    /// request was admitted, the count after the call, and the window
    /// deadline.
    fn try_incr(
        &self,
        class: RateClass,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        max: u32,
    ) -> (bool, u32, DateTime<Utc>);

    /// Decrement the current window for `key`, if one exists
    fn decr(&self, class: RateClass, key: &str, now: DateTime<Utc>);

    /// Drop windows whose deadline has passed
    fn sweep(&self, now: DateTime<Utc>);
}

struct WindowEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Lock-free in-process counters
#[derive(Default)]
pub struct MemoryCounters {
    windows: DashMap<(RateClass, String), WindowEntry>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryCounters {
    fn try_incr(
        &self,
        class: RateClass,
        key: &str,
        now: DateTime<Utc>,
        window: Duration,
        max: u32,
    ) -> (bool, u32, DateTime<Utc>) {
        let mut entry = self
            .windows
            .entry((class, key.to_owned()))
            .or_insert_with(|| WindowEntry {
                count: 0,
                reset_at: now + window,
            });
        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + window;
        }
        if entry.count >= max {
            return (false, entry.count, entry.reset_at);
        }
        entry.count += 1;
        (true, entry.count, entry.reset_at)
    }

    fn decr(&self, class: RateClass, key: &str, now: DateTime<Utc>) {
        if let Some(mut entry) = self.windows.get_mut(&(class, key.to_owned()))
            && now < entry.reset_at
            && entry.count > 0
        {
            entry.count -= 1;
        }
    }

    fn sweep(&self, now: DateTime<Utc>) {
        self.windows.retain(|_, entry| entry.reset_at > now);
    }
}

/// Fixed-window limiter over a [`CounterStore`]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { counters, clock }
    }

    /// Count a request against its class window and decide
    pub fn check(&self, class: RateClass, key: &str) -> RateDecision {
        self.check_with_quota(class, key, RateQuota::for_class(class))
    }

    /// Count with an explicit quota (hosts override defaults per class)
    pub fn check_with_quota(&self, class: RateClass, key: &str, quota: RateQuota) -> RateDecision {
        let now = self.clock.now();
        let (allowed, count, reset_at) =
            self.counters
                .try_incr(class, key, now, quota.window, quota.max_requests);
        if !allowed {
            tracing::warn!(
                class = class.as_str(),
                key,
                count,
                limit = quota.max_requests,
                "rate limit exceeded"
            );
        }
        RateDecision {
            allowed,
            remaining: quota.max_requests.saturating_sub(count),
            retry_after_seconds: (reset_at - now).num_seconds().max(1) as u64,
        }
    }

    /// Refund one count after a successful request
    ///
    /// Only meaningful for classes with `forgive_success`; the Auth
    /// window then meters failed attempts only.
    pub fn forgive(&self, class: RateClass, key: &str) {
        self.counters.decr(class, key, self.clock.now());
    }

    /// Drop expired windows; hosts run this on a timer
    pub fn sweep(&self) {
        self.counters.sweep(self.clock.now());
    }
}
