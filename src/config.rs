//! Client tuning knobs.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use rosa_client::{ClientConfig, OfflinePolicy, ReconnectPolicy};
//!
//! let config = ClientConfig::new()
//!     .with_request_timeout(Duration::from_secs(5))
//!     .with_reconnect(ReconnectPolicy::exponential(
//!         Duration::from_millis(500),
//!         Duration::from_secs(30),
//!     ))
//!     .with_offline_policy(OfflinePolicy::Queue);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Time a request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Delay before reconnecting after the link drops.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Time a query without subscribers is kept before eviction.
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(10);

/// Interval of the eviction sweep.
pub const DEFAULT_EVICTION_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Time an unread snapshot stays in memory.
pub const DEFAULT_DATA_TTL: Duration = Duration::from_secs(1);

/// Capacity of the connection event broadcast.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Delay schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential {
        /// Delay before the first attempt.
        initial: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Creates an exponential policy.
    #[inline]
    #[must_use]
    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self::Exponential { initial, max }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1_u32 << exponent).min(max)
            }
        }
    }
}

// ============================================================================
// OfflinePolicy
// ============================================================================

/// What happens to `watch`, `unwatch` and `exec` before the session is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfflinePolicy {
    /// Fail without a protocol, reject during the handshake, forward
    /// otherwise.
    #[default]
    FailFast,
    /// Hold calls and replay them in order once the session is ready.
    Queue,
}

// ============================================================================
// ClientConfig
// ============================================================================

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Time a request waits for its response.
    pub request_timeout: Duration,

    /// Reconnect delay schedule.
    pub reconnect: ReconnectPolicy,

    /// Handling of calls made before the session is ready.
    pub offline: OfflinePolicy,

    /// Time a query without subscribers is kept before eviction.
    pub eviction_grace: Duration,

    /// Interval of the eviction sweep.
    pub eviction_sweep_interval: Duration,

    /// Time an unread snapshot stays in memory.
    pub data_ttl: Duration,

    /// Capacity of the connection event broadcast.
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect: ReconnectPolicy::Fixed(DEFAULT_RECONNECT_DELAY),
            offline: OfflinePolicy::FailFast,
            eviction_grace: DEFAULT_EVICTION_GRACE,
            eviction_sweep_interval: DEFAULT_EVICTION_SWEEP_INTERVAL,
            data_ttl: DEFAULT_DATA_TTL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientConfig {
    /// Sets the request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the offline policy.
    #[inline]
    #[must_use]
    pub fn with_offline_policy(mut self, policy: OfflinePolicy) -> Self {
        self.offline = policy;
        self
    }

    /// Sets the eviction grace period.
    #[inline]
    #[must_use]
    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }

    /// Sets the eviction sweep interval.
    #[inline]
    #[must_use]
    pub fn with_eviction_sweep_interval(mut self, interval: Duration) -> Self {
        self.eviction_sweep_interval = interval;
        self
    }

    /// Sets how long an unread snapshot stays in memory.
    #[inline]
    #[must_use]
    pub fn with_data_ttl(mut self, ttl: Duration) -> Self {
        self.data_ttl = ttl;
        self
    }

    /// Sets the event broadcast capacity.
    #[inline]
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientConfig {
    /// Checks that every duration and capacity is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("request_timeout", self.request_timeout),
            ("eviction_sweep_interval", self.eviction_sweep_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::config(format!("{name} must be greater than zero")));
            }
        }

        if self.event_capacity == 0 {
            return Err(Error::config("event_capacity must be greater than zero"));
        }

        if let ReconnectPolicy::Exponential { initial, max } = self.reconnect
            && initial > max
        {
            return Err(Error::config(format!(
                "reconnect initial delay {initial:?} exceeds max {max:?}"
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
