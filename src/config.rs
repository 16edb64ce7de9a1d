//! Session configuration types.

use std::time::Duration;

/// Default ping interval advertised when none is configured.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;

/// Which side of the conversation a session plays.
///
/// The role is fixed at construction. Clients issue requests and pushes;
/// servers answer requests. Both sides ping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// The side that opens the conversation and sends `Hello`.
    Client,
    /// The side that picks the encoding and answers requests.
    Server,
}

/// Tunables for a session.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use fourwire::SessionConfig;
///
/// let config = SessionConfig::default().with_ping_interval(Duration::from_secs(5));
/// assert_eq!(config.ping_interval(), Duration::from_secs(5));
/// ```
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Ping interval in milliseconds.
    ///
    /// Clients advertise this value in their `Hello`; a server adopts the
    /// client's value once the `Hello` arrives.
    pub ping_interval_ms: u64,
    /// Optional bound on outbound pushes per second. `None` disables
    /// throttling.
    pub push_rate: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            push_rate: None,
        }
    }
}

impl SessionConfig {
    /// The ping interval as a [`Duration`].
    #[must_use]
    pub const fn ping_interval(&self) -> Duration { Duration::from_millis(self.ping_interval_ms) }

    /// Replace the ping interval.
    ///
    /// Sub-millisecond components are truncated.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Bound outbound pushes to `per_second` per second.
    #[must_use]
    pub const fn with_push_rate(mut self, per_second: usize) -> Self {
        self.push_rate = Some(per_second);
        self
    }
}
