//! Engine configuration.

use std::time::Duration;

/// Configuration for one sync engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Remote websocket URL.
    pub remote_url: String,
    /// Access key sent as the websocket subprotocol.
    pub access_key: String,
    /// Extra HTTP headers for the connection request.
    pub headers: Vec<(String, String)>,
    /// Idle interval after which a keepalive ping is sent.
    pub keepalive_timeout: Duration,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Human-readable device name; defaults to the host name.
    pub device_name: String,
    /// Reconnect backoff bounds.
    pub backoff: ReconnectBackoff,
}

impl EngineConfig {
    /// Creates a configuration for the given remote.
    pub fn new(remote_url: impl Into<String>, access_key: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            access_key: access_key.into(),
            headers: Vec::new(),
            keepalive_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            device_name: default_device_name(),
            backoff: ReconnectBackoff::default(),
        }
    }

    /// Adds a header to the connection request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the keepalive interval.
    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the device name.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Overrides the reconnect backoff bounds.
    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "rowsync-device".to_owned())
}

/// Exponential reconnect backoff with jitter.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.2 = ±20 %).
    pub jitter: f64,
}

impl ReconnectBackoff {
    /// Calculates the delay before attempt `attempt` (0-indexed; attempt
    /// zero reconnects immediately).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * 2f64.powi(attempt.saturating_sub(1).min(31) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // Spread in [-jitter, +jitter] around the capped delay.
        let spread = capped * self.jitter * (2.0 * pseudo_random() - 1.0);
        Duration::from_secs_f64((capped + spread).max(0.0))
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

/// Cheap jitter source; sub-second clock noise is plenty for spreading
/// reconnect storms.
fn pseudo_random() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}
