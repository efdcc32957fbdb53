//! Process-lifetime state shared by the scheduler and its subsystems.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rewireconf::DaemonConfig;

/// Retry pacing used by the scheduler and the clients manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intervals {
    /// Wait between attempts to reach an unreachable server. Also the
    /// ceiling of the retry backoff.
    pub reconnect: Duration,
    /// First wait after an unresolved port check.
    pub retry: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self::from(&DaemonConfig::default())
    }
}

impl From<&DaemonConfig> for Intervals {
    fn from(config: &DaemonConfig) -> Self {
        let reconnect = Duration::from_millis(config.reconnect_interval_ms.max(1));
        let retry = Duration::from_millis(config.retry_interval_ms.max(1)).min(reconnect);
        Self { reconnect, retry }
    }
}

/// Flags and settings that live as long as the process.
#[derive(Debug)]
pub struct RuntimeContext {
    stop: AtomicBool,
    debug: bool,
    intervals: Intervals,
    client_prefix: String,
    port_prefix: String,
    smoothing: bool,
}

impl RuntimeContext {
    pub fn new(config: &DaemonConfig, debug: bool) -> Self {
        Self {
            stop: AtomicBool::new(false),
            debug,
            intervals: Intervals::from(config),
            client_prefix: config.client_prefix.clone(),
            port_prefix: config.port_prefix.clone(),
            smoothing: config.smoothing,
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Verbose mode: repeated failures are logged every time, not once.
    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn intervals(&self) -> Intervals {
        self.intervals
    }

    pub fn client_prefix(&self) -> &str {
        &self.client_prefix
    }

    pub fn port_prefix(&self) -> &str {
        &self.port_prefix
    }

    pub fn smoothing(&self) -> bool {
        self.smoothing
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(&DaemonConfig::default(), false)
    }
}
