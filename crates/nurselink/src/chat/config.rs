//! Chat tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::hub::{DEFAULT_HUB_BUFFER, DEFAULT_OUTBOUND_BUFFER};

/// Chat configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatConfig {
    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,
    /// Hub command channel capacity.
    pub hub_buffer: usize,
    /// Transport ping interval in seconds. 0 disables pings.
    pub ping_interval_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            hub_buffer: DEFAULT_HUB_BUFFER,
            ping_interval_secs: 30,
        }
    }
}

impl ChatConfig {
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}
