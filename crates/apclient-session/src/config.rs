//! Client timing configuration.

use std::time::Duration;

use crate::{
    layout::MemoryLayout,
    reconcile::DEFAULT_KEEPALIVE,
    supervisor::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_DELAY},
};

/// Timing and memory-map settings for a [`crate::ClientManager`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reconciliation tick period.
    pub tick_interval: Duration,
    /// Minimum time between `Bounce` keep-alives.
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Delay before looking for a device again after a device error.
    pub device_retry_delay: Duration,
    /// Per-request device timeout, for connectors that take one.
    pub device_timeout: Duration,
    /// Apply received items to the device.
    pub receive_items: bool,
    pub layout: MemoryLayout,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            keepalive_interval: DEFAULT_KEEPALIVE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            device_retry_delay: Duration::from_secs(5),
            device_timeout: Duration::from_secs(5),
            receive_items: true,
            layout: MemoryLayout::default(),
        }
    }
}
