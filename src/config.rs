use callcore::backoff::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP};
use std::time::Duration;

/// Signaling channel settings.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Absolute deadline for a subscription to settle.
    pub join_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(20),
            max_reconnect_attempts: 5,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallConfig {
    pub channel: ChannelConfig,
    /// How many times the initiator re-checks channel readiness before giving up on the offer.
    pub offer_send_attempts: u32,
    pub offer_retry_delay: Duration,
    /// Full re-initializations allowed after transport failure.
    pub max_recovery_attempts: u32,
    pub quality_interval: Duration,
    pub ring_timeout: Duration,
    pub ring_tick: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            offer_send_attempts: 3,
            offer_retry_delay: Duration::from_secs(1),
            max_recovery_attempts: 5,
            quality_interval: Duration::from_secs(3),
            ring_timeout: Duration::from_secs(30),
            ring_tick: Duration::from_secs(1),
        }
    }
}
