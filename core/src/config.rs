use std::time::Duration;

use crate::device::EventMask;

/// Default deadline for a single read or write when the engine asks for
/// timeout `0`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Settings applied to every session a [`DiveBridge`](crate::DiveBridge)
/// opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeConfig {
    pub default_timeout: Duration,
    /// Scan while connecting so the platform can resolve the address.
    pub scan_before_connect: bool,
    /// Events the session subscribes to on each device.
    pub events: EventMask,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            scan_before_connect: true,
            events: EventMask::DEVINFO | EventMask::PROGRESS | EventMask::CLOCK,
        }
    }
}

impl BridgeConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_scan_before_connect(mut self, scan: bool) -> Self {
        self.scan_before_connect = scan;
        self
    }

    pub fn with_events(mut self, events: EventMask) -> Self {
        self.events = events;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.default_timeout, DEFAULT_TIMEOUT);
        assert!(config.scan_before_connect);
        assert!(config.events.contains(EventMask::DEVINFO));
        assert!(config.events.contains(EventMask::PROGRESS));
        assert!(config.events.contains(EventMask::CLOCK));
        assert!(!config.events.contains(EventMask::VENDOR));
    }

    #[test]
    fn test_config_setters() {
        let config = BridgeConfig::default()
            .with_default_timeout(Duration::from_millis(250))
            .with_scan_before_connect(false)
            .with_events(EventMask::DEVINFO);
        assert_eq!(config.default_timeout, Duration::from_millis(250));
        assert!(!config.scan_before_connect);
        assert_eq!(config.events, EventMask::DEVINFO);
    }
}
