use std::time::Duration;

/// 101 Hz, so that sampling does not line up with code running on 10ms timers.
pub const DEFAULT_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 101);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Configuration {
    /// Minimum time between two consecutive ticks.
    pub interval: Duration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl Configuration {
    pub fn new(interval: Duration) -> Self {
        if interval.is_zero() {
            log::warn!(
                "Sampling interval must not be zero. Using default value ({:?}).",
                DEFAULT_INTERVAL
            );
            return Self::default();
        }
        Self { interval }
    }

    pub fn with_interval_ms(interval_ms: i64) -> Self {
        match u64::try_from(interval_ms) {
            Ok(interval_ms) if interval_ms > 0 => Self {
                interval: Duration::from_millis(interval_ms),
            },
            _ => {
                log::warn!(
                    "Specified interval ({}ms) is not valid. Using default value ({:?}).",
                    interval_ms,
                    DEFAULT_INTERVAL
                );
                Self::default()
            }
        }
    }
}
