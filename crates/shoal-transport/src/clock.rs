//! # NTP fixed-point clock
//!
//! All timestamps handled by the core are 32-bit Q16.16 values: the upper 16
//! bits count whole seconds since the clock epoch and the lower 16 bits the
//! fraction (65536 units per second). This matches the "NTP short" form used
//! by the CC feedback report timestamp, so sent times, ack times and report
//! times can be compared directly.

use std::time::Duration;

use quanta::Instant;

/// NTP units per second.
pub const NTP_UNITS_PER_SEC: u32 = 65_536;

/// Monotonic clock producing Q16.16 timestamps. Wraps every ~18 hours.
#[derive(Debug, Clone, Copy)]
pub struct NtpClock {
    epoch: Instant,
}

impl NtpClock {
    pub fn new() -> Self {
        NtpClock {
            epoch: Instant::now(),
        }
    }

    /// Current time in NTP units since the epoch.
    pub fn now(&self) -> u32 {
        duration_to_ntp(self.elapsed())
    }

    /// Time elapsed since the epoch.
    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(self.epoch)
    }
}

impl Default for NtpClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a duration to NTP units, wrapping at 32 bits.
pub fn duration_to_ntp(d: Duration) -> u32 {
    let units = d.as_secs() as u128 * NTP_UNITS_PER_SEC as u128
        + (d.subsec_nanos() as u128 * NTP_UNITS_PER_SEC as u128) / 1_000_000_000;
    // Wrapping matches the 32-bit timestamp field.
    (units & 0xFFFF_FFFF) as u32
}

/// Convert NTP units to a duration.
pub fn ntp_to_duration(units: u32) -> Duration {
    let nanos = units as u64 * 1_000_000_000 / NTP_UNITS_PER_SEC as u64;
    Duration::from_nanos(nanos)
}

/// NTP timestamp as fractional seconds.
pub fn ntp_to_secs(units: u32) -> f64 {
    units as f64 / NTP_UNITS_PER_SEC as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_second_is_65536_units() {
        assert_eq!(duration_to_ntp(Duration::from_secs(1)), 65_536);
        assert_eq!(duration_to_ntp(Duration::from_millis(500)), 32_768);
    }

    #[test]
    fn conversion_roundtrip_is_close() {
        let d = Duration::from_millis(1_234);
        let back = ntp_to_duration(duration_to_ntp(d));
        let diff = d.abs_diff(back);
        assert!(diff < Duration::from_micros(20), "diff {:?}", diff);
    }

    #[test]
    fn wraps_at_32_bits() {
        let d = Duration::from_secs(65_536);
        assert_eq!(duration_to_ntp(d), 0);
        assert_eq!(duration_to_ntp(d + Duration::from_secs(1)), 65_536);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = NtpClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(2));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn secs_conversion() {
        assert!((ntp_to_secs(98_304) - 1.5).abs() < f64::EPSILON);
    }
}
