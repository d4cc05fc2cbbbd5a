//! Time utilities
//!
//! Monotonic `Instant`s drive every protocol decision; wall-clock NTP time is
//! only needed on the wire (sender reports, compact NTP echoes for RTT).
//! `NtpClock` anchors one to the other once so the mapping never jumps.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// 64-bit NTP timestamp: 32 bits of seconds and 32 bits of fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct NtpTime(u64);

impl NtpTime {
    #[inline]
    pub const fn from_raw(value: u64) -> Self {
        NtpTime(value)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Convert a duration since the NTP epoch
    pub fn from_duration(since_epoch: Duration) -> Self {
        let secs = since_epoch.as_secs() & 0xFFFF_FFFF;
        let frac = (u64::from(since_epoch.subsec_nanos()) << 32) / 1_000_000_000;
        NtpTime(secs << 32 | frac)
    }

    /// Wall-clock time as NTP
    pub fn from_system_time(time: SystemTime) -> Self {
        let unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self::from_duration(unix + Duration::from_secs(NTP_UNIX_OFFSET_SECS))
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// Middle 32 bits, in 1/65536 s units
    pub fn compact(self) -> u32 {
        (self.0 >> 16) as u32
    }

    /// Duration since the NTP epoch (within the current era)
    pub fn to_duration(self) -> Duration {
        let nanos = (u64::from(self.fraction()) * 1_000_000_000) >> 32;
        Duration::new(u64::from(self.seconds()), nanos as u32)
    }
}

/// Convert a compact NTP interval (1/65536 s units) to a duration
pub fn compact_ntp_to_duration(compact: u32) -> Duration {
    Duration::from_micros((u64::from(compact) * 1_000_000) >> 16)
}

/// Convert a duration to compact NTP units, saturating
pub fn duration_to_compact_ntp(duration: Duration) -> u32 {
    let units = duration.as_micros() * 65_536 / 1_000_000;
    units.min(u128::from(u32::MAX)) as u32
}

/// Maps monotonic instants onto NTP time
///
/// The wall clock is sampled once at construction; later instants are offset
/// from that sample so the mapping is monotonic even if the system clock is
/// adjusted.
#[derive(Debug, Clone, Copy)]
pub struct NtpClock {
    origin: Instant,
    origin_ntp: Duration,
}

impl NtpClock {
    pub fn new() -> Self {
        Self::with_origin(Instant::now(), SystemTime::now())
    }

    /// Anchor `instant` to wall-clock `time`
    pub fn with_origin(instant: Instant, time: SystemTime) -> Self {
        NtpClock {
            origin: instant,
            origin_ntp: NtpTime::from_system_time(time).to_duration(),
        }
    }

    /// NTP time of a monotonic instant
    pub fn ntp_at(&self, instant: Instant) -> NtpTime {
        let ntp = match instant.checked_duration_since(self.origin) {
            Some(after) => self.origin_ntp + after,
            None => self
                .origin_ntp
                .saturating_sub(self.origin.duration_since(instant)),
        };
        NtpTime::from_duration(ntp)
    }

    /// Compact NTP time of a monotonic instant
    pub fn compact_at(&self, instant: Instant) -> u32 {
        self.ntp_at(instant).compact()
    }
}

impl Default for NtpClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Timer for periodic operations
///
/// Used for receiver reports, sender reports and statistics output. The
/// caller supplies the current time, so a timer can be driven by a test clock.
#[derive(Debug, Clone)]
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer whose first expiry is one interval after `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now,
        }
    }

    /// Create a timer that is already expired
    pub fn expired_at(interval: Duration, now: Instant) -> Self {
        Timer {
            interval,
            last_fire: now.checked_sub(interval).unwrap_or(now),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_fire) >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self, now: Instant) {
        self.last_fire = now;
    }

    /// Next expiry instant
    pub fn deadline(&self) -> Instant {
        self.last_fire + self.interval
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self, now: Instant) -> bool {
        if self.expired(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_from_unix_epoch() {
        let ntp = NtpTime::from_system_time(UNIX_EPOCH);
        assert_eq!(u64::from(ntp.seconds()), NTP_UNIX_OFFSET_SECS);
        assert_eq!(ntp.fraction(), 0);
    }

    #[test]
    fn test_ntp_fraction() {
        let ntp = NtpTime::from_duration(Duration::from_millis(1500));
        assert_eq!(ntp.seconds(), 1);
        assert_eq!(ntp.fraction(), 0x8000_0000);
        assert_eq!(ntp.compact(), 0x0001_8000);
        assert_eq!(ntp.to_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_compact_conversions() {
        assert_eq!(compact_ntp_to_duration(0x0001_0000), Duration::from_secs(1));
        assert_eq!(duration_to_compact_ntp(Duration::from_millis(500)), 0x8000);
        assert_eq!(duration_to_compact_ntp(Duration::from_secs(1 << 20)), u32::MAX);
    }

    #[test]
    fn test_ntp_clock_monotonic_mapping() {
        let origin = Instant::now();
        let clock = NtpClock::with_origin(origin, UNIX_EPOCH + Duration::from_secs(1000));
        let at = clock.ntp_at(origin + Duration::from_millis(250));
        assert_eq!(
            at.to_duration(),
            Duration::from_secs(NTP_UNIX_OFFSET_SECS + 1000) + Duration::from_millis(250)
        );
        let later = clock.compact_at(origin + Duration::from_secs(2));
        let earlier = clock.compact_at(origin + Duration::from_secs(1));
        assert_eq!(later.wrapping_sub(earlier), 0x0001_0000);
    }

    #[test]
    fn test_timer() {
        let start = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(10), start);
        assert!(!timer.expired(start));
        assert_eq!(timer.time_until_expiration(start), Duration::from_millis(10));

        let later = start + Duration::from_millis(11);
        assert!(timer.expired(later));

        timer.reset(later);
        assert!(!timer.expired(later));
        assert_eq!(timer.deadline(), later + Duration::from_millis(10));
    }

    #[test]
    fn test_timer_try_fire() {
        let start = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(10), start);
        assert!(!timer.try_fire(start));

        let later = start + Duration::from_millis(11);
        assert!(timer.try_fire(later));
        // Should not fire again immediately
        assert!(!timer.try_fire(later));
    }

    #[test]
    fn test_timer_expired_at() {
        let now = Instant::now() + Duration::from_secs(1);
        let mut timer = Timer::expired_at(Duration::from_millis(100), now);
        assert!(timer.try_fire(now));
    }
}
