//! Data rate type shared by the estimators and the pacer

use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::time::Duration;

/// A data rate in bits per second
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DataRate(u64);

impl DataRate {
    /// Zero rate
    pub const ZERO: DataRate = DataRate(0);

    /// Effectively unbounded rate
    pub const INFINITE: DataRate = DataRate(u64::MAX);

    /// Create a rate from bits per second
    #[inline]
    pub const fn from_bps(bps: u64) -> Self {
        DataRate(bps)
    }

    /// Create a rate from kilobits per second
    #[inline]
    pub const fn from_kbps(kbps: u64) -> Self {
        DataRate(kbps * 1000)
    }

    /// Rate of `bytes` delivered over `interval`
    pub fn from_bytes_per(bytes: u64, interval: Duration) -> Self {
        let micros = interval.as_micros();
        if micros == 0 {
            return DataRate::INFINITE;
        }
        let bps = (bytes as u128 * 8 * 1_000_000) / micros;
        DataRate(bps.min(u64::MAX as u128) as u64)
    }

    /// Bits per second
    #[inline]
    pub fn bps(self) -> u64 {
        self.0
    }

    /// Kilobits per second (truncated)
    #[inline]
    pub fn kbps(self) -> u64 {
        self.0 / 1000
    }

    /// Bits per second as a float
    #[inline]
    pub fn bps_f64(self) -> f64 {
        self.0 as f64
    }

    /// Whether this is the unbounded sentinel
    #[inline]
    pub fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether the rate is zero
    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Number of bytes this rate delivers over `interval`
    pub fn bytes_over(self, interval: Duration) -> u64 {
        let bits = self.0 as u128 * interval.as_micros() / 1_000_000;
        (bits / 8).min(u64::MAX as u128) as u64
    }

    /// Time needed to send `bytes` at this rate
    pub fn duration_for(self, bytes: u64) -> Duration {
        if self.0 == 0 {
            return Duration::MAX;
        }
        let micros = bytes as u128 * 8 * 1_000_000 / self.0 as u128;
        Duration::from_micros(micros.min(u64::MAX as u128) as u64)
    }

    /// Clamp this rate into `[min, max]`
    pub fn clamp_to(self, min: DataRate, max: DataRate) -> DataRate {
        if max < min {
            return min;
        }
        DataRate(self.0.clamp(min.0, max.0))
    }

    /// Multiply by a floating point factor, saturating
    pub fn scale(self, factor: f64) -> DataRate {
        if factor <= 0.0 {
            return DataRate::ZERO;
        }
        let scaled = self.0 as f64 * factor;
        if scaled >= u64::MAX as f64 {
            DataRate::INFINITE
        } else {
            DataRate(scaled as u64)
        }
    }
}

impl Add for DataRate {
    type Output = DataRate;

    fn add(self, rhs: DataRate) -> DataRate {
        DataRate(self.0.saturating_add(rhs.0))
    }
}

impl Sub for DataRate {
    type Output = DataRate;

    fn sub(self, rhs: DataRate) -> DataRate {
        DataRate(self.0.saturating_sub(rhs.0))
    }
}

impl Mul<f64> for DataRate {
    type Output = DataRate;

    fn mul(self, rhs: f64) -> DataRate {
        self.scale(rhs)
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else if self.0 >= 1_000_000 {
            write!(f, "{:.2} Mbps", self.0 as f64 / 1_000_000.0)
        } else {
            write!(f, "{:.1} kbps", self.0 as f64 / 1000.0)
        }
    }
}
