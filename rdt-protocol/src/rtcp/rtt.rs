//! Round-trip time from report blocks

use std::time::Duration;

/// Smoothed RTT tracker
///
/// Samples come from report blocks: `rtt = now - last_sr - delay_since_last_sr`,
/// all in compact NTP units (1/65536 s).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_us: f64,
    rtt_var_us: f64,
    latest: Option<Duration>,
    samples: u32,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt_us: 100_000.0,
            rtt_var_us: 50_000.0,
            latest: None,
            samples: 0,
        }
    }

    /// RTT sample from a report block echoing one of our sender reports
    ///
    /// Returns `None` if the block carries no echo or the result is negative.
    pub fn sample_from_report(now_compact: u32, last_sr: u32, delay_since_last_sr: u32) -> Option<Duration> {
        if last_sr == 0 {
            return None;
        }
        let rtt = now_compact
            .wrapping_sub(last_sr)
            .checked_sub(delay_since_last_sr)?;
        // Anything above half the compact range is a clock mismatch
        if rtt > 0x8000_0000 {
            return None;
        }
        Some(Duration::from_micros((u64::from(rtt) * 1_000_000) >> 16))
    }

    pub fn update(&mut self, sample: Duration) {
        let sample_us = sample.as_micros() as f64;
        if self.samples == 0 {
            self.srtt_us = sample_us;
            self.rtt_var_us = sample_us / 2.0;
        } else {
            let error = sample_us - self.srtt_us;
            self.srtt_us += 0.125 * error;
            self.rtt_var_us = 0.75 * self.rtt_var_us + 0.25 * error.abs();
        }
        self.latest = Some(sample);
        self.samples += 1;
    }

    /// Smoothed RTT
    pub fn srtt(&self) -> Duration {
        Duration::from_micros(self.srtt_us as u64)
    }

    pub fn rtt_var(&self) -> Duration {
        Duration::from_micros(self.rtt_var_us as u64)
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<Duration> {
        self.latest
    }

    pub fn has_samples(&self) -> bool {
        self.samples > 0
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
