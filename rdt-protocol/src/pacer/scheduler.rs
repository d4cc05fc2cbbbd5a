//! Single outstanding "process at T" marker

use std::time::{Duration, Instant};

/// Holds at most one pending wake-up time
///
/// Requests only ever move the wake-up earlier, so repeated requests never
/// stack up duplicate work.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessScheduler {
    next: Option<Instant>,
}

impl ProcessScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for processing at `at`; returns whether the marker moved
    pub fn request(&mut self, at: Instant) -> bool {
        match self.next {
            Some(existing) if existing <= at => false,
            _ => {
                self.next = Some(at);
                true
            }
        }
    }

    pub fn next_time(&self) -> Option<Instant> {
        self.next
    }

    /// Consume the marker if it is due
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next {
            Some(at) if at <= now => {
                self.next = None;
                true
            }
            _ => false,
        }
    }

    /// Time until the marker is due, zero if overdue
    pub fn time_until(&self, now: Instant) -> Option<Duration> {
        self.next.map(|at| at.saturating_duration_since(now))
    }

    pub fn cancel(&mut self) {
        self.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_only_moves_earlier() {
        let mut scheduler = ProcessScheduler::new();
        let now = Instant::now();
        assert!(scheduler.request(now + Duration::from_millis(10)));
        assert!(!scheduler.request(now + Duration::from_millis(20)));
        assert!(!scheduler.request(now + Duration::from_millis(10)));
        assert!(scheduler.request(now + Duration::from_millis(5)));
        assert_eq!(scheduler.next_time(), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn test_poll_consumes_once() {
        let mut scheduler = ProcessScheduler::new();
        let now = Instant::now();
        scheduler.request(now + Duration::from_millis(5));
        assert!(!scheduler.poll(now));
        assert_eq!(scheduler.time_until(now), Some(Duration::from_millis(5)));
        assert!(scheduler.poll(now + Duration::from_millis(5)));
        assert!(!scheduler.poll(now + Duration::from_millis(6)));
        assert_eq!(scheduler.time_until(now), None);
    }

    #[test]
    fn test_cancel() {
        let mut scheduler = ProcessScheduler::new();
        let now = Instant::now();
        scheduler.request(now);
        scheduler.cancel();
        assert!(!scheduler.poll(now));
        assert!(scheduler.request(now + Duration::from_secs(1)));
    }
}
