//! Sequence Number and Timestamp Handling
//!
//! RTP uses 16-bit sequence numbers and 32-bit media timestamps, both of which
//! wrap. This module provides a wrapped sequence number type with wraparound-aware
//! ordering, plus unwrappers that extend wrapped values into monotonic `i64`s.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Maximum sequence number value (16-bit)
pub const MAX_SEQ_NUMBER: u16 = u16::MAX;

/// Number of distinct sequence numbers
const SEQ_SPACE: i64 = 1 << 16;

/// Number of distinct media timestamps
const TIMESTAMP_SPACE: i64 = 1 << 32;

/// Sequence number with 16-bit wraparound semantics
///
/// Comparison and arithmetic account for wraparound so that ordering is preserved
/// across the 65535 → 0 boundary. Two numbers exactly half the space apart are
/// ordered by their raw value.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u16);

impl SeqNumber {
    /// Create a new sequence number
    #[inline]
    pub const fn new(value: u16) -> Self {
        SeqNumber(value)
    }

    /// Get the raw sequence number value
    #[inline]
    pub fn as_raw(self) -> u16 {
        self.0
    }

    /// Increment the sequence number by 1
    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    /// Get the previous sequence number
    #[inline]
    pub fn prev(self) -> Self {
        SeqNumber(self.0.wrapping_sub(1))
    }

    /// Calculate the distance from this sequence number to another
    ///
    /// Returns a signed distance that accounts for wraparound. Positive values
    /// mean `other` is ahead of `self`, negative means `other` is behind.
    pub fn distance_to(self, other: SeqNumber) -> i32 {
        let diff = other.0.wrapping_sub(self.0);
        if diff == 0x8000 {
            // Exactly half the space apart: break the tie on raw value
            if other.0 > self.0 {
                0x8000
            } else {
                -0x8000
            }
        } else {
            diff as i16 as i32
        }
    }

    /// Check whether this sequence number is newer than `other`
    #[inline]
    pub fn is_newer_than(self, other: SeqNumber) -> bool {
        other.distance_to(self) > 0
    }

    /// Check if this sequence number is less than another (accounting for wraparound)
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    /// Check if this sequence number is less than or equal to another
    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    /// Check if this sequence number is greater than another
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    /// Check if this sequence number is greater than or equal to another
    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self == other || self.gt(other)
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for SeqNumber {
    fn from(value: u16) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u16 {
    fn from(seq: SeqNumber) -> u16 {
        seq.0
    }
}

impl Add<u16> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for SeqNumber {
    fn add_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u16> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u16) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u16> for SeqNumber {
    fn sub_assign(&mut self, rhs: u16) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

impl Sub for SeqNumber {
    type Output = i32;

    /// Calculate the signed distance between two sequence numbers
    fn sub(self, rhs: SeqNumber) -> i32 {
        rhs.distance_to(self)
    }
}

/// Check whether media timestamp `a` is newer than `b` (mod 2^32)
pub fn timestamp_is_newer(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    if diff == 0x8000_0000 {
        return a > b;
    }
    diff != 0 && diff < 0x8000_0000
}

/// Extends wrapped values into a monotonic 64-bit space
///
/// Each new value is placed at the unwrapped position closest to the last one,
/// so reordering within half the wrap period is handled correctly.
#[derive(Debug, Clone, Copy)]
struct Unwrapper {
    space: i64,
    last: Option<i64>,
}

impl Unwrapper {
    const fn new(space: i64) -> Self {
        Unwrapper { space, last: None }
    }

    fn unwrap(&mut self, value: i64) -> i64 {
        let unwrapped = self.peek(value);
        self.last = Some(match self.last {
            Some(last) => last.max(unwrapped),
            None => unwrapped,
        });
        unwrapped
    }

    fn peek(&self, value: i64) -> i64 {
        let Some(last) = self.last else {
            return value;
        };
        let last_wrapped = last.rem_euclid(self.space);
        let mut delta = value - last_wrapped;
        let half = self.space / 2;
        if delta > half {
            delta -= self.space;
        } else if delta < -half {
            delta += self.space;
        }
        last + delta
    }
}

/// Unwraps 16-bit sequence numbers into monotonic `i64` values
#[derive(Debug, Clone, Copy)]
pub struct SeqUnwrapper(Unwrapper);

impl SeqUnwrapper {
    /// Create a new unwrapper
    pub const fn new() -> Self {
        SeqUnwrapper(Unwrapper::new(SEQ_SPACE))
    }

    /// Unwrap a sequence number and update the reference point
    pub fn unwrap(&mut self, seq: SeqNumber) -> i64 {
        self.0.unwrap(seq.as_raw() as i64)
    }

    /// Unwrap a sequence number without updating the reference point
    pub fn peek(&self, seq: SeqNumber) -> i64 {
        self.0.peek(seq.as_raw() as i64)
    }
}

impl Default for SeqUnwrapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwraps 32-bit media timestamps into monotonic `i64` values
#[derive(Debug, Clone, Copy)]
pub struct TimestampUnwrapper(Unwrapper);

impl TimestampUnwrapper {
    /// Create a new unwrapper
    pub const fn new() -> Self {
        TimestampUnwrapper(Unwrapper::new(TIMESTAMP_SPACE))
    }

    /// Unwrap a timestamp and update the reference point
    pub fn unwrap(&mut self, timestamp: u32) -> i64 {
        self.0.unwrap(timestamp as i64)
    }
}

impl Default for TimestampUnwrapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_wraparound() {
        let mut seq = SeqNumber::new(MAX_SEQ_NUMBER);
        seq.increment();
        assert_eq!(seq.as_raw(), 0);
        assert_eq!(SeqNumber::new(65535).next(), SeqNumber::new(0));
        assert_eq!(SeqNumber::new(0).prev(), SeqNumber::new(65535));
    }

    #[test]
    fn test_distance_simple() {
        let a = SeqNumber::new(100);
        let b = SeqNumber::new(200);
        assert_eq!(a.distance_to(b), 100);
        assert_eq!(b.distance_to(a), -100);
    }

    #[test]
    fn test_distance_wraparound() {
        let a = SeqNumber::new(MAX_SEQ_NUMBER - 10);
        let b = SeqNumber::new(10);
        // b is 21 ahead of a (wrapping around)
        assert_eq!(a.distance_to(b), 21);
        assert_eq!(b.distance_to(a), -21);
    }

    #[test]
    fn test_successor_is_newer_at_boundary() {
        let last = SeqNumber::new(65535);
        assert!(last.next().is_newer_than(last));
        assert!(!last.is_newer_than(last.next()));
        assert!(last.lt(last.next()));
    }

    #[test]
    fn test_half_space_tie_break() {
        let a = SeqNumber::new(0);
        let b = SeqNumber::new(0x8000);
        assert!(b.is_newer_than(a));
        assert!(!a.is_newer_than(b));
    }

    #[test]
    fn test_add_sub() {
        assert_eq!((SeqNumber::new(65530) + 10).as_raw(), 4);
        assert_eq!((SeqNumber::new(4) - 10).as_raw(), 65530);
        assert_eq!(SeqNumber::new(4) - SeqNumber::new(65530), 10);
    }

    #[test]
    fn test_seq_unwrapper_forward() {
        let mut unwrapper = SeqUnwrapper::new();
        assert_eq!(unwrapper.unwrap(SeqNumber::new(65534)), 65534);
        assert_eq!(unwrapper.unwrap(SeqNumber::new(65535)), 65535);
        assert_eq!(unwrapper.unwrap(SeqNumber::new(0)), 65536);
        assert_eq!(unwrapper.unwrap(SeqNumber::new(1)), 65537);
    }

    #[test]
    fn test_seq_unwrapper_reordered() {
        let mut unwrapper = SeqUnwrapper::new();
        assert_eq!(unwrapper.unwrap(SeqNumber::new(2)), 2);
        assert_eq!(unwrapper.unwrap(SeqNumber::new(65535)), -1);
        // Reference point did not move backwards
        assert_eq!(unwrapper.unwrap(SeqNumber::new(3)), 3);
    }

    #[test]
    fn test_timestamp_is_newer() {
        assert!(timestamp_is_newer(10, 5));
        assert!(!timestamp_is_newer(5, 10));
        assert!(timestamp_is_newer(5, u32::MAX - 5));
        assert!(!timestamp_is_newer(7, 7));
    }

    #[test]
    fn test_timestamp_unwrapper() {
        let mut unwrapper = TimestampUnwrapper::new();
        assert_eq!(unwrapper.unwrap(u32::MAX - 1000), (u32::MAX - 1000) as i64);
        assert_eq!(unwrapper.unwrap(2000), (1i64 << 32) + 2000);
    }
}
