//! Grouping of packets into send-time groups and computation of the
//! send/arrival deltas between consecutive groups

use super::delta_ms;
use std::time::{Duration, Instant};

/// Packets sent within this span of the group's first packet share a group
pub const SEND_TIME_GROUP_LENGTH: Duration = Duration::from_millis(5);
/// Arrival-time jump (relative to local time) that resets the state
const ARRIVAL_TIME_OFFSET_THRESHOLD: Duration = Duration::from_secs(3);
/// Consecutive reordered groups that reset the state
const REORDERED_RESET_THRESHOLD: u32 = 3;
/// Arrivals closer than this after a queue flush are merged into one burst
const BURST_DELTA_THRESHOLD_MS: f64 = 5.0;
const MAX_BURST_DURATION_MS: f64 = 100.0;

#[derive(Debug, Clone, Copy)]
struct SendTimeGroup {
    size: usize,
    first_send_time: Instant,
    send_time: Instant,
    first_arrival: Instant,
    complete_time: Instant,
    last_system_time: Instant,
}

impl SendTimeGroup {
    fn new(send_time: Instant, arrival_time: Instant, system_time: Instant) -> Self {
        SendTimeGroup {
            size: 0,
            first_send_time: send_time,
            send_time,
            first_arrival: arrival_time,
            complete_time: arrival_time,
            last_system_time: system_time,
        }
    }
}

/// Deltas between two completed send-time groups
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupDeltas {
    pub send_delta_ms: f64,
    pub arrival_delta_ms: f64,
    pub size_delta: i64,
}

#[derive(Debug, Default)]
pub struct InterArrival {
    current: Option<SendTimeGroup>,
    prev: Option<SendTimeGroup>,
    num_consecutive_reordered: u32,
}

impl InterArrival {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received packet
    ///
    /// `system_time` is the local time the feedback was processed, used to
    /// detect remote clock jumps. Returns deltas when a group completes.
    pub fn compute_deltas(
        &mut self,
        send_time: Instant,
        arrival_time: Instant,
        system_time: Instant,
        packet_size: usize,
    ) -> Option<GroupDeltas> {
        let Some(mut current) = self.current else {
            let mut group = SendTimeGroup::new(send_time, arrival_time, system_time);
            group.size = packet_size;
            self.current = Some(group);
            return None;
        };

        if send_time < current.first_send_time {
            // Reordered packet from an already completed group
            return None;
        }

        let mut deltas = None;
        if self.is_new_group(&current, arrival_time, send_time) {
            if let Some(prev) = self.prev {
                let send_delta_ms = delta_ms(current.send_time, prev.send_time);
                let arrival_delta_ms = delta_ms(current.complete_time, prev.complete_time);
                let system_delta_ms = delta_ms(current.last_system_time, prev.last_system_time);

                if arrival_delta_ms - system_delta_ms
                    >= ARRIVAL_TIME_OFFSET_THRESHOLD.as_secs_f64() * 1000.0
                {
                    tracing::warn!(
                        arrival_delta_ms,
                        system_delta_ms,
                        "arrival time clock offset changed, resetting"
                    );
                    self.reset();
                    return None;
                }

                if arrival_delta_ms < 0.0 {
                    self.num_consecutive_reordered += 1;
                    if self.num_consecutive_reordered >= REORDERED_RESET_THRESHOLD {
                        tracing::warn!("packets consecutively reordered, resetting");
                        self.reset();
                    }
                    return None;
                }
                self.num_consecutive_reordered = 0;
                deltas = Some(GroupDeltas {
                    send_delta_ms,
                    arrival_delta_ms,
                    size_delta: current.size as i64 - prev.size as i64,
                });
            }
            self.prev = Some(current);
            current = SendTimeGroup::new(send_time, arrival_time, system_time);
        } else if send_time > current.send_time {
            current.send_time = send_time;
        }

        current.size += packet_size;
        if arrival_time > current.complete_time {
            current.complete_time = arrival_time;
        }
        current.last_system_time = system_time;
        self.current = Some(current);
        deltas
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.prev = None;
        self.num_consecutive_reordered = 0;
    }

    fn is_new_group(&self, current: &SendTimeGroup, arrival_time: Instant, send_time: Instant) -> bool {
        if Self::belongs_to_burst(current, arrival_time, send_time) {
            return false;
        }
        delta_ms(send_time, current.first_send_time) > SEND_TIME_GROUP_LENGTH.as_secs_f64() * 1000.0
    }

    /// A packet arriving sooner after the group than it was sent, within a
    /// short span, is part of a burst flushed from a queue
    fn belongs_to_burst(current: &SendTimeGroup, arrival_time: Instant, send_time: Instant) -> bool {
        let send_delta_ms = delta_ms(send_time, current.send_time);
        if send_delta_ms == 0.0 {
            return true;
        }
        let arrival_delta_ms = delta_ms(arrival_time, current.complete_time);
        let propagation_delta_ms = arrival_delta_ms - send_delta_ms;
        propagation_delta_ms < 0.0
            && arrival_delta_ms <= BURST_DELTA_THRESHOLD_MS
            && delta_ms(arrival_time, current.first_arrival) < MAX_BURST_DURATION_MS
    }
}
