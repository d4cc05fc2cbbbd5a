//! Statistics display and formatting

use rdt::{DataRate, ReceiveStreamStats, SendStreamStats, SessionStats};
use std::io::Write;
use std::time::Duration;

/// Scale `value` down by `step` until it fits the largest matching unit
fn scaled(value: u64, step: f64, units: &[&str]) -> String {
    let mut amount = value as f64;
    let mut unit = 0;
    while amount >= step && unit + 1 < units.len() {
        amount /= step;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, units[0])
    } else {
        format!("{:.2} {}", amount, units[unit])
    }
}

/// Byte count with binary prefixes
pub fn format_bytes(bytes: u64) -> String {
    scaled(bytes, 1024.0, &["B", "KB", "MB", "GB"])
}

pub fn format_rate(rate: DataRate) -> String {
    scaled(rate.bps(), 1000.0, &["bps", "Kbps", "Mbps", "Gbps"])
}

/// Round-trip time, or `N/A` before the first sample
pub fn format_rtt(rtt: Option<Duration>) -> String {
    match rtt {
        None => "N/A".to_string(),
        Some(rtt) if rtt >= Duration::from_secs(1) => format!("{:.2}s", rtt.as_secs_f64()),
        Some(rtt) if rtt >= Duration::from_millis(1) => {
            format!("{:.2}ms", rtt.as_secs_f64() * 1_000.0)
        }
        Some(rtt) => format!("{}µs", rtt.as_micros()),
    }
}

/// Session uptime as `h:mm:ss`, or `m:ss` under an hour
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match secs / 3600 {
        0 => format!("{}:{:02}", secs / 60, secs % 60),
        hours => format!("{}:{:02}:{:02}", hours, secs % 3600 / 60, secs % 60),
    }
}

/// Display session statistics
pub fn display_session_stats(stats: &SessionStats, elapsed: Duration) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ SESSION STATISTICS                                          │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Uptime:    {:<48} │", format_duration(elapsed));
    println!(
        "│ Malformed: {:<48} │",
        format!("{} RTP / {} RTCP", stats.malformed_rtp, stats.malformed_rtcp)
    );
    if let Some(send) = &stats.send {
        display_send_stats(send);
    }
    if let Some(receive) = &stats.receive {
        display_receive_stats(receive);
    }
    println!("└─────────────────────────────────────────────────────────────┘");
}

fn display_send_stats(stats: &SendStreamStats) {
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ SEND                                                        │");
    println!("├─────────────────────────────────────────────────────────────┤");
    let rows = [
        (
            "Frames",
            format!("{} ({} keyframe requests)", stats.frames_sent, stats.keyframe_requests),
        ),
        (
            "Packets",
            format!(
                "{} / {} padding / {} resent",
                stats.packets_sent, stats.padding_packets, stats.retransmissions
            ),
        ),
        ("Bytes", format_bytes(stats.bytes_sent)),
        ("Target", format_rate(stats.target_rate)),
        ("Pacing", format_rate(stats.pacing_rate)),
        ("RTT", format_rtt(stats.rtt)),
        (
            "Queue",
            format!(
                "{} packets, {} in flight",
                stats.queue_len,
                format_bytes(stats.in_flight_bytes as u64)
            ),
        ),
    ];
    for (label, value) in rows {
        println!("│ {:<9}  {:<48} │", format!("{}:", label), value);
    }
}

fn display_receive_stats(stats: &ReceiveStreamStats) {
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ RECEIVE                                                     │");
    println!("├─────────────────────────────────────────────────────────────┤");
    let rows = [
        (
            "Frames",
            format!(
                "{} received / {} lost / {} dropped",
                stats.frames_received, stats.frames_lost, stats.frames_dropped
            ),
        ),
        (
            "Packets",
            format!("{} ({} missing)", stats.packets_received, stats.missing_packets),
        ),
        ("Bytes", format_bytes(stats.bytes_received)),
        (
            "Feedback",
            format!(
                "{} reports, {} NACKs, {} PLIs",
                stats.feedback_sent, stats.nacks_sent, stats.keyframe_requests_sent
            ),
        ),
        ("Jitter", format!("{} ticks", stats.jitter)),
    ];
    for (label, value) in rows {
        println!("│ {:<9}  {:<48} │", format!("{}:", label), value);
    }
}

/// Display compact stats on one line (for continuous updates)
pub fn display_compact_stats(stats: &SessionStats, elapsed: Duration) {
    let mut line = format!("\r[{:8}]", format_duration(elapsed));
    if let Some(send) = &stats.send {
        let throughput = if elapsed.is_zero() {
            DataRate::ZERO
        } else {
            DataRate::from_bytes_per(send.bytes_sent, elapsed)
        };
        line.push_str(&format!(
            " Sent: {} | Rate: {} | Target: {} | RTT: {}",
            format_bytes(send.bytes_sent),
            format_rate(throughput),
            format_rate(send.target_rate),
            format_rtt(send.rtt)
        ));
    }
    if let Some(receive) = &stats.receive {
        line.push_str(&format!(
            " Frames: {} | Lost: {} | Received: {}",
            receive.frames_received,
            receive.frames_lost,
            format_bytes(receive.bytes_received)
        ));
    }
    print!("{}         ", line);

    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(DataRate::from_bps(999)), "999 bps");
        assert_eq!(format_rate(DataRate::from_kbps(300)), "300.00 Kbps");
        assert_eq!(format_rate(DataRate::from_kbps(2500)), "2.50 Mbps");
    }

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(None), "N/A");
        assert_eq!(format_rtt(Some(Duration::from_micros(250))), "250µs");
        assert_eq!(format_rtt(Some(Duration::from_millis(42))), "42.00ms");
        assert_eq!(format_rtt(Some(Duration::from_millis(1500))), "1.50s");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(7)), "0:07");
        assert_eq!(format_duration(Duration::from_secs(95)), "1:35");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }
}
