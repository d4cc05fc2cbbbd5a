//! RDT Sender - streams a synthetic screen to a receiver
//!
//! Frames are produced by a moving test pattern, run through the selected
//! codec backend and handed to a send-only session.

use bytes::Bytes;
use clap::Parser;
use rdt::codec::PASSTHROUGH_BACKEND;
use rdt::io::UdpTransport;
use rdt::{CodecFactory, CodecSettings, DataRate, RawFrame, Session, SessionEvents};
use rdt_cli::config::{Config, FeedbackKind, PayloadKind, SenderConfig};
use rdt_cli::stats::{display_compact_stats, display_session_stats};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rdt-send")]
#[command(about = "RDT synthetic screen sender", long_about = None)]
struct Args {
    /// Receiver address (host:port)
    #[arg(short, long)]
    peer: Option<SocketAddr>,

    /// Local bind address
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Load settings from a TOML file instead of the command line
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    example_config: Option<PathBuf>,

    /// Source width in pixels
    #[arg(long, default_value = "160")]
    width: u32,

    /// Source height in pixels
    #[arg(long, default_value = "90")]
    height: u32,

    /// Frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Start rate in kbps
    #[arg(long, default_value = "300")]
    start_rate: u64,

    /// Use congestion control feedback instead of transport-wide feedback
    #[arg(long)]
    ccfb: bool,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Statistics interval in seconds
    #[arg(long, default_value = "1")]
    stats: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Relays session callbacks to the encoding loop
#[derive(Default)]
struct EncoderSignals {
    keyframe: AtomicBool,
    target_bps: AtomicU64,
}

impl SessionEvents for EncoderSignals {
    fn on_keyframe_request(&self) {
        self.keyframe.store(true, Ordering::Relaxed);
    }

    fn on_target_rate(&self, rate: DataRate) {
        self.target_bps.store(rate.bps(), Ordering::Relaxed);
    }
}

fn sender_config(args: &Args) -> anyhow::Result<SenderConfig> {
    if let Some(path) = &args.config {
        let config = Config::from_file(path)?;
        return config
            .sender
            .ok_or_else(|| anyhow::anyhow!("{} has no [sender] section", path.display()));
    }
    let Some(peer) = args.peer else {
        anyhow::bail!("A peer address is required (--peer or --config)");
    };
    let mut config = Config::example_sender()
        .sender
        .ok_or_else(|| anyhow::anyhow!("example sender configuration missing"))?;
    config.bind = args.bind;
    config.peer = peer;
    config.width = args.width;
    config.height = args.height;
    config.frame_rate = args.fps;
    config.start_rate_kbps = args.start_rate;
    config.min_rate_kbps = config.min_rate_kbps.min(args.start_rate);
    config.max_rate_kbps = config.max_rate_kbps.max(args.start_rate);
    config.duration_secs = args.duration;
    config.stats_interval_secs = args.stats;
    config.payload_format = PayloadKind::Generic;
    if args.ccfb {
        config.feedback = FeedbackKind::Congestion;
    }
    Ok(config)
}

/// Diagonal bands that shift every frame, so consecutive frames differ
fn test_pattern(settings: &CodecSettings, index: u64) -> Bytes {
    let width = settings.width as usize;
    let mut data = vec![0u8; settings.frame_size()];
    for (i, pixel) in data.iter_mut().enumerate() {
        let x = i % width;
        let y = i / width;
        *pixel = ((x + y + index as usize * 4) / 16 % 256) as u8;
    }
    Bytes::from(data)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rdt_cli::init_tracing(args.verbose);

    if let Some(path) = &args.example_config {
        Config::example_sender().to_file(path)?;
        tracing::info!("Wrote example sender configuration to {}", path.display());
        return Ok(());
    }

    let config = sender_config(&args)?;
    let session_config = config.session_config()?;

    tracing::info!("RDT Sender starting...");
    let transport = UdpTransport::connect(config.bind, config.peer)?;
    tracing::info!(
        "Sender bound to {} for peer {}",
        transport.local_addr()?,
        config.peer
    );

    let settings = CodecSettings {
        width: config.width,
        height: config.height,
        frame_rate: config.frame_rate,
        target_rate: session_config.congestion.start_rate,
        payload_format: session_config.payload_format,
        ..Default::default()
    };
    let factory = CodecFactory::select(&[PASSTHROUGH_BACKEND])?;
    let mut encoder = factory.create_encoder(&settings)?;
    tracing::info!("Using {} encoder at {}x{}", encoder.name(), settings.width, settings.height);

    let signals = Arc::new(EncoderSignals::default());
    let mut session = Session::start(session_config, Arc::new(transport), signals.clone())?;

    let frame_interval = Duration::from_secs(1) / config.frame_rate;
    let timestamp_step = 90_000 / config.frame_rate;
    let start = Instant::now();
    let mut next_frame = start;
    let mut next_stats = start + config.stats_interval();
    let mut applied_bps = 0;
    // Byte credit at the target rate; pass-through output does not shrink,
    // so frames are skipped instead
    let mut credit = 0u64;
    let mut skipped = 0u64;

    for index in 0u64.. {
        if config.duration().is_some_and(|limit| start.elapsed() >= limit) {
            tracing::info!("Duration reached after {} frames", index);
            break;
        }

        if signals.keyframe.swap(false, Ordering::Relaxed) {
            encoder.request_keyframe();
        }
        let target_bps = signals.target_bps.load(Ordering::Relaxed);
        if target_bps != applied_bps {
            applied_bps = target_bps;
            encoder.set_target_rate(DataRate::from_bps(target_bps));
        }

        let frame = RawFrame {
            data: test_pattern(&settings, index),
            width: settings.width,
            height: settings.height,
            timestamp: (index as u32).wrapping_mul(timestamp_step),
        };
        let frame_bytes = settings.frame_size() as u64;
        credit = (credit + DataRate::from_bps(applied_bps).bytes_over(frame_interval))
            .min(frame_bytes * 2);
        if credit >= frame_bytes {
            credit -= frame_bytes;
            for unit in encoder.encode(&frame)? {
                session.send_frame(unit)?;
            }
        } else {
            skipped += 1;
            tracing::trace!("Skipping frame {} ({} bytes of credit)", index, credit);
        }

        let now = Instant::now();
        if now >= next_stats {
            display_compact_stats(&session.stats(), now - start);
            next_stats += config.stats_interval();
        }

        next_frame += frame_interval;
        if let Some(wait) = next_frame.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    session.stop();
    tracing::info!("Skipped {} frames to stay under the target rate", skipped);
    display_session_stats(&session.stats(), start.elapsed());
    Ok(())
}
