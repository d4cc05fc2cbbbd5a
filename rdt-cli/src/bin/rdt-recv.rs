//! RDT Receiver - reassembles and decodes a stream from `rdt-send`
//!
//! Decoded frames are optionally written to a file or stdout as raw bytes.

use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use rdt::codec::PASSTHROUGH_BACKEND;
use rdt::io::UdpTransport;
use rdt::{CodecFactory, CodecSettings, EncodedUnit, Session, SessionEvents};
use rdt_cli::config::{Config, FeedbackKind, PayloadKind, ReceiverConfig};
use rdt_cli::stats::{display_compact_stats, display_session_stats};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "rdt-recv")]
#[command(about = "RDT stream receiver", long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:5004")]
    listen: SocketAddr,

    /// Output destination: file path or '-' for stdout
    #[arg(short, long)]
    output: Option<String>,

    /// Load settings from a TOML file instead of the command line
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    example_config: Option<PathBuf>,

    /// Expect congestion control feedback mode on the sender
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

/// Logs frames the session gave up on
struct LossLogger;

impl SessionEvents for LossLogger {
    fn on_frame_lost(&self, timestamp: u32) {
        tracing::info!("Frame ts={} lost, waiting for a keyframe", timestamp);
    }
}

fn receiver_config(args: &Args) -> anyhow::Result<ReceiverConfig> {
    if let Some(path) = &args.config {
        let config = Config::from_file(path)?;
        return config
            .receiver
            .ok_or_else(|| anyhow::anyhow!("{} has no [receiver] section", path.display()));
    }
    let mut config = Config::example_receiver()
        .receiver
        .ok_or_else(|| anyhow::anyhow!("example receiver configuration missing"))?;
    config.listen = args.listen;
    config.output = args.output.clone();
    config.stats_interval_secs = args.stats;
    config.payload_format = PayloadKind::Generic;
    if args.ccfb {
        config.feedback = FeedbackKind::Congestion;
    }
    Ok(config)
}

fn create_output_writer(output: Option<&str>) -> anyhow::Result<Option<Box<dyn Write>>> {
    match output {
        None => Ok(None),
        Some("-") => {
            tracing::info!("Writing frames to stdout");
            Ok(Some(Box::new(BufWriter::new(io::stdout()))))
        }
        Some(path) => {
            tracing::info!("Writing frames to {}", path);
            Ok(Some(Box::new(BufWriter::new(File::create(path)?))))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rdt_cli::init_tracing(args.verbose);

    if let Some(path) = &args.example_config {
        Config::example_receiver().to_file(path)?;
        tracing::info!("Wrote example receiver configuration to {}", path.display());
        return Ok(());
    }

    let config = receiver_config(&args)?;
    let session_config = config.session_config()?;

    tracing::info!("RDT Receiver starting...");
    let transport = UdpTransport::bind(config.listen)?;
    tracing::info!("Listening on {}", transport.local_addr()?);

    let settings = CodecSettings {
        payload_format: session_config.payload_format,
        ..Default::default()
    };
    let factory = CodecFactory::select(&[PASSTHROUGH_BACKEND])?;
    let mut decoder = factory.create_decoder(&settings)?;
    let mut writer = create_output_writer(config.output.as_deref())?;

    let mut session = Session::start(session_config, Arc::new(transport), Arc::new(LossLogger))?;

    let start = Instant::now();
    let stats_interval = config.stats_interval();
    let mut next_stats = start + stats_interval;
    let mut decoded = 0u64;
    let limit = args.duration.map(Duration::from_secs);

    loop {
        if limit.is_some_and(|limit| start.elapsed() >= limit) {
            tracing::info!("Duration reached");
            break;
        }

        match session.frames().recv_timeout(stats_interval.min(Duration::from_millis(100))) {
            Ok(frame) => {
                let unit = EncodedUnit {
                    data: frame.data.clone(),
                    timestamp: frame.timestamp,
                    keyframe: frame.keyframe,
                    width: settings.width,
                    height: settings.height,
                };
                match decoder.decode(&unit) {
                    Ok(Some(raw)) => {
                        decoded += 1;
                        if let Some(writer) = writer.as_mut() {
                            writer.write_all(&raw.data)?;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!("Decoder waiting for keyframe, dropping ts={}", frame.timestamp);
                    }
                    Err(e) => {
                        tracing::warn!("Decode failed for ts={}: {}", frame.timestamp, e);
                        session.request_keyframe()?;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("Session closed");
                break;
            }
        }

        let now = Instant::now();
        if now >= next_stats {
            display_compact_stats(&session.stats(), now - start);
            next_stats += stats_interval;
        }
    }

    if let Some(writer) = writer.as_mut() {
        writer.flush()?;
    }
    session.stop();
    tracing::info!("Decoded {} frames", decoded);
    display_session_stats(&session.stats(), start.elapsed());
    Ok(())
}
