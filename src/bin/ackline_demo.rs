use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use ackline_core::records::{FLASH_PACKET_SIZE, PAGE_ENTRY_MAGIC, TRACE_CHUNK_SIZE};
use ackline_core::telemetry::init_logging;
use ackline_core::{
    ConfirmationFeed, LoopbackBroker, LoopbackConfig, PublishError, PublishTracker, TraceChunk,
    TrackerConfig, UwbPacket,
};

/// Publish sample sensor records over a lossy loopback broker
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML tracker configuration
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Number of UWB readings to publish
    #[arg(long, default_value_t = 20)]
    count: u32,

    /// Probability that the broker never confirms a message
    #[arg(long, default_value_t = 0.1)]
    drop_probability: f64,

    /// Probability that the broker confirms a message twice
    #[arg(long, default_value_t = 0.1)]
    duplicate_probability: f64,

    /// Base confirmation latency in milliseconds
    #[arg(long, default_value_t = 40)]
    latency_ms: u64,

    #[arg(long, env = "ACKLINE_SEED", default_value_t = 7)]
    seed: u64,
}

fn sample_trace_chunk() -> Vec<u8> {
    let mut bytes = vec![0xFF; TRACE_CHUNK_SIZE];
    for (index, packet) in bytes.chunks_exact_mut(FLASH_PACKET_SIZE).take(3).enumerate() {
        packet[0..2].copy_from_slice(&PAGE_ENTRY_MAGIC.to_le_bytes());
        packet[2..6].copy_from_slice(&(100 + index as u32).to_le_bytes());
        packet[6..26].fill(0xA0 + index as u8);
        packet[26] = (-60 - index as i8) as u8;
        packet[27] = index as u8 + 1;
        packet[28..32].copy_from_slice(&0i32.to_le_bytes());
    }
    bytes
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging("info");
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match TrackerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!("{}", err);
                return ExitCode::FAILURE;
            }
        },
        None => TrackerConfig::default(),
    };

    let feed = ConfirmationFeed::new(config.feed_depth);
    let broker = LoopbackBroker::new(
        feed.sender(),
        LoopbackConfig::default()
            .with_latency(Duration::from_millis(cli.latency_ms))
            .with_jitter(Duration::from_millis(cli.latency_ms))
            .with_drop_probability(cli.drop_probability)
            .with_duplicate_probability(cli.duplicate_probability)
            .with_seed(cli.seed),
    );
    let tracker = match PublishTracker::start(config, broker, feed) {
        Ok(tracker) => Arc::new(tracker),
        Err(err) => {
            error!("invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut publishes = Vec::new();
    for i in 0..cli.count {
        let tracker = Arc::clone(&tracker);
        publishes.push(tokio::spawn(async move {
            let packet = UwbPacket {
                distance: 150 + i * 10,
                time: i,
            };
            tracker.publish_record(&packet).await
        }));
    }

    match TraceChunk::from_bytes(&sample_trace_chunk()) {
        Ok(chunk) => match tracker.publish_record(&chunk).await {
            Ok(delivery) => info!(send_id = %delivery.send_id, "trace chunk confirmed"),
            Err(err) => warn!("trace chunk not confirmed: {}", err),
        },
        Err(err) => warn!("sample chunk invalid: {}", err),
    }

    for publish in publishes {
        match publish.await {
            Ok(Ok(delivery)) => info!(
                send_id = %delivery.send_id,
                elapsed_ms = delivery.elapsed.as_millis() as u64,
                "confirmed"
            ),
            Ok(Err(PublishError::TimedOut { send_id })) => warn!(send_id = %send_id, "timed out"),
            Ok(Err(err)) => warn!("publish failed: {}", err),
            Err(err) => error!("publish task failed: {}", err),
        }
    }

    // let pending replays run out before reporting
    let settle = tracker.config().replay_delay * (tracker.config().max_replays + 1);
    tokio::time::sleep(settle).await;

    let snapshot = tracker.metrics();
    match serde_json::to_string_pretty(&snapshot) {
        Ok(json) => println!("{}", json),
        Err(err) => error!("failed to render metrics: {}", err),
    }
    tracker.shutdown();
    ExitCode::SUCCESS
}
