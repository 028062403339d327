use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use tracing::Level;

use sensor_telemetry::client::runner;
use sensor_telemetry::config::ClientConfig;
use sensor_telemetry::protocol::mac_addr::MacAddr;

/// A simulated telemetry device.
#[derive(Parser)]
struct Args {
    /// collector host
    host: String,

    #[clap(long, default_value_t = 5000)]
    port: u16,

    /// seconds between samples
    #[clap(long, default_value_t = 1.0)]
    interval: f64,

    /// seconds to run before shutting down
    #[clap(long, default_value_t = 60.0)]
    duration: f64,

    /// changes at or below this are sent as heartbeats instead of deltas
    #[clap(long = "delta-thresh", default_value_t = 2)]
    delta_thresh: u16,

    #[clap(long, default_value = "AA:BB:CC:DD:EE:FF")]
    mac: MacAddr,

    /// sampler seed; the same seed replays the same value stream
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// 1 sends observations individually, 2..=255 batches them
    #[clap(long, default_value_t = 1)]
    batching: u8,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if !(args.interval > 0.0) {
        bail!("--interval must be positive");
    }
    if !(args.duration >= 0.0) {
        bail!("--duration must not be negative");
    }
    if args.batching == 0 {
        bail!("--batching must be at least 1");
    }

    let mut config = ClientConfig::new(args.host, args.port, args.mac);
    config.interval = Duration::from_secs_f64(args.interval);
    config.duration = Duration::from_secs_f64(args.duration);
    config.seed = args.seed;
    config.batching = args.batching;
    config.delta_threshold = args.delta_thresh;

    runner::run(config).await
}
