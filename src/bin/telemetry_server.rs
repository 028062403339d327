use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};

use sensor_telemetry::config::CollectorConfig;
use sensor_telemetry::server::collector::Collector;
use sensor_telemetry::server::record_log::{record_channel, CsvRecordWriter};

/// The telemetry collector. No positional arguments: everything can come
///  from the environment, so a supervisor just sets TELEMETRY_* and execs.
#[derive(Parser)]
struct Args {
    #[clap(long, env = "TELEMETRY_HOST", default_value = "0.0.0.0")]
    host: String,

    #[clap(long, env = "TELEMETRY_PORT", default_value_t = 5000)]
    port: u16,

    #[clap(long, env = "TELEMETRY_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    #[clap(long, env = "TELEMETRY_MAX_PACKET_SIZE", default_value_t = 2048)]
    max_packet_size: usize,

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

    let mut config = CollectorConfig::new(args.host, args.port);
    config.log_directory = args.log_dir;
    config.max_packet_size = args.max_packet_size;

    // both are fatal at startup: an unwritable log directory or an occupied
    //  port mean the collector cannot do its job
    let writer = CsvRecordWriter::create(&config.log_directory)?;
    let (sink, rx) = record_channel(config.log_channel_capacity);
    let writer_task = tokio::spawn(writer.drain(rx));

    let collector = Collector::bind(&config, sink).await?;
    collector.run().await?;

    // the collector dropped its sink; the writer drains what is left and flushes
    writer_task.await.ok();
    info!("collector stopped");
    Ok(())
}
