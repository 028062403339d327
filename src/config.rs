use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::mac_addr::MacAddr;
use crate::server::sequence_tracker::DEFAULT_WINDOW_SIZE;

/// Configuration for one collector instance. An explicit value passed at
///  construction - nothing global, so tests can run collectors side by side.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// bind address
    pub host: String,
    pub port: u16,

    /// upper bound for both the receive buffer and outgoing datagrams;
    ///  anything longer is counted and dropped before decoding
    pub max_packet_size: usize,

    /// where the CSV record log is written
    pub log_directory: PathBuf,
    /// bounded record queue between the receive path and the log writer;
    ///  records are dropped (and counted) when it is full
    pub log_channel_capacity: usize,

    pub sweep_interval: Duration,
    /// receive window per device, at most 2^15
    pub window_size: u16,
}

impl CollectorConfig {
    pub fn new(host: impl Into<String>, port: u16) -> CollectorConfig {
        CollectorConfig {
            host: host.into(),
            port,
            max_packet_size: 2048,
            log_directory: PathBuf::from("logs"),
            log_channel_capacity: 1024,
            sweep_interval: Duration::from_secs(1),
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for one simulated device.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// collector address
    pub host: String,
    pub port: u16,

    /// pacing between samples
    pub interval: Duration,
    /// total runtime before the client flushes and sends SHUTDOWN
    pub duration: Duration,

    pub mac: MacAddr,
    /// seed for the deterministic sampler
    pub seed: u64,
    /// 1 disables batching; 2..=255 is the batch flush threshold
    pub batching: u8,
    /// deltas with |delta| <= threshold are not worth a datagram of their own
    pub delta_threshold: u16,

    pub max_packet_size: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, mac: MacAddr) -> ClientConfig {
        ClientConfig {
            host: host.into(),
            port,
            interval: Duration::from_secs(1),
            duration: Duration::from_secs(60),
            mac,
            seed: 0,
            batching: 1,
            delta_threshold: 2,
            max_packet_size: 2048,
        }
    }

    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
