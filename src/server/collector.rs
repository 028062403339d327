use std::net::SocketAddr;
use std::time::SystemTime;

use anyhow::Context;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::server::record_log::RecordSink;
use crate::server::session::ServerSession;

/// Owns the one UDP socket of a collector instance and drives the session:
///  one task reads datagrams and dispatches them, a timer tick keeps the
///  liveness sweep running even when no traffic arrives.
pub struct Collector {
    socket: UdpSocket,
    session: ServerSession,
    max_packet_size: usize,
    sweep_interval: std::time::Duration,
}

impl Collector {
    pub async fn bind(config: &CollectorConfig, sink: RecordSink) -> anyhow::Result<Collector> {
        let socket = UdpSocket::bind(config.bind_addr())
            .await
            .with_context(|| format!("cannot bind UDP socket to {}", config.bind_addr()))?;
        info!("collector listening on {}", socket.local_addr()?);

        Ok(Collector {
            socket,
            session: ServerSession::new(config, sink),
            max_packet_size: config.max_packet_size,
            sweep_interval: config.sweep_interval,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs until ctrl-c. In-flight dispatch completes before returning;
    ///  dropping the collector afterwards closes the socket and releases the
    ///  record sink so the log writer can flush.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut sweep = tokio::time::interval(self.sweep_interval);
        // one byte more than the limit so an oversize datagram is detectable
        //  instead of silently truncated
        let mut buf = vec![0u8; self.max_packet_size + 1];

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, closing collector");
                    return Ok(());
                }
                _ = sweep.tick() => {
                    self.session.sweep_timeouts(Instant::now());
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => self.on_datagram(&buf[..len], len, from).await,
                        Err(e) => {
                            error!("error receiving UDP datagram: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn on_datagram(&mut self, datagram: &[u8], len: usize, from: SocketAddr) {
        if len > self.max_packet_size {
            self.session.count_oversize();
            warn!(
                "dropping datagram of {}+ bytes from {} (limit {})",
                len, from, self.max_packet_size
            );
            return;
        }
        debug!("received {} bytes from {}", len, from);

        if let Some(reply) = self.session.on_datagram(datagram, SystemTime::now()) {
            // best effort: a lost ACK is retried by the device, not by us
            if let Err(e) = self.socket.send_to(&reply, from).await {
                warn!("could not send reply to {}: {}", from, e);
            }
        }
    }
}
