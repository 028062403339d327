use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{interval, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::client::sampler::Sampler;
use crate::client::session::ClientSession;
use crate::config::ClientConfig;
use crate::protocol::frame::Frame;

const STARTUP_ATTEMPTS: u32 = 3;
const STARTUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives one simulated device against a collector: registration handshake
///  with bounded retry, paced sampling for the configured duration, then a
///  flush and SHUTDOWN. Returns an error (and thereby a nonzero exit) when
///  the handshake never completes.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect(config.target_addr())
        .await
        .with_context(|| format!("cannot reach collector at {}", config.target_addr()))?;
    info!("sending to collector at {}", config.target_addr());

    let mut session = ClientSession::new(&config);
    let mut sampler = Sampler::new(config.seed);

    register(&socket, &mut session, &config).await?;

    send(&socket, &session.time_sync_frame(epoch_now())).await?;
    send(&socket, &session.initial_keyframe(epoch_now(), sampler.next_sample())).await?;

    let deadline = Instant::now() + config.duration;
    let mut ticker = interval(config.interval);
    ticker.tick().await; // the first tick fires immediately; the handshake already sent data

    loop {
        select! {
            _ = sleep_until(deadline) => break,
            _ = ticker.tick() => {
                let sample = sampler.next_sample();
                for frame in session.on_tick(epoch_now(), sample) {
                    send(&socket, &frame).await?;
                }
            }
        }
    }

    info!("duration elapsed, shutting down");
    if let Some(frame) = session.flush(epoch_now()) {
        send(&socket, &frame).await?;
    }
    send(&socket, &session.shutdown_frame(epoch_now())).await?;
    Ok(())
}

/// STARTUP / STARTUP_ACK with a bounded retry. The collector answers
///  re-registrations idempotently, so retrying a lost ACK is safe.
async fn register(
    socket: &UdpSocket,
    session: &mut ClientSession,
    config: &ClientConfig,
) -> anyhow::Result<()> {
    let startup = session.startup_frame().to_bytes()?;
    let mut buf = vec![0u8; config.max_packet_size];

    for attempt in 1..=STARTUP_ATTEMPTS {
        debug!("sending STARTUP (attempt {})", attempt);
        socket.send(&startup).await?;

        match timeout(STARTUP_TIMEOUT, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => match Frame::try_deser(&buf[..len]) {
                Ok(frame) => {
                    session.on_startup_ack(&frame)?;
                    return Ok(());
                }
                Err(e) => warn!("attempt {}: undecodable reply: {}", attempt, e),
            },
            Ok(Err(e)) => return Err(e).context("socket error while waiting for STARTUP_ACK"),
            Err(_) => warn!("attempt {}: no STARTUP_ACK within {:?}", attempt, STARTUP_TIMEOUT),
        }
    }
    bail!("no STARTUP_ACK after {} attempts", STARTUP_ATTEMPTS)
}

async fn send(socket: &UdpSocket, frame: &Frame) -> anyhow::Result<()> {
    let bytes = frame.to_bytes()?;
    socket
        .send(&bytes)
        .await
        .with_context(|| format!("could not send {}", frame.message.kind().wire_name()))?;
    Ok(())
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the epoch")
        .as_secs()
}
