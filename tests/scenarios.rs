//! End-to-end scenarios: the client transmit state machine feeding the
//!  collector's receive state machine, frame by frame, plus one run over a
//!  real UDP socket.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::Level;

use sensor_telemetry::client::runner;
use sensor_telemetry::client::session::ClientSession;
use sensor_telemetry::config::{ClientConfig, CollectorConfig};
use sensor_telemetry::protocol::frame::Frame;
use sensor_telemetry::protocol::mac_addr::MacAddr;
use sensor_telemetry::protocol::message_kind::MessageKind;
use sensor_telemetry::server::collector::Collector;
use sensor_telemetry::server::record_log::{record_channel, Record, RecordKind};
use sensor_telemetry::server::session::ServerSession;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const NOW: u64 = 1_700_000_000;

fn test_mac() -> MacAddr {
    "AA:BB:CC:DD:EE:FE".parse().unwrap()
}

fn client_config(batching: u8, delta_threshold: u16) -> ClientConfig {
    let mut config = ClientConfig::new("127.0.0.1", 5000, test_mac());
    config.batching = batching;
    config.delta_threshold = delta_threshold;
    config
}

fn server() -> (ServerSession, mpsc::Receiver<Record>) {
    let (sink, rx) = record_channel(4096);
    let config = CollectorConfig::new("127.0.0.1", 0);
    (ServerSession::new(&config, sink), rx)
}

fn feed(server: &mut ServerSession, frame: &Frame) -> Option<Frame> {
    server
        .on_datagram(&frame.to_bytes().unwrap(), SystemTime::now())
        .map(|reply| Frame::try_deser(&reply).unwrap())
}

fn drain(rx: &mut mpsc::Receiver<Record>) -> Vec<Record> {
    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    records
}

/// registration handshake between a client session and the server
fn handshake(client: &mut ClientSession, server: &mut ServerSession) {
    let ack = feed(server, &client.startup_frame()).expect("STARTUP deserves an ACK");
    client.on_startup_ack(&ack).unwrap();
    feed(server, &client.time_sync_frame(NOW));
}

#[tokio::test]
async fn scenario_normal_delta_chain() {
    let (mut server, mut rx) = server();
    let mut client = ClientSession::new(&client_config(1, 0));

    handshake(&mut client, &mut server);
    feed(&mut server, &client.initial_keyframe(NOW, 500));
    for sample in [505, 502, 504] {
        for frame in client.on_tick(NOW, sample) {
            feed(&mut server, &frame);
        }
    }

    let records = drain(&mut rx);
    let values: Vec<i16> = records.iter().filter_map(|r| r.value).collect();
    assert_eq!(values, vec![500, 505, 502, 504]);
    assert!(records
        .iter()
        .all(|r| !r.duplicate && !r.gap && !r.delayed && !r.protocol_violation));
}

#[tokio::test]
async fn scenario_batch_of_five_deltas() {
    let (mut server, mut rx) = server();
    let mut client = ClientSession::new(&client_config(5, 0));

    handshake(&mut client, &mut server);
    feed(&mut server, &client.initial_keyframe(NOW, 100));
    drain(&mut rx);

    let mut sent = Vec::new();
    for sample in [101, 102, 100, 103, 102] {
        sent.extend(client.on_tick(NOW, sample));
    }
    // five deltas fill the batch exactly once
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message.kind(), MessageKind::BatchedData);
    feed(&mut server, &sent[0]);

    let records = drain(&mut rx);
    assert_eq!(records.len(), 5);
    let values: Vec<i16> = records.iter().filter_map(|r| r.value).collect();
    assert_eq!(values, vec![101, 102, 100, 103, 102]);

    let sequence = records[0].sequence;
    assert!(records.iter().all(|r| r.sequence == sequence));
    assert!(records
        .iter()
        .all(|r| !r.duplicate && !r.gap && !r.delayed));
}

#[tokio::test]
async fn scenario_reconnection_resumes_sequence_space() {
    let (mut server, mut rx) = server();

    let mut first_life = ClientSession::new(&client_config(1, 0));
    handshake(&mut first_life, &mut server);
    feed(&mut server, &first_life.initial_keyframe(NOW, 500));
    for sample in [505, 510] {
        for frame in first_life.on_tick(NOW, sample) {
            feed(&mut server, &frame);
        }
    }
    let first_id = first_life.device_id();
    drain(&mut rx);

    // the device reboots: fresh session state, same MAC
    let mut second_life = ClientSession::new(&client_config(1, 0));
    let ack = feed(&mut server, &second_life.startup_frame()).unwrap();
    match &ack.message {
        sensor_telemetry::protocol::frame::Message::StartupAck {
            device_id,
            resume_sequence,
        } => {
            assert_eq!(*device_id, first_id);
            assert_eq!(*resume_sequence, Some(3));
        }
        other => panic!("expected STARTUP_ACK, got {:?}", other),
    }
    second_life.on_startup_ack(&ack).unwrap();
    feed(&mut server, &second_life.time_sync_frame(NOW + 60));
    feed(&mut server, &second_life.initial_keyframe(NOW + 60, 400));

    let records = drain(&mut rx);
    let keyframe = records
        .iter()
        .find(|r| r.kind == RecordKind::Wire(MessageKind::Keyframe))
        .unwrap();
    // sequence 4 follows the pre-reboot 3: no false gap, no duplicate
    assert_eq!(keyframe.sequence, 4);
    assert!(!keyframe.gap && !keyframe.duplicate && !keyframe.delayed);
    assert_eq!(keyframe.value, Some(400));
}

#[tokio::test]
async fn scenario_lost_and_reordered_datagrams() {
    let (mut server, mut rx) = server();
    let mut client = ClientSession::new(&client_config(1, 0));

    handshake(&mut client, &mut server);
    feed(&mut server, &client.initial_keyframe(NOW, 100));

    let mut in_flight = Vec::new();
    for sample in [101, 103, 106] {
        in_flight.extend(client.on_tick(NOW, sample));
    }
    let (first, second, third) = match in_flight.as_slice() {
        [first, second, third] => (first, second, third),
        other => panic!("expected three deltas, got {} frames", other.len()),
    };

    // first arrives, second is delayed behind third
    feed(&mut server, first);
    feed(&mut server, third);
    feed(&mut server, second);

    let records = drain(&mut rx);
    let by_seq = |seq: u16| records.iter().find(|r| r.sequence == seq).unwrap();
    assert!(by_seq(third.sequence).gap);
    assert!(by_seq(second.sequence).delayed);

    // the same multiset of deltas, so the final value matches the in-order sum
    assert_eq!(by_seq(second.sequence).value, Some(106));
}

#[tokio::test]
async fn test_client_against_live_collector() {
    let server_config = CollectorConfig::new("127.0.0.1", 0);
    let (sink, mut rx) = record_channel(4096);
    let collector = Collector::bind(&server_config, sink).await.unwrap();
    let addr = collector.local_addr().unwrap();
    let collector_task = tokio::spawn(collector.run());

    let mut config = client_config(1, 0);
    config.port = addr.port();
    config.interval = Duration::from_millis(20);
    config.duration = Duration::from_millis(400);
    runner::run(config).await.unwrap();

    // give the collector a moment to finish dispatching
    tokio::time::sleep(Duration::from_millis(100)).await;
    collector_task.abort();

    let records = drain(&mut rx);
    assert!(!records.is_empty());

    assert_eq!(records[0].kind, RecordKind::Wire(MessageKind::Startup));
    assert!(records
        .iter()
        .any(|r| r.kind == RecordKind::Wire(MessageKind::TimeSync)));
    assert!(records
        .iter()
        .any(|r| r.kind == RecordKind::Wire(MessageKind::Keyframe) && r.value.is_some()));
    assert_eq!(
        records.last().unwrap().kind,
        RecordKind::Wire(MessageKind::Shutdown)
    );

    // nothing was lost or reordered on loopback
    assert!(records.iter().all(|r| !r.duplicate && !r.gap && !r.delayed));

    // the record stream is ordered by arrival
    let arrivals: Vec<SystemTime> = records.iter().map(|r| r.arrival_time).collect();
    let mut sorted = arrivals.clone();
    sorted.sort();
    assert_eq!(arrivals, sorted);
}

#[tokio::test]
async fn test_batching_client_against_live_collector() {
    let server_config = CollectorConfig::new("127.0.0.1", 0);
    let (sink, mut rx) = record_channel(4096);
    let collector = Collector::bind(&server_config, sink).await.unwrap();
    let addr = collector.local_addr().unwrap();
    let collector_task = tokio::spawn(collector.run());

    let mut config = client_config(4, 0);
    config.port = addr.port();
    config.interval = Duration::from_millis(10);
    config.duration = Duration::from_millis(500);
    config.seed = 7;
    runner::run(config).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    collector_task.abort();

    let records = drain(&mut rx);
    assert_eq!(
        records.last().unwrap().kind,
        RecordKind::Wire(MessageKind::Shutdown)
    );

    // batch entries land as individual keyframe / delta records sharing a
    //  sequence number
    let data: Vec<&Record> = records
        .iter()
        .filter(|r| {
            matches!(
                r.kind,
                RecordKind::Wire(MessageKind::Keyframe) | RecordKind::Wire(MessageKind::DataDelta)
            )
        })
        .collect();
    assert!(data.len() > 4);
    let batched = data
        .iter()
        .filter(|r| data.iter().filter(|o| o.sequence == r.sequence).count() > 1)
        .count();
    assert!(batched > 0, "expected at least one multi-entry batch");
    assert!(records.iter().all(|r| !r.protocol_violation));
}
