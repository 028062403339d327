use std::time::{Duration, SystemTime};

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::protocol::frame::{BatchEntry, Frame, Message};
use crate::protocol::mac_addr::MacAddr;
use crate::protocol::message_kind::MessageKind;
use crate::server::device_table::{Device, DeviceStatus, DeviceTable};
use crate::server::record_log::{Record, RecordKind, RecordSink};
use crate::server::sequence_tracker::SeqClass;

/// Datagrams dropped on the wire, by reason. This is a best-effort telemetry
///  protocol: nothing is NACKed, the counters are the only trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCounters {
    pub decode_errors: u64,
    pub unknown_device: u64,
    /// data from a device that announced SHUTDOWN, or a STARTUP_ACK looped
    ///  back at the collector
    pub stale_or_spoofed: u64,
    pub oversize: u64,
}

/// The per-device receive state machine, for all devices of one collector.
///
/// Consumes raw datagrams, resolves the device, classifies the sequence
///  number, reconstructs values from keyframes and deltas, disassembles
///  batches, and emits exactly one [Record] per observation (one per entry
///  for batches). Processing is synchronous and per-collector serialized -
///  the I/O loop is the only caller, which is all the ordering the protocol
///  guarantees.
pub struct ServerSession {
    devices: DeviceTable,
    sink: RecordSink,
    counters: SessionCounters,
}

impl ServerSession {
    pub fn new(config: &CollectorConfig, sink: RecordSink) -> ServerSession {
        ServerSession {
            devices: DeviceTable::new(config.window_size),
            sink,
            counters: SessionCounters::default(),
        }
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Processes one datagram. Returns the reply to send back to the source
    ///  endpoint, if the message warrants one (STARTUP_ACK).
    pub fn on_datagram(&mut self, datagram: &[u8], arrival: SystemTime) -> Option<BytesMut> {
        let cpu_start = std::time::Instant::now();

        let frame = match Frame::try_deser(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.decode_errors += 1;
                debug!("dropping undecodable datagram: {}", e);
                return None;
            }
        };

        match frame.message {
            Message::Startup { mac, batch_size } => {
                self.on_startup(mac, batch_size.unwrap_or(1), arrival, cpu_start)
            }
            Message::StartupAck { .. } => {
                self.counters.stale_or_spoofed += 1;
                warn!("ignoring STARTUP_ACK addressed to the collector");
                None
            }
            _ => {
                self.on_device_frame(frame, arrival, cpu_start);
                None
            }
        }
    }

    /// Registration path. A STARTUP from a known MAC re-issues the existing
    ///  id (with the sequence head to resume from, if there is one) - that
    ///  covers both reconnection after TIMEOUT / SHUTDOWN and a device that
    ///  retries because our previous ACK was lost.
    fn on_startup(
        &mut self,
        mac: MacAddr,
        batch_size: u8,
        arrival: SystemTime,
        cpu_start: std::time::Instant,
    ) -> Option<BytesMut> {
        let registration = self.devices.register(mac, batch_size);
        let device = self
            .devices
            .get_mut(registration.device_id)
            .expect("device exists right after registration");
        device.touch(Instant::now());

        let mut record = Record {
            kind: RecordKind::Wire(MessageKind::Startup),
            device_id: registration.device_id,
            sequence: 0,
            device_timestamp: arrival,
            arrival_time: arrival,
            value: None,
            duplicate: false,
            gap: false,
            delayed: false,
            pre_sync: false,
            protocol_violation: false,
            cpu_time_ms: 0.0,
        };
        record.cpu_time_ms = elapsed_ms(cpu_start);
        self.sink.try_emit(record);

        let ack = Frame {
            device_id: registration.device_id,
            sequence: 0,
            time_offset: 0,
            message: Message::StartupAck {
                device_id: registration.device_id,
                resume_sequence: registration.resume_sequence,
            },
        };
        match ack.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("cannot encode STARTUP_ACK: {}", e);
                None
            }
        }
    }

    fn on_device_frame(&mut self, frame: Frame, arrival: SystemTime, cpu_start: std::time::Instant) {
        let kind = frame.message.kind();

        let device = match self.devices.get_mut(frame.device_id) {
            Some(device) => device,
            None => {
                self.counters.unknown_device += 1;
                warn!(
                    "dropping {} from unknown device id {}",
                    kind.wire_name(),
                    frame.device_id
                );
                return;
            }
        };
        if device.status == DeviceStatus::Down {
            self.counters.stale_or_spoofed += 1;
            warn!(
                "dropping {} from device {} which already announced SHUTDOWN",
                kind.wire_name(),
                frame.device_id
            );
            return;
        }

        device.touch(Instant::now());

        let mut records = Vec::with_capacity(1);
        match &frame.message {
            Message::TimeSync { base_time } => {
                device.base_time = Some(*base_time);
                if device.status == DeviceStatus::Pending {
                    device.status = DeviceStatus::Active;
                    info!("device {} synced, now ACTIVE", device.device_id);
                }
                // control message: not classified, no flags
                records.push(observation_record(
                    device, &frame, None, frame.time_offset, arrival,
                ));
            }
            message => {
                let class = device.tracker.observe(frame.sequence);
                if device.status == DeviceStatus::Timeout {
                    device.status = DeviceStatus::Active;
                    info!("device {} is sending again, back to ACTIVE", device.device_id);
                }
                dispatch_sequenced(device, &frame, message, class, arrival, &mut records);
            }
        }

        let cpu_time_ms = elapsed_ms(cpu_start);
        for mut record in records {
            record.cpu_time_ms = cpu_time_ms;
            self.sink.try_emit(record);
        }
    }

    /// Checks every ACTIVE device against its adaptive liveness ceiling and
    ///  expires the silent ones with a synthetic record. Driven by the I/O
    ///  loop at most once per second.
    pub fn sweep_timeouts(&mut self, now: Instant) {
        let wall = SystemTime::now();
        let mut expirations = Vec::new();

        for device in self.devices.iter_mut() {
            if device.status != DeviceStatus::Active {
                continue;
            }
            let ceiling = match device.timeout_ceiling() {
                Some(ceiling) => ceiling,
                None => continue,
            };
            let idle = match device.last_arrival {
                Some(last) => now.saturating_duration_since(last).as_secs_f64(),
                None => continue,
            };
            if idle <= ceiling {
                continue;
            }

            warn!(
                "device {} silent for {:.1}s (ceiling {:.1}s), expiring to TIMEOUT",
                device.device_id, idle, ceiling
            );
            device.status = DeviceStatus::Timeout;
            expirations.push(Record {
                kind: RecordKind::TimeoutSynthetic,
                device_id: device.device_id,
                sequence: device.tracker.head().unwrap_or(0),
                device_timestamp: wall,
                arrival_time: wall,
                value: device.last_value,
                duplicate: false,
                gap: false,
                delayed: false,
                pre_sync: false,
                protocol_violation: false,
                cpu_time_ms: 0.0,
            });
        }

        for record in expirations {
            self.sink.try_emit(record);
        }
    }

    pub fn count_oversize(&mut self) {
        self.counters.oversize += 1;
    }
}

fn dispatch_sequenced(
    device: &mut Device,
    frame: &Frame,
    message: &Message,
    class: SeqClass,
    arrival: SystemTime,
    records: &mut Vec<Record>,
) {
    match message {
        Message::Keyframe { value } => {
            if class.updates_value() {
                device.last_value = Some(*value);
            }
            let mut record =
                observation_record(device, frame, Some(class), frame.time_offset, arrival);
            record.value = device.last_value;
            records.push(record);
        }
        Message::DataDelta { delta } => {
            records.push(apply_delta(device, frame, class, *delta, frame.time_offset, arrival));
        }
        Message::Heartbeat => {
            records.push(observation_record(
                device, frame, Some(class), frame.time_offset, arrival,
            ));
        }
        Message::Shutdown => {
            info!("device {} announced SHUTDOWN", device.device_id);
            device.status = DeviceStatus::Down;
            records.push(observation_record(
                device, frame, Some(class), frame.time_offset, arrival,
            ));
        }
        Message::BatchedData { entries } | Message::BatchIncomplete { entries } => {
            // entries inherit the batch's sequence and classification; deltas
            //  chain through last_value in on-wire order
            for entry in entries {
                match entry {
                    BatchEntry::Keyframe { sub_offset, value } => {
                        if class.updates_value() {
                            device.last_value = Some(*value);
                        }
                        let mut record =
                            observation_record(device, frame, Some(class), *sub_offset, arrival);
                        record.kind = RecordKind::Wire(MessageKind::Keyframe);
                        record.value = device.last_value;
                        records.push(record);
                    }
                    BatchEntry::Delta { sub_offset, delta } => {
                        let mut record =
                            apply_delta(device, frame, class, *delta, *sub_offset, arrival);
                        record.kind = RecordKind::Wire(MessageKind::DataDelta);
                        records.push(record);
                    }
                }
            }
        }
        Message::Quantized { kind, .. } => {
            debug!(
                "no decoder for reserved kind {}, logging without a value",
                kind.wire_name()
            );
            records.push(observation_record(
                device, frame, Some(class), frame.time_offset, arrival,
            ));
        }
        Message::Startup { .. } | Message::StartupAck { .. } | Message::TimeSync { .. } => {
            unreachable!("control messages are handled before sequenced dispatch")
        }
    }
}

fn apply_delta(
    device: &mut Device,
    frame: &Frame,
    class: SeqClass,
    delta: i8,
    offset: u16,
    arrival: SystemTime,
) -> Record {
    let mut violation = false;
    if class.updates_value() {
        match device.last_value {
            Some(value) => device.last_value = Some(value.wrapping_add(delta as i16)),
            // a delta with no keyframe to apply it to
            None => violation = true,
        }
    }

    let mut record = observation_record(device, frame, Some(class), offset, arrival);
    record.value = if violation { None } else { device.last_value };
    record.protocol_violation = violation;
    record
}

fn observation_record(
    device: &Device,
    frame: &Frame,
    class: Option<SeqClass>,
    offset_secs: u16,
    arrival: SystemTime,
) -> Record {
    let (device_timestamp, pre_sync) = match device.base_time {
        Some(base) => (
            SystemTime::UNIX_EPOCH + Duration::from_secs(base as u64 + offset_secs as u64),
            false,
        ),
        // nothing to anchor the offset to yet
        None => (arrival, true),
    };

    Record {
        kind: RecordKind::Wire(frame.message.kind()),
        device_id: device.device_id,
        sequence: frame.sequence,
        device_timestamp,
        arrival_time: arrival,
        value: None,
        duplicate: class.map(SeqClass::duplicate_flag).unwrap_or(false),
        gap: class.map(SeqClass::gap_flag).unwrap_or(false),
        delayed: class.map(SeqClass::delayed_flag).unwrap_or(false),
        pre_sync,
        protocol_violation: false,
        cpu_time_ms: 0.0,
    }
}

fn elapsed_ms(cpu_start: std::time::Instant) -> f64 {
    cpu_start.elapsed().as_secs_f64() * 1000.0
}
