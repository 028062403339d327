use anyhow::bail;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::protocol::frame::{BatchEntry, Frame, Message};
use crate::protocol::mac_addr::MacAddr;

/// The device-side transmit state machine, free of sockets and timers: the
///  runner feeds it ticks and samples, it answers with the frames to put on
///  the wire. That keeps the cadence rules testable without any I/O.
///
/// Sequencing: STARTUP and TIME_SYNC carry sequence 0 and never advance the
///  counter (the collector does not classify them). Every other datagram
///  takes the next sequence number - with one exception: when batching is
///  enabled, HEARTBEATs repeat the current counter instead of advancing it.
pub struct ClientSession {
    mac: MacAddr,
    batch_size: u8,
    delta_threshold: u16,

    device_id: u16,
    /// the last sequence number used on the wire
    sequence: u16,
    base_time: Option<u32>,
    last_sent_value: Option<i16>,

    tick_counter: u64,
    /// data-carrying frames since the last TIME_SYNC
    data_since_sync: u32,

    batch: Vec<BatchEntry>,
    batch_bytes: usize,
}

/// frames per TIME_SYNC re-announcement
const TIME_SYNC_EVERY: u32 = 100;

/// a batch payload may not outgrow the header's 255 byte payload length
const MAX_BATCH_BYTES: usize = u8::MAX as usize;

impl ClientSession {
    pub fn new(config: &ClientConfig) -> ClientSession {
        ClientSession {
            mac: config.mac,
            batch_size: config.batching.max(1),
            delta_threshold: config.delta_threshold,
            device_id: 0,
            sequence: 0,
            base_time: None,
            last_sent_value: None,
            tick_counter: 0,
            data_since_sync: 0,
            batch: Vec::new(),
            batch_bytes: 0,
        }
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    fn batching(&self) -> bool {
        self.batch_size > 1
    }

    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    fn time_offset(&self, now_epoch: u64) -> u16 {
        match self.base_time {
            Some(base) => now_epoch.wrapping_sub(base as u64) as u16,
            None => 0,
        }
    }

    /// the registration request; the batch threshold is announced only when
    ///  batching is actually on
    pub fn startup_frame(&self) -> Frame {
        Frame {
            device_id: 0,
            sequence: 0,
            time_offset: 0,
            message: Message::Startup {
                mac: self.mac,
                batch_size: self.batching().then_some(self.batch_size),
            },
        }
    }

    /// Adopts the collector's assignment. A resume sequence means the
    ///  collector still remembers us - continuing from it keeps the gap
    ///  detection on the far side quiet.
    pub fn on_startup_ack(&mut self, frame: &Frame) -> anyhow::Result<()> {
        match &frame.message {
            Message::StartupAck {
                device_id,
                resume_sequence,
            } => {
                if *device_id == 0 {
                    bail!("collector assigned the reserved device id 0");
                }
                self.device_id = *device_id;
                if let Some(resume) = resume_sequence {
                    info!("registered as device {}, resuming after sequence {}", device_id, resume);
                    self.sequence = *resume;
                } else {
                    info!("registered as device {}", device_id);
                }
                Ok(())
            }
            other => bail!("expected STARTUP_ACK, got {}", other.kind().wire_name()),
        }
    }

    /// announces a fresh base time; offsets of everything after this frame
    ///  are relative to it
    pub fn time_sync_frame(&mut self, now_epoch: u64) -> Frame {
        let base_time = now_epoch as u32;
        self.base_time = Some(base_time);
        self.data_since_sync = 0;
        debug!("announcing base time {}", base_time);

        Frame {
            device_id: self.device_id,
            sequence: 0,
            time_offset: 0,
            message: Message::TimeSync { base_time },
        }
    }

    /// the unconditional keyframe that closes the handshake, sent standalone
    ///  even when batching
    pub fn initial_keyframe(&mut self, now_epoch: u64, sample: i16) -> Frame {
        self.last_sent_value = Some(sample);
        self.data_since_sync += 1;
        Frame {
            device_id: self.device_id,
            sequence: self.next_sequence(),
            time_offset: self.time_offset(now_epoch),
            message: Message::Keyframe { value: sample },
        }
    }

    /// One sampling tick. Selection, first match wins: every tenth tick a
    ///  keyframe; a change too large for an i8 a keyframe; a change above
    ///  the threshold a delta; anything else just proves liveness.
    pub fn on_tick(&mut self, now_epoch: u64, sample: i16) -> Vec<Frame> {
        self.tick_counter += 1;

        let delta = match self.last_sent_value {
            Some(last) => sample as i32 - last as i32,
            // no reference value on the wire yet, force a keyframe
            None => i32::MAX,
        };

        let mut out = Vec::new();
        if self.tick_counter % 10 == 0 || delta.abs() > 127 {
            self.push_data(now_epoch, Observation::Keyframe(sample), &mut out);
            self.last_sent_value = Some(sample);
        } else if delta.unsigned_abs() > self.delta_threshold as u32 {
            self.push_data(now_epoch, Observation::Delta(delta as i8), &mut out);
            self.last_sent_value = Some(sample);
        } else {
            out.push(self.heartbeat_frame(now_epoch));
        }
        out
    }

    fn heartbeat_frame(&mut self, now_epoch: u64) -> Frame {
        let sequence = if self.batching() {
            // keeps the data sequence space contiguous across heartbeats
            self.sequence
        } else {
            self.next_sequence()
        };
        Frame {
            device_id: self.device_id,
            sequence,
            time_offset: self.time_offset(now_epoch),
            message: Message::Heartbeat,
        }
    }

    fn push_data(&mut self, now_epoch: u64, observation: Observation, out: &mut Vec<Frame>) {
        if self.data_since_sync >= TIME_SYNC_EVERY {
            // Entries within one batch must share a base time, so a pending
            //  batch goes out before the base moves.
            if let Some(frame) = self.flush(now_epoch) {
                out.push(frame);
            }
            out.push(self.time_sync_frame(now_epoch));
        }
        self.data_since_sync += 1;

        if !self.batching() {
            let (time_offset, sequence) = (self.time_offset(now_epoch), self.next_sequence());
            out.push(Frame {
                device_id: self.device_id,
                sequence,
                time_offset,
                message: match observation {
                    Observation::Keyframe(value) => Message::Keyframe { value },
                    Observation::Delta(delta) => Message::DataDelta { delta },
                },
            });
            return;
        }

        let entry = match observation {
            Observation::Keyframe(value) => BatchEntry::Keyframe {
                sub_offset: self.time_offset(now_epoch),
                value,
            },
            Observation::Delta(delta) => BatchEntry::Delta {
                sub_offset: self.time_offset(now_epoch),
                delta,
            },
        };

        if self.batch_bytes + entry.wire_len() > MAX_BATCH_BYTES {
            out.push(self.emit_batch(now_epoch, false));
        }
        self.batch_bytes += entry.wire_len();
        self.batch.push(entry);

        if self.batch.len() >= self.batch_size as usize {
            out.push(self.emit_batch(now_epoch, false));
        }
    }

    /// flushes a pending partial batch, if any; called at shutdown and
    ///  before a base time change
    pub fn flush(&mut self, now_epoch: u64) -> Option<Frame> {
        if self.batch.is_empty() {
            return None;
        }
        Some(self.emit_batch(now_epoch, true))
    }

    fn emit_batch(&mut self, now_epoch: u64, partial: bool) -> Frame {
        let entries = std::mem::take(&mut self.batch);
        self.batch_bytes = 0;
        debug!("flushing batch of {} entries (partial: {})", entries.len(), partial);

        let (time_offset, sequence) = (self.time_offset(now_epoch), self.next_sequence());
        Frame {
            device_id: self.device_id,
            sequence,
            time_offset,
            message: if partial {
                Message::BatchIncomplete { entries }
            } else {
                Message::BatchedData { entries }
            },
        }
    }

    /// fire and forget; the collector does not acknowledge it
    pub fn shutdown_frame(&mut self, now_epoch: u64) -> Frame {
        let (time_offset, sequence) = (self.time_offset(now_epoch), self.next_sequence());
        Frame {
            device_id: self.device_id,
            sequence,
            time_offset,
            message: Message::Shutdown,
        }
    }
}

enum Observation {
    Keyframe(i16),
    Delta(i8),
}
