//! A lightweight datagram protocol for collecting sampled sensor values from
//!  many small devices on a central collector.
//!
//! Devices register with the collector, announce a time base, and then stream
//!  observations as a mix of absolute values ("keyframes") and small signed
//!  increments ("deltas"), optionally aggregated into batches. The collector
//!  reconstructs each device's value stream, classifies every datagram as
//!  normal / duplicate / gap-filling / delayed, detects silent devices via an
//!  adaptive liveness timeout, and appends one record per observation to a
//!  CSV log.
//!
//! This is deliberately *not* a reliable transport: there is no
//!  retransmission, no acknowledgement of data frames, no flow control and no
//!  encryption. Lost observations show up as gaps in the log, late ones as
//!  delayed fills. The trade-off is a tiny, fixed-overhead wire format that a
//!  microcontroller can emit without buffering.
//!
//! ## Header
//!
//! Every datagram starts with the same 8-byte header, all fields in network
//!  byte order (BE):
//! ```ascii
//! 0:  version (high nibble, currently 1) | message type (low nibble): u8
//! 1:  device id: u16 (0 before registration)
//! 3:  sequence number: u16, wrap-around (0 follows after FFFF)
//! 5:  time offset: u16, seconds since the device's announced base time
//! 7:  payload length: u8, must equal the number of bytes after the header
//! ```
//!
//! ## Message types
//!
//! ```ascii
//! 1  STARTUP          6-byte MAC [+ 1 byte batch size]        device -> collector
//! 2  STARTUP_ACK      assigned id [+ resume sequence]         collector -> device
//! 3  TIME_SYNC        u32 base time (seconds since epoch)     device -> collector
//! 4  KEYFRAME         i16 absolute value                      device -> collector
//! 5  DATA_DELTA       i8 increment                            device -> collector
//! 6  HEARTBEAT        empty                                   device -> collector
//! 7  BATCHED_DATA     (sub offset, entry kind, value)*        device -> collector
//! 8  DATA_DELTA_QUANTIZED    reserved
//! 9  KEYFRAME_QUANTIZED      reserved
//! 10 BATCHED_DATA_QUANTIZED  reserved
//! 11 SHUTDOWN         empty                                   device -> collector
//! 12 BATCH_INCOMPLETE same as BATCHED_DATA, partial flush     device -> collector
//! ```
//!
//! STARTUP, STARTUP_ACK and TIME_SYNC are control messages: they carry
//!  sequence number 0 by convention and are never classified against the
//!  receive window. Everything else is sequenced.
//!
//! ## Handshake
//!
//! A device sends STARTUP with its MAC (and its batch threshold if it intends
//!  to batch). The collector assigns the smallest unused positive device id -
//!  or, if the MAC is already known, re-issues the previous id together with
//!  the last sequence number it accepted, so a rebooting device can resume
//!  its sequence space without tripping gap detection. The device then
//!  announces its base time via TIME_SYNC and sends an initial KEYFRAME.
//!  SHUTDOWN is fire-and-forget; a device that disappears without one is
//!  eventually flagged by the liveness sweep instead.

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;
pub mod util;
