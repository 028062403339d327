use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::protocol::mac_addr::MacAddr;
use crate::protocol::message_kind::{MessageKind, PROTOCOL_VERSION};

pub const HEADER_LEN: usize = 8;

/// Why an incoming datagram was rejected before touching any device state.
///  The collector counts these per class; none of them mutate anything.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("datagram shorter than the fixed header")]
    Short,
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),
    #[error("unknown message type code {0}")]
    UnknownType(u8),
    #[error("header announces {header} payload bytes but {actual} arrived")]
    PayloadLengthMismatch { header: u8, actual: usize },
    #[error("malformed {kind:?} payload")]
    MalformedPayload { kind: MessageKind },
    #[error("batch payload ends in a partial entry")]
    BatchEntryMalformed,
}

/// One observation inside a BATCHED_DATA / BATCH_INCOMPLETE payload. Entries
///  carry their own offset from the device's base time; they inherit the
///  batch header's device id and sequence number.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BatchEntry {
    Keyframe { sub_offset: u16, value: i16 },
    Delta { sub_offset: u16, delta: i8 },
}

impl BatchEntry {
    pub fn sub_offset(&self) -> u16 {
        match self {
            BatchEntry::Keyframe { sub_offset, .. } => *sub_offset,
            BatchEntry::Delta { sub_offset, .. } => *sub_offset,
        }
    }

    pub fn wire_len(&self) -> usize {
        match self {
            BatchEntry::Keyframe { .. } => 5,
            BatchEntry::Delta { .. } => 4,
        }
    }

    fn ser(&self, buf: &mut impl BufMut) {
        match self {
            BatchEntry::Keyframe { sub_offset, value } => {
                buf.put_u16(*sub_offset);
                buf.put_u8(MessageKind::Keyframe.into());
                buf.put_i16(*value);
            }
            BatchEntry::Delta { sub_offset, delta } => {
                buf.put_u16(*sub_offset);
                buf.put_u8(MessageKind::DataDelta.into());
                buf.put_i8(*delta);
            }
        }
    }

    /// Parses the next entry. The caller guarantees at least one byte is
    ///  remaining; anything short of a complete entry is malformed.
    fn try_deser(buf: &mut impl Buf) -> Result<BatchEntry, DecodeError> {
        if buf.remaining() < 3 {
            return Err(DecodeError::BatchEntryMalformed);
        }
        let sub_offset = buf.get_u16();
        match MessageKind::try_from(buf.get_u8()) {
            Ok(MessageKind::Keyframe) => {
                if buf.remaining() < 2 {
                    return Err(DecodeError::BatchEntryMalformed);
                }
                Ok(BatchEntry::Keyframe {
                    sub_offset,
                    value: buf.get_i16(),
                })
            }
            Ok(MessageKind::DataDelta) => {
                if buf.remaining() < 1 {
                    return Err(DecodeError::BatchEntryMalformed);
                }
                Ok(BatchEntry::Delta {
                    sub_offset,
                    delta: buf.get_i8(),
                })
            }
            _ => Err(DecodeError::BatchEntryMalformed),
        }
    }
}

/// The typed payload, one case per message kind. The three reserved
///  quantized kinds decode to their raw bytes: the codec accepts them so
///  they can be logged, but assigns no semantics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    Startup {
        mac: MacAddr,
        /// `None` on the wire means batching disabled, as does an explicit 1
        batch_size: Option<u8>,
    },
    StartupAck {
        device_id: u16,
        /// present when the collector already knew the MAC and has a
        ///  sequence head the device should resume from
        resume_sequence: Option<u16>,
    },
    TimeSync {
        base_time: u32,
    },
    Keyframe {
        value: i16,
    },
    DataDelta {
        delta: i8,
    },
    Heartbeat,
    BatchedData {
        entries: Vec<BatchEntry>,
    },
    BatchIncomplete {
        entries: Vec<BatchEntry>,
    },
    Quantized {
        kind: MessageKind,
        raw: Vec<u8>,
    },
    Shutdown,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Startup { .. } => MessageKind::Startup,
            Message::StartupAck { .. } => MessageKind::StartupAck,
            Message::TimeSync { .. } => MessageKind::TimeSync,
            Message::Keyframe { .. } => MessageKind::Keyframe,
            Message::DataDelta { .. } => MessageKind::DataDelta,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::BatchedData { .. } => MessageKind::BatchedData,
            Message::BatchIncomplete { .. } => MessageKind::BatchIncomplete,
            Message::Quantized { kind, .. } => *kind,
            Message::Shutdown => MessageKind::Shutdown,
        }
    }

    fn ser_payload(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            Message::Startup { mac, batch_size } => {
                mac.ser(buf);
                if let Some(batch_size) = batch_size {
                    buf.put_u8(*batch_size);
                }
            }
            Message::StartupAck {
                device_id,
                resume_sequence,
            } => {
                buf.put_u16(*device_id);
                if let Some(resume_sequence) = resume_sequence {
                    buf.put_u16(*resume_sequence);
                }
            }
            Message::TimeSync { base_time } => buf.put_u32(*base_time),
            Message::Keyframe { value } => buf.put_i16(*value),
            Message::DataDelta { delta } => buf.put_i8(*delta),
            Message::Heartbeat | Message::Shutdown => {}
            Message::BatchedData { entries } | Message::BatchIncomplete { entries } => {
                for entry in entries {
                    entry.ser(buf);
                }
            }
            Message::Quantized { kind, raw } => {
                if !kind.is_reserved() {
                    bail!("{} is not a reserved message kind", kind.wire_name());
                }
                buf.put_slice(raw);
            }
        }
        Ok(())
    }

    fn try_deser_payload(kind: MessageKind, mut buf: &[u8]) -> Result<Message, DecodeError> {
        let malformed = DecodeError::MalformedPayload { kind };

        let message = match kind {
            MessageKind::Startup => {
                let mac = match buf.len() {
                    MacAddr::WIRE_LEN | 7 => {
                        MacAddr::try_deser(&mut buf).map_err(|_| malformed)?
                    }
                    _ => return Err(malformed),
                };
                let batch_size = if buf.has_remaining() {
                    match buf.get_u8() {
                        0 => return Err(malformed),
                        n => Some(n),
                    }
                } else {
                    None
                };
                Message::Startup { mac, batch_size }
            }
            MessageKind::StartupAck => {
                let (device_id, resume_sequence) = match buf.len() {
                    2 => (buf.get_u16(), None),
                    4 => (buf.get_u16(), Some(buf.get_u16())),
                    _ => return Err(malformed),
                };
                Message::StartupAck {
                    device_id,
                    resume_sequence,
                }
            }
            MessageKind::TimeSync => {
                if buf.len() != 4 {
                    return Err(malformed);
                }
                Message::TimeSync {
                    base_time: buf.get_u32(),
                }
            }
            MessageKind::Keyframe => {
                if buf.len() != 2 {
                    return Err(malformed);
                }
                Message::Keyframe {
                    value: buf.get_i16(),
                }
            }
            MessageKind::DataDelta => {
                if buf.len() != 1 {
                    return Err(malformed);
                }
                Message::DataDelta {
                    delta: buf.get_i8(),
                }
            }
            MessageKind::Heartbeat => {
                if !buf.is_empty() {
                    return Err(malformed);
                }
                Message::Heartbeat
            }
            MessageKind::Shutdown => {
                if !buf.is_empty() {
                    return Err(malformed);
                }
                Message::Shutdown
            }
            MessageKind::BatchedData | MessageKind::BatchIncomplete => {
                let mut entries = Vec::new();
                while buf.has_remaining() {
                    entries.push(BatchEntry::try_deser(&mut buf)?);
                }
                if kind == MessageKind::BatchedData {
                    Message::BatchedData { entries }
                } else {
                    Message::BatchIncomplete { entries }
                }
            }
            MessageKind::DataDeltaQuantized
            | MessageKind::KeyframeQuantized
            | MessageKind::BatchedDataQuantized => Message::Quantized {
                kind,
                raw: buf.to_vec(),
            },
        };
        Ok(message)
    }
}

/// One complete datagram: the 8-byte header plus its typed payload. The
///  header's payload length byte is derived on encode and validated on
///  decode, so it cannot go out of sync with the payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub device_id: u16,
    pub sequence: u16,
    /// seconds since the device's announced base time
    pub time_offset: u16,
    pub message: Message,
}

impl Frame {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut payload = BytesMut::new();
        self.message.ser_payload(&mut payload)?;
        if payload.len() > u8::MAX as usize {
            bail!(
                "{} payload of {} bytes exceeds the 255 byte header limit",
                self.message.kind().wire_name(),
                payload.len()
            );
        }

        buf.put_u8((PROTOCOL_VERSION << 4) | u8::from(self.message.kind()));
        buf.put_u16(self.device_id);
        buf.put_u16(self.sequence);
        buf.put_u16(self.time_offset);
        buf.put_u8(payload.len() as u8);
        buf.put_slice(&payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 32);
        self.ser(&mut buf)?;
        Ok(buf)
    }

    pub fn try_deser(datagram: &[u8]) -> Result<Frame, DecodeError> {
        if datagram.len() < HEADER_LEN {
            return Err(DecodeError::Short);
        }
        let mut buf = datagram;

        let version_and_type = buf.get_u8();
        let version = version_and_type >> 4;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::VersionMismatch(version));
        }
        let type_code = version_and_type & 0x0F;
        let kind =
            MessageKind::try_from(type_code).map_err(|_| DecodeError::UnknownType(type_code))?;

        let device_id = buf.get_u16();
        let sequence = buf.get_u16();
        let time_offset = buf.get_u16();
        let payload_length = buf.get_u8();

        if buf.remaining() != payload_length as usize {
            return Err(DecodeError::PayloadLengthMismatch {
                header: payload_length,
                actual: buf.remaining(),
            });
        }

        let message = Message::try_deser_payload(kind, buf)?;
        Ok(Frame {
            device_id,
            sequence,
            time_offset,
            message,
        })
    }
}
