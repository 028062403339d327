use num_enum::{IntoPrimitive, TryFromPrimitive};

/// high nibble of the first header byte
pub const PROTOCOL_VERSION: u8 = 1;

/// The message type codes, i.e. the low nibble of the first header byte.
///
/// The three quantized codes are reserved: the codec accepts them and hands
///  their payload through as raw bytes, but no quantization scheme is
///  assigned to them yet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Startup = 1,
    StartupAck = 2,
    TimeSync = 3,
    Keyframe = 4,
    DataDelta = 5,
    Heartbeat = 6,
    BatchedData = 7,
    DataDeltaQuantized = 8,
    KeyframeQuantized = 9,
    BatchedDataQuantized = 10,
    Shutdown = 11,
    BatchIncomplete = 12,
}

impl MessageKind {
    /// Control messages carry sequence number 0 and are never checked against
    ///  the receive window.
    pub fn is_sequenced(self) -> bool {
        !matches!(
            self,
            MessageKind::Startup | MessageKind::StartupAck | MessageKind::TimeSync
        )
    }

    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            MessageKind::DataDeltaQuantized
                | MessageKind::KeyframeQuantized
                | MessageKind::BatchedDataQuantized
        )
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            MessageKind::Startup => "STARTUP",
            MessageKind::StartupAck => "STARTUP_ACK",
            MessageKind::TimeSync => "TIME_SYNC",
            MessageKind::Keyframe => "KEYFRAME",
            MessageKind::DataDelta => "DATA_DELTA",
            MessageKind::Heartbeat => "HEARTBEAT",
            MessageKind::BatchedData => "BATCHED_DATA",
            MessageKind::DataDeltaQuantized => "DATA_DELTA_QUANTIZED",
            MessageKind::KeyframeQuantized => "KEYFRAME_QUANTIZED",
            MessageKind::BatchedDataQuantized => "BATCHED_DATA_QUANTIZED",
            MessageKind::Shutdown => "SHUTDOWN",
            MessageKind::BatchIncomplete => "BATCH_INCOMPLETE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(u8::from(MessageKind::Startup), 1);
        assert_eq!(u8::from(MessageKind::BatchIncomplete), 12);
        assert_eq!(MessageKind::try_from(7).unwrap(), MessageKind::BatchedData);
        assert!(MessageKind::try_from(0).is_err());
        assert!(MessageKind::try_from(13).is_err());
    }

    #[test]
    fn test_sequencing_convention() {
        assert!(!MessageKind::Startup.is_sequenced());
        assert!(!MessageKind::StartupAck.is_sequenced());
        assert!(!MessageKind::TimeSync.is_sequenced());
        assert!(MessageKind::Keyframe.is_sequenced());
        assert!(MessageKind::Heartbeat.is_sequenced());
        assert!(MessageKind::Shutdown.is_sequenced());
    }
}
