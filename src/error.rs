use crate::channel::ChannelId;
use crate::trace::hex;
use crate::uds::error::nrc_label;

/// Everything the engine reports to callers.
///
/// Each variant names the channel and carries the bytes involved, so a
/// failure can be traced to the wire without re-running the test.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{channel}: malformed frame [{}]: {reason}", hex(.bytes))]
    MalformedFrame {
        channel: ChannelId,
        bytes: Vec<u8>,
        reason: String,
    },

    #[error(
        "{channel}: consecutive frame out of order, expected sequence {expected:X}, got {received:X} [{}]",
        hex(.bytes)
    )]
    OutOfOrderFrame {
        channel: ChannelId,
        expected: u8,
        received: u8,
        bytes: Vec<u8>,
    },

    #[error(
        "{channel}: reassembly abandoned after {received} of {declared_total_length} bytes [{}]",
        hex(.bytes)
    )]
    ReassemblyAbandoned {
        channel: ChannelId,
        declared_total_length: usize,
        received: usize,
        bytes: Vec<u8>,
    },

    #[error(
        "{channel}: no consecutive frame within N_Cr, {received} of {declared_total_length} bytes [{}]",
        hex(.bytes)
    )]
    ConsecutiveFrameTimeout {
        channel: ChannelId,
        declared_total_length: usize,
        received: usize,
        bytes: Vec<u8>,
    },

    #[error("{channel}: no flow control after first frame [{}]", hex(.bytes))]
    FlowControlTimeout { channel: ChannelId, bytes: Vec<u8> },

    #[error("{channel}: flow control overflow, request rejected [{}]", hex(.bytes))]
    FlowControlRejected { channel: ChannelId, bytes: Vec<u8> },

    #[error("{channel}: {waits} flow control wait frames exceed limit [{}]", hex(.bytes))]
    WaitLimitExceeded {
        channel: ChannelId,
        waits: u32,
        bytes: Vec<u8>,
    },

    #[error(
        "{channel}: unexpected service id 0x{received:02X}, expected 0x{expected:02X} [{}]",
        hex(.bytes)
    )]
    UnexpectedServiceId {
        channel: ChannelId,
        expected: u8,
        received: u8,
        bytes: Vec<u8>,
    },

    #[error(
        "{channel}: negative response to 0x{request_sid:02X}: {} [{}]",
        nrc_text(.nrc),
        hex(.bytes)
    )]
    UnexpectedNegativeResponse {
        channel: ChannelId,
        request_sid: u8,
        nrc: u8,
        bytes: Vec<u8>,
    },

    #[error("{channel}: invalid response: {reason} [{}]", hex(.bytes))]
    InvalidResponse {
        channel: ChannelId,
        reason: String,
        bytes: Vec<u8>,
    },

    #[error(
        "{channel}: no final response to 0x{request_sid:02X} after {elapsed_ms} ms [{}]",
        hex(.bytes)
    )]
    ResponseTimeout {
        channel: ChannelId,
        request_sid: u8,
        elapsed_ms: u64,
        bytes: Vec<u8>,
    },

    #[error("{channel}: payload of {length} bytes exceeds 4095")]
    PayloadTooLong { channel: ChannelId, length: usize },

    #[error("{channel}: empty request")]
    EmptyRequest { channel: ChannelId },

    #[error("{channel}: not subscribed")]
    UnknownChannel { channel: ChannelId },

    #[error("{channel}: already subscribed")]
    ChannelExists { channel: ChannelId },

    #[error("{channel}: invalid periodic frame [{}]: {reason}", hex(.bytes))]
    InvalidPeriodicFrame {
        channel: ChannelId,
        bytes: Vec<u8>,
        reason: String,
    },

    #[error("periodic task {handle} is not running")]
    UnknownTask { handle: u64 },

    #[error("{channel}: invalid parameter: {reason}")]
    InvalidParameter { channel: ChannelId, reason: String },

    #[error("{channel}: bus error: {reason}")]
    Bus { channel: ChannelId, reason: String },
}

impl EngineError {
    pub fn channel(&self) -> Option<&ChannelId> {
        match self {
            Self::MalformedFrame { channel, .. }
            | Self::OutOfOrderFrame { channel, .. }
            | Self::ReassemblyAbandoned { channel, .. }
            | Self::ConsecutiveFrameTimeout { channel, .. }
            | Self::FlowControlTimeout { channel, .. }
            | Self::FlowControlRejected { channel, .. }
            | Self::WaitLimitExceeded { channel, .. }
            | Self::UnexpectedServiceId { channel, .. }
            | Self::UnexpectedNegativeResponse { channel, .. }
            | Self::InvalidResponse { channel, .. }
            | Self::ResponseTimeout { channel, .. }
            | Self::PayloadTooLong { channel, .. }
            | Self::EmptyRequest { channel }
            | Self::UnknownChannel { channel }
            | Self::ChannelExists { channel }
            | Self::InvalidPeriodicFrame { channel, .. }
            | Self::InvalidParameter { channel, .. }
            | Self::Bus { channel, .. } => Some(channel),
            Self::UnknownTask { .. } => None,
        }
    }

    /// Timeouts are kept apart from protocol failures so callers can retry them
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConsecutiveFrameTimeout { .. }
                | Self::FlowControlTimeout { .. }
                | Self::ResponseTimeout { .. }
        )
    }

    pub(crate) fn bus(channel: &ChannelId, reason: impl Into<String>) -> Self {
        Self::Bus {
            channel: channel.clone(),
            reason: reason.into(),
        }
    }
}

fn nrc_text(nrc: &u8) -> String {
    nrc_label(*nrc)
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> ChannelId {
        ChannelId::new(0x7B3, 0x7BB, "body")
    }

    #[test]
    fn test_negative_response_message_names_nrc() {
        let err = EngineError::UnexpectedNegativeResponse {
            channel: body(),
            request_sid: 0x22,
            nrc: 0x31,
            bytes: vec![0x7F, 0x22, 0x31],
        };
        let text = err.to_string();
        assert!(text.contains("requestOutOfRange (0x31)"));
        assert!(text.contains("[7F 22 31]"));
        assert!(text.contains("0x7B3"));
    }

    #[test]
    fn test_out_of_order_message() {
        let err = EngineError::OutOfOrderFrame {
            channel: body(),
            expected: 1,
            received: 3,
            bytes: vec![0x23, 0x00],
        };
        assert!(err.to_string().contains("expected sequence 1, got 3 [23 00]"));
    }

    #[test]
    fn test_channel_accessor() {
        let err = EngineError::FlowControlTimeout {
            channel: body(),
            bytes: vec![0x10, 0x0C],
        };
        assert_eq!(err.channel(), Some(&body()));
        assert_eq!(EngineError::UnknownTask { handle: 4 }.channel(), None);
    }

    #[test]
    fn test_timeouts_are_distinguishable() {
        let timeout = EngineError::ResponseTimeout {
            channel: body(),
            request_sid: 0x22,
            elapsed_ms: 2000,
            bytes: vec![0x22, 0xF1, 0x90],
        };
        let negative = EngineError::UnexpectedNegativeResponse {
            channel: body(),
            request_sid: 0x22,
            nrc: 0x31,
            bytes: vec![0x7F, 0x22, 0x31],
        };
        assert!(timeout.is_timeout());
        assert!(!negative.is_timeout());
    }
}
