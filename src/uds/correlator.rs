//! Matches completed messages against the request that is waiting on the channel.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::channel::ChannelId;
use crate::error::{EngineError, Result};
use crate::tp::frame::SID_NEGATIVE_RESPONSE;
use crate::uds::error::NegativeResponseCode;

const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Services whose positive response echoes a 2-byte DID after the SID
const DID_SERVICES: &[u8] = &[0x22, 0x2E, 0x2F];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MessageOutcome {
    Positive { did: Option<u16>, payload: Vec<u8> },
    Negative { request_sid: u8, nrc: u8 },
    Error { reason: String },
}

/// A reassembled UDS message with its decoded outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub channel: ChannelId,
    pub sid: u8,
    pub raw: Vec<u8>,
    pub received_at: DateTime<Local>,
    pub outcome: MessageOutcome,
}

impl Message {
    fn new(channel: &ChannelId, raw: Vec<u8>, outcome: MessageOutcome) -> Self {
        Self {
            channel: channel.clone(),
            sid: raw.first().copied().unwrap_or(0),
            raw,
            received_at: Local::now(),
            outcome,
        }
    }

    pub fn did(&self) -> Option<u16> {
        match self.outcome {
            MessageOutcome::Positive { did, .. } => did,
            _ => None,
        }
    }

    /// Data record: bytes after SID (and DID when the service has one)
    pub fn payload(&self) -> &[u8] {
        match &self.outcome {
            MessageOutcome::Positive { payload, .. } => payload,
            _ => &[],
        }
    }

    pub fn payload_length(&self) -> usize {
        self.payload().len()
    }

    pub fn is_negative(&self) -> bool {
        matches!(self.outcome, MessageOutcome::Negative { .. })
    }

    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self.outcome {
            MessageOutcome::Negative { nrc, .. } => Some(NegativeResponseCode::from_byte(nrc)),
            _ => None,
        }
    }

    pub fn nrc_name(&self) -> Option<&'static str> {
        self.nrc().map(|nrc| nrc.name())
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            MessageOutcome::Error { reason } => Some(reason),
            _ => None,
        }
    }

    /// Treat anything but a positive response as a failure
    pub fn into_result(self) -> Result<Message> {
        match self.outcome {
            MessageOutcome::Positive { .. } => Ok(self),
            MessageOutcome::Negative { request_sid, nrc } => {
                Err(EngineError::UnexpectedNegativeResponse {
                    channel: self.channel,
                    request_sid,
                    nrc,
                    bytes: self.raw,
                })
            }
            MessageOutcome::Error { reason } => Err(EngineError::InvalidResponse {
                channel: self.channel,
                reason,
                bytes: self.raw,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// The answer to the request
    Final(Message),
    /// responsePending (0x78): keep waiting
    Pending { request_sid: u8 },
}

fn positive(channel: &ChannelId, service: u8, raw: Vec<u8>) -> Message {
    if DID_SERVICES.contains(&service) {
        if raw.len() < 3 {
            return Message::new(
                channel,
                raw,
                MessageOutcome::Error {
                    reason: "positive response too short for a data identifier".to_string(),
                },
            );
        }
        let did = u16::from_be_bytes([raw[1], raw[2]]);
        let payload = raw[3..].to_vec();
        return Message::new(
            channel,
            raw,
            MessageOutcome::Positive {
                did: Some(did),
                payload,
            },
        );
    }
    let payload = raw[1..].to_vec();
    Message::new(channel, raw, MessageOutcome::Positive { did: None, payload })
}

fn negative(channel: &ChannelId, raw: Vec<u8>) -> Message {
    match raw.get(1).copied().zip(raw.get(2).copied()) {
        Some((request_sid, nrc)) => {
            Message::new(channel, raw, MessageOutcome::Negative { request_sid, nrc })
        }
        None => Message::new(
            channel,
            raw,
            MessageOutcome::Error {
                reason: "negative response without NRC".to_string(),
            },
        ),
    }
}

/// Decide what a completed message means for the request `request_sid`.
pub fn correlate(channel: &ChannelId, request_sid: u8, raw: Vec<u8>) -> Result<Correlation> {
    let Some(&sid) = raw.first() else {
        return Err(EngineError::InvalidResponse {
            channel: channel.clone(),
            reason: "empty message".to_string(),
            bytes: raw,
        });
    };
    let expected = request_sid.wrapping_add(POSITIVE_RESPONSE_OFFSET);

    if sid == SID_NEGATIVE_RESPONSE {
        if let Some(&echoed) = raw.get(1) {
            if echoed != request_sid {
                return Err(EngineError::UnexpectedServiceId {
                    channel: channel.clone(),
                    expected: request_sid,
                    received: echoed,
                    bytes: raw,
                });
            }
        }
        if raw
            .get(2)
            .is_some_and(|&nrc| NegativeResponseCode::from_byte(nrc).is_pending())
        {
            return Ok(Correlation::Pending { request_sid });
        }
        return Ok(Correlation::Final(negative(channel, raw)));
    }

    if sid == expected {
        return Ok(Correlation::Final(positive(channel, request_sid, raw)));
    }

    Err(EngineError::UnexpectedServiceId {
        channel: channel.clone(),
        expected,
        received: sid,
        bytes: raw,
    })
}

/// Decode a message with no request context, for the channel's message log.
pub fn decode_unsolicited(channel: &ChannelId, raw: Vec<u8>) -> Message {
    match raw.first().copied() {
        None => Message::new(
            channel,
            raw,
            MessageOutcome::Error {
                reason: "empty message".to_string(),
            },
        ),
        Some(SID_NEGATIVE_RESPONSE) => negative(channel, raw),
        Some(sid) if sid >= POSITIVE_RESPONSE_OFFSET => {
            positive(channel, sid - POSITIVE_RESPONSE_OFFSET, raw)
        }
        Some(sid) => Message::new(
            channel,
            raw,
            MessageOutcome::Error {
                reason: format!("0x{:02X} is not a response service id", sid),
            },
        ),
    }
}
