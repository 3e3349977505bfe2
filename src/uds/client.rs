use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;
use crate::error::{EngineError, Result};
use crate::trace::{LogDirection, Tracer};
use crate::uds::correlator::{correlate, Correlation, Message, MessageOutcome};

/// UDS client over one subscribed channel.
///
/// Sends a request, then waits for the completed message that answers it.
/// responsePending (0x78) re-arms the deadline to P2* instead of ending the wait.
pub struct UdsClient {
    channel: Arc<Channel>,
    tracer: Tracer,
}

impl UdsClient {
    pub fn new(channel: Arc<Channel>) -> Self {
        let tracer = channel.tracer().clone();
        Self { channel, tracer }
    }

    fn log(&self, direction: LogDirection, data: &[u8], description: &str) {
        self.tracer
            .emit(direction, self.channel.id(), data, description);
    }

    /// Send a request and wait for its final response.
    ///
    /// A negative response is a valid result and comes back as `Ok`; use
    /// [`Message::into_result`] to turn it into an error.
    pub fn send_request(&self, request: &[u8]) -> Result<Message> {
        let id = self.channel.id();
        let Some(&service_id) = request.first() else {
            return Err(EngineError::EmptyRequest {
                channel: id.clone(),
            });
        };
        let timing = self.channel.timing();

        // Held until the final response, so concurrent callers take turns
        let exchange = self.channel.begin_exchange();

        self.log(LogDirection::Tx, request, &describe_service(service_id));
        if let Err(e) = self.channel.transmit(request) {
            self.log(LogDirection::Error, request, &e.to_string());
            return Err(e);
        }

        let start = Instant::now();
        let mut deadline = start + timing.p2();

        loop {
            let now = Instant::now();
            if now >= deadline {
                self.log(LogDirection::Error, &[], "Timeout waiting for response");
                return Err(EngineError::ResponseTimeout {
                    channel: id.clone(),
                    request_sid: service_id,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    bytes: request.to_vec(),
                });
            }

            let payload = match exchange.recv(deadline - now) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    self.log(LogDirection::Error, &[], &e.to_string());
                    return Err(e);
                }
            };

            match correlate(id, service_id, payload.clone()) {
                Ok(Correlation::Pending { .. }) => {
                    self.log(LogDirection::Pending, &payload, "Response pending...");
                    deadline = Instant::now() + timing.p2_star();
                }
                Ok(Correlation::Final(message)) => {
                    match &message.outcome {
                        MessageOutcome::Positive { .. } => {
                            self.log(LogDirection::Rx, &payload, &describe_service(service_id))
                        }
                        MessageOutcome::Negative { nrc, .. } => self.log(
                            LogDirection::Error,
                            &payload,
                            &format!("NRC: {}", crate::uds::error::nrc_label(*nrc)),
                        ),
                        MessageOutcome::Error { reason } => {
                            self.log(LogDirection::Error, &payload, reason)
                        }
                    }
                    return Ok(message);
                }
                Err(e) => {
                    self.log(LogDirection::Error, &payload, &e.to_string());
                    return Err(e);
                }
            }
        }
    }

    /// Send without waiting for a response (e.g. TesterPresent with suppressPosRspMsgIndicationBit)
    pub fn send_only(&self, request: &[u8]) -> Result<()> {
        let description = request
            .first()
            .map(|sid| describe_service(*sid))
            .unwrap_or_default();
        self.log(LogDirection::Tx, request, &description);
        self.channel.transmit(request)
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

pub fn describe_service(service_id: u8) -> String {
    match service_id {
        0x10 => "DiagnosticSessionControl".to_string(),
        0x11 => "ECUReset".to_string(),
        0x22 => "ReadDataByIdentifier".to_string(),
        0x27 => "SecurityAccess".to_string(),
        0x2E => "WriteDataByIdentifier".to_string(),
        0x2F => "InputOutputControlByIdentifier".to_string(),
        0x31 => "RoutineControl".to_string(),
        0x34 => "RequestDownload".to_string(),
        0x36 => "TransferData".to_string(),
        0x37 => "RequestTransferExit".to_string(),
        0x3E => "TesterPresent".to_string(),
        _ => format!("Service 0x{:02X}", service_id),
    }
}
