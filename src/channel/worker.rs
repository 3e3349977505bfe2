//! Frame-arrival path of one channel. The worker thread is the sole writer of
//! the channel's reassembly state; everything it learns reaches the handle
//! through channels or the shared logs.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use crossbeam_channel::{after, never, select, Receiver, Sender};

use super::{Frame, Inbound, Shared};
use crate::bus::types::CanFrame;
use crate::error::EngineError;
use crate::tp::flow_control::{FlowControl, FlowControlParams};
use crate::tp::frame::{classify, Pci};
use crate::tp::reassembly::{Progress, ReassemblyError, ReassemblyState};
use crate::trace::{hex, LogDirection};
use crate::uds::correlator::decode_unsolicited;

pub(super) fn spawn(
    shared: Arc<Shared>,
    frames: Receiver<CanFrame>,
    stop: Receiver<()>,
    inbound: Sender<Inbound>,
    flow_control: Sender<FlowControl>,
    n_cr: Duration,
) -> io::Result<JoinHandle<()>> {
    let name = format!("rx-{:03X}", shared.id.receive_id);
    thread::Builder::new().name(name).spawn(move || {
        let mut worker = Worker {
            shared,
            state: ReassemblyState::new(),
            inbound,
            flow_control,
            latched: None,
        };
        worker.run(&frames, &stop, n_cr);
    })
}

struct Worker {
    shared: Arc<Shared>,
    state: ReassemblyState,
    inbound: Sender<Inbound>,
    flow_control: Sender<FlowControl>,
    /// Receiver parameters advertised for the message being collected
    latched: Option<FlowControlParams>,
}

impl Worker {
    fn run(&mut self, frames: &Receiver<CanFrame>, stop: &Receiver<()>, n_cr: Duration) {
        loop {
            // N_Cr only runs while a multi-frame message is being collected
            let n_cr_timer = if self.state.in_flight() {
                after(n_cr)
            } else {
                never()
            };
            select! {
                recv(stop) -> _ => break,
                recv(frames) -> frame => match frame {
                    Ok(frame) => self.on_frame(frame),
                    Err(_) => break,
                },
                recv(n_cr_timer) -> _ => self.on_consecutive_timeout(),
            }
        }

        if self.state.in_flight() {
            log::debug!(
                "{}: discarding {} of {} bytes at teardown",
                self.shared.id,
                self.state.accumulated().len(),
                self.state.declared_total_length()
            );
        }
    }

    fn on_frame(&mut self, frame: CanFrame) {
        let id = self.shared.id.clone();
        log::debug!("{} RX [{}]", id, hex(&frame.data));
        self.shared.log().frames.push(Frame {
            channel: id.clone(),
            bytes: frame.data.clone(),
            arrival: Local::now(),
        });

        let classified = match classify(&frame.data) {
            Ok(classified) => classified,
            Err(malformed) => {
                let err = EngineError::MalformedFrame {
                    channel: id,
                    bytes: malformed.bytes,
                    reason: malformed.reason,
                };
                self.report(err, &frame.data, false);
                return;
            }
        };

        match classified.pci {
            Pci::FlowControl { .. } => {
                let Some(fc) = FlowControl::from_pci(&classified.pci) else {
                    return;
                };
                if self.shared.is_transmitting() {
                    // Sender side is gone only during teardown
                    let _ = self.flow_control.send(fc);
                } else {
                    log::warn!("{}: flow control [{}] while idle, ignored", id, hex(&frame.data));
                }
                return;
            }
            Pci::Reserved { pci } => {
                log::warn!("{}: reserved PCI 0x{:X} [{}], ignored", id, pci, hex(&frame.data));
                return;
            }
            _ => {}
        }
        if classified.unexpected_sid() {
            log::debug!("{}: [{}] is not a read or negative response", id, hex(&frame.data));
        }

        // Every FlowControl of one message advertises the parameters seen at its FirstFrame
        if matches!(classified.pci, Pci::FirstFrame { .. }) {
            self.latched = Some(self.shared.params());
        }
        let params = self.latched.unwrap_or_else(|| self.shared.params());
        match self.state.on_frame(&classified.pci, params.block_size) {
            Ok(step) => {
                if let Some(abandoned) = step.abandoned {
                    let err = EngineError::ReassemblyAbandoned {
                        channel: id.clone(),
                        declared_total_length: abandoned.declared_total_length,
                        received: abandoned.partial.len(),
                        bytes: abandoned.partial,
                    };
                    self.report(err, &frame.data, false);
                }
                match step.progress {
                    Progress::Complete(message) => self.deliver(message),
                    Progress::FlowControlDue
                    | Progress::Continue {
                        block_boundary: true,
                    } => self.acknowledge(params),
                    Progress::Continue { .. } => {}
                    Progress::Ignored => {
                        log::debug!("{}: [{}] outside reassembly, ignored", id, hex(&frame.data));
                    }
                }
            }
            Err(ReassemblyError::OutOfOrder { expected, received }) => {
                let err = EngineError::OutOfOrderFrame {
                    channel: id,
                    expected,
                    received,
                    bytes: frame.data.clone(),
                };
                self.report(err, &frame.data, true);
            }
        }
    }

    fn deliver(&mut self, payload: Vec<u8>) {
        if payload.is_empty() {
            log::warn!("{}: empty single frame ignored", self.shared.id);
            return;
        }
        let message = decode_unsolicited(&self.shared.id, payload.clone());
        self.shared.log().messages.push(message);
        if self.shared.is_awaiting() {
            let _ = self.inbound.send(Ok(payload));
        }
    }

    /// FlowControl owed to the sender after a FirstFrame or a completed block
    fn acknowledge(&mut self, params: FlowControlParams) {
        if !params.frame_control_auto {
            log::debug!("{}: flow control left to caller", self.shared.id);
            return;
        }
        if !params.delay().is_zero() {
            thread::sleep(params.delay());
        }
        let frame = params.to_frame(self.shared.padding);
        if let Err(reason) = self.shared.send_frame(&frame) {
            let err = EngineError::bus(&self.shared.id, reason);
            self.report(err, &frame, true);
        }
    }

    fn on_consecutive_timeout(&mut self) {
        let Some(abandoned) = self.state.abort() else {
            return;
        };
        let err = EngineError::ConsecutiveFrameTimeout {
            channel: self.shared.id.clone(),
            declared_total_length: abandoned.declared_total_length,
            received: abandoned.partial.len(),
            bytes: abandoned.partial,
        };
        self.report(err, &[], true);
    }

    /// Record a receive-side failure. `surface` also fails whoever is waiting
    /// on the channel; the rest are only logged.
    fn report(&mut self, err: EngineError, data: &[u8], surface: bool) {
        if surface {
            log::error!("{}", err);
        } else {
            log::warn!("{}", err);
        }
        self.shared
            .tracer
            .emit(LogDirection::Error, &self.shared.id, data, &err.to_string());
        self.shared.log().errors.push(err.clone());
        if surface && self.shared.is_awaiting() {
            let _ = self.inbound.send(Err(err));
        }
    }
}
