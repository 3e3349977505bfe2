use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Sender};

use crate::bus::types::{CanFrame, Subscription};
use crate::bus::Bus;

/// A frame put on the bus by an attached node, optionally after a delay
#[derive(Debug, Clone)]
pub struct Reply {
    pub frame: CanFrame,
    /// Offset from the moment the triggering frame was seen
    pub delay: Duration,
}

impl Reply {
    pub fn now(frame: CanFrame) -> Self {
        Self {
            frame,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration, frame: CanFrame) -> Self {
        Self { frame, delay }
    }
}

/// Something living on the virtual bus that reacts to traffic (an emulated ECU).
pub trait BusNode: Send {
    /// Called for every frame written through [`Bus::send`].
    /// Returns frames this node puts on the bus in response.
    fn on_frame(&mut self, namespace: &str, frame: &CanFrame) -> Vec<Reply>;
}

/// Record of one frame that crossed the bus
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub namespace: String,
    pub frame: CanFrame,
    pub at: Instant,
}

struct Subscriber {
    handle: u32,
    namespace: String,
    can_id: u32,
    tx: Sender<CanFrame>,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_handle: AtomicU32,
    sent: Mutex<Vec<SentFrame>>,
    nodes: Mutex<Vec<Box<dyn BusNode>>>,
    /// If true, node replies are swallowed (simulates an ECU that went quiet)
    silent: AtomicBool,
}

impl Inner {
    fn record(&self, namespace: &str, frame: &CanFrame) {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(SentFrame {
                namespace: namespace.to_string(),
                frame: frame.clone(),
                at: Instant::now(),
            });
    }

    fn deliver(&self, namespace: &str, frame: &CanFrame) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        for sub in subscribers.iter() {
            if sub.can_id == frame.can_id && sub.namespace == namespace {
                // A closed receiver just means the subscriber is tearing down
                let _ = sub.tx.send(frame.clone());
            }
        }
    }

    fn emit(&self, namespace: &str, frame: &CanFrame) {
        self.record(namespace, frame);
        self.deliver(namespace, frame);
    }
}

/// In-memory stand-in for the signal broker.
/// Routes frames to subscribers by (namespace, CAN id), records every frame with
/// its send instant for cadence assertions, and lets attached nodes answer.
pub struct VirtualBus {
    inner: Arc<Inner>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_handle: AtomicU32::new(1),
                sent: Mutex::new(Vec::new()),
                nodes: Mutex::new(Vec::new()),
                silent: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a node that sees all transmitted frames
    pub fn attach<N: BusNode + 'static>(&self, node: N) {
        self.inner
            .nodes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(node));
    }

    /// Put a frame on the bus as if a remote node had sent it.
    /// Attached nodes do not see injected frames.
    pub fn inject(&self, namespace: &str, frame: CanFrame) {
        self.inner.emit(namespace, &frame);
    }

    /// Silent mode: nodes still run but their replies never reach the bus
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::Relaxed);
    }

    /// All frames that crossed the bus, in order
    pub fn sent_frames(&self) -> Vec<SentFrame> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Frames with the given CAN id, in order
    pub fn frames_on(&self, can_id: u32) -> Vec<SentFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|s| s.frame.can_id == can_id)
            .collect()
    }

    pub fn clear_sent(&self) {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    fn dispatch_replies(&self, namespace: &str, replies: Vec<Reply>) {
        if replies.is_empty() || self.inner.silent.load(Ordering::Relaxed) {
            return;
        }
        if replies.iter().all(|r| r.delay.is_zero()) {
            for reply in &replies {
                self.inner.emit(namespace, &reply.frame);
            }
            return;
        }

        // Delayed batch keeps its own order on a helper thread. Weak so a dropped
        // bus is not kept alive by late replies.
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let namespace = namespace.to_string();
        let start = Instant::now();
        thread::spawn(move || {
            for reply in replies {
                let due = start + reply.delay;
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
                match weak.upgrade() {
                    Some(inner) => {
                        if !inner.silent.load(Ordering::Relaxed) {
                            inner.emit(&namespace, &reply.frame);
                        }
                    }
                    None => return,
                }
            }
        });
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for VirtualBus {
    fn send(&self, namespace: &str, frame: &CanFrame) -> Result<(), String> {
        if frame.data.len() > crate::bus::types::CAN_DLC {
            return Err(format!(
                "frame for 0x{:03X} carries {} bytes",
                frame.can_id,
                frame.data.len()
            ));
        }
        self.inner.emit(namespace, frame);

        let replies: Vec<Reply> = {
            let mut nodes = self.inner.nodes.lock().unwrap_or_else(|p| p.into_inner());
            nodes
                .iter_mut()
                .flat_map(|node| node.on_frame(namespace, frame))
                .collect()
        };
        self.dispatch_replies(namespace, replies);
        Ok(())
    }

    fn subscribe(&self, namespace: &str, can_id: u32) -> Result<Subscription, String> {
        let (tx, rx) = unbounded();
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscriber {
                handle,
                namespace: namespace.to_string(),
                can_id,
                tx,
            });
        Ok(Subscription { handle, frames: rx })
    }

    fn unsubscribe(&self, handle: u32) -> Result<(), String> {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        match subscribers.iter().position(|s| s.handle == handle) {
            Some(pos) => {
                subscribers.remove(pos);
                Ok(())
            }
            None => Err(format!("unknown subscription handle {}", handle)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every frame on 0x7B3 with a fixed frame on 0x7BB
    struct Echo {
        delay: Duration,
    }

    impl BusNode for Echo {
        fn on_frame(&mut self, _namespace: &str, frame: &CanFrame) -> Vec<Reply> {
            if frame.can_id != 0x7B3 {
                return vec![];
            }
            vec![Reply::after(
                self.delay,
                CanFrame::new(0x7BB, &[0x02, 0x7E, 0x00]),
            )]
        }
    }

    #[test]
    fn test_routes_by_namespace_and_id() {
        let bus = VirtualBus::new();
        let a = bus.subscribe("body", 0x7BB).unwrap();
        let b = bus.subscribe("chassis", 0x7BB).unwrap();
        bus.inject("body", CanFrame::new(0x7BB, &[0x01, 0x00]));
        assert_eq!(a.frames.try_recv().unwrap().data, vec![0x01, 0x00]);
        assert!(b.frames.try_recv().is_err());
    }

    #[test]
    fn test_node_reply_immediate() {
        let bus = VirtualBus::new();
        bus.attach(Echo {
            delay: Duration::ZERO,
        });
        let sub = bus.subscribe("ns", 0x7BB).unwrap();
        bus.send("ns", &CanFrame::new(0x7B3, &[0x02, 0x3E, 0x00]))
            .unwrap();
        assert_eq!(sub.frames.try_recv().unwrap().data, vec![0x02, 0x7E, 0x00]);
        assert_eq!(bus.sent_frames().len(), 2);
    }

    #[test]
    fn test_node_reply_delayed() {
        let bus = VirtualBus::new();
        bus.attach(Echo {
            delay: Duration::from_millis(30),
        });
        let sub = bus.subscribe("ns", 0x7BB).unwrap();
        let start = Instant::now();
        bus.send("ns", &CanFrame::new(0x7B3, &[0x02, 0x3E, 0x00]))
            .unwrap();
        assert!(sub.frames.try_recv().is_err());
        let frame = sub.frames.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.data, vec![0x02, 0x7E, 0x00]);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_silent_mode_drops_replies() {
        let bus = VirtualBus::new();
        bus.attach(Echo {
            delay: Duration::ZERO,
        });
        bus.set_silent(true);
        let sub = bus.subscribe("ns", 0x7BB).unwrap();
        bus.send("ns", &CanFrame::new(0x7B3, &[0x02, 0x3E, 0x00]))
            .unwrap();
        assert!(sub.frames.try_recv().is_err());
        assert_eq!(bus.frames_on(0x7B3).len(), 1);
        assert!(bus.frames_on(0x7BB).is_empty());
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let bus = VirtualBus::new();
        assert!(bus.send("ns", &CanFrame::new(0x7B3, &[0u8; 9])).is_err());
    }

    #[test]
    fn test_unsubscribe_closes_receiver() {
        let bus = VirtualBus::new();
        let sub = bus.subscribe("ns", 0x7BB).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.handle).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.frames.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
