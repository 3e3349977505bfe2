pub mod types;
pub mod virtual_bus;

use std::sync::{Arc, Mutex};

use types::{CanFrame, Subscription};

/// Trait abstracting the external bus-access service (send, receive, subscribe).
/// Implemented by a signal-broker client in production and by `VirtualBus` in tests.
pub trait Bus: Send + Sync {
    fn send(&self, namespace: &str, frame: &CanFrame) -> Result<(), String>;
    fn subscribe(&self, namespace: &str, can_id: u32) -> Result<Subscription, String>;
    fn unsubscribe(&self, handle: u32) -> Result<(), String>;
}

/// Shared transmit path. Every writer (request senders, flow-control replies,
/// periodic tasks) goes through one lock so frames hit the bus whole and in order.
#[derive(Clone)]
pub struct BusWriter {
    bus: Arc<dyn Bus>,
    write_lock: Arc<Mutex<()>>,
}

impl BusWriter {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn send(&self, namespace: &str, frame: &CanFrame) -> Result<(), String> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.bus.send(namespace, frame)
    }

    pub fn subscribe(&self, namespace: &str, can_id: u32) -> Result<Subscription, String> {
        self.bus.subscribe(namespace, can_id)
    }

    pub fn unsubscribe(&self, handle: u32) -> Result<(), String> {
        self.bus.unsubscribe(handle)
    }
}
