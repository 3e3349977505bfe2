use std::fmt;
use std::sync::{Arc, RwLock};

use crate::channel::ChannelId;

/// Log entry direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum LogDirection {
    Tx,
    Rx,
    Error,
    Pending,
}

impl fmt::Display for LogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogDirection::Tx => write!(f, "TX"),
            LogDirection::Rx => write!(f, "RX"),
            LogDirection::Error => write!(f, "ERR"),
            LogDirection::Pending => write!(f, "..."),
        }
    }
}

/// Log entry for UDS communication on one channel
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogEntry {
    pub direction: LogDirection,
    pub channel: String,
    pub data_hex: String,
    pub timestamp: String,
    pub description: String,
}

/// Callback type for receiving trace entries
pub type TraceCallback = Box<dyn Fn(LogEntry) + Send + Sync>;

/// Fan-out point for trace entries. Cloned into every channel worker and
/// periodic task; the callback can be swapped at any time.
#[derive(Clone, Default)]
pub struct Tracer {
    callback: Arc<RwLock<Option<TraceCallback>>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: TraceCallback) {
        *self.callback.write().unwrap_or_else(|p| p.into_inner()) = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.write().unwrap_or_else(|p| p.into_inner()) = None;
    }

    pub fn emit(&self, direction: LogDirection, channel: &ChannelId, data: &[u8], description: &str) {
        let entry = LogEntry {
            direction,
            channel: channel.to_string(),
            data_hex: hex(data),
            timestamp: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
            description: description.to_string(),
        };
        log::debug!(
            "[UDS] {} {} [{}] {}{}",
            entry.timestamp,
            entry.channel,
            entry.direction,
            entry.data_hex,
            if entry.description.is_empty() {
                String::new()
            } else {
                format!(" {}", entry.description)
            }
        );
        if let Some(ref cb) = *self.callback.read().unwrap_or_else(|p| p.into_inner()) {
            cb(entry);
        }
    }
}

/// Space-separated upper-case hex, the format used in every log line
pub fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
