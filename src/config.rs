use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::bus::types::{CAN_DLC, DEFAULT_PADDING, MAX_EXTENDED_ID};
use crate::channel::{ChannelId, ChannelSettings};
use crate::tp::flow_control::{is_valid_separation_time, FlowControlParams};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid hex frame {frame:?}: {source}")]
    Hex {
        frame: String,
        #[source]
        source: hex::FromHexError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Protocol timers, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Budget for the first response to a request
    pub p2_ms: u64,
    /// Budget re-armed by each responsePending (0x78)
    pub p2_star_ms: u64,
    /// Sender wait for FlowControl
    pub n_bs_ms: u64,
    /// Receiver wait between ConsecutiveFrames
    pub n_cr_ms: u64,
    /// Consecutive FlowControl Wait frames tolerated, 0 = unlimited
    pub wait_frame_max: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            p2_ms: 2000,
            p2_star_ms: 5000,
            n_bs_ms: 1000,
            n_cr_ms: 1000,
            wait_frame_max: 0,
        }
    }
}

impl TimingConfig {
    pub fn p2(&self) -> Duration {
        Duration::from_millis(self.p2_ms)
    }

    pub fn p2_star(&self) -> Duration {
        Duration::from_millis(self.p2_star_ms)
    }

    pub fn n_bs(&self) -> Duration {
        Duration::from_millis(self.n_bs_ms)
    }

    pub fn n_cr(&self) -> Duration {
        Duration::from_millis(self.n_cr_ms)
    }
}

/// A repeating transmission started from configuration (heartbeat, tester present)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodicConfig {
    pub channel: ChannelId,
    /// Hex bytes, spaces allowed: "02 3E 80"
    pub frame: String,
    pub interval_ms: u64,
}

impl PeriodicConfig {
    pub fn frame_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        let compact: String = self.frame.split_whitespace().collect();
        hex::decode(&compact).map_err(|source| ConfigError::Hex {
            frame: self.frame.clone(),
            source,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fill byte for transmitted frames; `null` sends frames at their natural length
    pub padding: Option<u8>,
    pub flow_control: FlowControlParams,
    pub timing: TimingConfig,
    pub channels: Vec<ChannelId>,
    pub periodic: Vec<PeriodicConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            padding: Some(DEFAULT_PADDING),
            flow_control: FlowControlParams::default(),
            timing: TimingConfig::default(),
            channels: Vec::new(),
            periodic: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&text)?;
        log::info!(
            "Loaded config from {} ({} channels, {} periodic)",
            path.display(),
            config.channels.len(),
            config.periodic.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_separation_time(self.flow_control.separation_time) {
            return Err(ConfigError::Invalid(format!(
                "separation_time 0x{:02X} is reserved",
                self.flow_control.separation_time
            )));
        }
        let timers = [
            ("p2_ms", self.timing.p2_ms),
            ("p2_star_ms", self.timing.p2_star_ms),
            ("n_bs_ms", self.timing.n_bs_ms),
            ("n_cr_ms", self.timing.n_cr_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.send_id == channel.receive_id {
                return Err(ConfigError::Invalid(format!(
                    "{}: send and receive id are the same",
                    channel
                )));
            }
            if channel.send_id > MAX_EXTENDED_ID || channel.receive_id > MAX_EXTENDED_ID {
                return Err(ConfigError::Invalid(format!(
                    "{}: identifier exceeds 29 bits",
                    channel
                )));
            }
            if !seen.insert(channel) {
                return Err(ConfigError::Invalid(format!("{}: listed twice", channel)));
            }
        }

        for task in &self.periodic {
            if task.interval_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}: periodic interval must be non-zero",
                    task.channel
                )));
            }
            let frame = task.frame_bytes()?;
            if frame.is_empty() || frame.len() > CAN_DLC {
                return Err(ConfigError::Invalid(format!(
                    "{}: periodic frame must be 1-8 bytes, got {}",
                    task.channel,
                    frame.len()
                )));
            }
        }
        Ok(())
    }

    pub fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            padding: self.padding,
            flow_control: self.flow_control,
            timing: self.timing,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CanIdRepr {
    Number(u32),
    Text(String),
}

/// Accepts `1971` as well as `"0x7B3"` / `"7B3"`
pub(crate) fn can_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match CanIdRepr::deserialize(deserializer)? {
        CanIdRepr::Number(id) => Ok(id),
        CanIdRepr::Text(text) => {
            let digits = text
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            u32::from_str_radix(digits, 16).map_err(|e| {
                serde::de::Error::custom(format!("invalid CAN id {:?}: {}", text, e))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "padding": 170,
        "flow_control": { "block_size": 8, "separation_time": 10 },
        "timing": { "p2_ms": 150 },
        "channels": [
            { "send_id": "0x7B3", "receive_id": "0x7BB", "namespace": "body" },
            { "send_id": 1814, "receive_id": 1822, "namespace": "body" }
        ],
        "periodic": [
            {
                "channel": { "send_id": "0x400", "receive_id": "0x401", "namespace": "body" },
                "frame": "08 01 00 00 16 04 00 01",
                "interval_ms": 100
            }
        ]
    }"#;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.padding, Some(0x00));
        assert!(config.flow_control.frame_control_auto);
        assert_eq!(config.timing.p2(), Duration::from_millis(2000));
        assert_eq!(config.timing.p2_star(), Duration::from_millis(5000));
        assert_eq!(config.timing.wait_frame_max, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.padding, Some(0xAA));
        assert_eq!(config.flow_control.block_size, 8);
        assert_eq!(config.flow_control.separation_time, 10);
        assert!(config.flow_control.frame_control_auto);
        assert_eq!(config.timing.p2_ms, 150);
        assert_eq!(config.timing.p2_star_ms, 5000);
        assert_eq!(config.channels[0], ChannelId::new(0x7B3, 0x7BB, "body"));
        assert_eq!(config.channels[1], ChannelId::new(0x716, 0x71E, "body"));
        assert_eq!(
            config.periodic[0].frame_bytes().unwrap(),
            vec![0x08, 0x01, 0x00, 0x00, 0x16, 0x04, 0x00, 0x01]
        );
        assert_eq!(config.periodic[0].interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_empty_object_is_default() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_null_padding() {
        let config = EngineConfig::from_json_str(r#"{"padding": null}"#).unwrap();
        assert_eq!(config.padding, None);
        assert_eq!(config.channel_settings().padding, None);
    }

    #[test]
    fn test_rejects_reserved_separation_time() {
        let err =
            EngineConfig::from_json_str(r#"{"flow_control": {"separation_time": 128}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_timer() {
        let err = EngineConfig::from_json_str(r#"{"timing": {"n_cr_ms": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("n_cr_ms"));
    }

    #[test]
    fn test_rejects_duplicate_channel() {
        let json = r#"{"channels": [
            {"send_id": "7B3", "receive_id": "7BB", "namespace": "body"},
            {"send_id": 1971, "receive_id": 1979, "namespace": "body"}
        ]}"#;
        let err = EngineConfig::from_json_str(json).unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_rejects_bad_periodic_frame() {
        let mut config = EngineConfig::default();
        config.periodic.push(PeriodicConfig {
            channel: ChannelId::new(0x7DF, 0x7E8, "body"),
            frame: "02 3E 8".to_string(),
            interval_ms: 1000,
        });
        assert!(matches!(config.validate(), Err(ConfigError::Hex { .. })));

        config.periodic[0].frame = "00 11 22 33 44 55 66 77 88".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.periodic[0].frame = "023E80".to_string();
        assert!(config.validate().is_ok());

        config.periodic[0].interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_can_id() {
        let json = r#"{"channels": [{"send_id": "0xZZ", "receive_id": 1, "namespace": "x"}]}"#;
        assert!(matches!(
            EngineConfig::from_json_str(json),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("udsbench-config-{}.json", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();
        let config = EngineConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.channels.len(), 2);

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_serialize_round_trip_through_json() {
        let config = EngineConfig::from_json_str(SAMPLE).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }
}
