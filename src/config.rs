use crate::defaults;
use crate::error::{MicwatchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub vad: VadConfig,
    pub wakeword: WakewordConfig,
    pub mqtt: MqttConfig,
    pub stream: StreamConfig,
    pub devices: Vec<DeviceEntry>,
}

/// Voice activity timing shared by all devices unless overridden
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadConfig {
    pub threshold: f32,
    pub min_recording_time_ms: u64,
    pub min_silence_duration_ms: u64,
    pub max_recording_time_ms: u64,
}

/// Per-device replacement for individual VAD fields
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct VadOverride {
    pub threshold: Option<f32>,
    pub min_recording_time_ms: Option<u64>,
    pub min_silence_duration_ms: Option<u64>,
    pub max_recording_time_ms: Option<u64>,
}

/// Wakeword helper configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WakewordConfig {
    /// Helper program and its arguments. Empty means no helper is configured.
    pub command: Vec<String>,
    pub keyword: String,
    pub sensitivity: f32,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub topics: TopicTemplates,
}

/// Topic templates; `{device_id}` is replaced per device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopicTemplates {
    pub wakeword: String,
    pub vad_start: String,
    pub vad_stop: String,
    pub status: String,
}

/// Audio stream acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub ffmpeg: String,
    pub rtsp_transport: String,
    pub rtsp_path: String,
    pub username: String,
    pub password: String,
    pub buffer_chunks: usize,
    pub read_chunk_bytes: usize,
    pub shutdown_timeout_ms: u64,
}

/// A device as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DeviceEntry {
    pub name: String,
    pub id: String,
    pub address: String,
    pub audio_source: u32,
    pub vad: Option<VadOverride>,
}

/// Immutable per-device settings handed to a session
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub id: String,
    /// Host (and optional port) with any http:// or https:// prefix removed.
    pub address: String,
    pub audio_source: u32,
    pub vad: VadConfig,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::VAD_THRESHOLD,
            min_recording_time_ms: defaults::MIN_RECORDING_TIME_MS,
            min_silence_duration_ms: defaults::MIN_SILENCE_DURATION_MS,
            max_recording_time_ms: defaults::MAX_RECORDING_TIME_MS,
        }
    }
}

impl VadConfig {
    pub fn min_recording_time(&self) -> Duration {
        Duration::from_millis(self.min_recording_time_ms)
    }

    pub fn min_silence_duration(&self) -> Duration {
        Duration::from_millis(self.min_silence_duration_ms)
    }

    pub fn max_recording_time(&self) -> Duration {
        Duration::from_millis(self.max_recording_time_ms)
    }

    /// Returns a copy with every field set in `over` replaced.
    pub fn merged(&self, over: &VadOverride) -> Self {
        Self {
            threshold: over.threshold.unwrap_or(self.threshold),
            min_recording_time_ms: over
                .min_recording_time_ms
                .unwrap_or(self.min_recording_time_ms),
            min_silence_duration_ms: over
                .min_silence_duration_ms
                .unwrap_or(self.min_silence_duration_ms),
            max_recording_time_ms: over
                .max_recording_time_ms
                .unwrap_or(self.max_recording_time_ms),
        }
    }

    fn validate(&self, prefix: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid(
                &format!("{prefix}.threshold"),
                "must be between 0.0 and 1.0",
            ));
        }
        if self.max_recording_time_ms == 0 {
            return Err(invalid(
                &format!("{prefix}.max_recording_time_ms"),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for WakewordConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            keyword: "porcupine".to_string(),
            sensitivity: 0.5,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: defaults::MQTT_PORT,
            client_id: "micwatch".to_string(),
            username: None,
            password: None,
            qos: defaults::MQTT_QOS,
            keep_alive_secs: 60,
            topics: TopicTemplates::default(),
        }
    }
}

impl Default for TopicTemplates {
    fn default() -> Self {
        Self {
            wakeword: "axis/{device_id}/wakeword".to_string(),
            vad_start: "axis/{device_id}/vad/start".to_string(),
            vad_stop: "axis/{device_id}/vad/stop".to_string(),
            status: "axis/{device_id}/status".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            rtsp_transport: "tcp".to_string(),
            rtsp_path: "/axis-media/media.amp?audio=1".to_string(),
            username: "root".to_string(),
            password: String::new(),
            buffer_chunks: defaults::BUFFER_CHUNKS,
            read_chunk_bytes: defaults::READ_CHUNK_BYTES,
            shutdown_timeout_ms: defaults::SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl StreamConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl DeviceEntry {
    /// Resolves this entry against the shared VAD settings.
    pub fn resolve(&self, shared: &VadConfig) -> DeviceConfig {
        let vad = match &self.vad {
            Some(over) => shared.merged(over),
            None => *shared,
        };
        DeviceConfig {
            name: self.name.clone(),
            id: self.id.clone(),
            address: strip_scheme(&self.address).to_string(),
            audio_source: self.audio_source,
            vad,
        }
    }
}

/// Removes a leading `http://` or `https://` from a device address.
pub fn strip_scheme(address: &str) -> &str {
    address
        .strip_prefix("http://")
        .or_else(|| address.strip_prefix("https://"))
        .unwrap_or(address)
}

fn invalid(key: &str, message: &str) -> MicwatchError {
    MicwatchError::ConfigInvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file is missing or contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MicwatchError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                MicwatchError::Io(e)
            }
        })?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Invalid TOML is still reported as an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(MicwatchError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - MICWATCH_STREAM_USERNAME → stream.username
    /// - MICWATCH_STREAM_PASSWORD → stream.password
    /// - MICWATCH_MQTT_BROKER → mqtt.broker
    /// - MICWATCH_MQTT_USERNAME → mqtt.username
    /// - MICWATCH_MQTT_PASSWORD → mqtt.password
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(user) = non_empty_env("MICWATCH_STREAM_USERNAME") {
            self.stream.username = user;
        }
        if let Some(password) = non_empty_env("MICWATCH_STREAM_PASSWORD") {
            self.stream.password = password;
        }
        if let Some(broker) = non_empty_env("MICWATCH_MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(user) = non_empty_env("MICWATCH_MQTT_USERNAME") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = non_empty_env("MICWATCH_MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        self
    }

    /// Check values a session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(invalid("devices", "at least one device must be configured"));
        }

        self.vad.validate("vad")?;

        let mut seen = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            if device.id.trim().is_empty() {
                return Err(invalid(&format!("devices[{i}].id"), "must not be empty"));
            }
            if device.address.trim().is_empty() {
                return Err(invalid(
                    &format!("devices[{i}].address"),
                    "must not be empty",
                ));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(invalid(
                    &format!("devices[{i}].id"),
                    &format!("duplicate device id '{}'", device.id),
                ));
            }
            if let Some(over) = &device.vad {
                self.vad
                    .merged(over)
                    .validate(&format!("devices[{i}].vad"))?;
            }
        }

        if self.mqtt.qos > 2 {
            return Err(invalid("mqtt.qos", "must be 0, 1 or 2"));
        }

        let topics = &self.mqtt.topics;
        for (key, value) in [
            ("mqtt.topics.wakeword", &topics.wakeword),
            ("mqtt.topics.vad_start", &topics.vad_start),
            ("mqtt.topics.vad_stop", &topics.vad_stop),
            ("mqtt.topics.status", &topics.status),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(key, "must not be empty"));
            }
        }

        if self.stream.buffer_chunks == 0 {
            return Err(invalid("stream.buffer_chunks", "must be greater than zero"));
        }
        if self.stream.read_chunk_bytes == 0 {
            return Err(invalid(
                "stream.read_chunk_bytes",
                "must be greater than zero",
            ));
        }

        Ok(())
    }

    /// Resolved per-device settings, in configuration order.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices.iter().map(|d| d.resolve(&self.vad)).collect()
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/micwatch/config.toml on Linux
    #[cfg(feature = "cli")]
    pub fn default_path() -> std::path::PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("micwatch")
            .join("config.toml")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    // Mutex to serialize tests that modify environment variables
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // SAFETY: These helpers are only used in tests with ENV_LOCK held,
    // ensuring no concurrent access to environment variables.
    fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) }
    }

    fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) }
    }

    fn clear_micwatch_env() {
        for key in [
            "MICWATCH_STREAM_USERNAME",
            "MICWATCH_STREAM_PASSWORD",
            "MICWATCH_MQTT_BROKER",
            "MICWATCH_MQTT_USERNAME",
            "MICWATCH_MQTT_PASSWORD",
        ] {
            remove_env(key);
        }
    }

    fn write_config(contents: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(contents.as_bytes()).unwrap();
        temp_file
    }

    fn device(id: &str) -> DeviceEntry {
        DeviceEntry {
            name: format!("Speaker {id}"),
            id: id.to_string(),
            address: "http://10.0.0.5".to_string(),
            audio_source: 0,
            vad: None,
        }
    }

    #[test]
    fn test_default_config_has_correct_values() {
        let config = Config::default();

        assert_eq!(config.vad.threshold, 0.5);
        assert_eq!(config.vad.min_recording_time_ms, 1500);
        assert_eq!(config.vad.min_silence_duration_ms, 800);
        assert_eq!(config.vad.max_recording_time_ms, 7000);

        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.mqtt.topics.wakeword, "axis/{device_id}/wakeword");

        assert_eq!(config.stream.buffer_chunks, 1000);
        assert_eq!(config.stream.read_chunk_bytes, 3200);
        assert_eq!(config.stream.username, "root");
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_load_from_toml_file() {
        let temp_file = write_config(
            r#"
            [vad]
            threshold = 0.6
            min_recording_time_ms = 1000

            [mqtt]
            broker = "broker.lan"
            qos = 2

            [mqtt.topics]
            wakeword = "home/{device_id}/wake"

            [[devices]]
            name = "Kitchen"
            id = "kitchen"
            address = "https://10.0.0.7"
            audio_source = 1

            [[devices]]
            name = "Hall"
            id = "hall"
            address = "10.0.0.8"

            [devices.vad]
            max_recording_time_ms = 4000
        "#,
        );

        let config = Config::load(temp_file.path()).unwrap();

        assert_eq!(config.vad.threshold, 0.6);
        assert_eq!(config.vad.min_recording_time_ms, 1000);
        assert_eq!(config.vad.min_silence_duration_ms, 800);
        assert_eq!(config.mqtt.broker, "broker.lan");
        assert_eq!(config.mqtt.qos, 2);
        assert_eq!(config.mqtt.topics.wakeword, "home/{device_id}/wake");
        assert_eq!(config.mqtt.topics.status, "axis/{device_id}/status");
        assert_eq!(config.devices.len(), 2);
        config.validate().unwrap();

        let devices = config.device_configs();
        assert_eq!(devices[0].address, "10.0.0.7");
        assert_eq!(devices[0].audio_source, 1);
        assert_eq!(devices[0].vad.max_recording_time_ms, 7000);
        assert_eq!(devices[1].vad.max_recording_time_ms, 4000);
        assert_eq!(devices[1].vad.threshold, 0.6);
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("http://10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_scheme("https://cam.local:8443"), "cam.local:8443");
        assert_eq!(strip_scheme("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_vad_durations() {
        let vad = VadConfig::default();
        assert_eq!(vad.min_recording_time(), Duration::from_millis(1500));
        assert_eq!(vad.min_silence_duration(), Duration::from_millis(800));
        assert_eq!(vad.max_recording_time(), Duration::from_millis(7000));
    }

    #[test]
    fn test_validate_requires_devices() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("devices"));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = Config {
            devices: vec![device("a"), device("a")],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate device id 'a'"));
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut config = Config {
            devices: vec![device("a")],
            ..Default::default()
        };
        config.vad.threshold = 1.5;
        assert!(config.validate().is_err());

        config.vad.threshold = 0.5;
        config.devices[0].vad = Some(VadOverride {
            threshold: Some(-0.1),
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("devices[0].vad.threshold"));
    }

    #[test]
    fn test_validate_rejects_bad_qos() {
        let mut config = Config {
            devices: vec![device("a")],
            ..Default::default()
        };
        config.mqtt.qos = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mqtt.qos"));
    }

    #[test]
    fn test_env_override_credentials() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_micwatch_env();

        set_env("MICWATCH_STREAM_PASSWORD", "secret");
        set_env("MICWATCH_MQTT_USERNAME", "bus-user");
        let config = Config::default().with_env_overrides();

        assert_eq!(config.stream.password, "secret");
        assert_eq!(config.stream.username, "root");
        assert_eq!(config.mqtt.username.as_deref(), Some("bus-user"));
        assert_eq!(config.mqtt.password, None);

        clear_micwatch_env();
    }

    #[test]
    fn test_env_override_empty_string_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_micwatch_env();

        set_env("MICWATCH_MQTT_BROKER", "");
        let config = Config::default().with_env_overrides();
        assert_eq!(config.mqtt.broker, "localhost");

        clear_micwatch_env();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let temp_file = write_config("[vad\nthreshold = ");
        let result = Config::load(temp_file.path());
        assert!(matches!(result, Err(MicwatchError::Config(_))));
    }

    #[test]
    fn test_load_or_default_returns_default_for_missing_file() {
        let missing_path = Path::new("/tmp/nonexistent_micwatch_config_12345.toml");
        let config = Config::load_or_default(missing_path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_reports_invalid_toml() {
        let temp_file = write_config("devices = 3\n[[devices]]");
        assert!(Config::load_or_default(temp_file.path()).is_err());
    }

    #[cfg(feature = "cli")]
    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = Config::default_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.contains("micwatch"));
        assert!(path_str.ends_with("config.toml"));
    }
}
