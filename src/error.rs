//! Error types for micwatch.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MicwatchError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio source errors
    #[error("Audio source failed to start for {device}: {message}")]
    AudioSourceStart { device: String, message: String },

    // Classifier errors
    #[error("Wakeword classifier error: {message}")]
    Wakeword { message: String },

    #[error("Speech classifier error: {message}")]
    SpeechClassifier { message: String },

    // Message bus errors
    #[error("Publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Message bus connection failed: {message}")]
    BusConnection { message: String },

    // Session errors
    #[error("No device sessions could be started")]
    NoSessions,

    #[error("Session {device} error: {message}")]
    Session { device: String, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MicwatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = MicwatchError::ConfigInvalidValue {
            key: "vad.threshold".to_string(),
            message: "must be between 0.0 and 1.0".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for vad.threshold: must be between 0.0 and 1.0"
        );
    }

    #[test]
    fn test_audio_source_start_display() {
        let error = MicwatchError::AudioSourceStart {
            device: "kitchen".to_string(),
            message: "ffmpeg not found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Audio source failed to start for kitchen: ffmpeg not found"
        );
    }

    #[test]
    fn test_publish_display() {
        let error = MicwatchError::Publish {
            topic: "axis/kitchen/wakeword".to_string(),
            message: "request queue full".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Publish to axis/kitchen/wakeword failed: request queue full"
        );
    }

    #[test]
    fn test_no_sessions_display() {
        assert_eq!(
            MicwatchError::NoSessions.to_string(),
            "No device sessions could be started"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let error: MicwatchError = io_error.into();
        assert!(error.to_string().contains("pipe closed"));

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: MicwatchError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<MicwatchError>();
        assert_sync::<MicwatchError>();
    }
}
