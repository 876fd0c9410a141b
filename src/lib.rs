//! micwatch - wakeword and end-of-utterance monitor for networked microphones
//!
//! Each configured device gets a session that reads 16 kHz PCM from an audio
//! source, detects the wakeword frame by frame, follows the utterance with a
//! speech classifier and publishes start/stop events to a message bus.
//!
//! ```text
//! source ─▶ StreamBuffer ─▶ FrameExtractor ─▶ WakewordGate ─▶ UtteranceTracker ─▶ EventPublisher
//!  (acquisition thread)        (processing thread, one per device)
//! ```

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod detect;
pub mod error;
pub mod logging;
pub mod publish;
pub mod session;
#[cfg(unix)]
pub mod sys;
pub mod tracker;

// Composition root - needs the CLI runtime and the MQTT client
#[cfg(all(feature = "cli", feature = "mqtt"))]
pub mod app;

// Core traits (source → classify → publish)
pub use audio::AudioSource;
pub use detect::{SpeechClassifier, WakewordClassifier};
pub use publish::MessageBus;

// Components
pub use audio::{Frame, FrameExtractor, StreamBuffer};
pub use detect::{SharedSpeechClassifier, WakewordGate};
pub use publish::EventPublisher;
pub use session::{DeviceSession, SessionOptions, SessionSupervisor};
pub use tracker::{Clock, EndReason, UtteranceEnd, UtteranceState, UtteranceTracker};

// Error handling
pub use error::{MicwatchError, Result};

// Config
pub use config::{Config, DeviceConfig, VadConfig};

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
