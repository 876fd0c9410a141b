//! Classifier boundaries: wakeword detection per frame, speech probability
//! per decision window.

pub mod vad;
pub mod wakeword;

pub use vad::{EnergyClassifier, SharedSpeechClassifier, SpeechClassifier};
pub use wakeword::{HelperHandle, MockWakeword, ProcessWakeword, WakewordClassifier, WakewordGate};
