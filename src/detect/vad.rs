//! Speech probability for the tracker's decision window.
//!
//! Classifiers are shared by every device session. Access goes through
//! [`SharedSpeechClassifier`], which serializes calls with a mutex so a
//! classifier implementation never sees concurrent calls.

use crate::defaults::{SAMPLE_RATE, SAMPLE_SCALE, VAD_WINDOW_SAMPLES};
use crate::error::{MicwatchError, Result};
use std::sync::{Arc, Mutex};

/// Trait for voice activity classifiers.
///
/// This trait allows swapping implementations (model-backed vs energy vs mock).
pub trait SpeechClassifier: Send {
    /// Probability in [0, 1] that `window` contains speech.
    ///
    /// # Arguments
    /// * `window` - Exactly [`VAD_WINDOW_SAMPLES`] normalized samples
    /// * `sample_rate` - Sample rate in Hz
    fn speech_probability(&mut self, window: &[f32], sample_rate: u32) -> Result<f32>;
}

/// Normalizes 16-bit samples into [-1.0, 1.0].
pub fn normalize(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / SAMPLE_SCALE).collect()
}

/// Mutex-guarded classifier handle shared across sessions.
#[derive(Clone)]
pub struct SharedSpeechClassifier {
    inner: Arc<Mutex<Box<dyn SpeechClassifier>>>,
}

impl SharedSpeechClassifier {
    pub fn new(classifier: impl SpeechClassifier + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(classifier))),
        }
    }

    /// Speech probability over the most recent [`VAD_WINDOW_SAMPLES`] samples.
    ///
    /// Fewer samples than a full window is silence (0.0). The classifier's
    /// output is clamped into [0, 1].
    pub fn probability(&self, samples: &[i16]) -> Result<f32> {
        if samples.len() < VAD_WINDOW_SAMPLES {
            return Ok(0.0);
        }
        let window = normalize(&samples[samples.len() - VAD_WINDOW_SAMPLES..]);

        let mut classifier = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let probability = classifier.speech_probability(&window, SAMPLE_RATE)?;

        if probability.is_nan() {
            return Err(MicwatchError::SpeechClassifier {
                message: "classifier returned NaN".to_string(),
            });
        }
        Ok(probability.clamp(0.0, 1.0))
    }
}

/// Energy-based classifier.
///
/// Maps the RMS of the window to a probability: `rms / full_scale_rms`, clamped
/// to 1.0. With the default scale of 0.04 and a threshold of 0.5, windows louder
/// than 0.02 RMS count as speech.
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    full_scale_rms: f32,
}

impl EnergyClassifier {
    pub fn new(full_scale_rms: f32) -> Self {
        Self {
            full_scale_rms: full_scale_rms.max(f32::EPSILON),
        }
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(0.04)
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn speech_probability(&mut self, window: &[f32], _sample_rate: u32) -> Result<f32> {
        Ok((calculate_rms(window) / self.full_scale_rms).min(1.0))
    }
}

/// Calculates the Root Mean Square (RMS) of normalized samples.
///
/// Returns 0.0 for an empty slice; a full-scale square wave gives 1.0.
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let s = sample as f64;
            s * s
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}
