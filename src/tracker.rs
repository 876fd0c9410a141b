//! Utterance tracking after a wake trigger.
//!
//! A wake trigger moves the tracker from idle to recording. While recording,
//! every frame is checked against the maximum recording time first, then fed
//! into a 512-sample decision window that the speech classifier evaluates once
//! the minimum recording time has passed. Contiguous non-speech lasting at
//! least the minimum silence duration ends the utterance.

use crate::config::VadConfig;
use crate::defaults::VAD_WINDOW_SAMPLES;
use crate::error::Result;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can hold one handle while a session
/// thread reads another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            origin,
            current: Arc::new(Mutex::new(origin)),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current += duration;
    }

    /// Sets the clock to `offset` after its creation time.
    pub fn set_elapsed(&self, offset: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *current = self.origin + offset;
    }

    /// Time since creation.
    pub fn elapsed(&self) -> Duration {
        self.now().duration_since(self.origin)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Tracker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtteranceState {
    /// Waiting for a wake trigger.
    Idle,
    /// Following an utterance.
    Recording,
}

/// Why a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Trailing silence lasted long enough.
    Silence,
    /// The maximum recording time was reached.
    Timeout,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Silence => "silence",
            EndReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished recording episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtteranceEnd {
    pub reason: EndReason,
    /// Time from the (latest) wake trigger to the end decision.
    pub duration: Duration,
}

/// Recording state machine for one device.
pub struct UtteranceTracker<C: Clock = SystemClock> {
    config: VadConfig,
    clock: C,
    recording_started_at: Option<Instant>,
    silence_started_at: Option<Instant>,
    window: Vec<i16>,
}

impl<C: Clock> UtteranceTracker<C> {
    /// Creates an idle tracker with the given timing and clock.
    pub fn with_clock(config: VadConfig, clock: C) -> Self {
        Self {
            config,
            clock,
            recording_started_at: None,
            silence_started_at: None,
            window: Vec::with_capacity(VAD_WINDOW_SAMPLES * 2),
        }
    }

    pub fn state(&self) -> UtteranceState {
        if self.recording_started_at.is_some() {
            UtteranceState::Recording
        } else {
            UtteranceState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state() == UtteranceState::Recording
    }

    pub fn recording_started_at(&self) -> Option<Instant> {
        self.recording_started_at
    }

    pub fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }

    /// Samples currently held in the decision window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Starts a recording episode. A trigger while already recording restarts it.
    ///
    /// Returns true when this restarted an episode in progress.
    pub fn trigger(&mut self) -> bool {
        let restarted = self.is_recording();
        self.recording_started_at = Some(self.clock.now());
        self.silence_started_at = None;
        self.window.clear();
        if restarted {
            debug!("wake trigger while recording; episode restarted");
        }
        restarted
    }

    /// Feeds one frame while recording.
    ///
    /// `classify` receives exactly [`VAD_WINDOW_SAMPLES`] samples and returns a
    /// speech probability. A classifier error skips the evaluation for this
    /// frame. Returns the end of the utterance when this frame closes it.
    pub fn observe<F>(&mut self, samples: &[i16], mut classify: F) -> Option<UtteranceEnd>
    where
        F: FnMut(&[i16]) -> Result<f32>,
    {
        let started = self.recording_started_at?;
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(started);

        if elapsed >= self.config.max_recording_time() {
            return Some(self.finish(EndReason::Timeout, elapsed));
        }

        self.window.extend_from_slice(samples);
        if self.window.len() < VAD_WINDOW_SAMPLES {
            return None;
        }

        if elapsed >= self.config.min_recording_time() {
            let tail = &self.window[self.window.len() - VAD_WINDOW_SAMPLES..];
            match classify(tail) {
                Ok(probability) => {
                    if let Some(end) = self.apply_probability(probability, now, elapsed) {
                        return Some(end);
                    }
                }
                Err(e) => warn!(error = %e, "speech classifier failed; skipping window"),
            }
        }

        let excess = self.window.len() - VAD_WINDOW_SAMPLES;
        self.window.drain(..excess);
        None
    }

    fn apply_probability(
        &mut self,
        probability: f32,
        now: Instant,
        elapsed: Duration,
    ) -> Option<UtteranceEnd> {
        if probability > self.config.threshold {
            self.silence_started_at = None;
            return None;
        }

        let silence_start = *self.silence_started_at.get_or_insert(now);
        if now.saturating_duration_since(silence_start) >= self.config.min_silence_duration() {
            Some(self.finish(EndReason::Silence, elapsed))
        } else {
            None
        }
    }

    fn finish(&mut self, reason: EndReason, duration: Duration) -> UtteranceEnd {
        self.reset();
        UtteranceEnd { reason, duration }
    }

    /// Returns to idle, dropping any episode in progress.
    pub fn reset(&mut self) {
        self.recording_started_at = None;
        self.silence_started_at = None;
        self.window.clear();
    }
}

impl UtteranceTracker<SystemClock> {
    /// Creates an idle tracker using the system clock.
    pub fn new(config: VadConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}
