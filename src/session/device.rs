//! One monitored device: an acquisition loop and a processing loop joined
//! by a [`StreamBuffer`].

use crate::audio::{AudioSource, Frame, FrameExtractor, StreamBuffer};
use crate::config::{DeviceConfig, StreamConfig};
use crate::defaults;
use crate::detect::{HelperHandle, SharedSpeechClassifier, WakewordClassifier, WakewordGate};
use crate::error::{MicwatchError, Result};
use crate::publish::EventPublisher;
use crate::tracker::{Clock, SystemClock, UtteranceTracker};
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{Span, debug, error, info, info_span, warn};

/// Buffer and timing settings for a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Chunk cap of the stream buffer.
    pub buffer_chunks: usize,
    /// Bytes requested per read from the audio source.
    pub read_chunk_bytes: usize,
    /// Longest the processing loop waits for a frame before re-checking the stop flag.
    pub frame_wait: Duration,
    /// Grace period for the audio source and for each loop join.
    pub shutdown_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_chunks: defaults::BUFFER_CHUNKS,
            read_chunk_bytes: defaults::READ_CHUNK_BYTES,
            frame_wait: Duration::from_millis(defaults::FRAME_WAIT_MS),
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
        }
    }
}

impl From<&StreamConfig> for SessionOptions {
    fn from(stream: &StreamConfig) -> Self {
        Self {
            buffer_chunks: stream.buffer_chunks,
            read_chunk_bytes: stream.read_chunk_bytes,
            shutdown_timeout: stream.shutdown_timeout(),
            ..Self::default()
        }
    }
}

/// Resources every session of a supervisor shares.
#[derive(Clone)]
pub struct SessionContext<C: Clock + Clone = SystemClock> {
    pub vad: SharedSpeechClassifier,
    pub publisher: EventPublisher,
    pub options: SessionOptions,
    pub clock: C,
}

/// Counters updated by the processing loop.
#[derive(Debug, Default)]
pub struct SessionStats {
    frames: AtomicU64,
    wakes: AtomicU64,
    utterances: AtomicU64,
}

impl SessionStats {
    /// Frames handed to the wakeword gate.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Wake triggers, restarts included.
    pub fn wakes(&self) -> u64 {
        self.wakes.load(Ordering::Relaxed)
    }

    /// Recordings closed by silence or timeout.
    pub fn utterances(&self) -> u64 {
        self.utterances.load(Ordering::Relaxed)
    }
}

/// Clears the running flag when the processing loop exits, panics included.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A running device session.
///
/// Stopping is idempotent and also happens on drop.
pub struct DeviceSession {
    device: DeviceConfig,
    source: Box<dyn AudioSource>,
    helper: Option<HelperHandle>,
    buffer: Arc<StreamBuffer>,
    running: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
    threads: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
    span: Span,
    stopped: bool,
}

impl DeviceSession {
    /// Starts the audio source and both loops.
    ///
    /// The wakeword classifier belongs to this session and is released when
    /// the processing loop ends. A helper process behind it is also killed by
    /// [`stop`](Self::stop), so a hung helper cannot outlive the session.
    pub fn start<C>(
        device: DeviceConfig,
        mut source: Box<dyn AudioSource>,
        wakeword: Box<dyn WakewordClassifier>,
        context: &SessionContext<C>,
    ) -> Result<Self>
    where
        C: Clock + Clone + 'static,
    {
        let span = info_span!("device", id = %device.id);
        let _enter = span.enter();

        let frame_length = wakeword.frame_length();
        if frame_length == 0 {
            return Err(MicwatchError::Session {
                device: device.id.clone(),
                message: "wakeword classifier reports a frame length of 0".to_string(),
            });
        }

        let helper = wakeword.helper();
        let reader = source.start()?;
        info!(
            name = %device.name,
            source = %source.describe(),
            frame_length,
            "session starting"
        );

        let options = context.options;
        let buffer = Arc::new(StreamBuffer::new(options.buffer_chunks));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(SessionStats::default());

        let acquisition = {
            let buffer = buffer.clone();
            let running = running.clone();
            let span = span.clone();
            thread::Builder::new()
                .name(format!("acquire-{}", device.id))
                .spawn(move || {
                    let _enter = span.enter();
                    acquisition_loop(reader, &buffer, &running, options.read_chunk_bytes);
                })
        };
        let acquisition = match acquisition {
            Ok(handle) => handle,
            Err(e) => {
                let _ = source.stop(options.shutdown_timeout);
                return Err(e.into());
            }
        };

        let processor = Processor {
            device: device.clone(),
            extractor: FrameExtractor::new(buffer.clone(), frame_length),
            buffer: buffer.clone(),
            gate: WakewordGate::new(wakeword),
            tracker: UtteranceTracker::with_clock(device.vad, context.clock.clone()),
            vad: context.vad.clone(),
            publisher: context.publisher.clone(),
            stats: stats.clone(),
            frame_wait: options.frame_wait,
        };
        let processing = {
            let running = running.clone();
            let span = span.clone();
            thread::Builder::new()
                .name(format!("process-{}", device.id))
                .spawn(move || {
                    let _enter = span.enter();
                    processor.run(running);
                })
        };

        let mut session = Self {
            device,
            source,
            helper,
            buffer,
            running,
            stats,
            threads: vec![acquisition],
            shutdown_timeout: options.shutdown_timeout,
            span: span.clone(),
            stopped: false,
        };
        match processing {
            Ok(handle) => session.threads.push(handle),
            Err(e) => {
                session.stop();
                return Err(e.into());
            }
        }
        Ok(session)
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    /// False once the session was stopped or its audio source ended.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Chunks the stream buffer dropped because processing fell behind.
    pub fn dropped_chunks(&self) -> u64 {
        self.buffer.dropped_chunks()
    }

    /// Stops both loops and the audio source.
    ///
    /// Waits at most the shutdown timeout per step; loops that do not exit in
    /// time are detached. Errors are logged, never returned.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let _enter = self.span.enter();
        debug!("session stopping");

        self.running.store(false, Ordering::SeqCst);
        self.buffer.close();

        if let Err(e) = self.source.stop(self.shutdown_timeout) {
            warn!(error = %e, "failed to stop audio source");
        }
        join_with_timeout(&mut self.threads, self.shutdown_timeout);
        // Unblocks a processing loop still waiting on the helper.
        if let Some(helper) = self.helper.take() {
            helper.kill();
        }
        self.buffer.clear();

        info!(
            frames = self.stats.frames(),
            wakes = self.stats.wakes(),
            utterances = self.stats.utterances(),
            dropped_chunks = self.buffer.dropped_chunks(),
            "session stopped"
        );
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    mut reader: Box<dyn Read + Send>,
    buffer: &StreamBuffer,
    running: &AtomicBool,
    chunk_bytes: usize,
) {
    let mut chunk = vec![0u8; chunk_bytes.max(1)];
    while running.load(Ordering::SeqCst) {
        match reader.read(&mut chunk) {
            Ok(0) => {
                if running.load(Ordering::SeqCst) {
                    warn!("audio stream ended; session terminating");
                }
                break;
            }
            Ok(n) => buffer.push(chunk[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    error!(error = %e, "audio stream read failed; session terminating");
                }
                break;
            }
        }
    }
    buffer.close();
}

struct Processor<C: Clock> {
    device: DeviceConfig,
    extractor: FrameExtractor,
    buffer: Arc<StreamBuffer>,
    gate: WakewordGate,
    tracker: UtteranceTracker<C>,
    vad: SharedSpeechClassifier,
    publisher: EventPublisher,
    stats: Arc<SessionStats>,
    frame_wait: Duration,
}

impl<C: Clock> Processor<C> {
    fn run(mut self, running: Arc<AtomicBool>) {
        let _guard = RunningGuard(running.clone());
        self.publisher.publish_status(&self.device.id, true);
        info!("listening for wakeword");

        while running.load(Ordering::SeqCst) {
            match self.extractor.wait_frame(self.frame_wait) {
                Some(frame) => self.handle_frame(&frame),
                // Closed and drained: the source is gone.
                None if self.buffer.is_closed()
                    && self.buffer.len() < self.extractor.frame_bytes() =>
                {
                    break;
                }
                None => {}
            }
        }

        self.publisher.publish_status(&self.device.id, false);
        debug!("processing loop exited");
    }

    fn handle_frame(&mut self, frame: &Frame) {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);

        if self.gate.detect(frame) {
            let restarted = self.tracker.trigger();
            self.stats.wakes.fetch_add(1, Ordering::Relaxed);
            info!(restarted, "wakeword detected, recording");
            self.publisher.publish_wake(&self.device.id);
        }

        if !self.tracker.is_recording() {
            return;
        }
        let vad = &self.vad;
        let samples = frame.samples();
        if let Some(end) = self
            .tracker
            .observe(&samples, |window| vad.probability(window))
        {
            self.stats.utterances.fetch_add(1, Ordering::Relaxed);
            info!(
                reason = %end.reason,
                duration_ms = end.duration.as_millis() as u64,
                "recording stopped"
            );
            self.publisher.publish_silence(&self.device.id, end.reason);
        }
    }
}

/// Joins finished threads until none remain or `timeout` passes.
///
/// Threads still running at the deadline are detached.
pub(crate) fn join_with_timeout(threads: &mut Vec<JoinHandle<()>>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    let poll_interval = Duration::from_millis(10);

    loop {
        let mut remaining = Vec::new();
        for handle in threads.drain(..) {
            if handle.is_finished() {
                if let Err(panic_info) = handle.join() {
                    let msg = panic_info
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic");
                    error!(panic = msg, "session thread panicked");
                }
            } else {
                remaining.push(handle);
            }
        }
        *threads = remaining;

        if threads.is_empty() {
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                threads = threads.len(),
                "shutdown timeout, detaching session threads"
            );
            threads.clear();
            return;
        }
        thread::sleep(poll_interval);
    }
}
