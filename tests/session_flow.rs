//! End-to-end session behaviour with scripted classifiers and a manual clock.
//!
//! The wakeword classifier drives the clock: frame `n` happens at `n * 25ms`,
//! so event times are exact regardless of how fast the threads run.

use crossbeam_channel::{Receiver, bounded};
use micwatch::audio::MockAudioSource;
use micwatch::config::{DeviceConfig, TopicTemplates, VadConfig};
use micwatch::detect::{
    EnergyClassifier, SharedSpeechClassifier, SpeechClassifier, WakewordClassifier,
};
use micwatch::error::{MicwatchError, Result};
use micwatch::publish::{EventPublisher, MessageBus};
use micwatch::session::{DeviceSession, SessionContext, SessionOptions, SessionSupervisor};
use micwatch::tracker::{Clock, ManualClock, SystemClock};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const FRAME_SAMPLES: usize = 400;
const FRAME_MS: u64 = 25;
const WAIT: Duration = Duration::from_secs(10);

/// Wakeword classifier that sets the clock to the frame's time and fires on
/// chosen frame numbers.
struct ClockedWakeword {
    clock: ManualClock,
    detections: Vec<u64>,
    frames: u64,
}

impl ClockedWakeword {
    fn new(clock: ManualClock, detections: Vec<u64>) -> Self {
        Self {
            clock,
            detections,
            frames: 0,
        }
    }
}

impl WakewordClassifier for ClockedWakeword {
    fn frame_length(&self) -> usize {
        FRAME_SAMPLES
    }

    fn process(&mut self, pcm: &[i16]) -> Result<i32> {
        assert_eq!(pcm.len(), FRAME_SAMPLES);
        self.clock.set_elapsed(Duration::from_millis(self.frames * FRAME_MS));
        let hit = self.detections.contains(&self.frames);
        self.frames += 1;
        Ok(if hit { 0 } else { -1 })
    }
}

/// Speech probability as a function of the clock time in milliseconds.
struct ScriptedSpeech {
    clock: ManualClock,
    script: fn(u64) -> f32,
}

impl SpeechClassifier for ScriptedSpeech {
    fn speech_probability(&mut self, window: &[f32], sample_rate: u32) -> Result<f32> {
        assert_eq!(window.len(), 512);
        assert_eq!(sample_rate, 16000);
        Ok((self.script)(self.clock.elapsed().as_millis() as u64))
    }
}

#[derive(Debug, Clone)]
struct Event {
    topic: String,
    payload: String,
    retain: bool,
    at_ms: u64,
}

/// Bus stamping every message with the manual clock's time.
struct TimedBus {
    clock: ManualClock,
    failing_topic: Option<String>,
    events: Mutex<Vec<Event>>,
}

impl TimedBus {
    fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            failing_topic: None,
            events: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(mut self, topic: &str) -> Self {
        self.failing_topic = Some(topic.to_string());
        self
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn on(&self, topic: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.topic == topic)
            .collect()
    }

    fn wait_for(&self, topic: &str, payload: &str) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if self.on(topic).iter().any(|e| e.payload == payload) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl MessageBus for TimedBus {
    fn publish(&self, topic: &str, payload: &str, _qos: u8, retain: bool) -> Result<()> {
        if self.failing_topic.as_deref() == Some(topic) {
            return Err(MicwatchError::Publish {
                topic: topic.to_string(),
                message: "broker unreachable".to_string(),
            });
        }
        self.events.lock().unwrap().push(Event {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
            at_ms: self.clock.elapsed().as_millis() as u64,
        });
        Ok(())
    }
}

fn device(id: &str) -> DeviceConfig {
    DeviceConfig {
        name: format!("Camera {id}"),
        id: id.to_string(),
        address: "192.0.2.10".to_string(),
        audio_source: 0,
        vad: VadConfig {
            threshold: 0.5,
            min_recording_time_ms: 1500,
            min_silence_duration_ms: 800,
            max_recording_time_ms: 7000,
        },
    }
}

fn silent_frames(count: usize) -> Vec<Vec<u8>> {
    vec![vec![0u8; FRAME_SAMPLES * 2]; count]
}

fn supervisor(
    clock: &ManualClock,
    bus: Arc<TimedBus>,
    script: fn(u64) -> f32,
) -> SessionSupervisor<ManualClock> {
    SessionSupervisor::with_clock(
        SharedSpeechClassifier::new(ScriptedSpeech {
            clock: clock.clone(),
            script,
        }),
        EventPublisher::new(bus, TopicTemplates::default(), 1),
        SessionOptions::default(),
        clock.clone(),
    )
}

/// Runs one device with a wake at t=0 and returns the bus once a stop arrived.
fn run_single(
    bus: TimedBus,
    clock: &ManualClock,
    script: fn(u64) -> f32,
    frames: usize,
) -> Arc<TimedBus> {
    let bus = Arc::new(bus);
    let mut supervisor = supervisor(clock, bus.clone(), script);
    supervisor
        .start_device(
            device("cam1"),
            Box::new(MockAudioSource::new().with_chunks(silent_frames(frames)).hold_open()),
            Box::new(ClockedWakeword::new(clock.clone(), vec![0])),
        )
        .unwrap();

    assert!(bus.wait_for("axis/cam1/vad/stop", "SILENCE"), "no stop event");
    supervisor.stop_all();
    bus
}

#[test]
fn test_speech_then_silence_stops_at_2800ms() {
    let clock = ManualClock::new();
    let bus = run_single(
        TimedBus::new(clock.clone()),
        &clock,
        |t| if t < 2000 { 0.9 } else { 0.1 },
        200,
    );

    let wake = bus.on("axis/cam1/wakeword");
    assert_eq!(wake.len(), 1);
    assert_eq!(wake[0].payload, "DETECTED");
    assert_eq!(wake[0].at_ms, 0);

    let start = bus.on("axis/cam1/vad/start");
    assert_eq!(start.len(), 1);
    assert_eq!(start[0].payload, "RECORDING");

    let stop = bus.on("axis/cam1/vad/stop");
    assert_eq!(stop.len(), 1);
    assert_eq!(stop[0].at_ms, 2800);
    assert!(!stop[0].retain);
}

#[test]
fn test_continuous_speech_stops_at_7000ms() {
    let clock = ManualClock::new();
    let bus = run_single(TimedBus::new(clock.clone()), &clock, |_| 0.99, 320);

    let stop = bus.on("axis/cam1/vad/stop");
    assert_eq!(stop.len(), 1);
    assert_eq!(stop[0].payload, "SILENCE");
    assert_eq!(stop[0].at_ms, 7000);
}

#[test]
fn test_early_silence_waits_for_min_recording_time() {
    let clock = ManualClock::new();
    let bus = run_single(TimedBus::new(clock.clone()), &clock, |_| 0.0, 200);

    // Silence from t=0 is only evaluated from 1500ms, then needs 800ms more.
    assert_eq!(bus.on("axis/cam1/vad/stop")[0].at_ms, 2300);
}

#[test]
fn test_publish_failure_does_not_disturb_tracking() {
    let clock = ManualClock::new();
    let bus = run_single(
        TimedBus::new(clock.clone()).failing_on("axis/cam1/wakeword"),
        &clock,
        |t| if t < 2000 { 0.9 } else { 0.1 },
        200,
    );

    assert!(bus.on("axis/cam1/wakeword").is_empty());
    assert_eq!(bus.on("axis/cam1/vad/start").len(), 1);
    assert_eq!(bus.on("axis/cam1/vad/stop")[0].at_ms, 2800);
}

#[test]
fn test_wake_while_recording_restarts_episode() {
    let clock = ManualClock::new();
    let bus = Arc::new(TimedBus::new(clock.clone()));
    let mut supervisor = supervisor(&clock, bus.clone(), |t| if t < 4000 { 0.9 } else { 0.1 });
    supervisor
        .start_device(
            device("cam1"),
            Box::new(MockAudioSource::new().with_chunks(silent_frames(260)).hold_open()),
            // Second wake at frame 120 (t=3000ms).
            Box::new(ClockedWakeword::new(clock.clone(), vec![0, 120])),
        )
        .unwrap();

    assert!(bus.wait_for("axis/cam1/vad/stop", "SILENCE"));
    supervisor.stop_all();

    let wakes: Vec<u64> = bus
        .on("axis/cam1/wakeword")
        .iter()
        .map(|e| e.at_ms)
        .collect();
    assert_eq!(wakes, vec![0, 3000]);
    // Restarted at 3000: silence is only evaluated from 4500, ending at 5300.
    let stop = bus.on("axis/cam1/vad/stop");
    assert_eq!(stop.len(), 1);
    assert_eq!(stop[0].at_ms, 5300);
}

#[test]
fn test_status_is_retained_online_then_offline() {
    let clock = ManualClock::new();
    let bus = run_single(TimedBus::new(clock.clone()), &clock, |_| 0.0, 200);

    let status = bus.on("axis/cam1/status");
    let payloads: Vec<&str> = status.iter().map(|e| e.payload.as_str()).collect();
    assert_eq!(payloads, vec!["online", "offline"]);
    assert!(status.iter().all(|e| e.retain));
}

#[test]
fn test_ended_source_only_affects_its_device() {
    let clock = ManualClock::new();
    let bus = Arc::new(TimedBus::new(clock.clone()));
    let mut supervisor = supervisor(&clock, bus.clone(), |t| if t < 2000 { 0.9 } else { 0.1 });

    let devices = vec![device("cam1"), device("cam2")];
    let started = supervisor
        .start_all(
            &devices,
            |d| -> Result<Box<dyn micwatch::AudioSource>> {
                if d.id == "cam2" {
                    // Stream ends right away.
                    Ok(Box::new(MockAudioSource::new()))
                } else {
                    Ok(Box::new(
                        MockAudioSource::new()
                            .with_chunks(silent_frames(200))
                            .hold_open(),
                    ))
                }
            },
            |_| -> Result<Box<dyn WakewordClassifier>> {
                Ok(Box::new(ClockedWakeword::new(clock.clone(), vec![0])))
            },
        )
        .unwrap();
    assert_eq!(started, 2);

    assert!(bus.wait_for("axis/cam2/status", "offline"));
    let deadline = Instant::now() + WAIT;
    let mut reaped = Vec::new();
    while reaped.is_empty() && Instant::now() < deadline {
        reaped = supervisor.reap();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(reaped, vec!["cam2"]);

    assert!(bus.wait_for("axis/cam1/vad/stop", "SILENCE"));
    assert_eq!(bus.on("axis/cam1/vad/stop")[0].at_ms, 2800);
    assert_eq!(supervisor.running_devices(), vec!["cam1"]);
    supervisor.stop_all();
}

/// Blocks on the first frame until released.
struct StallingWakeword {
    release: Receiver<()>,
    frames: u64,
}

impl WakewordClassifier for StallingWakeword {
    fn frame_length(&self) -> usize {
        FRAME_SAMPLES
    }

    fn process(&mut self, _pcm: &[i16]) -> Result<i32> {
        if self.frames == 0 {
            let _ = self.release.recv();
        }
        self.frames += 1;
        Ok(-1)
    }
}

#[test]
fn test_slow_processing_drops_oldest_chunks_without_blocking_source() {
    let (release_tx, release_rx) = bounded(1);
    let context = SessionContext {
        vad: SharedSpeechClassifier::new(EnergyClassifier::default()),
        publisher: EventPublisher::new(
            Arc::new(TimedBus::new(ManualClock::new())),
            TopicTemplates::default(),
            1,
        ),
        options: SessionOptions {
            buffer_chunks: 4,
            ..SessionOptions::default()
        },
        clock: SystemClock,
    };
    let mut source = MockAudioSource::new();
    let feed = source.feeder();
    let session = DeviceSession::start(
        device("cam1"),
        Box::new(source),
        Box::new(StallingWakeword {
            release: release_rx,
            frames: 0,
        }),
        &context,
    )
    .unwrap();

    // Frame 0 first, so processing is stuck before the flood arrives.
    feed.send(vec![0u8; FRAME_SAMPLES * 2]).unwrap();
    let deadline = Instant::now() + WAIT;
    while session.stats().frames() < 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(session.stats().frames(), 1);

    for chunk in silent_frames(49) {
        feed.send(chunk).unwrap();
    }
    drop(feed);

    // 49 chunks into a 4-chunk buffer nobody drains.
    let deadline = Instant::now() + WAIT;
    while session.dropped_chunks() < 45 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(session.dropped_chunks(), 45);

    release_tx.send(()).unwrap();
    let deadline = Instant::now() + WAIT;
    while session.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!session.is_running());
    assert_eq!(session.stats().frames(), 5);
    assert_eq!(session.stats().frames() + session.dropped_chunks(), 50);
}

#[test]
fn test_clock_trait_objects_share_time() {
    let clock = ManualClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    clock.advance(Duration::from_millis(FRAME_MS));
    assert_eq!(shared.now(), clock.now());
}
