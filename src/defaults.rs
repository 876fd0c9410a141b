//! Default configuration constants for micwatch.
//!
//! Shared by the configuration types, the audio path and the tracker so the
//! same numbers are not repeated across modules.

/// Audio sample rate in Hz delivered by the audio source.
pub const SAMPLE_RATE: u32 = 16000;

/// Bytes per sample (signed 16-bit little-endian mono).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Number of samples the speech classifier evaluates at once.
///
/// Also the capacity of the tracker's decision window.
pub const VAD_WINDOW_SAMPLES: usize = 512;

/// Divisor used to normalize 16-bit samples into [-1.0, 1.0].
pub const SAMPLE_SCALE: f32 = 32768.0;

/// Speech probability above which a window counts as speech.
pub const VAD_THRESHOLD: f32 = 0.5;

/// Recordings shorter than this are never ended by silence.
pub const MIN_RECORDING_TIME_MS: u64 = 1500;

/// Contiguous trailing silence required to end a recording.
pub const MIN_SILENCE_DURATION_MS: u64 = 800;

/// Hard upper bound on a single recording.
pub const MAX_RECORDING_TIME_MS: u64 = 7000;

/// Maximum number of chunks held by a stream buffer before the oldest is dropped.
pub const BUFFER_CHUNKS: usize = 1000;

/// Size of a single read from the audio source (100ms of audio).
pub const READ_CHUNK_BYTES: usize = 3200;

/// Longest the processing loop waits for a frame before re-checking the stop flag.
pub const FRAME_WAIT_MS: u64 = 10;

/// Time allowed for loops and the audio source to exit during shutdown.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 2000;

/// Default MQTT delivery quality (at least once).
pub const MQTT_QOS: u8 = 1;

/// Default MQTT broker port.
pub const MQTT_PORT: u16 = 1883;

/// Placeholder replaced by the device id in topic templates.
pub const DEVICE_ID_PLACEHOLDER: &str = "{device_id}";
