//! Audio sources delivering 16 kHz mono s16le PCM as a byte stream.

use crate::config::{DeviceConfig, StreamConfig};
use crate::defaults;
use crate::error::{MicwatchError, Result};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Trait for audio source devices.
///
/// This trait allows swapping implementations (ffmpeg RTSP stream vs mock).
pub trait AudioSource: Send {
    /// Starts the source and hands back the PCM stream.
    ///
    /// End of stream (a read returning 0) means the source is gone.
    fn start(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Stops the source, escalating to a forced kill after `grace`.
    ///
    /// Must unblock a pending read on the stream returned by `start`.
    fn stop(&mut self, grace: Duration) -> Result<()>;

    /// Human-readable description for logs. Never contains credentials.
    fn describe(&self) -> String;
}

impl<T: AudioSource + ?Sized> AudioSource for Box<T> {
    fn start(&mut self) -> Result<Box<dyn Read + Send>> {
        (**self).start()
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        (**self).stop(grace)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Builds the RTSP URL for a device, with credentials when a username is set.
pub fn rtsp_url(stream: &StreamConfig, device: &DeviceConfig) -> String {
    let credentials = if stream.username.is_empty() {
        String::new()
    } else {
        format!("{}:{}@", stream.username, stream.password)
    };
    format!("rtsp://{credentials}{}{}", device.address, stream.rtsp_path)
}

/// RTSP stream decoded by an `ffmpeg` child process.
pub struct FfmpegSource {
    device: String,
    program: String,
    args: Vec<String>,
    /// URL without credentials, for logs.
    display_url: String,
    child: Option<Child>,
}

impl FfmpegSource {
    pub fn new(stream: &StreamConfig, device: &DeviceConfig) -> Self {
        let args = vec![
            "-nostdin".to_string(),
            "-rtsp_transport".to_string(),
            stream.rtsp_transport.clone(),
            "-i".to_string(),
            rtsp_url(stream, device),
            "-ar".to_string(),
            defaults::SAMPLE_RATE.to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-f".to_string(),
            "s16le".to_string(),
            "pipe:1".to_string(),
        ];
        Self {
            device: device.id.clone(),
            program: stream.ffmpeg.clone(),
            args,
            display_url: format!("rtsp://{}{}", device.address, stream.rtsp_path),
            child: None,
        }
    }

    /// Command-line arguments passed to ffmpeg (includes credentials).
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl AudioSource for FfmpegSource {
    fn start(&mut self) -> Result<Box<dyn Read + Send>> {
        if self.child.is_some() {
            return Err(MicwatchError::AudioSourceStart {
                device: self.device.clone(),
                message: "already started".to_string(),
            });
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MicwatchError::AudioSourceStart {
                device: self.device.clone(),
                message: format!("failed to spawn {}: {e}", self.program),
            })?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MicwatchError::AudioSourceStart {
                device: self.device.clone(),
                message: "ffmpeg stdout unavailable".to_string(),
            });
        };

        debug!(pid = child.id(), url = %self.display_url, "ffmpeg started");
        self.child = Some(child);
        Ok(Box::new(stdout))
    }

    fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        terminate(&mut child, grace)
    }

    fn describe(&self) -> String {
        self.display_url.clone()
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Asks a child to exit with SIGTERM and kills it if it is still alive after `grace`.
fn terminate(child: &mut Child, grace: Duration) -> Result<()> {
    if child.try_wait()?.is_some() {
        return Ok(());
    }

    #[cfg(unix)]
    if let Err(e) = crate::sys::send_sigterm(child.id()) {
        debug!(error = %e, "SIGTERM to audio source failed");
    }

    let deadline = Instant::now() + grace;
    let poll_interval = Duration::from_millis(20);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            debug!(%status, "audio source exited");
            return Ok(());
        }
        thread::sleep(poll_interval);
    }

    warn!(
        grace_ms = grace.as_millis() as u64,
        "audio source ignored SIGTERM, killing"
    );
    child.kill()?;
    child.wait()?;
    Ok(())
}

/// Mock audio source for testing
///
/// Serves preloaded chunks, then anything sent through [`feeder`](Self::feeder),
/// then either ends the stream or, with [`hold_open`](Self::hold_open), blocks
/// until stopped.
pub struct MockAudioSource {
    chunks: VecDeque<Vec<u8>>,
    feed_tx: Option<Sender<Vec<u8>>>,
    feed_rx: Option<Receiver<Vec<u8>>>,
    hold_open: bool,
    start_failure: Option<String>,
    stop_tx: Option<Sender<()>>,
    stops: Arc<AtomicUsize>,
}

impl MockAudioSource {
    /// Create a mock source whose stream ends immediately
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            feed_tx: None,
            feed_rx: None,
            hold_open: false,
            start_failure: None,
            stop_tx: None,
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Configure chunks delivered right after start
    pub fn with_chunks(mut self, chunks: Vec<Vec<u8>>) -> Self {
        self.chunks = chunks.into();
        self
    }

    /// Keep the stream open once all data is delivered, until stopped
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Configure the mock to fail on start
    pub fn with_start_failure(mut self, message: &str) -> Self {
        self.start_failure = Some(message.to_string());
        self
    }

    /// Sender for chunks delivered while running. Dropping every sender
    /// ends the live feed.
    pub fn feeder(&mut self) -> Sender<Vec<u8>> {
        if let Some(tx) = &self.feed_tx {
            return tx.clone();
        }
        let (tx, rx) = unbounded();
        self.feed_tx = Some(tx.clone());
        self.feed_rx = Some(rx);
        tx
    }

    /// Shared counter of `stop` calls.
    pub fn stop_counter(&self) -> Arc<AtomicUsize> {
        self.stops.clone()
    }
}

impl Default for MockAudioSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for MockAudioSource {
    fn start(&mut self) -> Result<Box<dyn Read + Send>> {
        if let Some(message) = &self.start_failure {
            return Err(MicwatchError::AudioSourceStart {
                device: "mock".to_string(),
                message: message.clone(),
            });
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        self.stop_tx = Some(stop_tx);
        // The reader owns the only receiver; our sender handle is dropped so
        // the feed ends once the test drops its own senders.
        self.feed_tx = None;

        Ok(Box::new(MockReader {
            pending: std::mem::take(&mut self.chunks),
            current: Vec::new(),
            pos: 0,
            feed: self.feed_rx.take(),
            hold_open: self.hold_open,
            stop: stop_rx,
        }))
    }

    fn stop(&mut self, _grace: Duration) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender disconnects the reader's stop channel.
        self.stop_tx = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

struct MockReader {
    pending: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
    feed: Option<Receiver<Vec<u8>>>,
    hold_open: bool,
    stop: Receiver<()>,
}

impl MockReader {
    fn stopped(&self) -> bool {
        matches!(
            self.stop.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        )
    }

    /// Loads the next chunk; false means end of stream.
    fn refill(&mut self) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            if let Some(chunk) = self.pending.pop_front() {
                self.current = chunk;
                self.pos = 0;
                return true;
            }
            if let Some(feed) = self.feed.clone() {
                let stop = self.stop.clone();
                select! {
                    recv(feed) -> msg => match msg {
                        Ok(chunk) => {
                            self.current = chunk;
                            self.pos = 0;
                            return true;
                        }
                        Err(_) => self.feed = None,
                    },
                    recv(stop) -> _ => return false,
                }
                continue;
            }
            if self.hold_open {
                // Returns once the stop sender is dropped.
                let _ = self.stop.recv();
            }
            return false;
        }
    }
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            if !self.refill() {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
