//! Wakeword detection, one classifier call per frame.

use crate::audio::frame::Frame;
use crate::config::WakewordConfig;
use crate::error::{MicwatchError, Result};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Trait for wakeword classifiers.
///
/// This trait allows swapping implementations (helper process vs mock).
pub trait WakewordClassifier: Send {
    /// Number of samples the classifier expects per call.
    fn frame_length(&self) -> usize;

    /// Processes one frame of PCM samples.
    ///
    /// # Returns
    /// Index of the detected keyword (>= 0), or -1 when nothing was detected
    fn process(&mut self, pcm: &[i16]) -> Result<i32>;

    /// Handle for killing a backing process from another thread.
    ///
    /// In-process classifiers have none.
    fn helper(&self) -> Option<HelperHandle> {
        None
    }
}

impl<T: WakewordClassifier + ?Sized> WakewordClassifier for Box<T> {
    fn frame_length(&self) -> usize {
        (**self).frame_length()
    }

    fn process(&mut self, pcm: &[i16]) -> Result<i32> {
        (**self).process(pcm)
    }

    fn helper(&self) -> Option<HelperHandle> {
        (**self).helper()
    }
}

/// Shared handle to a wakeword helper process.
///
/// Killing the helper makes a `process` call blocked on its answer fail with
/// end of output.
#[derive(Debug, Clone)]
pub struct HelperHandle {
    child: Arc<Mutex<Child>>,
}

impl HelperHandle {
    fn new(child: Child) -> Self {
        Self {
            child: Arc::new(Mutex::new(child)),
        }
    }

    pub fn id(&self) -> u32 {
        self.lock().id()
    }

    /// Kills and reaps the helper. Safe to call more than once.
    pub fn kill(&self) {
        let mut child = self.lock();
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        let _ = child.kill();
        let _ = child.wait();
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Per-session gate turning classifier output into a yes/no per frame.
pub struct WakewordGate {
    classifier: Box<dyn WakewordClassifier>,
}

impl WakewordGate {
    pub fn new(classifier: Box<dyn WakewordClassifier>) -> Self {
        Self { classifier }
    }

    pub fn frame_length(&self) -> usize {
        self.classifier.frame_length()
    }

    /// True when the classifier reports a keyword in this frame.
    ///
    /// Classifier errors are logged and count as no detection.
    pub fn detect(&mut self, frame: &Frame) -> bool {
        match self.classifier.process(&frame.samples()) {
            Ok(index) if index >= 0 => {
                debug!(keyword_index = index, "wakeword classifier fired");
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "wakeword classifier failed; frame skipped");
                false
            }
        }
    }
}

/// Wakeword classifier running as a helper program.
///
/// The helper prints its frame length (in samples) on the first stdout line.
/// For every frame it then reads `frame_length * 2` bytes of s16le PCM from
/// stdin and answers with one line holding the keyword index (-1 for none).
/// The keyword and sensitivity are passed as `MICWATCH_KEYWORD` and
/// `MICWATCH_SENSITIVITY`.
pub struct ProcessWakeword {
    handle: HelperHandle,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    frame_length: usize,
    line: String,
}

impl ProcessWakeword {
    /// Spawns the helper and reads its frame length.
    pub fn spawn(config: &WakewordConfig) -> Result<Self> {
        let (program, args) = config.command.split_first().ok_or_else(|| {
            MicwatchError::Wakeword {
                message: "wakeword.command is empty".to_string(),
            }
        })?;

        let mut child = Command::new(program)
            .args(args)
            .env("MICWATCH_KEYWORD", &config.keyword)
            .env("MICWATCH_SENSITIVITY", config.sensitivity.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| MicwatchError::Wakeword {
                message: format!("failed to spawn {program}: {e}"),
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MicwatchError::Wakeword {
                message: "helper pipes unavailable".to_string(),
            });
        };

        let mut helper = Self {
            handle: HelperHandle::new(child),
            stdin,
            stdout: BufReader::new(stdout),
            frame_length: 0,
            line: String::new(),
        };

        let header = helper.read_line()?;
        helper.frame_length = match header.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(MicwatchError::Wakeword {
                    message: format!("invalid frame length from helper: {header:?}"),
                });
            }
        };
        debug!(frame_length = helper.frame_length, "wakeword helper ready");
        Ok(helper)
    }

    fn read_line(&mut self) -> Result<String> {
        self.line.clear();
        let n = self.stdout.read_line(&mut self.line)?;
        if n == 0 {
            return Err(MicwatchError::Wakeword {
                message: "helper closed its output".to_string(),
            });
        }
        Ok(self.line.trim().to_string())
    }
}

impl WakewordClassifier for ProcessWakeword {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn process(&mut self, pcm: &[i16]) -> Result<i32> {
        if pcm.len() != self.frame_length {
            return Err(MicwatchError::Wakeword {
                message: format!(
                    "frame has {} samples, helper expects {}",
                    pcm.len(),
                    self.frame_length
                ),
            });
        }
        let bytes: Vec<u8> = pcm.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.stdin.write_all(&bytes)?;
        self.stdin.flush()?;

        let answer = self.read_line()?;
        answer.parse::<i32>().map_err(|_| MicwatchError::Wakeword {
            message: format!("invalid answer from helper: {answer:?}"),
        })
    }

    fn helper(&self) -> Option<HelperHandle> {
        Some(self.handle.clone())
    }
}

impl Drop for ProcessWakeword {
    fn drop(&mut self) {
        self.handle.kill();
    }
}

/// Mock wakeword classifier for testing
///
/// Fires on the frame numbers given to [`with_detections`](Self::with_detections)
/// (0-based), and fails on those given to [`with_failures`](Self::with_failures).
#[derive(Debug, Clone)]
pub struct MockWakeword {
    frame_length: usize,
    detections: Vec<u64>,
    failures: Vec<u64>,
    frames_seen: u64,
}

impl MockWakeword {
    pub fn new(frame_length: usize) -> Self {
        Self {
            frame_length,
            detections: Vec::new(),
            failures: Vec::new(),
            frames_seen: 0,
        }
    }

    pub fn with_detections(mut self, frames: Vec<u64>) -> Self {
        self.detections = frames;
        self
    }

    pub fn with_failures(mut self, frames: Vec<u64>) -> Self {
        self.failures = frames;
        self
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl WakewordClassifier for MockWakeword {
    fn frame_length(&self) -> usize {
        self.frame_length
    }

    fn process(&mut self, _pcm: &[i16]) -> Result<i32> {
        let index = self.frames_seen;
        self.frames_seen += 1;
        if self.failures.contains(&index) {
            return Err(MicwatchError::Wakeword {
                message: format!("mock failure on frame {index}"),
            });
        }
        Ok(if self.detections.contains(&index) { 0 } else { -1 })
    }
}
