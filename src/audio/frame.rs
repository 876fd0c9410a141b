//! Fixed-size frame extraction on top of [`StreamBuffer`].

use crate::audio::buffer::StreamBuffer;
use crate::defaults::BYTES_PER_SAMPLE;
use std::sync::Arc;
use std::time::Duration;

/// One frame of s16le mono PCM, exactly `frame_length * 2` bytes long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wraps raw bytes. Returns `None` unless the length is a whole number of samples.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return None;
        }
        Some(Self { bytes })
    }

    /// Builds a frame from samples (used by tests and synthetic sources).
    pub fn from_samples(samples: &[i16]) -> Self {
        Self {
            bytes: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
        }
    }

    /// Decodes the little-endian samples.
    pub fn samples(&self) -> Vec<i16> {
        self.bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    }

    pub fn len_samples(&self) -> usize {
        self.bytes.len() / BYTES_PER_SAMPLE
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Pulls exact frames out of a shared stream buffer.
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    buffer: Arc<StreamBuffer>,
    frame_bytes: usize,
}

impl FrameExtractor {
    /// Creates an extractor for frames of `frame_samples` samples.
    pub fn new(buffer: Arc<StreamBuffer>, frame_samples: usize) -> Self {
        Self {
            buffer,
            frame_bytes: frame_samples * BYTES_PER_SAMPLE,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Returns the next frame, or `None` when not enough bytes are buffered.
    ///
    /// Never blocks. A pull of the wrong length is discarded.
    pub fn next_frame(&self) -> Option<Frame> {
        if self.frame_bytes == 0 {
            return None;
        }
        let bytes = self.buffer.pull(self.frame_bytes)?;
        if bytes.len() != self.frame_bytes {
            return None;
        }
        Frame::from_bytes(bytes)
    }

    /// Like [`next_frame`](Self::next_frame) but waits up to `timeout` for the
    /// producer to push more data when no frame is ready.
    pub fn wait_frame(&self, timeout: Duration) -> Option<Frame> {
        if let Some(frame) = self.next_frame() {
            return Some(frame);
        }
        if self.buffer.wait(timeout) {
            self.next_frame()
        } else {
            None
        }
    }
}
