//! Audio path: source stream → chunk buffer → fixed-size frames.

pub mod buffer;
pub mod frame;
pub mod source;

pub use buffer::StreamBuffer;
pub use frame::{Frame, FrameExtractor};
pub use source::{AudioSource, FfmpegSource, MockAudioSource};
