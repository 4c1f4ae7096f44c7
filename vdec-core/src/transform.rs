//! The decoder transform boundary.
//!
//! The underlying decoder is a black box that accepts encoded samples, emits
//! raw picture buffers, and may demand an output-type renegotiation mid
//! stream. This module types that capability set; the session in
//! [`crate::session`] drives it and nothing else in the crate touches it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::CropRect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
}

/// Pixel format of decoded output planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    I420, // 4:2:0 planar (Y + U + V separate)
    Nv12, // 4:2:0 semi-planar (Y plane + interleaved UV)
}

/// Encoded input type offered to the transform during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFormat {
    pub codec: VideoCodec,
}

/// An output type as the transform describes it. Attributes the transform
/// does not report stay `None`; [`crate::geometry::resolve`] decides which
/// of them are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    pub pixel_format: PixelFormat,
    pub frame_size: Option<(u32, u32)>,
    pub crop: Option<CropRect>,
    pub stride: Option<u32>,
}

/// Input/output buffer sizing the transform demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequirements {
    pub min_size: usize,
    pub alignment: usize,
}

impl BufferRequirements {
    /// Buffer size needed to carry `payload_len` bytes: at least `min_size`,
    /// rounded up to the alignment.
    pub fn sized_for(&self, payload_len: usize) -> usize {
        let base = payload_len.max(self.min_size);
        match self.alignment {
            0 | 1 => base,
            align => base.div_ceil(align) * align,
        }
    }
}

/// Control messages the session sends to the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    BeginStream,
    EndStream,
    Flush,
}

/// One encoded sample, already padded to the transform's input requirements.
#[derive(Debug, Clone)]
pub struct InputSample {
    pub data: Vec<u8>,
    /// Valid bytes at the front of `data`; the rest is alignment padding.
    pub payload_len: usize,
    pub timestamp_us: i64,
    pub duration_us: i64,
}

/// Outcome of submitting input. `NotAccepting` is backpressure, not an
/// error: the transform already holds enough data to produce output and the
/// caller must drain before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Accepted,
    NotAccepting,
}

/// Outcome of polling for output.
///
/// `FormatChanged` never carries a picture; a transform holding a decoded
/// picture across a format change reports it on the next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// The supplied buffer was filled with one decoded picture.
    Picture { bytes_used: usize, timestamp_us: i64 },
    NeedMoreInput,
    FormatChanged,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("transform failure: {0}")]
    Fatal(String),
}

/// Capability set of the wrapped decoder.
///
/// Exclusively owned and driven by one [`crate::session::DecoderSession`]
/// on one thread; implementations need `Send` for the worker handoff but no
/// internal locking.
pub trait DecodeTransform: Send {
    fn set_input_format(&mut self, format: &InputFormat) -> Result<(), TransformError>;

    /// Enumerate offered output types, lowest index first; `None` past the
    /// end of the list. The offer list may change after a format change.
    fn output_format(&mut self, index: usize) -> Result<Option<MediaFormat>, TransformError>;

    fn set_output_format(&mut self, format: &MediaFormat) -> Result<(), TransformError>;

    fn input_requirements(&self) -> BufferRequirements;

    fn output_requirements(&self) -> BufferRequirements;

    fn send_command(&mut self, command: StreamCommand) -> Result<(), TransformError>;

    fn process_input(&mut self, sample: InputSample) -> Result<FeedStatus, TransformError>;

    /// Fill `buffer` (allocated to [`Self::output_requirements`]) with the
    /// next decoded picture, if any.
    fn process_output(&mut self, buffer: &mut [u8]) -> Result<PollStatus, TransformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sized_for_applies_minimum_and_alignment() {
        let req = BufferRequirements { min_size: 4096, alignment: 16 };
        assert_eq!(req.sized_for(100), 4096);
        assert_eq!(req.sized_for(4097), 4112);

        let loose = BufferRequirements { min_size: 0, alignment: 0 };
        assert_eq!(loose.sized_for(100), 100);
    }
}
