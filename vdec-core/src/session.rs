//! Decoder session: owns the transform handle and drives the decode
//! protocol.
//!
//! One session per decoder instance, living on the queue's worker thread.
//! It negotiates the input/output types, feeds padded samples, polls for
//! output, and absorbs mid-stream format changes by renegotiating the
//! output type and recomputing the cached geometry. A fatal error from any
//! step closes the whole session; there is no partial re-creation.

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::avcc::AvcConfigRecord;
use crate::geometry::{self, FrameGeometry, GeometryError};
use crate::transform::{
    BufferRequirements, DecodeTransform, FeedStatus, InputFormat, InputSample, PixelFormat,
    PollStatus, StreamCommand, TransformError, VideoCodec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Uninitialized,
    Configured,
    Streaming,
    Draining,
    Flushing,
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("transform offers no {0:?} output format")]
    NoUsableOutputFormat(PixelFormat),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error("transform reported consecutive output format changes")]
    FormatChangeLoop,
    #[error("decoded output shorter than the negotiated frame size")]
    ShortOutput,
    #[error("{op} invalid while {state:?}")]
    InvalidState { op: &'static str, state: SessionState },
}

/// One decoded picture, planar I420, rows padded to the geometry's stride
/// (chroma rows to half of it). Owned by the caller once returned.
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub geometry: FrameGeometry,
    pub timestamp_us: i64,
}

/// Outcome of [`DecoderSession::retrieve_output`]. `NeedMoreInput` is flow
/// control: feed more data, or, while draining, the stream is fully drained.
#[derive(Debug)]
pub enum Retrieved {
    Picture(DecodedPicture),
    NeedMoreInput,
}

pub struct DecoderSession {
    transform: Box<dyn DecodeTransform>,
    config: AvcConfigRecord,
    state: SessionState,
    geometry: Option<FrameGeometry>,
    input_req: BufferRequirements,
    output_req: BufferRequirements,
}

impl DecoderSession {
    pub fn new(transform: Box<dyn DecodeTransform>, config: AvcConfigRecord) -> Self {
        Self {
            transform,
            config,
            state: SessionState::Uninitialized,
            geometry: None,
            input_req: BufferRequirements { min_size: 0, alignment: 0 },
            output_req: BufferRequirements { min_size: 0, alignment: 0 },
        }
    }

    /// Negotiate input/output types, cache geometry and buffer
    /// requirements, and signal begin-of-stream.
    ///
    /// Fatal if the transform offers no output type in the required planar
    /// format; the session is unusable afterwards.
    pub fn configure(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::InvalidState { op: "configure", state: self.state });
        }
        match self.configure_inner() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    fn configure_inner(&mut self) -> Result<(), SessionError> {
        self.transform
            .set_input_format(&InputFormat { codec: VideoCodec::H264 })?;
        self.negotiate_output()?;
        self.state = SessionState::Configured;

        self.input_req = self.transform.input_requirements();
        self.output_req = self.transform.output_requirements();

        self.transform.send_command(StreamCommand::BeginStream)?;
        self.state = SessionState::Streaming;

        if let Some(geo) = &self.geometry {
            info!(
                "decoder session configured: {}x{} stride {}",
                geo.coded_width, geo.coded_height, geo.stride_bytes
            );
        }
        Ok(())
    }

    /// Scan the transform's offered output types for I420, select it, and
    /// resolve the frame geometry. Re-run on every format change.
    fn negotiate_output(&mut self) -> Result<(), SessionError> {
        let mut index = 0;
        while let Some(format) = self.transform.output_format(index)? {
            index += 1;
            if format.pixel_format != PixelFormat::I420 {
                continue;
            }
            self.transform.set_output_format(&format)?;
            self.geometry = Some(geometry::resolve(&format)?);
            return Ok(());
        }
        Err(SessionError::NoUsableOutputFormat(PixelFormat::I420))
    }

    /// Submit one rewritten access unit.
    ///
    /// `NotAccepting` means the transform already holds enough data to
    /// produce a picture: drain via [`Self::retrieve_output`] and retry the
    /// same unit.
    pub fn feed(
        &mut self,
        data: &[u8],
        timestamp_us: i64,
        duration_us: i64,
    ) -> Result<FeedStatus, SessionError> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::InvalidState { op: "feed", state: self.state });
        }

        let mut buffer = vec![0u8; self.input_req.sized_for(data.len())];
        buffer[..data.len()].copy_from_slice(data);
        let sample = InputSample {
            data: buffer,
            payload_len: data.len(),
            timestamp_us,
            duration_us,
        };

        match self.transform.process_input(sample) {
            Ok(status) => {
                if status == FeedStatus::NotAccepting {
                    debug!("transform not accepting input at ts {}", timestamp_us);
                }
                Ok(status)
            }
            Err(err) => {
                self.state = SessionState::Closed;
                Err(err.into())
            }
        }
    }

    /// Poll the transform for one decoded picture.
    ///
    /// A format-change report renegotiates the output type, recomputes the
    /// geometry, and retries the poll exactly once; a second consecutive
    /// report is a protocol violation and closes the session. While
    /// draining, `NeedMoreInput` means the stream is fully drained and the
    /// session returns to streaming.
    pub fn retrieve_output(&mut self) -> Result<Retrieved, SessionError> {
        if self.state != SessionState::Streaming && self.state != SessionState::Draining {
            return Err(SessionError::InvalidState { op: "retrieve_output", state: self.state });
        }
        match self.retrieve_inner() {
            Ok(retrieved) => {
                if self.state == SessionState::Draining {
                    if let Retrieved::NeedMoreInput = retrieved {
                        debug!("drain complete");
                        self.state = SessionState::Streaming;
                    }
                }
                Ok(retrieved)
            }
            Err(err) => {
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    fn retrieve_inner(&mut self) -> Result<Retrieved, SessionError> {
        let mut reconfigured = false;
        loop {
            let mut buffer = vec![0u8; self.output_req.sized_for(0)];
            match self.transform.process_output(&mut buffer)? {
                PollStatus::Picture { bytes_used, timestamp_us } => {
                    let picture = self.split_planes(&buffer[..bytes_used], timestamp_us)?;
                    return Ok(Retrieved::Picture(picture));
                }
                PollStatus::NeedMoreInput => return Ok(Retrieved::NeedMoreInput),
                PollStatus::FormatChanged => {
                    if reconfigured {
                        return Err(SessionError::FormatChangeLoop);
                    }
                    reconfigured = true;
                    info!("output format changed, renegotiating");
                    self.negotiate_output()?;
                    // Buffer sizing may move with the new format.
                    self.output_req = self.transform.output_requirements();
                }
            }
        }
    }

    /// Split a stride-padded I420 buffer into planes using the cached
    /// geometry.
    fn split_planes(&self, raw: &[u8], timestamp_us: i64) -> Result<DecodedPicture, SessionError> {
        let geometry = self
            .geometry
            .ok_or(SessionError::InvalidState { op: "retrieve_output", state: self.state })?;

        let stride = geometry.stride_bytes as usize;
        let height = geometry.coded_height as usize;
        let chroma_stride = stride / 2;
        let chroma_height = height / 2;

        let y_len = stride * height;
        let c_len = chroma_stride * chroma_height;
        if raw.len() < y_len + 2 * c_len {
            return Err(SessionError::ShortOutput);
        }

        Ok(DecodedPicture {
            y: raw[..y_len].to_vec(),
            u: raw[y_len..y_len + c_len].to_vec(),
            v: raw[y_len + c_len..y_len + 2 * c_len].to_vec(),
            geometry,
            timestamp_us,
        })
    }

    /// Flush buffered input/output state; used on seek and error recovery.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Streaming && self.state != SessionState::Draining {
            return Err(SessionError::InvalidState { op: "reset", state: self.state });
        }
        self.state = SessionState::Flushing;
        match self.transform.send_command(StreamCommand::Flush) {
            Ok(()) => {
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Closed;
                Err(err.into())
            }
        }
    }

    /// Signal end-of-stream. The caller must keep polling
    /// [`Self::retrieve_output`] until it reports `NeedMoreInput`, which
    /// while draining means the stream is fully drained.
    pub fn drain(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::InvalidState { op: "drain", state: self.state });
        }
        match self.transform.send_command(StreamCommand::EndStream) {
            Ok(()) => {
                self.state = SessionState::Draining;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Closed;
                Err(err.into())
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn geometry(&self) -> Option<FrameGeometry> {
        self.geometry
    }

    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state,
            "geometry": self.geometry,
            "profile": self.config.profile,
            "profile_compat": self.config.profile_compat,
            "level": self.config.level,
            "nal_length_size": self.config.nal_length_size,
            "input_min_size": self.input_req.min_size,
            "output_min_size": self.output_req.min_size,
        })
    }
}
