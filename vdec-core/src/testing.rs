//! Scripted stand-in for the transform boundary, test-only.
//!
//! Behavior is a queue of scripted responses: `process_input` pops the feed
//! plan (defaulting to `Accepted`), `process_output` pops the poll plan
//! (defaulting to `NeedMoreInput`). A shared probe records every call so
//! tests can assert on call counts and fed payloads after the transform has
//! moved into a session or queue.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::transform::{
    BufferRequirements, DecodeTransform, FeedStatus, InputFormat, InputSample, MediaFormat,
    PixelFormat, PollStatus, StreamCommand, TransformError,
};

/// Scripted `process_output` response.
pub(crate) enum PollScript {
    Picture { timestamp_us: i64 },
    NeedMoreInput,
    /// Report a format change and replace the offered output formats.
    FormatChanged(Vec<MediaFormat>),
    Fatal(&'static str),
}

/// A `process_input` call as the transform saw it.
#[derive(Debug, Clone)]
pub(crate) struct FedSample {
    pub buffer_len: usize,
    pub payload_len: usize,
    pub timestamp_us: i64,
}

#[derive(Default)]
pub(crate) struct Probe {
    pub fed: Vec<FedSample>,
    pub commands: Vec<StreamCommand>,
    pub input_format: Option<InputFormat>,
    pub negotiated: Vec<MediaFormat>,
    pub output_polls: usize,
}

pub(crate) struct ScriptedTransform {
    formats: Vec<MediaFormat>,
    current: Option<MediaFormat>,
    feed_plan: VecDeque<FeedStatus>,
    poll_plan: VecDeque<PollScript>,
    input_req: BufferRequirements,
    output_req: BufferRequirements,
    probe: Arc<Mutex<Probe>>,
    gate: Option<Gate>,
}

/// Blocks the transform's `process_input` until released, letting tests
/// queue tasks behind a deterministically stalled worker.
#[derive(Clone)]
pub(crate) struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn new() -> Self {
        Self(Arc::new((Mutex::new(false), Condvar::new())))
    }

    pub fn release(&self) {
        let (open, cond) = &*self.0;
        *open.lock() = true;
        cond.notify_all();
    }

    fn wait(&self) {
        let (open, cond) = &*self.0;
        let mut open = open.lock();
        while !*open {
            cond.wait(&mut open);
        }
    }
}

/// An I420 format with the given coded size and stride.
pub(crate) fn i420(width: u32, height: u32, stride: u32) -> MediaFormat {
    MediaFormat {
        pixel_format: PixelFormat::I420,
        frame_size: Some((width, height)),
        crop: None,
        stride: Some(stride),
    }
}

/// Byte count of one stride-padded I420 picture for `format`.
pub(crate) fn i420_len(format: &MediaFormat) -> usize {
    let (_, h) = format.frame_size.unwrap();
    let stride = format.stride.unwrap() as usize;
    let h = h as usize;
    stride * h + 2 * ((stride / 2) * (h / 2))
}

impl ScriptedTransform {
    pub fn new(formats: Vec<MediaFormat>) -> Self {
        Self {
            formats,
            current: None,
            feed_plan: VecDeque::new(),
            poll_plan: VecDeque::new(),
            input_req: BufferRequirements { min_size: 0, alignment: 0 },
            output_req: BufferRequirements { min_size: 1 << 16, alignment: 0 },
            probe: Arc::new(Mutex::new(Probe::default())),
            gate: None,
        }
    }

    pub fn plan_feed(mut self, statuses: impl IntoIterator<Item = FeedStatus>) -> Self {
        self.feed_plan.extend(statuses);
        self
    }

    pub fn plan_poll(mut self, events: impl IntoIterator<Item = PollScript>) -> Self {
        self.poll_plan.extend(events);
        self
    }

    pub fn with_input_requirements(mut self, req: BufferRequirements) -> Self {
        self.input_req = req;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn probe(&self) -> Arc<Mutex<Probe>> {
        self.probe.clone()
    }
}

impl DecodeTransform for ScriptedTransform {
    fn set_input_format(&mut self, format: &InputFormat) -> Result<(), TransformError> {
        self.probe.lock().input_format = Some(*format);
        Ok(())
    }

    fn output_format(&mut self, index: usize) -> Result<Option<MediaFormat>, TransformError> {
        Ok(self.formats.get(index).cloned())
    }

    fn set_output_format(&mut self, format: &MediaFormat) -> Result<(), TransformError> {
        self.current = Some(format.clone());
        self.probe.lock().negotiated.push(format.clone());
        Ok(())
    }

    fn input_requirements(&self) -> BufferRequirements {
        self.input_req
    }

    fn output_requirements(&self) -> BufferRequirements {
        self.output_req
    }

    fn send_command(&mut self, command: StreamCommand) -> Result<(), TransformError> {
        self.probe.lock().commands.push(command);
        Ok(())
    }

    fn process_input(&mut self, sample: InputSample) -> Result<FeedStatus, TransformError> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.probe.lock().fed.push(FedSample {
            buffer_len: sample.data.len(),
            payload_len: sample.payload_len,
            timestamp_us: sample.timestamp_us,
        });
        Ok(self.feed_plan.pop_front().unwrap_or(FeedStatus::Accepted))
    }

    fn process_output(&mut self, buffer: &mut [u8]) -> Result<PollStatus, TransformError> {
        self.probe.lock().output_polls += 1;
        match self.poll_plan.pop_front() {
            Some(PollScript::Picture { timestamp_us }) => {
                let format = self.current.as_ref().expect("no output format negotiated");
                let len = i420_len(format);
                assert!(buffer.len() >= len, "output buffer undersized for script");
                for (i, byte) in buffer[..len].iter_mut().enumerate() {
                    *byte = (i % 251) as u8;
                }
                Ok(PollStatus::Picture { bytes_used: len, timestamp_us })
            }
            Some(PollScript::NeedMoreInput) | None => Ok(PollStatus::NeedMoreInput),
            Some(PollScript::FormatChanged(formats)) => {
                self.formats = formats;
                self.current = None;
                Ok(PollStatus::FormatChanged)
            }
            Some(PollScript::Fatal(msg)) => Err(TransformError::Fatal(msg.into())),
        }
    }
}
