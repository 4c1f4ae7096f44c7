//! # Decode Task Queue
//!
//! Single-worker serial task queue bound to one decoder session:
//! - Non-blocking submissions from the caller thread
//! - Strict FIFO execution on a dedicated worker
//! - Callbacks delivered in submission order, worker thread only
//! - The session's transform handle is touched by the worker alone
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐ submit ┌────────────────┐ decode ┌────────────────┐
//! │ Caller   │───────►│ DecodeTaskQueue│───────►│ DecoderSession │
//! │ Thread   │        │ (FIFO + worker)│        │ + transform    │
//! └──────────┘        └───────┬────────┘        └────────────────┘
//!                             │ pictures / errors
//!                             ▼
//!                       ┌────────────┐
//!                       │ DecodeSink │
//!                       └────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::avcc::{self, AvcConfigRecord, ParseError, RewriteError};
use crate::session::{DecodedPicture, DecoderSession, Retrieved, SessionError};
use crate::transform::{DecodeTransform, FeedStatus, TransformError};

/// One timestamped chunk of encoded video, moved into the pipeline for the
/// duration of one decode task.
#[derive(Debug, Clone)]
pub struct EncodedAccessUnit {
    pub data: Bytes,
    pub timestamp_us: i64,
    pub duration_us: i64,
}

/// Submission rejected: the queue has been shut down or the session died.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("decode queue is closed")]
pub struct QueueClosed;

/// Why a single access unit failed while the queue stayed open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error("session torn down before this unit was decoded")]
    Aborted,
}

/// Callback sink for decode results.
///
/// Invoked exclusively on the worker thread, in the order the corresponding
/// tasks were submitted. After [`DecodeSink::terminated`] or after
/// [`DecodeTaskQueue::shutdown`] returns, no further callbacks fire.
pub trait DecodeSink: Send {
    fn picture_decoded(&mut self, picture: DecodedPicture);

    /// One access unit failed; the queue stays open.
    fn decode_failed(&mut self, timestamp_us: i64, error: UnitError);

    fn reset_complete(&mut self);

    fn drain_complete(&mut self);

    /// Terminal session failure; the queue is closed.
    fn terminated(&mut self, error: SessionError);
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub units_submitted: u64,
    pub pictures_delivered: u64,
    pub units_failed: u64,
}

enum Task {
    Decode(EncodedAccessUnit),
    Reset,
    Drain,
}

#[derive(Default)]
struct TaskState {
    queue: VecDeque<Task>,
    /// Shutdown requested; the worker finishes what is queued and exits.
    closing: bool,
    /// The session died; submissions are rejected.
    dead: bool,
}

struct Shared {
    tasks: Mutex<TaskState>,
    work: Condvar,
    units_submitted: AtomicU64,
    pictures_delivered: AtomicU64,
    units_failed: AtomicU64,
}

/// Serial decode queue owning one worker thread and one session.
pub struct DecodeTaskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DecodeTaskQueue {
    /// Parse the codec configuration record and start the worker, which
    /// configures the session as its first act. The caller thread never
    /// touches the transform.
    ///
    /// A malformed record fails here, before any thread exists.
    pub fn spawn(
        transform: Box<dyn DecodeTransform>,
        codec_config: &[u8],
        sink: Box<dyn DecodeSink>,
    ) -> Result<Self, ParseError> {
        let config = AvcConfigRecord::parse(codec_config)?;
        let shared = Arc::new(Shared {
            tasks: Mutex::new(TaskState::default()),
            work: Condvar::new(),
            units_submitted: AtomicU64::new(0),
            pictures_delivered: AtomicU64::new(0),
            units_failed: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || {
            Worker {
                shared: worker_shared,
                config,
                sink,
                sent_parameter_sets: false,
            }
            .run(transform);
        });

        Ok(Self { shared, worker: Some(worker) })
    }

    pub fn submit_decode(&self, unit: EncodedAccessUnit) -> Result<(), QueueClosed> {
        self.submit(Task::Decode(unit))?;
        self.shared.units_submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn submit_reset(&self) -> Result<(), QueueClosed> {
        self.submit(Task::Reset)
    }

    pub fn submit_drain(&self) -> Result<(), QueueClosed> {
        self.submit(Task::Drain)
    }

    fn submit(&self, task: Task) -> Result<(), QueueClosed> {
        {
            let mut state = self.shared.tasks.lock();
            if state.closing || state.dead {
                return Err(QueueClosed);
            }
            state.queue.push_back(task);
        }
        self.shared.work.notify_one();
        Ok(())
    }

    /// Finish everything already queued (callback ordering preserved), stop
    /// the worker, and release the session. Idempotent; afterwards every
    /// submission fails with [`QueueClosed`].
    pub fn shutdown(&mut self) {
        self.shared.tasks.lock().closing = true;
        self.shared.work.notify_one();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("decode worker panicked during shutdown");
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            units_submitted: self.shared.units_submitted.load(Ordering::Relaxed),
            pictures_delivered: self.shared.pictures_delivered.load(Ordering::Relaxed),
            units_failed: self.shared.units_failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for DecodeTaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    shared: Arc<Shared>,
    config: AvcConfigRecord,
    sink: Box<dyn DecodeSink>,
    /// Parameter sets are injected exactly once per session, ahead of the
    /// first successfully rewritten unit.
    sent_parameter_sets: bool,
}

impl Worker {
    fn run(mut self, transform: Box<dyn DecodeTransform>) {
        let mut session = DecoderSession::new(transform, self.config.clone());
        if let Err(err) = session.configure() {
            self.terminate(err);
            return;
        }

        while let Some(task) = self.next_task() {
            let result = match task {
                Task::Decode(unit) => self.decode_one(&mut session, unit),
                Task::Reset => match session.reset() {
                    Ok(()) => {
                        self.sink.reset_complete();
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                Task::Drain => self.drain(&mut session),
            };
            if let Err(err) = result {
                self.terminate(err);
                return;
            }
        }
        debug!("decode worker exiting after shutdown");
    }

    fn next_task(&self) -> Option<Task> {
        let mut state = self.shared.tasks.lock();
        loop {
            if let Some(task) = state.queue.pop_front() {
                return Some(task);
            }
            if state.closing {
                return None;
            }
            self.shared.work.wait(&mut state);
        }
    }

    /// Rewrite → feed → drain output. Rewrite failures fail this unit only;
    /// anything out of the session is fatal and bubbles to `terminate`.
    fn decode_one(
        &mut self,
        session: &mut DecoderSession,
        unit: EncodedAccessUnit,
    ) -> Result<(), SessionError> {
        let annex_b = if avcc::is_annex_b(&unit.data) {
            unit.data.to_vec()
        } else {
            match avcc::to_annex_b(&unit.data, &self.config, !self.sent_parameter_sets) {
                Ok(bytes) => {
                    self.sent_parameter_sets = true;
                    bytes
                }
                Err(err) => {
                    warn!("dropping corrupt access unit at ts {}: {}", unit.timestamp_us, err);
                    self.shared.units_failed.fetch_add(1, Ordering::Relaxed);
                    self.sink.decode_failed(unit.timestamp_us, err.into());
                    return Ok(());
                }
            }
        };

        loop {
            match session.feed(&annex_b, unit.timestamp_us, unit.duration_us)? {
                FeedStatus::Accepted => break,
                // The transform already holds enough data for a picture;
                // drain it, then retry the same unit.
                FeedStatus::NotAccepting => match session.retrieve_output()? {
                    Retrieved::Picture(picture) => self.deliver(picture),
                    Retrieved::NeedMoreInput => {
                        return Err(SessionError::Transform(TransformError::Fatal(
                            "transform not accepting input while reporting need-more-input".into(),
                        )));
                    }
                },
            }
        }

        loop {
            match session.retrieve_output()? {
                Retrieved::Picture(picture) => self.deliver(picture),
                Retrieved::NeedMoreInput => break,
            }
        }
        Ok(())
    }

    fn drain(&mut self, session: &mut DecoderSession) -> Result<(), SessionError> {
        session.drain()?;
        loop {
            match session.retrieve_output()? {
                Retrieved::Picture(picture) => self.deliver(picture),
                Retrieved::NeedMoreInput => break,
            }
        }
        self.sink.drain_complete();
        Ok(())
    }

    fn deliver(&mut self, picture: DecodedPicture) {
        self.shared.pictures_delivered.fetch_add(1, Ordering::Relaxed);
        self.sink.picture_decoded(picture);
    }

    /// Close the queue, abort whatever is still queued, and notify the sink
    /// that no further callbacks will fire.
    fn terminate(&mut self, err: SessionError) {
        error!("decode session failed: {}", err);
        let pending = {
            let mut state = self.shared.tasks.lock();
            state.dead = true;
            std::mem::take(&mut state.queue)
        };
        for task in pending {
            if let Task::Decode(unit) = task {
                self.shared.units_failed.fetch_add(1, Ordering::Relaxed);
                self.sink.decode_failed(unit.timestamp_us, UnitError::Aborted);
            }
        }
        self.sink.terminated(err);
    }
}
