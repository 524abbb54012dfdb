//! Per-file log state machine.
//!
//! The machine decides when a tracked file must be read, drained across a
//! rotation or flushed. It performs no I/O itself: every transition that needs
//! bytes moved hands a [`ReadCommand`] to the file's reader task, so all
//! operations return without blocking and are safe to call while the
//! coordinator holds its guard.

use crate::reader::{AppendQueued, ReadCommand, TailReader, reader_task};
use crate::sink::LineSink;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Idle: never started, or unregistered.
    Reset,
    /// Appends are read as they are reported.
    Normal,
    /// Handoff from the old file instance to the new one.
    Rotating,
    /// The watch was lost during a rotation; only re-registration revives the file.
    Unwatched,
}

/// Transitions the coordinator and the polling dispatcher drive.
pub trait LogStateMachine: Send + Sync {
    /// Registration-time read of whatever the file already holds.
    fn force_append_check(&self);
    /// The file reported new content.
    fn append_check(&self);
    /// The path was re-created; called only once its new watch is recorded.
    fn begin_rotate(&self);
    /// Unregistration. Idempotent.
    fn reset(&self);
    /// The file's watch could not be re-established.
    fn watch_lost(&self);
    fn state(&self) -> LogState;
}

/// Default [`LogStateMachine`] that feeds a reader task.
#[derive(Debug)]
pub struct LogFileStateMachine {
    path: PathBuf,
    state: Mutex<LogState>,
    commands: mpsc::UnboundedSender<ReadCommand>,
    append_queued: AppendQueued,
}

impl LogFileStateMachine {
    /// A machine whose reader clears `append_queued` when it starts an append.
    pub(crate) fn new(
        path: impl Into<PathBuf>,
        commands: mpsc::UnboundedSender<ReadCommand>,
        append_queued: AppendQueued,
    ) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LogState::Reset),
            commands,
            append_queued,
        }
    }

    /// Creates a machine for `path` together with the task reading it into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(
        path: impl Into<PathBuf>,
        separator: impl Into<String>,
        sink: S,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        S: LineSink + 'static,
    {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = TailReader::new(path.clone(), separator, sink);
        let machine = Self::new(path, tx, reader.append_queued());
        let handle = tokio::spawn(reader_task(reader, rx));
        (Arc::new(machine), handle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn request(&self, command: ReadCommand) {
        if self.commands.send(command).is_err() {
            warn!(path = %self.path.display(), ?command, "reader closed, request dropped");
        }
    }
}

impl LogStateMachine for LogFileStateMachine {
    fn force_append_check(&self) {
        let mut state = self.state.lock();
        *state = LogState::Normal;
        self.append_queued.mark();
        self.request(ReadCommand::Append);
        debug!(path = %self.path.display(), "forced append check");
    }

    fn append_check(&self) {
        let state = self.state.lock();
        if *state != LogState::Normal {
            trace!(path = %self.path.display(), state = ?*state, "append dropped");
        } else if self.append_queued.mark() {
            self.request(ReadCommand::Append);
        } else {
            trace!(path = %self.path.display(), "append already queued");
        }
    }

    fn begin_rotate(&self) {
        let mut state = self.state.lock();
        match *state {
            LogState::Reset => {
                debug!(path = %self.path.display(), "rotation ignored, file is reset");
            }
            _ => {
                *state = LogState::Rotating;
                self.request(ReadCommand::Rotate);
                *state = LogState::Normal;
                info!(path = %self.path.display(), "rotation handed off");
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        if *state != LogState::Reset {
            *state = LogState::Reset;
            self.request(ReadCommand::Reset);
            debug!(path = %self.path.display(), "state reset");
        }
    }

    fn watch_lost(&self) {
        let mut state = self.state.lock();
        if *state != LogState::Reset {
            *state = LogState::Unwatched;
            warn!(path = %self.path.display(), "file is no longer watched");
        }
    }

    fn state(&self) -> LogState {
        *self.state.lock()
    }
}
