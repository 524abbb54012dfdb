//! File reading utilities for log processing.
//!
//! The state machine decides *when* a file must be read; the task in this
//! module does the reading. It keeps the current instance of the file open so
//! that whatever is left of it can still be drained after a rotation renamed
//! or unlinked it.

use crate::error::Result;
use crate::sink::{LineSink, ROTATION_SENTINEL};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// What the state machine asks the reader to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadCommand {
    /// Read from the cursor to the current end of file.
    Append,
    /// Finish the old instance, mark the boundary, start over on the new one.
    Rotate,
    /// Flush what is pending and release the cursor.
    Reset,
}

/// Set while a [`ReadCommand::Append`] waits in a reader's queue.
///
/// Shared by a state machine and its reader. Every queued append reads to the
/// end of the file, so further append requests can be skipped until the
/// reader picks the queued one up.
#[derive(Debug, Clone, Default)]
pub(crate) struct AppendQueued(Arc<AtomicBool>);

impl AppendQueued {
    /// Marks an append as queued. Returns false if one already was.
    pub(crate) fn mark(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// The reader started on the queued append.
    pub(crate) fn take(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bytes pulled from a file per read call.
pub(crate) const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Longest unterminated line held back; longer content is delivered in pieces.
pub(crate) const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Buffers bytes until a separator completes a line.
#[derive(Debug)]
pub(crate) struct LineSplitter {
    separator: String,
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn new(separator: impl Into<String>) -> Self {
        let separator = separator.into();
        Self {
            separator: if separator.is_empty() { "\n".to_string() } else { separator },
            pending: Vec::new(),
        }
    }

    /// Appends `bytes` and returns every line they complete.
    ///
    /// An unterminated line that reaches [`MAX_LINE_BYTES`] is returned as is
    /// and the rest of it starts a new line.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = match find_last(&self.pending, self.separator.as_bytes()) {
            Some(end) => {
                let rest = self.pending.split_off(end + self.separator.len());
                let complete = std::mem::replace(&mut self.pending, rest);
                split_and_filter_content(&String::from_utf8_lossy(&complete), &self.separator)
            }
            None => Vec::new(),
        };

        if self.pending.len() >= MAX_LINE_BYTES {
            let oversized = std::mem::take(&mut self.pending);
            lines.push(String::from_utf8_lossy(&oversized).into_owned());
        }
        lines
    }

    /// Returns the unterminated tail, if there is one.
    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&pending).into_owned())
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

/// Split content by separator and filter out empty parts.
///
/// Empty lines never reach a sink as content: the empty line is the rotation
/// sentinel. Whitespace-only lines are content and are kept.
pub(crate) fn split_and_filter_content(content: &str, separator: &str) -> Vec<String> {
    content
        .split(separator)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Detect if the file was truncated by comparing current size with last position
pub(crate) fn detect_file_truncation(current_size: u64, last_position: u64) -> bool {
    current_size < last_position
}

/// Calculate bytes to read based on current size and last position
pub(crate) fn calculate_bytes_to_read(current_size: u64, last_position: u64) -> Option<u64> {
    if current_size <= last_position {
        None
    } else {
        Some(current_size - last_position)
    }
}

/// Result of one [`read_available`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadPass {
    pub(crate) lines: usize,
    pub(crate) truncated: bool,
}

/// Read everything between `position` and the end of `file` as it was when
/// the pass started, delivering lines to `sink` as they complete.
///
/// Reads go through a fixed [`READ_CHUNK_SIZE`] buffer, and `position`
/// advances with every chunk. A file that shrank below `position` was
/// truncated in place: `lines` is cleared and the file is read again from the
/// start.
pub(crate) async fn read_available<S: LineSink + ?Sized>(
    file: &mut File,
    position: &mut u64,
    lines: &mut LineSplitter,
    sink: &S,
) -> Result<ReadPass> {
    let current_size = file.metadata().await?.len();

    let mut pass = ReadPass {
        lines: 0,
        truncated: detect_file_truncation(current_size, *position),
    };
    if pass.truncated {
        *position = 0;
        lines.clear();
    }

    let Some(mut remaining) = calculate_bytes_to_read(current_size, *position) else {
        return Ok(pass);
    };

    file.seek(SeekFrom::Start(*position)).await?;
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    while remaining > 0 {
        let wanted = remaining.min(READ_CHUNK_SIZE as u64) as usize;
        let read = file.read(&mut chunk[..wanted]).await?;
        if read == 0 {
            break;
        }
        *position += read as u64;
        remaining -= read as u64;

        for line in lines.push(&chunk[..read]) {
            sink.process(line);
            pass.lines += 1;
        }
    }

    Ok(pass)
}

/// Opens `path` for reading, mapping a missing file to `None`.
pub(crate) async fn open_if_exists(path: &Path) -> Result<Option<File>> {
    match File::open(path).await {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Pulls new bytes from one tracked file into a [`LineSink`].
pub(crate) struct TailReader<S> {
    path: PathBuf,
    sink: S,
    file: Option<File>,
    position: u64,
    lines: LineSplitter,
    queued: AppendQueued,
}

impl<S: LineSink> TailReader<S> {
    pub(crate) fn new(path: impl Into<PathBuf>, separator: impl Into<String>, sink: S) -> Self {
        Self {
            path: path.into(),
            sink,
            file: None,
            position: 0,
            lines: LineSplitter::new(separator),
            queued: AppendQueued::default(),
        }
    }

    /// The flag this reader clears when it starts on a queued append.
    pub(crate) fn append_queued(&self) -> AppendQueued {
        self.queued.clone()
    }

    pub(crate) async fn handle(&mut self, command: ReadCommand) -> Result<usize> {
        match command {
            ReadCommand::Append => {
                self.queued.take();
                self.append().await
            }
            ReadCommand::Rotate => self.rotate().await,
            ReadCommand::Reset => self.reset().await,
        }
    }

    async fn append(&mut self) -> Result<usize> {
        if self.file.is_none() {
            self.file = open_if_exists(&self.path).await?;
        }
        self.drain_current().await
    }

    /// Read whatever the currently open instance still holds.
    async fn drain_current(&mut self) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let pass = read_available(file, &mut self.position, &mut self.lines, &self.sink).await?;
        if pass.truncated {
            debug!(path = %self.path.display(), "file truncated, read again from start");
        }
        trace!(
            path = %self.path.display(),
            count = pass.lines,
            position = self.position,
            "lines delivered"
        );
        Ok(pass.lines)
    }

    fn flush_partial(&mut self) -> usize {
        match self.lines.flush() {
            Some(line) => {
                self.sink.process(line);
                1
            }
            None => 0,
        }
    }

    async fn rotate(&mut self) -> Result<usize> {
        // The old instance may already be gone; its tail is best effort.
        let drained = match self.drain_current().await {
            Ok(count) => count,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not drain rotated file");
                0
            }
        };
        let flushed = self.flush_partial();

        self.sink.process(ROTATION_SENTINEL.to_string());
        self.file = None;
        self.position = 0;

        let fresh = self.append().await?;
        Ok(drained + flushed + fresh)
    }

    async fn reset(&mut self) -> Result<usize> {
        let drained = match self.drain_current().await {
            Ok(count) => count,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not flush file on reset");
                0
            }
        };
        let flushed = self.flush_partial();

        self.file = None;
        self.position = 0;
        Ok(drained + flushed)
    }
}

/// Background task that executes read commands in arrival order.
pub(crate) async fn reader_task<S: LineSink>(
    mut reader: TailReader<S>,
    mut commands: mpsc::UnboundedReceiver<ReadCommand>,
) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = reader.handle(command).await {
            warn!(path = %reader.path.display(), ?command, error = %e, "read failed");
        }
    }
    debug!(path = %reader.path.display(), "reader stopped");
}
