//! Polling tail dispatcher, for hosts where kernel watch notification is unavailable.
//!
//! Each tick compares the identity of the file currently behind the path with
//! the instance held open from the previous tick. A different identity, or an
//! instance that shrank below the read cursor, is a rotation: the old instance
//! is drained, the rotation sentinel is emitted once, and reading resumes from
//! the start of the new instance. Rotations that complete entirely between two
//! ticks are still seen as one rotation, but content written to a
//! short-lived intermediate file is not.

use crate::error::Result;
use crate::reader::{LineSplitter, open_if_exists, read_available};
use crate::sink::{LineSink, ROTATION_SENTINEL};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Settings of a [`PollingTailer`].
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub separator: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            separator: "\n".to_string(),
        }
    }
}

/// What a single poll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing new.
    Idle,
    /// New lines from the same file instance.
    Lines(usize),
    /// A new instance replaced the old one; `lines` counts everything
    /// delivered around the sentinel.
    Rotated { lines: usize },
    /// No file at the path; retried on the next tick.
    NotFound,
}

/// Identifies one instance of a file independently of its name.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
impl FileIdentity {
    fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    created: Option<std::time::SystemTime>,
}

#[cfg(not(unix))]
impl FileIdentity {
    fn of(metadata: &Metadata) -> Self {
        Self {
            created: metadata.created().ok(),
        }
    }
}

/// Periodically tails one file into a [`LineSink`].
pub struct PollingTailer<S> {
    path: PathBuf,
    interval: Duration,
    sink: S,
    file: Option<File>,
    identity: Option<FileIdentity>,
    position: u64,
    lines: LineSplitter,
    missing: bool,
}

impl<S: LineSink> PollingTailer<S> {
    pub fn new(path: impl Into<PathBuf>, sink: S, config: PollConfig) -> Self {
        Self {
            path: path.into(),
            interval: config.interval,
            sink,
            file: None,
            identity: None,
            position: 0,
            lines: LineSplitter::new(config.separator),
            missing: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks the file once for growth and rotation.
    pub async fn poll_once(&mut self) -> Result<PollOutcome> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Keep the old instance open: its identity cannot be recycled
                // while we hold it, and its tail is still readable.
                self.drain_best_effort().await;
                self.file_not_found();
                return Ok(PollOutcome::NotFound);
            }
            Err(e) => return Err(e.into()),
        };
        self.missing = false;

        let current = FileIdentity::of(&metadata);
        match self.identity {
            None => {
                if !self.open().await? {
                    self.file_not_found();
                    return Ok(PollOutcome::NotFound);
                }
                let count = self.drain().await?;
                Ok(if count == 0 { PollOutcome::Idle } else { PollOutcome::Lines(count) })
            }
            Some(known) if known != current => {
                let lines = self.rotate(true).await?;
                Ok(PollOutcome::Rotated { lines })
            }
            Some(_) if metadata.len() < self.position => {
                let lines = self.rotate(false).await?;
                Ok(PollOutcome::Rotated { lines })
            }
            Some(_) => {
                let count = self.drain().await?;
                Ok(if count == 0 { PollOutcome::Idle } else { PollOutcome::Lines(count) })
            }
        }
    }

    /// Polls on the configured interval until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(outcome) => trace!(path = %self.path.display(), ?outcome, "polled"),
                    Err(e) => warn!(
                        path = %self.path.display(),
                        error = %e,
                        "poll failed, retrying next interval"
                    ),
                },
            }
        }
        debug!(path = %self.path.display(), "polling stopped");
    }

    /// Runs the dispatcher on its own task.
    pub fn spawn(self) -> PollHandle
    where
        S: 'static,
    {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        PollHandle {
            shutdown_tx,
            task: Some(task),
        }
    }

    fn file_not_found(&mut self) {
        if self.missing {
            debug!(path = %self.path.display(), "file still not found");
        } else {
            warn!(path = %self.path.display(), "file not found");
            self.missing = true;
        }
    }

    /// Opens the instance currently behind the path. Returns false if there is none.
    async fn open(&mut self) -> Result<bool> {
        let Some(file) = open_if_exists(&self.path).await? else {
            return Ok(false);
        };
        self.identity = Some(FileIdentity::of(&file.metadata().await?));
        self.file = Some(file);
        self.position = 0;
        Ok(true)
    }

    async fn drain(&mut self) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };
        let pass = read_available(file, &mut self.position, &mut self.lines, &self.sink).await?;
        Ok(pass.lines)
    }

    async fn drain_best_effort(&mut self) -> usize {
        match self.drain().await {
            Ok(count) => count,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not drain previous file");
                0
            }
        }
    }

    /// Finishes the current instance, marks the boundary and starts on the next one.
    ///
    /// `reopen` is false when the same instance was truncated in place.
    async fn rotate(&mut self, reopen: bool) -> Result<usize> {
        let mut count = if reopen { self.drain_best_effort().await } else { 0 };
        if let Some(line) = self.lines.flush() {
            self.sink.process(line);
            count += 1;
        }

        self.sink.process(ROTATION_SENTINEL.to_string());
        info!(path = %self.path.display(), "file rotation detected");

        self.position = 0;
        if reopen {
            self.file = None;
            self.identity = None;
            if !self.open().await? {
                self.file_not_found();
                return Ok(count);
            }
        }
        Ok(count + self.drain().await?)
    }
}

/// Stops a spawned [`PollingTailer`] when shut down or dropped.
pub struct PollHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Stops polling and waits for the task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        // Ignore errors if the task already stopped
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::MAX_LINE_BYTES;
    use crate::test_helpers::{CollectSink, TempLogFile};

    fn tailer(log: &TempLogFile, sink: &CollectSink) -> PollingTailer<CollectSink> {
        PollingTailer::new(log.path(), sink.clone(), PollConfig::default())
    }

    #[tokio::test]
    async fn test_first_poll_reads_existing_content() {
        let log = TempLogFile::with_content("line1\nline2").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(2));
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Idle);
        assert_eq!(sink.lines(), vec!["line1", "line2"]);
    }

    #[tokio::test]
    async fn test_growth_delivers_only_new_lines() {
        let log = TempLogFile::with_content("first").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        tailer.poll_once().await.unwrap();
        log.append_content("second").unwrap();
        log.append_raw("third-partial").unwrap();

        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(1));
        log.append_raw(" done\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(1));

        assert_eq!(sink.lines(), vec!["first", "second", "third-partial done"]);
    }

    #[tokio::test]
    async fn test_whitespace_only_lines_are_content() {
        let log = TempLogFile::new().unwrap();
        log.append_raw("Traceback:\n    \n  at main\n").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(3));
        assert_eq!(sink.lines(), vec!["Traceback:", "    ", "  at main"]);
    }

    #[tokio::test]
    async fn test_large_sparse_file_is_read_in_pieces() {
        let log = TempLogFile::new().unwrap();
        let size = 8 * MAX_LINE_BYTES as u64;
        let file = std::fs::OpenOptions::new().write(true).open(log.path()).unwrap();
        file.set_len(size).unwrap();
        drop(file);
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(8));
        assert_eq!(tailer.position, size);
        assert!(sink.lines().iter().all(|line| line.len() == MAX_LINE_BYTES));

        log.append_content("after").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(1));
        assert_eq!(sink.lines().last().map(String::as_str), Some("after"));
    }

    #[tokio::test]
    async fn test_replacement_between_polls_emits_one_sentinel() {
        let log = TempLogFile::with_content("old").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        tailer.poll_once().await.unwrap();
        log.replace_with("new1\nnew2\n").unwrap();

        assert_eq!(
            tailer.poll_once().await.unwrap(),
            PollOutcome::Rotated { lines: 2 }
        );
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Idle);
        assert_eq!(sink.lines(), vec!["old", "", "new1", "new2"]);
    }

    #[tokio::test]
    async fn test_rename_rotation_drains_old_tail_first() {
        let log = TempLogFile::with_content("a").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        tailer.poll_once().await.unwrap();
        log.append_content("b").unwrap();
        log.append_raw("c").unwrap();
        log.rotate().unwrap();
        log.append_content("d").unwrap();

        assert_eq!(
            tailer.poll_once().await.unwrap(),
            PollOutcome::Rotated { lines: 3 }
        );
        assert_eq!(sink.lines(), vec!["a", "b", "c", "", "d"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_reported_and_retried() {
        let log = TempLogFile::with_content("before").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        tailer.poll_once().await.unwrap();
        log.remove().unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::NotFound);
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::NotFound);

        std::fs::write(log.path(), "after\n").unwrap();
        assert_eq!(
            tailer.poll_once().await.unwrap(),
            PollOutcome::Rotated { lines: 1 }
        );
        assert_eq!(sink.lines(), vec!["before", "", "after"]);
    }

    #[tokio::test]
    async fn test_file_created_after_start_is_not_a_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.log");
        let sink = CollectSink::new();
        let mut tailer = PollingTailer::new(&path, sink.clone(), PollConfig::default());

        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::NotFound);
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(1));
        assert_eq!(sink.lines(), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_truncation_in_place_is_a_rotation() {
        let log = TempLogFile::with_content("a much longer first line").unwrap();
        let sink = CollectSink::new();
        let mut tailer = tailer(&log, &sink);

        tailer.poll_once().await.unwrap();
        log.truncate().unwrap();
        log.append_content("short").unwrap();

        assert_eq!(
            tailer.poll_once().await.unwrap(),
            PollOutcome::Rotated { lines: 1 }
        );
        assert_eq!(sink.lines(), vec!["a much longer first line", "", "short"]);
    }

    #[tokio::test]
    async fn test_custom_separator() {
        let log = TempLogFile::new().unwrap();
        log.append_raw("a|b|c").unwrap();
        let sink = CollectSink::new();
        let config = PollConfig {
            separator: "|".to_string(),
            ..PollConfig::default()
        };
        let mut tailer = PollingTailer::new(log.path(), sink.clone(), config);

        assert_eq!(tailer.poll_once().await.unwrap(), PollOutcome::Lines(2));
        assert_eq!(sink.lines(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_spawned_tailer_polls_until_shutdown() {
        let log = TempLogFile::with_content("tick").unwrap();
        let sink = CollectSink::new();
        let config = PollConfig {
            interval: Duration::from_millis(10),
            ..PollConfig::default()
        };
        let handle = PollingTailer::new(log.path(), sink.clone(), config).spawn();

        assert!(sink.wait_for(1, Duration::from_secs(5)).await);
        log.replace_with("tock\n").unwrap();
        assert!(sink.wait_for(3, Duration::from_secs(5)).await);

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
        assert_eq!(sink.lines(), vec!["tick", "", "tock"]);
    }
}
