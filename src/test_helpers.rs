//! Test utilities: temporary log files, a scriptable watch backend and recording doubles.

use crate::error::{Error, Result};
use crate::fsm::{LogState, LogStateMachine};
use crate::sink::LineSink;
use crate::table::WatchDescriptor;
use crate::watcher::{WatchBackend, WatchMask};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub struct TempLogFile {
    pub path: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TempLogFile {
    /// Create a new, empty temporary log file
    pub fn new() -> std::io::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("test.log");

        File::create(&path)?;

        Ok(Self {
            path,
            _temp_dir: temp_dir,
        })
    }

    /// Create a temporary log file with initial content
    pub fn with_content(content: &str) -> std::io::Result<Self> {
        let temp_file = Self::new()?;
        temp_file.append_content(content)?;
        Ok(temp_file)
    }

    /// Append a terminated line
    pub fn append_content(&self, content: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;

        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(())
    }

    /// Append bytes as-is, without a line terminator
    pub fn append_raw(&self, content: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Rename the file to `<name>.1` and start an empty one in its place
    pub fn rotate(&self) -> std::io::Result<PathBuf> {
        let archived = self.path.with_extension("log.1");
        fs::rename(&self.path, &archived)?;
        File::create(&self.path)?;
        Ok(archived)
    }

    /// Delete the file and write a new one with `content` under the same name
    pub fn replace_with(&self, content: &str) -> std::io::Result<()> {
        fs::remove_file(&self.path)?;
        fs::write(&self.path, content)
    }

    /// Truncate the file in place
    pub fn truncate(&self) -> std::io::Result<()> {
        File::create(&self.path)?;
        Ok(())
    }

    pub fn remove(&self) -> std::io::Result<()> {
        fs::remove_file(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sink that keeps every line it receives.
#[derive(Clone, Default)]
pub struct CollectSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Wait until at least `count` lines arrived.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.lines.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.lines.lock().len() >= count
    }
}

impl LineSink for CollectSink {
    fn process(&self, line: String) {
        self.lines.lock().push(line);
    }
}

/// Ordered record shared between doubles, to assert on interleavings.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

#[derive(Default)]
struct MockState {
    next_descriptor: u64,
    live: HashMap<WatchDescriptor, (PathBuf, WatchMask)>,
    failing_adds: HashSet<PathBuf>,
    failing_removes: bool,
    add_delay: Option<Duration>,
}

/// In-memory [`WatchBackend`] whose failures can be scripted.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    journal: Journal,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Arc::default(),
            journal,
        }
    }

    pub fn fail_add_for(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_adds.insert(path.into());
    }

    pub fn allow_add_for(&self, path: impl AsRef<Path>) {
        self.state.lock().failing_adds.remove(path.as_ref());
    }

    pub fn fail_removes(&self, fail: bool) {
        self.state.lock().failing_removes = fail;
    }

    pub fn delay_adds(&self, delay: Duration) {
        self.state.lock().add_delay = Some(delay);
    }

    pub fn is_watching(&self, path: &Path, mask: WatchMask) -> bool {
        self.state
            .lock()
            .live
            .values()
            .any(|(watched, watched_mask)| watched == path && *watched_mask == mask)
    }

    pub fn live_watch_count(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl WatchBackend for MockBackend {
    fn add_watch(&mut self, path: &Path, mask: WatchMask) -> Result<WatchDescriptor> {
        let delay = self.state.lock().add_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        if state.failing_adds.contains(path) {
            return Err(Error::Watcher(
                notify::Error::path_not_found().add_path(path.to_path_buf()),
            ));
        }
        state.next_descriptor += 1;
        let descriptor = WatchDescriptor::new(state.next_descriptor);
        state.live.insert(descriptor, (path.to_path_buf(), mask));
        self.journal.record(format!("add {} {:?}", path.display(), mask));
        Ok(descriptor)
    }

    fn remove_watch(&mut self, descriptor: WatchDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_removes {
            return Err(Error::UnknownDescriptor { descriptor });
        }
        state
            .live
            .remove(&descriptor)
            .ok_or(Error::UnknownDescriptor { descriptor })?;
        self.journal.record(format!("remove {descriptor}"));
        Ok(())
    }
}

/// [`LogStateMachine`] double that follows the real transitions and records every call.
pub struct RecordingMachine {
    state: Mutex<LogState>,
    calls: Mutex<Vec<String>>,
    reads: Mutex<usize>,
    journal: Journal,
    panic_on_append: bool,
}

impl RecordingMachine {
    pub fn new() -> Arc<Self> {
        Self::with_journal(Journal::default())
    }

    pub fn with_journal(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LogState::Reset),
            calls: Mutex::new(Vec::new()),
            reads: Mutex::new(0),
            journal,
            panic_on_append: false,
        })
    }

    pub fn panicking_on_append() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LogState::Reset),
            calls: Mutex::new(Vec::new()),
            reads: Mutex::new(0),
            journal: Journal::default(),
            panic_on_append: true,
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Reads the real machine would have requested.
    pub fn reads(&self) -> usize {
        *self.reads.lock()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
        self.journal.record(call);
    }
}

impl LogStateMachine for RecordingMachine {
    fn force_append_check(&self) {
        self.record("force_append_check");
        *self.state.lock() = LogState::Normal;
        *self.reads.lock() += 1;
    }

    fn append_check(&self) {
        if self.panic_on_append {
            panic!("append check exploded");
        }
        self.record("append_check");
        if *self.state.lock() == LogState::Normal {
            *self.reads.lock() += 1;
        }
    }

    fn begin_rotate(&self) {
        self.record("begin_rotate");
        let mut state = self.state.lock();
        if *state != LogState::Reset {
            *state = LogState::Normal;
        }
    }

    fn reset(&self) {
        self.record("reset");
        *self.state.lock() = LogState::Reset;
    }

    fn watch_lost(&self) {
        self.record("watch_lost");
        let mut state = self.state.lock();
        if *state != LogState::Reset {
            *state = LogState::Unwatched;
        }
    }

    fn state(&self) -> LogState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temp_log_file_creation() {
        let temp_file = TempLogFile::new().unwrap();
        assert!(temp_file.path().exists());
    }

    #[tokio::test]
    async fn test_append_content() {
        let temp_file = TempLogFile::new().unwrap();
        temp_file.append_content("line 1").unwrap();
        temp_file.append_raw("line 2").unwrap();

        let content = fs::read_to_string(temp_file.path()).unwrap();
        assert_eq!(content, "line 1\nline 2");
    }

    #[tokio::test]
    async fn test_rotate_leaves_archive_and_empty_file() {
        let temp_file = TempLogFile::with_content("initial content").unwrap();
        let archived = temp_file.rotate().unwrap();

        assert_eq!(fs::read_to_string(&archived).unwrap(), "initial content\n");
        assert!(fs::read_to_string(temp_file.path()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate() {
        let temp_file = TempLogFile::with_content("initial content").unwrap();
        temp_file.truncate().unwrap();

        let content = fs::read_to_string(temp_file.path()).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_mock_backend_scripted_failure() {
        let mut backend = MockBackend::new();
        backend.fail_add_for("/var/log");

        assert!(backend.add_watch(Path::new("/var/log"), WatchMask::Created).is_err());
        let descriptor = backend
            .add_watch(Path::new("/var/log/a.log"), WatchMask::Modified)
            .unwrap();
        assert!(backend.remove_watch(descriptor).is_ok());
        assert!(backend.remove_watch(descriptor).is_err());
    }
}
