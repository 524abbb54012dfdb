//! The tail agent: one entry point for tracking files in either mode.

use crate::config::{AgentConfig, TailMode};
use crate::coordinator::{FileWatchCoordinator, Registration};
use crate::error::{Error, Result};
use crate::fsm::LogFileStateMachine;
use crate::poller::{PollHandle, PollingTailer};
use crate::sink::LineSink;
use crate::watcher::NotifyBackend;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Tracks log files and forwards their lines to per-file sinks.
///
/// In [`TailMode::Watch`] every file gets a [`LogFileStateMachine`] driven by
/// a [`FileWatchCoordinator`] over the notify backend; in [`TailMode::Poll`]
/// every file gets its own [`PollingTailer`]. Must be used from within a
/// tokio runtime.
pub struct TailAgent {
    config: AgentConfig,
    coordinator: Option<Arc<FileWatchCoordinator<NotifyBackend>>>,
    pollers: Mutex<HashMap<PathBuf, PollHandle>>,
}

impl TailAgent {
    pub fn start(config: AgentConfig) -> Result<Self> {
        let coordinator = match config.mode {
            TailMode::Watch => {
                let (backend, events) = NotifyBackend::new()?;
                let coordinator =
                    Arc::new(FileWatchCoordinator::new(backend, config.coordinator()));
                coordinator.spawn_event_loop(events)?;
                Some(coordinator)
            }
            TailMode::Poll => None,
        };
        info!(mode = ?config.mode, "tail agent started");

        Ok(Self {
            config,
            coordinator,
            pollers: Mutex::new(HashMap::new()),
        })
    }

    /// Starts forwarding the lines of `path` to `sink`.
    pub fn track<S>(&self, path: impl AsRef<Path>, sink: S) -> Result<Registration>
    where
        S: LineSink + 'static,
    {
        let path = std::path::absolute(path.as_ref())?;

        match &self.coordinator {
            Some(coordinator) => {
                if !path.exists() {
                    return Err(Error::FileNotFound {
                        path: path.display().to_string(),
                    });
                }
                // An already tracked path drops this machine, which ends its reader.
                let (machine, _reader) =
                    LogFileStateMachine::spawn(&path, self.config.separator.clone(), sink);
                coordinator.register(&path, machine)
            }
            None => {
                let mut pollers = self.pollers.lock();
                if pollers.contains_key(&path) {
                    return Ok(Registration::AlreadyTracked);
                }
                let handle = PollingTailer::new(&path, sink, self.config.poll()).spawn();
                pollers.insert(path.clone(), handle);
                info!(
                    path = %path.display(),
                    interval = ?self.config.poll_interval,
                    "polling file"
                );
                Ok(Registration::Registered)
            }
        }
    }

    /// Stops forwarding `path`. Unknown paths are ignored.
    pub fn untrack(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = std::path::absolute(path.as_ref())?;
        match &self.coordinator {
            Some(coordinator) => coordinator.unregister(&path),
            None => {
                // dropping the handle stops the tailer
                if self.pollers.lock().remove(&path).is_some() {
                    info!(path = %path.display(), "stopped polling file");
                }
            }
        }
        Ok(())
    }

    pub fn mode(&self) -> TailMode {
        self.config.mode
    }

    /// The watch coordinator; `None` in polling mode.
    pub fn coordinator(&self) -> Option<&Arc<FileWatchCoordinator<NotifyBackend>>> {
        self.coordinator.as_ref()
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        match &self.coordinator {
            Some(coordinator) => coordinator.tracked_paths(),
            None => {
                let mut paths: Vec<_> = self.pollers.lock().keys().cloned().collect();
                paths.sort();
                paths
            }
        }
    }
}

impl Drop for TailAgent {
    fn drop(&mut self) {
        if let Some(coordinator) = &self.coordinator {
            for path in coordinator.tracked_paths() {
                coordinator.unregister(&path);
            }
        }
    }
}
