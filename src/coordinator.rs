//! Watch registration lifecycle and rotation handling.
//!
//! The coordinator is the single exclusivity domain of the agent: the
//! descriptor table, the tracked files, the parent watches and every call
//! into the backend or a state machine happen under one lock. That is what
//! keeps a new descriptor visible in the table before the state machine
//! learns that its file rotated.

use crate::error::{Error, Result};
use crate::fsm::{LogState, LogStateMachine};
use crate::table::{WatchDescriptor, WatchDescriptorTable};
use crate::watcher::{WatchBackend, WatchEvent, WatchMask};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Tunables of the coordinator.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Release a parent directory watch once no tracked file lives under it.
    /// Off by default: directory watches are kept for the life of the process.
    pub release_idle_parent_watches: bool,
}

/// Outcome of a successful [`FileWatchCoordinator::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    AlreadyTracked,
}

struct TrackedFile {
    parent: PathBuf,
    machine: Arc<dyn LogStateMachine>,
}

struct ParentWatch {
    descriptor: WatchDescriptor,
    children: usize,
}

struct Inner<B> {
    backend: B,
    table: WatchDescriptorTable,
    files: HashMap<PathBuf, TrackedFile>,
    parents: HashMap<PathBuf, ParentWatch>,
}

/// Correlates backend notifications with tracked files and drives their state machines.
pub struct FileWatchCoordinator<B> {
    config: CoordinatorConfig,
    inner: Mutex<Inner<B>>,
}

impl<B: WatchBackend> FileWatchCoordinator<B> {
    pub fn new(backend: B, config: CoordinatorConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                backend,
                table: WatchDescriptorTable::new(),
                files: HashMap::new(),
                parents: HashMap::new(),
            }),
        }
    }

    /// Starts tracking `path`, watching it and its parent directory.
    ///
    /// Registering a path that is already watched is a no-op. A path whose
    /// watch was lost during a rotation is re-armed with `machine`.
    pub fn register(
        &self,
        path: impl AsRef<Path>,
        machine: Arc<dyn LogStateMachine>,
    ) -> Result<Registration> {
        let path = path.as_ref();
        let parent = parent_of(path)?;

        let mut inner = self.inner.lock();
        if inner.files.contains_key(path) {
            if inner.table.contains(path) {
                info!(path = %path.display(), "already tracked");
                return Ok(Registration::AlreadyTracked);
            }
            info!(path = %path.display(), "re-arming file whose watch was lost");
            if let Some(stale) = self.untrack(&mut inner, path) {
                stale.machine.reset();
            }
        }

        if !inner.parents.contains_key(parent) {
            let descriptor = inner.backend.add_watch(parent, WatchMask::Created).map_err(|e| {
                error!(path = %parent.display(), error = %e, "failed to watch parent directory");
                e
            })?;
            inner.table.put(parent, descriptor);
            inner.parents.insert(
                parent.to_path_buf(),
                ParentWatch {
                    descriptor,
                    children: 0,
                },
            );
            info!(path = %parent.display(), %descriptor, "watching parent directory for creations");
        } else {
            debug!(path = %parent.display(), "parent directory already watched");
        }

        // A failure here leaves the parent watch in place unless idle parents are released.
        let descriptor = match inner.backend.add_watch(path, WatchMask::Modified) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to watch file");
                self.release_parent_if_idle(&mut inner, parent);
                return Err(e);
            }
        };

        inner.table.put(path, descriptor);
        if let Some(parent_watch) = inner.parents.get_mut(parent) {
            parent_watch.children += 1;
        }
        inner.files.insert(
            path.to_path_buf(),
            TrackedFile {
                parent: parent.to_path_buf(),
                machine: Arc::clone(&machine),
            },
        );
        machine.force_append_check();

        info!(path = %path.display(), %descriptor, "watching file for modifications");
        Ok(Registration::Registered)
    }

    /// Stops tracking `path`. Unknown paths are ignored.
    pub fn unregister(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut inner = self.inner.lock();

        let Some(descriptor) = inner.table.remove(path) else {
            match self.untrack(&mut inner, path) {
                Some(tracked) => {
                    tracked.machine.reset();
                    info!(path = %path.display(), "unregistered unwatched file");
                }
                None => debug!(path = %path.display(), "unregister of untracked path"),
            }
            return;
        };

        let tracked = inner.files.get(path).map(|t| Arc::clone(&t.machine));
        if let Some(machine) = tracked {
            machine.reset();
        }

        match inner.backend.remove_watch(descriptor) {
            Ok(()) => info!(path = %path.display(), %descriptor, "unregistered file"),
            Err(e) => warn!(
                path = %path.display(),
                %descriptor,
                error = %e,
                "failed to remove watch, descriptor may already be invalid"
            ),
        }

        self.untrack(&mut inner, path);
    }

    /// A new entry appeared under a watched directory; re-watch it if it is a tracked file.
    pub fn on_file_created(&self, parent: &Path, name: &OsStr) {
        let candidate = parent.join(name);
        let mut inner = self.inner.lock();

        let Some(machine) = inner.files.get(&candidate).map(|t| Arc::clone(&t.machine)) else {
            debug!(path = %candidate.display(), "created file is not tracked");
            return;
        };
        info!(path = %candidate.display(), "rotation detected");

        match inner.table.remove(&candidate) {
            Some(old) => {
                if let Err(e) = inner.backend.remove_watch(old) {
                    warn!(
                        path = %candidate.display(),
                        descriptor = %old,
                        error = %e,
                        "failed to remove old watch"
                    );
                }
            }
            None => error!(
                path = %candidate.display(),
                "no watch descriptor recorded for rotated file"
            ),
        }

        match inner.backend.add_watch(&candidate, WatchMask::Modified) {
            Ok(descriptor) => {
                // The table must show the new descriptor before the machine rotates.
                inner.table.put(&candidate, descriptor);
                machine.begin_rotate();
                info!(path = %candidate.display(), %descriptor, "re-watching rotated file");
            }
            Err(e) => {
                error!(path = %candidate.display(), error = %e, "failed to re-watch rotated file");
                machine.watch_lost();
            }
        }
    }

    pub fn on_file_modified(&self, path: &Path) {
        let inner = self.inner.lock();
        match inner.files.get(path) {
            Some(tracked) => tracked.machine.append_check(),
            None => trace!(path = %path.display(), "modification of untracked path"),
        }
    }

    /// Rotation is inferred from creations only.
    pub fn on_file_deleted(&self, path: &Path) {
        trace!(path = %path.display(), "file deleted");
    }

    /// Rotation is inferred from creations only.
    pub fn on_file_renamed(&self, parent: &Path, old_name: &OsStr, new_name: &OsStr) {
        trace!(
            path = %parent.display(),
            old_name = %old_name.to_string_lossy(),
            new_name = %new_name.to_string_lossy(),
            "file renamed"
        );
    }

    pub fn handle_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Created { parent, name } => self.on_file_created(&parent, &name),
            WatchEvent::Modified { path } => self.on_file_modified(&path),
            WatchEvent::Deleted { path } => self.on_file_deleted(&path),
            WatchEvent::Renamed {
                parent,
                old_name,
                new_name,
            } => self.on_file_renamed(&parent, &old_name, &new_name),
        }
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.inner.lock().files.contains_key(path)
    }

    pub fn descriptor_of(&self, path: &Path) -> Option<WatchDescriptor> {
        self.inner.lock().table.get(path)
    }

    pub fn has_parent_watch(&self, parent: &Path) -> bool {
        self.inner.lock().parents.contains_key(parent)
    }

    pub fn parent_watch_count(&self) -> usize {
        self.inner.lock().parents.len()
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.inner.lock().files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Tracked files that lost their watch and wait for re-registration.
    pub fn unwatched_paths(&self) -> Vec<PathBuf> {
        let inner = self.inner.lock();
        let mut paths: Vec<_> = inner
            .files
            .iter()
            .filter(|(path, tracked)| {
                !inner.table.contains(path) || tracked.machine.state() == LogState::Unwatched
            })
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Drops `path` from the tracked files and releases its claim on the parent watch.
    fn untrack(&self, inner: &mut Inner<B>, path: &Path) -> Option<TrackedFile> {
        let tracked = inner.files.remove(path)?;

        if let Some(parent_watch) = inner.parents.get_mut(&tracked.parent) {
            parent_watch.children = parent_watch.children.saturating_sub(1);
            self.release_parent_if_idle(inner, &tracked.parent);
        }
        Some(tracked)
    }

    /// Drops the watch on `parent` if no tracked file claims it and the policy allows it.
    fn release_parent_if_idle(&self, inner: &mut Inner<B>, parent: &Path) {
        if !self.config.release_idle_parent_watches {
            return;
        }
        let descriptor = match inner.parents.get(parent) {
            Some(parent_watch) if parent_watch.children == 0 => parent_watch.descriptor,
            _ => return,
        };

        inner.parents.remove(parent);
        inner.table.remove(parent);
        match inner.backend.remove_watch(descriptor) {
            Ok(()) => info!(path = %parent.display(), "released idle parent watch"),
            Err(e) => warn!(
                path = %parent.display(),
                error = %e,
                "failed to release parent watch"
            ),
        }
    }
}

impl<B: WatchBackend + 'static> FileWatchCoordinator<B> {
    /// Processes backend events on a dedicated notification thread.
    ///
    /// The thread ends when the backend's sender side or the coordinator is
    /// dropped; it does not keep the coordinator alive. A panic
    /// while handling one event is logged and the next event is processed.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
    ) -> Result<thread::JoinHandle<()>> {
        let coordinator = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("watch-events".to_string())
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    let Some(coordinator) = coordinator.upgrade() else {
                        break;
                    };
                    if catch_unwind(AssertUnwindSafe(|| coordinator.handle_event(event))).is_err() {
                        error!("panic while handling watch event");
                    }
                }
                debug!("watch event loop stopped");
            })?;
        Ok(handle)
    }
}

fn parent_of(path: &Path) -> Result<&Path> {
    if !path.is_absolute() {
        return Err(Error::InvalidPath {
            message: format!("path must be absolute: {}", path.display()),
        });
    }
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| Error::InvalidPath {
            message: format!("path has no parent directory: {}", path.display()),
        })
}
