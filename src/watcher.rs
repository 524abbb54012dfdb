//! File watching backend built on the notify crate.

use crate::error::{Error, Result};
use crate::table::WatchDescriptor;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Which changes a watch reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMask {
    /// New entries appearing in a directory.
    Created,
    /// Content modification of a file.
    Modified,
}

/// A typed change notification delivered by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created { parent: PathBuf, name: OsString },
    Modified { path: PathBuf },
    Deleted { path: PathBuf },
    Renamed {
        parent: PathBuf,
        old_name: OsString,
        new_name: OsString,
    },
}

/// The native change-notification capability the coordinator consumes.
///
/// Watches are never recursive. Events are delivered out of band, on a
/// single serialized channel handed out when the backend is built.
pub trait WatchBackend: Send {
    fn add_watch(&mut self, path: &Path, mask: WatchMask) -> Result<WatchDescriptor>;
    fn remove_watch(&mut self, descriptor: WatchDescriptor) -> Result<()>;
}

type MaskRegistry = Arc<Mutex<HashMap<PathBuf, WatchMask>>>;

/// [`WatchBackend`] over the platform's recommended notify watcher.
pub struct NotifyBackend {
    watcher: RecommendedWatcher,
    masks: MaskRegistry,
    descriptors: HashMap<WatchDescriptor, PathBuf>,
    next_descriptor: u64,
}

impl NotifyBackend {
    /// Creates the backend and the receiving end of its event channel.
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let masks: MaskRegistry = Arc::default();
        let handler_masks = Arc::clone(&masks);

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let translated = {
                        let masks = handler_masks.lock();
                        translate_event(&event, &masks)
                    };
                    for watch_event in translated {
                        let _ = tx.send(watch_event);
                    }
                }
                Err(e) => warn!(error = %e, "watch backend reported an error"),
            },
            Config::default(),
        )?;

        Ok((
            Self {
                watcher,
                masks,
                descriptors: HashMap::new(),
                next_descriptor: 1,
            },
            rx,
        ))
    }
}

impl WatchBackend for NotifyBackend {
    fn add_watch(&mut self, path: &Path, mask: WatchMask) -> Result<WatchDescriptor> {
        // The registry lock must not be held across watch(): the notify thread
        // takes it from the event handler while watch() waits on that thread.
        self.masks.lock().insert(path.to_path_buf(), mask);
        if let Err(e) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            self.masks.lock().remove(path);
            return Err(e.into());
        }

        let descriptor = WatchDescriptor::new(self.next_descriptor);
        self.next_descriptor += 1;
        self.descriptors.insert(descriptor, path.to_path_buf());
        debug!(path = %path.display(), ?mask, %descriptor, "watch added");
        Ok(descriptor)
    }

    fn remove_watch(&mut self, descriptor: WatchDescriptor) -> Result<()> {
        let path = self
            .descriptors
            .remove(&descriptor)
            .ok_or(Error::UnknownDescriptor { descriptor })?;
        self.masks.lock().remove(&path);
        self.watcher.unwatch(&path)?;
        debug!(path = %path.display(), %descriptor, "watch removed");
        Ok(())
    }
}

/// Translate a raw notify event into the events the registered masks ask for.
pub(crate) fn translate_event(
    event: &Event,
    masks: &HashMap<PathBuf, WatchMask>,
) -> Vec<WatchEvent> {
    let watches_creation = |dir: &Path| masks.get(dir) == Some(&WatchMask::Created);
    let watches_content = |file: &Path| masks.get(file) == Some(&WatchMask::Modified);

    match &event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(PathBuf::as_path)
            .filter_map(split_entry)
            .filter(|(parent, _)| watches_creation(parent))
            .map(|(parent, name)| WatchEvent::Created {
                parent: parent.to_path_buf(),
                name,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => match (split_entry(from), split_entry(to)) {
                (Some((parent, old_name)), Some((_, new_name))) if watches_creation(parent) => {
                    vec![WatchEvent::Renamed {
                        parent: parent.to_path_buf(),
                        old_name,
                        new_name,
                    }]
                }
                _ => Vec::new(),
            },
            _ => Vec::new(),
        },
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(PathBuf::as_path)
            .filter_map(split_entry)
            .filter(|(parent, _)| watches_creation(parent))
            .map(|(parent, name)| WatchEvent::Renamed {
                parent: parent.to_path_buf(),
                old_name: name.clone(),
                new_name: name,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => event
            .paths
            .iter()
            .filter(|path| watches_content(path))
            .map(|path| WatchEvent::Modified { path: path.clone() })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter(|path| {
                watches_content(path) || path.parent().is_some_and(|dir| watches_creation(dir))
            })
            .map(|path| WatchEvent::Deleted { path: path.clone() })
            .collect(),
        _ => Vec::new(),
    }
}

fn split_entry(path: &Path) -> Option<(&Path, OsString)> {
    let parent = path.parent()?;
    let name = path.file_name()?;
    Some((parent, name.to_os_string()))
}
