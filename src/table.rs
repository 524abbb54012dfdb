//! Bidirectional record of live backend watches.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque handle returned by a [`WatchBackend`](crate::WatchBackend) for one active watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchDescriptor(u64);

impl WatchDescriptor {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for WatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd#{}", self.0)
    }
}

/// Maps watched paths (files and directories) to their backend descriptors and back.
///
/// A path is present if and only if a live backend watch exists for it. The
/// table carries no lock of its own: it lives inside the coordinator's
/// exclusivity guard, which makes single operations and compound
/// add/remove sequences atomic together.
#[derive(Debug, Default)]
pub struct WatchDescriptorTable {
    by_path: HashMap<PathBuf, WatchDescriptor>,
    by_descriptor: HashMap<WatchDescriptor, PathBuf>,
}

impl WatchDescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `descriptor` for `path`, returning the descriptor it replaced.
    pub fn put(
        &mut self,
        path: impl Into<PathBuf>,
        descriptor: WatchDescriptor,
    ) -> Option<WatchDescriptor> {
        let path = path.into();
        let previous = self.by_path.insert(path.clone(), descriptor);
        if let Some(stale) = previous {
            self.by_descriptor.remove(&stale);
        }
        if let Some(other) = self.by_descriptor.insert(descriptor, path) {
            // descriptor moved from another path
            self.by_path.remove(&other);
        }
        previous
    }

    pub fn get(&self, path: &Path) -> Option<WatchDescriptor> {
        self.by_path.get(path).copied()
    }

    pub fn remove(&mut self, path: &Path) -> Option<WatchDescriptor> {
        let descriptor = self.by_path.remove(path)?;
        self.by_descriptor.remove(&descriptor);
        Some(descriptor)
    }

    /// Reverse lookup of the path a descriptor watches.
    #[cfg(test)]
    pub(crate) fn path_of(&self, descriptor: WatchDescriptor) -> Option<&Path> {
        self.by_descriptor.get(&descriptor).map(PathBuf::as_path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.by_path.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}
