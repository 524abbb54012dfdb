//! Downstream line sink contract.

use std::sync::Arc;
use tokio::sync::mpsc;

/// The empty line reserved as the rotation boundary marker.
///
/// Everything a sink receives after it belongs to a new instance of the file.
pub const ROTATION_SENTINEL: &str = "";

/// Returns true when `line` is the rotation boundary marker rather than log content.
pub fn is_rotation_sentinel(line: &str) -> bool {
    line == ROTATION_SENTINEL
}

/// Receives the lines pulled out of a tracked file.
pub trait LineSink: Send + Sync {
    fn process(&self, line: String);
}

impl LineSink for mpsc::UnboundedSender<String> {
    fn process(&self, line: String) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.send(line);
    }
}

impl<S: LineSink + ?Sized> LineSink for Arc<S> {
    fn process(&self, line: String) {
        (**self).process(line)
    }
}
