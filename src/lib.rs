//! Filesystem-watch front end of a log-shipping agent.
//!
//! Tracks log files on a host, notices appends and rotations, and forwards
//! their content line by line to a downstream [`LineSink`]. A rotation is
//! marked in the line stream by a single empty line, the
//! [`ROTATION_SENTINEL`].
//!
//! Two ways of following a file produce the same stream:
//!
//! * [`FileWatchCoordinator`] consumes kernel change notifications through a
//!   [`WatchBackend`], and drives one [`LogStateMachine`] per file.
//! * [`PollingTailer`] checks a file on a fixed interval, for filesystems
//!   where change notification is unavailable.
//!
//! # Example
//!
//! ```rust,no_run
//! use log_tail_agent::{is_rotation_sentinel, watch_log};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut stream = watch_log("/var/log/app.log", None).await?;
//!
//!     while let Some(line) = stream.next().await {
//!         if is_rotation_sentinel(&line) {
//!             println!("-- rotated --");
//!         } else {
//!             println!("{}", line);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

mod agent;
mod config;
mod coordinator;
mod error;
mod fsm;
mod logging;
mod poller;
mod reader;
mod sink;
mod stream;
mod table;
mod watcher;

#[cfg(test)]
mod test_helpers;

pub use agent::TailAgent;
pub use config::{AgentConfig, TailMode};
pub use coordinator::{CoordinatorConfig, FileWatchCoordinator, Registration};
pub use error::{Error, Result};
pub use fsm::{LogFileStateMachine, LogState, LogStateMachine};
pub use logging::init_logging;
pub use poller::{PollConfig, PollHandle, PollOutcome, PollingTailer};
pub use sink::{LineSink, ROTATION_SENTINEL, is_rotation_sentinel};
pub use stream::LogStream;
pub use table::{WatchDescriptor, WatchDescriptorTable};
pub use watcher::{NotifyBackend, WatchBackend, WatchEvent, WatchMask};

use std::path::Path;

/// Creates a stream of the lines appended to `path`.
///
/// # Arguments
///
/// * `path` - File path to monitor; the file must exist
/// * `separator` - Content separator (defaults to newline)
pub async fn watch_log<P: AsRef<Path>>(path: P, separator: Option<String>) -> Result<LogStream> {
    LogStream::new(path, separator).await
}
