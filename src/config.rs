//! Agent configuration.

use crate::coordinator::CoordinatorConfig;
use crate::poller::PollConfig;
use std::time::Duration;

/// How tracked files are followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailMode {
    /// Kernel change notifications through the watch coordinator.
    #[default]
    Watch,
    /// Periodic polling, for filesystems without change notification.
    Poll,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub mode: TailMode,
    /// Tick of the polling dispatcher; unused in watch mode.
    pub poll_interval: Duration,
    /// Line separator of the tracked files.
    pub separator: String,
    pub release_idle_parent_watches: bool,
    /// Default tracing directive when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            mode: TailMode::default(),
            poll_interval: Duration::from_secs(1),
            separator: "\n".to_string(),
            release_idle_parent_watches: false,
            log_filter: "info".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            release_idle_parent_watches: self.release_idle_parent_watches,
        }
    }

    pub fn poll(&self) -> PollConfig {
        PollConfig {
            interval: self.poll_interval,
            separator: self.separator.clone(),
        }
    }
}
