//! Stream implementation for following a single log file.

use crate::agent::TailAgent;
use crate::config::{AgentConfig, TailMode};
use crate::error::Result;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// A stream of the lines appended to one file.
///
/// An empty item is the rotation sentinel: everything after it comes from a
/// new instance of the file. Dropping the stream stops following the file.
pub struct LogStream {
    receiver: mpsc::UnboundedReceiver<String>,
    agent: TailAgent,
}

impl LogStream {
    /// Follows `path` through kernel change notifications.
    pub async fn new<P: AsRef<Path>>(path: P, separator: Option<String>) -> Result<Self> {
        let config = AgentConfig {
            separator: separator.unwrap_or_else(|| "\n".to_string()),
            ..AgentConfig::default()
        };
        Self::with_config(path, config).await
    }

    /// Follows `path` according to `config`, in watch or polling mode.
    pub async fn with_config<P: AsRef<Path>>(path: P, config: AgentConfig) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = TailAgent::start(config)?;
        agent.track(path, tx)?;

        Ok(LogStream {
            receiver: rx,
            agent,
        })
    }

    /// Follows `path` by polling it every `interval`.
    pub async fn polling<P: AsRef<Path>>(path: P, interval: std::time::Duration) -> Result<Self> {
        let config = AgentConfig {
            mode: TailMode::Poll,
            poll_interval: interval,
            ..AgentConfig::default()
        };
        Self::with_config(path, config).await
    }

    pub fn mode(&self) -> TailMode {
        self.agent.mode()
    }
}

impl Stream for LogStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}
