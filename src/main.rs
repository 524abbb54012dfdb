use clap::Parser;
use log_tail_agent::{
    AgentConfig, LineSink, TailAgent, TailMode, init_logging, is_rotation_sentinel,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{error, info};

/// Follow log files through appends and rotations and print their lines.
#[derive(Parser, Debug)]
#[command(name = "log-tail-agent", version, about)]
struct Cli {
    /// Files to follow
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Poll files instead of using filesystem notifications
    #[arg(long)]
    poll: bool,

    /// Polling interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Release a directory watch when its last tracked file is untracked
    #[arg(long)]
    release_idle_parents: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_filter: String,
}

impl Cli {
    fn config(&self) -> AgentConfig {
        AgentConfig {
            mode: if self.poll { TailMode::Poll } else { TailMode::Watch },
            poll_interval: Duration::from_millis(self.interval_ms),
            release_idle_parent_watches: self.release_idle_parents,
            log_filter: self.log_filter.clone(),
            ..AgentConfig::default()
        }
    }
}

/// Prints lines to stdout, prefixed by their file when following several.
struct StdoutSink {
    path: PathBuf,
    prefixed: bool,
}

impl LineSink for StdoutSink {
    fn process(&self, line: String) {
        if is_rotation_sentinel(&line) {
            info!(path = %self.path.display(), "rotated");
        } else if self.prefixed {
            println!("{}: {}", self.path.display(), line);
        } else {
            println!("{}", line);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.config();

    if let Err(e) = init_logging(&config.log_filter) {
        eprintln!("Error setting up logging: {}", e);
        process::exit(1);
    }

    let agent = match TailAgent::start(config) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "failed to start tail agent");
            process::exit(1);
        }
    };

    let prefixed = cli.paths.len() > 1;
    for path in &cli.paths {
        let sink = StdoutSink {
            path: path.clone(),
            prefixed,
        };
        if let Err(e) = agent.track(path, sink) {
            error!(path = %path.display(), error = %e, "failed to track file");
            process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to wait for shutdown signal");
    }
    info!("shutting down");
    drop(agent);
}
