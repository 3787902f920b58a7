use std::{path::PathBuf, time::Duration};

use crate::cli::Cli;

/// Runtime knobs shared by the HTTP surface and every session.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Longest a session may go without a pong before its read side fails.
    pub pong_wait: Duration,
    /// Upper bound on a single transport write, pings included.
    pub write_wait: Duration,
    /// Largest inbound message accepted, in bytes.
    pub max_message_size: usize,
    /// Capacity of each session's outbound queue. A full queue gets the
    /// session evicted.
    pub queue_capacity: usize,
    /// Landing page served at `/`. `None` serves the bundled page.
    pub home: Option<PathBuf>,
}

impl RelayConfig {
    /// Keepalive period, kept strictly below the pong deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_message_size: 512,
            queue_capacity: 256,
            home: None,
        }
    }
}

impl From<&Cli> for RelayConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            pong_wait: Duration::from_secs(cli.pong_wait_secs),
            write_wait: Duration::from_secs(cli.write_wait_secs),
            max_message_size: cli.max_message_size,
            // Tokio's bounded channels reject a zero capacity.
            queue_capacity: cli.queue_capacity.max(1),
            home: cli.home.clone(),
        }
    }
}
