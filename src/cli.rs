//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// deferq - durable delayed-task queue
#[derive(Parser, Debug)]
#[command(name = "deferq")]
#[command(version)]
#[command(about = "Inspect, repair, and feed durable delayed-task queues")]
#[command(
    long_about = "deferq works on the pending and expired files of a persistent queue: list what is waiting, recover an interrupted save, add tasks, or run a worker that logs deliveries."
)]
pub struct Cli {
    /// Queue configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Pending-task file; overrides the configuration
    #[arg(short, long, global = true)]
    pub file: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List tasks ordered by due time
    Inspect {
        /// Read the expired file instead of the pending file
        #[arg(short, long, default_value_t = false)]
        expired: bool,

        /// Print JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show pending and expired counts
    Stats {
        /// Print JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Finish or roll back an interrupted save of both files
    Recover,

    /// Add a task to the pending file
    ///
    /// Only safe while no queue process has the file open.
    Enqueue {
        /// Routing key selecting the handler
        #[arg(short, long)]
        key: String,

        /// Payload, stored as UTF-8 bytes
        #[arg(short, long)]
        payload: Option<String>,

        /// Seconds until the task is due
        #[arg(short, long, default_value_t = 0)]
        delay_secs: u64,

        /// Task id; generated when omitted
        #[arg(long)]
        id: Option<String>,
    },

    /// Open the queue and log every task delivered to the given patterns
    Run {
        /// Routing-key pattern to handle (repeatable)
        #[arg(short, long = "handle", required = true)]
        patterns: Vec<String>,
    },
}
