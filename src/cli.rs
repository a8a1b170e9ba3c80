use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::DEFAULT_CONFIG_PATH;
use crate::model::Priority;

/// Relay: runs queued questions through a multi-stage model pipeline.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll the queue and process new items until interrupted.
    Watch,

    /// Run the pipeline once for a single question.
    Ask {
        question: String,

        #[arg(long)]
        category: Option<String>,

        /// Print the full outcome as JSON instead of a summary.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Check that the queue and every model stage are reachable.
    Check,

    /// Show how many queue items are in each status.
    Status,

    /// Append a pending item to the queue.
    Add {
        text: String,

        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,

        #[arg(long)]
        category: Option<String>,
    },

    /// Pick the longest successful answer per question from recorded
    /// responses. Reads a JSON-lines file or a results directory.
    Aggregate {
        input: PathBuf,

        output: PathBuf,
    },
}
