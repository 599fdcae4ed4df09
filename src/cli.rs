use clap::{Args, Parser, Subcommand};

use crate::config::Overrides;

/// diffsweep: concurrent multi-dimension review of code changes
#[derive(Parser, Debug, Clone)]
#[command(name = "diffsweep", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Path to config file (default: diffsweep.toml if present)
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Review a diff and print the report as JSON
    Review(ReviewArgs),

    /// Find the diff line a code snippet refers to
    Resolve {
        /// Unified diff file
        #[arg(long)]
        diff: String,

        /// File within the diff
        #[arg(long)]
        file: String,

        /// Code snippet to locate
        #[arg(long)]
        snippet: String,

        /// Only accept exact or whitespace-normalized matches
        #[arg(long)]
        exact: bool,

        /// Do not rank added lines above context lines
        #[arg(long)]
        no_prefer_added: bool,
    },

    /// Print the fingerprint of a diff
    Fingerprint {
        /// Unified diff file (`-` for stdin)
        #[arg(long)]
        diff: String,
    },

    /// Run a command through the worker pool
    Exec {
        /// Number of worker slots
        #[arg(long)]
        workers: Option<usize>,

        /// Job timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Working directory for the command
        #[arg(long)]
        dir: Option<String>,

        /// Command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ReviewArgs {
    /// Unified diff file (`-` for stdin)
    #[arg(long)]
    pub diff: String,

    /// Identifier of the change, used to key incremental state
    #[arg(long, default_value = "default")]
    pub change_id: String,

    /// Ignore prior state and review everything
    #[arg(long)]
    pub full: bool,

    /// Old path for a diff without file headers
    #[arg(long, requires = "new_path")]
    pub old_path: Option<String>,

    /// New path for a diff without file headers
    #[arg(long, requires = "old_path")]
    pub new_path: Option<String>,

    /// Maximum concurrently running analysis tasks
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// State directory override
    #[arg(long)]
    pub state_dir: Option<String>,

    /// Also write published findings as JSON lines to this file
    #[arg(long)]
    pub publish: Option<String>,
}

impl Cli {
    /// Config values set on the command line.
    pub fn overrides(&self) -> Overrides {
        match &self.command {
            CliCommand::Review(args) => Overrides {
                max_concurrency: args.max_concurrency,
                state_dir: args.state_dir.clone(),
                ..Default::default()
            },
            CliCommand::Exec {
                workers, timeout, ..
            } => Overrides {
                workers: *workers,
                job_timeout_secs: *timeout,
                ..Default::default()
            },
            CliCommand::Resolve { .. } | CliCommand::Fingerprint { .. } => Overrides::default(),
        }
    }
}
