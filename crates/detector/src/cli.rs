use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "detector", version, about = "Runtime security policy detector")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Policy file or directory (overrides config file setting)
    #[arg(short, long)]
    pub policies: Option<PathBuf>,

    /// Log filter, e.g. `debug` (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile every policy and report the ones that fail
    Check,

    /// Evaluate JSON-lines events and print alerts as JSON lines
    Evaluate {
        /// Events file; reads stdin when omitted
        #[arg(short, long)]
        events: Option<PathBuf>,
    },

    /// Reprocess deployment risk through the admission-controlled pipeline
    Reprocess {
        /// JSON-lines file of deployments to load into the store
        #[arg(short, long)]
        deployments: PathBuf,

        /// Only reprocess deployments of this cluster
        #[arg(long)]
        cluster: Option<String>,

        /// Maximum concurrent reprocessing (overrides config file setting)
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Seconds to wait for a slot; 0 waits forever (overrides config file setting)
        #[arg(long)]
        wait_secs: Option<u64>,

        /// Worker count (overrides config file setting)
        #[arg(long)]
        workers: Option<usize>,
    },
}
