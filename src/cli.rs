use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ontap-converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge NetApp ONTAP resources to a declared state", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Converge one resource described by a parameter file
    Run(RunArgs),

    /// Converge every task of a playbook
    Apply(ApplyArgs),

    /// Connect to a cluster and report its version and capabilities
    Probe(ProbeArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
pub struct RunArgs {
    /// Parameter file (JSON or TOML), or - for JSON on stdin
    pub file: PathBuf,

    /// Read and diff only; make no changes
    #[arg(long)]
    pub check: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Parser)]
pub struct ApplyArgs {
    /// Playbook file (JSON or TOML) with `defaults` and `tasks`
    pub playbook: PathBuf,

    /// Only run matching tasks: kind or kind.name (e.g. volume.vol1)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Read and diff only; make no changes
    #[arg(long)]
    pub check: bool,

    /// Number of tasks run in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,

    /// Cancel the remaining tasks after the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Parser)]
pub struct ProbeArgs {
    /// Parameter file holding the connection settings
    pub file: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}
