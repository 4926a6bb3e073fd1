use crate::diagnostics::ConsoleFormat;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// move-clippy-incremental CLI options.
#[derive(Debug, Parser)]
#[command(
    name = "move-clippy-incremental",
    version,
    about = "Incremental rule-set analysis for Move projects"
)]
pub struct Args {
    /// Workspace configuration file. Searched upward from the current
    /// directory when absent.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one full build per project and print the diagnostics.
    Check(CheckArgs),

    /// Keep projects enabled and re-analyze files as they change.
    Watch(WatchArgs),

    /// List the rules of a rule-set document.
    ListRules {
        /// Rule-set TOML file.
        ruleset: PathBuf,
    },
}

#[derive(Debug, Clone, ClapArgs)]
pub struct CheckArgs {
    /// Projects to check. Defaults to the projects enabled in the config.
    #[arg(long = "project", value_name = "NAME")]
    pub projects: Vec<String>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub format: OutputFormat,

    /// Exit with code 1 if any diagnostics are emitted.
    #[arg(long)]
    pub deny_warnings: bool,
}

#[derive(Debug, Clone, ClapArgs)]
pub struct WatchArgs {
    /// Projects to watch. Defaults to the projects enabled in the config.
    #[arg(long = "project", value_name = "NAME")]
    pub projects: Vec<String>,

    /// Output format for diagnostic events.
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

impl From<OutputFormat> for ConsoleFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Pretty => ConsoleFormat::Pretty,
            OutputFormat::Json => ConsoleFormat::Json,
        }
    }
}
