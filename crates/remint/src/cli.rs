use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "remint",
    about = "Retype legacy entities and re-derive their identifiers in bulk",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (defaults to ./remint.toml when present)
    #[arg(long, short = 'c', global = true, env = "REMINT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format for command results
    #[arg(long, value_enum, global = true, default_value_t = OutputFormat::Plain)]
    pub format: OutputFormat,

    /// Log level (overrides config and REMINT_LOG_LEVEL)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the migration
    Up,

    /// Reverse the migration (no-op: retyping is one-way)
    Down,

    /// Scan and derive without writing; print what `up` would do
    Plan,

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text
    Plain,
    /// A single JSON document on stdout
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["remint", "plan", "--format", "json", "--log-level", "debug"])
            .unwrap();
        assert_eq!(cli.command, Commands::Plan);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["remint"]).is_err());
    }
}
