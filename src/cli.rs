//! CLI argument parsing for ae-pipeline

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ae-pipeline")]
#[command(author, version, about = "Relay pipeline for autonomous beamline experiments", long_about = None)]
pub struct Cli {
    /// Path to config file (default: config/ae_pipeline.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the message channel and feedback store
    Broker {
        /// Listen address, overriding broker.address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run the analysis relay
    Analysis,

    /// Run the adaptive relay
    Adaptive,

    /// Run an adaptive plan against the simulated detector
    Scan {
        /// Fixed run id (default: a fresh UUID)
        #[arg(long)]
        run_id: Option<String>,

        /// Upper bound on batches, overriding control.max_batches
        #[arg(short = 'n', long)]
        max_batches: Option<u32>,
    },

    /// Log every message on matching topics
    Echo {
        /// Topic name, or a prefix ending in `*`
        #[arg(default_value = "*")]
        pattern: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan() {
        let cli = Cli::parse_from(["ae-pipeline", "--config", "exp.toml", "scan", "-n", "5"]);
        assert_eq!(cli.config, Some(PathBuf::from("exp.toml")));
        assert!(matches!(
            cli.command,
            Command::Scan {
                run_id: None,
                max_batches: Some(5)
            }
        ));
    }

    #[test]
    fn test_echo_defaults_to_everything() {
        let cli = Cli::parse_from(["ae-pipeline", "echo"]);
        assert!(matches!(cli.command, Command::Echo { ref pattern } if pattern == "*"));
    }

    #[test]
    fn test_command_required() {
        assert!(Cli::try_parse_from(["ae-pipeline"]).is_err());
    }
}
