use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "perpctl")]
#[command(version)]
#[command(about = "Risk-gated trading control plane for crypto perpetuals", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator until interrupted
    Run {
        /// Directory holding default.toml and environment overrides
        #[arg(long, default_value = "config", env = "PERPCTL_CONFIG_DIR")]
        config_dir: PathBuf,
        /// Force the paper connector regardless of configuration
        #[arg(long)]
        paper: bool,
        /// JSON-lines signal file; reads stdin when omitted
        #[arg(long)]
        signals: Option<PathBuf>,
    },
    /// Validate configuration and print any problems
    CheckConfig {
        #[arg(long, default_value = "config", env = "PERPCTL_CONFIG_DIR")]
        config_dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["perpctl", "run", "--paper", "--signals", "feed.jsonl"]);
        match cli.command {
            Commands::Run {
                paper, signals, config_dir,
            } => {
                assert!(paper);
                assert_eq!(signals, Some(PathBuf::from("feed.jsonl")));
                assert_eq!(config_dir, PathBuf::from("config"));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_check_config() {
        let cli = Cli::parse_from(["perpctl", "check-config", "--config-dir", "/etc/perpctl"]);
        assert!(matches!(cli.command, Commands::CheckConfig { .. }));
    }
}
