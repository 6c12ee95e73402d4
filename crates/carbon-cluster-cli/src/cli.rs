use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cluster-node",
    about = "Carbon cluster node launcher",
    version = env!("CARGO_PKG_VERSION"),
    long_about = "Starts a Carbon cluster member from a topology file, validates topology files, and sends cluster messages."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Cluster topology file
    #[arg(short, long, value_name = "FILE", default_value = "cluster.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Suppress output
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Join the cluster and stay a member until Ctrl-C
    Run {
        /// Print the member list every N seconds
        #[arg(long, value_name = "SECS")]
        status_interval: Option<u64>,
    },

    /// Validate the topology file and print the effective settings
    Check,

    /// Join the cluster, send one message and leave
    Send {
        /// Message topic
        #[arg(short, long)]
        topic: String,

        /// JSON payload
        #[arg(short, long, default_value = "null")]
        payload: String,

        /// Seconds to wait for member discovery before sending
        #[arg(short, long, default_value = "3")]
        wait: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_command() {
        let cli = Cli::try_parse_from([
            "cluster-node",
            "--config",
            "node1.toml",
            "send",
            "--topic",
            "cache.invalidate",
            "--payload",
            "{\"cache\":\"registry\"}",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("node1.toml"));
        match cli.command {
            Commands::Send {
                topic,
                payload,
                wait,
            } => {
                assert_eq!(topic, "cache.invalidate");
                assert!(payload.contains("registry"));
                assert_eq!(wait, 3);
            }
            _ => panic!("expected send command"),
        }
    }

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["cluster-node", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("cluster.toml"));
        assert!(matches!(cli.command, Commands::Check));
    }
}
