//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand};

/// treeway - binary-tree overlay for distributed workers
///
/// Joins a fixed set of ranks into an implicit binary tree and relays
/// broadcasts from the root down and acknowledgements back up.
#[derive(Parser, Debug)]
#[command(name = "treeway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the tree as one rank and relay rounds until Ctrl+C
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "TREEWAY_CONFIG")]
        config: Option<String>,

        /// Override the configured rank
        #[arg(long)]
        rank: Option<usize>,

        /// Stop after this many rounds (0 = run until Ctrl+C)
        #[arg(long, default_value = "0")]
        rounds: u32,

        /// Delay between root broadcasts in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Body size of each root broadcast
        #[arg(long, default_value = "4096")]
        payload_bytes: usize,
    },

    /// Run an in-process cluster and check every rank receives every round
    Simulate {
        /// Number of ranks
        #[arg(short, long, default_value = "7")]
        nodes: usize,

        /// Broadcast rounds to run
        #[arg(short, long, default_value = "3")]
        rounds: u32,

        /// Body size of each broadcast
        #[arg(long, default_value = "4096")]
        payload_bytes: usize,

        /// Per-round timeout in seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the tree for a given number of ranks
    Topology {
        /// Number of ranks
        #[arg(short, long)]
        nodes: usize,

        /// Show only this rank's parent and children
        #[arg(long)]
        rank: Option<usize>,
    },

    /// Display version and build information
    Version {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["treeway", "run"]);
        match cli.command {
            Commands::Run {
                config,
                rank,
                rounds,
                interval_ms,
                payload_bytes,
            } => {
                assert!(config.is_none());
                assert!(rank.is_none());
                assert_eq!(rounds, 0);
                assert_eq!(interval_ms, 1000);
                assert_eq!(payload_bytes, 4096);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_options() {
        let cli = Cli::parse_from([
            "treeway",
            "run",
            "--config",
            "/path/to/treeway.toml",
            "--rank",
            "3",
            "--rounds",
            "5",
        ]);
        match cli.command {
            Commands::Run {
                config, rank, rounds, ..
            } => {
                assert_eq!(config, Some("/path/to/treeway.toml".to_string()));
                assert_eq!(rank, Some(3));
                assert_eq!(rounds, 5);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::parse_from(["treeway", "simulate"]);
        match cli.command {
            Commands::Simulate {
                nodes,
                rounds,
                payload_bytes,
                timeout_secs,
                json,
            } => {
                assert_eq!(nodes, 7);
                assert_eq!(rounds, 3);
                assert_eq!(payload_bytes, 4096);
                assert_eq!(timeout_secs, 10);
                assert!(!json);
            }
            _ => panic!("Expected Simulate command"),
        }
    }

    #[test]
    fn test_topology_requires_nodes() {
        assert!(Cli::try_parse_from(["treeway", "topology"]).is_err());

        let cli = Cli::parse_from(["treeway", "topology", "--nodes", "5", "--rank", "1"]);
        match cli.command {
            Commands::Topology { nodes, rank } => {
                assert_eq!(nodes, 5);
                assert_eq!(rank, Some(1));
            }
            _ => panic!("Expected Topology command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["treeway", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["treeway", "--quiet", "version"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["treeway", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
