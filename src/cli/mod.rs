//! CLI module for searchstack
//!
//! Subcommands:
//! - `searchstack create-cluster` - Provision the stack and bring the cluster up
//! - `searchstack list-instances` - Show running and stopped instances
//! - `searchstack terminate-instances` - Terminate every running instance
//! - `searchstack stop-instance` - Stop one instance and report its state
//! - `searchstack whoami` - Show the identity behind the ambient credentials

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "searchstack")]
#[command(about = "Provision and launch multi-node OpenSearch clusters")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file (default: ./.env when present)
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision the stack, then configure and launch every node
    CreateCluster(CreateClusterArgs),

    /// Terminate every running instance in the region
    TerminateInstances(TerminateArgs),

    /// Stop one instance and show its state afterwards
    StopInstance(StopArgs),

    /// List running and stopped instances
    ListInstances,

    /// Validate credentials and show the caller identity
    Whoami,
}

/// Arguments for the create-cluster command
#[derive(Parser, Debug, Default)]
pub struct CreateClusterArgs {
    /// Use the instances that already exist instead of recreating the stack
    #[arg(long)]
    pub skip_provision: bool,

    /// Render the configuration and print it without delivering anything
    #[arg(long)]
    pub dry_run: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the terminate-instances command
#[derive(Parser, Debug)]
pub struct TerminateArgs {
    /// Actually terminate; without it the targets are only listed
    #[arg(long)]
    pub yes: bool,
}

/// Arguments for the stop-instance command
#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Instance id, e.g. i-0123456789abcdef0
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_cluster_flags() {
        let cli = Cli::parse_from([
            "searchstack",
            "-vv",
            "create-cluster",
            "--skip-provision",
            "--dry-run",
        ]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::CreateCluster(args) => {
                assert!(args.skip_provision);
                assert!(args.dry_run);
                assert!(!args.json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_env_file_is_global() {
        let cli = Cli::parse_from(["searchstack", "whoami", "--env-file", "prod.env"]);
        assert_eq!(cli.env_file, Some(PathBuf::from("prod.env")));
        assert!(matches!(cli.command, Commands::Whoami));
    }

    #[test]
    fn test_terminate_requires_confirmation_flag() {
        let cli = Cli::parse_from(["searchstack", "terminate-instances"]);
        assert!(matches!(cli.command, Commands::TerminateInstances(TerminateArgs { yes: false })));
    }

    #[test]
    fn test_parse_stop_instance() {
        let cli = Cli::parse_from(["searchstack", "stop-instance", "i-0abc"]);
        match cli.command {
            Commands::StopInstance(args) => assert_eq!(args.id, "i-0abc"),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["searchstack", "stop-instance"]).is_err());
    }

    #[test]
    fn test_unknown_subcommand_rejected() {
        assert!(Cli::try_parse_from(["searchstack", "serve"]).is_err());
    }
}
