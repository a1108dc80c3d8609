use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use searchstack::cli::{
    create_cluster, default_collaborators, exit_code, format_identity, format_instances,
    format_run_report, format_stopped, format_termination, list_instances, stop_instance,
    terminate_instances, whoami, Cli, CommandResult, Commands,
};
use searchstack::cloud::AwsCli;
use searchstack::cluster::RunOptions;
use searchstack::config::{load_env_file, region_from_lookup, Settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match load_env_file(cli.env_file.as_deref()) {
        Ok(Some(path)) => info!("Loaded environment from {}", path.display()),
        Ok(None) => {}
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let code = match dispatch(cli.command, cancel).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            1
        }
    };
    process::exit(code);
}

async fn dispatch(command: Commands, cancel: CancellationToken) -> CommandResult<i32> {
    let region_only = || AwsCli::new(region_from_lookup(|key| std::env::var(key).ok()));

    match command {
        Commands::Whoami => {
            let identity = whoami(&region_only()).await?;
            print!("{}", format_identity(&identity));
            Ok(0)
        }
        Commands::ListInstances => {
            let nodes = list_instances(&region_only()).await?;
            print!("{}", format_instances(&nodes));
            Ok(0)
        }
        Commands::TerminateInstances(args) => {
            let summary = terminate_instances(&region_only(), args.yes).await?;
            print!("{}", format_termination(&summary));
            Ok(if summary.failed.is_empty() { 0 } else { 1 })
        }
        Commands::StopInstance(args) => {
            let state = stop_instance(&region_only(), &args.id).await?;
            print!("{}", format_stopped(&args.id, state));
            Ok(0)
        }
        Commands::CreateCluster(args) => {
            let settings = Settings::from_env()?;
            let collaborators = default_collaborators(&settings, cancel.clone());
            let options = RunOptions {
                skip_provision: args.skip_provision,
                dry_run: args.dry_run,
            };
            let report = create_cluster(settings, collaborators, options, cancel).await?;
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => error!("Failed to serialize report: {}", e),
                }
            } else {
                print!("{}", format_run_report(&report));
            }
            Ok(exit_code(report.overall()))
        }
    }
}
