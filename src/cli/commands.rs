//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud::{
    AwsCli, CallerIdentity, CloudError, ComputeInventory, CredentialValidator, StackWaitConfig,
};
use crate::cluster::{
    ClusterOrchestrator, Collaborators, LifecycleState, NodeDescriptor, OrchestratorError,
    RunOptions, RunReport, RunStatus,
};
use crate::config::{ConfigError, Settings};
use crate::remote::{SshConnector, SshOptions};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Process exit code for a finished run
pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => 0,
        RunStatus::Failed => 1,
        RunStatus::Partial => 2,
    }
}

/// `aws` CLI collaborator configured from settings
pub fn aws_cli(settings: &Settings, cancel: CancellationToken) -> AwsCli {
    AwsCli::new(&settings.region)
        .with_wait_config(StackWaitConfig {
            poll_interval: settings.stack_poll_interval,
            timeout: settings.stack_wait_timeout,
        })
        .with_cancellation(cancel)
}

/// Production collaborators: `aws` for the cloud side, `ssh` for the nodes
pub fn default_collaborators(settings: &Settings, cancel: CancellationToken) -> Collaborators {
    let aws = Arc::new(aws_cli(settings, cancel));
    let connector = SshConnector::new(SshOptions {
        host_keys: settings.host_key_policy,
        ..Default::default()
    });
    Collaborators {
        credentials: aws.clone(),
        provisioner: aws.clone(),
        inventory: aws,
        connector: Arc::new(connector),
    }
}

// ============================================================================
// Commands (pure business logic over collaborators)
// ============================================================================

pub async fn whoami(validator: &dyn CredentialValidator) -> CommandResult<CallerIdentity> {
    Ok(validator.validate().await?)
}

pub async fn list_instances(
    inventory: &dyn ComputeInventory,
) -> CommandResult<Vec<NodeDescriptor>> {
    Ok(inventory.list_instances().await?)
}

/// Outcome of a terminate-instances invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationSummary {
    /// Instances that were (or, without confirmation, would be) terminated
    pub targets: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub confirmed: bool,
}

/// Terminate every running instance. Without `confirmed` only the targets
/// are reported.
pub async fn terminate_instances(
    inventory: &dyn ComputeInventory,
    confirmed: bool,
) -> CommandResult<TerminationSummary> {
    let targets: Vec<String> = inventory
        .list_instances()
        .await?
        .into_iter()
        .filter(|n| n.state == LifecycleState::Running)
        .map(|n| n.id)
        .collect();

    let mut summary = TerminationSummary {
        targets,
        failed: Vec::new(),
        confirmed,
    };
    if !confirmed {
        return Ok(summary);
    }

    for id in &summary.targets {
        match inventory.terminate_instance(id).await {
            Ok(()) => info!("Terminated {}", id),
            Err(e) => {
                warn!("Failed to terminate {}: {}", id, e);
                summary.failed.push((id.clone(), e.to_string()));
            }
        }
    }
    Ok(summary)
}

/// Stop one instance and read back its state
pub async fn stop_instance(
    inventory: &dyn ComputeInventory,
    id: &str,
) -> CommandResult<LifecycleState> {
    inventory.stop_instance(id).await?;
    Ok(inventory.instance_state(id).await?)
}

pub async fn create_cluster(
    settings: Settings,
    collaborators: Collaborators,
    options: RunOptions,
    cancel: CancellationToken,
) -> CommandResult<RunReport> {
    let orchestrator = ClusterOrchestrator::new(settings, collaborators).with_cancellation(cancel);
    Ok(orchestrator.run(options).await?)
}
