//! Cluster Orchestrator - drives one bring-up run end to end
//!
//! A run moves through the phases below in order and stops at the first
//! run-level failure:
//!
//! ```text
//! ValidateCredentials → ProvisionStack → DiscoverNodes → ResolveTopology
//!     → RenderArtifacts → DeliverArtifacts(per node) → Activate(per node) → Done
//! ```
//!
//! Delivery and activation run as one task per node. A node that fails does
//! not stop its siblings and nothing is rolled back; the outcome of every node
//! is returned in the [`RunReport`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::node::{select_cluster_nodes, NodeDescriptor};
use super::topology::{self, ClusterTopology, TopologyError};
use crate::cloud::{
    CloudError, ComputeInventory, CredentialValidator, StackParameter, StackProvisioner,
};
use crate::config::{keys, Secret, Settings};
use crate::remote::{shell_quote, RemoteConnector, RemoteError, RemoteSession, SessionTarget};
use crate::render::{ArtifactKind, ArtifactSet, RenderError, StagedFile};

/// Steps of a bring-up run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    ValidateCredentials,
    ProvisionStack,
    DiscoverNodes,
    ResolveTopology,
    RenderArtifacts,
    DeliverArtifacts,
    Activate,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::ValidateCredentials => "validate-credentials",
            Phase::ProvisionStack => "provision-stack",
            Phase::DiscoverNodes => "discover-nodes",
            Phase::ResolveTopology => "resolve-topology",
            Phase::RenderArtifacts => "render-artifacts",
            Phase::DeliverArtifacts => "deliver-artifacts",
            Phase::Activate => "activate",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Run-level failures. Per-node failures are reported in [`NodeStatus`].
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Credential check failed: {0}")]
    Credential(#[source] CloudError),

    #[error("Provisioning stack '{stack}' failed: {source}")]
    StackProvisioning {
        stack: String,
        #[source]
        source: CloudError,
    },

    #[error("Node discovery failed: {0}")]
    Discovery(#[source] CloudError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Failed to write key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run cancelled before {0}")]
    Cancelled(Phase),
}

/// Per-run switches
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Reuse whatever instances already exist instead of recreating the stack
    pub skip_provision: bool,
    /// Stop after rendering; nothing is delivered
    pub dry_run: bool,
}

/// Terminal state of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    Activated,
    DeliveryFailed {
        error: String,
    },
    ActivationFailed {
        exit_code: Option<i32>,
        stderr: Vec<String>,
    },
    Cancelled,
}

impl NodeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            NodeStatus::Activated => "activated",
            NodeStatus::DeliveryFailed { .. } => "delivery-failed",
            NodeStatus::ActivationFailed { .. } => "activation-failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            NodeStatus::Activated | NodeStatus::Cancelled => String::new(),
            NodeStatus::DeliveryFailed { error } => error.clone(),
            NodeStatus::ActivationFailed { exit_code, stderr } => {
                let code = exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                match stderr.last() {
                    Some(line) => format!("exit {}: {}", code, line),
                    None => format!("exit {}", code),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node_id: String,
    pub address: Option<String>,
    pub status: NodeStatus,
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Partial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => f.write_str("succeeded"),
            RunStatus::Partial => f.write_str("partial"),
            RunStatus::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub topology: ClusterTopology,
    pub nodes: Vec<NodeReport>,
    #[serde(skip)]
    pub artifacts: ArtifactSet,
}

impl RunReport {
    pub fn overall(&self) -> RunStatus {
        let activated = self
            .nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Activated)
            .count();
        if activated == self.nodes.len() {
            RunStatus::Succeeded
        } else if activated == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

/// Everything the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialValidator>,
    pub provisioner: Arc<dyn StackProvisioner>,
    pub inventory: Arc<dyn ComputeInventory>,
    pub connector: Arc<dyn RemoteConnector>,
}

/// Ordered stack parameters for a bring-up
pub fn stack_parameters(settings: &Settings, image_id: &str) -> Vec<StackParameter> {
    vec![
        StackParameter::new("KeyName", &settings.key_name),
        StackParameter::new("ImageId", image_id),
        StackParameter::new("VolumeSize", settings.volume_size_gib.to_string()),
        StackParameter::new("InstanceType", &settings.instance_type),
        StackParameter::new("OpenSearchVersion", &settings.opensearch_version),
        StackParameter::new("OpenSearchAdminPassword", settings.admin_password.expose()),
        StackParameter::new("InstanceName", &settings.instance_name_prefix),
    ]
}

/// Address used for a node's remote session
fn session_address(node: &NodeDescriptor) -> Option<String> {
    node.public_address
        .clone()
        .or_else(|| node.private_address.clone())
}

/// Shared, read-only inputs of every delivery task
struct Delivery {
    run_id: Uuid,
    connector: Arc<dyn RemoteConnector>,
    user: String,
    key_file: PathBuf,
    cluster_dir: String,
    files: Vec<StagedFile>,
    password: Secret,
}

impl Delivery {
    fn remote_path(&self, kind: ArtifactKind) -> String {
        format!("{}/{}", self.cluster_dir, kind.remote_path())
    }

    /// Connect, deliver and activate one node. The session is closed on
    /// every path out, including cancellation.
    async fn run(
        &self,
        node: &NodeDescriptor,
        address: &str,
        cancel: &CancellationToken,
    ) -> NodeStatus {
        let target = SessionTarget::new(address, &self.user, &self.key_file);
        let connected = tokio::select! {
            _ = cancel.cancelled() => return NodeStatus::Cancelled,
            connected = self.connector.connect(&target) => connected,
        };
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                warn!(run_id = %self.run_id, node = %node.id, "Connect failed: {}", e);
                return NodeStatus::DeliveryFailed {
                    error: e.to_string(),
                };
            }
        };

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(run_id = %self.run_id, node = %node.id, "Delivery cancelled");
                NodeStatus::Cancelled
            }
            status = self.deliver_and_activate(node, session.as_ref()) => status,
        };
        session.close().await;
        status
    }

    async fn deliver_and_activate(
        &self,
        node: &NodeDescriptor,
        session: &dyn RemoteSession,
    ) -> NodeStatus {
        match self.deliver(session).await {
            Ok(()) => self.activate(session).await,
            Err(e) => {
                warn!(run_id = %self.run_id, node = %node.id, "Delivery failed: {}", e);
                NodeStatus::DeliveryFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Shell command that creates the target directories and removes any
    /// copies left by an earlier run. Staged files are read-only and scp
    /// keeps that mode, so an old copy would refuse to be overwritten.
    fn prepare_command(&self) -> String {
        let config_dir = format!("{}/config", self.cluster_dir);
        let targets: Vec<String> = self
            .files
            .iter()
            .map(|f| shell_quote(&self.remote_path(f.kind)))
            .collect();
        format!("mkdir -p {} && rm -f {}", shell_quote(&config_dir), targets.join(" "))
    }

    async fn deliver(&self, session: &dyn RemoteSession) -> Result<(), RemoteError> {
        let prepared = session.execute(&self.prepare_command(), None).await?;
        if !prepared.success() {
            return Err(RemoteError::InvalidCommand(format!(
                "preparing {} exited with {:?}: {}",
                self.cluster_dir,
                prepared.exit_code,
                prepared.stderr_lines.join(" ")
            )));
        }

        for file in &self.files {
            let remote = self.remote_path(file.kind);
            debug!(host = session.host(), "Uploading {} to {}", file.local_path.display(), remote);
            session.upload(&file.local_path, &remote, false).await?;
        }
        Ok(())
    }

    async fn activate(&self, session: &dyn RemoteSession) -> NodeStatus {
        let script = shell_quote(&self.remote_path(ArtifactKind::LaunchScript));
        info!(run_id = %self.run_id, host = session.host(), phase = %Phase::Activate, "Activating");

        let steps: [(String, Option<Vec<u8>>); 2] = [
            (format!("chmod +x {}", script), None),
            (
                format!("bash {} --password-stdin", script),
                Some(format!("{}\n", self.password.expose()).into_bytes()),
            ),
        ];
        for (command, stdin) in steps {
            match session.execute(&command, stdin.as_deref()).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    return NodeStatus::ActivationFailed {
                        exit_code: output.exit_code,
                        stderr: output.stderr_lines,
                    }
                }
                Err(e) => {
                    return NodeStatus::ActivationFailed {
                        exit_code: None,
                        stderr: vec![e.to_string()],
                    }
                }
            }
        }
        NodeStatus::Activated
    }
}

/// Runs cluster bring-ups against injected collaborators
pub struct ClusterOrchestrator {
    settings: Settings,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl ClusterOrchestrator {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn enter(&self, run_id: Uuid, phase: Phase) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled(phase));
        }
        info!(run_id = %run_id, phase = %phase, "Entering phase");
        Ok(())
    }

    /// Execute one bring-up run
    pub async fn run(&self, options: RunOptions) -> Result<RunReport, OrchestratorError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let settings = &self.settings;

        self.enter(run_id, Phase::ValidateCredentials)?;
        let identity = self
            .collaborators
            .credentials
            .validate()
            .await
            .map_err(OrchestratorError::Credential)?;
        info!(run_id = %run_id, "Authenticated as {} (account {})", identity.arn, identity.account);

        if options.skip_provision {
            info!(run_id = %run_id, "Skipping stack provisioning");
        } else {
            self.enter(run_id, Phase::ProvisionStack)?;
            self.provision().await?;
        }

        self.enter(run_id, Phase::DiscoverNodes)?;
        let nodes = self.discover().await?;

        self.enter(run_id, Phase::ResolveTopology)?;
        let topology = topology::resolve(
            self.collaborators.inventory.as_ref(),
            &nodes,
            &settings.instance_type,
            &settings.region,
        )
        .await?;
        info!(
            run_id = %run_id,
            "Topology: manager {}, {} nodes, heap {}",
            topology.manager, topology.node_count, topology.memory_budget
        );

        self.enter(run_id, Phase::RenderArtifacts)?;
        let artifacts =
            ArtifactSet::load(&settings.resources_dir, &topology, &settings.node_roles)?;

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run: options.dry_run,
            topology,
            nodes: Vec::new(),
            artifacts,
        };

        if options.dry_run {
            info!(run_id = %run_id, "Dry run, nothing delivered");
            report.finished_at = Utc::now();
            return Ok(report);
        }

        self.enter(run_id, Phase::DeliverArtifacts)?;
        let staged = report.artifacts.stage()?;
        report.nodes = self.fan_out(run_id, &nodes, staged.files.clone()).await;
        drop(staged);

        report.finished_at = Utc::now();
        info!(run_id = %run_id, phase = %Phase::Done, "Run {}", report.overall());
        Ok(report)
    }

    async fn provision(&self) -> Result<(), OrchestratorError> {
        let settings = &self.settings;
        let stack = settings.stack_name.as_str();
        let failed = |source: CloudError| OrchestratorError::StackProvisioning {
            stack: stack.to_string(),
            source,
        };

        self.ensure_key_file().await?;

        let image_id = self
            .collaborators
            .inventory
            .retrieve_base_image_id()
            .await
            .map_err(failed)?;
        debug!("Base image {}", image_id);

        let template = tokio::fs::read_to_string(&settings.stack_template)
            .await
            .map_err(|e| failed(CloudError::Io(e)))?;

        let provisioner = &self.collaborators.provisioner;
        if provisioner.stack_exists(stack).await.map_err(failed)? {
            info!("Stack {} exists, deleting it first", stack);
            provisioner.delete_stack(stack).await.map_err(failed)?;
        }

        let parameters = stack_parameters(settings, &image_id);
        provisioner
            .create_stack(stack, &template, &parameters)
            .await
            .map_err(failed)?;
        info!("Stack {} created", stack);
        Ok(())
    }

    async fn ensure_key_file(&self) -> Result<(), OrchestratorError> {
        let path = &self.settings.key_file;
        if path.exists() {
            debug!("Using key file {}", path.display());
            return Ok(());
        }

        info!("Creating key pair {}", self.settings.key_name);
        let material = self
            .collaborators
            .inventory
            .create_key_pair(&self.settings.key_name)
            .await
            .map_err(|source| OrchestratorError::StackProvisioning {
                stack: self.settings.stack_name.clone(),
                source,
            })?;
        keys::write_key_file(path, &material).map_err(|source| OrchestratorError::KeyFile {
            path: path.clone(),
            source,
        })
    }

    async fn discover(&self) -> Result<Vec<NodeDescriptor>, OrchestratorError> {
        let all = self
            .collaborators
            .inventory
            .list_instances()
            .await
            .map_err(OrchestratorError::Discovery)?;
        let total = all.len();
        let nodes = select_cluster_nodes(all, &self.settings.instance_name_prefix);
        info!(
            "Discovered {} cluster nodes among {} instances",
            nodes.len(),
            total
        );
        Ok(nodes)
    }

    async fn fan_out(
        &self,
        run_id: Uuid,
        nodes: &[NodeDescriptor],
        files: Vec<StagedFile>,
    ) -> Vec<NodeReport> {
        let delivery = Arc::new(Delivery {
            run_id,
            connector: self.collaborators.connector.clone(),
            user: self.settings.ssh_user.clone(),
            key_file: self.settings.key_file.clone(),
            cluster_dir: self.settings.cluster_dir(),
            files,
            password: self.settings.admin_password.clone(),
        });
        let permits = Arc::new(Semaphore::new(self.settings.delivery_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, node) in nodes.iter().cloned().enumerate() {
            let delivery = delivery.clone();
            let permits = permits.clone();
            let cancel = self.cancel.clone();

            tasks.spawn(async move {
                let address = session_address(&node);
                let status = match (&address, permits.acquire_owned().await) {
                    (None, _) => NodeStatus::DeliveryFailed {
                        error: "node has no reachable address".to_string(),
                    },
                    (Some(_), Err(_)) => NodeStatus::Cancelled,
                    (Some(address), Ok(_permit)) => {
                        info!(
                            run_id = %run_id,
                            node = %node.id,
                            address = %address,
                            "Delivering artifacts"
                        );
                        delivery.run(&node, address, &cancel).await
                    }
                };
                (
                    index,
                    NodeReport {
                        node_id: node.id,
                        address,
                        status,
                    },
                )
            });
        }

        let mut reports: Vec<Option<NodeReport>> = (0..nodes.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, report)) => {
                    info!(
                        run_id = %run_id,
                        node = %report.node_id,
                        "Node {}",
                        report.status.label()
                    );
                    reports[index] = Some(report);
                }
                Err(e) => error!(run_id = %run_id, "Delivery task aborted: {}", e),
            }
        }

        reports
            .into_iter()
            .zip(nodes)
            .map(|(report, node)| {
                report.unwrap_or_else(|| NodeReport {
                    node_id: node.id.clone(),
                    address: session_address(node),
                    status: NodeStatus::DeliveryFailed {
                        error: "delivery task aborted".to_string(),
                    },
                })
            })
            .collect()
    }
}
