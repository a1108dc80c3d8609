//! Cloud collaborator interfaces
//!
//! The orchestrator never talks to a cloud provider directly. It is handed
//! implementations of the three traits below:
//! - [`CredentialValidator`] - confirms the caller identity
//! - [`StackProvisioner`] - create/update/delete a declarative stack
//! - [`ComputeInventory`] - list and manage compute instances
//!
//! [`aws::AwsCli`] implements all three on top of the `aws` command line tool.

pub mod aws;
pub mod stack;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{LifecycleState, NodeDescriptor};

pub use aws::AwsCli;
pub use stack::{StackOperation, StackStatus, StackWaitConfig};

/// Errors reported by cloud collaborators
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Credentials rejected: {0}")]
    InvalidCredentials(String),

    #[error("Stack '{0}' not found")]
    StackNotFound(String),

    #[error("Stack '{name}' ended in {status}")]
    StackFailed { name: String, status: String },

    #[error("Timed out after {waited:?} waiting for stack '{name}'")]
    StackTimeout { name: String, waited: Duration },

    #[error("Wait for stack '{0}' cancelled")]
    Cancelled(String),

    #[error("No memory metadata for instance class '{0}'")]
    UnknownInstanceClass(String),

    #[error("No base image matched '{0}'")]
    ImageNotFound(String),

    #[error("Provider call failed: {0}")]
    Provider(String),

    #[error("Unexpected provider response: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity returned by a successful credential check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub account: String,
    pub arn: String,
}

/// One `{key, value}` stack parameter; order is preserved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackParameter {
    #[serde(rename = "ParameterKey")]
    pub key: String,
    #[serde(rename = "ParameterValue")]
    pub value: String,
}

impl StackParameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Current state of a stack and its outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub name: String,
    pub status: String,
    pub outputs: Vec<(String, String)>,
}

/// One page of an inventory listing
#[derive(Debug, Clone, Default)]
pub struct InstancePage {
    pub instances: Vec<NodeDescriptor>,
    pub next_token: Option<String>,
}

#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Confirm the ambient credentials and return who they belong to
    async fn validate(&self) -> Result<CallerIdentity, CloudError>;
}

#[async_trait]
pub trait StackProvisioner: Send + Sync {
    async fn stack_exists(&self, name: &str) -> Result<bool, CloudError>;

    /// Create the stack and wait until it reaches `CREATE_COMPLETE`
    async fn create_stack(
        &self,
        name: &str,
        template_body: &str,
        parameters: &[StackParameter],
    ) -> Result<(), CloudError>;

    /// Delete the stack and wait until it reaches `DELETE_COMPLETE`
    async fn delete_stack(&self, name: &str) -> Result<(), CloudError>;

    async fn update_stack(
        &self,
        name: &str,
        template_body: &str,
        parameters: &[StackParameter],
    ) -> Result<(), CloudError>;

    async fn describe_stack(&self, name: &str) -> Result<StackDescription, CloudError>;
}

#[async_trait]
pub trait ComputeInventory: Send + Sync {
    /// Fetch one page of running/stopped instances
    async fn list_instances_page(&self, token: Option<String>) -> Result<InstancePage, CloudError>;

    /// All running/stopped instances, aggregated across pages
    async fn list_instances(&self) -> Result<Vec<NodeDescriptor>, CloudError> {
        let mut all = Vec::new();
        let mut token = None;
        loop {
            let page = self.list_instances_page(token).await?;
            all.extend(page.instances.into_iter().filter(|n| n.state.is_listed()));
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }
        Ok(all)
    }

    /// Memory of an instance class in MiB
    async fn instance_memory_mib(&self, instance_class: &str) -> Result<u64, CloudError>;

    /// Create a key pair and return the private key material
    async fn create_key_pair(&self, name: &str) -> Result<String, CloudError>;

    /// Latest public base image id
    async fn retrieve_base_image_id(&self) -> Result<String, CloudError>;

    async fn instance_state(&self, id: &str) -> Result<LifecycleState, CloudError>;

    async fn stop_instance(&self, id: &str) -> Result<(), CloudError>;

    async fn terminate_instance(&self, id: &str) -> Result<(), CloudError>;

    /// Public address of the first running instance
    async fn first_running_public_address(&self) -> Result<Option<String>, CloudError> {
        let instances = self.list_instances().await?;
        Ok(instances
            .into_iter()
            .filter(|n| n.state == LifecycleState::Running)
            .find_map(|n| n.public_address))
    }
}
