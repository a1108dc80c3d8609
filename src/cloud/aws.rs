//! AWS collaborators driven through the `aws` command line tool
//!
//! Argument generation and response parsing are pure functions; `AwsCli`
//! is the thin I/O layer that spawns the tool and feeds its JSON output to
//! them.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stack::{wait_for_stack, StackOperation, StackWaitConfig};
use super::{
    CallerIdentity, CloudError, ComputeInventory, CredentialValidator, InstancePage,
    StackDescription, StackParameter, StackProvisioner,
};
use crate::cluster::{LifecycleState, NodeDescriptor};

/// Publisher account of the base images
pub const BASE_IMAGE_OWNER: &str = "099720109477";

/// Name pattern of the base images
pub const BASE_IMAGE_PATTERN: &str = "ubuntu/images/hvm-ssd/ubuntu-jammy-22.04-amd64-server-*";

/// Page size for instance listings
pub const INSTANCE_PAGE_SIZE: u32 = 1000;

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityResponse {
    user_id: String,
    account: String,
    arn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeStacksResponse {
    #[serde(default)]
    stacks: Vec<StackRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StackRecord {
    stack_name: String,
    stack_status: String,
    #[serde(default)]
    outputs: Vec<OutputRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OutputRecord {
    output_key: String,
    output_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservations: Vec<Reservation>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<InstanceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceRecord {
    instance_id: String,
    instance_type: String,
    state: InstanceStateRecord,
    private_ip_address: Option<String>,
    public_ip_address: Option<String>,
    #[serde(default)]
    tags: Vec<TagRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStateRecord {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagRecord {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstanceTypesResponse {
    #[serde(default)]
    instance_types: Vec<InstanceTypeRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceTypeRecord {
    instance_type: String,
    memory_info: MemoryInfoRecord,
}

#[derive(Debug, Deserialize)]
struct MemoryInfoRecord {
    #[serde(rename = "SizeInMiB")]
    size_in_mib: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImagesResponse {
    #[serde(default)]
    images: Vec<ImageRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageRecord {
    image_id: String,
    creation_date: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateKeyPairResponse {
    key_material: String,
}

// ============================================================================
// SBIO: Pure parsing
// ============================================================================

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, CloudError> {
    serde_json::from_slice(body).map_err(|e| CloudError::Parse(e.to_string()))
}

/// Map a failed invocation's stderr to an error kind
pub fn classify_cli_failure(stderr: &str) -> CloudError {
    let message = stderr.trim().to_string();
    let credential_markers = [
        "ExpiredToken",
        "InvalidClientTokenId",
        "UnrecognizedClientException",
        "AuthFailure",
        "Unable to locate credentials",
        "SignatureDoesNotMatch",
    ];
    if credential_markers.iter().any(|m| message.contains(m)) {
        CloudError::InvalidCredentials(message)
    } else {
        CloudError::Provider(message)
    }
}

/// Parse one `describe-instances` page into node descriptors
pub fn parse_instance_page(body: &[u8]) -> Result<InstancePage, CloudError> {
    let response: DescribeInstancesResponse = parse_json(body)?;
    let mut instances = Vec::new();
    for reservation in response.reservations {
        for record in reservation.instances {
            let state = record
                .state
                .name
                .parse::<LifecycleState>()
                .map_err(CloudError::Parse)?;
            let tags: BTreeMap<String, String> =
                record.tags.into_iter().map(|t| (t.key, t.value)).collect();
            instances.push(NodeDescriptor {
                id: record.instance_id,
                state,
                private_address: record.private_ip_address,
                public_address: record.public_ip_address,
                tags,
                instance_class: record.instance_type,
            });
        }
    }
    Ok(InstancePage {
        instances,
        next_token: response.next_token,
    })
}

/// Memory in MiB for `instance_class` from a `describe-instance-types` response
pub fn parse_instance_memory(body: &[u8], instance_class: &str) -> Result<u64, CloudError> {
    let response: DescribeInstanceTypesResponse = parse_json(body)?;
    response
        .instance_types
        .into_iter()
        .find(|t| t.instance_type == instance_class)
        .map(|t| t.memory_info.size_in_mib)
        .ok_or_else(|| CloudError::UnknownInstanceClass(instance_class.to_string()))
}

/// Newest image id by creation date
pub fn parse_latest_image(body: &[u8]) -> Result<String, CloudError> {
    let response: DescribeImagesResponse = parse_json(body)?;
    response
        .images
        .into_iter()
        .filter_map(|img| {
            DateTime::parse_from_rfc3339(&img.creation_date)
                .ok()
                .map(|created| (created.with_timezone(&Utc), img.image_id))
        })
        .max_by_key(|(created, _)| *created)
        .map(|(_, id)| id)
        .ok_or_else(|| CloudError::ImageNotFound(BASE_IMAGE_PATTERN.to_string()))
}

/// First stack in a `describe-stacks` response
pub fn parse_stack_description(body: &[u8]) -> Result<StackDescription, CloudError> {
    let response: DescribeStacksResponse = parse_json(body)?;
    let record = response
        .stacks
        .into_iter()
        .next()
        .ok_or_else(|| CloudError::Parse("describe-stacks returned no stacks".to_string()))?;
    Ok(StackDescription {
        name: record.stack_name,
        status: record.stack_status,
        outputs: record
            .outputs
            .into_iter()
            .map(|o| (o.output_key, o.output_value))
            .collect(),
    })
}

/// Arguments for a paged `describe-instances` call
pub fn describe_instances_args(token: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "ec2".to_string(),
        "describe-instances".to_string(),
        "--max-items".to_string(),
        INSTANCE_PAGE_SIZE.to_string(),
    ];
    if let Some(token) = token {
        args.push("--starting-token".to_string());
        args.push(token.to_string());
    }
    args
}

/// Arguments for the base image lookup
pub fn describe_images_args() -> Vec<String> {
    vec![
        "ec2".to_string(),
        "describe-images".to_string(),
        "--owners".to_string(),
        BASE_IMAGE_OWNER.to_string(),
        "--filters".to_string(),
        format!("Name=name,Values={}", BASE_IMAGE_PATTERN),
        "Name=state,Values=available".to_string(),
        "Name=is-public,Values=true".to_string(),
    ]
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Cloud collaborators backed by the `aws` CLI
#[derive(Debug, Clone)]
pub struct AwsCli {
    region: String,
    binary: String,
    wait: StackWaitConfig,
    cancel: CancellationToken,
}

impl AwsCli {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            binary: "aws".to_string(),
            wait: StackWaitConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a different executable (e.g. a wrapper script)
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_wait_config(mut self, wait: StackWaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Stack waits stop early when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>, CloudError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary)
            .args(&args)
            .arg("--region")
            .arg(&self.region)
            .arg("--output")
            .arg("json")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CloudError::Provider(format!("Failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_cli_failure(&stderr));
        }
        Ok(output.stdout)
    }

    /// Current stack status, `None` once the stack is gone
    async fn stack_status(&self, name: &str) -> Result<Option<String>, CloudError> {
        match self.describe_stack(name).await {
            Ok(desc) => Ok(Some(desc.status)),
            Err(CloudError::StackNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the template and parameters to private files so neither the
    /// template size nor the parameter values end up on the command line
    fn stage_stack_inputs(
        template_body: &str,
        parameters: &[StackParameter],
    ) -> Result<(NamedTempFile, NamedTempFile), CloudError> {
        let mut template = NamedTempFile::new()?;
        template.write_all(template_body.as_bytes())?;
        template.flush()?;

        let mut params = NamedTempFile::new()?;
        let json =
            serde_json::to_vec(parameters).map_err(|e| CloudError::Parse(e.to_string()))?;
        params.write_all(&json)?;
        params.flush()?;

        Ok((template, params))
    }

    fn stack_args(
        op: &str,
        name: &str,
        template: &NamedTempFile,
        params: &NamedTempFile,
    ) -> Vec<String> {
        vec![
            "cloudformation".to_string(),
            op.to_string(),
            "--stack-name".to_string(),
            name.to_string(),
            "--template-body".to_string(),
            format!("file://{}", template.path().display()),
            "--parameters".to_string(),
            format!("file://{}", params.path().display()),
            "--capabilities".to_string(),
            "CAPABILITY_NAMED_IAM".to_string(),
        ]
    }
}

#[async_trait]
impl CredentialValidator for AwsCli {
    async fn validate(&self) -> Result<CallerIdentity, CloudError> {
        let body = self
            .run(vec!["sts".to_string(), "get-caller-identity".to_string()])
            .await
            .map_err(|e| match e {
                CloudError::Provider(msg) => CloudError::InvalidCredentials(msg),
                other => other,
            })?;
        let response: CallerIdentityResponse = parse_json(&body)?;
        Ok(CallerIdentity {
            user_id: response.user_id,
            account: response.account,
            arn: response.arn,
        })
    }
}

#[async_trait]
impl StackProvisioner for AwsCli {
    async fn stack_exists(&self, name: &str) -> Result<bool, CloudError> {
        Ok(self.stack_status(name).await?.is_some())
    }

    async fn create_stack(
        &self,
        name: &str,
        template_body: &str,
        parameters: &[StackParameter],
    ) -> Result<(), CloudError> {
        let (template, params) = Self::stage_stack_inputs(template_body, parameters)?;
        self.run(Self::stack_args("create-stack", name, &template, &params))
            .await?;
        info!("Stack {} creation started", name);

        wait_for_stack(name, StackOperation::Create, &self.wait, &self.cancel, || {
            self.stack_status(name)
        })
        .await
    }

    async fn delete_stack(&self, name: &str) -> Result<(), CloudError> {
        self.run(vec![
            "cloudformation".to_string(),
            "delete-stack".to_string(),
            "--stack-name".to_string(),
            name.to_string(),
        ])
        .await?;
        info!("Stack {} deletion started", name);

        wait_for_stack(name, StackOperation::Delete, &self.wait, &self.cancel, || {
            self.stack_status(name)
        })
        .await
    }

    async fn update_stack(
        &self,
        name: &str,
        template_body: &str,
        parameters: &[StackParameter],
    ) -> Result<(), CloudError> {
        let (template, params) = Self::stage_stack_inputs(template_body, parameters)?;
        self.run(Self::stack_args("update-stack", name, &template, &params))
            .await?;
        info!("Stack {} update started", name);

        wait_for_stack(name, StackOperation::Update, &self.wait, &self.cancel, || {
            self.stack_status(name)
        })
        .await
    }

    async fn describe_stack(&self, name: &str) -> Result<StackDescription, CloudError> {
        let result = self
            .run(vec![
                "cloudformation".to_string(),
                "describe-stacks".to_string(),
                "--stack-name".to_string(),
                name.to_string(),
            ])
            .await;

        match result {
            Ok(body) => parse_stack_description(&body),
            Err(CloudError::Provider(msg)) if msg.contains("does not exist") => {
                Err(CloudError::StackNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ComputeInventory for AwsCli {
    async fn list_instances_page(&self, token: Option<String>) -> Result<InstancePage, CloudError> {
        let body = self.run(describe_instances_args(token.as_deref())).await?;
        parse_instance_page(&body)
    }

    async fn instance_memory_mib(&self, instance_class: &str) -> Result<u64, CloudError> {
        let body = self
            .run(vec![
                "ec2".to_string(),
                "describe-instance-types".to_string(),
                "--instance-types".to_string(),
                instance_class.to_string(),
            ])
            .await?;
        parse_instance_memory(&body, instance_class)
    }

    async fn create_key_pair(&self, name: &str) -> Result<String, CloudError> {
        let body = self
            .run(vec![
                "ec2".to_string(),
                "create-key-pair".to_string(),
                "--key-name".to_string(),
                name.to_string(),
            ])
            .await?;
        let response: CreateKeyPairResponse = parse_json(&body)?;
        info!("Key pair {} created", name);
        Ok(response.key_material)
    }

    async fn retrieve_base_image_id(&self) -> Result<String, CloudError> {
        let body = self.run(describe_images_args()).await?;
        parse_latest_image(&body)
    }

    async fn instance_state(&self, id: &str) -> Result<LifecycleState, CloudError> {
        let body = self
            .run(vec![
                "ec2".to_string(),
                "describe-instances".to_string(),
                "--instance-ids".to_string(),
                id.to_string(),
            ])
            .await?;
        parse_instance_page(&body)?
            .instances
            .into_iter()
            .next()
            .map(|n| n.state)
            .ok_or_else(|| CloudError::Provider(format!("Instance {} not found", id)))
    }

    async fn stop_instance(&self, id: &str) -> Result<(), CloudError> {
        self.run(vec![
            "ec2".to_string(),
            "stop-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ])
        .await?;
        info!("Stopped instance {}", id);
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> Result<(), CloudError> {
        self.run(vec![
            "ec2".to_string(),
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ])
        .await
        .map_err(|e| {
            warn!("Error terminating instance {}: {}", id, e);
            e
        })?;
        info!("Terminated instance {}", id);
        Ok(())
    }
}
