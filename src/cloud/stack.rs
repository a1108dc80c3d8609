//! Stack status classification and the bounded wait loop
//!
//! Stack operations are asynchronous on the provider side. The provisioner
//! polls the stack status until it reaches a terminal state for the operation
//! in flight, the wait times out, or the run is cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::CloudError;

/// Operation whose completion is being awaited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackOperation {
    Create,
    Update,
    Delete,
}

impl StackOperation {
    pub fn complete_status(&self) -> &'static str {
        match self {
            StackOperation::Create => "CREATE_COMPLETE",
            StackOperation::Update => "UPDATE_COMPLETE",
            StackOperation::Delete => "DELETE_COMPLETE",
        }
    }
}

/// Classification of a reported stack status for a given operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackStatus {
    InProgress,
    Complete,
    Failed(String),
}

/// Classify `status` while waiting on `op`.
///
/// `None` means the stack no longer exists, which completes a delete and
/// fails anything else.
pub fn classify_status(op: StackOperation, status: Option<&str>) -> StackStatus {
    let status = match status {
        None if op == StackOperation::Delete => return StackStatus::Complete,
        None => return StackStatus::Failed("STACK_MISSING".to_string()),
        Some(s) => s,
    };

    if status == op.complete_status() {
        return StackStatus::Complete;
    }
    // A rollback in progress keeps polling; it can only settle in a failed state
    if status.ends_with("_IN_PROGRESS") {
        return StackStatus::InProgress;
    }
    StackStatus::Failed(status.to_string())
}

/// Polling parameters for stack waits
#[derive(Debug, Clone)]
pub struct StackWaitConfig {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for StackWaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Poll `fetch_status` until `op` completes on stack `name`.
///
/// `fetch_status` returns `Ok(None)` once the stack no longer exists.
pub async fn wait_for_stack<F, Fut>(
    name: &str,
    op: StackOperation,
    config: &StackWaitConfig,
    cancel: &CancellationToken,
    mut fetch_status: F,
) -> Result<(), CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>, CloudError>>,
{
    let started = Instant::now();
    info!("Waiting for stack {} to reach {}", name, op.complete_status());

    loop {
        let status = fetch_status().await?;
        match classify_status(op, status.as_deref()) {
            StackStatus::Complete => {
                info!(
                    "Stack {} reached {} after {:?}",
                    name,
                    op.complete_status(),
                    started.elapsed()
                );
                return Ok(());
            }
            StackStatus::Failed(status) => {
                return Err(CloudError::StackFailed {
                    name: name.to_string(),
                    status,
                });
            }
            StackStatus::InProgress => {
                debug!("Stack {} status: {}", name, status.unwrap_or_default());
            }
        }

        let waited = started.elapsed();
        if waited >= config.timeout {
            return Err(CloudError::StackTimeout {
                name: name.to_string(),
                waited,
            });
        }

        tokio::select! {
            _ = sleep(config.poll_interval) => {}
            _ = cancel.cancelled() => {
                return Err(CloudError::Cancelled(name.to_string()));
            }
        }
    }
}
