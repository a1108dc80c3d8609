//! Remote execution on cluster nodes
//!
//! A [`RemoteSession`] is an authenticated channel to one host with file
//! transfer and command execution. Sessions are opened through a
//! [`RemoteConnector`] and are owned by exactly one delivery task.

pub mod retry;
pub mod ssh;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use retry::{with_retry, RetryPolicy};
pub use ssh::{SshClient, SshConnector, SshOptions};

/// Errors from remote sessions
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Connection to {host} failed: {message}")]
    ConnectionFailed { host: String, message: String },

    #[error("Connection to {host} lost: {message}")]
    ConnectionLost { host: String, message: String },

    #[error("{operation} on {host} timed out after {after:?}")]
    Timeout {
        host: String,
        operation: String,
        after: Duration,
    },

    #[error("Authentication to {host} rejected: {message}")]
    AuthenticationRejected { host: String, message: String },

    #[error("Transfer {from} -> {to} failed: {message}")]
    TransferFailed {
        from: String,
        to: String,
        message: String,
    },

    #[error("Local file not found: {0}")]
    LocalFileMissing(PathBuf),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// True for failures that are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::ConnectionFailed { .. }
                | RemoteError::ConnectionLost { .. }
                | RemoteError::Timeout { .. }
        )
    }
}

/// Captured output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn from_bytes(stdout: &[u8], stderr: &[u8], exit_code: Option<i32>) -> Self {
        let lines = |bytes: &[u8]| -> Vec<String> {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(|l| l.to_string())
                .collect()
        };
        Self {
            stdout_lines: lines(stdout),
            stderr_lines: lines(stderr),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How unknown host keys are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept and remember keys of hosts never seen before. Only suitable for
    /// freshly provisioned, throwaway nodes.
    #[default]
    AcceptNew,
    /// Refuse hosts whose key is not already known
    Strict,
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyPolicy::AcceptNew => f.write_str("accept-new"),
            HostKeyPolicy::Strict => f.write_str("strict"),
        }
    }
}

/// Where and as whom to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
}

impl SessionTarget {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn host(&self) -> &str;

    async fn upload(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), RemoteError>;

    async fn download(&self, remote: &str, local: &Path, recursive: bool)
        -> Result<(), RemoteError>;

    /// Run `command`, optionally feeding `stdin`. A non-zero exit status is
    /// reported in the output, not as an error.
    async fn execute(&self, command: &str, stdin: Option<&[u8]>)
        -> Result<CommandOutput, RemoteError>;

    /// Tear the session down; further calls fail
    async fn close(&self);
}

#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
