//! `ssh`/`scp` backed remote sessions
//!
//! Each session starts a control master connection once and multiplexes
//! every later transfer and command over its socket. Connection-level
//! failures are read from the tools' stderr and mapped onto
//! [`RemoteError`] kinds so the retry policy can tell transient from fatal.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::{with_retry, RetryPolicy};
use super::{
    CommandOutput, HostKeyPolicy, RemoteConnector, RemoteError, RemoteSession, SessionTarget,
};

/// Exit status `ssh` uses for its own failures
const SSH_ERROR_EXIT: i32 = 255;

/// Map tool stderr to a connection-level error, if it describes one.
///
/// Only ssh's own authentication failure (`Permission denied (publickey)`
/// and friends) counts as a rejection; a bare `Permission denied` from scp
/// is a file access problem on the remote side and is left to the caller.
pub fn classify_connection_failure(host: &str, stderr: &str) -> Option<RemoteError> {
    let message = stderr.trim().to_string();
    let has = |markers: &[&str]| markers.iter().any(|m| stderr.contains(m));

    if has(&[
        "Permission denied (",
        "Host key verification failed",
        "REMOTE HOST IDENTIFICATION HAS CHANGED",
        "Too many authentication failures",
    ]) {
        return Some(RemoteError::AuthenticationRejected {
            host: host.to_string(),
            message,
        });
    }
    if has(&[
        "Connection refused",
        "No route to host",
        "Connection timed out",
        "Operation timed out",
        "Could not resolve hostname",
        "Network is unreachable",
    ]) {
        return Some(RemoteError::ConnectionFailed {
            host: host.to_string(),
            message,
        });
    }
    if has(&[
        "Connection reset",
        "Connection closed",
        "Broken pipe",
        "lost connection",
        "kex_exchange_identification",
    ]) {
        return Some(RemoteError::ConnectionLost {
            host: host.to_string(),
            message,
        });
    }
    None
}

/// Tunables shared by every session a connector opens
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host_keys: HostKeyPolicy,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub ssh_program: String,
    pub scp_program: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            host_keys: HostKeyPolicy::AcceptNew,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(300),
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }
}

impl SshOptions {
    /// Use different executables (e.g. wrapper scripts)
    pub fn with_programs(mut self, ssh: impl Into<String>, scp: impl Into<String>) -> Self {
        self.ssh_program = ssh.into();
        self.scp_program = scp.into();
        self
    }
}

/// Remote session over the system OpenSSH client
#[derive(Debug)]
pub struct SshClient {
    target: SessionTarget,
    options: SshOptions,
    control_path: PathBuf,
    closed: AtomicBool,
}

impl SshClient {
    /// Open a session to `target`, retrying transient connection failures
    pub async fn connect(target: SessionTarget, options: SshOptions) -> Result<Self, RemoteError> {
        let control_path = std::env::temp_dir()
            .join(format!("searchstack-{}.sock", Uuid::new_v4().simple()));
        let client = Self {
            target,
            options,
            control_path,
            closed: AtomicBool::new(false),
        };

        let what = format!("connect {}", client.target.host);
        with_retry(&client.options.retry, &what, || client.open_master()).await?;
        info!("Session established to {}@{}", client.target.user, client.target.host);
        Ok(client)
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    /// Options shared by `ssh` and `scp`
    pub fn common_args(&self) -> Vec<String> {
        let strict = match self.options.host_keys {
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::Strict => "yes",
        };
        vec![
            "-i".to_string(),
            self.target.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("StrictHostKeyChecking={}", strict),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ]
    }

    async fn run(
        &self,
        program: &str,
        args: Vec<String>,
        stdin: Option<&[u8]>,
        operation: &str,
    ) -> Result<Output, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::ConnectionLost {
                host: self.target.host.clone(),
                message: "session closed".to_string(),
            });
        }
        debug!("{} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RemoteError::Spawn {
                program: program.to_string(),
                source,
            })?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes)
                .await
                .map_err(|e| RemoteError::ConnectionLost {
                    host: self.target.host.clone(),
                    message: format!("writing stdin: {}", e),
                })?;
            drop(pipe);
        }

        let timeout = self.options.operation_timeout;
        tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| RemoteError::Timeout {
                host: self.target.host.clone(),
                operation: operation.to_string(),
                after: timeout,
            })?
            .map_err(|e| RemoteError::ConnectionLost {
                host: self.target.host.clone(),
                message: e.to_string(),
            })
    }

    async fn open_master(&self) -> Result<(), RemoteError> {
        let mut args = self.common_args();
        args.extend([
            "-o".to_string(),
            "ControlMaster=yes".to_string(),
            "-o".to_string(),
            "ControlPersist=60".to_string(),
            "-f".to_string(),
            "-N".to_string(),
            self.destination(),
        ]);

        let output = self
            .run(&self.options.ssh_program, args, None, "connect")
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_connection_failure(&self.target.host, &stderr).unwrap_or_else(|| {
            RemoteError::ConnectionFailed {
                host: self.target.host.clone(),
                message: stderr.trim().to_string(),
            }
        }))
    }

    async fn transfer_once(
        &self,
        from: String,
        to: String,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        let mut args = self.common_args();
        if recursive {
            args.push("-r".to_string());
        }
        args.push(from.clone());
        args.push(to.clone());

        let output = self
            .run(&self.options.scp_program, args, None, "transfer")
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(
            classify_connection_failure(&self.target.host, &stderr).unwrap_or_else(|| {
                RemoteError::TransferFailed {
                    from,
                    to,
                    message: stderr.trim().to_string(),
                }
            }),
        )
    }
}

#[async_trait]
impl RemoteSession for SshClient {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn upload(&self, local: &Path, remote: &str, recursive: bool) -> Result<(), RemoteError> {
        if !local.exists() {
            return Err(RemoteError::LocalFileMissing(local.to_path_buf()));
        }
        let from = local.display().to_string();
        let to = format!("{}:{}", self.destination(), remote);
        let what = format!("upload {} to {}", from, self.target.host);
        with_retry(&self.options.retry, &what, || {
            self.transfer_once(from.clone(), to.clone(), recursive)
        })
        .await
    }

    async fn download(
        &self,
        remote: &str,
        local: &Path,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        let from = format!("{}:{}", self.destination(), remote);
        let to = local.display().to_string();
        let what = format!("download {} from {}", remote, self.target.host);
        with_retry(&self.options.retry, &what, || {
            self.transfer_once(from.clone(), to.clone(), recursive)
        })
        .await
    }

    async fn execute(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, RemoteError> {
        if command.trim().is_empty() {
            return Err(RemoteError::InvalidCommand("empty command".to_string()));
        }
        let mut args = self.common_args();
        args.push(self.destination());
        args.push("--".to_string());
        args.push(command.to_string());

        let output = self
            .run(&self.options.ssh_program, args, stdin, "execute")
            .await?;
        if output.status.code() == Some(SSH_ERROR_EXIT) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if let Some(err) = classify_connection_failure(&self.target.host, &stderr) {
                return Err(err);
            }
        }
        Ok(CommandOutput::from_bytes(
            &output.stdout,
            &output.stderr,
            output.status.code(),
        ))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut args = self.common_args();
        args.extend(["-O".to_string(), "exit".to_string(), self.destination()]);
        match Command::new(&self.options.ssh_program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(_) => debug!("Session to {} closed", self.target.host),
            Err(e) => warn!("Failed to close session to {}: {}", self.target.host, e),
        }
    }
}

/// Opens [`SshClient`] sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    options: SshOptions,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        if options.host_keys == HostKeyPolicy::AcceptNew {
            warn!(
                "Unknown host keys will be accepted without verification (ephemeral cluster mode)"
            );
        }
        Self { options }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let client = SshClient::connect(target.clone(), self.options.clone()).await?;
        Ok(Box::new(client))
    }
}
