//! Environment configuration
//!
//! All settings come from the process environment, optionally seeded from a
//! `.env` file. [`Settings::from_lookup`] is the pure parser; it collects every
//! problem it finds and reports them together so a run never starts with a
//! half-valid configuration.

pub mod keys;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::remote::HostKeyPolicy;

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_STACK_NAME: &str = "opensearch-cluster";
pub const DEFAULT_INSTANCE_NAME_PREFIX: &str = "opensearch";
pub const DEFAULT_VOLUME_SIZE_GIB: u32 = 30;
pub const DEFAULT_ROOT_DIR: &str = "/home/ubuntu";
pub const DEFAULT_SSH_USER: &str = "ubuntu";
pub const DEFAULT_STACK_TEMPLATE: &str = "ec2.yaml";
pub const DEFAULT_RESOURCES_DIR: &str = "resources";
pub const DEFAULT_STACK_WAIT_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_STACK_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_DELIVERY_CONCURRENCY: usize = 8;

/// Errors while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Failed to load env file {path}: {message}")]
    EnvFile { path: PathBuf, message: String },
}

/// A value that must never show up in logs or debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Validated settings for one invocation
#[derive(Debug, Clone)]
pub struct Settings {
    pub region: String,
    pub stack_name: String,
    pub instance_name_prefix: String,
    pub volume_size_gib: u32,
    pub instance_type: String,
    pub opensearch_version: String,
    pub admin_password: Secret,
    pub root_dir: String,
    pub cluster_base_dir: String,
    pub node_roles: Vec<String>,
    pub ssh_user: String,
    /// Private key used for remote sessions
    pub key_file: PathBuf,
    /// Cloud-side name of the key pair
    pub key_name: String,
    pub stack_template: PathBuf,
    pub resources_dir: PathBuf,
    pub stack_wait_timeout: Duration,
    pub stack_poll_interval: Duration,
    pub delivery_concurrency: usize,
    pub host_key_policy: HostKeyPolicy,
}

/// Split a comma separated role list into trimmed, non-empty tokens
pub fn parse_roles(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Region alone, for commands that need nothing else
pub fn region_from_lookup<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup("AWS_REGION")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Load a `.env` file. An explicit path must be readable; without one a
/// `.env` in the working directory is used if present.
pub fn load_env_file(path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    match path {
        Some(path) => {
            dotenvy::from_path(path).map_err(|e| ConfigError::EnvFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            Ok(Some(path.to_path_buf()))
        }
        None => Ok(dotenvy::dotenv().ok()),
    }
}

struct Reader<'a, F> {
    lookup: &'a F,
    problems: Vec<String>,
}

impl<'a, F> Reader<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&mut self, key: &str) -> String {
        match self.get(key) {
            Some(v) => v,
            None => {
                self.problems.push(format!("{} is required", key));
                String::new()
            }
        }
    }

    fn number<T: std::str::FromStr + PartialOrd + Default>(&mut self, key: &str, default: T) -> T {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) if v > T::default() => v,
                _ => {
                    self.problems
                        .push(format!("{} must be a positive integer, got '{}'", key, raw));
                    default
                }
            },
        }
    }

    fn flag(&mut self, key: &str) -> bool {
        match self.get(key) {
            None => false,
            Some(raw) => parse_bool(&raw).unwrap_or_else(|| {
                self.problems
                    .push(format!("{} must be true or false, got '{}'", key, raw));
                false
            }),
        }
    }

    fn path(&self, raw: &str) -> PathBuf {
        let expanded = shellexpand::full_with_context_no_errors(
            raw,
            || dirs::home_dir().map(|p| p.display().to_string()),
            |var| (self.lookup)(var),
        );
        PathBuf::from(expanded.as_ref())
    }
}

impl Settings {
    /// Parse settings from `lookup`, reporting every problem at once
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut r = Reader {
            lookup: &lookup,
            problems: Vec::new(),
        };

        let region = region_from_lookup(&lookup);
        let instance_type = r.required("INSTANCE_TYPE");
        let opensearch_version = r.required("OPENSEARCH_VERSION");
        let admin_password = Secret::new(r.required("ADMIN_PASSWORD"));
        let cluster_base_dir = r.required("CLUSTER_BASE_DIR");

        let node_roles = match r.get("OPENSEARCH_NODE_ROLES") {
            Some(raw) => {
                let roles = parse_roles(&raw);
                if roles.is_empty() {
                    r.problems
                        .push("OPENSEARCH_NODE_ROLES has no roles".to_string());
                }
                roles
            }
            None => {
                r.problems.push("OPENSEARCH_NODE_ROLES is required".to_string());
                Vec::new()
            }
        };

        let volume_size_gib = r.number("EBS_VOLUME_SIZE", DEFAULT_VOLUME_SIZE_GIB);
        let stack_wait_timeout = Duration::from_secs(
            r.number("STACK_WAIT_TIMEOUT_SECS", DEFAULT_STACK_WAIT_TIMEOUT_SECS),
        );
        let stack_poll_interval = Duration::from_secs(
            r.number("STACK_POLL_INTERVAL_SECS", DEFAULT_STACK_POLL_INTERVAL_SECS),
        );
        let delivery_concurrency = r.number("DELIVERY_CONCURRENCY", DEFAULT_DELIVERY_CONCURRENCY);

        let host_key_policy = if r.flag("SSH_STRICT_HOST_KEYS") {
            HostKeyPolicy::Strict
        } else {
            HostKeyPolicy::AcceptNew
        };

        let key_file = match r.get("PEM_FILE") {
            Some(raw) => Some(r.path(&raw)),
            None => {
                let user = r.get("USER").or_else(|| r.get("USERNAME"));
                match user {
                    Some(user) => Some(keys::default_key_path(
                        dirs::download_dir(),
                        dirs::home_dir(),
                        &user,
                        &region,
                    )),
                    None => {
                        r.problems.push(
                            "cannot determine the local user for the key file; set USER or PEM_FILE"
                                .to_string(),
                        );
                        None
                    }
                }
            }
        };
        let key_name = key_file
            .as_deref()
            .and_then(keys::key_name_from_path)
            .unwrap_or_default();
        if key_file.is_some() && key_name.is_empty() {
            r.problems.push("PEM_FILE has no usable file name".to_string());
        }

        let stack_template = r.path(&r.or("STACK_TEMPLATE", DEFAULT_STACK_TEMPLATE));
        let resources_dir = r.path(&r.or("RESOURCES_DIR", DEFAULT_RESOURCES_DIR));

        if !r.problems.is_empty() {
            return Err(ConfigError::Invalid(r.problems));
        }

        let settings = Self {
            stack_name: r.or("CF_STACK_NAME", DEFAULT_STACK_NAME),
            instance_name_prefix: r.or("INSTANCE_NAME_PREFIX", DEFAULT_INSTANCE_NAME_PREFIX),
            root_dir: r.or("ROOT_DIR", DEFAULT_ROOT_DIR),
            ssh_user: r.or("SSH_USER", DEFAULT_SSH_USER),
            region,
            volume_size_gib,
            instance_type,
            opensearch_version,
            admin_password,
            cluster_base_dir,
            node_roles,
            key_file: key_file.unwrap_or_default(),
            key_name,
            stack_template,
            resources_dir,
            stack_wait_timeout,
            stack_poll_interval,
            delivery_concurrency,
            host_key_policy,
        };
        debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }

    /// Settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Directory on each node that holds the search engine installation
    pub fn cluster_dir(&self) -> String {
        format!(
            "{}/{}",
            self.root_dir.trim_end_matches('/'),
            self.cluster_base_dir.trim_matches('/')
        )
    }
}
