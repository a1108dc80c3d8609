//! Cluster configuration artifacts
//!
//! Two templates are rendered per run, `jvm.options` (heap sizing) and
//! `opensearch.yml` (discovery and roles). They are shipped to every node
//! together with the unrendered `launch.sh`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use super::{render, RenderError};
use crate::cluster::topology::{ClusterTopology, MemoryBudget};

/// Suffix of rendered files in the staging directory
pub const RENDERED_SUFFIX: &str = "_updated";

/// Kind of artifact delivered to each node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    MemoryTuning,
    ClusterConfig,
    LaunchScript,
}

impl ArtifactKind {
    /// Template / source file name under the resources directory
    pub fn file_name(&self) -> &'static str {
        match self {
            ArtifactKind::MemoryTuning => "jvm.options",
            ArtifactKind::ClusterConfig => "opensearch.yml",
            ArtifactKind::LaunchScript => "launch.sh",
        }
    }

    /// Destination relative to the cluster directory on the node
    pub fn remote_path(&self) -> &'static str {
        match self {
            ArtifactKind::MemoryTuning => "config/jvm.options",
            ArtifactKind::ClusterConfig => "config/opensearch.yml",
            ArtifactKind::LaunchScript => "launch.sh",
        }
    }

    fn is_rendered(&self) -> bool {
        !matches!(self, ArtifactKind::LaunchScript)
    }

    /// File name used in the local staging directory
    pub fn staged_file_name(&self) -> String {
        if self.is_rendered() {
            format!("{}{}", self.file_name(), RENDERED_SUFFIX)
        } else {
            self.file_name().to_string()
        }
    }
}

/// Concrete file content ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub kind: ArtifactKind,
    pub content: Vec<u8>,
}

impl RenderedArtifact {
    pub fn target_filename(&self) -> String {
        self.kind.staged_file_name()
    }

    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

/// YAML flow sequence of double-quoted strings
pub fn yaml_flow_list<S: AsRef<str>>(items: &[S]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|s| format!("\"{}\"", s.as_ref().replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// Render the heap settings file
pub fn memory_tuning_artifact(
    template: &str,
    budget: MemoryBudget,
) -> Result<RenderedArtifact, RenderError> {
    let heap = budget.heap_size();
    let mut values = BTreeMap::new();
    values.insert("HEAP_MIN".to_string(), heap.clone());
    values.insert("HEAP_MAX".to_string(), heap);

    let content = render(ArtifactKind::MemoryTuning.file_name(), template, &values)?;
    Ok(RenderedArtifact {
        kind: ArtifactKind::MemoryTuning,
        content: content.into_bytes(),
    })
}

/// Render the cluster configuration file
pub fn cluster_config_artifact(
    template: &str,
    topology: &ClusterTopology,
    roles: &[String],
) -> Result<RenderedArtifact, RenderError> {
    let name = ArtifactKind::ClusterConfig.file_name();
    let mut values = BTreeMap::new();
    values.insert(
        "INITIAL_MANAGER_NODES".to_string(),
        yaml_flow_list(&[topology.manager.as_str()]),
    );
    values.insert("SEED_HOSTS".to_string(), yaml_flow_list(&topology.seed_hosts));
    values.insert(
        "MAX_LOCAL_STORAGE_NODES".to_string(),
        topology.node_count.to_string(),
    );
    values.insert("NODE_ROLES".to_string(), yaml_flow_list(roles));

    let content = render(name, template, &values)?;
    serde_yaml::from_str::<serde_yaml::Value>(&content)
        .map_err(|e| RenderError::InvalidYaml(name.to_string(), e.to_string()))?;

    Ok(RenderedArtifact {
        kind: ArtifactKind::ClusterConfig,
        content: content.into_bytes(),
    })
}

/// Read back the `-Xms` and `-Xmx` values from a heap settings file
pub fn read_heap_settings(content: &str) -> (Option<String>, Option<String>) {
    let mut min = None;
    let mut max = None;
    for line in content.lines().map(str::trim) {
        if line.starts_with('#') {
            continue;
        }
        if let Some(v) = line.strip_prefix("-Xms") {
            min = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("-Xmx") {
            max = Some(v.to_string());
        }
    }
    (min, max)
}

/// Every artifact of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSet {
    artifacts: Vec<RenderedArtifact>,
}

fn read_template(dir: &Path, kind: ArtifactKind) -> Result<String, RenderError> {
    let path = dir.join(kind.file_name());
    fs::read_to_string(&path).map_err(|e| RenderError::TemplateRead(path.display().to_string(), e))
}

impl ArtifactSet {
    /// Render from in-memory sources
    pub fn render(
        memory_template: &str,
        cluster_template: &str,
        launch_script: &[u8],
        topology: &ClusterTopology,
        roles: &[String],
    ) -> Result<Self, RenderError> {
        Ok(Self {
            artifacts: vec![
                memory_tuning_artifact(memory_template, topology.memory_budget)?,
                cluster_config_artifact(cluster_template, topology, roles)?,
                RenderedArtifact {
                    kind: ArtifactKind::LaunchScript,
                    content: launch_script.to_vec(),
                },
            ],
        })
    }

    /// Read the sources from `resources_dir` and render them
    pub fn load(
        resources_dir: &Path,
        topology: &ClusterTopology,
        roles: &[String],
    ) -> Result<Self, RenderError> {
        let memory = read_template(resources_dir, ArtifactKind::MemoryTuning)?;
        let cluster = read_template(resources_dir, ArtifactKind::ClusterConfig)?;
        let launch = read_template(resources_dir, ArtifactKind::LaunchScript)?;
        Self::render(&memory, &cluster, launch.as_bytes(), topology, roles)
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&RenderedArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderedArtifact> {
        self.artifacts.iter()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Write every artifact into `dir` as a read-only file
    pub fn stage_in(&self, dir: &Path) -> Result<Vec<StagedFile>, RenderError> {
        fs::create_dir_all(dir)?;
        let mut files = Vec::with_capacity(self.artifacts.len());
        for artifact in &self.artifacts {
            let path = dir.join(artifact.target_filename());
            fs::write(&path, &artifact.content)?;
            let mut perms = fs::metadata(&path)?.permissions();
            perms.set_readonly(true);
            fs::set_permissions(&path, perms)?;
            debug!("Staged {} ({} bytes)", path.display(), artifact.content.len());
            files.push(StagedFile {
                kind: artifact.kind,
                local_path: path,
            });
        }
        Ok(files)
    }

    /// Write every artifact into a fresh temporary directory that is removed
    /// when the returned value is dropped
    pub fn stage(&self) -> Result<StagedArtifacts, RenderError> {
        let dir = tempfile::Builder::new().prefix("searchstack-").tempdir()?;
        let files = self.stage_in(dir.path())?;
        Ok(StagedArtifacts { dir, files })
    }
}

/// One artifact written to local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub kind: ArtifactKind,
    pub local_path: PathBuf,
}

/// Staged artifacts; the backing directory lives as long as this value
#[derive(Debug)]
pub struct StagedArtifacts {
    dir: TempDir,
    pub files: Vec<StagedFile>,
}

impl StagedArtifacts {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}
