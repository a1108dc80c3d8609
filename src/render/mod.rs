//! Template rendering
//!
//! Templates use `${NAME}` placeholders (`NAME` is upper-case letters, digits
//! and underscores). Rendering is a single substitution pass:
//! - every supplied value must have at least one placeholder in the template
//! - every occurrence of a supplied placeholder is replaced
//! - placeholders without a supplied value are left as they are, so the
//!   search engine's own `${ENV}` references survive
//! - substituted values are never expanded again

pub mod artifacts;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use thiserror::Error;

pub use artifacts::{
    cluster_config_artifact, memory_tuning_artifact, read_heap_settings, ArtifactKind,
    ArtifactSet, RenderedArtifact, StagedArtifacts, StagedFile,
};

/// Errors during rendering
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Template '{template}' has no ${{{placeholder}}} placeholder")]
    MissingPlaceholder {
        template: String,
        placeholder: String,
    },

    #[error("Rendered '{0}' is not valid YAML: {1}")]
    InvalidYaml(String, String),

    #[error("Failed to read template {0}: {1}")]
    TemplateRead(String, std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)\}").expect("placeholder pattern is valid"))
}

/// Names of all placeholders in `template`
pub fn placeholders(template: &str) -> BTreeSet<String> {
    placeholder_pattern()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Substitute `values` into `template`.
///
/// `name` identifies the template in errors.
pub fn render(
    name: &str,
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, RenderError> {
    if values.is_empty() {
        return Ok(template.to_string());
    }

    let present = placeholders(template);
    if let Some(missing) = values.keys().find(|k| !present.contains(*k)) {
        return Err(RenderError::MissingPlaceholder {
            template: name.to_string(),
            placeholder: missing.clone(),
        });
    }

    let rendered = placeholder_pattern().replace_all(template, |caps: &Captures<'_>| {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        caps.get(1)
            .and_then(|m| values.get(m.as_str()))
            .cloned()
            .unwrap_or_else(|| whole.to_string())
    });
    Ok(rendered.into_owned())
}
