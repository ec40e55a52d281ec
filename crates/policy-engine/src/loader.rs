use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::schema::Policy;

/// On-disk policy file: a format version and a list of policies.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    version: String,
    #[serde(default)]
    policies: Vec<Policy>,
}

/// Load the policies of one YAML file.
///
/// Validates the file after deserialization (version check, unique IDs).
/// Policies are not compiled here.
pub fn load_policies(path: impl AsRef<Path>) -> Result<Vec<Policy>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file: {}", path.display()))?;
    load_policies_from_str(&contents)
        .with_context(|| format!("failed to parse policy file: {}", path.display()))
}

/// Parse and validate policies from a YAML string.
pub fn load_policies_from_str(yaml: &str) -> Result<Vec<Policy>> {
    let file: PolicyFile = serde_yml::from_str(yaml).context("YAML deserialization failed")?;
    validate(&file)?;
    Ok(file.policies)
}

/// Load every `*.yaml` / `*.yml` file in `dir`, in file name order.
///
/// Policy IDs must be unique across the whole directory.
pub fn load_policy_dir(dir: impl AsRef<Path>) -> Result<Vec<Policy>> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read policy directory: {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("failed to list policy directory: {}", dir.display()))?;
    files.retain(|p| {
        p.is_file()
            && matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
    });
    files.sort();

    let mut seen = HashSet::new();
    let mut policies = Vec::new();
    for file in &files {
        for policy in load_policies(file)? {
            if !seen.insert(policy.id.clone()) {
                bail!(
                    "duplicate policy id '{}' in {}",
                    policy.id,
                    file.display()
                );
            }
            policies.push(policy);
        }
    }
    debug!(
        dir = %dir.display(),
        files = files.len(),
        policies = policies.len(),
        "loaded policy directory"
    );
    Ok(policies)
}

/// Run post-deserialization validation checks.
fn validate(file: &PolicyFile) -> Result<()> {
    // Version gate
    if file.version != "1.0" {
        bail!(
            "unsupported policy version '{}'; only '1.0' is supported",
            file.version
        );
    }

    let mut seen = HashSet::new();
    for policy in &file.policies {
        if policy.id.is_empty() {
            bail!("policy id must not be empty");
        }
        if policy.name.is_empty() {
            bail!("policy '{}' has an empty name", policy.id);
        }
        if !seen.insert(&policy.id) {
            bail!("duplicate policy id: '{}'", policy.id);
        }
    }

    Ok(())
}
