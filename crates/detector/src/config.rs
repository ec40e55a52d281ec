use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use policy_engine::Labels;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub labels: LabelsConfig,
    #[serde(default)]
    pub reprocessing: ReprocessingConfig,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoliciesConfig {
    /// A policy file, or a directory of them.
    #[serde(default = "default_policy_dir")]
    pub dir: PathBuf,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            dir: default_policy_dir(),
        }
    }
}

/// Static cluster and namespace labels used for label-scoped policies.
#[derive(Debug, Default, Deserialize)]
pub struct LabelsConfig {
    /// Cluster ID to labels.
    #[serde(default)]
    pub clusters: HashMap<String, Labels>,
    /// Namespace ID to labels.
    #[serde(default)]
    pub namespaces: HashMap<String, Labels>,
}

#[derive(Debug, Deserialize)]
pub struct ReprocessingConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_semaphore_wait")]
    pub semaphore_wait_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl ReprocessingConfig {
    pub fn semaphore_wait(&self) -> Duration {
        Duration::from_secs(self.semaphore_wait_secs)
    }

    /// Reject settings under which reprocessing could never make progress.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("reprocessing.max_concurrency must be at least 1");
        }
        if self.workers == 0 {
            anyhow::bail!("reprocessing.workers must be at least 1");
        }
        Ok(())
    }
}

impl Default for ReprocessingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            semaphore_wait_secs: default_semaphore_wait(),
            workers: default_workers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_log_level() -> String {
    "info".to_string()
}

fn default_policy_dir() -> PathBuf {
    PathBuf::from("policies")
}

fn default_max_concurrency() -> usize {
    16
}

fn default_semaphore_wait() -> u64 {
    30
}

fn default_workers() -> usize {
    17
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// If the file does not exist a default configuration is returned and a
/// warning is emitted.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = load(Path::new("/does/not/exist/config.yaml")).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.policies.dir, PathBuf::from("policies"));
        assert_eq!(config.reprocessing.max_concurrency, 16);
        assert_eq!(config.reprocessing.semaphore_wait(), Duration::from_secs(30));
        assert_eq!(config.reprocessing.workers, 17);
        assert!(config.labels.clusters.is_empty());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
reprocessing:
  max_concurrency: 4
labels:
  clusters:
    c1: {env: prod}
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.reprocessing.max_concurrency, 4);
        assert_eq!(config.reprocessing.semaphore_wait_secs, 30);
        assert_eq!(config.labels.clusters["c1"]["env"], "prod");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn zero_concurrency_or_workers_is_rejected() {
        assert!(ReprocessingConfig::default().validate().is_ok());

        let cfg = ReprocessingConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrency"), "{err}");

        let cfg = ReprocessingConfig {
            workers: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("workers"), "{err}");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "reprocessing: [not, a, map]").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"), "{err}");
    }
}
