//! Engine configuration loaded from `geoproc.toml`.
//!
//! [`EngineConfig`] holds every tunable of the engine. Keys missing from the
//! file fall back to defaults. `GEOPROC_CANCEL_GRACE_MS` and
//! `GEOPROC_DATA_DIR` take precedence over the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::{ResourceClass, TierKind};

pub const DEFAULT_CONFIG_FILE: &str = "geoproc.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// How long a cancelled tier gets to wind down before the job is
    /// force-cancelled.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Capacity for any (tier, class) pair without an explicit entry.
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,

    #[serde(default)]
    pub capacities: Vec<CapacityConfig>,

    /// Directory for job snapshots and the provenance log. In-memory when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub subprocess: SubprocessConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Retry policy for TTL cleanup of registered outputs.
    #[serde(default)]
    pub cleanup_retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CapacityConfig {
    pub tier: TierKind,
    pub class: ResourceClass,
    pub capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubprocessConfig {
    /// Process id to argv. The command receives parameters as JSON on stdin
    /// and must print outputs as a JSON object on stdout.
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of a read-only OGC API Features catalog.
    #[serde(default)]
    pub features_api_url: Option<String>,
    /// Extra host names rejected for URL references.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))),
        )
    }
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_capacity() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: default_cancel_grace_ms(),
            default_capacity: default_capacity(),
            capacities: Vec::new(),
            data_dir: None,
            subprocess: SubprocessConfig::default(),
            catalog: CatalogConfig::default(),
            cleanup_retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads `path`, or `geoproc.toml` in the current directory. A missing
    /// default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let p = Path::new(DEFAULT_CONFIG_FILE);
                if p.exists() {
                    Self::from_file(p)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str::<EngineConfig>(&contents)
            .with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(ms) = std::env::var("GEOPROC_CANCEL_GRACE_MS")
            && let Ok(ms) = ms.parse::<u64>()
        {
            self.cancel_grace_ms = ms;
        }
        if let Ok(dir) = std::env::var("GEOPROC_DATA_DIR")
            && !dir.is_empty()
        {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, argv) in &self.subprocess.commands {
            if argv.is_empty() {
                anyhow::bail!("subprocess command for {name} is empty");
            }
        }
        Ok(())
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert_eq!(config.cancel_grace_ms, 5_000);
        assert_eq!(config.default_capacity, 4);
        assert!(config.capacities.is_empty());
        assert!(config.data_dir.is_none());
        assert_eq!(config.cleanup_retry, RetryConfig::default());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            default_capacity = 2

            [[capacities]]
            tier = "database"
            class = "heavy"
            capacity = 1

            [subprocess.commands]
            reproject = ["gdalwarp-wrapper", "--json"]
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_capacity, 2);
        assert_eq!(config.cancel_grace_ms, 5_000);
        assert_eq!(
            config.capacities,
            vec![CapacityConfig {
                tier: TierKind::Database,
                class: ResourceClass::Heavy,
                capacity: 1,
            }]
        );
        assert_eq!(
            config.subprocess.commands["reproject"],
            vec!["gdalwarp-wrapper".to_string(), "--json".to_string()]
        );
    }

    #[test]
    fn load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cancel_grace_ms = 250").unwrap();
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cancel_grace(), Duration::from_millis(250));
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        assert!(EngineConfig::load(Some(Path::new("/nonexistent/geoproc.toml"))).is_err());
    }

    #[test]
    fn empty_subprocess_command_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[subprocess.commands]\nbroken = []").unwrap();
        assert!(EngineConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
    }
}
