use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const USER_CONFIG_FILE: &str = ".config/milktea/config.yml";
const SYSTEM_CONFIG_FILE: &str = "/etc/milktea/config.yml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),
}

/// Runtime tuning knobs. Everything has a default; the config file is
/// optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilkteaConfig {
    /// Overrides the per-user cache root (`<user-cache>/lazy-milktea`).
    #[serde(default)]
    pub cache_root: Option<PathBuf>,

    /// Cache root byte ceiling before LRU eviction kicks in.
    #[serde(default = "default_cache_ceiling_bytes")]
    pub cache_ceiling_bytes: u64,

    /// Maximum stored postings entries per inverted index before it
    /// degrades to sampled mode.
    #[serde(default = "default_postings_budget")]
    pub postings_budget: usize,

    /// Every Nth ordinal is kept once a postings index is sampled.
    #[serde(default = "default_sample_step")]
    pub sample_step: usize,

    /// Minimum interval between progress events during a parse.
    #[serde(default = "default_progress_interval", with = "humantime_serde")]
    pub progress_interval: Duration,
}

fn default_cache_ceiling_bytes() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_postings_budget() -> usize {
    1 << 20
}

fn default_sample_step() -> usize {
    16
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for MilkteaConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            cache_ceiling_bytes: default_cache_ceiling_bytes(),
            postings_budget: default_postings_budget(),
            sample_step: default_sample_step(),
            progress_interval: default_progress_interval(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<MilkteaConfig, ConfigError> {
    let yaml = std::fs::read_to_string(path)?;
    let mut config: MilkteaConfig = serde_yaml::from_str(&yaml)?;
    // A `~/`-relative cache root in the file is resolved at load time so
    // the rest of the crate only ever sees concrete paths.
    if let Some(root) = config.cache_root.take() {
        config.cache_root = Some(untilde(&root));
    }
    Ok(config)
}

/// Loads the effective configuration: an explicit `--config` path wins,
/// then the per-user file, then the system file. No file (or an
/// unreadable one) means running on defaults, never an error.
pub fn load_or_default(explicit: Option<&Path>) -> MilkteaConfig {
    let Some(path) = locate(explicit) else {
        return MilkteaConfig::default();
    };
    match load_config(&path) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable config file");
            MilkteaConfig::default()
        }
    }
}

fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(untilde(path));
    }
    dirs::home_dir()
        .map(|home| home.join(USER_CONFIG_FILE))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG_FILE)))
        .find(|candidate| candidate.is_file())
}

/// Rewrites a leading `~` component to the home directory; anything else
/// (including `~user` forms) passes through untouched.
fn untilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_sane() {
        let config = MilkteaConfig::default();
        assert!(config.cache_root.is_none());
        assert_eq!(config.sample_step, 16);
        assert_eq!(config.progress_interval, Duration::from_millis(250));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cache_ceiling_bytes: 1024").unwrap();
        writeln!(file, "progress_interval: 1s").unwrap();
        file.flush().unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.cache_ceiling_bytes, 1024);
        assert_eq!(config.progress_interval, Duration::from_secs(1));
        assert_eq!(config.postings_budget, 1 << 20);
    }

    #[test]
    fn cache_root_tilde_resolves_against_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cache_root: ~/milktea-cache").unwrap();
        file.flush().unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.cache_root, Some(home.join("milktea-cache")));
    }

    #[test]
    fn untilde_leaves_other_paths_alone() {
        assert_eq!(
            untilde(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            untilde(Path::new("relative/path")),
            PathBuf::from("relative/path")
        );
    }

    #[test]
    fn explicit_path_wins_over_lookup() {
        let file = NamedTempFile::new().unwrap();
        let located = locate(Some(file.path())).unwrap();
        assert_eq!(located, file.path());
    }

    #[test]
    fn bad_yaml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "cache_ceiling_bytes: [not a number").unwrap();
        file.flush().unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{{broken yaml").unwrap();
        file.flush().unwrap();

        let config = load_or_default(Some(file.path()));
        assert!(config.cache_root.is_none());
        assert_eq!(config.sample_step, 16);
    }
}
