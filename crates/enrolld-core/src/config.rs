use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Cluster role: standalone manager, cluster master, or cluster worker
/// that forwards enrollment to the master (spec.md GLOSSARY).
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    #[default]
    Standalone,
    Master,
    Worker,
}

/// Force-policy thresholds governing re-enrollment over an existing
/// record (spec.md §4.3 step 4, GLOSSARY "Force policy"). Times are in
/// seconds; `None` disables that override path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForcePolicy {
    #[serde(default)]
    pub key_mismatch: bool,
    #[serde(default)]
    pub disconnected_time: Option<u64>,
    #[serde(default)]
    pub after_registration_time: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub role: ClusterRole,
    #[serde(default)]
    pub master_addr: Option<String>,
}

/// Toggle for the key-request backfiller (spec.md §1/§2: one of the four
/// cooperating workers, but named only as "an external key-request
/// subsystem" whose interface is not designed here). `enrolld-server`
/// starts the worker only when `enabled` is set; the source it polls is
/// an external collaborator (`enrolld_server::key_request::KeyRequestSource`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyRequestConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Top-level configuration, loaded from TOML and overridable by CLI flags
/// (spec.md §6 CLI surface; SPEC_FULL AMBIENT-CONFIG). `enrolld-core`
/// only owns the struct and its file loader; CLI-flag overlay happens in
/// `enrolld-server` where the flag definitions live.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub cert_path: PathBuf,
    #[serde(default)]
    pub key_path: PathBuf,
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
    #[serde(default = "default_cipher_list")]
    pub cipher_list: String,
    #[serde(default)]
    pub auto_negotiate: bool,
    #[serde(default)]
    pub verify_host: bool,
    #[serde(default)]
    pub force_source: bool,
    #[serde(default)]
    pub use_password: bool,
    #[serde(default)]
    pub password_file: Option<PathBuf>,
    #[serde(default = "default_keys_file")]
    pub keys_file: PathBuf,
    #[serde(default)]
    pub clear_removed: bool,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub force: ForcePolicy,
    #[serde(default)]
    pub manager_hostname: Option<String>,
    #[serde(default)]
    pub key_request: KeyRequestConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:1515".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_cipher_list() -> String {
    "HIGH:!ADH:!EXP:!MD5:!RC4:!3DES:!CAMELLIA:@STRENGTH".to_string()
}

fn default_keys_file() -> PathBuf {
    PathBuf::from("etc/client.keys")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("var/run")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
            cert_path: PathBuf::new(),
            key_path: PathBuf::new(),
            ca_path: None,
            cipher_list: default_cipher_list(),
            auto_negotiate: false,
            verify_host: false,
            force_source: false,
            use_password: false,
            password_file: None,
            keys_file: default_keys_file(),
            clear_removed: false,
            run_dir: default_run_dir(),
            group: None,
            cluster: ClusterConfig::default(),
            force: ForcePolicy::default(),
            manager_hostname: None,
            key_request: KeyRequestConfig::default(),
        }
    }
}

impl Config {
    /// Reads and validates a TOML config file. Missing files or bad values
    /// are `ConfigError`, fatal only at startup (spec.md §7).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if self.cluster.role == ClusterRole::Worker && self.cluster.master_addr.is_none() {
            return Err(ConfigError::MissingMasterAddr);
        }
        Ok(())
    }
}
