use thiserror::Error;

/// Conflict and malformed-input errors surfaced by [`crate::Keystore`]
/// mutation operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeystoreError {
    #[error("id {0} already exists")]
    IdExists(u32),
    #[error("name/ip pair already registered")]
    NameIpExists,
    #[error("raw key already registered")]
    KeyExists,
    #[error("name is invalid")]
    InvalidName,
    #[error("source ip predicate is invalid")]
    InvalidIp,
    #[error("id {0} not found")]
    NotFound(u32),
    #[error("failed to read keystore file: {0}")]
    Io(String),
    #[error("malformed keystore line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Rejections produced by [`crate::EnrollmentValidator`]. Each variant
/// carries enough detail to render the wire reject reason (spec.md §4.3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid request for new agent")]
    Malformed,
    #[error("Invalid password")]
    BadPassword,
    #[error("Invalid name: {0}")]
    InvalidName(String),
    #[error("Invalid IP: {0}")]
    InvalidIp(String),
    #[error("source IP does not match the connection's peer address")]
    SourceMismatch,
    #[error("Duplicate agent name '{0}'")]
    DuplicateName(String),
    #[error("Duplicate agent IP '{0}'")]
    DuplicateIp(String),
    #[error("Duplicate key hash")]
    DuplicateKeyHash,
}

/// Startup-only configuration failures (spec.md §7 `ConfigError`).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid port {0}")]
    InvalidPort(u16),
    #[error("pool size must be greater than zero")]
    InvalidPoolSize,
    #[error("cluster role 'worker' requires master_addr to be set")]
    MissingMasterAddr,
}
