use thiserror::Error;

use crate::cluster::ClusterError;
use crate::db::DbError;
use crate::privdrop::PrivDropError;
use enrolld_core::ConfigError;
use enrolld_transport::TransportError;

/// Top-level error `main` matches on to pick an exit code (spec.md §6
/// "exit codes": 0 clean shutdown, 1 fatal startup/runtime error).
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Storage(#[from] DbError),
    /// Privilege-drop failure is fatal (spec.md §7): a requested `group`
    /// the process cannot drop to must stop startup, not just warn.
    #[error(transparent)]
    PrivDrop(#[from] PrivDropError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}
