use enrolld_core::{AgentRecord, IpPredicate};

/// What a worker node does instead of mutating its own keystore (spec.md
/// §4.3 step 5, GLOSSARY "Cluster worker"): forward the already-validated
/// enrollment to the master verbatim and relay whatever id/key it assigns.
/// The real RPC transport (the cluster's own wire protocol) is outside
/// this spec's scope; `ClusterClient` is the seam a full deployment wires
/// up to it.
pub trait ClusterClient: Send + Sync {
    fn agent_add(&self, request: &ClusterAddRequest) -> Result<ClusterAddResponse, ClusterError>;
    fn agent_remove(&self, id: u32) -> Result<(), ClusterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAddRequest {
    pub name: String,
    pub ip: IpPredicate,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAddResponse {
    pub id: u32,
    pub raw_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("master is unreachable: {0}")]
    Unreachable(String),
    #[error("master rejected the request: {0}")]
    Rejected(String),
}

impl ClusterAddResponse {
    pub fn into_record(self, name: String, ip: IpPredicate, group: Option<String>) -> AgentRecord {
        AgentRecord::new(self.id, name, ip, self.raw_key, group)
    }
}

/// Standalone/master deployments never forward; this no-op client lets the
/// dispatcher treat cluster forwarding as always-present without an
/// `Option<dyn ClusterClient>` at every call site.
#[derive(Debug, Default)]
pub struct NoopClusterClient;

impl ClusterClient for NoopClusterClient {
    fn agent_add(&self, _request: &ClusterAddRequest) -> Result<ClusterAddResponse, ClusterError> {
        Err(ClusterError::Unreachable(
            "cluster forwarding is not configured on this node".to_string(),
        ))
    }

    fn agent_remove(&self, _id: u32) -> Result<(), ClusterError> {
        Err(ClusterError::Unreachable(
            "cluster forwarding is not configured on this node".to_string(),
        ))
    }
}
