use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::state::SharedState;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// A query for a single agent's key, arriving from whatever external
/// inventory system the `key_request` subsystem integrates with (spec.md
/// §1: "an external key-request subsystem... treated as an external
/// collaborator"). The original resolves these against `id` or `name`
/// (`-r`/`-a` modes); both are kept so a real source can use either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRequestQuery {
    ById(u32),
    ByName(String),
}

/// The seam a real deployment wires up to its key-request transport
/// (a UNIX socket or an external executable, in the original). Not
/// designed here: spec.md names the subsystem without specifying its
/// wire format, the same treatment `ClusterClient`/`DbClient` get for
/// their out-of-scope transports.
pub trait KeyRequestSource: Send + Sync {
    /// Blocks up to `timeout` for the next query, or returns `None` if
    /// none arrived (used to bound the worker's shutdown latency).
    fn poll(&self, timeout: Duration) -> Option<KeyRequestQuery>;
}

/// Never yields a query. The default for standalone/master deployments
/// that don't enable `key_request` at all.
#[derive(Debug, Default)]
pub struct NoopKeyRequestSource;

impl KeyRequestSource for NoopKeyRequestSource {
    fn poll(&self, timeout: Duration) -> Option<KeyRequestQuery> {
        std::thread::sleep(timeout);
        None
    }
}

/// The key-request backfiller (spec.md §2 component table row 4): looks
/// up the requested agent in the keystore and logs the resolution. A real
/// deployment's `KeyRequestSource` would also carry a reply channel back
/// to the external system; that channel's shape isn't specified by
/// spec.md, so this worker only performs the lookup side of the
/// contract.
pub struct KeyRequestWorker {
    pub state: Arc<SharedState>,
    pub source: Arc<dyn KeyRequestSource>,
}

impl KeyRequestWorker {
    pub fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            let Some(query) = self.source.poll(POLL_TIMEOUT) else {
                continue;
            };
            let guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
            let found = match &query {
                KeyRequestQuery::ById(id) => guard.keystore.find_by_id(*id).cloned(),
                KeyRequestQuery::ByName(name) => guard.keystore.find_by_name(name).cloned(),
            };
            drop(guard);
            match found {
                Some(record) => debug!(agent_id = record.id, name = %record.name, "key request resolved"),
                None => warn!(?query, "key request for unknown agent"),
            }
        }
    }
}
