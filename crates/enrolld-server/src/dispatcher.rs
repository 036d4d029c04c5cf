use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tracing::{debug, info, warn};

use enrolld_core::validator::EnrollmentOutcome;
use enrolld_core::{Config, EnrollmentValidator, PendingChange};
use enrolld_transport::{load_server_config, TlsSession, TransportError};

use crate::cluster::{ClusterAddRequest, ClusterClient};
use crate::queue::ClientQueue;
use crate::state::SharedState;

/// Requests larger than this are certainly not a well-formed enrollment
/// line; the original bounds the receive buffer the same way (spec.md
/// §4.5 step 3).
const MAX_REQUEST_LEN: usize = 65_536 + 4_096;
const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// One dispatcher worker (spec.md C5). `run` is the body every pool
/// thread executes until `running` is cleared; it owns no state beyond
/// what's passed in, so the pool is just N threads calling this function.
pub struct Dispatcher {
    pub validator: Arc<EnrollmentValidator>,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub state: Arc<SharedState>,
    pub queue: Arc<ClientQueue>,
    pub cluster: Arc<dyn ClusterClient>,
    pub verify_host: bool,
    pub is_worker: bool,
}

impl Dispatcher {
    pub fn run(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            let Some(handoff) = self.queue.pop_timed(QUEUE_POLL_TIMEOUT) else {
                continue;
            };
            let peer_addr = handoff.peer_addr;
            if let Err(err) = self.handle(handoff.stream, peer_addr.ip()) {
                debug!(%peer_addr, %err, "connection ended without enrollment");
            }
        }
    }

    fn handle(&self, stream: std::net::TcpStream, peer_ip: IpAddr) -> Result<(), TransportError> {
        let mut session = TlsSession::new(self.tls_config.clone(), stream)?;
        session.handshake()?;

        let raw_bytes = session.read_request(MAX_REQUEST_LEN)?;
        let raw = String::from_utf8_lossy(&raw_bytes);

        let now = now_unix();
        let outcome = {
            let mut guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());

            if self.verify_host {
                if let Some(cn) = session.peer_certificate_cn() {
                    if let Ok(request) = EnrollmentValidator::parse(&raw) {
                        if cn != request.name {
                            warn!(%peer_ip, cert_cn = %cn, requested = %request.name, "certificate CN mismatch");
                            return reject(&mut session, "Invalid certificate");
                        }
                    }
                } else {
                    warn!(%peer_ip, "verify_host enabled but peer presented no certificate");
                    return reject(&mut session, "Invalid certificate");
                }
            }

            match self.validator.validate(&raw, peer_ip, &guard.keystore, now) {
                Ok(outcome) => outcome,
                Err(reject_reason) => {
                    drop(guard);
                    return reject(&mut session, &reject_reason.reason);
                }
            }
        };

        if self.is_worker {
            return self.handle_worker_forward(&mut session, outcome);
        }

        self.handle_local_commit(&mut session, outcome, peer_ip)
    }

    fn handle_local_commit(
        &self,
        session: &mut TlsSession,
        outcome: EnrollmentOutcome,
        peer_ip: IpAddr,
    ) -> Result<(), TransportError> {

        let mut record = outcome.record;
        record.raw_key = generate_raw_key();

        let (new_id, old_id) = {
            let mut guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old_id) = outcome.remove_existing {
                guard.keystore.remove(old_id);
            }
            match guard.keystore.add(record.clone()) {
                Ok(id) => (id, outcome.remove_existing),
                Err(conflict) => {
                    warn!(%peer_ip, %conflict, "add raced with a concurrent enrollment");
                    drop(guard);
                    return reject(session, "Unable to add agent");
                }
            }
        };
        record.id = new_id;

        let response = format!(
            "OSSEC K:'{} {} {} {}'\n",
            record.id_str(),
            record.name,
            record.ip,
            record.raw_key
        );

        if let Err(err) = session.write_all(response.as_bytes()) {
            warn!(%peer_ip, agent_id = new_id, %err, "failed to deliver key, rolling back");
            let mut guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
            guard.keystore.remove_by_id_physically(new_id);
            return Err(err);
        }

        {
            let mut guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old_id) = old_id {
                guard.journal.push(PendingChange::remove(old_id));
            }
            guard.journal.push(PendingChange::insert(
                new_id,
                record.name.clone(),
                record.ip.clone(),
                record.raw_key.clone(),
                record.group.clone(),
            ));
            self.state.notify_writer();
        }

        info!(agent_id = new_id, name = %record.name, %peer_ip, "agent enrolled");
        Ok(())
    }

    /// Worker-node path (spec.md GLOSSARY "Cluster worker"): forward the
    /// already-validated request to the master verbatim. No local
    /// keystore mutation, no journal entry — the master owns persistence.
    fn handle_worker_forward(
        &self,
        session: &mut TlsSession,
        outcome: EnrollmentOutcome,
    ) -> Result<(), TransportError> {
        let record = outcome.record;
        let request = ClusterAddRequest {
            name: record.name.clone(),
            ip: record.ip.clone(),
            group: record.group.clone(),
        };

        match self.cluster.agent_add(&request) {
            Ok(response) => {
                let assigned = response.into_record(record.name, record.ip, record.group);
                // Verbatim per spec.md §4.5 step 5: the worker never
                // touches the keystore, so there is no on-disk grammar to
                // zero-pad for — forward the master's id exactly as given
                // (spec.md §8 S4: `7`, not `007`).
                let reply = format!(
                    "OSSEC K:'{} {} {} {}'\n",
                    assigned.id,
                    assigned.name,
                    assigned.ip,
                    assigned.raw_key
                );
                session.write_all(reply.as_bytes())
            }
            Err(err) => {
                warn!(%err, "master rejected or was unreachable for a forwarded enrollment");
                reject(session, "Unable to add agent")
            }
        }
    }
}

fn reject(session: &mut TlsSession, reason: &str) -> Result<(), TransportError> {
    session.write_all(format!("ERROR: {reason}\n").as_bytes())?;
    session.write_all(b"ERROR: Unable to add agent\n")?;
    Ok(())
}

fn generate_raw_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn build_tls_config(config: &Config) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    load_server_config(
        &config.cert_path,
        &config.key_path,
        config.ca_path.as_deref(),
        config.auto_negotiate,
    )
}
