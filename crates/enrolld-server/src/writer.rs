use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use enrolld_core::PendingChange;

use crate::db::{DbClient, GroupSyncMode};
use crate::state::SharedState;

const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// The durable writer (spec.md C6): wakes on the journal condvar (or the
/// timeout, to notice shutdown), detaches the pending journal under the
/// lock, and replays it to the keystore file and the agents database
/// without holding the lock for the I/O itself.
pub struct Writer {
    pub state: Arc<SharedState>,
    pub keys_file: PathBuf,
    pub db: Arc<dyn DbClient>,
    /// Sync flag threaded into `set_agent_groups_csv` (spec.md §4.6 step 6
    /// "a sync flag derived from cluster membership"): set when this node
    /// is a cluster master, clear for a standalone manager. The writer
    /// never runs on a worker node.
    pub is_clustered: bool,
}

impl Writer {
    pub fn run(&self, running: &AtomicBool) {
        loop {
            let pending = {
                let guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
                let (mut guard, _timeout) = self
                    .state
                    .changed
                    .wait_timeout_while(guard, WAIT_TIMEOUT, |g| g.journal.is_empty())
                    .unwrap_or_else(|e| e.into_inner());
                guard.journal.take()
            };

            if !pending.is_empty() {
                self.replay(&pending);
                match self.persist_keystore() {
                    Ok(()) => {
                        if let Err(err) = self.persist_timestamps() {
                            warn!(%err, "failed to persist timestamp sidecar");
                        }
                    }
                    Err(err) => {
                        error!(%err, "failed to persist keystore file, changes remain queued for retry");
                        // Put the changes back so the next wakeup retries
                        // them rather than losing the write (spec.md §9:
                        // retry without dropping pending changes).
                        let mut guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
                        for change in pending {
                            guard.journal.push(change);
                        }
                    }
                }
            }

            if !running.load(Ordering::Acquire) {
                let remaining = {
                    let guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
                    guard.journal.is_empty()
                };
                if remaining {
                    return;
                }
            }
        }
    }

    fn replay(&self, pending: &[PendingChange]) {
        for change in pending {
            match change {
                PendingChange::Insert { id, name, ip, raw_key, group } => {
                    if let Err(err) = self.db.insert_agent(*id, name, ip, raw_key, group.as_deref()) {
                        warn!(agent_id = id, %err, "database insert failed");
                    }
                    if let Some(groups_csv) = group {
                        if let Err(err) =
                            self.db
                                .set_agent_groups_csv(*id, groups_csv, GroupSyncMode::Override, self.is_clustered)
                        {
                            warn!(agent_id = id, %err, "database group update failed");
                        }
                    }
                }
                PendingChange::Remove { id } => {
                    if let Err(err) = self.db.remove_agent(*id) {
                        warn!(agent_id = id, %err, "database removal failed");
                    }
                    if let Err(err) = self.db.query(&format!("remove {id}")) {
                        warn!(agent_id = id, %err, "database sweep query failed");
                    }
                }
            }
        }
    }

    /// Atomic rewrite: write to a temp file in the same directory, fsync,
    /// then rename over the real path (spec.md §4.6 "atomic rewrite").
    fn persist_keystore(&self) -> std::io::Result<()> {
        let snapshot = {
            let guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
            guard.keystore.snapshot()
        };

        let tmp_path = tmp_path_for(&self.keys_file);
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            snapshot.serialize(&mut writer)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.keys_file)?;
        info!(path = %self.keys_file.display(), "keystore persisted");
        Ok(())
    }

    /// Rewrites the `id timestamp` sidecar the force-policy time
    /// thresholds are checked against (spec.md §4.6 step 5; original
    /// `OS_WriteTimestamps`/`agents-timestamp`). Same snapshot, same
    /// write-to-temp-then-rename atomicity as the keystore file itself.
    fn persist_timestamps(&self) -> std::io::Result<()> {
        let snapshot = {
            let guard = self.state.guarded.lock().unwrap_or_else(|e| e.into_inner());
            guard.keystore.snapshot()
        };

        let sidecar_path = timestamps_path_for(&self.keys_file);
        let tmp_path = tmp_path_for(&sidecar_path);
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            for record in snapshot.iter_active() {
                writeln!(writer, "{} {}", record.id_str(), record.created_at)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &sidecar_path)?;
        Ok(())
    }
}

fn timestamps_path_for(keys_file: &Path) -> PathBuf {
    keys_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("agents-timestamp")
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDbClient;
    use enrolld_core::{AgentRecord, IpPredicate, Keystore};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn persists_pending_insert_to_disk() {
        let dir = std::env::temp_dir().join(format!("enrolld-writer-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let keys_file = dir.join("client.keys");

        let mut keystore = Keystore::new();
        let id = keystore
            .add(AgentRecord::new(
                0,
                "alpha".into(),
                IpPredicate::Any,
                "rawkey".into(),
                None,
            ))
            .unwrap();

        let state = Arc::new(SharedState::new(keystore));
        {
            let mut guard = state.guarded.lock().unwrap();
            guard.journal.push(PendingChange::insert(
                id,
                "alpha".into(),
                IpPredicate::Any,
                "rawkey".into(),
                None,
            ));
        }

        let writer = Writer {
            state: state.clone(),
            keys_file: keys_file.clone(),
            db: Arc::new(InMemoryDbClient::new()),
            is_clustered: false,
        };

        let running = AtomicBool::new(false);
        writer.run(&running);

        let text = std::fs::read_to_string(&keys_file).unwrap();
        assert!(text.contains("alpha"));
    }
}
