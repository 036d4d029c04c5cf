use std::sync::{Condvar, Mutex};

use enrolld_core::{Keystore, PendingJournal};

/// The keystore and its pending-change journal share a single lock
/// (spec.md §4.1/§4.2: "one mutex guards the table and its journal
/// together so a dispatcher's `add`+journal-push is atomic from the
/// writer's point of view"). `changed` wakes the writer thread; dispatcher
/// workers never wait on it themselves.
pub struct SharedState {
    pub guarded: Mutex<Guarded>,
    pub changed: Condvar,
}

pub struct Guarded {
    pub keystore: Keystore,
    pub journal: PendingJournal,
}

impl SharedState {
    pub fn new(keystore: Keystore) -> Self {
        Self {
            guarded: Mutex::new(Guarded {
                keystore,
                journal: PendingJournal::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Notifies the writer thread that new pending changes are available.
    pub fn notify_writer(&self) {
        self.changed.notify_one();
    }
}
