use crate::record::IpPredicate;

/// Snapshot of the fields the durable writer needs to replay a change to
/// disk and to the agents database (spec.md §3 `PendingChange`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    Insert {
        id: u32,
        name: String,
        ip: IpPredicate,
        raw_key: String,
        group: Option<String>,
    },
    Remove {
        id: u32,
    },
}

impl PendingChange {
    pub fn insert(id: u32, name: String, ip: IpPredicate, raw_key: String, group: Option<String>) -> Self {
        Self::Insert { id, name, ip, raw_key, group }
    }

    pub fn remove(id: u32) -> Self {
        Self::Remove { id }
    }
}

/// An append-only queue of [`PendingChange`]s with an owned cached tail,
/// so `push` stays O(1) without needing a shared pointer graph (spec.md
/// §4.2 / §9). Mutation happens under the keystore lock; the writer takes
/// the whole journal by `std::mem::take`, which is the Rust analogue of
/// the original's "swap both heads to null" ownership transfer.
#[derive(Debug, Clone, Default)]
pub struct PendingJournal {
    changes: Vec<PendingChange>,
}

impl PendingJournal {
    pub fn new() -> Self {
        Self { changes: Vec::new() }
    }

    pub fn push(&mut self, change: PendingChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Detaches the whole journal, leaving this instance empty. Call under
    /// the keystore lock; the returned `Vec` is then owned exclusively by
    /// the writer and may be replayed after the lock is released.
    pub fn take(&mut self) -> Vec<PendingChange> {
        std::mem::take(&mut self.changes)
    }
}
