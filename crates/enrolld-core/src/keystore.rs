use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, Write};

use sha2::{Digest, Sha256};

use crate::error::KeystoreError;
use crate::record::{AgentRecord, IpPredicate};

/// Reason a `Keystore::add` call was refused. Distinct from
/// [`ValidationError`](crate::ValidationError): this is the *keystore's*
/// own invariant enforcement (spec.md §4.1), which the validator consults
/// before it ever constructs a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    IdExists,
    NameIpExists,
    KeyExists,
    InvalidName,
    InvalidIp,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IdExists => "id_exists",
            Self::NameIpExists => "name_ip_exists",
            Self::KeyExists => "key_exists",
            Self::InvalidName => "invalid_name",
            Self::InvalidIp => "invalid_ip",
        };
        f.write_str(s)
    }
}

pub fn hash_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// In-memory table of [`AgentRecord`]s with the three secondary indices
/// spec.md §3 names: by name, by ip-predicate (keyed together with name,
/// since uniqueness is defined over the pair), and by raw-key hash.
///
/// `Keystore` holds no lock of its own; `enrolld-server` wraps one instance
/// in a `Mutex` and is the only caller that mutates it.
#[derive(Debug, Clone, Default)]
pub struct Keystore {
    records: HashMap<u32, AgentRecord>,
    by_name_ip: HashMap<(String, String), u32>,
    by_key_hash: HashMap<String, u32>,
    next_id_hint: u32,
}

impl Keystore {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            by_name_ip: HashMap::new(),
            by_key_hash: HashMap::new(),
            next_id_hint: 1,
        }
    }

    /// Parses the canonical `id name ip rawkey[ #comment]` line format,
    /// one record per line, `!`-prefixed lines marking removed records.
    /// A leading run of `#`-prefixed lines is treated as a file header and
    /// discarded. When `clear_removed` is set, removed records are not
    /// retained in the returned keystore at all.
    pub fn load<R: BufRead>(reader: R, clear_removed: bool) -> Result<Self, KeystoreError> {
        let mut store = Self::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| KeystoreError::Io(e.to_string()))?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (removed, body) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            if removed && clear_removed {
                continue;
            }
            let record = parse_line(idx + 1, body, removed)?;
            store.insert_loaded(record);
        }
        tracing::debug!(records = store.records.len(), clear_removed, "keystore loaded");
        Ok(store)
    }

    fn insert_loaded(&mut self, record: AgentRecord) {
        if !record.removed {
            self.by_name_ip
                .insert((record.name.clone(), record.ip.to_string()), record.id);
            self.by_key_hash
                .insert(hash_key(&record.raw_key), record.id);
        }
        if record.id >= self.next_id_hint {
            self.next_id_hint = record.id.wrapping_add(1).max(1);
        }
        self.records.insert(record.id, record);
    }

    /// Serializes in canonical form: a single header comment followed by
    /// one line per record (removed records prefixed with `!`).
    pub fn serialize<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writeln!(writer, "# Agent keys database")?;
        let mut ids: Vec<&u32> = self.records.keys().collect();
        ids.sort();
        for id in ids {
            let record = &self.records[id];
            let prefix = if record.removed { "!" } else { "" };
            writeln!(
                writer,
                "{prefix}{} {} {} {}",
                record.id_str(),
                record.name,
                record.ip,
                record.raw_key
            )?;
        }
        Ok(())
    }

    /// Assigns `max(existing) + 1`, wrapping past `u32::MAX` back to `1`
    /// and probing forward past any id still occupied by a non-removed
    /// record (spec.md §4.1 "wrap protection").
    fn next_id(&self) -> u32 {
        let mut candidate = self.next_id_hint.max(1);
        loop {
            if !self.records.contains_key(&candidate) {
                return candidate;
            }
            candidate = if candidate == u32::MAX { 1 } else { candidate + 1 };
        }
    }

    /// Enforces the uniqueness invariants of spec.md §3 and assigns an id.
    /// `record.id` is ignored on input and overwritten with the assigned
    /// id; callers construct the record with a placeholder id (e.g. `0`).
    pub fn add(&mut self, mut record: AgentRecord) -> Result<u32, ConflictKind> {
        if record.name.is_empty() || record.name.len() > 128 {
            return Err(ConflictKind::InvalidName);
        }
        let name_ip_key = (record.name.clone(), record.ip.to_string());
        if self.find_by_name_ip(&record.name, &record.ip).is_some() {
            return Err(ConflictKind::NameIpExists);
        }
        let key_hash = hash_key(&record.raw_key);
        if self.by_key_hash.contains_key(&key_hash) {
            return Err(ConflictKind::KeyExists);
        }

        let id = self.next_id();
        record.id = id;
        self.by_name_ip.insert(name_ip_key, id);
        self.by_key_hash.insert(key_hash, id);
        self.next_id_hint = if id == u32::MAX { 1 } else { id + 1 };
        self.records.insert(id, record);
        Ok(id)
    }

    /// Marks a record removed (lazy tombstone) and drops it from the
    /// secondary indices so the name/ip/key become available for reuse.
    pub fn remove(&mut self, id: u32) -> Option<AgentRecord> {
        let record = self.records.get_mut(&id)?;
        if record.removed {
            return None;
        }
        record.removed = true;
        let key_hash = hash_key(&record.raw_key);
        let name_ip_key = (record.name.clone(), record.ip.to_string());
        self.by_name_ip.remove(&name_ip_key);
        self.by_key_hash.remove(&key_hash);
        Some(record.clone())
    }

    /// Rolls back an `add` that could not be delivered to the agent
    /// (spec.md §9: rollback by id, never by position in any list).
    pub fn remove_by_id_physically(&mut self, id: u32) -> Option<AgentRecord> {
        let record = self.records.remove(&id)?;
        let name_ip_key = (record.name.clone(), record.ip.to_string());
        self.by_name_ip.remove(&name_ip_key);
        self.by_key_hash.remove(&hash_key(&record.raw_key));
        Some(record)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&AgentRecord> {
        self.records.get(&id)
    }

    pub fn find_by_name_ip(&self, name: &str, ip: &IpPredicate) -> Option<&AgentRecord> {
        self.by_name_ip
            .get(&(name.to_string(), ip.to_string()))
            .and_then(|id| self.records.get(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&AgentRecord> {
        self.records
            .values()
            .filter(|r| !r.removed)
            .find(|r| r.name == name)
    }

    pub fn find_by_ip(&self, ip: &IpPredicate) -> Option<&AgentRecord> {
        if matches!(ip, IpPredicate::Any) {
            return None;
        }
        self.records
            .values()
            .filter(|r| !r.removed)
            .find(|r| &r.ip == ip)
    }

    pub fn find_by_key_hash(&self, key_hash: &str) -> Option<&AgentRecord> {
        self.by_key_hash.get(key_hash).and_then(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.records.values().filter(|r| !r.removed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deep, independent copy suitable for background serialization
    /// without holding the keystore lock (spec.md §4.1 `snapshot`).
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    /// Non-removed records in ascending id order, for the writer's
    /// timestamp-sidecar rewrite (spec.md §4.6 step 5).
    pub fn iter_active(&self) -> impl Iterator<Item = &AgentRecord> {
        let mut ids: Vec<&u32> = self.records.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(move |id| &self.records[id])
            .filter(|r| !r.removed)
    }
}

fn parse_line(line_no: usize, body: &str, removed: bool) -> Result<AgentRecord, KeystoreError> {
    let mut fields = body.splitn(4, ' ');
    let id_str = fields.next().ok_or_else(|| KeystoreError::Parse {
        line: line_no,
        reason: "missing id field".into(),
    })?;
    let name = fields.next().ok_or_else(|| KeystoreError::Parse {
        line: line_no,
        reason: "missing name field".into(),
    })?;
    let ip_str = fields.next().ok_or_else(|| KeystoreError::Parse {
        line: line_no,
        reason: "missing ip field".into(),
    })?;
    let rest = fields.next().ok_or_else(|| KeystoreError::Parse {
        line: line_no,
        reason: "missing key field".into(),
    })?;
    // A trailing ` #comment` is allowed and discarded.
    let raw_key = rest.split(" #").next().unwrap_or(rest).trim().to_string();

    let id: u32 = id_str.parse().map_err(|_| KeystoreError::Parse {
        line: line_no,
        reason: format!("invalid id '{id_str}'"),
    })?;
    let ip = IpPredicate::parse(ip_str).ok_or_else(|| KeystoreError::Parse {
        line: line_no,
        reason: format!("invalid ip '{ip_str}'"),
    })?;

    Ok(AgentRecord {
        id,
        name: name.to_string(),
        ip,
        raw_key,
        created_at: 0,
        group: None,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_record(name: &str, ip: &str, key: &str) -> AgentRecord {
        AgentRecord::new(0, name.to_string(), IpPredicate::parse(ip).unwrap(), key.to_string(), None)
    }

    #[test]
    fn add_assigns_monotonic_ids() {
        let mut ks = Keystore::new();
        let a = ks.add(new_record("alpha", "any", "keyA")).unwrap();
        let b = ks.add(new_record("beta", "any", "keyB")).unwrap();
        assert!(b > a);
        assert_eq!(ks.len(), 2);
    }

    #[test]
    fn add_rejects_duplicate_name_ip() {
        let mut ks = Keystore::new();
        ks.add(new_record("alpha", "any", "keyA")).unwrap();
        let err = ks.add(new_record("alpha", "any", "keyB")).unwrap_err();
        assert_eq!(err, ConflictKind::NameIpExists);
    }

    #[test]
    fn add_rejects_duplicate_key() {
        let mut ks = Keystore::new();
        ks.add(new_record("alpha", "any", "samekey")).unwrap();
        let err = ks.add(new_record("beta", "any", "samekey")).unwrap_err();
        assert_eq!(err, ConflictKind::KeyExists);
    }

    #[test]
    fn remove_frees_name_ip_and_key_for_reuse() {
        let mut ks = Keystore::new();
        let id = ks.add(new_record("alpha", "any", "keyA")).unwrap();
        ks.remove(id).unwrap();
        assert_eq!(ks.len(), 0);
        // Name and key are free again.
        ks.add(new_record("alpha", "any", "keyA")).unwrap();
        assert_eq!(ks.len(), 1);
    }

    #[test]
    fn removed_records_are_retained_unless_cleared_at_load() {
        let mut ks = Keystore::new();
        let id = ks.add(new_record("alpha", "any", "keyA")).unwrap();
        ks.remove(id).unwrap();
        let mut buf = Vec::new();
        ks.serialize(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains(&format!("!{:03}", id)));

        let reloaded = Keystore::load(Cursor::new(text.as_bytes()), false).unwrap();
        assert_eq!(reloaded.records.len(), 1);

        let cleared = Keystore::load(Cursor::new(text.as_bytes()), true).unwrap();
        assert_eq!(cleared.records.len(), 0);
    }

    #[test]
    fn load_then_serialize_round_trip_is_byte_identical() {
        let mut ks = Keystore::new();
        ks.add(new_record("alpha", "any", "keyA")).unwrap();
        ks.add(new_record("beta", "10.0.0.1", "keyB")).unwrap();
        let id = ks.add(new_record("gamma", "10.0.0.2", "keyC")).unwrap();
        ks.remove(id).unwrap();

        let mut first = Vec::new();
        ks.serialize(&mut first).unwrap();

        let reloaded = Keystore::load(Cursor::new(first.clone()), false).unwrap();
        let mut second = Vec::new();
        reloaded.serialize(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn next_id_wraps_and_skips_occupied_slots() {
        let mut ks = Keystore::new();
        ks.next_id_hint = u32::MAX;
        let id = ks.add(new_record("alpha", "any", "keyA")).unwrap();
        assert_eq!(id, u32::MAX);
        let next = ks.add(new_record("beta", "any", "keyB")).unwrap();
        assert_eq!(next, 1);
    }

    #[test]
    fn rollback_by_id_removes_only_the_named_record() {
        let mut ks = Keystore::new();
        let keep = ks.add(new_record("alpha", "any", "keyA")).unwrap();
        let drop_id = ks.add(new_record("beta", "any", "keyB")).unwrap();
        ks.remove_by_id_physically(drop_id);
        assert!(ks.find_by_id(drop_id).is_none());
        assert!(ks.find_by_id(keep).is_some());
        assert_eq!(ks.len(), 1);
    }
}
