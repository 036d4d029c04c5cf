use enrolld_core::IpPredicate;

/// How a group assignment is applied to an existing row (spec.md §4.6
/// step 6 "group-assignment RPC with override semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSyncMode {
    Override,
    Append,
}

/// The external agents database spec.md §4.6 replays inserts/removals
/// into, kept separate from the keystore file (GLOSSARY "Agents
/// database"). `enrolld-core` has no notion of this store at all: it is
/// an ambient collaborator the durable writer talks to after every
/// keystore rewrite, analogous to how the original shells out to
/// `wdb`/`global.db`.
pub trait DbClient: Send + Sync {
    fn insert_agent(&self, id: u32, name: &str, ip: &IpPredicate, key: &str, group: Option<&str>) -> Result<(), DbError>;
    fn set_agent_groups_csv(
        &self,
        id: u32,
        groups_csv: &str,
        mode: GroupSyncMode,
        sync_state: bool,
    ) -> Result<(), DbError>;
    fn remove_agent(&self, id: u32) -> Result<(), DbError>;
    /// Generic sweep query (spec.md §6: `query("remove <id>")`), fired
    /// after `remove_agent` during the writer's remove replay (spec.md
    /// §4.6 step 7).
    fn query(&self, command: &str) -> Result<(), DbError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbAgentRow {
    pub id: u32,
    pub name: String,
    pub ip: String,
    pub raw_key: String,
    pub groups_csv: Option<String>,
    pub synced: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("agent {0} not found")]
    NotFound(u32),
}

/// In-memory stand-in for the real agents database. A production
/// deployment replaces this with a client for whatever store backs the
/// cluster (spec.md explicitly lists it as an external collaborator, not
/// part of this module's scope).
#[derive(Debug, Default)]
pub struct InMemoryDbClient {
    rows: std::sync::Mutex<std::collections::HashMap<u32, DbAgentRow>>,
}

impl InMemoryDbClient {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DbClient for InMemoryDbClient {
    fn insert_agent(&self, id: u32, name: &str, ip: &IpPredicate, key: &str, group: Option<&str>) -> Result<(), DbError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.insert(
            id,
            DbAgentRow {
                id,
                name: name.to_string(),
                ip: ip.to_string(),
                raw_key: key.to_string(),
                groups_csv: group.map(|g| g.to_string()),
                synced: false,
            },
        );
        Ok(())
    }

    fn set_agent_groups_csv(
        &self,
        id: u32,
        groups_csv: &str,
        mode: GroupSyncMode,
        sync_state: bool,
    ) -> Result<(), DbError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let row = rows.get_mut(&id).ok_or(DbError::NotFound(id))?;
        row.groups_csv = Some(match mode {
            GroupSyncMode::Override => groups_csv.to_string(),
            GroupSyncMode::Append => match &row.groups_csv {
                Some(existing) if !existing.is_empty() => format!("{existing},{groups_csv}"),
                _ => groups_csv.to_string(),
            },
        });
        row.synced = sync_state;
        Ok(())
    }

    fn remove_agent(&self, id: u32) -> Result<(), DbError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.remove(&id);
        Ok(())
    }

    fn query(&self, command: &str) -> Result<(), DbError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = command.strip_prefix("remove ") {
            if let Ok(id) = id.trim().parse::<u32>() {
                rows.remove(&id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_remove_sweep_clears_the_row() {
        let db = InMemoryDbClient::new();
        db.insert_agent(1, "alpha", &IpPredicate::Any, "rawkey", Some("default")).unwrap();
        db.remove_agent(1).unwrap();
        db.query("remove 1").unwrap();
        assert!(db.rows.lock().unwrap().get(&1).is_none());
    }

    #[test]
    fn set_agent_groups_csv_override_replaces_existing() {
        let db = InMemoryDbClient::new();
        db.insert_agent(1, "alpha", &IpPredicate::Any, "rawkey", Some("default")).unwrap();
        db.set_agent_groups_csv(1, "web,db", GroupSyncMode::Override, true).unwrap();
        let rows = db.rows.lock().unwrap();
        let row = rows.get(&1).unwrap();
        assert_eq!(row.groups_csv.as_deref(), Some("web,db"));
        assert!(row.synced);
    }
}
