use crate::model::{AuditEvent, ConfigEntry, Namespace, Timestamp, ValueType};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// What a `SetConfig`-class mutation writes, before the store assigns the
/// version number.
#[derive(Debug, Clone)]
pub struct ConfigWrite {
    pub namespace: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub blob_id: Option<String>,
    pub value_type: ValueType,
    pub updated_at: Timestamp,
    pub updated_by: String,
}

/// The materialized read side. The applier is the only mutator; reads run
/// concurrently and the implementation arbitrates its own synchronization.
#[async_trait]
pub trait MaterializedStore: Send + Sync + std::fmt::Debug {
    /// Upsert by `(namespace, key)`. Returns the previous entry (if any)
    /// and the stored entry with its version assigned.
    async fn set_config(&self, write: ConfigWrite) -> Result<(Option<ConfigEntry>, ConfigEntry)>;

    /// Removes the entry. Deleting a non-existent entry is a no-op and
    /// returns `None`.
    async fn delete_config(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>>;

    async fn get_config(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>>;

    async fn list_configs(&self, namespace: &str) -> Result<Vec<ConfigEntry>>;

    /// Upsert by path; `created_at` of an existing namespace is preserved.
    async fn set_namespace(&self, namespace: Namespace) -> Result<(Option<Namespace>, Namespace)>;

    async fn delete_namespace(&self, path: &str) -> Result<Option<Namespace>>;

    async fn get_namespace(&self, path: &str) -> Result<Option<Namespace>>;

    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    /// Upsert by the event's deterministic id; idempotent on replay.
    async fn append_audit(&self, event: AuditEvent) -> Result<()>;

    /// Newest-first audit events for one namespace.
    async fn list_audit(&self, namespace: &str, limit: usize) -> Result<Vec<AuditEvent>>;

    // Bulk I/O for snapshot persist/restore.
    async fn all_configs(&self) -> Result<Vec<ConfigEntry>>;
    async fn all_namespaces(&self) -> Result<Vec<Namespace>>;
    async fn all_audit_events(&self) -> Result<Vec<AuditEvent>>;

    /// Restore drops all existing state first.
    async fn clear(&self) -> Result<()>;
    async fn insert_configs(&self, entries: Vec<ConfigEntry>) -> Result<()>;
    async fn insert_namespaces(&self, namespaces: Vec<Namespace>) -> Result<()>;
    async fn insert_audit_events(&self, events: Vec<AuditEvent>) -> Result<()>;
}

/// In-process store over concurrent maps. Individual operations observe a
/// consistent snapshot at each map-entry boundary, which is the contract
/// the applier needs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: DashMap<(String, String), ConfigEntry>,
    namespaces: DashMap<String, Namespace>,
    audit: DashMap<Uuid, AuditEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MaterializedStore for MemoryStore {
    async fn set_config(&self, write: ConfigWrite) -> Result<(Option<ConfigEntry>, ConfigEntry)> {
        let map_key = (write.namespace.clone(), write.key.clone());
        let entry = self.configs.entry(map_key);
        let old = match &entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Some(occupied.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(_) => None,
        };
        let stored = ConfigEntry {
            namespace: write.namespace,
            key: write.key,
            value: write.value,
            blob_id: write.blob_id,
            value_type: write.value_type,
            version: old.as_ref().map_or(0, |prev| prev.version) + 1,
            updated_at: write.updated_at,
            updated_by: write.updated_by,
        };
        entry.insert(stored.clone());
        Ok((old, stored))
    }

    async fn delete_config(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>> {
        Ok(self
            .configs
            .remove(&(namespace.to_string(), key.to_string()))
            .map(|(_, entry)| entry))
    }

    async fn get_config(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>> {
        Ok(self
            .configs
            .get(&(namespace.to_string(), key.to_string()))
            .map(|e| e.clone()))
    }

    async fn list_configs(&self, namespace: &str) -> Result<Vec<ConfigEntry>> {
        let mut entries: Vec<ConfigEntry> = self
            .configs
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn set_namespace(&self, namespace: Namespace) -> Result<(Option<Namespace>, Namespace)> {
        let entry = self.namespaces.entry(namespace.path.clone());
        let old = match &entry {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Some(occupied.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(_) => None,
        };
        let stored = Namespace {
            // First write wins for created_at; later upserts keep it.
            created_at: old
                .as_ref()
                .map_or(namespace.created_at, |prev| prev.created_at),
            ..namespace
        };
        entry.insert(stored.clone());
        Ok((old, stored))
    }

    async fn delete_namespace(&self, path: &str) -> Result<Option<Namespace>> {
        Ok(self.namespaces.remove(path).map(|(_, ns)| ns))
    }

    async fn get_namespace(&self, path: &str) -> Result<Option<Namespace>> {
        Ok(self.namespaces.get(path).map(|ns| ns.clone()))
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let mut namespaces: Vec<Namespace> =
            self.namespaces.iter().map(|ns| ns.value().clone()).collect();
        namespaces.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(namespaces)
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<()> {
        self.audit.insert(event.id, event);
        Ok(())
    }

    async fn list_audit(&self, namespace: &str, limit: usize) -> Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self
            .audit
            .iter()
            .filter(|e| e.namespace == namespace)
            .map(|e| e.value().clone())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        events.truncate(limit);
        Ok(events)
    }

    async fn all_configs(&self) -> Result<Vec<ConfigEntry>> {
        let mut entries: Vec<ConfigEntry> =
            self.configs.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key)));
        Ok(entries)
    }

    async fn all_namespaces(&self) -> Result<Vec<Namespace>> {
        self.list_namespaces().await
    }

    async fn all_audit_events(&self) -> Result<Vec<AuditEvent>> {
        let mut events: Vec<AuditEvent> = self.audit.iter().map(|e| e.value().clone()).collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn clear(&self) -> Result<()> {
        self.configs.clear();
        self.namespaces.clear();
        self.audit.clear();
        Ok(())
    }

    async fn insert_configs(&self, entries: Vec<ConfigEntry>) -> Result<()> {
        for entry in entries {
            self.configs
                .insert((entry.namespace.clone(), entry.key.clone()), entry);
        }
        Ok(())
    }

    async fn insert_namespaces(&self, namespaces: Vec<Namespace>) -> Result<()> {
        for ns in namespaces {
            self.namespaces.insert(ns.path.clone(), ns);
        }
        Ok(())
    }

    async fn insert_audit_events(&self, events: Vec<AuditEvent>) -> Result<()> {
        for event in events {
            self.audit.insert(event.id, event);
        }
        Ok(())
    }
}
