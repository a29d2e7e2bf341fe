//! Authoritative resource state.

use fieldsync_protocol::{
    apply_patch, OperationId, Record, ResourceKey, ResourceSnapshot, SubmitResponse, Timestamp,
    Version,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

/// Versioned resources plus the outcome of every settled operation.
///
/// The store maintains:
/// - The current version and record of each live resource
/// - The last version of deleted resources, so ids are never reused
/// - Applied and rejected responses by operation id, for idempotent replay
/// - Per-type counters for assigned ids
pub struct ResourceStore {
    resources: RwLock<BTreeMap<ResourceKey, ResourceSnapshot>>,
    tombstones: RwLock<HashMap<ResourceKey, Version>>,
    settled: RwLock<HashMap<OperationId, SubmitResponse>>,
    counters: RwLock<HashMap<String, u64>>,
}

impl ResourceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(BTreeMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            settled: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the current state of a resource.
    pub fn get(&self, key: &ResourceKey) -> Option<ResourceSnapshot> {
        self.resources.read().get(key).cloned()
    }

    /// Live resources of one type.
    pub fn list(&self, resource_type: &str) -> Vec<ResourceSnapshot> {
        self.resources
            .read()
            .values()
            .filter(|s| s.key.resource_type == resource_type)
            .cloned()
            .collect()
    }

    /// Number of live resources.
    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    /// Returns true if no resource is live.
    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }

    /// Writes a full record, bumping the version past anything the key
    /// has had before.
    pub fn put(&self, key: ResourceKey, payload: Record) -> ResourceSnapshot {
        let mut resources = self.resources.write();
        let previous = resources
            .get(&key)
            .map(|s| s.version)
            .or_else(|| self.tombstones.read().get(&key).copied());
        let snapshot = ResourceSnapshot {
            key: key.clone(),
            version: previous.map_or(Version(1), Version::next),
            payload,
            updated_at: now_millis(),
        };
        self.tombstones.write().remove(&key);
        resources.insert(key, snapshot.clone());
        snapshot
    }

    /// Applies a patch to a live resource.
    pub fn patch(&self, key: &ResourceKey, patch: &Record) -> Option<ResourceSnapshot> {
        let current = self.get(key)?;
        Some(self.put(key.clone(), apply_patch(&current.payload, patch)))
    }

    /// Deletes a resource, returning the version the deletion produced.
    pub fn remove(&self, key: &ResourceKey) -> Option<Version> {
        let removed = self.resources.write().remove(key)?;
        let version = removed.version.next();
        self.tombstones.write().insert(key.clone(), version);
        Some(version)
    }

    /// Returns true if the key has ever been used.
    pub fn is_known(&self, key: &ResourceKey) -> bool {
        self.resources.read().contains_key(key) || self.tombstones.read().contains_key(key)
    }

    /// Allocates a fresh id for a resource type.
    pub fn assign_id(&self, resource_type: &str) -> String {
        let mut counters = self.counters.write();
        loop {
            let counter = counters.entry(resource_type.to_string()).or_insert(0);
            *counter += 1;
            let id = format!("{resource_type}-{counter}");
            if !self.is_known(&ResourceKey::new(resource_type, id.as_str())) {
                return id;
            }
        }
    }

    /// The recorded outcome of an operation, if it was settled before.
    pub fn settled(&self, operation_id: &OperationId) -> Option<SubmitResponse> {
        self.settled.read().get(operation_id).cloned()
    }

    /// Records the outcome of an operation.
    pub fn record_settled(&self, operation_id: OperationId, response: SubmitResponse) {
        self.settled.write().insert(operation_id, response);
    }

    /// Number of settled operations.
    pub fn settled_count(&self) -> usize {
        self.settled.read().len()
    }
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn versions_increase_across_delete() {
        let store = ResourceStore::new();
        let key = ResourceKey::new("farm-plot", "plot-1");

        assert_eq!(store.put(key.clone(), Record::new()).version, Version(1));
        assert_eq!(
            store.patch(&key, &record(json!({"acres": 2}))).unwrap().version,
            Version(2)
        );
        assert_eq!(store.remove(&key), Some(Version(3)));
        assert!(store.get(&key).is_none());
        assert!(store.is_known(&key));
        assert_eq!(store.put(key, Record::new()).version, Version(4));
    }

    #[test]
    fn assigned_ids_skip_used_keys() {
        let store = ResourceStore::new();
        store.put(ResourceKey::new("inspection", "inspection-1"), Record::new());
        assert_eq!(store.assign_id("inspection"), "inspection-2");
        assert_eq!(store.assign_id("inspection"), "inspection-3");
        assert_eq!(store.assign_id("farm-plot"), "farm-plot-1");
    }

    #[test]
    fn patch_of_missing_resource_is_none() {
        let store = ResourceStore::new();
        assert!(store
            .patch(&ResourceKey::new("farm-plot", "x"), &Record::new())
            .is_none());
    }
}
