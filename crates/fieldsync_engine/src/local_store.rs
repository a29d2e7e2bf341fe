//! Durable local store of cached resources.
//!
//! Each entry keeps the last authoritative record (`base`) next to the
//! optimistic `view` the UI reads: the base with every pending local
//! operation replayed on top.

use crate::error::SyncResult;
use fieldsync_protocol::{
    apply_patch, from_cbor, to_cbor, Operation, OperationKind, Record, ResourceKey,
    ResourceSnapshot, Timestamp, Version,
};
use fieldsync_storage::{InMemoryBackend, Journal, StorageBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// A cached resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResource {
    /// Resource identity.
    pub key: ResourceKey,
    /// Last known authoritative version; `None` if the server has not
    /// seen the resource.
    pub version: Option<Version>,
    /// Last known authoritative record.
    pub base: Option<Record>,
    /// Optimistic record including pending local changes; `None` if
    /// deleted.
    pub view: Option<Record>,
    /// When the entry was last written.
    pub cached_at: Timestamp,
}

impl CachedResource {
    /// Returns true if the optimistic view differs from the server's.
    pub fn has_local_changes(&self) -> bool {
        self.view != self.base
    }

    /// Returns true if the resource is deleted in the optimistic view.
    pub fn is_deleted(&self) -> bool {
        self.view.is_none()
    }

    fn is_fresh(&self, max_age: Duration, now: Timestamp) -> bool {
        let max_age = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        now.saturating_sub(self.cached_at) <= max_age
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoreRecord {
    Put(CachedResource),
    Remove(ResourceKey),
    LastSync(Timestamp),
}

impl StoreRecord {
    fn kind(&self) -> u8 {
        match self {
            StoreRecord::Put(_) => 1,
            StoreRecord::Remove(_) => 2,
            StoreRecord::LastSync(_) => 3,
        }
    }
}

/// Name of a resource journal record kind, for diagnostics.
pub fn store_record_name(kind: u8) -> &'static str {
    match kind {
        1 => "put",
        2 => "remove",
        3 => "last-sync",
        _ => "unknown",
    }
}

struct StoreState {
    journal: Journal,
    journal_records: usize,
    entries: BTreeMap<ResourceKey, CachedResource>,
    last_sync_at: Option<Timestamp>,
}

impl StoreState {
    fn write(&mut self, record: StoreRecord) -> SyncResult<()> {
        let payload = to_cbor(&record)?;
        self.journal.append(record.kind(), &payload)?;
        self.journal_records += 1;
        self.apply(record);
        Ok(())
    }

    fn apply(&mut self, record: StoreRecord) {
        match record {
            StoreRecord::Put(entry) => {
                self.entries.insert(entry.key.clone(), entry);
            }
            StoreRecord::Remove(key) => {
                self.entries.remove(&key);
            }
            StoreRecord::LastSync(at) => self.last_sync_at = Some(at),
        }
    }
}

/// Replays operations over an authoritative record.
pub fn replay(base: Option<&Record>, ops: &[Operation]) -> Option<Record> {
    let mut view = base.cloned();
    for op in ops {
        view = apply_operation(view, op);
    }
    view
}

fn apply_operation(view: Option<Record>, op: &Operation) -> Option<Record> {
    match op.kind {
        OperationKind::Create => op.payload.clone(),
        OperationKind::Update => {
            let current = view.or_else(|| op.base_payload.clone()).unwrap_or_default();
            match &op.payload {
                Some(patch) => Some(apply_patch(&current, patch)),
                None => Some(current),
            }
        }
        OperationKind::Delete => None,
    }
}

/// The device's durable cache of resources.
pub struct LocalStore {
    state: Mutex<StoreState>,
}

impl LocalStore {
    /// Opens a store over a backend, replaying its journal.
    pub fn open(backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        let mut journal = Journal::open(backend)?;
        let entries = journal.recover()?;

        let mut state = StoreState {
            journal,
            journal_records: 0,
            entries: BTreeMap::new(),
            last_sync_at: None,
        };
        for entry in entries {
            let record: StoreRecord = from_cbor(&entry.payload)?;
            state.apply(record);
            state.journal_records += 1;
        }
        debug!(resources = state.entries.len(), "local store replayed");

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Creates an empty store that lives in memory.
    pub fn in_memory() -> SyncResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()))
    }

    /// Applies a queued operation to the optimistic view.
    pub fn apply_local(&self, op: &Operation, now: Timestamp) -> SyncResult<()> {
        let key = op.key();
        let mut state = self.state.lock();
        let entry = match state.entries.get(&key) {
            Some(existing) => CachedResource {
                view: apply_operation(existing.view.clone(), op),
                cached_at: now,
                ..existing.clone()
            },
            None => CachedResource {
                key: key.clone(),
                version: op.base_version,
                base: op.base_payload.clone(),
                view: apply_operation(op.base_payload.clone(), op),
                cached_at: now,
            },
        };
        state.write(StoreRecord::Put(entry))
    }

    /// Records the server's state of a resource and recomputes the view
    /// from it and the operations still queued locally.
    ///
    /// With no server state and no local operations the entry is dropped.
    pub fn apply_authoritative(
        &self,
        key: &ResourceKey,
        current: Option<(Version, Record)>,
        local_ops: &[Operation],
        now: Timestamp,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        if current.is_none() && local_ops.is_empty() {
            if state.entries.contains_key(key) {
                state.write(StoreRecord::Remove(key.clone()))?;
            }
            return Ok(());
        }

        let (version, base) = match current {
            Some((version, payload)) => (Some(version), Some(payload)),
            None => (None, None),
        };
        let view = replay(base.as_ref(), local_ops);
        state.write(StoreRecord::Put(CachedResource {
            key: key.clone(),
            version,
            base,
            view,
            cached_at: now,
        }))
    }

    /// Same as [`LocalStore::apply_authoritative`] for a fetched snapshot.
    pub fn apply_snapshot(
        &self,
        key: &ResourceKey,
        snapshot: Option<&ResourceSnapshot>,
        local_ops: &[Operation],
        now: Timestamp,
    ) -> SyncResult<()> {
        let current = snapshot.map(|s| (s.version, s.payload.clone()));
        self.apply_authoritative(key, current, local_ops, now)
    }

    /// Recomputes the view of `key` from its cached base.
    pub fn refresh_view(
        &self,
        key: &ResourceKey,
        local_ops: &[Operation],
        now: Timestamp,
    ) -> SyncResult<()> {
        let current = {
            let state = self.state.lock();
            state
                .entries
                .get(key)
                .and_then(|e| Some((e.version?, e.base.clone()?)))
        };
        self.apply_authoritative(key, current, local_ops, now)
    }

    /// Drops an entry.
    pub fn remove(&self, key: &ResourceKey) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.entries.contains_key(key) {
            state.write(StoreRecord::Remove(key.clone()))?;
        }
        Ok(())
    }

    /// Returns an entry regardless of age.
    pub fn get(&self, key: &ResourceKey) -> Option<CachedResource> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Returns an entry if it was written within `max_age`, or if it
    /// carries local changes that only exist on this device.
    pub fn get_fresh(
        &self,
        key: &ResourceKey,
        max_age: Duration,
        now: Timestamp,
    ) -> Option<CachedResource> {
        self.get(key)
            .filter(|e| e.has_local_changes() || e.is_fresh(max_age, now))
    }

    /// Live resources of one type, ordered by id.
    pub fn list(&self, resource_type: &str) -> Vec<CachedResource> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.key.resource_type == resource_type && !e.is_deleted())
            .cloned()
            .collect()
    }

    /// Every entry, including local deletions.
    pub fn entries(&self) -> Vec<CachedResource> {
        self.state.lock().entries.values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns true if the store has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops entries older than `max_age` that have no local changes and
    /// are not in `pinned`. Returns how many were dropped.
    pub fn evict_stale(
        &self,
        max_age: Duration,
        now: Timestamp,
        pinned: &BTreeSet<ResourceKey>,
    ) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let stale: Vec<_> = state
            .entries
            .values()
            .filter(|e| {
                !e.has_local_changes() && !e.is_fresh(max_age, now) && !pinned.contains(&e.key)
            })
            .map(|e| e.key.clone())
            .collect();
        for key in &stale {
            state.write(StoreRecord::Remove(key.clone()))?;
        }
        Ok(stale.len())
    }

    /// Persists the time of the last completed sync pass.
    pub fn set_last_sync(&self, at: Timestamp) -> SyncResult<()> {
        self.state.lock().write(StoreRecord::LastSync(at))
    }

    /// Time of the last completed sync pass.
    pub fn last_sync_at(&self) -> Option<Timestamp> {
        self.state.lock().last_sync_at
    }

    /// Number of records currently in the journal.
    pub fn journal_records(&self) -> usize {
        self.state.lock().journal_records
    }

    /// Rewrites the journal as one record per entry.
    pub fn compact(&self) -> SyncResult<()> {
        let mut state = self.state.lock();
        let mut records: Vec<StoreRecord> = state
            .entries
            .values()
            .cloned()
            .map(StoreRecord::Put)
            .collect();
        if let Some(at) = state.last_sync_at {
            records.push(StoreRecord::LastSync(at));
        }

        let mut framed = Vec::with_capacity(records.len());
        for record in &records {
            framed.push((record.kind(), to_cbor(record)?));
        }
        state.journal.replace(&framed)?;
        state.journal_records = records.len();
        debug!(records = records.len(), "resource journal compacted");
        Ok(())
    }

    /// Compacts when more than `threshold` journal records are superseded.
    pub fn maybe_compact(&self, threshold: usize) -> SyncResult<bool> {
        let superseded = {
            let state = self.state.lock();
            state
                .journal_records
                .saturating_sub(state.entries.len() + 1)
        };
        if superseded > threshold {
            self.compact()?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{OperationId, OperationInput};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    fn op(input: OperationInput, seq: u64) -> Operation {
        Operation::from_input(input, OperationId::new(), seq, 0)
    }

    fn key() -> ResourceKey {
        ResourceKey::new("farmer-record", "f-1")
    }

    #[test]
    fn local_update_builds_on_base() {
        let store = LocalStore::in_memory().unwrap();
        let base = record(json!({"name": "Amina", "status": "pending"}));
        let update = op(
            OperationInput::update(
                "farmer-record",
                "f-1",
                record(json!({"status": "active"})),
                Some(Version(3)),
                Some(base.clone()),
            ),
            1,
        );

        store.apply_local(&update, 10).unwrap();
        let entry = store.get(&key()).unwrap();
        assert_eq!(entry.version, Some(Version(3)));
        assert_eq!(entry.base, Some(base));
        assert_eq!(
            entry.view,
            Some(record(json!({"name": "Amina", "status": "active"})))
        );
        assert!(entry.has_local_changes());
    }

    #[test]
    fn authoritative_state_replays_remaining_ops() {
        let store = LocalStore::in_memory().unwrap();
        let pending = op(
            OperationInput::update(
                "farmer-record",
                "f-1",
                record(json!({"phone": "0700"})),
                Some(Version(1)),
                None,
            ),
            2,
        );

        store
            .apply_authoritative(
                &key(),
                Some((Version(2), record(json!({"name": "Amina"})))),
                &[pending],
                50,
            )
            .unwrap();

        let entry = store.get(&key()).unwrap();
        assert_eq!(entry.version, Some(Version(2)));
        assert_eq!(
            entry.view,
            Some(record(json!({"name": "Amina", "phone": "0700"})))
        );
    }

    #[test]
    fn authoritative_absence_drops_entry() {
        let store = LocalStore::in_memory().unwrap();
        store
            .apply_authoritative(&key(), Some((Version(1), Record::new())), &[], 1)
            .unwrap();
        store.apply_authoritative(&key(), None, &[], 2).unwrap();
        assert!(store.get(&key()).is_none());
    }

    #[test]
    fn local_delete_hides_from_list() {
        let store = LocalStore::in_memory().unwrap();
        store
            .apply_authoritative(&key(), Some((Version(1), Record::new())), &[], 1)
            .unwrap();
        let delete = op(
            OperationInput::delete("farmer-record", "f-1", Some(Version(1)), None),
            1,
        );
        store.apply_local(&delete, 2).unwrap();

        assert!(store.list("farmer-record").is_empty());
        assert!(store.get(&key()).unwrap().is_deleted());
    }

    #[test]
    fn freshness_and_eviction() {
        let store = LocalStore::in_memory().unwrap();
        let day = Duration::from_secs(86_400);
        store
            .apply_authoritative(&key(), Some((Version(1), Record::new())), &[], 0)
            .unwrap();
        let other = ResourceKey::new("farm-plot", "p-1");
        store
            .apply_authoritative(&other, Some((Version(1), Record::new())), &[], 0)
            .unwrap();

        assert!(store.get_fresh(&key(), day, 1_000).is_some());
        assert!(store.get_fresh(&key(), day, 86_400_001).is_none());

        let pinned: BTreeSet<_> = [other.clone()].into_iter().collect();
        assert_eq!(store.evict_stale(day, 86_400_001, &pinned).unwrap(), 1);
        assert!(store.get(&key()).is_none());
        assert!(store.get(&other).is_some());
    }

    #[test]
    fn state_survives_reopen_and_compaction() {
        let backend = InMemoryBackend::new();
        {
            let store = LocalStore::open(Box::new(backend.clone())).unwrap();
            for v in 1..=10 {
                store
                    .apply_authoritative(
                        &key(),
                        Some((Version(v), record(json!({"v": v})))),
                        &[],
                        v,
                    )
                    .unwrap();
            }
            store.set_last_sync(99).unwrap();
            assert!(store.maybe_compact(3).unwrap());
            assert_eq!(store.journal_records(), 2);
        }

        let store = LocalStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.get(&key()).unwrap().version, Some(Version(10)));
        assert_eq!(store.last_sync_at(), Some(99));
    }
}
