//! Durable operation queue.
//!
//! Every state change is written to a [`Journal`] before it is applied in
//! memory, so a failed write leaves the queue exactly as it was. Opening a
//! queue replays the journal; [`OperationQueue::compact`] rewrites it as
//! one record per live item.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{
    from_cbor, is_valid_resource_type, to_cbor, Conflict, ConflictId, Operation, OperationId,
    OperationInput, OperationKind, OperationStatus, Record, ResourceKey, Timestamp, Version,
};
use fieldsync_storage::{InMemoryBackend, Journal, StorageBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// How many settled operation ids are remembered after their operations
/// leave the queue, so late terminal marks stay idempotent.
pub const SETTLED_RETENTION: usize = 4096;

/// What the server reported when it applied an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOutcome {
    /// Final resource id.
    pub resource_id: String,
    /// New authoritative version.
    pub version: Version,
    /// Record after the mutation; `None` after Delete.
    pub payload: Option<Record>,
}

/// A definitive server rejection, kept until acknowledged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// The rejected operation.
    pub operation_id: OperationId,
    /// Its kind.
    pub kind: OperationKind,
    /// Its resource.
    pub key: ResourceKey,
    /// Its payload, so the user can re-enter the data.
    pub payload: Option<Record>,
    /// The server's reason.
    pub reason: String,
    /// When the rejection was recorded.
    pub rejected_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum QueueRecord {
    Enqueued(Operation),
    Applied {
        operation_id: OperationId,
        outcome: Option<AppliedOutcome>,
    },
    Rejected(Rejection),
    Conflicted(Conflict),
    Attempted {
        operation_id: OperationId,
        error: String,
        next_attempt_at: Option<Timestamp>,
    },
    Rebased(Operation),
    Resolved {
        conflict_id: ConflictId,
        replacement: Option<Operation>,
    },
    Pruned(Vec<OperationId>),
    RejectionAcknowledged(OperationId),
    SeqFloor(u64),
    Settled(Vec<(OperationId, OperationStatus)>),
}

impl QueueRecord {
    fn kind(&self) -> u8 {
        match self {
            QueueRecord::Enqueued(_) => 1,
            QueueRecord::Applied { .. } => 2,
            QueueRecord::Rejected(_) => 3,
            QueueRecord::Conflicted(_) => 4,
            QueueRecord::Attempted { .. } => 5,
            QueueRecord::Rebased(_) => 6,
            QueueRecord::Resolved { .. } => 7,
            QueueRecord::Pruned(_) => 8,
            QueueRecord::RejectionAcknowledged(_) => 9,
            QueueRecord::SeqFloor(_) => 10,
            QueueRecord::Settled(_) => 11,
        }
    }
}

/// Name of a queue journal record kind, for diagnostics.
pub fn queue_record_name(kind: u8) -> &'static str {
    match kind {
        1 => "enqueued",
        2 => "applied",
        3 => "rejected",
        4 => "conflicted",
        5 => "attempted",
        6 => "rebased",
        7 => "resolved",
        8 => "pruned",
        9 => "rejection-acknowledged",
        10 => "seq-floor",
        11 => "settled",
        _ => "unknown",
    }
}

/// Final status of operations that have left the queue, oldest first,
/// capped at a fixed number of ids.
#[derive(Debug)]
struct SettledIds {
    capacity: usize,
    order: VecDeque<OperationId>,
    status: HashMap<OperationId, OperationStatus>,
}

impl SettledIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            status: HashMap::new(),
        }
    }

    fn insert(&mut self, id: OperationId, status: OperationStatus) {
        if self.status.insert(id, status).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.status.remove(&oldest);
            }
        }
    }

    fn get(&self, id: &OperationId) -> Option<&OperationStatus> {
        self.status.get(id)
    }

    fn entries(&self) -> Vec<(OperationId, OperationStatus)> {
        self.order
            .iter()
            .filter_map(|id| Some((*id, self.status.get(id)?.clone())))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct QueueState {
    journal: Journal,
    journal_records: usize,
    ops: BTreeMap<u64, Operation>,
    by_id: HashMap<OperationId, u64>,
    conflicts: BTreeMap<ConflictId, Conflict>,
    rejections: Vec<Rejection>,
    settled: SettledIds,
    next_seq: u64,
}

impl QueueState {
    fn new(journal: Journal) -> Self {
        Self {
            journal,
            journal_records: 0,
            ops: BTreeMap::new(),
            by_id: HashMap::new(),
            conflicts: BTreeMap::new(),
            rejections: Vec::new(),
            settled: SettledIds::new(SETTLED_RETENTION),
            next_seq: 1,
        }
    }

    fn op(&self, id: &OperationId) -> Option<&Operation> {
        self.by_id.get(id).and_then(|seq| self.ops.get(seq))
    }

    fn op_mut(&mut self, id: &OperationId) -> Option<&mut Operation> {
        let seq = *self.by_id.get(id)?;
        self.ops.get_mut(&seq)
    }

    fn status_of(&self, id: &OperationId) -> Option<OperationStatus> {
        self.op(id)
            .map(|op| op.status.clone())
            .or_else(|| self.settled.get(id).cloned())
    }

    fn write(&mut self, record: QueueRecord) -> SyncResult<()> {
        let payload = to_cbor(&record)?;
        self.journal.append(record.kind(), &payload)?;
        self.journal_records += 1;
        self.apply(record);
        Ok(())
    }

    fn remove_op(&mut self, id: &OperationId) -> Option<Operation> {
        let seq = self.by_id.remove(id)?;
        let op = self.ops.remove(&seq)?;
        self.settled.insert(op.operation_id, op.status.clone());
        Some(op)
    }

    fn insert_op(&mut self, op: Operation) {
        self.next_seq = self.next_seq.max(op.seq + 1);
        self.by_id.insert(op.operation_id, op.seq);
        self.ops.insert(op.seq, op);
    }

    /// Applies a record to memory. Records referring to operations that no
    /// longer exist are ignored so replay tolerates any prefix.
    fn apply(&mut self, record: QueueRecord) {
        match record {
            QueueRecord::Enqueued(op) => self.insert_op(op),
            QueueRecord::Applied {
                operation_id,
                outcome,
            } => self.apply_applied(operation_id, outcome),
            QueueRecord::Rejected(rejection) => {
                if let Some(op) = self.op_mut(&rejection.operation_id) {
                    op.status = OperationStatus::Rejected {
                        reason: rejection.reason.clone(),
                    };
                    op.next_attempt_at = None;
                }
                if !self
                    .rejections
                    .iter()
                    .any(|r| r.operation_id == rejection.operation_id)
                {
                    self.rejections.push(rejection);
                }
            }
            QueueRecord::Conflicted(conflict) => {
                if let Some(op) = self.op_mut(&conflict.operation_id) {
                    op.status = OperationStatus::Conflicted {
                        conflict_id: conflict.conflict_id,
                    };
                    op.next_attempt_at = None;
                }
                self.conflicts.insert(conflict.conflict_id, conflict);
            }
            QueueRecord::Attempted {
                operation_id,
                error,
                next_attempt_at,
            } => {
                if let Some(op) = self.op_mut(&operation_id) {
                    op.attempt_count = op.attempt_count.saturating_add(1);
                    op.last_error = Some(error);
                    op.next_attempt_at = next_attempt_at;
                }
            }
            QueueRecord::Rebased(op) => {
                if self.by_id.get(&op.operation_id) == Some(&op.seq) {
                    self.ops.insert(op.seq, op);
                }
            }
            QueueRecord::Resolved {
                conflict_id,
                replacement,
            } => {
                if let Some(conflict) = self.conflicts.remove(&conflict_id) {
                    self.remove_op(&conflict.operation_id);
                }
                if let Some(op) = replacement {
                    self.insert_op(op);
                }
            }
            QueueRecord::Pruned(ids) => {
                for id in ids {
                    self.remove_op(&id);
                }
            }
            QueueRecord::RejectionAcknowledged(id) => {
                self.rejections.retain(|r| r.operation_id != id);
            }
            QueueRecord::SeqFloor(floor) => self.next_seq = self.next_seq.max(floor),
            QueueRecord::Settled(entries) => {
                for (id, status) in entries {
                    self.settled.insert(id, status);
                }
            }
        }
    }

    /// Marks the operation applied. With an outcome, later pending
    /// operations on the same resource follow a server-assigned id and are
    /// rebased when they were formed on the same base.
    fn apply_applied(&mut self, operation_id: OperationId, outcome: Option<AppliedOutcome>) {
        let Some(seq) = self.by_id.get(&operation_id).copied() else {
            return;
        };
        let Some(op) = self.ops.get_mut(&seq) else {
            return;
        };
        op.status = OperationStatus::Applied;
        op.next_attempt_at = None;

        let Some(outcome) = outcome else {
            return;
        };
        let resource_type = op.resource_type.clone();
        let old_id = std::mem::replace(&mut op.resource_id, outcome.resource_id.clone());
        let old_base = op.base_version;

        for (_, sibling) in self.ops.range_mut(seq + 1..) {
            if sibling.status != OperationStatus::Pending
                || sibling.resource_type != resource_type
                || sibling.resource_id != old_id
            {
                continue;
            }
            sibling.resource_id = outcome.resource_id.clone();
            if sibling.base_version == old_base {
                sibling.base_version = Some(outcome.version);
                sibling.base_payload = outcome.payload.clone();
            }
        }
    }

    fn live_records(&self) -> usize {
        1 + usize::from(!self.settled.is_empty())
            + self.ops.len()
            + self.conflicts.len()
            + self.rejections.len()
    }
}

/// The ordered log of mutation intents.
///
/// # Invariants
///
/// - `enqueue` returns only after the operation is durable
/// - sequence numbers increase in enqueue order and are never reused
/// - terminal marks are idempotent for the same terminal state
/// - conflicted operations and rejections stay until resolved or
///   acknowledged
pub struct OperationQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl OperationQueue {
    /// Opens a queue over a backend, replaying its journal.
    ///
    /// A torn tail record from a crash is discarded.
    pub fn open(backend: Box<dyn StorageBackend>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let mut journal = Journal::open(backend)?;
        let entries = journal.recover()?;

        let mut state = QueueState::new(journal);
        for entry in entries {
            let record: QueueRecord = from_cbor(&entry.payload)?;
            state.apply(record);
            state.journal_records += 1;
        }

        debug!(
            operations = state.ops.len(),
            conflicts = state.conflicts.len(),
            "operation queue replayed"
        );

        Ok(Self {
            state: Mutex::new(state),
            clock,
        })
    }

    /// Creates an empty queue that lives in memory.
    pub fn in_memory(clock: Arc<dyn Clock>) -> SyncResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), clock)
    }

    /// Appends an operation and returns its id.
    ///
    /// # Errors
    ///
    /// [`SyncError::InvalidInput`] for malformed input and
    /// [`SyncError::Storage`] if the write fails; nothing is queued then.
    pub fn enqueue(&self, input: OperationInput) -> SyncResult<OperationId> {
        self.push(input).map(|op| op.operation_id)
    }

    pub(crate) fn push(&self, input: OperationInput) -> SyncResult<Operation> {
        validate(&input)?;
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        let op = Operation::from_input(input, OperationId::new(), state.next_seq, now);
        state.write(QueueRecord::Enqueued(op.clone()))?;
        Ok(op)
    }

    /// Returns a live operation.
    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.state.lock().op(id).cloned()
    }

    /// Oldest `max` pending operations in enqueue order.
    pub fn peek_batch(&self, max: usize) -> Vec<Operation> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .take(max)
            .cloned()
            .collect()
    }

    /// Up to `max` pending operations with `after < seq <= up_to`.
    pub fn batch_after(&self, after: u64, up_to: u64, max: usize) -> Vec<Operation> {
        if after >= up_to {
            return Vec::new();
        }
        self.state
            .lock()
            .ops
            .range(after + 1..=up_to)
            .map(|(_, op)| op)
            .filter(|op| op.status == OperationStatus::Pending)
            .take(max)
            .cloned()
            .collect()
    }

    /// Highest sequence number handed out so far.
    pub fn high_water(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Number of pending (non-terminal) operations.
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
            .count()
    }

    /// Number of pending operations with `seq <= up_to`.
    pub fn pending_up_to(&self, up_to: u64) -> usize {
        self.state
            .lock()
            .ops
            .range(..=up_to)
            .filter(|(_, op)| op.status == OperationStatus::Pending)
            .count()
    }

    /// Pending operations per resource type.
    pub fn pending_by_type(&self) -> BTreeMap<String, usize> {
        let state = self.state.lock();
        let mut counts = BTreeMap::new();
        for op in state
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Pending)
        {
            *counts.entry(op.resource_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// All live operations in enqueue order.
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().ops.values().cloned().collect()
    }

    /// Pending and conflicted operations on `key`, in enqueue order.
    pub fn local_ops_for(&self, key: &ResourceKey) -> Vec<Operation> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::Conflicted { .. }
                ) && op.resource_type == key.resource_type
                    && op.resource_id == key.resource_id
            })
            .cloned()
            .collect()
    }

    /// Resources with a parked conflict.
    pub fn conflicted_keys(&self) -> BTreeSet<ResourceKey> {
        self.state
            .lock()
            .conflicts
            .values()
            .map(|c| c.key.clone())
            .collect()
    }

    /// Pending operations that have failed at least `max_attempts` times.
    pub fn stalled(&self, max_attempts: u32) -> Vec<Operation> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Pending && op.attempt_count >= max_attempts)
            .cloned()
            .collect()
    }

    /// Marks an operation applied without server details.
    pub fn mark_applied(&self, id: &OperationId) -> SyncResult<()> {
        self.transition(id, "applied", |_| QueueRecord::Applied {
            operation_id: *id,
            outcome: None,
        })
    }

    /// Marks an operation applied with the server's outcome; later
    /// operations on the resource follow the assigned id and new version.
    pub fn complete(&self, id: &OperationId, outcome: AppliedOutcome) -> SyncResult<()> {
        self.transition(id, "applied", |_| QueueRecord::Applied {
            operation_id: *id,
            outcome: Some(outcome),
        })
    }

    /// Parks an operation behind a conflict.
    pub fn mark_conflicted(&self, id: &OperationId, conflict: Conflict) -> SyncResult<()> {
        if conflict.operation_id != *id {
            return Err(SyncError::InvalidInput(format!(
                "conflict {} belongs to operation {}",
                conflict.conflict_id, conflict.operation_id
            )));
        }
        self.transition(id, "conflicted", |_| QueueRecord::Conflicted(conflict))
    }

    /// Marks an operation definitively rejected and records the rejection.
    pub fn mark_rejected(&self, id: &OperationId, reason: impl Into<String>) -> SyncResult<()> {
        let reason = reason.into();
        let now = self.clock.now_millis();
        self.transition(id, "rejected", |op| {
            QueueRecord::Rejected(Rejection {
                operation_id: op.operation_id,
                kind: op.kind,
                key: op.key(),
                payload: op.payload.clone(),
                reason,
                rejected_at: now,
            })
        })
    }

    fn transition(
        &self,
        id: &OperationId,
        target: &'static str,
        build: impl FnOnce(&Operation) -> QueueRecord,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        let status = state
            .status_of(id)
            .ok_or(SyncError::UnknownOperation(*id))?;

        if status.label() == target {
            return Ok(());
        }
        if status != OperationStatus::Pending {
            return Err(SyncError::InvalidStateTransition {
                from: status.label().to_string(),
                to: target.to_string(),
            });
        }

        let record = match state.op(id) {
            Some(op) => build(op),
            None => return Err(SyncError::UnknownOperation(*id)),
        };
        state.write(record)
    }

    /// Records a failed attempt and when to try again.
    pub fn record_attempt(
        &self,
        id: &OperationId,
        error: impl Into<String>,
        next_attempt_at: Option<Timestamp>,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        match state.op(id) {
            Some(op) if op.status == OperationStatus::Pending => {}
            Some(op) => {
                return Err(SyncError::InvalidStateTransition {
                    from: op.status.label().to_string(),
                    to: "attempted".to_string(),
                })
            }
            None => return Err(SyncError::UnknownOperation(*id)),
        }
        state.write(QueueRecord::Attempted {
            operation_id: *id,
            error: error.into(),
            next_attempt_at,
        })
    }

    /// Replaces the contents of a pending operation, keeping its id and
    /// place in the queue.
    pub fn rebase(&self, op: Operation) -> SyncResult<()> {
        let mut state = self.state.lock();
        match state.op(&op.operation_id) {
            Some(current) if current.seq == op.seq && current.status == OperationStatus::Pending => {
            }
            Some(_) => {
                return Err(SyncError::InvalidInput(format!(
                    "operation {} cannot be rebased",
                    op.operation_id
                )))
            }
            None => return Err(SyncError::UnknownOperation(op.operation_id)),
        }
        state.write(QueueRecord::Rebased(op))
    }

    /// Pending conflicts in detection order.
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<_> = self.state.lock().conflicts.values().cloned().collect();
        conflicts.sort_by_key(|c| c.detected_at);
        conflicts
    }

    /// Returns a pending conflict.
    pub fn conflict(&self, id: &ConflictId) -> Option<Conflict> {
        self.state.lock().conflicts.get(id).cloned()
    }

    /// Removes a conflict and its parked operation. A replacement takes
    /// the parked operation's place in the per-resource order under a new
    /// operation id.
    pub fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        replacement: Option<OperationInput>,
    ) -> SyncResult<Option<Operation>> {
        if let Some(input) = &replacement {
            validate(input)?;
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        let conflict = state
            .conflicts
            .get(conflict_id)
            .cloned()
            .ok_or(SyncError::UnknownConflict(*conflict_id))?;
        let seq = state
            .by_id
            .get(&conflict.operation_id)
            .copied()
            .unwrap_or(state.next_seq);

        let replacement =
            replacement.map(|input| Operation::from_input(input, OperationId::new(), seq, now));
        state.write(QueueRecord::Resolved {
            conflict_id: *conflict_id,
            replacement: replacement.clone(),
        })?;
        Ok(replacement)
    }

    /// Outstanding rejections.
    pub fn rejections(&self) -> Vec<Rejection> {
        self.state.lock().rejections.clone()
    }

    /// Clears a rejection after the user has seen it.
    pub fn acknowledge_rejection(&self, id: &OperationId) -> SyncResult<()> {
        let mut state = self.state.lock();
        if !state.rejections.iter().any(|r| r.operation_id == *id) {
            return Err(SyncError::UnknownOperation(*id));
        }
        state.write(QueueRecord::RejectionAcknowledged(*id))
    }

    /// Drops applied and rejected operations. Returns how many were removed.
    pub fn prune(&self) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let ids: Vec<_> = state
            .ops
            .values()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Applied | OperationStatus::Rejected { .. }
                )
            })
            .map(|op| op.operation_id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let count = ids.len();
        state.write(QueueRecord::Pruned(ids))?;
        Ok(count)
    }

    /// Number of records currently in the journal.
    pub fn journal_records(&self) -> usize {
        self.state.lock().journal_records
    }

    /// Rewrites the journal as one record per live item, plus the ids of
    /// recently settled operations.
    pub fn compact(&self) -> SyncResult<()> {
        let mut state = self.state.lock();

        let mut records = vec![QueueRecord::SeqFloor(state.next_seq)];
        if !state.settled.is_empty() {
            records.push(QueueRecord::Settled(state.settled.entries()));
        }
        records.extend(state.ops.values().cloned().map(QueueRecord::Enqueued));
        records.extend(state.conflicts.values().cloned().map(QueueRecord::Conflicted));
        records.extend(state.rejections.iter().cloned().map(QueueRecord::Rejected));

        let mut framed = Vec::with_capacity(records.len());
        for record in &records {
            framed.push((record.kind(), to_cbor(record)?));
        }
        state.journal.replace(&framed)?;
        state.journal_records = records.len();

        debug!(records = records.len(), "operation journal compacted");
        Ok(())
    }

    /// Compacts when more than `threshold` journal records are superseded.
    pub fn maybe_compact(&self, threshold: usize) -> SyncResult<bool> {
        let superseded = {
            let state = self.state.lock();
            state.journal_records.saturating_sub(state.live_records())
        };
        if superseded > threshold {
            self.compact()?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn validate(input: &OperationInput) -> SyncResult<()> {
    if input.resource_type.is_empty() || input.resource_id.is_empty() {
        return Err(SyncError::InvalidInput(
            "resource type and id must not be empty".into(),
        ));
    }
    if !is_valid_resource_type(&input.resource_type) {
        return Err(SyncError::InvalidInput(format!(
            "resource type {:?} may only contain ASCII letters, digits, '-', '_' and '.'",
            input.resource_type
        )));
    }
    match input.kind {
        OperationKind::Create if input.payload.is_none() => Err(SyncError::InvalidInput(
            "create requires a payload".into(),
        )),
        OperationKind::Create if input.base_version.is_some() => Err(SyncError::InvalidInput(
            "create must not carry a base version".into(),
        )),
        OperationKind::Update if input.payload.is_none() => Err(SyncError::InvalidInput(
            "update requires a patch".into(),
        )),
        OperationKind::Delete if input.payload.is_some() => Err(SyncError::InvalidInput(
            "delete must not carry a payload".into(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::FlakyBackend;
    use fieldsync_protocol::ConflictResolution;
    use fieldsync_storage::{StorageError, StorageResult};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        serde_json::from_value(value).unwrap()
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(1_000))
    }

    fn create(id: &str) -> OperationInput {
        OperationInput::create("farmer-record", id, record(json!({"name": id})))
    }

    fn update(id: &str, base: u64) -> OperationInput {
        OperationInput::update(
            "farmer-record",
            id,
            record(json!({"status": "active"})),
            Some(Version(base)),
            None,
        )
    }

    fn conflict_for(op: &Operation) -> Conflict {
        Conflict {
            conflict_id: ConflictId::new(),
            operation_id: op.operation_id,
            kind: op.kind,
            key: op.key(),
            local_payload: op.payload.clone(),
            base_version: op.base_version,
            base_payload: None,
            remote_payload: Some(record(json!({"status": "suspended"}))),
            remote_version: Some(Version(9)),
            conflicting_fields: vec!["status".into()],
            detected_at: 2_000,
            resolution: ConflictResolution::Pending,
        }
    }

    struct FailingBackend;

    impl StorageBackend for FailingBackend {
        fn read_at(&self, _offset: u64, _len: usize) -> StorageResult<Vec<u8>> {
            Ok(Vec::new())
        }
        fn append(&mut self, _data: &[u8]) -> StorageResult<u64> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
        fn flush(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn size(&self) -> StorageResult<u64> {
            Ok(0)
        }
        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn truncate(&mut self, _new_size: u64) -> StorageResult<()> {
            Ok(())
        }
        fn rewrite(&mut self, _data: &[u8]) -> StorageResult<()> {
            Ok(())
        }
    }

    #[test]
    fn enqueue_assigns_increasing_sequence() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let a = queue.enqueue(create("a")).unwrap();
        let b = queue.enqueue(create("b")).unwrap();

        let batch = queue.peek_batch(10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].operation_id, a);
        assert_eq!(batch[1].operation_id, b);
        assert!(batch[0].seq < batch[1].seq);
        assert_eq!(batch[0].enqueued_at, 1_000);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.high_water(), 2);
    }

    #[test]
    fn enqueue_rejects_malformed_input() {
        let queue = OperationQueue::in_memory(clock()).unwrap();

        let mut bad_create = create("a");
        bad_create.base_version = Some(Version(1));
        assert!(matches!(
            queue.enqueue(bad_create),
            Err(SyncError::InvalidInput(_))
        ));

        let mut bad_delete = OperationInput::delete("farm-plot", "p", Some(Version(1)), None);
        bad_delete.payload = Some(Record::new());
        assert!(queue.enqueue(bad_delete).is_err());

        for bad_type in ["a:b", "farm/plot", "farm plot", "plots?all"] {
            assert!(matches!(
                queue.enqueue(OperationInput::create(bad_type, "x", Record::new())),
                Err(SyncError::InvalidInput(_))
            ));
        }
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn storage_failure_surfaces_and_queues_nothing() {
        let queue = OperationQueue::open(Box::new(FailingBackend), clock()).unwrap();
        let result = queue.enqueue(create("lost"));
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(queue.size(), 0);
        assert!(queue.peek_batch(1).is_empty());
    }

    #[test]
    fn terminal_marks_are_idempotent() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let id = queue.enqueue(create("a")).unwrap();

        queue.mark_applied(&id).unwrap();
        queue.mark_applied(&id).unwrap();
        assert_eq!(queue.size(), 0);

        queue.prune().unwrap();
        queue.mark_applied(&id).unwrap();

        let err = queue.mark_rejected(&id, "late").unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let missing = OperationId::new();
        assert!(matches!(
            queue.mark_applied(&missing),
            Err(SyncError::UnknownOperation(_))
        ));
    }

    #[test]
    fn rejection_outlives_pruning_until_acknowledged() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let id = queue.enqueue(create("a")).unwrap();

        queue.mark_rejected(&id, "name is required").unwrap();
        queue.mark_rejected(&id, "name is required").unwrap();
        assert_eq!(queue.prune().unwrap(), 1);
        assert!(queue.get(&id).is_none());

        let rejections = queue.rejections();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].reason, "name is required");

        queue.acknowledge_rejection(&id).unwrap();
        assert!(queue.rejections().is_empty());
        assert!(queue.acknowledge_rejection(&id).is_err());
    }

    #[test]
    fn conflicted_operations_survive_pruning() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let id = queue.enqueue(update("f-1", 5)).unwrap();
        let op = queue.get(&id).unwrap();

        queue.mark_conflicted(&id, conflict_for(&op)).unwrap();
        assert_eq!(queue.prune().unwrap(), 0);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.conflicts().len(), 1);
        assert!(queue
            .conflicted_keys()
            .contains(&ResourceKey::new("farmer-record", "f-1")));
        assert_eq!(queue.local_ops_for(&op.key()).len(), 1);
    }

    #[test]
    fn resolution_replacement_takes_the_parked_place() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let first = queue.enqueue(update("f-1", 5)).unwrap();
        let later = queue.enqueue(update("f-1", 5)).unwrap();
        let op = queue.get(&first).unwrap();
        let conflict = conflict_for(&op);
        queue.mark_conflicted(&first, conflict.clone()).unwrap();

        let replacement = queue
            .resolve_conflict(&conflict.conflict_id, Some(update("f-1", 9)))
            .unwrap()
            .unwrap();

        assert_ne!(replacement.operation_id, first);
        assert_eq!(replacement.seq, op.seq);
        assert!(queue.conflicts().is_empty());
        let batch = queue.peek_batch(10);
        assert_eq!(batch[0].operation_id, replacement.operation_id);
        assert_eq!(batch[1].operation_id, later);
    }

    #[test]
    fn applying_a_create_remaps_and_rebases_followers() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let created = queue.enqueue(create("temp-1")).unwrap();
        let follow = queue
            .enqueue(OperationInput::update(
                "farmer-record",
                "temp-1",
                record(json!({"phone": "0700"})),
                None,
                None,
            ))
            .unwrap();
        let other = queue.enqueue(create("temp-2")).unwrap();

        queue
            .complete(
                &created,
                AppliedOutcome {
                    resource_id: "farmer-41".into(),
                    version: Version(1),
                    payload: Some(record(json!({"name": "temp-1"}))),
                },
            )
            .unwrap();

        let follow = queue.get(&follow).unwrap();
        assert_eq!(follow.resource_id, "farmer-41");
        assert_eq!(follow.base_version, Some(Version(1)));
        assert_eq!(follow.base_payload, Some(record(json!({"name": "temp-1"}))));
        assert_eq!(queue.get(&other).unwrap().resource_id, "temp-2");
    }

    #[test]
    fn applying_an_update_rebases_siblings_on_the_same_base() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let first = queue.enqueue(update("f-1", 5)).unwrap();
        let second = queue.enqueue(update("f-1", 5)).unwrap();

        queue
            .complete(
                &first,
                AppliedOutcome {
                    resource_id: "f-1".into(),
                    version: Version(6),
                    payload: Some(record(json!({"status": "active"}))),
                },
            )
            .unwrap();

        assert_eq!(queue.get(&second).unwrap().base_version, Some(Version(6)));
    }

    #[test]
    fn batch_after_respects_cursor_and_cutoff() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        for i in 0..5 {
            queue.enqueue(create(&format!("temp-{i}"))).unwrap();
        }
        let cutoff = queue.high_water();
        queue.enqueue(create("late")).unwrap();

        let batch = queue.batch_after(1, cutoff, 2);
        assert_eq!(batch.iter().map(|o| o.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert!(queue.batch_after(cutoff, cutoff, 10).is_empty());
        assert_eq!(queue.pending_up_to(cutoff), 5);
    }

    #[test]
    fn replay_restores_identical_state() {
        let backend = InMemoryBackend::new();
        let (a, b, conflict_id) = {
            let queue = OperationQueue::open(Box::new(backend.clone()), clock()).unwrap();
            let a = queue.enqueue(create("temp-a")).unwrap();
            let b = queue.enqueue(update("f-2", 3)).unwrap();
            let c = queue.enqueue(update("f-3", 1)).unwrap();
            queue
                .record_attempt(&a, "connection reset", Some(5_000))
                .unwrap();
            let op_c = queue.get(&c).unwrap();
            let conflict = conflict_for(&op_c);
            queue.mark_conflicted(&c, conflict.clone()).unwrap();
            (a, b, conflict.conflict_id)
        };

        let queue = OperationQueue::open(Box::new(backend), clock()).unwrap();
        let op_a = queue.get(&a).unwrap();
        assert_eq!(op_a.attempt_count, 1);
        assert_eq!(op_a.last_error.as_deref(), Some("connection reset"));
        assert_eq!(op_a.next_attempt_at, Some(5_000));
        assert!(queue.get(&b).is_some());
        assert!(queue.conflict(&conflict_id).is_some());
        assert_eq!(queue.size(), 2);

        let next = queue.enqueue(create("temp-d")).unwrap();
        assert_eq!(queue.get(&next).unwrap().seq, 4);
    }

    #[test]
    fn compaction_preserves_live_state_and_sequence() {
        let backend = InMemoryBackend::new();
        {
            let queue = OperationQueue::open(Box::new(backend.clone()), clock()).unwrap();
            for i in 0..20 {
                let id = queue.enqueue(create(&format!("temp-{i}"))).unwrap();
                if i % 2 == 0 {
                    queue.mark_applied(&id).unwrap();
                }
            }
            queue.prune().unwrap();
            assert!(queue.maybe_compact(5).unwrap());
            assert_eq!(queue.journal_records(), 12);
        }

        let queue = OperationQueue::open(Box::new(backend), clock()).unwrap();
        assert_eq!(queue.size(), 10);
        let next = queue.enqueue(create("after")).unwrap();
        assert_eq!(queue.get(&next).unwrap().seq, 21);
    }

    #[test]
    fn torn_enqueue_leaves_the_journal_readable() {
        let backend = FlakyBackend::new();
        let (a, c) = {
            let queue = OperationQueue::open(Box::new(backend.clone()), clock()).unwrap();
            let a = queue.enqueue(create("a")).unwrap();
            let clean_len = backend.bytes().len();
            backend.tear_next_appends(1);
            assert!(matches!(
                queue.enqueue(create("b")),
                Err(SyncError::Storage(_))
            ));
            assert_eq!(backend.bytes().len(), clean_len);
            let c = queue.enqueue(create("c")).unwrap();
            assert_eq!(queue.size(), 2);
            (a, c)
        };

        let queue = OperationQueue::open(Box::new(backend), clock()).unwrap();
        let ids: Vec<_> = queue.peek_batch(10).iter().map(|o| o.operation_id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn terminal_marks_survive_compaction_and_restart() {
        let backend = InMemoryBackend::new();
        let (applied, rejected) = {
            let queue = OperationQueue::open(Box::new(backend.clone()), clock()).unwrap();
            let applied = queue.enqueue(create("a")).unwrap();
            let rejected = queue.enqueue(create("b")).unwrap();
            queue.mark_applied(&applied).unwrap();
            queue.mark_rejected(&rejected, "duplicate national id").unwrap();
            queue.prune().unwrap();
            queue.compact().unwrap();
            (applied, rejected)
        };

        let queue = OperationQueue::open(Box::new(backend), clock()).unwrap();
        queue.mark_applied(&applied).unwrap();
        queue.mark_rejected(&rejected, "duplicate national id").unwrap();
        assert!(matches!(
            queue.mark_rejected(&applied, "late"),
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn settled_ids_keep_only_the_newest() {
        let mut settled = SettledIds::new(3);
        let ids: Vec<_> = (0..5).map(|_| OperationId::new()).collect();
        for id in &ids {
            settled.insert(*id, OperationStatus::Applied);
        }
        settled.insert(ids[4], OperationStatus::Applied);

        assert!(settled.get(&ids[0]).is_none());
        assert!(settled.get(&ids[1]).is_none());
        let kept: Vec<_> = settled.entries().into_iter().map(|(id, _)| id).collect();
        assert_eq!(kept, ids[2..].to_vec());
    }

    #[test]
    fn settled_retention_bounds_the_queue_memory() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let first = queue.enqueue(create("temp-0")).unwrap();
        queue.mark_applied(&first).unwrap();
        queue.prune().unwrap();
        for i in 1..=SETTLED_RETENTION {
            let id = queue.enqueue(create(&format!("temp-{i}"))).unwrap();
            queue.mark_applied(&id).unwrap();
        }
        queue.prune().unwrap();

        assert_eq!(queue.state.lock().settled.order.len(), SETTLED_RETENTION);
        assert!(matches!(
            queue.mark_applied(&first),
            Err(SyncError::UnknownOperation(_))
        ));
    }

    #[test]
    fn pending_by_type_and_stalled() {
        let queue = OperationQueue::in_memory(clock()).unwrap();
        let a = queue.enqueue(create("temp-a")).unwrap();
        queue
            .enqueue(OperationInput::create(
                "farm-plot",
                "temp-p",
                record(json!({"acres": 2})),
            ))
            .unwrap();

        let counts = queue.pending_by_type();
        assert_eq!(counts.get("farmer-record"), Some(&1));
        assert_eq!(counts.get("farm-plot"), Some(&1));

        for _ in 0..3 {
            queue.record_attempt(&a, "timeout", None).unwrap();
        }
        let stalled = queue.stalled(3);
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].operation_id, a);
    }
}
