//! Sync orchestrator.
//!
//! ```text
//! Idle ──[online | trigger | timer]──▶ Syncing ──▶ Idle
//!                                         │
//!                                         └──────▶ IdleWithConflicts
//! ```
//!
//! Only one pass runs at a time; a trigger during a pass is coalesced
//! into one more pass after it. A pass drains the operations that were
//! queued when it started, in sequence order, stopping at the first
//! transient failure.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::data_dir::DataDir;
use crate::detector::{ConflictDetector, Resolution, Verdict};
use crate::error::{SyncError, SyncResult};
use crate::local_store::{replay, CachedResource, LocalStore};
use crate::queue::{AppliedOutcome, OperationQueue};
use crate::status::{
    PersistentError, StatusPublisher, Subscription, SyncProgress, SyncSnapshot, SyncState,
};
use crate::transport::RemoteApi;
use fieldsync_protocol::{
    apply_patch, replacement_patch, Conflict, ConflictId, ConflictResolution, FetchRequest,
    Operation, OperationId, OperationInput, OperationKind, Record, ResourceKey, ResourceSnapshot,
    SubmitResponse, Version,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of client-generated provisional resource ids.
pub const PROVISIONAL_ID_PREFIX: &str = "temp-";

/// Statistics about sync passes.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Passes that drained everything they could.
    pub passes_completed: u64,
    /// Passes stopped by a transient failure.
    pub passes_interrupted: u64,
    /// Passes stopped by cancellation.
    pub passes_cancelled: u64,
    /// Operations the server applied.
    pub operations_applied: u64,
    /// Operations the server rejected.
    pub operations_rejected: u64,
    /// Conflicts parked for a decision.
    pub conflicts_detected: u64,
    /// Mismatches settled without asking anyone.
    pub conflicts_auto_resolved: u64,
    /// Conflicts settled by an explicit decision.
    pub conflicts_resolved: u64,
    /// Failed attempts recorded for retry.
    pub retries: u64,
    /// Last transient failure.
    pub last_error: Option<String>,
    /// Duration of the last pass.
    pub last_pass_duration: Option<Duration>,
}

/// How a call to [`SyncEngine::sync_now`] ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PassOutcome {
    /// Every eligible operation was settled.
    #[default]
    Completed,
    /// A transient failure stopped the pass; the rest stays queued.
    Interrupted {
        /// The failure.
        error: String,
    },
    /// The pass stopped between operations on request.
    Cancelled,
    /// Another pass was running; it will run again when it finishes.
    Coalesced,
}

/// Summary of a call to [`SyncEngine::sync_now`].
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// How it ended.
    pub outcome: PassOutcome,
    /// Passes run, including coalesced reruns.
    pub passes: usize,
    /// Operations applied.
    pub applied: usize,
    /// Mismatches settled automatically.
    pub auto_resolved: usize,
    /// Operations rejected.
    pub rejected: usize,
    /// Operations parked behind a conflict.
    pub conflicted: usize,
    /// Operations skipped because of backoff or an earlier conflict on
    /// the same resource.
    pub deferred: usize,
    /// Wall time.
    pub duration: Duration,
}

enum Step {
    Settled,
    Blocked,
    Interrupted(String),
}

/// The offline-first sync engine.
///
/// User actions go through [`SyncEngine::create`], [`SyncEngine::update`]
/// and [`SyncEngine::delete`], which queue the intent durably and apply it
/// to the local store at once. [`SyncEngine::sync_now`] drains the queue
/// against the remote API; [`SyncEngine::run`] does so on connectivity
/// changes, triggers and a timer.
pub struct SyncEngine<R: RemoteApi> {
    config: SyncConfig,
    remote: R,
    queue: OperationQueue,
    store: LocalStore,
    detector: ConflictDetector,
    publisher: StatusPublisher,
    connectivity: Connectivity,
    clock: Arc<dyn Clock>,
    state: Mutex<SyncState>,
    progress: Mutex<Option<SyncProgress>>,
    stale_views: Mutex<BTreeSet<ResourceKey>>,
    stats: RwLock<SyncStats>,
    rerun: AtomicBool,
    ignore_backoff: AtomicBool,
    cancelled: AtomicBool,
    trigger: Notify,
    shutdown: Notify,
    _data_dir: Option<DataDir>,
}

impl<R: RemoteApi> SyncEngine<R> {
    /// Opens an engine persisting to `path`, creating it if needed.
    ///
    /// # Errors
    ///
    /// [`SyncError::DirectoryLocked`] if another engine holds the
    /// directory, or a storage error if a journal cannot be read.
    pub fn open(path: &Path, remote: R, config: SyncConfig) -> SyncResult<Self> {
        Self::open_with_clock(path, remote, config, Arc::new(SystemClock))
    }

    /// Same as [`SyncEngine::open`] with an explicit clock.
    pub fn open_with_clock(
        path: &Path,
        remote: R,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let dir = DataDir::open(path, true)?;
        let queue = OperationQueue::open(Box::new(dir.operations_backend()?), Arc::clone(&clock))?;
        let store = LocalStore::open(Box::new(dir.resources_backend()?))?;
        info!(path = %path.display(), pending = queue.size(), "sync engine opened");
        Ok(Self::from_parts(remote, config, queue, store, clock, Some(dir)))
    }

    /// Creates an engine that keeps everything in memory.
    pub fn in_memory(remote: R, config: SyncConfig) -> SyncResult<Self> {
        Self::in_memory_with_clock(remote, config, Arc::new(SystemClock))
    }

    /// Same as [`SyncEngine::in_memory`] with an explicit clock.
    pub fn in_memory_with_clock(
        remote: R,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let queue = OperationQueue::in_memory(Arc::clone(&clock))?;
        let store = LocalStore::in_memory()?;
        Ok(Self::from_parts(remote, config, queue, store, clock, None))
    }

    fn from_parts(
        remote: R,
        config: SyncConfig,
        queue: OperationQueue,
        store: LocalStore,
        clock: Arc<dyn Clock>,
        data_dir: Option<DataDir>,
    ) -> Self {
        let engine = Self {
            detector: ConflictDetector::new(config.conflict_policy),
            config,
            remote,
            queue,
            store,
            publisher: StatusPublisher::new(SyncSnapshot::default()),
            connectivity: Connectivity::new(true),
            clock,
            state: Mutex::new(SyncState::Idle),
            progress: Mutex::new(None),
            stale_views: Mutex::new(BTreeSet::new()),
            stats: RwLock::new(SyncStats::default()),
            rerun: AtomicBool::new(false),
            ignore_backoff: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            trigger: Notify::new(),
            shutdown: Notify::new(),
            _data_dir: data_dir,
        };
        engine.reset_state();
        engine
    }

    // ---- accessors -------------------------------------------------------

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The remote API.
    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// The operation queue.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// The local store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// The orchestrator state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Pass statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    // ---- status ----------------------------------------------------------

    /// The latest published snapshot.
    pub fn snapshot(&self) -> SyncSnapshot {
        self.publisher.snapshot()
    }

    /// Registers a status listener.
    #[must_use = "dropping the subscription keeps the listener registered forever"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        self.publisher.subscribe(listener)
    }

    /// A watch receiver of snapshots.
    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.publisher.watch()
    }

    fn build_snapshot(&self) -> SyncSnapshot {
        let state = self.state();
        let persistent_errors = self
            .queue
            .stalled(self.config.retry.max_attempts)
            .into_iter()
            .map(|op| PersistentError {
                key: op.key(),
                operation_id: op.operation_id,
                attempt_count: op.attempt_count,
                last_error: op.last_error,
            })
            .collect();

        SyncSnapshot {
            is_online: self.connectivity.is_online(),
            is_syncing: state.is_active(),
            state,
            queued_count: self.queue.size(),
            pending_by_type: self.queue.pending_by_type(),
            conflicts: self.queue.conflicts(),
            rejections: self.queue.rejections(),
            persistent_errors,
            last_sync_at: self.store.last_sync_at(),
            progress: self.progress.lock().clone(),
        }
    }

    fn publish(&self) {
        self.publisher.publish(self.build_snapshot());
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock() = state;
        self.publish();
    }

    fn reset_state(&self) {
        let state = if self.queue.conflicts().is_empty() {
            SyncState::Idle
        } else {
            SyncState::IdleWithConflicts
        };
        self.set_state(state);
    }

    // ---- connectivity ----------------------------------------------------

    /// The connectivity signal.
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Reports a connectivity change. Going offline cancels a running pass
    /// after its in-flight operation.
    pub fn set_online(&self, online: bool) {
        if !self.connectivity.set_online(online) {
            return;
        }
        self.cancelled.store(!online, Ordering::SeqCst);
        info!(online, "connectivity changed");
        self.publish();
    }

    /// Asks a running pass to stop after its in-flight operation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    // ---- user mutations --------------------------------------------------

    /// Queues an operation and applies it to the local store.
    ///
    /// Returns once the operation is durable. If the local store cannot
    /// record the optimistic change, the operation stays queued and the
    /// resource's view is rebuilt from the queue on the next read or pass.
    pub fn enqueue(&self, input: OperationInput) -> SyncResult<OperationId> {
        let op = self.queue.push(input)?;
        if let Err(e) = self.store.apply_local(&op, self.clock.now_millis()) {
            warn!(
                operation = %op.operation_id,
                error = %e,
                "optimistic apply failed, view marked stale"
            );
            self.stale_views.lock().insert(op.key());
        }
        debug!(operation = %op.operation_id, key = %op.key(), kind = %op.kind, "operation queued");
        self.publish();
        Ok(op.operation_id)
    }

    /// Queues a Create under a provisional id and returns both ids.
    pub fn create(
        &self,
        resource_type: &str,
        payload: Record,
    ) -> SyncResult<(OperationId, ResourceKey)> {
        let id = format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4());
        let key = ResourceKey::new(resource_type, id);
        let op = self.enqueue(OperationInput::create(
            key.resource_type.clone(),
            key.resource_id.clone(),
            payload,
        ))?;
        Ok((op, key))
    }

    /// Queues an Update against the locally known version.
    pub fn update(&self, key: &ResourceKey, patch: Record) -> SyncResult<OperationId> {
        let (base_version, base_payload) = self.observed_base(key);
        self.enqueue(OperationInput::update(
            key.resource_type.clone(),
            key.resource_id.clone(),
            patch,
            base_version,
            base_payload,
        ))
    }

    /// Queues a Delete against the locally known version.
    pub fn delete(&self, key: &ResourceKey) -> SyncResult<OperationId> {
        let (base_version, base_payload) = self.observed_base(key);
        self.enqueue(OperationInput::delete(
            key.resource_type.clone(),
            key.resource_id.clone(),
            base_version,
            base_payload,
        ))
    }

    /// Recomputes views whose optimistic apply failed from the cached base,
    /// or the first queued operation's base, and the queued operations.
    fn rebuild_stale_views(&self) {
        let keys = std::mem::take(&mut *self.stale_views.lock());
        for key in keys {
            let local = self.queue.local_ops_for(&key);
            let current = self
                .store
                .get(&key)
                .and_then(|e| Some((e.version?, e.base?)))
                .or_else(|| {
                    let first = local.first()?;
                    Some((first.base_version?, first.base_payload.clone()?))
                });
            match self
                .store
                .apply_authoritative(&key, current, &local, self.clock.now_millis())
            {
                Ok(()) => debug!(key = %key, "stale view rebuilt"),
                Err(e) => {
                    warn!(key = %key, error = %e, "view rebuild failed");
                    self.stale_views.lock().insert(key);
                }
            }
        }
    }

    fn observed_base(&self, key: &ResourceKey) -> (Option<Version>, Option<Record>) {
        self.rebuild_stale_views();
        match self.store.get(key) {
            Some(entry) => (entry.version, entry.base),
            None => (None, None),
        }
    }

    // ---- reads -----------------------------------------------------------

    /// Fetches a resource from the server and caches it, keeping any
    /// queued local changes on top.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotConnected`] when offline, or the fetch failure.
    pub async fn refresh(&self, key: &ResourceKey) -> SyncResult<Option<CachedResource>> {
        if !self.connectivity.is_online() {
            return Err(SyncError::NotConnected);
        }
        let response = tokio::time::timeout(
            self.config.request_timeout,
            self.remote.fetch(&FetchRequest::for_key(key)),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout))?;

        let local = self.queue.local_ops_for(key);
        self.store.apply_snapshot(
            key,
            response.current.as_ref(),
            &local,
            self.clock.now_millis(),
        )?;
        Ok(self.store.get(key))
    }

    /// Reads a resource, refreshing it from the server when online and
    /// falling back to a cached copy no older than the cache max age.
    pub async fn read_resource(&self, key: &ResourceKey) -> SyncResult<Option<CachedResource>> {
        match self.refresh(key).await {
            Ok(entry) => return Ok(entry),
            Err(e) if e.is_storage() => return Err(e),
            Err(e) => debug!(key = %key, error = %e, "refresh failed, using cache"),
        }
        self.rebuild_stale_views();
        Ok(self
            .store
            .get_fresh(key, self.config.cache_max_age, self.clock.now_millis()))
    }

    /// The cached copy of a resource, regardless of age.
    pub fn cached(&self, key: &ResourceKey) -> Option<CachedResource> {
        self.rebuild_stale_views();
        self.store.get(key)
    }

    /// Cached live resources of one type.
    pub fn list(&self, resource_type: &str) -> Vec<CachedResource> {
        self.rebuild_stale_views();
        self.store.list(resource_type)
    }

    /// Drops cached resources older than the cache max age that carry no
    /// local changes.
    pub fn evict_stale_cache(&self) -> SyncResult<usize> {
        let pinned = self.queue.conflicted_keys();
        self.store
            .evict_stale(self.config.cache_max_age, self.clock.now_millis(), &pinned)
    }

    // ---- conflicts and rejections ---------------------------------------

    /// Pending conflicts.
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.queue.conflicts()
    }

    /// Settles a conflict.
    ///
    /// `KeepLocal` and `Merged` queue a new operation based on the
    /// server's version, which is returned; `KeepRemote` discards the
    /// local intent. A sync is triggered afterwards.
    pub fn resolve_conflict(
        &self,
        conflict_id: &ConflictId,
        resolution: ConflictResolution,
    ) -> SyncResult<Option<OperationId>> {
        let conflict = self
            .queue
            .conflict(conflict_id)
            .ok_or(SyncError::UnknownConflict(*conflict_id))?;

        let replacement = match &resolution {
            ConflictResolution::Pending => {
                return Err(SyncError::InvalidResolution(
                    "a resolution must be chosen".into(),
                ))
            }
            ConflictResolution::KeepRemote => None,
            ConflictResolution::KeepLocal => keep_local(&conflict),
            ConflictResolution::Merged(record) => Some(merged(&conflict, record)),
        };

        let replacement = self.queue.resolve_conflict(conflict_id, replacement)?;

        let current = conflict.remote_version.zip(conflict.remote_payload.clone());
        let local = self.queue.local_ops_for(&conflict.key);
        self.store
            .apply_authoritative(&conflict.key, current, &local, self.clock.now_millis())?;

        self.stats.write().conflicts_resolved += 1;
        info!(
            conflict = %conflict_id,
            key = %conflict.key,
            resolution = resolution_name(&resolution),
            "conflict resolved"
        );
        self.reset_state_if_idle();
        self.trigger_sync();
        Ok(replacement.map(|op| op.operation_id))
    }

    /// Clears a rejection after the user has seen it.
    pub fn acknowledge_rejection(&self, operation_id: &OperationId) -> SyncResult<()> {
        self.queue.acknowledge_rejection(operation_id)?;
        self.publish();
        Ok(())
    }

    fn reset_state_if_idle(&self) {
        if self.state().is_active() {
            self.publish();
        } else {
            self.reset_state();
        }
    }

    // ---- driving ---------------------------------------------------------

    /// Requests a sync pass from [`SyncEngine::run`]. During a pass the
    /// request is coalesced into one more pass.
    pub fn trigger_sync(&self) {
        if self.state().is_active() {
            self.rerun.store(true, Ordering::SeqCst);
        } else {
            self.trigger.notify_one();
        }
    }

    /// Stops [`SyncEngine::run`].
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Runs passes on connectivity regained, triggers and the periodic
    /// timer until [`SyncEngine::shutdown`] is called.
    pub async fn run(&self) {
        let mut online = self.connectivity.subscribe();
        let mut ticker = self.config.sync_interval.map(|period| {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        if self.connectivity.is_online() && self.queue.size() > 0 {
            self.run_logged().await;
        }

        loop {
            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() || !*online.borrow_and_update() {
                        continue;
                    }
                    debug!("connectivity regained");
                }
                _ = tick(&mut ticker) => {}
                _ = self.trigger.notified() => {}
                _ = self.shutdown.notified() => break,
            }
            if self.connectivity.is_online() {
                self.run_logged().await;
            }
        }
        debug!("sync driver stopped");
    }

    async fn run_logged(&self) {
        if let Err(e) = self.sync_now().await {
            warn!(error = %e, "sync failed");
        }
    }

    /// Runs a sync pass now, ignoring retry backoff.
    pub async fn retry_now(&self) -> SyncResult<SyncReport> {
        self.ignore_backoff.store(true, Ordering::SeqCst);
        let report = self.sync_now().await;
        self.ignore_backoff.store(false, Ordering::SeqCst);
        report
    }

    /// Runs a sync pass now.
    ///
    /// # Errors
    ///
    /// [`SyncError::NotConnected`] when offline, or a storage error. Remote
    /// failures do not fail the call; they end the pass with
    /// [`PassOutcome::Interrupted`] and are retried later.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        if !self.connectivity.is_online() {
            return Err(SyncError::NotConnected);
        }
        {
            let mut state = self.state.lock();
            if state.is_active() {
                self.rerun.store(true, Ordering::SeqCst);
                debug!("sync already running, coalesced");
                return Ok(SyncReport {
                    outcome: PassOutcome::Coalesced,
                    ..Default::default()
                });
            }
            *state = SyncState::Syncing;
        }
        self.cancelled.store(false, Ordering::SeqCst);
        self.publish();
        self.rebuild_stale_views();

        let start = Instant::now();
        let mut report = SyncReport::default();
        let result = self.drive(&mut report).await;
        report.duration = start.elapsed();

        *self.progress.lock() = None;
        self.record_stats(&report);
        self.reset_state();

        match result {
            Ok(()) => {
                info!(
                    outcome = ?report.outcome,
                    applied = report.applied,
                    rejected = report.rejected,
                    conflicted = report.conflicted,
                    deferred = report.deferred,
                    "sync finished"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "sync aborted");
                Err(e)
            }
        }
    }

    async fn drive(&self, report: &mut SyncReport) -> SyncResult<()> {
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            report.outcome = self.run_pass(report).await?;
            report.passes += 1;

            let again = report.outcome == PassOutcome::Completed
                && self.rerun.load(Ordering::SeqCst)
                && self.connectivity.is_online();
            if !again {
                break;
            }
            debug!("running coalesced pass");
        }

        if report.outcome == PassOutcome::Completed {
            self.store.set_last_sync(self.clock.now_millis())?;
        }
        self.queue.prune()?;
        self.queue.maybe_compact(self.config.compact_threshold)?;
        self.store.maybe_compact(self.config.compact_threshold)?;
        Ok(())
    }

    fn record_stats(&self, report: &SyncReport) {
        let mut stats = self.stats.write();
        match &report.outcome {
            PassOutcome::Completed => stats.passes_completed += 1,
            PassOutcome::Interrupted { error } => {
                stats.passes_interrupted += 1;
                stats.last_error = Some(error.clone());
            }
            PassOutcome::Cancelled => stats.passes_cancelled += 1,
            PassOutcome::Coalesced => {}
        }
        stats.operations_applied += report.applied as u64;
        stats.operations_rejected += report.rejected as u64;
        stats.conflicts_detected += report.conflicted as u64;
        stats.conflicts_auto_resolved += report.auto_resolved as u64;
        stats.last_pass_duration = Some(report.duration);
    }

    async fn run_pass(&self, report: &mut SyncReport) -> SyncResult<PassOutcome> {
        let cutoff = self.queue.high_water();
        let total = self.queue.pending_up_to(cutoff);
        *self.progress.lock() = Some(SyncProgress {
            total,
            completed: 0,
            current: None,
        });
        debug!(cutoff, total, "sync pass started");

        let mut blocked: HashSet<ResourceKey> = self.queue.conflicted_keys().into_iter().collect();
        let ignore_backoff = self.ignore_backoff.swap(false, Ordering::SeqCst);
        let mut cursor = 0;

        loop {
            let batch = self
                .queue
                .batch_after(cursor, cutoff, self.config.batch_size);
            if batch.is_empty() {
                return Ok(PassOutcome::Completed);
            }

            for queued in batch {
                cursor = queued.seq;
                if self.check_cancelled().is_err() {
                    debug!("sync pass cancelled");
                    return Ok(PassOutcome::Cancelled);
                }

                // An earlier apply in this pass may have remapped or
                // rebased the operation.
                let Some(op) = self.queue.get(&queued.operation_id) else {
                    continue;
                };
                if op.is_terminal() {
                    continue;
                }

                let key = op.key();
                let now = self.clock.now_millis();
                let backing_off = !ignore_backoff && op.next_attempt_at.is_some_and(|at| at > now);
                if blocked.contains(&key) || backing_off {
                    blocked.insert(key);
                    report.deferred += 1;
                    self.advance_progress(None);
                    continue;
                }

                self.advance_progress(Some(key.clone()));
                match self.process(op, report).await? {
                    Step::Settled => {}
                    Step::Blocked => {
                        blocked.insert(key);
                    }
                    Step::Interrupted(error) => {
                        return Ok(PassOutcome::Interrupted { error });
                    }
                }
            }
        }
    }

    fn advance_progress(&self, current: Option<ResourceKey>) {
        if let Some(progress) = self.progress.lock().as_mut() {
            match current {
                Some(key) => progress.current = Some(key),
                None => progress.completed += 1,
            }
        }
    }

    fn settle_progress(&self) {
        if let Some(progress) = self.progress.lock().as_mut() {
            progress.completed += 1;
            progress.current = None;
        }
    }

    async fn submit(&self, op: &Operation) -> SyncResult<SubmitResponse> {
        tokio::time::timeout(
            self.config.request_timeout,
            self.remote.submit(&op.to_request()),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout))
    }

    async fn process(&self, op: Operation, report: &mut SyncReport) -> SyncResult<Step> {
        let response = match self.submit(&op).await {
            Ok(response) => response,
            Err(e) => return self.record_failure(&op, e),
        };

        match response {
            SubmitResponse::VersionMismatch { current } => {
                self.reconcile(op, current, report).await
            }
            response => self.settle(&op, response, report),
        }
    }

    /// Records an Applied or Rejected response.
    fn settle(
        &self,
        op: &Operation,
        response: SubmitResponse,
        report: &mut SyncReport,
    ) -> SyncResult<Step> {
        match response {
            SubmitResponse::Applied {
                resource_id,
                version,
                payload,
                replayed,
            } => {
                self.settle_applied(op, resource_id, version, payload)?;
                if replayed {
                    debug!(operation = %op.operation_id, "server had already applied operation");
                }
                report.applied += 1;
            }
            SubmitResponse::Rejected { reason } => {
                self.queue.mark_rejected(&op.operation_id, reason.as_str())?;
                warn!(operation = %op.operation_id, key = %op.key(), reason = %reason, "operation rejected");
                self.refresh_view(&op.key())?;
                report.rejected += 1;
            }
            SubmitResponse::VersionMismatch { .. } => {
                return self.record_failure(
                    op,
                    SyncError::Protocol("resource changed again while merging".into()),
                );
            }
        }
        self.settle_progress();
        self.publish();
        Ok(Step::Settled)
    }

    fn settle_applied(
        &self,
        op: &Operation,
        resource_id: String,
        version: Version,
        payload: Option<Record>,
    ) -> SyncResult<()> {
        let old_key = op.key();
        let new_key = ResourceKey::new(op.resource_type.clone(), resource_id.clone());

        let payload = match (op.kind, payload) {
            (OperationKind::Delete, _) => None,
            (_, Some(payload)) => Some(payload),
            (_, None) => {
                let base = self.store.get(&old_key).and_then(|e| e.base);
                replay(base.as_ref(), std::slice::from_ref(op))
            }
        };

        self.queue.complete(
            &op.operation_id,
            AppliedOutcome {
                resource_id,
                version,
                payload: payload.clone(),
            },
        )?;

        if new_key != old_key {
            debug!(from = %old_key, to = %new_key, "provisional id remapped");
            self.store.remove(&old_key)?;
        }
        let local = self.queue.local_ops_for(&new_key);
        self.store.apply_authoritative(
            &new_key,
            payload.map(|p| (version, p)),
            &local,
            self.clock.now_millis(),
        )?;
        debug!(operation = %op.operation_id, key = %new_key, %version, "operation applied");
        Ok(())
    }

    async fn reconcile(
        &self,
        op: Operation,
        current: Option<ResourceSnapshot>,
        report: &mut SyncReport,
    ) -> SyncResult<Step> {
        let now = self.clock.now_millis();
        match self.detector.check(&op, current.as_ref(), now) {
            Verdict::Clean => self.record_failure(
                &op,
                SyncError::Protocol("server refused a matching base version".into()),
            ),
            Verdict::AutoResolved(Resolution::NoOp) => {
                self.queue.mark_applied(&op.operation_id)?;
                self.adopt_remote(&op.key(), current.as_ref())?;
                report.auto_resolved += 1;
                self.settle_progress();
                self.publish();
                Ok(Step::Settled)
            }
            Verdict::AutoResolved(Resolution::KeepRemote(conflict)) => {
                let conflict_id = conflict.conflict_id;
                self.queue.mark_conflicted(&op.operation_id, conflict)?;
                self.queue.resolve_conflict(&conflict_id, None)?;
                self.adopt_remote(&op.key(), current.as_ref())?;
                info!(
                    operation = %op.operation_id,
                    key = %op.key(),
                    policy = %self.detector.policy(),
                    "local change superseded by server state"
                );
                report.auto_resolved += 1;
                self.settle_progress();
                self.publish();
                Ok(Step::Settled)
            }
            Verdict::AutoResolved(Resolution::Submit(rebased)) => {
                self.queue.rebase(rebased.clone())?;
                report.auto_resolved += 1;
                debug!(operation = %rebased.operation_id, base = ?rebased.base_version, "operation merged onto server version");
                match self.submit(&rebased).await {
                    Ok(response) => self.settle(&rebased, response, report),
                    Err(e) => self.record_failure(&rebased, e),
                }
            }
            Verdict::Conflict(conflict) => {
                warn!(
                    conflict = %conflict.conflict_id,
                    key = %conflict.key,
                    fields = ?conflict.conflicting_fields,
                    "conflict detected"
                );
                self.queue.mark_conflicted(&op.operation_id, conflict)?;
                report.conflicted += 1;
                self.settle_progress();
                self.publish();
                Ok(Step::Blocked)
            }
        }
    }

    fn adopt_remote(&self, key: &ResourceKey, current: Option<&ResourceSnapshot>) -> SyncResult<()> {
        let local = self.queue.local_ops_for(key);
        self.store
            .apply_snapshot(key, current, &local, self.clock.now_millis())
    }

    fn refresh_view(&self, key: &ResourceKey) -> SyncResult<()> {
        let local = self.queue.local_ops_for(key);
        self.store.refresh_view(key, &local, self.clock.now_millis())
    }

    /// Records a transient failure on `op` and stops the pass.
    fn record_failure(&self, op: &Operation, error: SyncError) -> SyncResult<Step> {
        let attempts = op.attempt_count.saturating_add(1);
        let delay = self.config.retry.delay_for_attempt(attempts);
        let next_attempt_at = self
            .clock
            .now_millis()
            .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        let message = error.to_string();

        self.queue
            .record_attempt(&op.operation_id, message.as_str(), Some(next_attempt_at))?;
        {
            let mut stats = self.stats.write();
            stats.retries += 1;
            stats.last_error = Some(message.clone());
        }

        if attempts >= self.config.retry.max_attempts {
            warn!(
                operation = %op.operation_id,
                key = %op.key(),
                attempts,
                error = %message,
                "operation keeps failing"
            );
        } else {
            debug!(operation = %op.operation_id, attempts, ?delay, error = %message, "transient failure, will retry");
        }
        self.publish();
        Ok(Step::Interrupted(message))
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn resolution_name(resolution: &ConflictResolution) -> &'static str {
    match resolution {
        ConflictResolution::Pending => "pending",
        ConflictResolution::KeepLocal => "keep-local",
        ConflictResolution::KeepRemote => "keep-remote",
        ConflictResolution::Merged(_) => "merged",
    }
}

/// The local intent re-expressed against the server's current state.
fn keep_local(conflict: &Conflict) -> Option<OperationInput> {
    let key = &conflict.key;
    match (conflict.kind, conflict.remote_version) {
        (OperationKind::Delete, Some(version)) => Some(OperationInput::delete(
            key.resource_type.clone(),
            key.resource_id.clone(),
            Some(version),
            conflict.remote_payload.clone(),
        )),
        (OperationKind::Delete, None) => None,
        (_, Some(version)) => Some(OperationInput::update(
            key.resource_type.clone(),
            key.resource_id.clone(),
            conflict.local_payload.clone().unwrap_or_default(),
            Some(version),
            conflict.remote_payload.clone(),
        )),
        (_, None) => {
            let base = conflict.base_payload.clone().unwrap_or_default();
            let record = match &conflict.local_payload {
                Some(patch) => apply_patch(&base, patch),
                None => base,
            };
            Some(OperationInput::create(
                key.resource_type.clone(),
                key.resource_id.clone(),
                record,
            ))
        }
    }
}

/// An operation that turns the server's record into `record`.
fn merged(conflict: &Conflict, record: &Record) -> OperationInput {
    let key = &conflict.key;
    match (conflict.remote_version, &conflict.remote_payload) {
        (Some(version), Some(remote)) => OperationInput::update(
            key.resource_type.clone(),
            key.resource_id.clone(),
            replacement_patch(remote, record),
            Some(version),
            Some(remote.clone()),
        ),
        _ => OperationInput::create(
            key.resource_type.clone(),
            key.resource_id.clone(),
            record.clone(),
        ),
    }
}
