//! The Shape Store: canonical shape and layer state for one project.
//!
//! Local mutations apply immediately, record undo history, and are handed to
//! the sync channel (or the offline queue when that is not possible). Remote
//! changes arrive through the channel's inbox and are merged with
//! last-writer-wins on `(client_updated_at, updated_by)`.
//!
//! Each shape moves through a small state machine:
//!
//! ```text
//!            local write                 own echo
//!   ┌──────────────────────▶ LocalPending ─────────▶ Confirmed
//!   │                             │                      │
//!   │                 newer remote│write                 │
//!   │                             ▼                      │
//!   └───────────────────── RemoteOverridden ◀────────────┘ (any remote write)
//! ```
//!
//! The store is driven from a single thread. Call [`ShapeStore::poll`]
//! regularly to process inbound changes, replay the offline queue, sweep
//! stale locks and send presence heartbeats.

use crate::clock::{Clock, MonotonicStamp, Timestamp};
use crate::config::SyncConfig;
use crate::docstore::{Collection, DocChange, DocPath, DocumentStore};
use crate::error::{SyncError, SyncResult, ValidationError};
use crate::ids::{GroupId, LayerId, OpId, ProjectId, ShapeId, UserId};
use crate::layers::{Layer, LayerPatch, LayerSet};
use crate::locks::{Lock, LockManager, LockOutcome, RemoteLock};
use crate::offline::{ConnectionStatus, OfflineQueue, PersistentFailure, QueuedOperation};
use crate::ops::{Entity, Operation, Payload};
use crate::presence::{
    PresenceListener, PresenceListenerId, PresenceRecord, PresenceTracker, PresenceView,
};
use crate::recent::RecentSet;
use crate::shapes::{SerializableColor, Shape, ShapeDraft, ShapePatch};
use crate::storage::KeyValueStorage;
use crate::sync::{InboundEvent, SyncChannel};
use crate::undo::UndoStack;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

/// How many un-echoed op ids are remembered.
const OWN_OPS_CAPACITY: usize = 4096;

/// Synchronization state of a single shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeSyncState {
    /// Changed locally; the remote store has not echoed it back yet.
    LocalPending,
    /// The remote store holds what we hold.
    Confirmed,
    /// A newer remote write replaced a pending local change.
    RemoteOverridden,
}

/// A reversible change to the shape map, as kept in undo history.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeChange {
    Put(Shape),
    Remove(ShapeId),
}

/// A remote write that lost to newer local state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDiscard {
    pub shape_id: ShapeId,
    pub local_stamp: Timestamp,
    pub remote_stamp: Timestamp,
    pub remote_author: UserId,
}

/// A remote change to one shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteShapeEvent {
    Upsert { shape: Shape, op_id: Option<OpId> },
    Delete { shape_id: ShapeId, op_id: Option<OpId> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Remote state replaced or added to local state.
    Applied,
    /// Our own write came back.
    Confirmed,
    /// Local state is newer; the remote write was dropped.
    Discarded(ConflictDiscard),
    Removed,
    /// Nothing to do (stale echo, late write to a deleted shape, unknown id).
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    Undo,
    Redo,
}

/// Aggregate sync state for the UI.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncStatus {
    pub connection: ConnectionStatus,
    pub queued: usize,
    pub failure: Option<PersistentFailure>,
}

/// Notifications sent to store listeners after each committed change.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ShapesChanged {
        ids: Vec<ShapeId>,
        origin: ChangeOrigin,
    },
    LayersChanged,
    LocksChanged,
    /// A concurrent editor won the lock we were holding.
    LockLost {
        shape_id: ShapeId,
        holder: UserId,
    },
    ConflictDiscarded(ConflictDiscard),
    StatusChanged(SyncStatus),
}

/// Store listeners must not call back into the store.
pub type StoreListener = Box<dyn FnMut(&StoreEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The user this store acts for.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUser {
    pub id: UserId,
    pub display_name: String,
    pub color: SerializableColor,
}

impl LocalUser {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            display_name: display_name.into(),
            color: SerializableColor::black(),
        }
    }

    pub fn with_color(mut self, color: SerializableColor) -> Self {
        self.color = color;
        self
    }
}

/// External collaborators a store is built on.
#[derive(Clone)]
pub struct Backends {
    pub documents: Rc<dyn DocumentStore>,
    pub storage: Arc<dyn KeyValueStorage>,
    pub clock: Rc<dyn Clock>,
}

pub struct ShapeStore {
    project: ProjectId,
    user: LocalUser,
    clock: Rc<dyn Clock>,
    config: SyncConfig,
    shapes: HashMap<ShapeId, Shape>,
    states: HashMap<ShapeId, ShapeSyncState>,
    /// Latest local op per shape. Its echo confirms the shape.
    pending_ops: HashMap<ShapeId, OpId>,
    /// Ops issued here whose echo has not been seen yet.
    own_ops: RecentSet<OpId>,
    /// Published ops still waiting for their echo, oldest first. They go
    /// back to the offline queue if the connection drops.
    unacked: Vec<Operation>,
    /// Deleted ids and the stamp of their deletion.
    tombstones: HashMap<ShapeId, Timestamp>,
    layers: LayerSet,
    locks: LockManager,
    presence: PresenceTracker,
    queue: OfflineQueue,
    history: UndoStack<ShapeChange>,
    channel: SyncChannel,
    stamps: MonotonicStamp,
    listeners: Vec<(ListenerId, StoreListener)>,
    next_listener: u64,
    last_sweep: Timestamp,
    last_status: SyncStatus,
}

impl ShapeStore {
    /// Build the store for `project`: load the persisted offline queue,
    /// subscribe, and apply the initial snapshots.
    pub fn open(
        project: ProjectId,
        user: LocalUser,
        backends: Backends,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        let queue = OfflineQueue::open(&project, backends.storage, &config)?;
        let mut channel = SyncChannel::new(project.clone(), backends.documents, &config);
        if channel.is_connected() {
            if let Err(e) = channel.subscribe() {
                log::warn!("Initial subscribe for {} failed: {}", project, e);
            }
        }
        let presence = PresenceTracker::new(
            user.id.clone(),
            user.display_name.clone(),
            user.color,
            config.presence_timeout_ms,
            config.heartbeat_interval_ms,
        );
        let now = backends.clock.now();

        let mut store = Self {
            project,
            user,
            clock: backends.clock,
            locks: LockManager::new(config.lock_ttl_ms),
            history: UndoStack::new(config.undo_depth),
            config,
            shapes: HashMap::new(),
            states: HashMap::new(),
            pending_ops: HashMap::new(),
            own_ops: RecentSet::new(OWN_OPS_CAPACITY),
            unacked: Vec::new(),
            tombstones: HashMap::new(),
            layers: LayerSet::new(),
            presence,
            queue,
            channel,
            stamps: MonotonicStamp::new(),
            listeners: Vec::new(),
            next_listener: 0,
            last_sweep: now,
            last_status: SyncStatus::default(),
        };
        store.restore_queued();
        store.process_inbound(now);
        store.last_status = store.status();
        Ok(store)
    }

    /// Re-apply operations left in the queue by a previous session.
    fn restore_queued(&mut self) {
        let queued: Vec<QueuedOperation> = self.queue.iter().cloned().collect();
        for q in queued {
            self.own_ops.insert(q.op.op_id);
            if let Some(id) = q.op.shape_id() {
                self.pending_ops.insert(id, q.op.op_id);
            }
            match q.op.payload {
                Payload::Create {
                    entity: Entity::Shape(shape),
                }
                | Payload::Update {
                    entity: Entity::Shape(shape),
                } => {
                    self.stamps.observe(shape.client_updated_at);
                    self.states.insert(shape.id, ShapeSyncState::LocalPending);
                    self.shapes.insert(shape.id, shape);
                }
                Payload::Create {
                    entity: Entity::Layer(layer),
                }
                | Payload::Update {
                    entity: Entity::Layer(layer),
                } => {
                    self.layers.merge_remote(layer);
                }
                Payload::Delete { shape_id } => {
                    // Tombstone even if the shape only exists remotely, so the
                    // snapshot does not bring it back before replay.
                    let floor = self
                        .shapes
                        .remove(&shape_id)
                        .map_or(0, |shape| shape.client_updated_at);
                    self.tombstones.insert(shape_id, floor.max(q.enqueued_at));
                    self.states.remove(&shape_id);
                }
                Payload::Reorder { layers } => {
                    for layer in layers {
                        self.layers.merge_remote(layer);
                    }
                }
            }
        }
    }

    /// The project this store is bound to.
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// The user local writes are attributed to.
    pub fn user(&self) -> &LocalUser {
        &self.user
    }

    // ------------------------------------------------------------------
    // Shape mutations
    // ------------------------------------------------------------------

    /// Insert a new shape.
    ///
    /// Rejected before any state changes if the geometry is malformed, the
    /// layer does not exist, or the id is taken or was deleted this session.
    /// Persistence happens in the background; this never fails for network
    /// reasons.
    pub fn create(&mut self, draft: ShapeDraft) -> Result<ShapeId, ValidationError> {
        let id = draft.id;
        if self.shapes.contains_key(&id) {
            return Err(ValidationError::DuplicateShape(id));
        }
        if self.tombstones.contains_key(&id) {
            return Err(ValidationError::ReusedShapeId(id));
        }
        let layer = self.layers.resolve(draft.layer_id.as_ref());
        if !self.layers.contains(&layer) {
            return Err(ValidationError::UnknownLayer { id, layer });
        }

        let now = self.clock.now();
        let mut shape = Shape::from_draft(draft, layer, &self.user.id, now);
        shape.client_updated_at = self.stamps.next(now);
        shape.validate()?;

        self.shapes.insert(id, shape.clone());
        self.states.insert(id, ShapeSyncState::LocalPending);
        self.history
            .record(ShapeChange::Put(shape.clone()), ShapeChange::Remove(id), None);
        self.persist(Operation::create_shape(shape));
        self.notify(StoreEvent::ShapesChanged {
            ids: vec![id],
            origin: ChangeOrigin::Local,
        });
        self.check_status();
        Ok(id)
    }

    /// Merge `patch` into shape `id`.
    ///
    /// Returns `Ok(false)` if the id is unknown or the patch is empty.
    pub fn update(&mut self, id: ShapeId, patch: ShapePatch) -> Result<bool, ValidationError> {
        if patch.is_empty() {
            return Ok(false);
        }
        let Some(previous) = self.shapes.get(&id).cloned() else {
            return Ok(false);
        };
        if let Some(layer) = &patch.layer_id {
            if !self.layers.contains(layer) {
                return Err(ValidationError::UnknownLayer {
                    id,
                    layer: layer.clone(),
                });
            }
        }
        let mut next = previous.clone();
        patch.apply_to(&mut next);
        next.validate()?;

        let now = self.clock.now();
        let stamp = self.stamps.next_after(now, previous.client_updated_at);
        next.touch(&self.user.id, now, stamp);

        self.shapes.insert(id, next.clone());
        self.states.insert(id, ShapeSyncState::LocalPending);
        self.history
            .record(ShapeChange::Put(next.clone()), ShapeChange::Put(previous), None);
        self.persist(Operation::update_shape(next));
        self.notify(StoreEvent::ShapesChanged {
            ids: vec![id],
            origin: ChangeOrigin::Local,
        });
        self.check_status();
        Ok(true)
    }

    /// Delete shapes. Several ids are undone and redone together.
    ///
    /// Returns the number of shapes removed.
    pub fn delete(&mut self, ids: &[ShapeId]) -> usize {
        let group = (ids.len() > 1).then(GroupId::new);
        let now = self.clock.now();
        let mut removed = Vec::new();
        for &id in ids {
            let Some(shape) = self.shapes.get(&id).cloned() else {
                continue;
            };
            if self.remove_local(id, now) {
                self.history
                    .record(ShapeChange::Remove(id), ShapeChange::Put(shape), group);
                removed.push(id);
            }
        }
        let count = removed.len();
        if count > 0 {
            self.notify(StoreEvent::ShapesChanged {
                ids: removed,
                origin: ChangeOrigin::Local,
            });
            self.check_status();
        }
        count
    }

    /// Remove a shape locally, tombstone it, drop our lock on it and persist
    /// the deletion.
    fn remove_local(&mut self, id: ShapeId, now: Timestamp) -> bool {
        let Some(shape) = self.shapes.remove(&id) else {
            return false;
        };
        let stamp = self.stamps.next_after(now, shape.client_updated_at);
        self.tombstones.insert(id, stamp);
        self.states.remove(&id);
        if self.locks.release(id, &self.user.id).is_some() {
            self.publish_lock_release(id);
        }
        self.persist(Operation::delete_shape(id));
        true
    }

    // ------------------------------------------------------------------
    // Undo / redo
    // ------------------------------------------------------------------

    /// Revert the latest local step. Returns false if there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let Some(changes) = self.history.undo() else {
            return false;
        };
        self.apply_history(changes, ChangeOrigin::Undo);
        true
    }

    /// Re-apply the latest undone step. Returns false if there is nothing to redo.
    pub fn redo(&mut self) -> bool {
        let Some(changes) = self.history.redo() else {
            return false;
        };
        self.apply_history(changes, ChangeOrigin::Redo);
        true
    }

    /// Whether `undo` has a step to revert.
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    /// Whether `redo` has a step to re-apply.
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Apply history changes as fresh local writes so they win against
    /// everything already published.
    fn apply_history(&mut self, changes: Vec<ShapeChange>, origin: ChangeOrigin) {
        let now = self.clock.now();
        let mut ids = Vec::new();
        for change in changes {
            match change {
                ShapeChange::Put(mut shape) => {
                    let id = shape.id;
                    let floor = [
                        Some(shape.client_updated_at),
                        self.shapes.get(&id).map(|s| s.client_updated_at),
                        self.tombstones.get(&id).copied(),
                    ]
                    .into_iter()
                    .flatten()
                    .max()
                    .unwrap_or_default();
                    let stamp = self.stamps.next_after(now, floor);
                    shape.touch(&self.user.id, now, stamp);

                    // Restoring a deleted shape reuses its id on purpose.
                    self.tombstones.remove(&id);
                    let existed = self.shapes.insert(id, shape.clone()).is_some();
                    self.states.insert(id, ShapeSyncState::LocalPending);
                    let op = if existed {
                        Operation::update_shape(shape)
                    } else {
                        Operation::create_shape(shape)
                    };
                    self.persist(op);
                    ids.push(id);
                }
                ShapeChange::Remove(id) => {
                    if self.remove_local(id, now) {
                        ids.push(id);
                    }
                }
            }
        }
        if !ids.is_empty() {
            self.notify(StoreEvent::ShapesChanged { ids, origin });
        }
        self.check_status();
    }

    // ------------------------------------------------------------------
    // Edit gestures
    // ------------------------------------------------------------------

    /// Start editing a shape: take (or renew) our lock on it.
    ///
    /// Pending remote lock changes are applied first. Returns `None` if the
    /// shape does not exist.
    pub fn begin_edit(&mut self, id: ShapeId) -> Option<LockOutcome> {
        let now = self.clock.now();
        self.process_inbound(now);
        if !self.shapes.contains_key(&id) {
            return None;
        }
        let outcome = self.locks.acquire(id, &self.user.id, now);
        match &outcome {
            LockOutcome::Granted(lock) => {
                self.publish_lock(lock);
                self.notify(StoreEvent::LocksChanged);
            }
            LockOutcome::Denied(denied) => {
                log::debug!("Lock on {} held by {}", id, denied.holder);
            }
        }
        Some(outcome)
    }

    /// Finish editing a shape. Returns false if we did not hold its lock.
    pub fn end_edit(&mut self, id: ShapeId) -> bool {
        if self.locks.release(id, &self.user.id).is_none() {
            return false;
        }
        self.publish_lock_release(id);
        self.notify(StoreEvent::LocksChanged);
        true
    }

    /// The live lock on `id`, if any.
    pub fn lock(&self, id: ShapeId) -> Option<&Lock> {
        self.locks.get(id, self.clock.now())
    }

    /// Edit locks as currently known, expired entries included until swept.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    fn publish_lock(&self, lock: &Lock) {
        let result = serde_json::to_value(lock)
            .map_err(SyncError::from)
            .and_then(|value| {
                self.channel
                    .write_ephemeral(Collection::Locks, &lock.shape_id.to_string(), Some(value))
            });
        if let Err(e) = result {
            log::warn!("Failed to publish lock on {}: {}", lock.shape_id, e);
        }
    }

    fn publish_lock_release(&self, id: ShapeId) {
        if let Err(e) = self
            .channel
            .write_ephemeral(Collection::Locks, &id.to_string(), None)
        {
            log::warn!("Failed to publish release of lock on {}: {}", id, e);
        }
    }

    // ------------------------------------------------------------------
    // Layers
    // ------------------------------------------------------------------

    pub fn layers(&self) -> &LayerSet {
        &self.layers
    }

    /// Add a layer on top of the stack.
    pub fn add_layer(
        &mut self,
        name: impl Into<String>,
        color: SerializableColor,
    ) -> Result<LayerId, ValidationError> {
        let now = self.clock.now();
        let mut layer = Layer::new(LayerId::generate(), name, color);
        layer.order = self.layers.next_order();
        layer.updated_by = self.user.id.clone();
        layer.client_updated_at = self.stamps.next(now);
        let id = layer.id.clone();

        self.layers.insert(layer.clone())?;
        self.persist(Operation::create_layer(layer));
        self.notify(StoreEvent::LayersChanged);
        self.check_status();
        Ok(id)
    }

    /// Change a layer's name, color or visibility. Returns false if unknown.
    pub fn update_layer(&mut self, id: &LayerId, patch: &LayerPatch) -> bool {
        let now = self.clock.now();
        let Some(floor) = self.layers.get(id).map(|l| l.client_updated_at) else {
            return false;
        };
        let stamp = self.stamps.next_after(now, floor);
        let Some(layer) = self.layers.patch(id, patch) else {
            return false;
        };
        layer.updated_by = self.user.id.clone();
        layer.client_updated_at = stamp;
        let layer = layer.clone();

        self.persist(Operation::update_layer(layer));
        self.notify(StoreEvent::LayersChanged);
        self.check_status();
        true
    }

    /// Choose the layer new shapes land on. Local to this client.
    pub fn set_active_layer(&mut self, id: &LayerId) -> bool {
        let changed = self.layers.set_active(id);
        if changed {
            self.notify(StoreEvent::LayersChanged);
        }
        changed
    }

    /// Restack layers bottom to top. `order` must list every layer once.
    pub fn reorder_layers(&mut self, order: &[LayerId]) -> Result<(), ValidationError> {
        let changed = self.layers.reorder(order)?;
        if changed.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut updated = Vec::with_capacity(changed.len());
        for id in &changed {
            if let Some(layer) = self.layers.get_mut(id) {
                layer.updated_by = self.user.id.clone();
                layer.client_updated_at = self.stamps.next_after(now, layer.client_updated_at);
                updated.push(layer.clone());
            }
        }
        self.persist(Operation::reorder(updated));
        self.notify(StoreEvent::LayersChanged);
        self.check_status();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote reconciliation
    // ------------------------------------------------------------------

    /// Merge one remote shape change into local state.
    ///
    /// Remote changes never enter undo history.
    pub fn reconcile_remote(&mut self, event: RemoteShapeEvent) -> ReconcileOutcome {
        let (id, outcome) = match event {
            RemoteShapeEvent::Upsert { shape, op_id } => {
                (shape.id, self.reconcile_upsert(shape, op_id))
            }
            RemoteShapeEvent::Delete { shape_id, op_id } => {
                (shape_id, self.reconcile_delete(shape_id, op_id))
            }
        };
        match &outcome {
            ReconcileOutcome::Applied | ReconcileOutcome::Removed => {
                self.notify(StoreEvent::ShapesChanged {
                    ids: vec![id],
                    origin: ChangeOrigin::Remote,
                });
            }
            ReconcileOutcome::Discarded(discard) => {
                self.notify(StoreEvent::ConflictDiscarded(discard.clone()));
            }
            ReconcileOutcome::Confirmed | ReconcileOutcome::Ignored => {}
        }
        outcome
    }

    fn reconcile_upsert(&mut self, remote: Shape, op_id: Option<OpId>) -> ReconcileOutcome {
        let id = remote.id;
        if self.take_own(op_id) {
            // Only the echo of our latest write confirms the shape.
            if self.pending_ops.get(&id).copied() == op_id {
                self.pending_ops.remove(&id);
                if self.shapes.contains_key(&id) {
                    self.states.insert(id, ShapeSyncState::Confirmed);
                    log::debug!("Confirmed {}", id);
                    return ReconcileOutcome::Confirmed;
                }
            }
            return ReconcileOutcome::Ignored;
        }

        let horizon = self.clock.now().saturating_add(self.config.max_clock_skew_ms);
        if remote.client_updated_at > horizon {
            log::warn!(
                "Rejecting shape {} stamped {} by {}, too far ahead of local time",
                id,
                remote.client_updated_at,
                remote.updated_by
            );
            return ReconcileOutcome::Ignored;
        }

        if let Some(&deleted_at) = self.tombstones.get(&id) {
            if remote.client_updated_at <= deleted_at {
                log::debug!("Ignoring late write to deleted shape {}", id);
                return ReconcileOutcome::Ignored;
            }
            self.tombstones.remove(&id);
        }

        match self.shapes.get(&id) {
            Some(local) if *local == remote => {
                // The remote store holds our latest write even if its echo
                // never arrived.
                if let Some(op) = self.pending_ops.get(&id).copied() {
                    if !self.queue.contains(op) {
                        self.pending_ops.remove(&id);
                        self.own_ops.remove(&op);
                        self.unacked.retain(|u| u.op_id != op);
                    }
                }
                if !self.pending_ops.contains_key(&id) {
                    self.states.insert(id, ShapeSyncState::Confirmed);
                }
                ReconcileOutcome::Confirmed
            }
            Some(local) if !local.is_superseded_by(&remote) => {
                let discard = ConflictDiscard {
                    shape_id: id,
                    local_stamp: local.client_updated_at,
                    remote_stamp: remote.client_updated_at,
                    remote_author: remote.updated_by.clone(),
                };
                log::debug!(
                    "Discarding remote write to {} ({} <= {})",
                    id,
                    discard.remote_stamp,
                    discard.local_stamp
                );
                ReconcileOutcome::Discarded(discard)
            }
            Some(_) => {
                let state = if self.pending_ops.remove(&id).is_some() {
                    ShapeSyncState::RemoteOverridden
                } else {
                    ShapeSyncState::Confirmed
                };
                self.stamps.observe(remote.client_updated_at);
                self.states.insert(id, state);
                self.shapes.insert(id, remote);
                ReconcileOutcome::Applied
            }
            None => {
                self.stamps.observe(remote.client_updated_at);
                self.states.insert(id, ShapeSyncState::Confirmed);
                self.shapes.insert(id, remote);
                ReconcileOutcome::Applied
            }
        }
    }

    fn reconcile_delete(&mut self, id: ShapeId, op_id: Option<OpId>) -> ReconcileOutcome {
        if self.take_own(op_id) {
            if self.pending_ops.get(&id).copied() == op_id {
                self.pending_ops.remove(&id);
            }
            return ReconcileOutcome::Ignored;
        }
        let Some(shape) = self.shapes.remove(&id) else {
            return ReconcileOutcome::Ignored;
        };
        self.tombstones.insert(id, shape.client_updated_at);
        self.states.remove(&id);
        if self.locks.release(id, &self.user.id).is_some() {
            self.publish_lock_release(id);
        }
        if self.pending_ops.remove(&id).is_some() {
            // Our unechoed write reaches the remote store after this delete
            // and would bring the shape back there. Delete it again so every
            // replica ends up without it.
            log::debug!("Re-deleting {} behind our pending write", id);
            self.persist(Operation::delete_shape(id));
        }
        ReconcileOutcome::Removed
    }

    /// Whether `op_id` is one of ours still awaiting its echo. Settles it.
    fn take_own(&mut self, op_id: Option<OpId>) -> bool {
        let Some(op_id) = op_id else {
            return false;
        };
        if !self.own_ops.remove(&op_id) {
            return false;
        }
        self.unacked.retain(|u| u.op_id != op_id);
        true
    }

    /// Whether local changes to `id` have not reached the remote store.
    fn is_pending(&self, id: ShapeId) -> bool {
        self.pending_ops.contains_key(&id) || self.queue.touches_shape(id)
    }

    fn doc_key(&self, path: &str) -> Option<String> {
        match DocPath::parse(path) {
            Ok(doc) if doc.project == self.project => Some(doc.key),
            Ok(doc) => {
                log::warn!("Ignoring change for foreign project {}", doc.project);
                None
            }
            Err(e) => {
                log::warn!("Ignoring change: {}", e);
                None
            }
        }
    }

    fn shape_key(&self, path: &str) -> Option<ShapeId> {
        let key = self.doc_key(path)?;
        match Uuid::parse_str(&key) {
            Ok(id) => Some(id),
            Err(_) => {
                log::warn!("Ignoring document with malformed shape id: {}", path);
                None
            }
        }
    }

    fn process_inbound(&mut self, now: Timestamp) {
        for event in self.channel.drain() {
            match event {
                InboundEvent::Error(e) => {
                    log::warn!("Subscription error for {}: {}", self.project, e);
                    if e.is_network() {
                        self.requeue_unacked(now);
                    }
                }
                InboundEvent::Changes {
                    collection,
                    initial,
                    changes,
                } => match collection {
                    Collection::Shapes => self.apply_shape_changes(initial, changes),
                    Collection::Layers => self.apply_layer_changes(changes),
                    Collection::Locks => self.apply_lock_changes(changes, now),
                    Collection::Presence => self.apply_presence_changes(changes, now),
                },
            }
        }
    }

    fn apply_shape_changes(&mut self, initial: bool, changes: Vec<DocChange>) {
        let mut seen = HashSet::new();
        for change in changes {
            let Some(id) = self.shape_key(&change.path) else {
                continue;
            };
            seen.insert(id);
            let event = match change.value {
                None => RemoteShapeEvent::Delete {
                    shape_id: id,
                    op_id: change.op_id,
                },
                Some(value) => match serde_json::from_value::<Shape>(value) {
                    Ok(shape) if shape.id == id => RemoteShapeEvent::Upsert {
                        shape,
                        op_id: change.op_id,
                    },
                    Ok(_) => {
                        log::warn!("Shape id does not match its path: {}", change.path);
                        continue;
                    }
                    Err(e) => {
                        log::warn!("Malformed shape document {}: {}", change.path, e);
                        continue;
                    }
                },
            };
            self.reconcile_remote(event);
        }

        if initial {
            // A snapshot is authoritative for everything not still in flight.
            let missing: Vec<ShapeId> = self
                .shapes
                .keys()
                .copied()
                .filter(|id| !seen.contains(id) && !self.is_pending(*id))
                .collect();
            for id in missing {
                log::debug!("Shape {} is gone from the remote store", id);
                self.reconcile_remote(RemoteShapeEvent::Delete {
                    shape_id: id,
                    op_id: None,
                });
            }
        }
    }

    fn apply_layer_changes(&mut self, changes: Vec<DocChange>) {
        let mut changed = false;
        for change in changes {
            let Some(value) = change.value else {
                log::debug!("Ignoring layer removal {}", change.path);
                continue;
            };
            match serde_json::from_value::<Layer>(value) {
                Ok(layer) => {
                    self.take_own(change.op_id);
                    changed |= self.layers.merge_remote(layer);
                }
                Err(e) => log::warn!("Malformed layer document {}: {}", change.path, e),
            }
        }
        if changed {
            self.notify(StoreEvent::LayersChanged);
        }
    }

    fn apply_lock_changes(&mut self, changes: Vec<DocChange>, now: Timestamp) {
        let mut changed = false;
        for change in changes {
            let Some(id) = self.shape_key(&change.path) else {
                continue;
            };
            let remote = match change.value.map(serde_json::from_value::<Lock>) {
                None => None,
                Some(Ok(lock)) => Some(lock),
                Some(Err(e)) => {
                    log::warn!("Malformed lock document {}: {}", change.path, e);
                    continue;
                }
            };
            match self.locks.apply_remote(id, remote, &self.user.id, now) {
                RemoteLock::Applied => changed = true,
                RemoteLock::Ignored => {}
                RemoteLock::Kept(lock) => self.publish_lock(&lock),
                RemoteLock::Lost(_) => {
                    changed = true;
                    if let Some(holder) = self.locks.get(id, now).map(|l| l.owner.clone()) {
                        self.notify(StoreEvent::LockLost {
                            shape_id: id,
                            holder,
                        });
                    }
                }
            }
        }
        if changed {
            self.notify(StoreEvent::LocksChanged);
        }
    }

    fn apply_presence_changes(&mut self, changes: Vec<DocChange>, now: Timestamp) {
        for change in changes {
            let Some(key) = self.doc_key(&change.path) else {
                continue;
            };
            let record = match change.value.map(serde_json::from_value::<PresenceRecord>) {
                None => None,
                Some(Ok(record)) => Some(record),
                Some(Err(e)) => {
                    log::warn!("Malformed presence document {}: {}", change.path, e);
                    continue;
                }
            };
            self.presence.apply_remote(UserId::new(key), record, now);
        }
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Process inbound changes, replay the offline queue, sweep stale locks
    /// and send a presence heartbeat when one is due.
    pub fn poll(&mut self) {
        let now = self.clock.now();
        let tick = self.channel.poll(now);
        self.process_inbound(now);
        if tick.disconnected || tick.reconnected {
            self.requeue_unacked(now);
        }
        if tick.reconnected {
            self.queue.clear_backoff();
            self.sweep_stale(now);
        }
        self.replay(now);
        if now.saturating_sub(self.last_sweep) >= self.config.stale_sweep_interval_ms {
            self.sweep_stale(now);
        }
        if let Some(record) = self.presence.tick(now) {
            self.publish_presence(&record);
        }
        self.check_status();
    }

    fn replay(&mut self, now: Timestamp) {
        if !self.queue.has_queued_updates() || !self.channel.is_connected() {
            return;
        }
        let channel = &self.channel;
        let mut sent = Vec::new();
        let report = self.queue.retry(now, |op| {
            channel.publish(op)?;
            sent.push(op.clone());
            Ok(())
        });
        self.track_unacked(sent);
        if report.sent > 0 {
            log::info!(
                "Replayed {} queued operations for {}, {} remaining",
                report.sent,
                self.project,
                report.remaining
            );
        }
    }

    /// Drop timed-out peers and locks that expired or whose owner left.
    fn sweep_stale(&mut self, now: Timestamp) {
        self.last_sweep = now;
        self.presence.prune(now);
        let presence = &self.presence;
        let removed = self
            .locks
            .clear_stale(now, |owner| presence.is_stale(owner, now));
        if removed.is_empty() {
            return;
        }
        for lock in &removed {
            if lock.owner == self.user.id {
                self.publish_lock_release(lock.shape_id);
            }
        }
        self.notify(StoreEvent::LocksChanged);
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Report what part of the canvas we are looking at.
    pub fn set_view(&mut self, view: PresenceView) {
        let record = self.presence.heartbeat(view, self.clock.now());
        self.publish_presence(&record);
    }

    /// Other users currently online in this project.
    pub fn active_peers(&self) -> Vec<PresenceRecord> {
        self.presence.active_peers(self.clock.now())
    }

    pub fn subscribe_presence(&mut self, listener: PresenceListener) -> PresenceListenerId {
        self.presence.subscribe(listener, self.clock.now())
    }

    pub fn unsubscribe_presence(&mut self, id: PresenceListenerId) {
        self.presence.unsubscribe(id);
    }

    fn publish_presence(&self, record: &PresenceRecord) {
        if !self.channel.is_connected() {
            return;
        }
        let result = serde_json::to_value(record).map_err(SyncError::from).and_then(|value| {
            self.channel
                .write_ephemeral(Collection::Presence, record.user_id.as_str(), Some(value))
        });
        if let Err(e) = result {
            log::warn!("Failed to publish presence: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Persistence and status
    // ------------------------------------------------------------------

    /// Hand an operation to the channel, or to the queue if it is offline or
    /// already holding earlier operations.
    fn persist(&mut self, op: Operation) {
        let now = self.clock.now();
        self.own_ops.insert(op.op_id);
        if let Some(id) = op.shape_id() {
            self.pending_ops.insert(id, op.op_id);
        }
        if self.queue.has_queued_updates() || !self.channel.is_connected() {
            self.queue.enqueue(op, now);
        } else if let Err(e) = self.channel.publish(&op) {
            log::warn!("Publish of {} failed, queueing: {}", op, e);
            self.queue.enqueue(op, now);
        } else {
            self.track_unacked(vec![op]);
        }
    }

    /// Remember published ops until their echo arrives. An op replaces any
    /// older unacked op it fully overwrites.
    fn track_unacked(&mut self, ops: Vec<Operation>) {
        for op in ops {
            // Already echoed, e.g. a replayed op whose first ack was lost.
            if !self.own_ops.contains(&op.op_id) {
                continue;
            }
            self.unacked.retain(|earlier| !op.supersedes(earlier));
            self.unacked.push(op);
        }
    }

    /// Send unacked ops again through the offline queue. The remote store
    /// drops any that did arrive, by op id.
    fn requeue_unacked(&mut self, now: Timestamp) {
        if self.unacked.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.unacked);
        log::info!(
            "Requeueing {} unconfirmed operations for {}",
            ops.len(),
            self.project
        );
        self.queue.requeue_front(ops, now);
    }

    /// Connection state and outstanding work for status displays.
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            connection: self.queue.connection_status(self.channel.is_connected()),
            queued: self.queue.queued_updates_count(),
            failure: self.queue.failure().cloned(),
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.queue.connection_status(self.channel.is_connected())
    }

    pub fn has_queued_updates(&self) -> bool {
        self.queue.has_queued_updates()
    }

    pub fn queued_updates_count(&self) -> usize {
        self.queue.queued_updates_count()
    }

    /// Retry the queue now, past backoff and any persistent failure.
    pub fn manual_retry(&mut self) {
        let now = self.clock.now();
        let channel = &self.channel;
        self.queue.manual_retry(now, |op| channel.publish(op));
        self.check_status();
    }

    /// Drop the operation at the head of the queue so replay can continue.
    pub fn discard_failed_operation(&mut self) -> Option<QueuedOperation> {
        let discarded = self.queue.discard_head();
        if let Some(q) = &discarded {
            self.own_ops.remove(&q.op.op_id);
            self.unacked.retain(|u| u.op_id != q.op.op_id);
            if let Some(id) = q.op.shape_id() {
                if self.pending_ops.get(&id) == Some(&q.op.op_id) {
                    self.pending_ops.remove(&id);
                }
            }
        }
        self.check_status();
        discarded
    }

    /// Hide the persistent-failure notice. Replay stays blocked.
    pub fn dismiss_failure(&mut self) {
        self.queue.dismiss_failure();
        self.check_status();
    }

    fn check_status(&mut self) {
        let status = self.status();
        if status != self.last_status {
            self.last_status = status.clone();
            self.notify(StoreEvent::StatusChanged(status));
        }
    }

    // ------------------------------------------------------------------
    // Reads and listeners
    // ------------------------------------------------------------------

    pub fn shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.shapes.values()
    }

    /// Shapes on `layer`, oldest first.
    pub fn shapes_on_layer(&self, layer: &LayerId) -> Vec<&Shape> {
        let mut shapes: Vec<&Shape> = self
            .shapes
            .values()
            .filter(|s| &s.layer_id == layer)
            .collect();
        shapes.sort_by_key(|s| (s.created_at, s.id));
        shapes
    }

    /// Number of live shapes.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// `None` for unknown or deleted shapes.
    pub fn sync_state(&self, id: ShapeId) -> Option<ShapeSyncState> {
        self.states.get(&id).copied()
    }

    /// Register a listener, called synchronously after every committed change.
    pub fn subscribe(&mut self, listener: StoreListener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, listener));
        id
    }

    /// Drop a listener. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&mut self, event: StoreEvent) {
        for (_, listener) in &mut self.listeners {
            listener(&event);
        }
    }

    /// Leave the project: release our locks, withdraw presence, unsubscribe
    /// and flush the offline queue to storage.
    pub fn close(&mut self) -> SyncResult<()> {
        for id in self.locks.owned_by(&self.user.id) {
            self.locks.release(id, &self.user.id);
            self.publish_lock_release(id);
        }
        if self.channel.is_connected() {
            if let Err(e) = self.channel.write_ephemeral(
                Collection::Presence,
                self.user.id.as_str(),
                None,
            ) {
                log::warn!("Failed to withdraw presence: {}", e);
            }
        }
        self.channel.unsubscribe();
        let now = self.clock.now();
        self.requeue_unacked(now);
        self.queue.flush()
    }
}
