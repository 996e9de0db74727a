//! Offline queue.
//!
//! Durable FIFO of operations that could not be published. The queue is
//! written to local storage after every change so pending edits survive a
//! restart. Replay always starts at the head: if the head fails, nothing
//! behind it is sent until it succeeds or is discarded by hand.

use crate::clock::Timestamp;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ids::{OpId, ProjectId, ShapeId};
use crate::ops::{Operation, OperationKind};
use crate::storage::{KeyValueStorage, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// An operation waiting in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub op: Operation,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
}

impl QueuedOperation {
    pub fn op_id(&self) -> OpId {
        self.op.op_id
    }

    pub fn kind(&self) -> OperationKind {
        self.op.kind()
    }
}

/// The head operation ran out of retries.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentFailure {
    pub op_id: OpId,
    pub kind: OperationKind,
    pub retry_count: u32,
    pub last_error: String,
}

/// Aggregate connectivity shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Online,
    Offline,
    /// Connected, but queued operations are still being replayed.
    Reconnecting,
}

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayReport {
    pub sent: usize,
    pub remaining: usize,
}

pub struct OfflineQueue {
    key: String,
    storage: Arc<dyn KeyValueStorage>,
    ops: VecDeque<QueuedOperation>,
    /// Replay is held back until this time after a failure.
    next_attempt_at: Option<Timestamp>,
    failure: Option<PersistentFailure>,
    failure_dismissed: bool,
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
}

impl OfflineQueue {
    /// Open the queue for `project`, loading anything left from a previous run.
    pub fn open(
        project: &ProjectId,
        storage: Arc<dyn KeyValueStorage>,
        config: &SyncConfig,
    ) -> SyncResult<Self> {
        let key = format!("offline_queue/{}", project);
        let ops = match storage.get(&key) {
            Ok(json) => serde_json::from_str::<VecDeque<QueuedOperation>>(&json)?,
            Err(StorageError::NotFound(_)) => VecDeque::new(),
            Err(e) => return Err(e.into()),
        };
        if !ops.is_empty() {
            log::info!("Loaded {} queued operations for {}", ops.len(), project);
        }
        Ok(Self {
            key,
            storage,
            ops,
            next_attempt_at: None,
            failure: None,
            failure_dismissed: false,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
            max_retries: config.max_retries,
        })
    }

    /// Append an operation. Storage failures are logged; the operation stays
    /// queued in memory either way.
    pub fn enqueue(&mut self, op: Operation, now: Timestamp) {
        log::debug!("Queueing {}", op);
        self.ops.push_back(QueuedOperation {
            op,
            enqueued_at: now,
            retry_count: 0,
        });
        self.persist_or_log();
    }

    /// Put operations back at the head, ahead of everything queued, keeping
    /// their order. Operations already in the queue are skipped.
    pub fn requeue_front(&mut self, ops: Vec<Operation>, now: Timestamp) {
        let mut added = 0;
        for op in ops.into_iter().rev() {
            if self.contains(op.op_id) {
                continue;
            }
            log::debug!("Requeueing unconfirmed {}", op);
            self.ops.push_front(QueuedOperation {
                op,
                enqueued_at: now,
                retry_count: 0,
            });
            added += 1;
        }
        if added > 0 {
            self.persist_or_log();
        }
    }

    /// Replay from the head until the queue is empty or a send fails.
    ///
    /// Does nothing while backing off or after a persistent failure.
    pub fn retry<F>(&mut self, now: Timestamp, mut publish: F) -> ReplayReport
    where
        F: FnMut(&Operation) -> SyncResult<()>,
    {
        let mut report = ReplayReport {
            sent: 0,
            remaining: self.ops.len(),
        };
        if self.failure.is_some() || self.next_attempt_at.is_some_and(|at| now < at) {
            return report;
        }
        self.next_attempt_at = None;

        while let Some(head) = self.ops.front_mut() {
            match publish(&head.op) {
                Ok(()) => {
                    log::debug!("Replayed {}", head.op);
                    self.ops.pop_front();
                    report.sent += 1;
                }
                Err(e) => {
                    head.retry_count += 1;
                    if head.retry_count >= self.max_retries {
                        log::error!(
                            "Giving up on {} after {} attempts: {}",
                            head.op,
                            head.retry_count,
                            e
                        );
                        self.failure = Some(PersistentFailure {
                            op_id: head.op.op_id,
                            kind: head.op.kind(),
                            retry_count: head.retry_count,
                            last_error: e.to_string(),
                        });
                        self.failure_dismissed = false;
                    } else {
                        let delay =
                            backoff(self.base_delay_ms, self.max_delay_ms, head.retry_count);
                        log::warn!(
                            "Replay of {} failed ({}); retrying in {}ms",
                            head.op,
                            e,
                            delay
                        );
                        self.next_attempt_at = Some(now.saturating_add(delay));
                    }
                    break;
                }
            }
        }

        report.remaining = self.ops.len();
        self.persist_or_log();
        report
    }

    /// Retry now, ignoring backoff and any persistent failure.
    pub fn manual_retry<F>(&mut self, now: Timestamp, publish: F) -> ReplayReport
    where
        F: FnMut(&Operation) -> SyncResult<()>,
    {
        self.failure = None;
        self.failure_dismissed = false;
        self.next_attempt_at = None;
        self.retry(now, publish)
    }

    /// Forget the backoff timer, e.g. after connectivity returns.
    /// A persistent failure still blocks replay.
    pub fn clear_backoff(&mut self) {
        self.next_attempt_at = None;
    }

    /// Drop the head operation so replay can continue past it.
    pub fn discard_head(&mut self) -> Option<QueuedOperation> {
        let head = self.ops.pop_front()?;
        log::warn!("Discarding queued {}", head.op);
        self.failure = None;
        self.failure_dismissed = false;
        self.next_attempt_at = None;
        self.persist_or_log();
        Some(head)
    }

    /// Hide the failure from the status view. Replay stays blocked.
    pub fn dismiss_failure(&mut self) {
        self.failure_dismissed = true;
    }

    /// The visible persistent failure, if any.
    pub fn failure(&self) -> Option<&PersistentFailure> {
        self.failure.as_ref().filter(|_| !self.failure_dismissed)
    }

    /// Whether replay is blocked by a persistent failure.
    pub fn is_blocked(&self) -> bool {
        self.failure.is_some()
    }

    pub fn next_attempt_at(&self) -> Option<Timestamp> {
        self.next_attempt_at
    }

    pub fn has_queued_updates(&self) -> bool {
        !self.ops.is_empty()
    }

    pub fn queued_updates_count(&self) -> usize {
        self.ops.len()
    }

    pub fn connection_status(&self, connected: bool) -> ConnectionStatus {
        match (connected, self.ops.is_empty()) {
            (false, _) => ConnectionStatus::Offline,
            (true, false) => ConnectionStatus::Reconnecting,
            (true, true) => ConnectionStatus::Online,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.ops.iter()
    }

    pub fn contains(&self, op_id: OpId) -> bool {
        self.ops.iter().any(|q| q.op.op_id == op_id)
    }

    /// Whether any queued operation touches `id`.
    pub fn touches_shape(&self, id: ShapeId) -> bool {
        self.ops.iter().any(|q| q.op.shape_id() == Some(id))
    }

    /// Write the queue to storage. An empty queue removes the stored key.
    pub fn flush(&self) -> SyncResult<()> {
        if self.ops.is_empty() {
            self.storage.remove(&self.key)?;
            return Ok(());
        }
        let json = serde_json::to_string(&self.ops)?;
        self.storage.put(&self.key, &json).map_err(SyncError::from)
    }

    fn persist_or_log(&self) {
        if let Err(e) = self.flush() {
            log::error!("Failed to persist offline queue {}: {}", self.key, e);
        }
    }
}

/// `base * 2^(attempt-1)`, capped at `max`.
fn backoff(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, MemoryStorage};
    use std::cell::RefCell;

    fn config() -> SyncConfig {
        SyncConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 1_000,
            max_retries: 3,
            ..SyncConfig::default()
        }
    }

    fn queue(storage: Arc<dyn KeyValueStorage>) -> OfflineQueue {
        OfflineQueue::open(&ProjectId::new("p"), storage, &config()).unwrap()
    }

    fn op() -> Operation {
        Operation::delete_shape(uuid::Uuid::new_v4())
    }

    fn offline(_: &Operation) -> SyncResult<()> {
        Err(SyncError::Network("offline".to_string()))
    }

    #[test]
    fn test_replay_is_fifo() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        let ops: Vec<Operation> = (0..3).map(|_| op()).collect();
        for op in &ops {
            queue.enqueue(op.clone(), 0);
        }
        let sent = RefCell::new(Vec::new());
        let report = queue.retry(0, |op| {
            sent.borrow_mut().push(op.op_id);
            Ok(())
        });
        assert_eq!(report, ReplayReport { sent: 3, remaining: 0 });
        let expected: Vec<OpId> = ops.iter().map(|o| o.op_id).collect();
        assert_eq!(*sent.borrow(), expected);
        assert!(!queue.has_queued_updates());
    }

    #[test]
    fn test_failed_head_blocks_rest() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        let first = op();
        queue.enqueue(first.clone(), 0);
        queue.enqueue(op(), 0);

        let mut attempts = Vec::new();
        let report = queue.retry(0, |op| {
            attempts.push(op.op_id);
            Err(SyncError::Network("down".to_string()))
        });
        assert_eq!(attempts, vec![first.op_id]);
        assert_eq!(report.remaining, 2);
        assert_eq!(queue.iter().next().unwrap().retry_count, 1);
    }

    #[test]
    fn test_backoff_gates_retry() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        queue.enqueue(op(), 0);
        queue.retry(0, offline);
        assert_eq!(queue.next_attempt_at(), Some(100));

        // Still backing off: publish is not called.
        let report = queue.retry(50, |_| panic!("sent during backoff"));
        assert_eq!(report.sent, 0);

        queue.retry(100, offline);
        assert_eq!(queue.next_attempt_at(), Some(300));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(100, 1_000, 1), 100);
        assert_eq!(backoff(100, 1_000, 4), 800);
        assert_eq!(backoff(100, 1_000, 5), 1_000);
        assert_eq!(backoff(100, 1_000, 200), 1_000);
    }

    #[test]
    fn test_failed_replay_schedules_backoff() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        queue.enqueue(op(), 0);
        let report = queue.manual_retry(5_000, offline);
        assert_eq!(report, ReplayReport { sent: 0, remaining: 1 });
        assert_eq!(queue.next_attempt_at(), Some(5_100));

        // A clock at the end of its range does not wrap the retry time.
        queue.clear_backoff();
        queue.retry(u64::MAX - 10, offline);
        assert_eq!(queue.next_attempt_at(), Some(u64::MAX));
    }

    #[test]
    fn test_persistent_failure_and_controls() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        let head = op();
        queue.enqueue(head.clone(), 0);
        queue.enqueue(op(), 0);

        let mut now = 0;
        for _ in 0..3 {
            queue.retry(now, offline);
            now += 10_000;
        }
        let failure = queue.failure().unwrap().clone();
        assert_eq!(failure.op_id, head.op_id);
        assert_eq!(failure.retry_count, 3);

        // Blocked until someone intervenes.
        assert_eq!(queue.retry(now, |_| Ok(())).sent, 0);

        queue.dismiss_failure();
        assert!(queue.failure().is_none());
        assert!(queue.is_blocked());

        let discarded = queue.discard_head().unwrap();
        assert_eq!(discarded.op_id(), head.op_id);
        assert!(!queue.is_blocked());
        assert_eq!(queue.retry(now, |_| Ok(())).sent, 1);
    }

    #[test]
    fn test_manual_retry_clears_failure() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        queue.enqueue(op(), 0);
        for n in 0..3 {
            queue.retry(n * 10_000, offline);
        }
        assert!(queue.is_blocked());
        let report = queue.manual_retry(30_000, |_| Ok(()));
        assert_eq!(report.sent, 1);
        assert!(!queue.is_blocked());
    }

    #[test]
    fn test_requeued_ops_go_ahead_of_queued_ones() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        let queued = op();
        queue.enqueue(queued.clone(), 0);
        let (a, b) = (op(), op());
        queue.requeue_front(vec![a.clone(), b.clone(), queued.clone()], 5);

        let order: Vec<OpId> = queue.iter().map(|q| q.op_id()).collect();
        assert_eq!(order, vec![a.op_id, b.op_id, queued.op_id]);
        assert!(queue.contains(b.op_id));
    }

    #[test]
    fn test_connection_status() {
        let mut queue = queue(Arc::new(MemoryStorage::new()));
        assert_eq!(queue.connection_status(true), ConnectionStatus::Online);
        assert_eq!(queue.connection_status(false), ConnectionStatus::Offline);
        queue.enqueue(op(), 0);
        assert_eq!(queue.connection_status(true), ConnectionStatus::Reconnecting);
    }

    #[test]
    fn test_queue_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn KeyValueStorage> =
            Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap());
        let queued = op();
        {
            let mut queue = queue(Arc::clone(&storage));
            queue.enqueue(queued.clone(), 42);
        }

        let storage: Arc<dyn KeyValueStorage> =
            Arc::new(FileStorage::new(dir.path().to_path_buf()).unwrap());
        let reopened = queue(storage);
        assert_eq!(reopened.queued_updates_count(), 1);
        let head = reopened.iter().next().unwrap();
        assert_eq!(head.op, queued);
        assert_eq!(head.enqueued_at, 42);
        assert!(reopened.touches_shape(queued.shape_id().unwrap()));
    }

    #[test]
    fn test_empty_queue_removes_stored_key() {
        let storage = Arc::new(MemoryStorage::new());
        let mut queue = queue(storage.clone());
        queue.enqueue(op(), 0);
        assert!(storage.exists("offline_queue/p").unwrap());
        queue.retry(0, |_| Ok(()));
        assert!(!storage.exists("offline_queue/p").unwrap());
    }
}
