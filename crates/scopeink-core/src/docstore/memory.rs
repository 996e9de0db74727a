//! In-process document store.
//!
//! `MemoryDocumentStore` is the shared backend; each client talks to it
//! through its own `MemoryConnection`, which can be taken offline
//! independently. While a connection is offline its subscriptions miss every
//! change, just like a dropped network link.

use super::{
    ChangeCallback, ChangeSet, DocChange, DocWrite, DocumentStore, ErrorCallback, SubscriptionId,
};
use crate::error::{SyncError, SyncResult};
use crate::ids::OpId;
use crate::recent::RecentSet;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

struct Subscriber {
    id: SubscriptionId,
    connection: u64,
    prefix: String,
    online: Rc<Cell<bool>>,
    on_change: ChangeCallback,
    on_error: ErrorCallback,
}

/// How many `(op_id, path)` pairs are remembered for deduplication.
pub const DEDUP_CAPACITY: usize = 4096;

struct Documents {
    docs: BTreeMap<String, Value>,
    applied: RecentSet<(OpId, String)>,
    applied_writes: usize,
    duplicate_writes: usize,
}

impl Default for Documents {
    fn default() -> Self {
        Self {
            docs: BTreeMap::new(),
            applied: RecentSet::new(DEDUP_CAPACITY),
            applied_writes: 0,
            duplicate_writes: 0,
        }
    }
}

/// Shared in-memory backend.
#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RefCell<Documents>,
    subscribers: RefCell<Vec<Subscriber>>,
    next_id: Cell<u64>,
}

impl MemoryDocumentStore {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Open a client connection to this backend.
    pub fn connect(self: &Rc<Self>) -> MemoryConnection {
        MemoryConnection {
            backend: Rc::clone(self),
            id: self.next_id(),
            online: Rc::new(Cell::new(true)),
            drop_acks: Cell::new(false),
            drop_writes: Cell::new(false),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    /// Current value of a document.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.documents.borrow().docs.get(path).cloned()
    }

    /// All documents under a prefix.
    pub fn documents(&self, prefix: &str) -> Vec<(String, Value)> {
        self.documents
            .borrow()
            .docs
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }

    /// Number of writes that changed the store.
    pub fn applied_writes(&self) -> usize {
        self.documents.borrow().applied_writes
    }

    /// Number of writes ignored because their op id was already applied.
    pub fn duplicate_writes(&self) -> usize {
        self.documents.borrow().duplicate_writes
    }

    /// Apply a write. Returns false if it was a duplicate.
    fn apply(&self, write: &DocWrite) -> bool {
        {
            let mut documents = self.documents.borrow_mut();
            if let Some(op_id) = write.op_id {
                if !documents.applied.insert((op_id, write.path.clone())) {
                    documents.duplicate_writes += 1;
                    log::debug!("Ignoring duplicate write {} to {}", op_id, write.path);
                    return false;
                }
            }
            match &write.value {
                Some(value) => {
                    documents.docs.insert(write.path.clone(), value.clone());
                }
                None => {
                    documents.docs.remove(&write.path);
                }
            }
            documents.applied_writes += 1;
        }

        let change = DocChange::from(write.clone());
        for subscriber in self.subscribers.borrow_mut().iter_mut() {
            if subscriber.online.get() && write.path.starts_with(&subscriber.prefix) {
                (subscriber.on_change)(ChangeSet {
                    initial: false,
                    prefix: subscriber.prefix.clone(),
                    changes: vec![change.clone()],
                });
            }
        }
        true
    }

    fn snapshot(&self, prefix: &str) -> ChangeSet {
        let changes = self
            .documents(prefix)
            .into_iter()
            .map(|(path, value)| DocChange {
                path,
                value: Some(value),
                op_id: None,
            })
            .collect();
        ChangeSet {
            initial: true,
            prefix: prefix.to_string(),
            changes,
        }
    }
}

/// One client's view of a `MemoryDocumentStore`.
pub struct MemoryConnection {
    backend: Rc<MemoryDocumentStore>,
    id: u64,
    online: Rc<Cell<bool>>,
    drop_acks: Cell<bool>,
    drop_writes: Cell<bool>,
}

impl MemoryConnection {
    pub fn backend(&self) -> &Rc<MemoryDocumentStore> {
        &self.backend
    }

    /// Simulate losing or regaining the network.
    ///
    /// Going offline reports a network error to this connection's subscribers.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.replace(online);
        if was_online && !online {
            for subscriber in self.backend.subscribers.borrow_mut().iter_mut() {
                if subscriber.connection == self.id {
                    (subscriber.on_error)(SyncError::Network("connection lost".to_string()));
                }
            }
        }
    }

    /// When set, writes are applied but the caller is told they failed.
    pub fn set_drop_acks(&self, drop: bool) {
        self.drop_acks.set(drop);
    }

    /// When set, writes report success but never reach the backend, like
    /// messages still buffered in a socket that dies.
    pub fn set_drop_writes(&self, drop: bool) {
        self.drop_writes.set(drop);
    }
}

impl DocumentStore for MemoryConnection {
    fn subscribe(
        &self,
        prefix: &str,
        mut on_change: ChangeCallback,
        on_error: ErrorCallback,
    ) -> SyncResult<SubscriptionId> {
        if !self.online.get() {
            return Err(SyncError::Network("offline".to_string()));
        }
        let id = SubscriptionId(self.backend.next_id());
        on_change(self.backend.snapshot(prefix));
        self.backend.subscribers.borrow_mut().push(Subscriber {
            id,
            connection: self.id,
            prefix: prefix.to_string(),
            online: Rc::clone(&self.online),
            on_change,
            on_error,
        });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.backend.subscribers.borrow_mut().retain(|s| s.id != id);
    }

    fn write(&self, write: DocWrite) -> SyncResult<()> {
        if !self.online.get() {
            return Err(SyncError::Network("offline".to_string()));
        }
        if self.drop_writes.get() {
            log::debug!("Dropping write to {}", write.path);
            return Ok(());
        }
        self.backend.apply(&write);
        if self.drop_acks.get() {
            return Err(SyncError::Network("acknowledgement lost".to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.online.get()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.backend.subscribers.try_borrow_mut() {
            subscribers.retain(|s| s.connection != self.id);
        }
    }
}
