//! Sync channel between a project's Shape Store and the document store.
//!
//! The channel owns the project's subscriptions and collects inbound change
//! sets in an inbox that the store drains on its own schedule. It also watches
//! connectivity: after a reconnect it schedules a full reload, debounced so a
//! flapping connection does not trigger a reload storm.

use crate::clock::Timestamp;
use crate::config::SyncConfig;
use crate::docstore::{Collection, DocChange, DocPath, DocWrite, DocumentStore, SubscriptionId};
use crate::error::{SyncError, SyncResult};
use crate::ids::ProjectId;
use crate::ops::Operation;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Events collected from subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Changes {
        collection: Collection,
        /// Snapshot delivered when the subscription opened.
        initial: bool,
        changes: Vec<DocChange>,
    },
    Error(SyncError),
}

/// Connectivity transitions observed by one `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelTick {
    pub reconnected: bool,
    pub disconnected: bool,
    /// A reload ran and fresh snapshots are on their way.
    pub reloaded: bool,
}

type Inbox = Rc<RefCell<VecDeque<InboundEvent>>>;

pub struct SyncChannel {
    project: ProjectId,
    store: Rc<dyn DocumentStore>,
    inbox: Inbox,
    subscriptions: Vec<SubscriptionId>,
    was_connected: bool,
    reload_due: Option<Timestamp>,
    reload_debounce_ms: u64,
}

impl SyncChannel {
    /// Wrap `store` for `project`. Nothing is subscribed until `subscribe`.
    pub fn new(project: ProjectId, store: Rc<dyn DocumentStore>, config: &SyncConfig) -> Self {
        let was_connected = store.is_connected();
        Self {
            project,
            store,
            inbox: Rc::new(RefCell::new(VecDeque::new())),
            subscriptions: Vec::new(),
            was_connected,
            reload_due: None,
            reload_debounce_ms: config.reload_debounce_ms,
        }
    }

    /// The project this channel reads and writes.
    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Whether the backing store currently reaches the backend.
    pub fn is_connected(&self) -> bool {
        self.store.is_connected()
    }

    pub fn is_subscribed(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// Subscribe to every collection of the project.
    ///
    /// Each subscription starts with a snapshot. On failure no subscription
    /// is left open.
    pub fn subscribe(&mut self) -> SyncResult<()> {
        self.unsubscribe();
        for collection in Collection::ALL {
            let prefix = DocPath::prefix(&self.project, collection);
            let changes = Rc::clone(&self.inbox);
            let errors = Rc::clone(&self.inbox);
            let result = self.store.subscribe(
                &prefix,
                Box::new(move |set| {
                    changes.borrow_mut().push_back(InboundEvent::Changes {
                        collection,
                        initial: set.initial,
                        changes: set.changes,
                    });
                }),
                Box::new(move |error| errors.borrow_mut().push_back(InboundEvent::Error(error))),
            );
            match result {
                Ok(id) => self.subscriptions.push(id),
                Err(e) => {
                    self.unsubscribe();
                    return Err(e);
                }
            }
        }
        log::info!("Subscribed to project {}", self.project);
        Ok(())
    }

    /// Close every open subscription. Safe to call when none are open.
    pub fn unsubscribe(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.store.unsubscribe(id);
        }
    }

    /// Send a committed operation, tagged with its op id.
    pub fn publish(&self, op: &Operation) -> SyncResult<()> {
        if !self.store.is_connected() {
            return Err(SyncError::Network("offline".to_string()));
        }
        for write in op.writes(&self.project)? {
            self.store.write(write)?;
        }
        log::debug!("Published {}", op);
        Ok(())
    }

    /// Write a lock or presence document. These are never queued.
    pub fn write_ephemeral(
        &self,
        collection: Collection,
        key: &str,
        value: Option<Value>,
    ) -> SyncResult<()> {
        let path = DocPath::new(&self.project, collection, key);
        let write = match value {
            Some(value) => DocWrite::put(&path, value, None),
            None => DocWrite::delete(&path, None),
        };
        self.store.write(write)
    }

    /// Watch connectivity and run a reload once its debounce has passed.
    pub fn poll(&mut self, now: Timestamp) -> ChannelTick {
        self.store.pump();
        let mut tick = ChannelTick::default();
        let connected = self.store.is_connected();

        if connected && !self.was_connected {
            log::info!("Project {} reconnected", self.project);
            tick.reconnected = true;
            // Trailing debounce: every reconnect pushes the reload out.
            self.reload_due = Some(now.saturating_add(self.reload_debounce_ms));
        } else if !connected && self.was_connected {
            log::info!("Project {} lost its connection", self.project);
            tick.disconnected = true;
        }
        self.was_connected = connected;

        if connected && !self.is_subscribed() {
            if let Err(e) = self.subscribe() {
                log::warn!("Subscribe failed for {}: {}", self.project, e);
            }
        }

        if connected && self.reload_due.is_some_and(|due| now >= due) {
            self.reload_due = None;
            match self.reload() {
                Ok(()) => tick.reloaded = true,
                Err(e) => log::warn!("Reload of {} failed: {}", self.project, e),
            }
        }
        tick
    }

    /// Whether a debounced reload is waiting.
    pub fn reload_pending(&self) -> bool {
        self.reload_due.is_some()
    }

    /// Re-open every subscription to get fresh snapshots.
    pub fn reload(&mut self) -> SyncResult<()> {
        log::info!("Reloading project {}", self.project);
        self.subscribe()
    }

    /// Pump the store and take everything in the inbox.
    pub fn drain(&self) -> Vec<InboundEvent> {
        self.store.pump();
        self.inbox.borrow_mut().drain(..).collect()
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
