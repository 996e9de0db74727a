//! Advisory per-shape locks.
//!
//! A lock marks which user is in the middle of an editing gesture on a shape.
//! Nothing below the UI enforces it: the document store will accept a write
//! to a locked shape from anyone.

use crate::clock::Timestamp;
use crate::ids::{ShapeId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub shape_id: ShapeId,
    pub owner: UserId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Lock {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Between two live locks on the same shape, the earlier acquisition wins;
    /// equal times fall back to the owner id.
    pub fn takes_precedence_over(&self, other: &Lock) -> bool {
        (self.acquired_at, &self.owner) < (other.acquired_at, &other.owner)
    }
}

/// Why `acquire` did not grant the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenied {
    pub shape_id: ShapeId,
    pub holder: UserId,
    pub expires_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(Lock),
    Denied(LockDenied),
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted(_))
    }
}

/// What mirroring a remote lock document did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLock {
    Applied,
    Ignored,
    /// The local user's lock beat the remote one and should be re-published.
    Kept(Lock),
    /// The local user's lock lost to the remote one.
    Lost(Lock),
}

#[derive(Debug)]
pub struct LockManager {
    ttl_ms: u64,
    locks: HashMap<ShapeId, Lock>,
}

impl LockManager {
    /// Locks granted by this manager expire `ttl_ms` after their last renewal.
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            locks: HashMap::new(),
        }
    }

    /// Lock lifetime in milliseconds.
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Grant if the shape is free, the lock expired, or `user` already owns it.
    ///
    /// An owner re-acquiring renews the expiry and keeps the original
    /// acquisition time.
    pub fn acquire(&mut self, shape_id: ShapeId, user: &UserId, now: Timestamp) -> LockOutcome {
        let expires_at = now.saturating_add(self.ttl_ms);
        match self.locks.get_mut(&shape_id) {
            Some(lock) if !lock.is_expired(now) && &lock.owner != user => {
                LockOutcome::Denied(LockDenied {
                    shape_id,
                    holder: lock.owner.clone(),
                    expires_at: lock.expires_at,
                })
            }
            Some(lock) if !lock.is_expired(now) => {
                lock.expires_at = expires_at;
                LockOutcome::Granted(lock.clone())
            }
            _ => {
                let lock = Lock {
                    shape_id,
                    owner: user.clone(),
                    acquired_at: now,
                    expires_at,
                };
                self.locks.insert(shape_id, lock.clone());
                LockOutcome::Granted(lock)
            }
        }
    }

    /// Release `shape_id` if `user` owns it. Returns the released lock.
    pub fn release(&mut self, shape_id: ShapeId, user: &UserId) -> Option<Lock> {
        match self.locks.get(&shape_id) {
            Some(lock) if &lock.owner == user => self.locks.remove(&shape_id),
            _ => None,
        }
    }

    /// Remove expired locks and locks whose owner is stale.
    pub fn clear_stale<F>(&mut self, now: Timestamp, is_stale_owner: F) -> Vec<Lock>
    where
        F: Fn(&UserId) -> bool,
    {
        let stale: Vec<ShapeId> = self
            .locks
            .values()
            .filter(|lock| lock.is_expired(now) || is_stale_owner(&lock.owner))
            .map(|lock| lock.shape_id)
            .collect();
        let removed: Vec<Lock> = stale
            .into_iter()
            .filter_map(|id| self.locks.remove(&id))
            .collect();
        if !removed.is_empty() {
            log::debug!("Cleared {} stale locks", removed.len());
        }
        removed
    }

    /// Mirror a remote lock document. `None` means the document was deleted.
    pub fn apply_remote(
        &mut self,
        shape_id: ShapeId,
        remote: Option<Lock>,
        local_user: &UserId,
        now: Timestamp,
    ) -> RemoteLock {
        let Some(remote) = remote else {
            return match self.locks.get(&shape_id) {
                // Our own lock stays until we release it.
                Some(lock) if &lock.owner == local_user => RemoteLock::Ignored,
                Some(_) => {
                    self.locks.remove(&shape_id);
                    RemoteLock::Applied
                }
                None => RemoteLock::Ignored,
            };
        };
        // Our own locks are tracked locally; their echoes may be stale.
        if remote.is_expired(now) || &remote.owner == local_user {
            return RemoteLock::Ignored;
        }

        let existing = match self.locks.get(&shape_id) {
            Some(lock) if !lock.is_expired(now) && lock.owner != remote.owner => lock.clone(),
            _ => {
                self.locks.insert(shape_id, remote);
                return RemoteLock::Applied;
            }
        };

        let ours = &existing.owner == local_user;
        if remote.takes_precedence_over(&existing) {
            self.locks.insert(shape_id, remote);
            if ours {
                log::info!("Lost lock on {} to a concurrent editor", shape_id);
                RemoteLock::Lost(existing)
            } else {
                RemoteLock::Applied
            }
        } else if ours {
            RemoteLock::Kept(existing)
        } else {
            RemoteLock::Ignored
        }
    }

    /// The live lock on `shape_id`, if any.
    pub fn get(&self, shape_id: ShapeId, now: Timestamp) -> Option<&Lock> {
        self.locks.get(&shape_id).filter(|lock| !lock.is_expired(now))
    }

    /// Whether someone other than `user` holds a live lock on `shape_id`.
    pub fn is_locked_by_other(&self, shape_id: ShapeId, user: &UserId, now: Timestamp) -> bool {
        self.get(shape_id, now).is_some_and(|lock| &lock.owner != user)
    }

    /// Shapes locked by `user`, expired locks included.
    pub fn owned_by(&self, user: &UserId) -> Vec<ShapeId> {
        self.locks
            .values()
            .filter(|lock| &lock.owner == user)
            .map(|lock| lock.shape_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
