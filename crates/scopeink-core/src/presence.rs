//! Presence tracking for other users in a project.
//!
//! Presence is ephemeral: each client periodically publishes a heartbeat and
//! peers that stop heartbeating drop out of the observable set once the
//! timeout passes.

use crate::clock::Timestamp;
use crate::ids::UserId;
use crate::shapes::SerializableColor;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What part of the canvas a user is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceView {
    pub center_x: f64,
    pub center_y: f64,
    pub zoom: f64,
}

impl Default for PresenceView {
    fn default() -> Self {
        Self {
            center_x: 0.0,
            center_y: 0.0,
            zoom: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub color: SerializableColor,
    pub current_view: PresenceView,
    pub last_heartbeat: Timestamp,
}

impl PresenceRecord {
    pub fn is_stale(&self, now: Timestamp, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) > timeout_ms
    }
}

pub type PresenceListener = Box<dyn FnMut(&[PresenceRecord])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresenceListenerId(u64);

pub struct PresenceTracker {
    local: PresenceRecord,
    timeout_ms: u64,
    heartbeat_interval_ms: u64,
    last_sent: Option<Timestamp>,
    peers: HashMap<UserId, PresenceRecord>,
    /// Users that timed out or left. Their locks are up for grabs.
    departed: HashSet<UserId>,
    listeners: Vec<(PresenceListenerId, PresenceListener)>,
    next_listener: u64,
}

impl PresenceTracker {
    pub fn new(
        user_id: UserId,
        display_name: impl Into<String>,
        color: SerializableColor,
        timeout_ms: u64,
        heartbeat_interval_ms: u64,
    ) -> Self {
        Self {
            local: PresenceRecord {
                user_id,
                display_name: display_name.into(),
                color,
                current_view: PresenceView::default(),
                last_heartbeat: 0,
            },
            timeout_ms,
            heartbeat_interval_ms,
            last_sent: None,
            peers: HashMap::new(),
            departed: HashSet::new(),
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    /// Update the local record and return it for publishing.
    pub fn heartbeat(&mut self, view: PresenceView, now: Timestamp) -> PresenceRecord {
        self.local.current_view = view;
        self.local.last_heartbeat = now;
        self.last_sent = Some(now);
        self.local.clone()
    }

    /// A heartbeat with the last view, if one is due.
    pub fn tick(&mut self, now: Timestamp) -> Option<PresenceRecord> {
        let due = self
            .last_sent
            .is_none_or(|sent| now.saturating_sub(sent) >= self.heartbeat_interval_ms);
        if !due {
            return None;
        }
        let view = self.local.current_view;
        Some(self.heartbeat(view, now))
    }

    /// Mirror a remote presence document. `None` means the user left.
    pub fn apply_remote(
        &mut self,
        user_id: UserId,
        record: Option<PresenceRecord>,
        now: Timestamp,
    ) {
        if user_id == self.local.user_id {
            return;
        }
        let changed = match record {
            Some(record) if !record.is_stale(now, self.timeout_ms) => {
                self.departed.remove(&user_id);
                self.peers.insert(user_id, record);
                true
            }
            Some(_) => false,
            None => {
                self.departed.insert(user_id.clone());
                self.peers.remove(&user_id).is_some()
            }
        };
        if changed {
            self.notify(now);
        }
    }

    /// Drop peers whose heartbeat is older than the timeout.
    pub fn prune(&mut self, now: Timestamp) -> Vec<UserId> {
        let timeout = self.timeout_ms;
        let stale: Vec<UserId> = self
            .peers
            .values()
            .filter(|record| record.is_stale(now, timeout))
            .map(|record| record.user_id.clone())
            .collect();
        for user in &stale {
            log::debug!("Presence of {} timed out", user);
            self.peers.remove(user);
            self.departed.insert(user.clone());
        }
        if !stale.is_empty() {
            self.notify(now);
        }
        stale
    }

    /// Whether `user` is known to have gone away. The local user never is.
    pub fn is_stale(&self, user: &UserId, now: Timestamp) -> bool {
        if user == &self.local.user_id {
            return false;
        }
        self.departed.contains(user)
            || self
                .peers
                .get(user)
                .is_some_and(|record| record.is_stale(now, self.timeout_ms))
    }

    /// Other users with a live heartbeat, ordered by user id.
    pub fn active_peers(&self, now: Timestamp) -> Vec<PresenceRecord> {
        let mut peers: Vec<PresenceRecord> = self
            .peers
            .values()
            .filter(|record| !record.is_stale(now, self.timeout_ms))
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }

    /// Stream the set of active peers. The listener fires immediately with
    /// the current set and again whenever it changes.
    pub fn subscribe(
        &mut self,
        mut listener: PresenceListener,
        now: Timestamp,
    ) -> PresenceListenerId {
        self.next_listener += 1;
        let id = PresenceListenerId(self.next_listener);
        listener(&self.active_peers(now));
        self.listeners.push((id, listener));
        id
    }

    pub fn unsubscribe(&mut self, id: PresenceListenerId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    fn notify(&mut self, now: Timestamp) {
        let peers = self.active_peers(now);
        for (_, listener) in &mut self.listeners {
            listener(&peers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const TIMEOUT: u64 = 15_000;

    fn tracker(user: &str) -> PresenceTracker {
        PresenceTracker::new(UserId::new(user), user, SerializableColor::black(), TIMEOUT, 5_000)
    }

    fn record(user: &str, at: Timestamp) -> PresenceRecord {
        tracker(user).heartbeat(PresenceView::default(), at)
    }

    #[test]
    fn test_heartbeat_updates_local_record() {
        let mut presence = tracker("ana");
        let view = PresenceView {
            center_x: 10.0,
            center_y: 20.0,
            zoom: 2.0,
        };
        let record = presence.heartbeat(view, 1_000);
        assert_eq!(record.user_id, UserId::new("ana"));
        assert_eq!(record.current_view, view);
        assert_eq!(record.last_heartbeat, 1_000);
    }

    #[test]
    fn test_tick_respects_interval() {
        let mut presence = tracker("ana");
        assert!(presence.tick(0).is_some());
        assert!(presence.tick(4_999).is_none());
        assert_eq!(presence.tick(5_000).unwrap().last_heartbeat, 5_000);
    }

    #[test]
    fn test_active_peers_excludes_self_and_stale() {
        let mut presence = tracker("ana");
        presence.apply_remote(UserId::new("ana"), Some(record("ana", 0)), 0);
        presence.apply_remote(UserId::new("ben"), Some(record("ben", 0)), 0);
        presence.apply_remote(UserId::new("cy"), Some(record("cy", 10_000)), 10_000);

        let names: Vec<String> = presence
            .active_peers(10_000)
            .into_iter()
            .map(|r| r.user_id.to_string())
            .collect();
        assert_eq!(names, vec!["ben", "cy"]);

        let later: Vec<String> = presence
            .active_peers(16_000)
            .into_iter()
            .map(|r| r.user_id.to_string())
            .collect();
        assert_eq!(later, vec!["cy"]);
    }

    #[test]
    fn test_prune_marks_departed() {
        let mut presence = tracker("ana");
        let ben = UserId::new("ben");
        presence.apply_remote(ben.clone(), Some(record("ben", 0)), 0);
        assert!(!presence.is_stale(&ben, 1_000));

        assert_eq!(presence.prune(20_000), vec![ben.clone()]);
        assert!(presence.is_stale(&ben, 20_000));

        // Coming back clears it.
        presence.apply_remote(ben.clone(), Some(record("ben", 21_000)), 21_000);
        assert!(!presence.is_stale(&ben, 21_000));
    }

    #[test]
    fn test_unknown_and_local_users_are_not_stale() {
        let presence = tracker("ana");
        assert!(!presence.is_stale(&UserId::new("ana"), 1_000_000));
        assert!(!presence.is_stale(&UserId::new("nobody"), 1_000_000));
    }

    #[test]
    fn test_subscribers_see_changes() {
        let mut presence = tracker("ana");
        let seen: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let id = presence.subscribe(Box::new(move |peers| sink.borrow_mut().push(peers.len())), 0);

        presence.apply_remote(UserId::new("ben"), Some(record("ben", 0)), 0);
        presence.apply_remote(UserId::new("ben"), None, 1);
        presence.unsubscribe(id);
        presence.apply_remote(UserId::new("cy"), Some(record("cy", 2)), 2);

        assert_eq!(*seen.borrow(), vec![0, 1, 0]);
    }
}
