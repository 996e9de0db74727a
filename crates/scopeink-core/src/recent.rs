//! Bounded set of recently seen keys.
//!
//! Used for op-id bookkeeping that must not grow with the lifetime of a
//! session. Once full, inserting evicts the oldest key.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct RecentSet<T> {
    /// Key to the generation it was last inserted with.
    members: HashMap<T, u64>,
    order: VecDeque<(T, u64)>,
    capacity: usize,
    generation: u64,
}

impl<T: Eq + Hash + Clone> RecentSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            members: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            generation: 0,
        }
    }

    /// Insert `key`. Returns false if it was already present.
    pub fn insert(&mut self, key: T) -> bool {
        if self.members.contains_key(&key) {
            return false;
        }
        self.generation += 1;
        self.members.insert(key.clone(), self.generation);
        self.order.push_back((key, self.generation));
        while self.order.len() > self.capacity {
            if let Some((old, generation)) = self.order.pop_front() {
                // A removed and re-inserted key carries a newer generation.
                if self.members.get(&old) == Some(&generation) {
                    self.members.remove(&old);
                }
            }
        }
        true
    }

    pub fn contains(&self, key: &T) -> bool {
        self.members.contains_key(key)
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&mut self, key: &T) -> bool {
        self.members.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
