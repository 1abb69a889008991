//! Bounded "already seen" set.
//!
//! Eviction is FIFO by first insertion: re-inserting an id that is still
//! present neither refreshes it nor uses extra capacity. Each consumer owns its
//! own instance (the importer keeps one for "already imported", a screen keeps
//! one for "already displayed"); they are never shared.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct DedupCache<K = String> {
    capacity: usize,
    members: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone> DedupCache<K> {
    /// Create a cache holding at most `capacity` ids (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            members: HashSet::with_capacity(capacity.min(4096)),
            order: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    pub fn contains(&self, id: &K) -> bool {
        self.members.contains(id)
    }

    /// Insert an id. Returns `true` if it was not present.
    pub fn insert(&mut self, id: K) -> bool {
        if self.members.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.members.remove(&oldest);
        }
        self.members.insert(id.clone());
        self.order.push_back(id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.order.clear();
    }
}
