//! Bounded, aged, insertion-ordered caches (spec §9 "Caches").
//!
//! Every dedupe set and retry map the settlement driver and autopost
//! scheduler keep is one of these: a hard size cap evicts the oldest
//! entry on overflow, and an age cutoff can additionally prune entries
//! older than a caller-supplied threshold on every tick. Ages are
//! advisory per spec §9's open question — callers that need a durable
//! source of truth fall back to the receipts store, never to this cache.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// An insertion-ordered map bounded by both entry count and age.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    max_len: usize,
    order: VecDeque<K>,
    entries: HashMap<K, (i64, V)>,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Insert or overwrite `key`, stamping its insertion time as `now_ms`.
    /// Evicts the oldest entry if this insert pushes the map over capacity.
    pub fn insert(&mut self, key: K, value: V, now_ms: i64) {
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, (now_ms, value));

        while self.entries.len() > self.max_len {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    /// Drop every entry inserted more than `max_age_ms` before `now_ms`.
    pub fn prune_older_than(&mut self, now_ms: i64, max_age_ms: i64) {
        while let Some(front) = self.order.front() {
            match self.entries.get(front) {
                Some((inserted_at, _)) if now_ms - inserted_at > max_age_ms => {
                    let key = self.order.pop_front().unwrap();
                    self.entries.remove(&key);
                }
                Some(_) => break,
                None => {
                    // Already removed via `remove`; drop the stale order entry.
                    self.order.pop_front();
                }
            }
        }
    }
}

/// A bounded, aged set — `BoundedMap<K, ()>` with a friendlier API.
#[derive(Debug)]
pub struct BoundedSet<K> {
    inner: BoundedMap<K, ()>,
}

impl<K> BoundedSet<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: BoundedMap::new(max_len),
        }
    }

    pub fn insert(&mut self, key: K, now_ms: i64) {
        self.inner.insert(key, (), now_ms);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn prune_older_than(&mut self, now_ms: i64, max_age_ms: i64) {
        self.inner.prune_older_than(now_ms, max_age_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_over_capacity() {
        let mut m = BoundedMap::new(2);
        m.insert("a", 1, 0);
        m.insert("b", 2, 1);
        m.insert("c", 3, 2);

        assert_eq!(m.len(), 2);
        assert!(!m.contains_key(&"a"));
        assert!(m.contains_key(&"b"));
        assert!(m.contains_key(&"c"));
    }

    #[test]
    fn prunes_by_age() {
        let mut m = BoundedMap::new(10);
        m.insert("old", 1, 0);
        m.insert("new", 2, 1000);

        m.prune_older_than(1000, 500);

        assert!(!m.contains_key(&"old"));
        assert!(m.contains_key(&"new"));
    }

    #[test]
    fn set_dedupes_envelope_signatures() {
        let mut s = BoundedSet::new(100);
        s.insert("sig-1".to_string(), 0);
        assert!(s.contains(&"sig-1".to_string()));
        assert!(!s.contains(&"sig-2".to_string()));
    }
}
