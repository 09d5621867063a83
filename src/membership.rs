//! Bidirectional multi-valued index.
//!
//! Tracks many-to-many relations such as client ↔ connection inside a
//! context, or query key ↔ subscriber inside the query registry. Both
//! directions are kept in sync; empty sets are pruned eagerly.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Clone)]
pub struct MembershipIndex<K, V> {
    forward: HashMap<K, HashSet<V>>,
    reverse: HashMap<V, HashSet<K>>,
}

impl<K, V> Default for MembershipIndex<K, V> {
    fn default() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

impl<K, V> MembershipIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pair. Returns false if it was already present.
    pub fn add(&mut self, key: K, value: V) -> bool {
        let inserted = self
            .forward
            .entry(key.clone())
            .or_default()
            .insert(value.clone());
        self.reverse.entry(value).or_default().insert(key);
        inserted
    }

    /// Remove a pair. Missing pairs are ignored.
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        let removed = remove_from(&mut self.forward, key, value);
        remove_from(&mut self.reverse, value, key);
        removed
    }

    /// Remove a key and every pair it participates in. Returns its former values.
    pub fn remove_key(&mut self, key: &K) -> HashSet<V> {
        let values = self.forward.remove(key).unwrap_or_default();
        for value in &values {
            remove_from(&mut self.reverse, value, key);
        }
        values
    }

    /// Remove a value from every key. Returns the keys it was attached to.
    pub fn remove_value(&mut self, value: &V) -> HashSet<K> {
        let keys = self.reverse.remove(value).unwrap_or_default();
        for key in &keys {
            remove_from(&mut self.forward, key, value);
        }
        keys
    }

    pub fn has_key(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    pub fn has_value(&self, value: &V) -> bool {
        self.reverse.contains_key(value)
    }

    pub fn has(&self, key: &K, value: &V) -> bool {
        self.forward
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    /// Number of values attached to `key`
    pub fn count(&self, key: &K) -> usize {
        self.forward.get(key).map(HashSet::len).unwrap_or(0)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Number of distinct values
    pub fn value_len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.forward.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.reverse.keys()
    }

    pub fn values_of<'a>(&'a self, key: &K) -> impl Iterator<Item = &'a V> + 'a {
        self.forward.get(key).into_iter().flat_map(|values| values.iter())
    }

    pub fn keys_of<'a>(&'a self, value: &V) -> impl Iterator<Item = &'a K> + 'a {
        self.reverse.get(value).into_iter().flat_map(|keys| keys.iter())
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&K, &V)> {
        self.forward
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| (key, value)))
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }
}

fn remove_from<A, B>(map: &mut HashMap<A, HashSet<B>>, a: &A, b: &B) -> bool
where
    A: Eq + Hash,
    B: Eq + Hash,
{
    let Some(set) = map.get_mut(a) else {
        return false;
    };
    let removed = set.remove(b);
    if set.is_empty() {
        map.remove(a);
    }
    removed
}
