//! Keyed collections used across the role: a thread-safe collection with
//! snapshot iteration and a bounded insertion-ordered map.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, RwLock},
};

/// Items stored in a [`Collection`] expose their own key.
pub trait HasId {
    fn id(&self) -> String;
}

/// Thread-safe keyed set of shared items. `range` iterates over a snapshot,
/// so callbacks may freely store or delete entries.
#[derive(Debug)]
pub struct Collection<T: HasId> {
    items: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: HasId> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: HasId> Collection<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(&self, id: &str) -> Option<Arc<T>> {
        self.items.read().unwrap().get(id).cloned()
    }

    pub fn store(&self, item: Arc<T>) {
        self.items.write().unwrap().insert(item.id(), item);
    }

    pub fn load_or_store(&self, item: Arc<T>) -> (Arc<T>, bool) {
        let mut items = self.items.write().unwrap();
        match items.get(&item.id()) {
            Some(existing) => (existing.clone(), true),
            None => {
                items.insert(item.id(), item.clone());
                (item, false)
            }
        }
    }

    pub fn delete(&self, id: &str) {
        self.items.write().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    /// Calls `f` for every item in a consistent-as-of-call snapshot. Returning
    /// false stops the iteration.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        let snapshot: Vec<Arc<T>> = self.items.read().unwrap().values().cloned().collect();
        for item in snapshot.iter() {
            if !f(item) {
                break;
            }
        }
    }
}

/// Map with bounded capacity where new records overwrite the oldest ones,
/// preserving insertion order. Not synchronized; owners wrap it in their own
/// lock.
#[derive(Debug)]
pub struct BoundedStackMap<T> {
    capacity: usize,
    keys: VecDeque<String>,
    map: HashMap<String, T>,
}

impl<T> BoundedStackMap<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            keys: VecDeque::with_capacity(capacity),
            map: HashMap::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, key: &str, item: T) {
        if self.keys.len() == self.capacity {
            if let Some(oldest) = self.keys.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.keys.push_back(key.to_string());
        self.map.insert(key.to_string(), item);
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.map.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Index lookup; negative values count from the end.
    pub fn at(&self, index: i64) -> Option<&T> {
        let len = self.keys.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            return None;
        }
        self.map.get(&self.keys[index as usize])
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item(String);

    impl HasId for Item {
        fn id(&self) -> String {
            self.0.clone()
        }
    }

    #[test]
    fn collection_load_or_store_keeps_existing() {
        let c = Collection::new();
        let (first, loaded) = c.load_or_store(Arc::new(Item("a".into())));
        assert!(!loaded);
        let (second, loaded) = c.load_or_store(Arc::new(Item("a".into())));
        assert!(loaded);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn bounded_map_evicts_oldest() {
        let mut m = BoundedStackMap::new(3);
        for i in 0..4 {
            m.push(&i.to_string(), i);
        }
        assert!(m.get("0").is_none());
        assert_eq!(m.get("3"), Some(&3));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn bounded_map_negative_index_is_latest() {
        let mut m = BoundedStackMap::new(2);
        m.push("a", 1);
        m.push("b", 2);
        assert_eq!(m.at(-1), Some(&2));
        assert_eq!(m.at(0), Some(&1));
        assert_eq!(m.at(5), None);
    }
}
