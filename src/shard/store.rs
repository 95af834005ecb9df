//! In-memory value map owned by one shard

use crate::common::types::{Key, KeySet, Payload, Value};
use crate::common::utils::{read, write};
use std::collections::HashMap;
use std::sync::RwLock;

/// Key → value map. Writes come only from committed transactions; reads take
/// the shared side of the lock and never wait on key locks.
#[derive(Debug, Default)]
pub struct ValueStore {
    map: RwLock<HashMap<Key, Value>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a committed payload as one batch (last writer wins per key).
    pub fn apply(&self, payload: &Payload) {
        let mut map = write(&self.map);
        for (key, value) in payload {
            map.insert(*key, value.clone());
        }
    }

    /// Values for the requested keys that are present; absent keys are skipped.
    pub fn get_many(&self, keys: &KeySet) -> Payload {
        let map = read(&self.map);
        keys.iter()
            .filter_map(|key| map.get(key).map(|value| (*key, value.clone())))
            .collect()
    }

    pub fn get(&self, key: Key) -> Option<Value> {
        read(&self.map).get(&key).cloned()
    }

    pub fn contains(&self, key: Key) -> bool {
        read(&self.map).contains_key(&key)
    }

    pub fn len(&self) -> usize {
        read(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_get_many() {
        let store = ValueStore::new();
        store.apply(&[(1, b"a".to_vec()), (2, b"b".to_vec())].into_iter().collect());
        store.apply(&[(2, b"c".to_vec())].into_iter().collect());

        let got = store.get_many(&[1, 2, 3].into_iter().collect());
        assert_eq!(got.len(), 2);
        assert_eq!(got[&1], b"a");
        assert_eq!(got[&2], b"c");
        assert!(!store.contains(3));
        assert_eq!(store.len(), 2);
    }
}
