//! Per-identifier write locks.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Prune dead entries once the map grows past this.
const PRUNE_THRESHOLD: usize = 1024;

/// Hands out one mutex per key so writes to the same external identifier
/// serialize while writes to disjoint identifiers do not contend.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    inner: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl KeyLocks {
    pub(crate) fn handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock();
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(Mutex::new(()));
        map.insert(key.to_string(), Arc::downgrade(&lock));
        if map.len() > PRUNE_THRESHOLD {
            map.retain(|_, w| w.strong_count() > 0);
        }
        lock
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_a_lock() {
        let locks = KeyLocks::default();
        let a = locks.handle("X1");
        let b = locks.handle("X1");
        let c = locks.handle("X2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn held_lock_blocks_same_key_only() {
        let locks = KeyLocks::default();
        let a = locks.handle("X1");
        let _guard = a.lock();
        assert!(locks.handle("X1").try_lock().is_none());
        assert!(locks.handle("X2").try_lock().is_some());
        assert_eq!(locks.len(), 2);
    }
}
