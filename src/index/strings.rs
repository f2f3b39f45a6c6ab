//! # Interned String Pool
//!
//! Unique strings of a namespace's string indexes live here once, shared by
//! refcount. Deleting the last reference does NOT free the string: selects
//! running under the shared lock may still hold the `Arc` they read from an
//! index, and the engine additionally promises that nothing live at select
//! start is reclaimed while the select is in flight. Dead strings park in
//! `expired` until the background optimizer reaches a quiescent point and
//! calls [`StringPool::remove_expired`].

use std::sync::Arc;

use hashbrown::HashMap;

pub struct StringPool {
    map: HashMap<Arc<str>, usize>,
    expired: Vec<Arc<str>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            expired: Vec::new(),
        }
    }

    /// Shared instance of `s`, refcount incremented.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some((existing, count)) = self.map.get_key_value_mut(s) {
            *count += 1;
            return existing.clone();
        }
        let arc: Arc<str> = Arc::from(s);
        self.map.insert(arc.clone(), 1);
        arc
    }

    /// Drop one reference; the last reference parks the string in the
    /// expired list instead of freeing it.
    pub fn release(&mut self, s: &Arc<str>) {
        if let Some(count) = self.map.get_mut(s.as_ref()) {
            *count -= 1;
            if *count == 0 {
                self.map.remove(s.as_ref());
                self.expired.push(s.clone());
            }
        }
    }

    /// Reclaim parked strings; called only under the exclusive lock.
    pub fn remove_expired(&mut self) -> usize {
        let n = self.expired.len();
        self.expired.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn expired_len(&self) -> usize {
        self.expired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}
