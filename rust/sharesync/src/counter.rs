use crate::error::SyncError;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

/// Per-key consumer counts.
///
/// Counting only: what happens when a count reaches zero is decided by the
/// owner. Keys whose count returns to zero are dropped from the map.
#[derive(Debug)]
pub struct RefCounter<K> {
    counts: HashMap<K, u64>,
}

impl<K> Default for RefCounter<K> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
        }
    }
}

impl<K> RefCounter<K>
where
    K: Hash + Eq + Clone + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: &K) -> u64 {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrementing a key that is not referenced is reported and clamped at
    /// zero rather than failing the caller.
    pub fn decrement(&mut self, key: &K) -> u64 {
        match self.counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                self.counts.remove(key);
                0
            }
            None => {
                let err = SyncError::UnbalancedReference(key.to_string());
                tracing::error!("{}: released a resource that is not referenced", err);
                0
            }
        }
    }

    pub fn count(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
