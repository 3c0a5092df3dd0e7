// Shared reassembly store, completed parts keyed by start offset.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Terminal state of one byte range, handed over by the worker that fetched it.
#[derive(Debug, Clone)]
pub struct FetchedPart {
    pub start: u64,
    /// Payload on success, or the last error after retries ran out.
    pub payload: Result<Bytes, String>,
}

/// Parts written by many workers and removed by a single consumer.
///
/// Holds at most one entry per offset. Every insert wakes the consumer.
#[derive(Default)]
pub struct ReassemblyStore {
    parts: Mutex<HashMap<u64, Result<Bytes, String>>>,
    notify: Notify,
}

impl ReassemblyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a completed part over. Returns `false` if the offset was already taken.
    pub fn insert(&self, part: FetchedPart) -> bool {
        let inserted = {
            let mut parts = self.parts.lock();
            match parts.entry(part.start) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(part.payload);
                    true
                }
            }
        };
        if inserted {
            // notify_one keeps a permit if the consumer is not parked yet.
            self.notify.notify_one();
        }
        inserted
    }

    /// Remove the part starting at `offset`, if it has arrived.
    pub fn take(&self, offset: u64) -> Option<FetchedPart> {
        self.parts
            .lock()
            .remove(&offset)
            .map(|payload| FetchedPart { start: offset, payload })
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.parts.lock().contains_key(&offset)
    }

    pub fn len(&self) -> usize {
        self.parts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.lock().is_empty()
    }

    /// Drop every buffered part, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut parts = self.parts.lock();
        let n = parts.len();
        parts.clear();
        n
    }

    /// Resolves after the next insert (or immediately if one happened unobserved).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_at_most_once() {
        let store = ReassemblyStore::new();
        assert!(store.insert(FetchedPart {
            start: 0,
            payload: Ok(Bytes::from_static(b"abc")),
        }));
        assert!(!store.insert(FetchedPart {
            start: 0,
            payload: Ok(Bytes::from_static(b"xyz")),
        }));
        let part = store.take(0).unwrap();
        assert_eq!(part.payload.unwrap(), Bytes::from_static(b"abc"));
        assert!(store.take(0).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_discards_parts() {
        let store = ReassemblyStore::new();
        for start in [0u64, 10, 20] {
            store.insert(FetchedPart {
                start,
                payload: Err("boom".to_string()),
            });
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.clear(), 3);
        assert!(!store.contains(10));
    }

    #[tokio::test]
    async fn test_insert_before_wait_is_not_lost() {
        let store = ReassemblyStore::new();
        store.insert(FetchedPart {
            start: 0,
            payload: Ok(Bytes::new()),
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), store.notified())
            .await
            .expect("stored permit should wake the waiter");
    }
}
