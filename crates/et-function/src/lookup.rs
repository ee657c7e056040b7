use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::debug;

#[derive(Debug)]
struct Entry {
    table: Arc<[u32]>,
    refs: usize,
}

fn cache() -> MutexGuard<'static, HashMap<String, Entry>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Entry>>> = OnceLock::new();
    CACHE
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Process-wide cache of gather tables keyed by result type and index
/// expression signature.
pub struct IndexLookupTable;

impl IndexLookupTable {
    /// Returns a token for `key`, running `build` outside the lock on a
    /// miss. When two builders race, the first insert wins and the other
    /// table is discarded. A build returning `None` inserts nothing.
    pub fn create(
        key: String,
        build: impl FnOnce() -> Option<Vec<u32>>,
    ) -> Option<IndexTableToken> {
        if let Some(entry) = cache().get_mut(&key) {
            entry.refs += 1;
            return Some(IndexTableToken {
                table: Arc::clone(&entry.table),
                key,
            });
        }
        let built: Arc<[u32]> = build()?.into();
        let mut guard = cache();
        let entry = guard.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, len = built.len(), "index lookup table built");
            Entry {
                table: Arc::clone(&built),
                refs: 0,
            }
        });
        entry.refs += 1;
        Some(IndexTableToken {
            table: Arc::clone(&entry.table),
            key,
        })
    }

    #[must_use]
    pub fn num_cached() -> usize {
        cache().len()
    }

    #[must_use]
    pub fn count_refs() -> usize {
        cache().values().map(|entry| entry.refs).sum()
    }

    /// References held for one key; zero when it is not cached.
    #[must_use]
    pub fn refs_for(key: &str) -> usize {
        cache().get(key).map_or(0, |entry| entry.refs)
    }
}

/// Reference to a cached table; dropping the last token evicts it.
#[derive(Debug)]
pub struct IndexTableToken {
    key: String,
    table: Arc<[u32]>,
}

impl IndexTableToken {
    #[must_use]
    pub fn table(&self) -> &[u32] {
        &self.table
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for IndexTableToken {
    fn drop(&mut self) {
        let mut guard = cache();
        let evict = match guard.get_mut(&self.key) {
            Some(entry) => {
                assert!(entry.refs > 0, "index table refcount underflow");
                entry.refs -= 1;
                entry.refs == 0
            }
            None => panic!("index table token outlived its cache entry"),
        };
        if evict {
            guard.remove(&self.key);
            debug!(key = %self.key, "index lookup table evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};

    use super::IndexLookupTable;

    static CACHE_TESTS: Mutex<()> = Mutex::new(());

    #[test]
    fn tokens_share_one_table_and_release_it() {
        let _serial = CACHE_TESTS.lock().unwrap_or_else(|err| err.into_inner());
        let key = "tensor(x[3])|shared".to_string();
        let builds = AtomicUsize::new(0);
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            Some(vec![2, 0, 1])
        };
        let first = IndexLookupTable::create(key.clone(), build).expect("table builds");
        let second = IndexLookupTable::create(key.clone(), || Some(vec![9, 9, 9]))
            .expect("cached table is reused");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(second.table(), &[2, 0, 1]);
        assert_eq!(IndexLookupTable::refs_for(&key), 2);
        drop(first);
        assert_eq!(IndexLookupTable::refs_for(&key), 1);
        drop(second);
        assert_eq!(IndexLookupTable::refs_for(&key), 0);
    }

    #[test]
    fn failed_builds_insert_nothing() {
        let _serial = CACHE_TESTS.lock().unwrap_or_else(|err| err.into_inner());
        let before = IndexLookupTable::num_cached();
        assert!(IndexLookupTable::create("tensor(x[2])|invalid".to_string(), || None).is_none());
        assert_eq!(IndexLookupTable::num_cached(), before);
    }

    #[test]
    fn concurrent_requests_converge_on_one_table() {
        let _serial = CACHE_TESTS.lock().unwrap_or_else(|err| err.into_inner());
        let key = "tensor(x[4])|concurrent".to_string();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let tokens = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let barrier = Arc::clone(&barrier);
                    let key = key.clone();
                    scope.spawn(move || {
                        barrier.wait();
                        IndexLookupTable::create(key, || Some(vec![3, 2, 1, 0]))
                            .expect("table builds")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker finishes"))
                .collect::<Vec<_>>()
        });
        let first = tokens[0].table().as_ptr();
        assert!(tokens.iter().all(|token| token.table().as_ptr() == first));
        assert!(tokens.iter().all(|token| token.table() == [3, 2, 1, 0]));
        assert_eq!(IndexLookupTable::refs_for(&key), threads);
        drop(tokens);
        assert_eq!(IndexLookupTable::refs_for(&key), 0);
    }
}
