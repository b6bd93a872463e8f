use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::Mutex;

/// One client's algorithm state plus the stamp used for LRU eviction. The
/// stamp lives outside the mutex so eviction scans never contend with an
/// in-flight check.
struct StateCell<S> {
    state: Mutex<S>,
    last_seen_ms: AtomicU64,
}

/// Keyed storage of per-client algorithm state.
///
/// The read-modify-write for one key runs under that key's mutex, so
/// concurrent checks for the same client are totally ordered; distinct keys
/// live in different cells (and different map shards) and never block each
/// other. The tracked-client count is bounded by `max_clients`: inserts past
/// the bound evict the least recently used record, which is safe because a
/// forgotten client is indistinguishable from a new one.
pub struct ClientStore<S> {
    cells: DashMap<String, Arc<StateCell<S>>>,
    max_clients: usize,
}

impl<S: Send> ClientStore<S> {
    pub fn new(max_clients: usize) -> Self {
        Self {
            cells: DashMap::new(),
            max_clients: max_clients.max(1),
        }
    }

    fn cell_for(&self, key: &str, now: f64, init: impl FnOnce() -> S) -> Arc<StateCell<S>> {
        if let Some(cell) = self.cells.get(key) {
            return cell.clone();
        }

        let cell = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(StateCell {
                    state: Mutex::new(init()),
                    last_seen_ms: AtomicU64::new(stamp(now)),
                })
            })
            .clone();

        if self.cells.len() > self.max_clients {
            self.evict_lru();
        }

        cell
    }

    /// Runs `apply` on the client's state with mutual exclusion against all
    /// other calls for the same key, creating the record via `init` on first
    /// use. `apply` is synchronous; nothing network-bound runs under the
    /// lock.
    pub async fn update<R>(
        &self,
        key: &str,
        now: f64,
        init: impl FnOnce() -> S,
        apply: impl FnOnce(&mut S) -> R,
    ) -> R {
        let cell = self.cell_for(key, now, init);
        let mut state = cell.state.lock().await;
        cell.last_seen_ms.store(stamp(now), Ordering::Relaxed);
        apply(&mut state)
    }

    /// Read-only snapshot of the client's state, if tracked. Does not create
    /// a record and does not refresh the LRU stamp.
    pub async fn peek(&self, key: &str) -> Option<S>
    where
        S: Clone,
    {
        let cell = match self.cells.get(key) {
            Some(cell) => cell.clone(),
            None => return None,
        };
        let state = cell.state.lock().await;
        Some(state.clone())
    }

    pub fn remove(&self, key: &str) {
        self.cells.remove(key);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn evict_lru(&self) {
        while self.cells.len() > self.max_clients {
            let mut stalest: Option<(String, u64)> = None;
            for entry in self.cells.iter() {
                let seen = entry.value().last_seen_ms.load(Ordering::Relaxed);
                if stalest.as_ref().is_none_or(|(_, best)| seen < *best) {
                    stalest = Some((entry.key().clone(), seen));
                }
            }

            match stalest {
                Some((key, _)) => {
                    self.cells.remove(&key);
                    tracing::debug!(client = %key, "evicted least recently used client state");
                }
                None => break,
            }
        }
    }
}

fn stamp(now: f64) -> u64 {
    (now * 1000.0).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ClientStore;

    #[tokio::test]
    async fn creates_state_lazily_and_mutates_in_place() {
        let store: ClientStore<u64> = ClientStore::new(16);
        let first = store
            .update("a", 1.0, || 0, |n| {
                *n += 1;
                *n
            })
            .await;
        assert_eq!(first, 1);
        let second = store
            .update("a", 2.0, || 0, |n| {
                *n += 1;
                *n
            })
            .await;
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let store: ClientStore<u64> = ClientStore::new(16);
        store.update("a", 1.0, || 0, |n| *n = 7).await;
        store.update("b", 1.0, || 0, |n| *n = 3).await;
        assert_eq!(store.peek("a").await, Some(7));
        assert_eq!(store.peek("b").await, Some(3));
        assert_eq!(store.peek("c").await, None);
    }

    #[tokio::test]
    async fn remove_forgets_the_client() {
        let store: ClientStore<u64> = ClientStore::new(16);
        store.update("a", 1.0, || 5, |_| ()).await;
        store.remove("a");
        assert_eq!(store.peek("a").await, None);
        store.update("a", 2.0, || 5, |_| ()).await;
        assert_eq!(store.peek("a").await, Some(5));
    }

    #[tokio::test]
    async fn evicts_least_recently_used_past_the_bound() {
        let store: ClientStore<u64> = ClientStore::new(2);
        store.update("a", 1.0, || 1, |_| ()).await;
        store.update("b", 2.0, || 2, |_| ()).await;
        store.update("a", 3.0, || 1, |_| ()).await;
        store.update("c", 4.0, || 3, |_| ()).await;

        assert_eq!(store.len(), 2);
        assert_eq!(store.peek("b").await, None);
        assert_eq!(store.peek("a").await, Some(1));
        assert_eq!(store.peek("c").await, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_updates_are_mutually_exclusive() {
        let store: Arc<ClientStore<u64>> = Arc::new(ClientStore::new(16));
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.update("shared", 1.0, || 0, |n| *n += 1).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.peek("shared").await, Some(64));
    }
}
