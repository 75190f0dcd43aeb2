//! Resource-bounded cache with singleflight construction.
//!
//! Backs the two process-wide caches: open dump database handles (capacity
//! counted per handle) and decoded document payloads (capacity counted in
//! bytes). Entries carry a borrow count; `get` checks an entry out and
//! `release` returns it. Eviction is LRU over zero-borrow entries only, so
//! a handle in active use is never closed underneath its user.
//!
//! Concurrent `get` calls for the same missing key run the factory exactly
//! once; every waiter receives the same value or the same error. Factory
//! errors are never cached.
//!
//! Thread-safe via interior mutability using parking_lot::Mutex; the lock
//! is never held across an await point.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// Hook invoked with an entry's key and value when it is evicted or the
/// cache is disposed (e.g. closing a database handle).
pub type DisposeHook<K, V> = Box<dyn Fn(&K, V) + Send + Sync>;

/// Errors surfaced by [`ResourceCache::get`].
///
/// Cloneable so a single factory failure can be fanned out to every caller
/// waiting on the same key.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache factory failed: {0}")]
    Factory(Arc<anyhow::Error>),
}

/// Cache metrics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    /// Number of `get` calls served from a resident entry.
    pub hits: u64,
    /// Number of `get` calls that had to wait on or run the factory.
    pub misses: u64,
    /// Number of entries evicted.
    pub evictions: u64,
}

struct CacheEntry<V> {
    value: V,
    cost: u64,
    borrows: u32,
}

type Waiter<V> = oneshot::Sender<Result<V, CacheError>>;

struct Inner<K: Hash + Eq, V> {
    /// Resident entries; most recently used at the front. Eviction is
    /// managed manually against `idle_cost`, so the LruCache itself is
    /// unbounded.
    entries: LruCache<K, CacheEntry<V>>,
    /// Keys with an in-flight factory, and the callers waiting on them.
    pending: HashMap<K, Vec<Waiter<V>>>,
    /// Total cost of zero-borrow entries. This is the quantity bounded by
    /// the configured capacity; borrowed entries are exempt until released.
    idle_cost: u64,
    metrics: CacheMetrics,
}

/// Bounded LRU cache with borrow counting and singleflight construction.
pub struct ResourceCache<K: Hash + Eq + Clone, V: Clone> {
    capacity: u64,
    inner: Mutex<Inner<K, V>>,
    dispose: Option<DisposeHook<K, V>>,
}

impl<K, V> ResourceCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    /// Create a cache holding at most `capacity` total cost among
    /// zero-borrow entries. Cost 1 per entry gives a plain entry-count
    /// bound.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                pending: HashMap::new(),
                idle_cost: 0,
                metrics: CacheMetrics::default(),
            }),
            dispose: None,
        }
    }

    /// Attach a hook invoked with each evicted entry.
    pub fn with_dispose(mut self, hook: DisposeHook<K, V>) -> Self {
        self.dispose = Some(hook);
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of cache metrics.
    pub fn metrics(&self) -> CacheMetrics {
        self.inner.lock().metrics.clone()
    }

    /// Whether a key is resident (does not refresh recency).
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Return the cached value for `key`, or run `factory` to construct it.
    ///
    /// The returned value is checked out: the entry cannot be evicted until
    /// a matching [`release`](Self::release). The factory produces the value
    /// together with its cost contribution.
    pub async fn get<F, Fut>(&self, key: K, factory: F) -> Result<V, CacheError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<(V, u64)>>,
    {
        loop {
            let waiter = {
                let inner = &mut *self.inner.lock();
                if let Some(entry) = inner.entries.get_mut(&key) {
                    if entry.borrows == 0 {
                        inner.idle_cost -= entry.cost;
                    }
                    entry.borrows += 1;
                    inner.metrics.hits += 1;
                    return Ok(entry.value.clone());
                }

                inner.metrics.misses += 1;
                if let Some(waiters) = inner.pending.get_mut(&key) {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                } else {
                    inner.pending.insert(key.clone(), Vec::new());
                    None
                }
            };

            match waiter {
                // Another caller owns the factory for this key; wait for its
                // broadcast. A dropped sender means the owner went away
                // before finishing, so contend for the key again.
                Some(rx) => match rx.await {
                    Ok(Ok(value)) => {
                        self.borrow_resident(&key);
                        return Ok(value);
                    }
                    Ok(Err(err)) => return Err(err),
                    Err(_) => continue,
                },
                None => return self.build(&key, &factory).await,
            }
        }
    }

    /// Run the factory for `key` and publish the result to all waiters.
    async fn build<F, Fut>(&self, key: &K, factory: &F) -> Result<V, CacheError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<(V, u64)>>,
    {
        // If this future is dropped mid-factory the pending slot must be
        // cleared, otherwise waiters would block forever on a key nobody is
        // building.
        let guard = PendingGuard {
            inner: &self.inner,
            key: Some(key.clone()),
        };

        let built = factory().await;

        let (result, evicted) = {
            let inner = &mut *self.inner.lock();
            let waiters = inner.pending.remove(key).unwrap_or_default();
            match built {
                Ok((value, cost)) => {
                    inner.entries.put(
                        key.clone(),
                        CacheEntry {
                            value: value.clone(),
                            cost,
                            borrows: 1,
                        },
                    );
                    for tx in waiters {
                        let _ = tx.send(Ok(value.clone()));
                    }
                    let evicted = evict_locked(inner, self.capacity);
                    (Ok(value), evicted)
                }
                Err(err) => {
                    let err = CacheError::Factory(Arc::new(err));
                    for tx in waiters {
                        let _ = tx.send(Err(err.clone()));
                    }
                    (Err(err), Vec::new())
                }
            }
        };
        guard.disarm();

        self.run_dispose(evicted);
        result
    }

    /// Check out an entry woken from a singleflight wait. The entry may
    /// already have been evicted under a tiny capacity; the waiter still
    /// holds the broadcast value and its later `release` becomes a no-op.
    fn borrow_resident(&self, key: &K) {
        let inner = &mut *self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.borrows == 0 {
                inner.idle_cost -= entry.cost;
            }
            entry.borrows += 1;
        }
    }

    /// Return a checked-out entry. Once the borrow count reaches zero the
    /// entry becomes eligible for eviction, and any eviction deferred while
    /// it was busy runs now.
    pub fn release(&self, key: &K) {
        let evicted = {
            let inner = &mut *self.inner.lock();
            if let Some(entry) = inner.entries.peek_mut(key) {
                if entry.borrows > 0 {
                    entry.borrows -= 1;
                    if entry.borrows == 0 {
                        let cost = entry.cost;
                        inner.idle_cost += cost;
                    }
                }
            }
            evict_locked(inner, self.capacity)
        };
        self.run_dispose(evicted);
    }

    /// Drop every entry, invoking the dispose hook for each. Entries still
    /// borrowed are logged and dropped anyway; callers own the shutdown
    /// ordering.
    pub fn dispose(&self) {
        let drained = {
            let inner = &mut *self.inner.lock();
            let mut drained = Vec::with_capacity(inner.entries.len());
            while let Some((key, entry)) = inner.entries.pop_lru() {
                drained.push((key, entry));
            }
            inner.idle_cost = 0;
            drained
        };

        let mut evicted = Vec::with_capacity(drained.len());
        for (key, entry) in drained {
            if entry.borrows > 0 {
                warn!(borrows = entry.borrows, "disposing cache entry still checked out");
            }
            evicted.push((key, entry.value));
        }
        self.run_dispose(evicted);
    }

    fn run_dispose(&self, evicted: Vec<(K, V)>) {
        if let Some(hook) = &self.dispose {
            for (key, value) in evicted {
                hook(&key, value);
            }
        }
    }
}

/// Evict least-recently-used zero-borrow entries until their total cost is
/// within capacity. Busy entries are skipped; their eviction is deferred to
/// the release that makes them idle.
fn evict_locked<K: Hash + Eq + Clone, V>(inner: &mut Inner<K, V>, capacity: u64) -> Vec<(K, V)> {
    if inner.idle_cost <= capacity {
        return Vec::new();
    }

    let mut victims = Vec::new();
    let mut projected = inner.idle_cost;
    // LruCache::iter() returns MRU first, so .rev() gives us LRU first
    for (key, entry) in inner.entries.iter().rev() {
        if projected <= capacity {
            break;
        }
        if entry.borrows == 0 {
            victims.push(key.clone());
            projected = projected.saturating_sub(entry.cost);
        }
    }

    let mut evicted = Vec::with_capacity(victims.len());
    for key in victims {
        if let Some(entry) = inner.entries.pop(&key) {
            inner.idle_cost = inner.idle_cost.saturating_sub(entry.cost);
            inner.metrics.evictions += 1;
            evicted.push((key, entry.value));
        }
    }
    evicted
}

/// Clears a key's pending slot if its factory future is dropped before
/// completion, waking waiters so one of them can take over the build.
struct PendingGuard<'a, K: Hash + Eq, V> {
    inner: &'a Mutex<Inner<K, V>>,
    key: Option<K>,
}

impl<K: Hash + Eq, V> PendingGuard<'_, K, V> {
    fn disarm(mut self) {
        self.key = None;
    }
}

impl<K: Hash + Eq, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inner.lock().pending.remove(&key);
        }
    }
}
