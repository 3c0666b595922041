//! Keyed, reference-counted sharing of lazily constructed values.
//!
//! A [`Registry`] hands out [`Reusable`] handles. The first acquisition of a
//! key constructs the value through the registry's [`Recycle`] implementation;
//! later acquisitions share it. When the last handle for a key is released the
//! value is destroyed, exactly once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Constructs and tears down the values of a [`Registry`]
#[async_trait]
pub trait Recycle<K, V, E>: Send + Sync {
    /// Build the value for `key`
    async fn create(&self, key: &K) -> Result<V, E>;

    /// Tear down a value whose last handle was released
    async fn destroy(&self, key: &K, value: &V);
}

struct Entry<V> {
    generation: u64,
    refs: usize,
    cell: Arc<OnceCell<Arc<V>>>,
}

struct Inner<K, V, E> {
    name: &'static str,
    recycler: Arc<dyn Recycle<K, V, E>>,
    entries: Mutex<HashMap<K, Entry<V>>>,
    next_generation: Mutex<u64>,
}

impl<K, V, E> Inner<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one reference on `key`, creating the entry if needed
    fn retain(&self, key: &K) -> (u64, Arc<OnceCell<Arc<V>>>) {
        let mut entries = self.entries();
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            let mut next = self.next_generation.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            Entry {
                generation: *next,
                refs: 0,
                cell: Arc::new(OnceCell::new()),
            }
        });
        entry.refs += 1;
        (entry.generation, Arc::clone(&entry.cell))
    }

    /// Drop one reference; returns the value to destroy when it was the last one
    fn forget(&self, key: &K, generation: u64) -> Option<Arc<V>> {
        let mut entries = self.entries();
        let entry = match entries.get_mut(key) {
            Some(entry) if entry.generation == generation => entry,
            _ => return None,
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }

        let entry = entries.remove(key)?;
        entry.cell.get().cloned()
    }

    async fn teardown(&self, key: &K, value: Arc<V>) {
        debug!("Tearing down {} {:?}", self.name, key);
        self.recycler.destroy(key, &value).await;
    }

    /// Release without awaiting, for drop paths
    fn release_detached(self: &Arc<Self>, key: &K, generation: u64) {
        let Some(value) = self.forget(key, generation) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                let key = key.clone();
                handle.spawn(async move {
                    inner.teardown(&key, value).await;
                });
            }
            Err(_) => warn!("No runtime to tear down {} {:?}; dropping it", self.name, key),
        }
    }
}

/// Keyed cache of shared values with reference-counted lifetimes
pub struct Registry<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for Registry<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> Registry<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Create a registry; `name` only appears in logs
    pub fn new(name: &'static str, recycler: Arc<dyn Recycle<K, V, E>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                recycler,
                entries: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
            }),
        }
    }

    /// Check out the value for `key`, constructing it on first use.
    ///
    /// Concurrent callers for the same key wait on a single construction. A
    /// failed construction is returned to the caller that ran it and is not
    /// remembered; the next acquisition tries again.
    pub async fn acquire(&self, key: K) -> Result<Reusable<K, V, E>, E> {
        let (generation, cell) = self.inner.retain(&key);
        let mut guard = Reservation {
            inner: &self.inner,
            key: &key,
            generation,
            armed: true,
        };

        let recycler = Arc::clone(&self.inner.recycler);
        let result = cell
            .get_or_try_init(|| async {
                debug!("Constructing {} {:?}", self.inner.name, key);
                recycler.create(&key).await.map(Arc::new)
            })
            .await
            .cloned();

        match result {
            Ok(value) => {
                guard.armed = false;
                drop(guard);
                Ok(Reusable {
                    key,
                    generation,
                    value,
                    registry: Arc::clone(&self.inner),
                    released: AtomicBool::new(false),
                })
            }
            Err(e) => {
                guard.armed = false;
                if let Some(value) = self.inner.forget(&key, generation) {
                    // another caller constructed and released it meanwhile
                    self.inner.teardown(&key, value).await;
                }
                Err(e)
            }
        }
    }

    /// Number of keys with live handles
    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    /// Whether no key has live handles
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding handles for `key`
    pub fn references(&self, key: &K) -> usize {
        self.inner.entries().get(key).map_or(0, |entry| entry.refs)
    }

    /// Tear down every live value regardless of outstanding handles.
    ///
    /// Handles released afterwards are no-ops. Returns the number of values
    /// destroyed.
    pub async fn drain(&self) -> usize {
        let drained: Vec<(K, Entry<V>)> = self.inner.entries().drain().collect();
        let mut destroyed = 0;
        for (key, entry) in drained {
            if let Some(value) = entry.cell.get().cloned() {
                self.inner.teardown(&key, value).await;
                destroyed += 1;
            }
        }
        destroyed
    }
}

/// Undoes a reference taken by `acquire` if its future is dropped mid-construction
struct Reservation<'a, K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    inner: &'a Arc<Inner<K, V, E>>,
    key: &'a K,
    generation: u64,
    armed: bool,
}

impl<K, V, E> Drop for Reservation<'_, K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.inner.release_detached(self.key, self.generation);
        }
    }
}

/// A checked-out reference to a shared value
pub struct Reusable<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    key: K,
    generation: u64,
    value: Arc<V>,
    registry: Arc<Inner<K, V, E>>,
    released: AtomicBool,
}

impl<K, V, E> Reusable<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    /// Key this handle was acquired for
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Shared pointer to the value
    pub fn value(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }

    /// Whether [`Reusable::release`] has run
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Give the reference back; the last release destroys the value.
    /// Releasing again does nothing.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(value) = self.registry.forget(&self.key, self.generation) {
            self.registry.teardown(&self.key, value).await;
        }
    }
}

impl<K, V, E> Deref for Reusable<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K, V, E> Drop for Reusable<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.registry.release_detached(&self.key, self.generation);
        }
    }
}

impl<K, V, E> fmt::Debug for Reusable<K, V, E>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
    V: Send + Sync + 'static,
    E: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reusable")
            .field("registry", &self.registry.name)
            .field("key", &self.key)
            .field("released", &self.is_released())
            .finish()
    }
}
