//! Collapsing identical tunnel requests

use super::TunnelResolver;
use crate::{Result, ShoreError};
use async_trait::async_trait;
use hopshell_ssh::Tunnel;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Identity of a tunnel request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelKey {
    /// Destination host
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Requested intermediate hop
    pub through: Option<String>,
}

impl TunnelKey {
    /// Key for `(host, port, through)`
    pub fn new(host: impl Into<String>, port: u16, through: Option<&str>) -> Self {
        Self {
            host: host.into(),
            port,
            through: through.map(str::to_string),
        }
    }
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(through) = &self.through {
            write!(f, " via {}", through)?;
        }
        Ok(())
    }
}

type Resolution = std::result::Result<Arc<dyn Tunnel>, Arc<ShoreError>>;
type Cell = Arc<OnceCell<Resolution>>;

/// Caches resolved tunnels by [`TunnelKey`].
///
/// Concurrent requests for the same key wait on one resolution. A failed
/// resolution is reported to everyone who waited on it and then forgotten, so
/// the next request starts over.
pub struct Memoized {
    inner: Arc<dyn TunnelResolver>,
    cache: Mutex<HashMap<TunnelKey, Cell>>,
}

impl Memoized {
    /// Memoize `inner`
    pub fn new(inner: Arc<dyn TunnelResolver>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached or in-flight keys
    pub fn len(&self) -> usize {
        self.cache().len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the entry for `key`, closing its tunnel if it resolved
    pub async fn forget(&self, key: &TunnelKey) {
        let cell = self.cache().remove(key);
        if let Some(cell) = cell {
            close_cell(key, &cell).await;
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<TunnelKey, Cell>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` only if it still maps to `cell`
    fn evict(&self, key: &TunnelKey, cell: &Cell) {
        let mut cache = self.cache();
        if cache.get(key).is_some_and(|current| Arc::ptr_eq(current, cell)) {
            cache.remove(key);
        }
    }
}

async fn close_cell(key: &TunnelKey, cell: &Cell) {
    if let Some(Ok(tunnel)) = cell.get() {
        if let Err(e) = tunnel.close().await {
            warn!("Error closing tunnel for {}: {}", key, e);
        }
    }
}

#[async_trait]
impl TunnelResolver for Memoized {
    async fn tunnel(&self, host: &str, port: u16, through: Option<&str>) -> Result<Arc<dyn Tunnel>> {
        let key = TunnelKey::new(host, port, through);
        let cell = Arc::clone(self.cache().entry(key.clone()).or_default());

        let resolution = cell
            .get_or_init(|| async {
                debug!("Resolving tunnel for {}", key);
                self.inner.tunnel(host, port, through).await.map_err(Arc::new)
            })
            .await;

        match resolution {
            Ok(tunnel) => Ok(Arc::clone(tunnel)),
            Err(e) => {
                let e = Arc::clone(e);
                self.evict(&key, &cell);
                Err(ShoreError::Shared(e))
            }
        }
    }

    async fn close(&self) {
        let entries: Vec<(TunnelKey, Cell)> = self.cache().drain().collect();
        for (key, cell) in &entries {
            close_cell(key, cell).await;
        }
        self.inner.close().await;
    }
}
