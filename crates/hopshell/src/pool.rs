//! Connection slot pool.
//!
//! A [`PooledShell`] looks like one shell to its callers but spreads their
//! sessions over as many underlying connections as needed. Each connection
//! (a slot) admits at most `max_sessions_per_connection` concurrent sessions;
//! when every slot is full a new one is added, so admission never waits for
//! capacity.

use async_trait::async_trait;
use bytes::Bytes;
use hopshell_ssh::{Connector, Exec, ExecOutput, FileAccess, Login, OutputStream, Shell, Tunnel, Tunneling, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};
use tokio::sync::{Mutex, OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Sessions a single connection admits by default (sshd's `MaxSessions` is 10)
pub const DEFAULT_MAX_SESSIONS: usize = 9;

/// Slot pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent sessions admitted per underlying connection
    pub max_sessions_per_connection: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_connection: DEFAULT_MAX_SESSIONS,
        }
    }
}

/// One underlying connection and its admission budget
struct Slot {
    id: usize,
    permits: Arc<Semaphore>,
    shell: OnceCell<Arc<dyn Shell>>,
    reclaimed: AtomicBool,
}

impl Slot {
    fn new(id: usize, max_sessions: usize) -> Self {
        Self {
            id,
            permits: Arc::new(Semaphore::new(max_sessions)),
            shell: OnceCell::new(),
            reclaimed: AtomicBool::new(false),
        }
    }

    /// Hand out the connection for closing, once
    fn reclaim(&self) -> Option<Arc<dyn Shell>> {
        let shell = self.shell.get()?;
        if self.reclaimed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Arc::clone(shell))
    }

    fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).try_acquire_owned().ok()
    }

    /// Connect on first use; a failed attempt leaves the slot unconnected
    async fn shell(&self, login: &Login, connector: &dyn Connector) -> Result<Arc<dyn Shell>, TransportError> {
        self.shell
            .get_or_try_init(|| async {
                info!("Opening connection #{} to {}", self.id, login);
                connector
                    .connect(login)
                    .await
                    .map_err(|e| TransportError::connect(login, e))
            })
            .await
            .cloned()
    }
}

/// Admission to one slot.
///
/// Ending the token (or dropping it) frees the permit; the slot's connection
/// stays open for the next session.
pub struct SessionToken {
    slot: Arc<Slot>,
    permit: SyncMutex<Option<OwnedSemaphorePermit>>,
}

impl SessionToken {
    fn new(slot: Arc<Slot>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            slot,
            permit: SyncMutex::new(Some(permit)),
        }
    }

    /// Slot this session was admitted to
    pub fn slot_id(&self) -> usize {
        self.slot.id
    }

    /// Whether the permit is still held
    pub fn is_active(&self) -> bool {
        self.permit.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Release the permit. Returns `false` if it was already released.
    pub fn end(&self) -> bool {
        let released = self
            .permit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if released {
            debug!("Session on connection #{} ended", self.slot.id);
        }
        released
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots created so far
    pub slots: usize,
    /// Slots whose connection is established
    pub connected: usize,
    /// Sessions currently admitted
    pub busy_sessions: usize,
}

/// A shell multiplexed over a growable set of connections to one login
pub struct PooledShell {
    login: Login,
    connector: Arc<dyn Connector>,
    max_sessions: usize,
    /// Most recently added first
    slots: Mutex<VecDeque<Arc<Slot>>>,
    next_slot: AtomicUsize,
    closed: AtomicBool,
}

impl PooledShell {
    /// Create an empty pool; nothing connects until the first session
    pub fn new(login: Login, connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            login,
            connector,
            max_sessions: config.max_sessions_per_connection.max(1),
            slots: Mutex::new(VecDeque::new()),
            next_slot: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit a session, reusing spare capacity or adding a slot.
    ///
    /// The scan and the growth happen under one lock, so two callers never
    /// both add a slot while an existing one still has room.
    pub async fn begin_session(&self) -> SessionToken {
        let mut slots = self.slots.lock().await;

        loop {
            for slot in slots.iter() {
                if let Some(permit) = slot.try_admit() {
                    debug!("Admitted session on connection #{} to {}", slot.id, self.login);
                    return SessionToken::new(Arc::clone(slot), permit);
                }
            }

            // every slot is full; the new one is scanned first on the next pass
            let id = self.next_slot.fetch_add(1, Ordering::SeqCst);
            slots.push_front(Arc::new(Slot::new(id, self.max_sessions)));
            debug!("Added connection slot #{} for {} ({} total)", id, self.login, slots.len());
        }
    }

    /// Current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        PoolStats {
            slots: slots.len(),
            connected: slots.iter().filter(|slot| slot.shell.initialized()).count(),
            busy_sessions: slots
                .iter()
                .map(|slot| self.max_sessions - slot.permits.available_permits())
                .sum(),
        }
    }

    /// Admit a session and make sure its slot is connected
    async fn admit(&self) -> Result<(SessionToken, Arc<dyn Shell>), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.login.to_string()));
        }

        let token = self.begin_session().await;
        let shell = token.slot.shell(&self.login, self.connector.as_ref()).await?;

        // close() may have drained this slot while it was still connecting
        if self.closed.load(Ordering::SeqCst) {
            self.close_slot(&token.slot).await;
            return Err(TransportError::Closed(self.login.to_string()));
        }
        Ok((token, shell))
    }

    async fn close_slot(&self, slot: &Slot) {
        let Some(shell) = slot.reclaim() else {
            return;
        };
        debug!("Closing connection #{} to {}", slot.id, self.login);
        if let Err(e) = shell.close().await {
            warn!("Error closing connection #{} to {}: {}", slot.id, self.login, e);
        }
    }
}

#[async_trait]
impl Shell for PooledShell {
    fn login(&self) -> &Login {
        &self.login
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn Exec>, TransportError> {
        let (token, shell) = self.admit().await?;
        let inner = shell.exec(command).await?;
        Ok(Box::new(SessionExec { inner, token }))
    }

    async fn tunnel(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError> {
        let (token, shell) = self.admit().await?;
        let inner = shell.tunnel(spec).await?;
        Ok(Box::new(SessionTunnel { inner, token }))
    }

    async fn file_access(&self) -> Result<Box<dyn FileAccess>, TransportError> {
        let (token, shell) = self.admit().await?;
        let inner = shell.file_access().await?;
        Ok(Box::new(SessionFiles { inner, token }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<Slot>> = self.slots.lock().await.drain(..).collect();

        // slots still connecting are closed by the admission that connects them
        for slot in slots {
            self.close_slot(&slot).await;
        }
        Ok(())
    }
}

/// Command holding a session until closed
struct SessionExec {
    inner: Box<dyn Exec>,
    token: SessionToken,
}

#[async_trait]
impl Exec for SessionExec {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.inner.take_stdout()
    }

    async fn wait(&mut self) -> Result<ExecOutput, TransportError> {
        self.inner.wait().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let result = self.inner.close().await;
        self.token.end();
        result
    }
}

/// Forward holding a session until closed
struct SessionTunnel {
    inner: Box<dyn Tunnel>,
    token: SessionToken,
}

#[async_trait]
impl Tunnel for SessionTunnel {
    fn host(&self) -> &str {
        self.inner.host()
    }

    fn port(&self) -> u16 {
        self.inner.port()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.inner.close().await;
        self.token.end();
        result
    }
}

/// File access holding a session until closed
struct SessionFiles {
    inner: Box<dyn FileAccess>,
    token: SessionToken,
}

#[async_trait]
impl FileAccess for SessionFiles {
    async fn read(&self, path: &str) -> Result<Bytes, TransportError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError> {
        self.inner.write(path, data).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.inner.close().await;
        self.token.end();
        result
    }
}

/// [`Connector`] that wraps each login in a [`PooledShell`]
pub struct PooledConnector {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
}

impl PooledConnector {
    /// Pool the shells produced by `connector`
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self { connector, config }
    }
}

#[async_trait]
impl Connector for PooledConnector {
    async fn connect(&self, login: &Login) -> Result<Arc<dyn Shell>, TransportError> {
        Ok(Arc::new(PooledShell::new(
            login.clone(),
            Arc::clone(&self.connector),
            self.config.clone(),
        )))
    }
}
