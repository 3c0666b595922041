//! Login-keyed sharing of shells.
//!
//! The [`Shore`] keeps one shell per [`Login`] alive for as long as any
//! [`SharedShell`] wrapper for it is open. Tunnels and file-access sessions
//! taken from a wrapper are shared the same way, through registries nested in
//! the shared entry.

use async_trait::async_trait;
use bytes::Bytes;
use crate::pool::{PoolConfig, PooledConnector};
use crate::reusable::{Recycle, Registry, Reusable};
use hopshell_ssh::{Connector, Exec, FileAccess, Login, Shell, Tunnel, Tunneling, TransportError};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// One shared shell and the resources handed out from it
struct Shared {
    shell: Arc<dyn Shell>,
    tunnels: Registry<Tunneling, Box<dyn Tunnel>, TransportError>,
    files: Registry<Uuid, Box<dyn FileAccess>, TransportError>,
}

impl Shared {
    fn new(shell: Arc<dyn Shell>) -> Self {
        Self {
            tunnels: Registry::new("tunnel", Arc::new(TunnelRecycler { shell: Arc::clone(&shell) })),
            files: Registry::new("file access", Arc::new(FileRecycler { shell: Arc::clone(&shell) })),
            shell,
        }
    }
}

struct ShellRecycler {
    connector: Arc<dyn Connector>,
}

#[async_trait]
impl Recycle<Login, Shared, TransportError> for ShellRecycler {
    async fn create(&self, login: &Login) -> Result<Shared, TransportError> {
        let shell = self.connector.connect(login).await?;
        Ok(Shared::new(shell))
    }

    async fn destroy(&self, login: &Login, shared: &Shared) {
        let tunnels = shared.tunnels.drain().await;
        let files = shared.files.drain().await;
        if tunnels + files > 0 {
            debug!("Closed {} tunnels and {} file sessions left open on {}", tunnels, files, login);
        }
        if let Err(e) = shared.shell.close().await {
            warn!("Error closing shell for {}: {}", login, e);
        }
    }
}

struct TunnelRecycler {
    shell: Arc<dyn Shell>,
}

#[async_trait]
impl Recycle<Tunneling, Box<dyn Tunnel>, TransportError> for TunnelRecycler {
    async fn create(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError> {
        self.shell.tunnel(spec).await
    }

    async fn destroy(&self, spec: &Tunneling, tunnel: &Box<dyn Tunnel>) {
        if let Err(e) = tunnel.close().await {
            warn!("Error closing tunnel {} on {}: {}", spec, self.shell.login(), e);
        }
    }
}

struct FileRecycler {
    shell: Arc<dyn Shell>,
}

#[async_trait]
impl Recycle<Uuid, Box<dyn FileAccess>, TransportError> for FileRecycler {
    async fn create(&self, _owner: &Uuid) -> Result<Box<dyn FileAccess>, TransportError> {
        self.shell.file_access().await
    }

    async fn destroy(&self, _owner: &Uuid, files: &Box<dyn FileAccess>) {
        if let Err(e) = files.close().await {
            warn!("Error closing file access on {}: {}", self.shell.login(), e);
        }
    }
}

/// Factory of shared shells keyed by login
#[derive(Clone)]
pub struct Shore {
    shells: Registry<Login, Shared, TransportError>,
}

impl Shore {
    /// Share the shells produced by `connector`
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            shells: Registry::new("shell", Arc::new(ShellRecycler { connector })),
        }
    }

    /// Share pooled shells: each login gets a [`crate::PooledShell`] over `connector`
    pub fn pooled(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self::new(Arc::new(PooledConnector::new(connector, config)))
    }

    /// Check out the shell for `login`, creating it on first use
    pub async fn get_shell(&self, login: &Login) -> Result<SharedShell, TransportError> {
        let handle = self.shells.acquire(login.clone()).await?;
        let shell = SharedShell {
            id: Uuid::new_v4(),
            handle,
        };
        debug!("Checked out shell {} for {}", shell.id, login);
        Ok(shell)
    }

    /// Logins with open wrappers
    pub fn active(&self) -> usize {
        self.shells.len()
    }

    /// Open wrappers for `login`
    pub fn references(&self, login: &Login) -> usize {
        self.shells.references(login)
    }

    /// Close every shell, whether or not wrappers are still open
    pub async fn close(&self) {
        let closed = self.shells.drain().await;
        debug!("Shore closed {} shells", closed);
    }
}

/// A checked-out shell. Closing it gives the shell back to the [`Shore`].
pub struct SharedShell {
    id: Uuid,
    handle: Reusable<Login, Shared, TransportError>,
}

impl SharedShell {
    /// Identity of this wrapper; file-access sessions are shared per wrapper
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.handle.is_released() {
            return Err(TransportError::Closed(self.handle.key().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Shell for SharedShell {
    fn login(&self) -> &Login {
        self.handle.key()
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn Exec>, TransportError> {
        self.ensure_open()?;
        self.handle.shell.exec(command).await
    }

    async fn tunnel(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError> {
        self.ensure_open()?;
        let handle = self.handle.tunnels.acquire(spec.clone()).await?;
        Ok(Box::new(SharedTunnel { handle }))
    }

    async fn file_access(&self) -> Result<Box<dyn FileAccess>, TransportError> {
        self.ensure_open()?;
        let handle = self.handle.files.acquire(self.id).await?;
        Ok(Box::new(SharedFiles { handle }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle.release().await;
        Ok(())
    }
}

/// A checked-out tunnel; closing releases it
struct SharedTunnel {
    handle: Reusable<Tunneling, Box<dyn Tunnel>, TransportError>,
}

#[async_trait]
impl Tunnel for SharedTunnel {
    fn host(&self) -> &str {
        self.handle.host()
    }

    fn port(&self) -> u16 {
        self.handle.port()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle.release().await;
        Ok(())
    }
}

/// A checked-out file-access session; closing releases it
struct SharedFiles {
    handle: Reusable<Uuid, Box<dyn FileAccess>, TransportError>,
}

#[async_trait]
impl FileAccess for SharedFiles {
    async fn read(&self, path: &str) -> Result<Bytes, TransportError> {
        self.handle.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError> {
        self.handle.write(path, data).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle.release().await;
        Ok(())
    }
}
