//! Remote shell capability and the resources it hands out

use async_trait::async_trait;
use bytes::Bytes;
use crate::{Login, TransportError};
use std::fmt;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Boxed stream of command output
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// An open remote-execution capability bound to one [`Login`]
#[async_trait]
pub trait Shell: Send + Sync {
    /// Login this shell is connected as
    fn login(&self) -> &Login;

    /// Start a command
    async fn exec(&self, command: &str) -> Result<Box<dyn Exec>, TransportError>;

    /// Open a local forward described by `spec`
    async fn tunnel(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError>;

    /// Open a file-access session
    async fn file_access(&self) -> Result<Box<dyn FileAccess>, TransportError>;

    /// Release the transport; calling it again is a no-op
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates shells for logins
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish (or prepare) a shell for `login`
    async fn connect(&self, login: &Login) -> Result<Arc<dyn Shell>, TransportError>;
}

/// Collected result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code reported by the remote side
    pub exit_code: i32,
    /// Standard output (empty if the stream was taken)
    pub stdout: Bytes,
    /// Standard error
    pub stderr: Bytes,
}

impl ExecOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`TransportError::CommandFailed`]
    pub fn check(self) -> Result<Self, TransportError> {
        if self.success() {
            Ok(self)
        } else {
            Err(TransportError::CommandFailed {
                code: self.exit_code,
                message: String::from_utf8_lossy(&self.stderr).trim().to_string(),
            })
        }
    }
}

/// A running remote command
#[async_trait]
pub trait Exec: Send {
    /// Take the standard output stream.
    ///
    /// Dropping the stream does not end the command; only [`Exec::close`] does.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Wait for the command to finish
    async fn wait(&mut self) -> Result<ExecOutput, TransportError>;

    /// Terminate the command and release its channel
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// A live local forward
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Host the forward can be reached on
    fn host(&self) -> &str;

    /// Port the forward can be reached on
    fn port(&self) -> u16;

    /// Release the forward; the shell that created it stays open
    async fn close(&self) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tunnel({}:{})", self.host(), self.port())
    }
}

/// A file-access session on a remote host
#[async_trait]
pub trait FileAccess: Send + Sync {
    /// Read a whole remote file
    async fn read(&self, path: &str) -> Result<Bytes, TransportError>;

    /// Replace a remote file with `data`
    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError>;

    /// End the session
    async fn close(&self) -> Result<(), TransportError>;
}

/// Description of a local forward
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tunneling {
    /// Local port to listen on, 0 for an ephemeral port
    pub local_port: u16,
    /// Destination host as seen from the remote end
    pub host: String,
    /// Destination port
    pub port: u16,
}

impl Tunneling {
    /// Forward to `host:port` from an ephemeral local port
    pub fn ephemeral(host: impl Into<String>, port: u16) -> Self {
        Self {
            local_port: 0,
            host: host.into(),
            port,
        }
    }

    /// Forward to `host:port` from a fixed local port
    pub fn fixed(local_port: u16, host: impl Into<String>, port: u16) -> Self {
        Self {
            local_port,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Tunneling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.host, self.port)
    }
}

/// Tunnel for a destination that is reachable without forwarding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectTunnel {
    host: String,
    port: u16,
}

impl DirectTunnel {
    /// A no-op tunnel pointing straight at `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

#[async_trait]
impl Tunnel for DirectTunnel {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
