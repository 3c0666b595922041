//! In-memory shells for unit tests

use async_trait::async_trait;
use bytes::Bytes;
use hopshell_ssh::{Connector, Exec, ExecOutput, FileAccess, Login, OutputStream, Shell, Tunnel, Tunneling, TransportError};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Host that [`MockShell::tunnel`] refuses to forward to
pub const UNREACHABLE: &str = "unreachable";

type Log = Arc<Mutex<Vec<String>>>;

pub struct MockConnector {
    connects: AtomicUsize,
    fail_connects: AtomicUsize,
    delay: Option<Duration>,
    shells: Mutex<Vec<Arc<MockShell>>>,
    next_port: Arc<AtomicU16>,
    log: Log,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            delay: None,
            shells: Mutex::new(Vec::new()),
            next_port: Arc::new(AtomicU16::new(40000)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shells(&self) -> Vec<Arc<MockShell>> {
        self.shells.lock().unwrap().clone()
    }

    /// Every connect and forward, in order
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, login: &Login) -> Result<Arc<dyn Shell>, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(TransportError::Connection("Mock connection failed".to_string()));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("connect {}", login));

        let shell = Arc::new(MockShell {
            login: login.clone(),
            next_port: Arc::clone(&self.next_port),
            log: Arc::clone(&self.log),
            files: Arc::new(Mutex::new(HashMap::new())),
            close_calls: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
            tunnels: Mutex::new(Vec::new()),
        });
        self.shells.lock().unwrap().push(Arc::clone(&shell));
        Ok(shell)
    }
}

pub struct MockShell {
    login: Login,
    next_port: Arc<AtomicU16>,
    log: Log,
    files: Arc<Mutex<HashMap<String, Bytes>>>,
    close_calls: AtomicUsize,
    fail_close: AtomicBool,
    tunnels: Mutex<Vec<Arc<AtomicUsize>>>,
}

impl MockShell {
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Close counts of every tunnel opened on this shell
    pub fn tunnel_closes(&self) -> Vec<usize> {
        self.tunnels
            .lock()
            .unwrap()
            .iter()
            .map(|closes| closes.load(Ordering::SeqCst))
            .collect()
    }
}

#[async_trait]
impl Shell for MockShell {
    fn login(&self) -> &Login {
        &self.login
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn Exec>, TransportError> {
        Ok(Box::new(MockExec {
            stdout: Some(format!("ran: {}", command).into_bytes()),
        }))
    }

    async fn tunnel(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError> {
        if spec.host == UNREACHABLE {
            return Err(TransportError::Connection(format!("cannot reach {}", spec.host)));
        }

        let port = match spec.local_port {
            0 => self.next_port.fetch_add(1, Ordering::SeqCst),
            port => port,
        };
        self.log.lock().unwrap().push(format!(
            "tunnel {} -> {}:{} @{}",
            self.login, spec.host, spec.port, port
        ));

        let closes = Arc::new(AtomicUsize::new(0));
        self.tunnels.lock().unwrap().push(Arc::clone(&closes));
        Ok(Box::new(MockTunnel { port, closes }))
    }

    async fn file_access(&self) -> Result<Box<dyn FileAccess>, TransportError> {
        Ok(Box::new(MockFiles {
            files: Arc::clone(&self.files),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Connection("Mock close failed".to_string()));
        }
        Ok(())
    }
}

struct MockExec {
    stdout: Option<Vec<u8>>,
}

#[async_trait]
impl Exec for MockExec {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout
            .take()
            .map(|data| Box::new(Cursor::new(data)) as OutputStream)
    }

    async fn wait(&mut self) -> Result<ExecOutput, TransportError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: Bytes::from(self.stdout.take().unwrap_or_default()),
            stderr: Bytes::new(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MockTunnel {
    port: u16,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Tunnel for MockTunnel {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockFiles {
    files: Arc<Mutex<HashMap<String, Bytes>>>,
}

#[async_trait]
impl FileAccess for MockFiles {
    async fn read(&self, path: &str) -> Result<Bytes, TransportError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| TransportError::CommandFailed { code: 1, message: format!("{}: not found", path) })
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError> {
        self.files.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
