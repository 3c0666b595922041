//! Recording transport and scripted reachability for scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hopshell::ssh::{
    Connector, Exec, ExecOutput, FileAccess, Login, OutputStream, Prompt, PromptRequest, Shell, TransportError, Tunnel,
    Tunneling,
};
use hopshell::Reachability;
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, ordered record of transport activity
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|entry| entry.starts_with(prefix)).count()
    }
}

/// Connector whose shells record connects, forwards and closes
pub struct RecordingConnector {
    journal: Journal,
    next_port: Arc<AtomicU16>,
    refused: Arc<HashSet<String>>,
    delay: Duration,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            journal: Journal::default(),
            next_port: Arc::new(AtomicU16::new(40000)),
            refused: Arc::new(HashSet::new()),
            delay: Duration::ZERO,
        }
    }

    /// Refuse forwards to these hosts
    pub fn refusing(mut self, hosts: &[&str]) -> Self {
        self.refused = Arc::new(hosts.iter().map(|host| host.to_string()).collect());
        self
    }

    /// Sleep before each connect
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(&self, login: &Login) -> Result<Arc<dyn Shell>, TransportError> {
        tokio::time::sleep(self.delay).await;
        self.journal.push(format!("connect {}", login));
        Ok(Arc::new(RecordingShell {
            login: login.clone(),
            journal: self.journal.clone(),
            next_port: Arc::clone(&self.next_port),
            refused: Arc::clone(&self.refused),
        }))
    }
}

struct RecordingShell {
    login: Login,
    journal: Journal,
    next_port: Arc<AtomicU16>,
    refused: Arc<HashSet<String>>,
}

#[async_trait]
impl Shell for RecordingShell {
    fn login(&self) -> &Login {
        &self.login
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn Exec>, TransportError> {
        self.journal.push(format!("exec {} {}", self.login, command));
        Ok(Box::new(RecordingExec {
            output: Some(format!("{}\n", command).into_bytes()),
        }))
    }

    async fn tunnel(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError> {
        if self.refused.contains(&spec.host) {
            return Err(TransportError::Connection(format!("connect to {} refused", spec.host)));
        }
        let port = match spec.local_port {
            0 => self.next_port.fetch_add(1, Ordering::SeqCst),
            port => port,
        };
        self.journal
            .push(format!("tunnel {} -> {}:{} @{}", self.login, spec.host, spec.port, port));
        Ok(Box::new(RecordingTunnel {
            label: format!("{}:{}", spec.host, spec.port),
            port,
            journal: self.journal.clone(),
        }))
    }

    async fn file_access(&self) -> Result<Box<dyn FileAccess>, TransportError> {
        Err(TransportError::Protocol("file access not recorded".to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.journal.push(format!("close {}", self.login));
        Ok(())
    }
}

struct RecordingExec {
    output: Option<Vec<u8>>,
}

#[async_trait]
impl Exec for RecordingExec {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.output.take().map(|data| Box::new(Cursor::new(data)) as OutputStream)
    }

    async fn wait(&mut self) -> Result<ExecOutput, TransportError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: Bytes::from(self.output.take().unwrap_or_default()),
            stderr: Bytes::new(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct RecordingTunnel {
    label: String,
    port: u16,
    journal: Journal,
}

#[async_trait]
impl Tunnel for RecordingTunnel {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.journal.push(format!("untunnel {} @{}", self.label, self.port));
        Ok(())
    }
}

/// Reachability answered from a fixed list of hosts
pub struct Scripted {
    reachable: HashSet<String>,
    probes: AtomicUsize,
}

impl Scripted {
    pub fn reaching(hosts: &[&str]) -> Self {
        Self {
            reachable: hosts.iter().map(|host| host.to_string()).collect(),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reachability for Scripted {
    async fn reachable(&self, host: &str, _port: u16, _timeout: Duration) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable.contains(host)
    }
}

/// Prompt that answers every request and counts them
#[derive(Default)]
pub struct CountingPrompt {
    requests: Mutex<Vec<String>>,
}

impl CountingPrompt {
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prompt for CountingPrompt {
    async fn password(&self, request: &PromptRequest) -> Result<Option<String>, TransportError> {
        self.requests.lock().unwrap().push(request.login.clone());
        Ok(Some("secret".to_string()))
    }
}
