//! Shell implementation driving the system `ssh` binary.
//!
//! Each [`OpenSshShell`] owns one ControlMaster process. Commands, forwards
//! and file transfers run as multiplexed clients of that master, which is why
//! a single shell only tolerates as many concurrent users as the server's
//! `MaxSessions` allows.
//!
//! Authentication is non-interactive (`BatchMode=yes`): keys and agents work,
//! passwords supplied through [`crate::Credentials`] are not forwarded.

use async_trait::async_trait;
use bytes::Bytes;
use crate::{Connector, Exec, ExecOutput, FileAccess, Login, OutputStream, Shell, Tunnel, Tunneling, TransportError};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Settings shared by every OpenSSH shell a connector creates
#[derive(Debug, Clone)]
pub struct OpenSshConfig {
    /// `ssh` executable
    pub program: PathBuf,
    /// Directory holding control sockets
    pub control_dir: PathBuf,
    /// How long to wait for the master connection
    pub connect_timeout: Duration,
    /// Extra `-o key=value` options
    pub options: HashMap<String, String>,
}

impl Default for OpenSshConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            control_dir: std::env::temp_dir(),
            connect_timeout: Duration::from_secs(30),
            options: HashMap::new(),
        }
    }
}

/// [`Connector`] producing [`OpenSshShell`]s
#[derive(Debug, Clone, Default)]
pub struct OpenSshConnector {
    config: OpenSshConfig,
}

impl OpenSshConnector {
    /// Create a connector with the given settings
    pub fn new(config: OpenSshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for OpenSshConnector {
    async fn connect(&self, login: &Login) -> Result<Arc<dyn Shell>, TransportError> {
        let shell = OpenSshShell::connect(login.clone(), self.config.clone()).await?;
        Ok(Arc::new(shell))
    }
}

/// Invocation details for clients of one control socket
#[derive(Debug)]
struct Control {
    program: PathBuf,
    socket: PathBuf,
    args: Vec<String>,
    target: String,
}

impl Control {
    fn new(login: &Login, config: &OpenSshConfig) -> Self {
        let socket = config
            .control_dir
            .join(format!("hopshell-{}.sock", Uuid::new_v4().simple()));

        Self {
            program: config.program.clone(),
            args: build_ssh_args(login, config, &socket),
            socket,
            target: format!("{}@{}", login.user(), login.host()),
        }
    }

    /// `ssh <args> <extra> <target>`, ready for a remote command to be appended
    fn command(&self, extra: &[&str]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra)
            .arg(&self.target)
            .kill_on_drop(true);
        command
    }

    /// Run a control operation (`check`, `forward`, `cancel`, `exit`) against the master
    async fn run(&self, op: &str, extra: &[&str]) -> Result<(), TransportError> {
        let mut args = vec!["-O", op];
        args.extend_from_slice(extra);

        let output = self
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TransportError::Protocol(format!(
                "ssh -O {} failed: {}",
                op,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Build the connection arguments shared by the master and its clients
fn build_ssh_args(login: &Login, config: &OpenSshConfig, socket: &std::path::Path) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(), "BatchMode=yes".to_string(),
        "-o".to_string(), "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(), format!("ConnectTimeout={}", config.connect_timeout.as_secs().max(1)),
        "-p".to_string(), login.port_or_default().to_string(),
        "-S".to_string(), socket.to_string_lossy().to_string(),
    ];

    if let Some(key_path) = login.key_path() {
        args.push("-i".to_string());
        args.push(key_path.to_string_lossy().to_string());
    }

    if let Some(alias) = login.alias() {
        args.push("-o".to_string());
        args.push(format!("HostKeyAlias={}", alias));
    }

    for (key, value) in &config.options {
        args.push("-o".to_string());
        args.push(format!("{}={}", key, value));
    }

    args
}

/// Quote a string for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Format a forward destination, bracketing IPv6 literals
fn forward_spec(local_port: u16, host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("127.0.0.1:{}:[{}]:{}", local_port, host, port)
    } else {
        format!("127.0.0.1:{}:{}:{}", local_port, host, port)
    }
}

async fn read_all<R: AsyncRead + Unpin>(stream: Option<R>) -> io::Result<Bytes> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(Bytes::from(buf))
}

/// A ControlMaster-backed shell
pub struct OpenSshShell {
    login: Login,
    control: Arc<Control>,
    master: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl OpenSshShell {
    /// Start the master connection and wait until it accepts clients
    pub async fn connect(login: Login, config: OpenSshConfig) -> Result<Self, TransportError> {
        let control = Arc::new(Control::new(&login, &config));
        info!("Connecting to {}", login);

        let mut master = control
            .command(&["-M", "-N", "-o", "ControlPersist=no"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Connection(format!("Failed to start SSH: {}", e)))?;

        let ready = timeout(config.connect_timeout, async {
            loop {
                if let Some(status) = master.try_wait()? {
                    let mut message = String::new();
                    if let Some(mut stderr) = master.stderr.take() {
                        let _ = stderr.read_to_string(&mut message).await;
                    }
                    return Err(TransportError::Connection(format!(
                        "ssh master exited with {}: {}",
                        status,
                        message.trim()
                    )));
                }

                if control.run("check", &[]).await.is_ok() {
                    return Ok::<(), TransportError>(());
                }
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                if let Err(e) = master.kill().await {
                    warn!("Failed to kill SSH master for {}: {}", login, e);
                }
                return Err(TransportError::Timeout);
            }
        }

        info!("Successfully connected to {}", login);
        Ok(Self {
            login,
            control,
            master: Mutex::new(Some(master)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.login.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Shell for OpenSshShell {
    fn login(&self) -> &Login {
        &self.login
    }

    async fn exec(&self, command: &str) -> Result<Box<dyn Exec>, TransportError> {
        self.ensure_open()?;
        debug!("Executing on {}: {}", self.login, command);

        let child = self
            .control
            .command(&[])
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok(Box::new(OpenSshExec { child }))
    }

    async fn tunnel(&self, spec: &Tunneling) -> Result<Box<dyn Tunnel>, TransportError> {
        self.ensure_open()?;

        let local_port = match spec.local_port {
            0 => TcpListener::bind("127.0.0.1:0").await?.local_addr()?.port(),
            port => port,
        };
        let forward = forward_spec(local_port, &spec.host, spec.port);
        self.control.run("forward", &["-L", &forward]).await?;

        info!("Forwarding 127.0.0.1:{} to {}:{} via {}", local_port, spec.host, spec.port, self.login);
        Ok(Box::new(OpenSshTunnel {
            control: Arc::clone(&self.control),
            forward,
            port: local_port,
            closed: AtomicBool::new(false),
        }))
    }

    async fn file_access(&self) -> Result<Box<dyn FileAccess>, TransportError> {
        self.ensure_open()?;
        Ok(Box::new(OpenSshFiles {
            control: Arc::clone(&self.control),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing SSH connection to {}", self.login);

        if let Err(e) = self.control.run("exit", &[]).await {
            debug!("Control exit for {} failed: {}", self.login, e);
        }

        if let Some(mut child) = self.master.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill SSH process: {}", e);
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.control.socket).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove control socket {:?}: {}", self.control.socket, e);
            }
        }
        Ok(())
    }
}

/// A command running as a client of the master
struct OpenSshExec {
    child: Child,
}

#[async_trait]
impl Exec for OpenSshExec {
    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as OutputStream)
    }

    async fn wait(&mut self) -> Result<ExecOutput, TransportError> {
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        let status = self.child.wait().await?;

        Ok(ExecOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// A `-L` forward registered with the master
struct OpenSshTunnel {
    control: Arc<Control>,
    forward: String,
    port: u16,
    closed: AtomicBool,
}

#[async_trait]
impl Tunnel for OpenSshTunnel {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Cancelling forward {}", self.forward);
        self.control.run("cancel", &["-L", &self.forward]).await
    }
}

/// File access implemented with `cat` over the master
struct OpenSshFiles {
    control: Arc<Control>,
    closed: AtomicBool,
}

impl OpenSshFiles {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("file access".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl FileAccess for OpenSshFiles {
    async fn read(&self, path: &str) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let output = self
            .control
            .command(&[])
            .arg(format!("cat -- {}", shell_quote(path)))
            .stdin(Stdio::null())
            .output()
            .await?;

        let output = ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
        }
        .check()?;
        Ok(output.stdout)
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut child = self
            .control
            .command(&[])
            .arg(format!("cat > {}", shell_quote(path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&data).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: Bytes::new(),
            stderr: Bytes::from(output.stderr),
        }
        .check()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
