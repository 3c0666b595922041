//! Skip tunneling when the destination answers directly

use super::TunnelResolver;
use crate::Result;
use async_trait::async_trait;
use hopshell_ssh::{DirectTunnel, Target, Tunnel};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Decides whether `host:port` can be reached without a tunnel
#[async_trait]
pub trait Reachability: Send + Sync {
    /// True if a connection to `host:port` succeeds within `timeout`
    async fn reachable(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// Plain TCP connect probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl Reachability for TcpProbe {
    async fn reachable(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {}:{} failed: {}", host, port, e);
                false
            }
            Err(_) => {
                debug!("Probe of {}:{} timed out after {:?}", host, port, timeout);
                false
            }
        }
    }
}

/// Returns a [`DirectTunnel`] when the destination is reachable, and asks the
/// wrapped resolver otherwise.
///
/// Only requests without a `through` hop, or whose `through` hop is the
/// destination itself, are probed.
pub struct DirectConnect {
    inner: Arc<dyn TunnelResolver>,
    probe: Arc<dyn Reachability>,
    timeout: Duration,
}

impl DirectConnect {
    /// Probe with `probe`, giving up after `timeout`
    pub fn new(inner: Arc<dyn TunnelResolver>, probe: Arc<dyn Reachability>, timeout: Duration) -> Self {
        Self { inner, probe, timeout }
    }
}

fn bare_host(spec: &str) -> Option<String> {
    Target::parse(spec).ok().map(|target| target.host)
}

#[async_trait]
impl TunnelResolver for DirectConnect {
    async fn tunnel(&self, host: &str, port: u16, through: Option<&str>) -> Result<Arc<dyn Tunnel>> {
        if let Some(destination) = bare_host(host) {
            let eligible = match through {
                None => true,
                Some(through) => bare_host(through).as_deref() == Some(destination.as_str()),
            };
            if eligible && self.probe.reachable(&destination, port, self.timeout).await {
                debug!("{}:{} is directly reachable", destination, port);
                return Ok(Arc::new(DirectTunnel::new(destination, port)));
            }
        }
        self.inner.tunnel(host, port, through).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
