//! Tunnel resolution.
//!
//! A [`TunnelResolver`] turns `(host, port, through)` into a live [`Tunnel`].
//! Resolvers stack as decorators: [`DirectConnect`] probes for a plain route,
//! [`Memoized`] collapses identical requests, and [`ChainResolver`] builds the
//! actual multi-hop forward. [`Tunnels`] assembles the stack from a
//! [`HostConfig`].

mod chain;
mod direct;
mod memo;

pub use chain::ChainResolver;
pub use direct::{DirectConnect, Reachability, TcpProbe};
pub use memo::{Memoized, TunnelKey};

use crate::config::{HostConfig, HostDirectory};
use crate::shore::Shore;
use crate::Result;
use async_trait::async_trait;
use hopshell_ssh::Tunnel;
use std::sync::Arc;

/// Resolves a destination into a local forward
#[async_trait]
pub trait TunnelResolver: Send + Sync {
    /// Open (or reuse) a tunnel to `host:port`, optionally routed through `through`.
    ///
    /// The returned tunnel stays owned by the resolver and is reclaimed by
    /// [`TunnelResolver::close`].
    async fn tunnel(&self, host: &str, port: u16, through: Option<&str>) -> Result<Arc<dyn Tunnel>>;

    /// Close everything this resolver opened
    async fn close(&self);
}

/// The configured resolver stack
pub struct Tunnels {
    resolver: Arc<dyn TunnelResolver>,
}

impl Tunnels {
    /// Build the stack described by `config`
    pub fn from_config(config: HostConfig, shore: Shore) -> Result<Self> {
        let directory = Arc::new(HostDirectory::new(config)?);
        Ok(Self::from_directory(directory, shore))
    }

    /// Build the stack over an existing directory, probing with [`TcpProbe`]
    pub fn from_directory(directory: Arc<HostDirectory>, shore: Shore) -> Self {
        Self::with_probe(directory, shore, Arc::new(TcpProbe))
    }

    /// Build the stack over an existing directory with a custom probe
    pub fn with_probe(directory: Arc<HostDirectory>, shore: Shore, probe: Arc<dyn Reachability>) -> Self {
        let config = directory.config().clone();

        let mut resolver: Arc<dyn TunnelResolver> =
            Arc::new(ChainResolver::new(directory.clone(), directory, shore));
        if config.memoize_tunnels {
            resolver = Arc::new(Memoized::new(resolver));
        }
        if config.probe.enabled {
            resolver = Arc::new(DirectConnect::new(resolver, probe, config.probe.timeout()));
        }

        Self { resolver }
    }
}

#[async_trait]
impl TunnelResolver for Tunnels {
    async fn tunnel(&self, host: &str, port: u16, through: Option<&str>) -> Result<Arc<dyn Tunnel>> {
        self.resolver.tunnel(host, port, through).await
    }

    async fn close(&self) {
        self.resolver.close().await
    }
}
