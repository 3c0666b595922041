//! # hopshell
//!
//! Pooled remote shells and multi-hop tunnels over shared SSH connections.
//!
//! Shells for the same login are shared through a [`Shore`]; each shared shell
//! can be a [`PooledShell`] that spreads sessions over as many underlying
//! connections as the per-connection session limit requires. [`Tunnels`]
//! resolves `(host, port, through)` into a local forward, probing for a direct
//! route first and otherwise chaining forwards through the configured hops.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use hopshell_ssh as ssh;

/// Error types for the hopshell core
pub mod error;

/// Reference-counted sharing of lazily created values
pub mod reusable;

/// Session admission over pooled connections
pub mod pool;

/// Login-keyed shell sharing
pub mod shore;

/// Tunnel resolvers
pub mod tunnel;

/// Host rules and resolver configuration
pub mod config;

#[cfg(test)]
mod testing;

pub use config::{HostConfig, HostDirectory, HostRule, LoginResolver, ProbeConfig, RouteTable};
pub use error::ShoreError;
pub use pool::{PoolConfig, PoolStats, PooledConnector, PooledShell, SessionToken};
pub use reusable::{Recycle, Registry, Reusable};
pub use shore::{SharedShell, Shore};
pub use tunnel::{ChainResolver, DirectConnect, Memoized, Reachability, TcpProbe, TunnelKey, TunnelResolver, Tunnels};

/// Result type alias for hopshell operations
pub type Result<T> = std::result::Result<T, ShoreError>;
