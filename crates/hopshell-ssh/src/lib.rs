//! # hopshell SSH transport
//!
//! Logins, the remote shell capability traits and an OpenSSH-backed
//! implementation of them.

#![warn(missing_docs)]

/// Login targets and deferred credentials
pub mod login;

/// Shell, tunnel, command and file-access contracts
pub mod shell;

/// OpenSSH ControlMaster transport
#[cfg(feature = "openssh")]
pub mod openssh;

/// Transport-specific error types
pub mod error;

pub use login::{Credentials, Login, Prompt, PromptRequest, Target, DEFAULT_SSH_PORT};
pub use shell::{Connector, DirectTunnel, Exec, ExecOutput, FileAccess, OutputStream, Shell, Tunnel, Tunneling};
#[cfg(feature = "openssh")]
pub use openssh::{OpenSshConfig, OpenSshConnector, OpenSshShell};
pub use error::TransportError;
