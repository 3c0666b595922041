//! Login targets and lazily prompted credentials

use async_trait::async_trait;
use crate::TransportError;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Port used when a login leaves it unset
pub const DEFAULT_SSH_PORT: u16 = 22;

/// What a [`Prompt`] is being asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    /// Display form of the login the credential is for
    pub login: String,
    /// Set when the previously supplied credential was rejected
    pub retry: bool,
}

/// Source of interactively supplied credentials
#[async_trait]
pub trait Prompt: Send + Sync {
    /// Ask for a password; `None` means the user declined
    async fn password(&self, request: &PromptRequest) -> Result<Option<String>, TransportError>;
}

#[derive(Default)]
struct Cached {
    value: Option<Option<String>>,
    rejected: bool,
}

struct CredentialState {
    prompt: Option<Arc<dyn Prompt>>,
    password: Mutex<Cached>,
}

/// Deferred credential material for a login.
///
/// Nothing is fetched until [`Credentials::password`] is first awaited. The
/// answer is cached and shared by every clone of the login, including
/// retargeted copies used while tunneling. Prompting is serialized so two hops
/// resolving at once never interleave their questions.
#[derive(Clone)]
pub struct Credentials {
    state: Arc<CredentialState>,
}

impl Credentials {
    /// Credentials that never prompt
    pub fn none() -> Self {
        Self::build(None, None)
    }

    /// Credentials resolved on demand through `prompt`
    pub fn with_prompt(prompt: Arc<dyn Prompt>) -> Self {
        Self::build(Some(prompt), None)
    }

    /// Credentials with a password known up front
    pub fn with_password(password: impl Into<String>) -> Self {
        Self::build(None, Some(Some(password.into())))
    }

    fn build(prompt: Option<Arc<dyn Prompt>>, value: Option<Option<String>>) -> Self {
        Self {
            state: Arc::new(CredentialState {
                prompt,
                password: Mutex::new(Cached { value, rejected: false }),
            }),
        }
    }

    /// Whether a prompt is configured
    pub fn can_prompt(&self) -> bool {
        self.state.prompt.is_some()
    }

    /// Resolve the password for `login`, prompting at most once until rejected
    pub async fn password(&self, login: &Login) -> Result<Option<String>, TransportError> {
        let mut cached = self.state.password.lock().await;
        if let Some(value) = &cached.value {
            return Ok(value.clone());
        }

        let Some(prompt) = &self.state.prompt else {
            return Ok(None);
        };

        let request = PromptRequest {
            login: login.to_string(),
            retry: cached.rejected,
        };
        debug!("Prompting for password of {} (retry: {})", request.login, request.retry);

        let value = prompt.password(&request).await?;
        cached.value = Some(value.clone());
        cached.rejected = false;
        Ok(value)
    }

    /// Forget the cached password; the next lookup prompts again with `retry` set
    pub async fn reject(&self) {
        let mut cached = self.state.password.lock().await;
        cached.value = None;
        cached.rejected = true;
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("prompt", &self.can_prompt())
            .finish_non_exhaustive()
    }
}

/// Components of a `[user@]host[:port]` specifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Explicit user, if present
    pub user: Option<String>,
    /// Host name or address
    pub host: String,
    /// Explicit port, if present
    pub port: Option<u16>,
}

impl Target {
    /// Parse a login specifier.
    ///
    /// IPv6 literals must be bracketed when a port is given (`[::1]:2222`).
    pub fn parse(spec: &str) -> Result<Self, TransportError> {
        let spec = spec.trim();
        let (user, rest) = match spec.rfind('@') {
            Some(at) => (Some(&spec[..at]), &spec[at + 1..]),
            None => (None, spec),
        };

        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| TransportError::InvalidLogin(spec.to_string()))?;
            let host = &stripped[..close];
            let port = match &stripped[close + 1..] {
                "" => None,
                tail => Some(parse_port(spec, tail.strip_prefix(':').unwrap_or(tail))?),
            };
            (host, port)
        } else {
            match rest.rfind(':') {
                Some(colon) if rest[..colon].contains(':') => (rest, None),
                Some(colon) => (&rest[..colon], Some(parse_port(spec, &rest[colon + 1..])?)),
                None => (rest, None),
            }
        };

        if host.is_empty() || user.is_some_and(str::is_empty) {
            return Err(TransportError::InvalidLogin(spec.to_string()));
        }

        Ok(Self {
            user: user.map(str::to_string),
            host: host.to_string(),
            port,
        })
    }
}

fn parse_port(spec: &str, port: &str) -> Result<u16, TransportError> {
    port.parse::<u16>()
        .map_err(|_| TransportError::InvalidLogin(spec.to_string()))
}

/// A resolved remote login.
///
/// Equality and hashing cover user, host, port, key path and alias. The
/// credential providers are deliberately left out so that two resolutions of
/// the same target share pooled connections.
#[derive(Clone)]
pub struct Login {
    user: String,
    host: String,
    port: Option<u16>,
    key_path: Option<PathBuf>,
    alias: Option<String>,
    credentials: Credentials,
}

impl Login {
    /// Create a login; both `user` and `host` must be non-empty
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Result<Self, TransportError> {
        let user = user.into();
        let host = host.into();
        if user.is_empty() || host.is_empty() {
            return Err(TransportError::InvalidLogin(format!("{}@{}", user, host)));
        }

        Ok(Self {
            user,
            host,
            port: None,
            key_path: None,
            alias: None,
            credentials: Credentials::none(),
        })
    }

    /// Parse `[user@]host[:port]`, using `default_user` when none is given
    pub fn parse(spec: &str, default_user: &str) -> Result<Self, TransportError> {
        let target = Target::parse(spec)?;
        let user = target.user.unwrap_or_else(|| default_user.to_string());
        Ok(Self::new(user, target.host)?.with_port(target.port))
    }

    /// Set or clear the port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    /// Set the private key used to authenticate
    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Attach credential providers
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Point this login at `host:port` while keeping its identity.
    ///
    /// Used when a hop is reached through a local forward; the original host
    /// is kept as the alias so host keys still verify against it.
    pub fn retarget(&self, host: impl Into<String>, port: u16) -> Self {
        let mut login = self.clone();
        login.alias = Some(self.alias.clone().unwrap_or_else(|| self.host.clone()));
        login.host = host.into();
        login.port = Some(port);
        login
    }

    /// Remote user
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Host to connect to
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port to connect to, falling back to [`DEFAULT_SSH_PORT`]
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Private key path
    pub fn key_path(&self) -> Option<&Path> {
        self.key_path.as_deref()
    }

    /// Original host name when this login was retargeted
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Deferred credentials
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn identity(&self) -> (&str, &str, Option<u16>, Option<&Path>, Option<&str>) {
        (&self.user, &self.host, self.port, self.key_path.as_deref(), self.alias.as_deref())
    }
}

impl PartialEq for Login {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Login {}

impl Hash for Login {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(alias) = &self.alias {
            write!(f, " ({})", alias)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("key_path", &self.key_path)
            .field("alias", &self.alias)
            .finish()
    }
}
