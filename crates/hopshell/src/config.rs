//! Host configuration: login overrides and routing rules matched by host pattern

use crate::pool::{PoolConfig, DEFAULT_MAX_SESSIONS};
use crate::{Result, ShoreError};
use glob::Pattern;
use hopshell_ssh::{Credentials, Login, Prompt, Target};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Turns free-form `[user@]host[:port]` specifiers into logins
pub trait LoginResolver: Send + Sync {
    /// Resolve `spec`, applying configured overrides
    fn resolve(&self, spec: &str) -> Result<Login>;
}

/// Looks up the hops required to reach a host
pub trait RouteTable: Send + Sync {
    /// Semicolon-separated hop specifiers for `host`, if a rule applies
    fn route(&self, host: &str) -> Option<String>;
}

/// Direct-connect probe settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Try a plain TCP connection before tunneling
    pub enabled: bool,
    /// Probe timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: 2000,
        }
    }
}

impl ProbeConfig {
    /// Probe timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Overrides for hosts matching `pattern`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    /// Glob matched against the bare host name
    pub pattern: String,
    /// User to log in as
    #[serde(default)]
    pub user: Option<String>,
    /// SSH port
    #[serde(default)]
    pub port: Option<u16>,
    /// Private key; a leading `~/` expands to `$HOME`
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Hops to tunnel through, e.g. `"jump1;ops@jump2:2222"`
    #[serde(default)]
    pub via: Option<String>,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// User for specifiers and rules that name none
    pub default_user: Option<String>,
    /// Concurrent sessions per underlying connection
    pub max_sessions_per_connection: usize,
    /// Direct-connect probe
    pub probe: ProbeConfig,
    /// Collapse identical tunnel requests
    pub memoize_tunnels: bool,
    /// Rules, consulted in order
    pub hosts: Vec<HostRule>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            default_user: None,
            max_sessions_per_connection: DEFAULT_MAX_SESSIONS,
            probe: ProbeConfig::default(),
            memoize_tunnels: true,
            hosts: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading host configuration from {:?}", path);
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&text)
    }

    /// Check limits and host patterns
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions_per_connection == 0 {
            return Err(ShoreError::Config(
                "max_sessions_per_connection must be at least 1".to_string(),
            ));
        }
        for rule in &self.hosts {
            compile(&rule.pattern)?;
        }
        Ok(())
    }

    /// Slot pool settings derived from this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sessions_per_connection: self.max_sessions_per_connection,
        }
    }

    /// Effective default user: configured, then `$USER`, then `root`
    pub fn default_user(&self) -> String {
        self.default_user
            .clone()
            .or_else(|| std::env::var("USER").ok().filter(|user| !user.is_empty()))
            .unwrap_or_else(|| "root".to_string())
    }
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|e| ShoreError::Config(format!("invalid host pattern '{}': {}", pattern, e)))
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Compiled [`HostConfig`] implementing [`LoginResolver`] and [`RouteTable`].
///
/// Resolutions of the same user/host/port share one [`Credentials`] instance,
/// so a password is prompted for once however many hops reference it.
pub struct HostDirectory {
    config: HostConfig,
    rules: Vec<(Pattern, HostRule)>,
    prompt: Option<Arc<dyn Prompt>>,
    credentials: Mutex<HashMap<String, Credentials>>,
}

impl HostDirectory {
    /// Compile `config`
    pub fn new(config: HostConfig) -> Result<Self> {
        config.validate()?;
        let rules = config
            .hosts
            .iter()
            .map(|rule| Ok((compile(&rule.pattern)?, rule.clone())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            rules,
            prompt: None,
            credentials: Mutex::new(HashMap::new()),
        })
    }

    /// Prompt for passwords through `prompt`
    pub fn with_prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// The configuration this directory was built from
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    fn matching<'a>(&'a self, host: &'a str) -> impl Iterator<Item = &'a HostRule> + 'a {
        self.rules
            .iter()
            .filter(move |(pattern, _)| pattern.matches(host))
            .map(|(_, rule)| rule)
    }

    fn credentials_for(&self, login: &Login) -> Credentials {
        let Some(prompt) = &self.prompt else {
            return Credentials::none();
        };
        let mut cache = self.credentials.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(login.to_string())
            .or_insert_with(|| Credentials::with_prompt(Arc::clone(prompt)))
            .clone()
    }
}

impl LoginResolver for HostDirectory {
    fn resolve(&self, spec: &str) -> Result<Login> {
        let target = Target::parse(spec)?;

        let user = target
            .user
            .or_else(|| self.matching(&target.host).find_map(|rule| rule.user.clone()))
            .unwrap_or_else(|| self.config.default_user());
        let port = target
            .port
            .or_else(|| self.matching(&target.host).find_map(|rule| rule.port));
        let key_path = self
            .matching(&target.host)
            .find_map(|rule| rule.key_path.as_deref().map(expand_home));

        let mut login = Login::new(user, target.host)?.with_port(port);
        if let Some(key_path) = key_path {
            login = login.with_key_path(key_path);
        }
        let credentials = self.credentials_for(&login);
        Ok(login.with_credentials(credentials))
    }
}

impl RouteTable for HostDirectory {
    fn route(&self, host: &str) -> Option<String> {
        self.matching(host).find_map(|rule| rule.via.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hopshell_ssh::{PromptRequest, TransportError};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE: &str = r#"{
        "default_user": "deploy",
        "max_sessions_per_connection": 4,
        "probe": { "enabled": false, "timeout_ms": 500 },
        "hosts": [
            { "pattern": "internal-host", "via": "jump1;jump2" },
            { "pattern": "*.corp", "user": "ops", "port": 2222, "key_path": "/keys/ops" },
            { "pattern": "*", "key_path": "/keys/default" }
        ]
    }"#;

    fn directory() -> HostDirectory {
        HostDirectory::new(HostConfig::from_json_str(SAMPLE).unwrap()).unwrap()
    }

    #[test]
    fn test_host_config_default() {
        let config = HostConfig::default();
        assert_eq!(config.max_sessions_per_connection, 9);
        assert!(config.probe.enabled);
        assert_eq!(config.probe.timeout(), Duration::from_secs(2));
        assert!(config.memoize_tunnels);
        assert!(config.hosts.is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let config = HostConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.default_user(), "deploy");
        assert_eq!(config.pool_config().max_sessions_per_connection, 4);
        assert!(!config.probe.enabled);
        assert!(config.memoize_tunnels);
        assert_eq!(config.hosts.len(), 3);
        assert_eq!(config.hosts[0].via.as_deref(), Some("jump1;jump2"));
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            HostConfig::from_json_str(r#"{ "max_sessions_per_connection": 0 }"#),
            Err(ShoreError::Config(_))
        ));
        assert!(matches!(
            HostConfig::from_json_str(r#"{ "hosts": [ { "pattern": "[unclosed" } ] }"#),
            Err(ShoreError::Config(_))
        ));
        assert!(matches!(HostConfig::from_json_str("{ nope"), Err(ShoreError::Json(_))));
    }

    #[test]
    fn test_resolve_applies_first_matching_rule_per_field() {
        let directory = directory();

        let login = directory.resolve("db.corp").unwrap();
        assert_eq!(login.user(), "ops");
        assert_eq!(login.port(), Some(2222));
        assert_eq!(login.key_path(), Some(Path::new("/keys/ops")));

        let login = directory.resolve("alice@db.corp:22").unwrap();
        assert_eq!(login.user(), "alice");
        assert_eq!(login.port(), Some(22));

        let login = directory.resolve("db1").unwrap();
        assert_eq!(login.user(), "deploy");
        assert_eq!(login.port(), None);
        assert_eq!(login.key_path(), Some(Path::new("/keys/default")));
    }

    #[test]
    fn test_resolve_rejects_bad_specifier() {
        assert!(directory().resolve("alice@").is_err());
    }

    #[test]
    fn test_route_lookup() {
        let directory = directory();
        assert_eq!(directory.route("internal-host").as_deref(), Some("jump1;jump2"));
        assert_eq!(directory.route("db.corp"), None);
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home(Path::new("~/.ssh/id")), PathBuf::from("/home/tester/.ssh/id"));
        assert_eq!(expand_home(Path::new("/abs/id")), PathBuf::from("/abs/id"));
    }

    struct Fixed(AtomicUsize);

    #[async_trait]
    impl Prompt for Fixed {
        async fn password(&self, _request: &PromptRequest) -> std::result::Result<Option<String>, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some("pw".to_string()))
        }
    }

    #[tokio::test]
    async fn test_credentials_shared_between_resolutions() {
        let prompt = Arc::new(Fixed(AtomicUsize::new(0)));
        let directory = directory().with_prompt(prompt.clone());

        let a = directory.resolve("ops@jump1").unwrap();
        let b = directory.resolve("ops@jump1").unwrap();
        assert_eq!(a.credentials().password(&a).await.unwrap().as_deref(), Some("pw"));
        assert_eq!(b.credentials().password(&b).await.unwrap().as_deref(), Some("pw"));
        assert_eq!(prompt.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = HostConfig::load(file.path()).await.unwrap();
        assert_eq!(config.hosts[1].pattern, "*.corp");
        assert!(HostConfig::load("/nonexistent/hosts.json").await.is_err());
    }
}
