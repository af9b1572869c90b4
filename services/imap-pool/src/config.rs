//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env var > default path.
//! Every `[pool]` and `[imap]` field has a default, so a file with only a
//! `[server]` section is valid. Account credentials never live here; callers
//! supply them with each request.

use serde::Deserialize;
use session_pool::PoolConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub imap: ImapSettings,
    #[serde(default)]
    pub pool: PoolSettings,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream IMAP server
#[derive(Debug, Deserialize)]
pub struct ImapSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_tls")]
    pub tls: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: default_tls(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl ImapSettings {
    pub fn to_imap_config(&self) -> imap_session::ImapConfig {
        let timeout = Duration::from_secs(self.connect_timeout_secs);
        imap_session::ImapConfig {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls,
            connect_timeout: timeout,
            probe_timeout: timeout,
        }
    }
}

/// Pool tuning, in whole seconds.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_slots_per_account: usize,
    pub wait_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_session_age_secs: u64,
    pub push_grace_period_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let d = PoolConfig::default();
        Self {
            max_slots_per_account: d.max_slots_per_account,
            wait_timeout_secs: d.wait_timeout.as_secs(),
            idle_timeout_secs: d.idle_timeout.as_secs(),
            max_session_age_secs: d.max_session_age.as_secs(),
            push_grace_period_secs: d.push_grace_period.as_secs(),
            reap_interval_secs: d.reap_interval.as_secs(),
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_slots_per_account: self.max_slots_per_account,
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_session_age: Duration::from_secs(self.max_session_age_secs),
            push_grace_period: Duration::from_secs(self.push_grace_period_secs),
            reap_interval: Duration::from_secs(self.reap_interval_secs),
        }
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_host() -> String {
    "imap.gmail.com".into()
}

fn default_port() -> u16 {
    993
}

fn default_tls() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.imap.host.trim().is_empty() {
            return Err(common::Error::Config("imap.host must not be empty".into()));
        }

        if config.imap.port == 0 {
            return Err(common::Error::Config("imap.port must not be 0".into()));
        }

        if config.imap.connect_timeout_secs == 0 {
            return Err(common::Error::Config(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        config
            .pool
            .to_pool_config()
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("imap-pool.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch CONFIG_PATH.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("imap-pool.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.imap.host, "imap.gmail.com");
        assert_eq!(config.imap.port, 993);
        assert!(config.imap.tls);

        let pool = config.pool.to_pool_config();
        assert_eq!(pool.max_slots_per_account, 5);
        assert_eq!(pool.wait_timeout, Duration::from_secs(5));
        assert_eq!(pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(pool.max_session_age, Duration::from_secs(1800));
        assert_eq!(pool.push_grace_period, Duration::from_secs(60));
        assert_eq!(pool.reap_interval, Duration::from_secs(30));
    }

    #[test]
    fn full_config_round_trips_into_library_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "0.0.0.0:9100"
max_connections = 32

[imap]
host = "imap.example.org"
port = 143
tls = false
connect_timeout_secs = 3

[pool]
max_slots_per_account = 2
wait_timeout_secs = 1
idle_timeout_secs = 120
"#,
        );

        let config = Config::load(&path).unwrap();
        let imap = config.imap.to_imap_config();
        assert_eq!(imap.host, "imap.example.org");
        assert_eq!(imap.port, 143);
        assert!(!imap.tls);
        assert_eq!(imap.connect_timeout, Duration::from_secs(3));

        let pool = config.pool.to_pool_config();
        assert_eq!(pool.max_slots_per_account, 2);
        assert_eq!(pool.wait_timeout, Duration::from_secs(1));
        assert_eq!(pool.idle_timeout, Duration::from_secs(120));
        // Unset fields keep their defaults.
        assert_eq!(pool.reap_interval, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(Path::new("/nonexistent/path/imap-pool.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn zero_slots_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[pool]
max_slots_per_account = 0
"#,
        );
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("max_slots_per_account"), "got: {err}");
    }

    #[test]
    fn empty_host_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"

[imap]
host = " "
"#,
        );
        assert!(matches!(Config::load(&path), Err(common::Error::Config(_))));
    }

    #[test]
    fn zero_max_connections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "127.0.0.1:8080"
max_connections = 0
"#,
        );
        assert!(matches!(Config::load(&path), Err(common::Error::Config(_))));
    }

    #[test]
    fn resolve_path_prefers_cli_then_env_then_default() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe { set_env("CONFIG_PATH", "/etc/imap-pool/env.toml") };
        assert_eq!(
            Config::resolve_path(Some("/tmp/cli.toml")),
            PathBuf::from("/tmp/cli.toml")
        );
        assert_eq!(
            Config::resolve_path(None),
            PathBuf::from("/etc/imap-pool/env.toml")
        );

        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("imap-pool.toml"));
    }
}
