//! Configuration loading for trayvault.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use directories::{BaseDirs, ProjectDirs};
use serde::Deserialize;

use crate::lock::{DEFAULT_POLL_INTERVAL, LockIdentity, LockingStore};
use crate::storage::ObjectStore;
use crate::storage::listing;
use crate::storage::local::LocalFileStore;
use crate::storage::remote::{RemoteConfig, RemoteObjectStore};

/// Environment variable naming a config file to use instead of the default.
pub const CONFIG_ENV: &str = "TRAYVAULT_CONFIG";

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub lock: LockConfig,
}

/// Which backend holds the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Base directory of the local backend; each container is a subdirectory.
    #[serde(default = "default_base_path")]
    pub base_path: String,
}

fn default_base_path() -> String {
    "~/.trayvault".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            base_path: default_base_path(),
        }
    }
}

/// Settings of the S3-compatible backend.
///
/// Either `address` (`user:password@host:port`) or `endpoint` with
/// `access_key` and `secret_key` must be given.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSection {
    pub address: Option<String>,
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    #[serde(default = "default_listing_ttl_secs")]
    pub listing_ttl_secs: u64,
    #[serde(default = "default_listing_capacity")]
    pub listing_capacity: usize,
}

fn default_listing_ttl_secs() -> u64 {
    listing::DEFAULT_TTL.as_secs()
}

fn default_listing_capacity() -> usize {
    listing::DEFAULT_CAPACITY
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            address: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            region: None,
            listing_ttl_secs: default_listing_ttl_secs(),
            listing_capacity: default_listing_capacity(),
        }
    }
}

impl RemoteSection {
    /// Connection settings for the remote backend.
    ///
    /// # Errors
    ///
    /// Returns an error if neither a valid address nor a complete endpoint
    /// with credentials is configured.
    pub fn to_remote_config(&self) -> anyhow::Result<RemoteConfig> {
        let mut config = if let Some(address) = &self.address {
            RemoteConfig::from_address(address).context("Invalid [remote] address")?
        } else {
            let endpoint = self
                .endpoint
                .as_deref()
                .context("[remote] needs either `address` or `endpoint`")?;
            let access_key = self.access_key.as_deref().context("[remote] endpoint needs `access_key`")?;
            let secret_key = self.secret_key.as_deref().context("[remote] endpoint needs `secret_key`")?;
            RemoteConfig::new(endpoint, access_key, secret_key)
        };
        if let Some(region) = &self.region {
            config.region.clone_from(region);
        }
        config.listing_ttl = Duration::from_secs(self.listing_ttl_secs);
        config.listing_capacity = self.listing_capacity;
        Ok(config)
    }
}

/// Settings of the sentinel lock protocol.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// How long command-line operations wait for a lock.
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
    /// Interval between acquisition attempts.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Host name recorded in sentinels; detected when absent.
    pub host: Option<String>,
    /// IP address recorded in sentinels; detected when absent.
    pub ip: Option<String>,
}

fn default_wait_ms() -> u64 {
    10_000
}

fn default_poll_ms() -> u64 {
    u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(1000)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: default_wait_ms(),
            poll_ms: default_poll_ms(),
            host: None,
            ip: None,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    #[must_use]
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    /// Identity written into sentinels, filling gaps with detected values.
    #[must_use]
    pub fn identity(&self) -> LockIdentity {
        match (&self.host, &self.ip) {
            (Some(host), Some(ip)) => LockIdentity::new(host, ip),
            (host, ip) => {
                let detected = LockIdentity::detect();
                LockIdentity::new(
                    host.clone().unwrap_or(detected.host),
                    ip.clone().unwrap_or(detected.ip),
                )
            }
        }
    }
}

impl Config {
    /// Load the file named by `TRAYVAULT_CONFIG`, else
    /// ~/.config/trayvault/config.toml, else return defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `TRAYVAULT_CONFIG` names a missing file or a
    /// config file cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }

        if let Some(path) = Self::config_path()
            && path.exists()
        {
            return Self::from_file(&path);
        }

        Ok(Config::default())
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// # Errors
    ///
    /// Returns an error if `contents` is not a valid config.
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    #[must_use]
    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "trayvault").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Build the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the local base directory does not exist or the
    /// remote settings are incomplete.
    pub fn open_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = match self.store.backend {
            BackendKind::Local => {
                let base = expand_tilde(&self.store.base_path);
                Arc::new(
                    LocalFileStore::new(&base)
                        .with_context(|| format!("Cannot open local store at {}", base.display()))?,
                )
            }
            BackendKind::Remote => Arc::new(RemoteObjectStore::new(&self.remote.to_remote_config()?)?),
        };
        Ok(store)
    }

    /// The configured backend behind the lock protocol.
    ///
    /// # Errors
    ///
    /// See [`open_store`](Self::open_store).
    pub fn open_locking_store(&self) -> anyhow::Result<Arc<LockingStore>> {
        Ok(Arc::new(
            LockingStore::new(self.open_store()?)
                .with_identity(self.lock.identity())
                .with_poll_interval(self.lock.poll()),
        ))
    }
}

/// Expand ~ to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(base_dirs) = BaseDirs::new()
    {
        return base_dirs.home_dir().join(rest);
    }
    PathBuf::from(path)
}
