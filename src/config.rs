use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for blob files and the staging area
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: u64,
    /// 0 disables the periodic sweep (the startup sweep still runs)
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    /// 0 means unlimited
    #[serde(default)]
    pub max_upload_bytes: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1309
}

fn default_db_path() -> String {
    "data/dedupvault.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_storage_root() -> String {
    "data/blobs".to_string()
}

fn default_upload_timeout() -> u64 {
    300
}

fn default_lookup_timeout() -> u64 {
    10
}

fn default_gc_interval() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            upload_timeout_secs: default_upload_timeout(),
            lookup_timeout_secs: default_lookup_timeout(),
            gc_interval_secs: default_gc_interval(),
            max_upload_bytes: 0,
        }
    }
}

impl StorageConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_secs)
    }

    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_secs > 0).then(|| Duration::from_secs(self.gc_interval_secs))
    }

    pub fn max_upload_bytes(&self) -> Option<u64> {
        (self.max_upload_bytes > 0).then_some(self.max_upload_bytes)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        tracing::info!(
            "Storage config: root={}, upload_timeout={}s, lookup_timeout={}s, gc_interval={}s",
            config.storage.root,
            config.storage.upload_timeout_secs,
            config.storage.lookup_timeout_secs,
            config.storage.gc_interval_secs
        );
        Ok(config)
    }

    /// Load configuration from config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["config.toml", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: DV_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(val) = lookup("DV_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Some(port) = lookup("DV_CONF_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }

        // Database overrides
        if let Some(val) = lookup("DV_CONF_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Some(n) = lookup("DV_CONF_DATABASE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.database.max_connections = n;
        }

        // Storage overrides
        if let Some(val) = lookup("DV_CONF_STORAGE_ROOT") {
            self.storage.root = val;
        }
        if let Some(secs) = lookup("DV_CONF_STORAGE_UPLOAD_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.storage.upload_timeout_secs = secs;
        }
        if let Some(secs) = lookup("DV_CONF_STORAGE_LOOKUP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.storage.lookup_timeout_secs = secs;
        }
        if let Some(secs) = lookup("DV_CONF_STORAGE_GC_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.storage.gc_interval_secs = secs;
        }
        if let Some(bytes) = lookup("DV_CONF_STORAGE_MAX_UPLOAD_BYTES").and_then(|v| v.parse().ok()) {
            self.storage.max_upload_bytes = bytes;
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }

        fs::create_dir_all(&self.storage.root)?;

        Ok(())
    }
}
