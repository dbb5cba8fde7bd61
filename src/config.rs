use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    pub max_payload_bytes: usize,
    pub max_path_bytes: usize,
    pub max_field_bytes: usize,
    pub max_batch_size: usize,
    /// Hostnames of the tracked site. Referrers from these hosts count as direct traffic.
    #[serde(default)]
    pub site_hosts: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 32768,
            max_path_bytes: 2048,
            max_field_bytes: 1024,
            max_batch_size: 50,
            site_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sweep_enabled")]
    pub sweep_enabled: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_enabled: default_sweep_enabled(),
        }
    }
}

fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_sweep_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Plaintext admin bearer tokens. Only their SHA-256 hashes are kept in memory.
    #[serde(default)]
    pub admin_tokens: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub per_second: u64,
    pub burst_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    60
}

impl AppConfig {
    /// Validate configuration before the server starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.auth.admin_tokens.is_empty() {
            return Err("auth.admin_tokens must contain at least one token. \
                 Set it in config.toml or via PAGETRAIL__AUTH__ADMIN_TOKENS env var."
                .to_string());
        }
        if self
            .auth
            .admin_tokens
            .iter()
            .any(|t| t.len() < 32 || t == "change-me-in-production")
        {
            return Err("every auth.admin_tokens entry must be a unique value of at least 32 characters"
                .to_string());
        }
        let mut seen = HashSet::new();
        if !self.auth.admin_tokens.iter().all(|t| seen.insert(t.as_str())) {
            return Err("auth.admin_tokens contains a duplicate token".to_string());
        }
        if self.sessions.idle_timeout_secs == 0 {
            return Err("sessions.idle_timeout_secs must be greater than zero".to_string());
        }
        if self.sessions.sweep_enabled && self.sessions.sweep_interval_secs == 0 {
            return Err("sessions.sweep_interval_secs must be greater than zero".to_string());
        }
        if self.ingest.max_batch_size == 0 {
            return Err("ingest.max_batch_size must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (PAGETRAIL__SERVER__PORT=3001, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PAGETRAIL")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("auth.admin_tokens")
                .with_list_parse_key("ingest.site_hosts")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
