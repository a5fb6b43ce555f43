use std::{collections::HashMap, time::Duration};

use chrono::TimeDelta;
use config::{Config as ConfigLib, ConfigError, Environment, File};
use redis::{
    Client as RedisClient, RedisResult,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::revocation::{ServiceOptions, SyncSchedulerConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Where the revocation lists come from and how they are kept in sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationConfig {
    /// Base URL of the revocation list host
    pub host: String,
    /// PEM file holding the key the lists are signed with
    pub public_key_path: String,
    pub caching_enabled: bool,
    pub update_interval_hours: i64,
    pub check_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_concurrent_fetches: usize,
    pub direct_cache_capacity: usize,
}

impl RevocationConfig {
    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            caching_enabled: self.caching_enabled,
            update_interval: TimeDelta::hours(self.update_interval_hours.max(0)),
            max_concurrent_fetches: self.max_concurrent_fetches.max(1),
            direct_cache_capacity: self.direct_cache_capacity.max(1),
        }
    }

    pub fn scheduler_config(&self) -> SyncSchedulerConfig {
        SyncSchedulerConfig {
            check_interval_secs: self.check_interval_secs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub uri: SecretString,
}

impl RedisConfig {
    /// Establishes a new Redis connection based on the provided URI.
    ///
    /// - To enable TLS, the URI must use the `rediss://` scheme.
    /// - To enable insecure TLS, the URI must use the `rediss://` scheme and end with `/#insecure`.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn start(&self) -> RedisResult<ConnectionManager> {
        let client = RedisClient::open(self.uri.expose_secret())?;
        let config = ConnectionManagerConfig::new().set_connection_timeout(Duration::from_secs(60));
        client.get_connection_manager_with_config(config).await
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .set_default("server.host", "localhost")?
            .set_default("server.port", 3000)?
            .set_default("revocation.host", "https://de.crl.dscg.ubirch.com")?
            .set_default("revocation.public_key_path", "config/revocation_list_key.pem")?
            .set_default("revocation.caching_enabled", false)?
            .set_default("revocation.update_interval_hours", 24)?
            .set_default("revocation.check_interval_secs", 3600)?
            .set_default("revocation.request_timeout_secs", 30)?
            .set_default("revocation.max_concurrent_fetches", 8)?
            .set_default("revocation.direct_cache_capacity", 256)?
            .add_source(File::with_name("config/settings").required(false));

        // Explicit overrides keep tests independent of the process environment
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_SERVER__HOST or APP_REVOCATION__CACHING_ENABLED
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }
}
