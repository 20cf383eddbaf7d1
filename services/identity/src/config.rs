use anyhow::{Context, Result};
use masque_common::Error as CommonError;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;

const DEFAULT_POSTGRES_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_POSTGRES_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POSTGRES_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DELIVERY_QUEUE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl FromStr for StorageBackend {
    type Err = CommonError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "postgres" | "pg" => Ok(StorageBackend::Postgres),
            other => Err(CommonError::Config(format!("unknown storage backend: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    DEFAULT_POSTGRES_MAX_CONNECTIONS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_POSTGRES_CONNECT_TIMEOUT_MS
}

fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_POSTGRES_ACQUIRE_TIMEOUT_MS
}

// Identity service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub bind_addr: SocketAddr,
    pub metrics_bind: SocketAddr,
    pub storage: StorageBackend,
    pub postgres: Option<PostgresConfig>,
    pub delivery_queue_capacity: usize,
}

#[derive(Debug, Deserialize)]
struct IdentityConfigOverride {
    bind_addr: Option<String>,
    metrics_bind: Option<String>,
    storage: Option<String>,
    postgres: Option<PostgresConfig>,
    delivery_queue_capacity: Option<usize>,
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("parse {name}")),
        Err(_) => Ok(None),
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("MASQUE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8443".to_string())
            .parse()
            .with_context(|| "parse MASQUE_BIND")?;
        let metrics_bind = std::env::var("MASQUE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse MASQUE_METRICS_BIND")?;
        let storage = env_parse::<StorageBackend>("MASQUE_STORAGE")?
            .unwrap_or(StorageBackend::Memory);
        let postgres = match std::env::var("MASQUE_POSTGRES_URL") {
            Ok(url) => Some(PostgresConfig {
                url,
                max_connections: env_parse("MASQUE_POSTGRES_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_POSTGRES_MAX_CONNECTIONS),
                connect_timeout_ms: env_parse("MASQUE_POSTGRES_CONNECT_TIMEOUT_MS")?
                    .unwrap_or(DEFAULT_POSTGRES_CONNECT_TIMEOUT_MS),
                acquire_timeout_ms: env_parse("MASQUE_POSTGRES_ACQUIRE_TIMEOUT_MS")?
                    .unwrap_or(DEFAULT_POSTGRES_ACQUIRE_TIMEOUT_MS),
            }),
            Err(_) => None,
        };
        let delivery_queue_capacity = env_parse("MASQUE_DELIVERY_QUEUE_CAPACITY")?
            .unwrap_or(DEFAULT_DELIVERY_QUEUE_CAPACITY);
        Ok(Self {
            bind_addr,
            metrics_bind,
            storage,
            postgres,
            delivery_queue_capacity,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("MASQUE_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read MASQUE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: IdentityConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse identity config yaml")?;
        if let Some(value) = override_cfg.bind_addr {
            self.bind_addr = value.parse().with_context(|| "parse bind_addr")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.storage {
            self.storage = value.parse().with_context(|| "parse storage")?;
        }
        if let Some(value) = override_cfg.postgres {
            self.postgres = Some(value);
        }
        if let Some(value) = override_cfg.delivery_queue_capacity {
            self.delivery_queue_capacity = value;
        }
        Ok(())
    }
}
