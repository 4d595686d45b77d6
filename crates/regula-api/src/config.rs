//! Server configuration from the environment.

use std::str::FromStr;

use regula_core::defaults;
use regula_core::{Error, Result};

use crate::stream::StreamConfig;

/// Where check records, quotas and dictionary entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!(
                "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

/// Persistence of queued scan work. Only memory-resident queues exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDurability {
    Memory,
}

impl FromStr for QueueDurability {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            other => Err(Error::Config(format!(
                "SCAN_QUEUE_DURABILITY '{}' is not supported; only 'memory' is available",
                other
            ))),
        }
    }
}

/// Whether this process is the only scheduler against its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceMode {
    Single,
    Shared,
}

impl FromStr for InstanceMode {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "shared" => Ok(Self::Shared),
            other => Err(Error::Config(format!(
                "SCHEDULER_INSTANCE_MODE must be 'single' or 'shared', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreBackend,
    pub database_url: String,
    pub durability: QueueDurability,
    pub instance_mode: InstanceMode,
    pub recover_orphans: bool,
    pub event_bus_capacity: usize,
    /// Allowed CORS origins; empty allows none beyond same-origin.
    pub cors_origins: Vec<String>,
    pub stream: StreamConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: defaults::SERVER_PORT,
            store: StoreBackend::Postgres,
            database_url: "postgres://localhost/regula".to_string(),
            durability: QueueDurability::Memory,
            instance_mode: InstanceMode::Single,
            recover_orphans: true,
            event_bus_capacity: defaults::EVENT_BUS_CAPACITY,
            cors_origins: Vec::new(),
            stream: StreamConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        let base = Self::default();

        let var = |name: &str| std::env::var(name).ok();

        let store = match var("STORE_BACKEND") {
            Some(v) => v.parse()?,
            None => base.store,
        };
        let durability = match var("SCAN_QUEUE_DURABILITY") {
            Some(v) => v.parse()?,
            None => base.durability,
        };
        let instance_mode = match var("SCHEDULER_INSTANCE_MODE") {
            Some(v) => v.parse()?,
            None => base.instance_mode,
        };

        let port = match std::env::var("PORT") {
            Ok(v) => v
                .parse()
                .map_err(|_| Error::Config(format!("PORT must be a port number, got '{}'", v)))?,
            Err(_) => base.port,
        };

        Ok(Self {
            host: std::env::var("HOST").unwrap_or(base.host),
            port,
            store,
            database_url: std::env::var("DATABASE_URL").unwrap_or(base.database_url),
            durability,
            instance_mode,
            recover_orphans: std::env::var("SCAN_RECOVER_ORPHANS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(base.recover_orphans),
            event_bus_capacity: std::env::var("EVENT_BUS_CAPACITY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(base.event_bus_capacity),
            cors_origins: std::env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| parse_origins(&v))
                .unwrap_or_default(),
            stream: StreamConfig::from_env(),
        })
    }

    /// Orphan recovery is only safe when no other scheduler shares the store.
    pub fn should_recover_orphans(&self) -> bool {
        self.recover_orphans && self.instance_mode == InstanceMode::Single
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
