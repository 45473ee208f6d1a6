use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::{lock::LockBackoff, namespace_service::NamespaceSettings};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_connections: u32,
    pub cache_ttl_secs: u64,
    pub lock_timeout_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket and object namespace server")]
pub struct Args {
    /// Host to bind to (overrides NAMESERVER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides NAMESERVER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides NAMESERVER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Pool size (overrides NAMESERVER_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Lifetime of cached lookups in seconds (overrides NAMESERVER_CACHE_TTL_SECS)
    #[arg(long)]
    pub cache_ttl_secs: Option<u64>,

    /// How long a directory lock may be waited for (overrides NAMESERVER_LOCK_TIMEOUT_MS)
    #[arg(long)]
    pub lock_timeout_ms: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("NAMESERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("NAMESERVER_PORT", 3000u16)?;
        let env_db = env::var("NAMESERVER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/nameserver.db".into());
        let env_max_connections = env_or("NAMESERVER_MAX_CONNECTIONS", 5u32)?;
        let env_cache_ttl = env_or("NAMESERVER_CACHE_TTL_SECS", 30u64)?;
        let env_lock_timeout = env_or("NAMESERVER_LOCK_TIMEOUT_MS", 5000u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections: args.max_connections.unwrap_or(env_max_connections).max(1),
            cache_ttl_secs: args.cache_ttl_secs.unwrap_or(env_cache_ttl),
            lock_timeout_ms: args.lock_timeout_ms.unwrap_or(env_lock_timeout),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn namespace_settings(&self) -> NamespaceSettings {
        NamespaceSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            lock_backoff: LockBackoff {
                timeout: Duration::from_millis(self.lock_timeout_ms),
                ..LockBackoff::default()
            },
        }
    }
}

/// Read and parse `key`, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
