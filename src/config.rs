//! Configuration for a node

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{
    cache::MemoryCache,
    engine::EngineOptions,
    keys::KeyStoreConfig,
    peer::{Address, Topic},
    queue::QueueConfig,
    service::ServiceConfig,
};

const DEFAULT_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 7117);

/// Node configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates a config suitable for local development
/// and testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address of the HTTP API.
    pub addr: SocketAddr,
    /// Whether to serve the HTTP API at all.
    pub web_service: bool,
    /// Serve OpenMetrics on this address when set.
    pub metrics_addr: Option<SocketAddr>,
    /// An index to join at startup.
    pub index_hash: Option<Address>,
    /// Abort startup when `index_hash` cannot be loaded.
    pub fail_early: bool,
    /// Interval at which the current head is re-published.
    #[serde(with = "humantime_serde")]
    pub replicate_interval: Duration,
    /// Interval of the persist ticker.
    #[serde(with = "humantime_serde")]
    pub pulse: Duration,
    pub topics: Vec<Topic>,
    /// Number of requests run against the engine at the same time.
    pub api_concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Accept links from anyone instead of only the keys in `key_store`.
    pub public_server: bool,
    pub key_store: KeyStoreConfig,
    pub priority_queue: QueueConfig,
    pub cache: CacheConfig,
    pub memory_image: MemoryImageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Bounded in-memory caches.
    Memory {
        #[serde(default = "default_cache_capacity")]
        capacity: usize,
    },
    /// A redb database file.
    Persistent { path: PathBuf },
}

fn default_cache_capacity() -> usize {
    MemoryCache::DEFAULT_CAPACITY
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryImageConfig {
    /// Kept for the lifetime of the process.
    Memory,
    /// A redb database file. May be the same file as the persistent cache.
    Persistent { path: PathBuf },
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineOptions::default();
        let service = ServiceConfig::default();
        Self {
            addr: DEFAULT_ADDR,
            web_service: true,
            metrics_addr: None,
            index_hash: None,
            fail_early: false,
            replicate_interval: engine.replicate_interval,
            pulse: engine.pulse,
            topics: vec![Topic::new("latticedb")],
            api_concurrency: service.api_concurrency,
            request_timeout: service.request_timeout,
            public_server: false,
            key_store: KeyStoreConfig::default(),
            priority_queue: service.queue,
            cache: CacheConfig::Memory {
                capacity: default_cache_capacity(),
            },
            memory_image: MemoryImageConfig::Memory,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let s = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("failed to read {}", path.as_ref().to_string_lossy()))?;
        let config: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse {}", path.as_ref().to_string_lossy()))?;
        Ok(config)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            pulse: self.pulse,
            replicate_interval: self.replicate_interval,
            topics: self.topics.clone(),
            public_server: self.public_server,
            index_hash: self.index_hash.clone(),
            fail_early: self.fail_early,
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            api_concurrency: self.api_concurrency,
            queue: self.priority_queue.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestKind;

    #[test]
    fn parse_full() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            addr = "0.0.0.0:8080"
            web_service = false
            metrics_addr = "127.0.0.1:9117"
            index_hash = "abc"
            fail_early = true
            replicate_interval = "10s"
            pulse = "250ms"
            topics = ["a", "b"]
            api_concurrency = 2
            request_timeout = "5s"
            public_server = true

            [key_store]
            public_keys = []

            [priority_queue]
            capacity = 16
            order = ["query", "reflect", "replicate"]

            [cache]
            kind = "persistent"
            path = "/tmp/lattice.redb"

            [memory_image]
            kind = "memory"
            "#,
        )?;
        assert_eq!(config.addr, "0.0.0.0:8080".parse()?);
        assert!(!config.web_service);
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9117".parse()?));
        assert_eq!(config.pulse, Duration::from_millis(250));
        assert_eq!(
            config.cache,
            CacheConfig::Persistent {
                path: "/tmp/lattice.redb".into()
            }
        );

        let opts = config.engine_options();
        assert_eq!(opts.index_hash, Some(Address::new("abc")));
        assert_eq!(opts.topics, vec![Topic::new("a"), Topic::new("b")]);
        assert_eq!(opts.replicate_interval, Duration::from_secs(10));
        assert!(opts.public_server && opts.fail_early);

        let service = config.service_config();
        assert_eq!(service.api_concurrency, 2);
        assert_eq!(service.queue.capacity, 16);
        assert_eq!(service.queue.order[0], RequestKind::Query);
        Ok(())
    }

    #[test]
    fn empty_is_default() -> anyhow::Result<()> {
        let config: Config = toml::from_str("")?;
        assert_eq!(config, Config::default());
        let config: Config = toml::from_str("[cache]\nkind = \"memory\"")?;
        assert_eq!(
            config.cache,
            CacheConfig::Memory {
                capacity: MemoryCache::DEFAULT_CAPACITY
            }
        );
        Ok(())
    }

    #[test]
    fn default_roundtrips_through_toml() -> anyhow::Result<()> {
        let text = toml::to_string(&Config::default())?;
        let config: Config = toml::from_str(&text)?;
        assert_eq!(config, Config::default());
        Ok(())
    }
}
