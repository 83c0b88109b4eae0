//! A node: the replica engine, the request service and the HTTP API wired
//! together from a [`Config`].

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use iroh_metrics::{Registry, service::start_metrics_server};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, info, info_span};

use crate::{
    cache::{Cache, MemoryCache, PersistentCache},
    config::{CacheConfig, Config, MemoryImageConfig},
    engine::Engine,
    http::HttpServer,
    keys::KeyStore,
    memory_image::{MemoryImage, MemoryImageLog},
    peer::{DataPeer, MemPeer},
    service::RequestService,
};

/// Spawn a node on an in-process peer and run until the `Ctrl-C` signal is
/// received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let node = Node::spawn(config, MemPeer::new()).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    node.shutdown().await?;
    Ok(())
}

#[derive(Debug)]
pub struct Node {
    engine: Engine,
    service: RequestService,
    http_server: Option<HttpServer>,
    metrics_server: Option<AbortOnDropHandle<Result<()>>>,
}

impl Node {
    /// Spawn all components of a node on `peer`.
    ///
    /// The HTTP server is only started if `config.web_service` is set, the
    /// metrics server only if `config.metrics_addr` is.
    pub async fn spawn<P: DataPeer>(config: Config, peer: P) -> Result<Self> {
        let keys = KeyStore::from_config(&config.key_store).context("invalid key store")?;
        let (cache, memory_image) = open_stores(&config)?;
        let engine = Engine::spawn(config.engine_options(), peer, cache, memory_image, keys)
            .await
            .context("failed to start engine")?;
        let service = RequestService::spawn(&config.service_config(), engine.clone());
        let http_server = if config.web_service {
            Some(HttpServer::spawn(config.addr, service.clone()).await?)
        } else {
            None
        };
        let metrics_server = config.metrics_addr.map(|addr| {
            let mut registry = Registry::default();
            registry.register(engine.metrics().clone());
            info!(%addr, "serving metrics");
            AbortOnDropHandle::new(tokio::task::spawn(
                async move {
                    start_metrics_server(addr, Arc::new(registry)).await?;
                    anyhow::Ok(())
                }
                .instrument(info_span!("metrics-server")),
            ))
        });
        Ok(Self {
            engine,
            service,
            http_server,
            metrics_server,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn service(&self) -> &RequestService {
        &self.service
    }

    /// The bound address of the HTTP API, if it is served.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_server.as_ref().map(HttpServer::http_addr)
    }

    /// Stop the HTTP servers, then the request service, then the engine.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.metrics_server);
        if let Some(http_server) = self.http_server {
            http_server.shutdown().await?;
        }
        self.service.shutdown().await;
        self.engine.shutdown().await?;
        Ok(())
    }
}

/// Open the cache and the memory image, sharing one database when both
/// point at the same file.
fn open_stores(config: &Config) -> Result<(Arc<dyn Cache>, Arc<dyn MemoryImage>)> {
    let mut persistent: Option<(std::path::PathBuf, Arc<PersistentCache>)> = None;
    let mut open = |path: &std::path::Path| -> Result<Arc<PersistentCache>> {
        if let Some((open_path, store)) = &persistent {
            if open_path == path {
                return Ok(store.clone());
            }
        }
        let store = Arc::new(
            PersistentCache::persistent(path)
                .with_context(|| format!("failed to open {}", path.display()))?,
        );
        persistent = Some((path.to_path_buf(), store.clone()));
        Ok(store)
    };
    let cache: Arc<dyn Cache> = match &config.cache {
        CacheConfig::Memory { capacity } => Arc::new(MemoryCache::new(*capacity)),
        CacheConfig::Persistent { path } => open(path)?,
    };
    let memory_image: Arc<dyn MemoryImage> = match &config.memory_image {
        MemoryImageConfig::Memory => Arc::new(MemoryImageLog::new()),
        MemoryImageConfig::Persistent { path } => open(path)?,
    };
    Ok((cache, memory_image))
}
