//! Reading and writing lattice values through the cache and the peer.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::{
    cache::Cache,
    codec::{self, InvalidEntry},
    crdt::{Index, Namespace},
    metrics::Metrics,
    peer::{Address, DataPeer},
};

#[derive(Debug, Clone)]
pub(super) struct Content<P> {
    peer: P,
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
}

impl<P: DataPeer> Content<P> {
    pub(super) fn new(peer: P, cache: Arc<dyn Cache>, metrics: Arc<Metrics>) -> Self {
        Self {
            peer,
            cache,
            metrics,
        }
    }

    pub(super) fn peer(&self) -> &P {
        &self.peer
    }

    pub(super) fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub(super) fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Fetch the namespace fragment at `path`, from the cache if possible.
    pub(super) async fn namespace(&self, path: &Address) -> Result<Namespace> {
        match self.cache.get_namespace(path) {
            Ok(Some(namespace)) => {
                self.metrics.cache_hits.inc();
                return Ok(namespace);
            }
            Ok(None) => {}
            Err(err) => warn!(path = %path.fmt_short(), "namespace cache read failed: {err:#}"),
        }
        self.metrics.cache_misses.inc();
        let bytes = self
            .peer
            .cat(path)
            .await
            .with_context(|| format!("failed to fetch namespace {path}"))?;
        let (namespace, invalid) = codec::decode_namespace(&bytes)
            .with_context(|| format!("failed to decode namespace {path}"))?;
        self.report_invalid(path, &invalid);
        if let Err(err) = self.cache.set_namespace(path, &namespace) {
            warn!(path = %path.fmt_short(), "namespace cache write failed: {err:#}");
        }
        Ok(namespace)
    }

    /// Fetch the index at `path`, from the cache if possible.
    pub(super) async fn index(&self, path: &Address) -> Result<Index> {
        match self.cache.get_index(path) {
            Ok(Some(index)) => {
                self.metrics.cache_hits.inc();
                return Ok(index);
            }
            Ok(None) => {}
            Err(err) => warn!(path = %path.fmt_short(), "index cache read failed: {err:#}"),
        }
        self.metrics.cache_misses.inc();
        let bytes = self
            .peer
            .cat(path)
            .await
            .with_context(|| format!("failed to fetch index {path}"))?;
        let (index, invalid) = codec::decode_index(&bytes)
            .with_context(|| format!("failed to decode index {path}"))?;
        self.report_invalid(path, &invalid);
        if let Err(err) = self.cache.set_index(path, &index) {
            warn!(path = %path.fmt_short(), "index cache write failed: {err:#}");
        }
        Ok(index)
    }

    /// Add `namespace` to the CAS and the cache.
    pub(super) async fn add_namespace(&self, namespace: &Namespace) -> Result<Address> {
        let path = self
            .peer
            .add(codec::encode_namespace(namespace))
            .await
            .context("failed to add namespace")?;
        if let Err(err) = self.cache.set_namespace(&path, namespace) {
            warn!(path = %path.fmt_short(), "namespace cache write failed: {err:#}");
        }
        Ok(path)
    }

    /// Add `index` to the CAS and the cache.
    pub(super) async fn add_index(&self, index: &Index) -> Result<Address> {
        let path = self
            .peer
            .add(codec::encode_index(index))
            .await
            .context("failed to add index")?;
        if let Err(err) = self.cache.set_index(&path, index) {
            warn!(path = %path.fmt_short(), "index cache write failed: {err:#}");
        }
        Ok(path)
    }

    /// Fetch every fragment in `paths`, handing each to `join`.
    ///
    /// Returns the number of fragments that could not be fetched.
    pub(super) async fn join_fragments<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a Address>,
        mut join: impl FnMut(Namespace),
    ) -> usize {
        let mut failures = 0;
        for path in paths {
            self.metrics.fragment_fetches.inc();
            match self.namespace(path).await {
                Ok(namespace) => join(namespace),
                Err(err) => {
                    self.metrics.fragment_failures.inc();
                    failures += 1;
                    warn!(path = %path.fmt_short(), "fragment unavailable: {err:#}");
                }
            }
        }
        failures
    }

    fn report_invalid(&self, path: &Address, invalid: &[InvalidEntry]) {
        for entry in invalid {
            self.metrics.invalid_entries.inc();
            debug!(path = %path.fmt_short(), %entry, "skipped invalid entry");
        }
    }
}
