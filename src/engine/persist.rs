//! One persist cycle, run off the actor.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::content::Content;
use crate::{
    codec,
    crdt::{Index, Lattice, Link, Namespace},
    keys::PrivateKey,
    memory_image::MemoryImage,
    peer::{DataPeer, Topic},
};

/// A snapshot of the dirty state, to be written out.
#[derive(Debug)]
pub(super) struct PersistJob<P> {
    pub(super) content: Content<P>,
    pub(super) memory_image: Arc<dyn MemoryImage>,
    pub(super) private_keys: Vec<PrivateKey>,
    pub(super) topics: Vec<Topic>,
    pub(super) working: Namespace,
    pub(super) index: Index,
}

#[derive(Debug)]
pub(super) struct Persisted {
    pub(super) head: Link,
    pub(super) index: Index,
}

impl<P: DataPeer> PersistJob<P> {
    /// Write out the snapshot and publish the new head.
    ///
    /// Fails without side effects on the replica if adding the namespace or
    /// the index fails. Memory image and publish failures are only logged.
    pub(super) async fn run(self) -> Result<Persisted> {
        let mut index = self.index;
        if !self.working.is_empty() {
            let path = self.content.add_namespace(&self.working).await?;
            let link = Link::new(path)
                .signed(&self.private_keys)
                .context("failed to sign namespace link")?;
            debug!(path = %link.path().fmt_short(), "namespace added");
            index = index.join_namespace(&link, &self.working);
        }
        let path = self.content.add_index(&index).await?;
        let head = Link::new(path)
            .signed(&self.private_keys)
            .context("failed to sign index link")?;
        debug!(head = %head.path().fmt_short(), "index added");

        if let Err(err) = self.memory_image.push_index(&head) {
            warn!("failed to log head to memory image: {err:#}");
        }
        publish(&self.content, &self.topics, &head).await;
        Ok(Persisted { head, index })
    }
}

/// Publish `head` on every topic, logging failures.
pub(super) async fn publish<P: DataPeer>(content: &Content<P>, topics: &[Topic], head: &Link) {
    let record = codec::encode_link(head);
    for topic in topics {
        match content.peer().publish(topic, record.clone()).await {
            Ok(()) => {
                content.metrics().publishes.inc();
            }
            Err(err) => {
                content.metrics().publish_failures.inc();
                warn!(%topic, "failed to publish head: {err:#}");
            }
        }
    }
}
