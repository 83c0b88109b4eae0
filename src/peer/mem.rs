use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

use super::{Address, DataPeer, Topic};

const TOPIC_CAPACITY: usize = 256;

/// An in-process [`DataPeer`].
///
/// Clones share the same blocks and topics, so several nodes in one process
/// can replicate through a single `MemPeer`. Faults can be switched on to
/// exercise failure handling.
#[derive(Debug, Clone, Default)]
pub struct MemPeer {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    blocks: RwLock<HashMap<Address, Bytes>>,
    topics: Mutex<HashMap<Topic, broadcast::Sender<Bytes>>>,
    fail_add: AtomicBool,
    fail_cat: AtomicBool,
    cat_delay: Mutex<Option<Duration>>,
}

impl MemPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `add` fail until switched off again.
    pub fn set_fail_add(&self, fail: bool) {
        self.inner.fail_add.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `cat` fail until switched off again.
    pub fn set_fail_cat(&self, fail: bool) {
        self.inner.fail_cat.store(fail, Ordering::SeqCst);
    }

    /// Delay every `cat` by `delay`.
    pub fn set_cat_delay(&self, delay: Option<Duration>) {
        *self.inner.cat_delay.lock() = delay;
    }

    /// Number of blocks stored.
    pub fn len(&self) -> usize {
        self.inner.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.blocks.read().is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.inner.blocks.read().contains_key(address)
    }

    fn sender(&self, topic: &Topic) -> broadcast::Sender<Bytes> {
        self.inner
            .topics
            .lock()
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl DataPeer for MemPeer {
    async fn add(&self, data: Bytes) -> Result<Address> {
        if self.inner.fail_add.load(Ordering::SeqCst) {
            bail!("add failed: fault injected");
        }
        let address = Address::for_content(&data);
        trace!(address = %address.fmt_short(), len = data.len(), "add");
        self.inner
            .blocks
            .write()
            .entry(address.clone())
            .or_insert(data);
        Ok(address)
    }

    async fn cat(&self, address: &Address) -> Result<Bytes> {
        let delay = *self.inner.cat_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_cat.load(Ordering::SeqCst) {
            bail!("cat failed: fault injected");
        }
        self.inner
            .blocks
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("no content at {address}"))
    }

    async fn publish(&self, topic: &Topic, data: Bytes) -> Result<()> {
        // no subscribers is not an error
        let receivers = self.sender(topic).send(data).unwrap_or(0);
        trace!(%topic, receivers, "publish");
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<broadcast::Receiver<Bytes>> {
        Ok(self.sender(topic).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn add_cat() -> TestResult {
        let peer = MemPeer::new();
        let address = peer.add(Bytes::from_static(b"hello")).await?;
        assert_eq!(address, Address::for_content(b"hello"));
        assert_eq!(peer.cat(&address).await?, Bytes::from_static(b"hello"));
        assert!(peer.cat(&Address::new("missing")).await.is_err());

        // adding twice is a no-op
        peer.add(Bytes::from_static(b"hello")).await?;
        assert_eq!(peer.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn clones_share_state() -> TestResult {
        let a = MemPeer::new();
        let b = a.clone();
        let address = a.add(Bytes::from_static(b"shared")).await?;
        assert!(b.contains(&address));
        Ok(())
    }

    #[tokio::test]
    async fn publish_subscribe() -> TestResult {
        let peer = MemPeer::new();
        let topic = Topic::new("t");
        // publishing without subscribers succeeds
        peer.publish(&topic, Bytes::from_static(b"lost")).await?;

        let mut rx = peer.subscribe(&topic).await?;
        peer.publish(&topic, Bytes::from_static(b"one")).await?;
        peer.publish(&Topic::new("other"), Bytes::from_static(b"two")).await?;
        assert_eq!(rx.recv().await?, Bytes::from_static(b"one"));
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn fault_injection() -> TestResult {
        let peer = MemPeer::new();
        peer.set_fail_add(true);
        assert!(peer.add(Bytes::from_static(b"x")).await.is_err());
        peer.set_fail_add(false);
        let address = peer.add(Bytes::from_static(b"x")).await?;

        peer.set_fail_cat(true);
        assert!(peer.cat(&address).await.is_err());
        peer.set_fail_cat(false);
        assert!(peer.cat(&address).await.is_ok());
        Ok(())
    }
}
