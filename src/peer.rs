//! The content addressed store and pubsub bus a node runs on.

use std::{fmt, future::Future};

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

mod mem;

pub use self::mem::MemPeer;

/// The address of some bytes in the CAS.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address the reference peer assigns to `data`: hex of its blake3 hash.
    pub fn for_content(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The first 10 characters, for logging.
    pub fn fmt_short(&self) -> &str {
        self.0.get(..10).unwrap_or(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.fmt_short())
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A pubsub topic.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A content addressed store with a pubsub bus.
///
/// Implementations must be safe to share between tasks; the engine clones the
/// peer into every task that needs it.
pub trait DataPeer: Clone + Send + Sync + 'static {
    /// Store `data`, returning its address.
    fn add(&self, data: Bytes) -> impl Future<Output = Result<Address>> + Send;

    /// Fetch the bytes stored at `address`.
    fn cat(&self, address: &Address) -> impl Future<Output = Result<Bytes>> + Send;

    /// Publish `data` to all subscribers of `topic`.
    fn publish(&self, topic: &Topic, data: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to records published on `topic` from now on.
    fn subscribe(
        &self,
        topic: &Topic,
    ) -> impl Future<Output = Result<broadcast::Receiver<Bytes>>> + Send;
}
