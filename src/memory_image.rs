//! The memory image: a log of every index link this node has observed, in
//! insertion order. On startup the engine joins all of them back into its
//! index.

use std::{fmt, sync::Arc};

use anyhow::Result;
use parking_lot::RwLock;

use crate::crdt::Link;

pub trait MemoryImage: fmt::Debug + Send + Sync + 'static {
    /// Append `link` to the log.
    fn push_index(&self, link: &Link) -> Result<()>;

    /// All logged links, oldest first.
    fn indices(&self) -> Result<Vec<Link>>;
}

/// A memory image that lives as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryImageLog {
    links: Arc<RwLock<Vec<Link>>>,
}

impl MemoryImageLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryImage for MemoryImageLog {
    fn push_index(&self, link: &Link) -> Result<()> {
        self.links.write().push(link.clone());
        Ok(())
    }

    fn indices(&self) -> Result<Vec<Link>> {
        Ok(self.links.read().clone())
    }
}
