//! Content addressed caches in front of the CAS.
//!
//! The head cache holds a single slot with the latest head [`Link`]. The index
//! and namespace caches map CAS addresses to decoded values; since addresses
//! are content hashes, setting the same address twice is a no-op.

use std::fmt;

use anyhow::Result;

use crate::{
    crdt::{Index, Link, Namespace},
    peer::Address,
};

mod fs;
mod memory;

pub use self::{fs::PersistentCache, memory::MemoryCache};

pub trait HeadCache: fmt::Debug + Send + Sync + 'static {
    fn head(&self) -> Result<Option<Link>>;

    fn set_head(&self, link: &Link) -> Result<()>;
}

pub trait IndexCache: fmt::Debug + Send + Sync + 'static {
    fn get_index(&self, path: &Address) -> Result<Option<Index>>;

    fn set_index(&self, path: &Address, index: &Index) -> Result<()>;
}

pub trait NamespaceCache: fmt::Debug + Send + Sync + 'static {
    fn get_namespace(&self, path: &Address) -> Result<Option<Namespace>>;

    fn set_namespace(&self, path: &Address, namespace: &Namespace) -> Result<()>;
}

/// All three caches in one.
pub trait Cache: HeadCache + IndexCache + NamespaceCache {}

impl<T: HeadCache + IndexCache + NamespaceCache> Cache for T {}
