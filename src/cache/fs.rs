use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, backends::InMemoryBackend};
use tracing::{debug, info};

use super::{HeadCache, IndexCache, NamespaceCache};
use crate::{
    codec,
    crdt::{Index, Link, Namespace},
    memory_image::MemoryImage,
    peer::Address,
};

type BytesTable = TableDefinition<'static, &'static str, &'static [u8]>;

const HEAD_TABLE: BytesTable = TableDefinition::new("head-1");
const INDEX_TABLE: BytesTable = TableDefinition::new("index-1");
const NAMESPACE_TABLE: BytesTable = TableDefinition::new("namespace-1");
const MEMORY_IMAGE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("memory-image-1");

const HEAD_KEY: &str = "head";

/// Caches and memory image backed by a single redb database.
///
/// Values are stored in their canonical encoding. Clones share the database.
#[derive(Debug, Clone)]
pub struct PersistentCache {
    db: Arc<Database>,
}

impl PersistentCache {
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading cache database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory at {}", path.display())
            })?;
        }
        let db = Database::builder()
            .create(path)
            .context("failed to open cache database")?;
        Self::open(db)
    }

    pub fn in_memory() -> Result<Self> {
        info!("using in-memory cache database");
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::open(db)
    }

    pub fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(HEAD_TABLE)?;
            let _table = write_tx.open_table(INDEX_TABLE)?;
            let _table = write_tx.open_table(NAMESPACE_TABLE)?;
            let _table = write_tx.open_table(MEMORY_IMAGE_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get(&self, def: BytesTable, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(def)?;
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    /// Insert unless `key` is already present.
    fn insert_new(&self, def: BytesTable, key: &str, value: &[u8]) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(def)?;
            if table.get(key)?.is_some() {
                return Ok(());
            }
            table.insert(key, value)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl HeadCache for PersistentCache {
    fn head(&self) -> Result<Option<Link>> {
        let Some(bytes) = self.get(HEAD_TABLE, HEAD_KEY)? else {
            return Ok(None);
        };
        let link = codec::decode_link(&bytes).context("corrupt head in cache")?;
        Ok(Some(link))
    }

    fn set_head(&self, link: &Link) -> Result<()> {
        let bytes = codec::encode_link(link);
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(HEAD_TABLE)?;
            table.insert(HEAD_KEY, bytes.as_ref())?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl IndexCache for PersistentCache {
    fn get_index(&self, path: &Address) -> Result<Option<Index>> {
        let Some(bytes) = self.get(INDEX_TABLE, path.as_str())? else {
            return Ok(None);
        };
        let (index, invalid) = codec::decode_index(&bytes).context("corrupt index in cache")?;
        if !invalid.is_empty() {
            debug!(path = %path.fmt_short(), invalid = invalid.len(), "cached index has invalid entries");
        }
        Ok(Some(index))
    }

    fn set_index(&self, path: &Address, index: &Index) -> Result<()> {
        self.insert_new(INDEX_TABLE, path.as_str(), &codec::encode_index(index))
    }
}

impl NamespaceCache for PersistentCache {
    fn get_namespace(&self, path: &Address) -> Result<Option<Namespace>> {
        let Some(bytes) = self.get(NAMESPACE_TABLE, path.as_str())? else {
            return Ok(None);
        };
        let (namespace, invalid) =
            codec::decode_namespace(&bytes).context("corrupt namespace in cache")?;
        if !invalid.is_empty() {
            debug!(path = %path.fmt_short(), invalid = invalid.len(), "cached namespace has invalid entries");
        }
        Ok(Some(namespace))
    }

    fn set_namespace(&self, path: &Address, namespace: &Namespace) -> Result<()> {
        self.insert_new(NAMESPACE_TABLE, path.as_str(), &codec::encode_namespace(namespace))
    }
}

impl MemoryImage for PersistentCache {
    fn push_index(&self, link: &Link) -> Result<()> {
        let bytes = codec::encode_link(link);
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(MEMORY_IMAGE_TABLE)?;
            let next = match table.last()? {
                Some((key, _)) => key.value() + 1,
                None => 0,
            };
            table.insert(next, bytes.as_ref())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn indices(&self) -> Result<Vec<Link>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(MEMORY_IMAGE_TABLE)?;
        let mut links = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            let link = codec::decode_link(value.value()).context("corrupt memory image entry")?;
            links.push(link);
        }
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;
    use crate::{
        crdt::{Entry, Point, Row, Table},
        keys::PrivateKey,
    };

    fn namespace() -> Namespace {
        let table = Table::default().with_row(
            "alice",
            Row::default().with_entry("email", Entry::single(Point::unsigned("a@x"))),
        );
        Namespace::default().join_table("users".into(), &table)
    }

    #[test]
    fn survives_reopen() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("db").join("cache.redb");
        let key = PrivateKey::generate();
        let head = Link::new(Address::new("head")).signed(&[key])?;
        let ns = namespace();
        let ns_path = Address::for_content(&codec::encode_namespace(&ns));
        let index = Index::default().join_namespace(&Link::new(ns_path.clone()), &ns);
        {
            let cache = PersistentCache::persistent(&path)?;
            cache.set_head(&head)?;
            cache.set_namespace(&ns_path, &ns)?;
            cache.set_index(&Address::new("index"), &index)?;
            cache.push_index(&head)?;
            cache.push_index(&Link::new(Address::new("older")))?;
        }
        let cache = PersistentCache::persistent(&path)?;
        assert_eq!(cache.head()?, Some(head.clone()));
        assert_eq!(cache.get_namespace(&ns_path)?, Some(ns));
        assert_eq!(cache.get_index(&Address::new("index"))?, Some(index));
        assert_eq!(
            cache.indices()?,
            vec![head, Link::new(Address::new("older"))]
        );
        Ok(())
    }

    #[test]
    fn set_is_idempotent() -> TestResult {
        let cache = PersistentCache::in_memory()?;
        let path = Address::new("p");
        cache.set_namespace(&path, &namespace())?;
        cache.set_namespace(&path, &Namespace::default())?;
        assert_eq!(cache.get_namespace(&path)?, Some(namespace()));
        assert_eq!(cache.get_index(&path)?, None);
        Ok(())
    }
}
