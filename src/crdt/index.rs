use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{
    JoinError, Lattice, TableName,
    namespace::Namespace,
    stream::{self, IndexStreamEntry},
};
use crate::{
    keys::{KeyError, PrivateKey, PublicKey, Signature, order_signatures},
    peer::Address,
};

/// A signed reference to content in the CAS.
///
/// Links are identified by their path. Signatures are made over the bytes of
/// the path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Link {
    path: Address,
    signatures: Vec<Signature>,
}

impl Link {
    pub fn new(path: Address) -> Self {
        Self {
            path,
            signatures: Vec::new(),
        }
    }

    pub fn with_signatures(mut self, signatures: impl IntoIterator<Item = Signature>) -> Self {
        self.signatures.extend(signatures);
        self.signatures = order_signatures(std::mem::take(&mut self.signatures));
        self
    }

    /// Add a signature by each of `keys`.
    pub fn signed(self, keys: &[PrivateKey]) -> Result<Self, KeyError> {
        let signatures = keys
            .iter()
            .map(|key| key.sign(self.path.as_str().as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_signatures(signatures))
    }

    pub fn path(&self) -> &Address {
        &self.path
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn join(&self, other: &Link) -> Result<Link, JoinError> {
        if self.path != other.path {
            return Err(JoinError::PathMismatch(
                self.path.clone(),
                other.path.clone(),
            ));
        }
        Ok(self.clone().with_signatures(other.signatures.iter().copied()))
    }

    /// True iff any signature verifies under any of `keys`.
    pub fn is_verified_by_any(&self, keys: &[PublicKey]) -> bool {
        let msg = self.path.as_str().as_bytes();
        self.signatures
            .iter()
            .any(|sig| keys.iter().any(|key| key.verify(msg, sig)))
    }

    /// Sort by path and merge links that share a path.
    pub(crate) fn coalesce(mut links: Vec<Link>) -> Vec<Link> {
        links.sort_by(|a, b| a.path.cmp(&b.path));
        let mut out: Vec<Link> = Vec::with_capacity(links.len());
        for link in links {
            match out.last_mut() {
                Some(last) if last.path == link.path => {
                    last.signatures.extend(link.signatures);
                    last.signatures = order_signatures(std::mem::take(&mut last.signatures));
                }
                _ => out.push(Link {
                    signatures: order_signatures(link.signatures),
                    path: link.path,
                }),
            }
        }
        out
    }
}

/// A mapping from table name to the links of the namespace fragments that
/// contain the table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    tables: BTreeMap<TableName, Vec<Link>>,
}

impl Index {
    /// Call `f` for every link recorded under `table`, in path order.
    pub fn for_table(&self, table: &str, mut f: impl FnMut(&Link)) {
        for link in self.links(table) {
            f(link)
        }
    }

    pub fn links(&self, table: &str) -> &[Link] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn tables(&self) -> impl Iterator<Item = (&TableName, &[Link])> {
        self.tables
            .iter()
            .map(|(name, links)| (name, links.as_slice()))
    }

    /// Every distinct fragment address, across all tables.
    pub fn addresses(&self) -> BTreeSet<&Address> {
        self.tables
            .values()
            .flat_map(|links| links.iter().map(Link::path))
            .collect()
    }

    /// Record `link` under `table`.
    pub fn join_link(&mut self, table: TableName, link: &Link) {
        let links = self.tables.entry(table).or_default();
        match links.binary_search_by(|l| l.path.cmp(&link.path)) {
            Ok(i) => {
                let joined = links[i].clone().with_signatures(link.signatures.iter().copied());
                links[i] = joined;
            }
            Err(i) => links.insert(i, link.clone()),
        }
    }

    /// Record `link` under every table `namespace` holds points for.
    pub fn join_namespace(&self, link: &Link, namespace: &Namespace) -> Index {
        let mut out = self.clone();
        for table in namespace.table_names() {
            out.join_link(table.clone(), link);
        }
        out
    }

    pub fn to_stream(&self) -> Vec<IndexStreamEntry> {
        self.tables
            .iter()
            .filter(|(_, links)| !links.is_empty())
            .map(|(table, links)| IndexStreamEntry {
                table: table.clone(),
                links: links.clone(),
            })
            .collect()
    }

    pub fn from_stream(entries: impl IntoIterator<Item = IndexStreamEntry>) -> Index {
        let tables = stream::normalize_index_stream(entries.into_iter().collect())
            .into_iter()
            .map(|entry| (entry.table, entry.links))
            .collect();
        Index { tables }
    }
}

impl Lattice for Index {
    fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (table, links) in &other.tables {
            for link in links {
                out.join_link(table.clone(), link);
            }
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.tables.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{Entry, Point, Row, Table};

    fn namespace(tables: &[&str]) -> Namespace {
        let table = Table::default().with_row(
            "r",
            Row::default().with_entry("e", Entry::single(Point::unsigned("v"))),
        );
        let mut ns = Namespace::default();
        for name in tables {
            ns.join_table_mut(TableName::new(*name), &table);
        }
        ns.join_table_mut("empty".into(), &Table::default());
        ns
    }

    #[test]
    fn join_namespace_adds_link_per_table() {
        let link = Link::new(Address::new("ns1"));
        let index = Index::default().join_namespace(&link, &namespace(&["users", "posts"]));
        assert_eq!(index.links("users"), &[link.clone()]);
        assert_eq!(index.links("posts"), &[link.clone()]);
        assert!(index.links("empty").is_empty());
        assert!(index.links("missing").is_empty());

        let other = Link::new(Address::new("ns0"));
        let index = index.join_namespace(&other, &namespace(&["users"]));
        let mut seen = Vec::new();
        index.for_table("users", |l| seen.push(l.path().to_string()));
        assert_eq!(seen, vec!["ns0", "ns1"]);
        assert_eq!(index.addresses().len(), 2);
    }

    #[test]
    fn links_join_signatures() {
        let k1 = PrivateKey::generate();
        let k2 = PrivateKey::generate();
        let path = Address::new("idx");
        let a = Link::new(path.clone()).signed(&[k1.clone()]).unwrap();
        let b = Link::new(path).signed(&[k2.clone()]).unwrap();
        let mut index = Index::default();
        index.join_link("t".into(), &a);
        index.join_link("t".into(), &b);
        let links = index.links("t");
        assert_eq!(links.len(), 1);
        assert!(links[0].is_verified_by_any(&[k1.public_key()]));
        assert!(links[0].is_verified_by_any(&[k2.public_key()]));

        let c = Link::new(Address::new("other"));
        assert!(matches!(a.join(&c), Err(JoinError::PathMismatch(..))));
    }

    #[test]
    fn link_verification() {
        let key = PrivateKey::generate();
        let link = Link::new(Address::new("idx")).signed(&[key.clone()]).unwrap();
        assert!(link.is_verified_by_any(&[key.public_key()]));
        assert!(!link.is_verified_by_any(&[PrivateKey::generate().public_key()]));
        assert!(!Link::new(Address::new("idx")).is_verified_by_any(&[key.public_key()]));
    }
}
