//! The stream form: flat, sorted, de-duplicated sequences.
//!
//! Canonical encodings are written from the stream form, so its order is a
//! total order on the concrete strings and bytes involved.

use serde::{Deserialize, Serialize};

use super::{EntryName, Lattice, RowName, TableName, index::Link, point::Entry, point::Point};

/// One `(table, row, entry)` cell with its points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStreamEntry {
    pub table: TableName,
    pub row: RowName,
    pub entry: EntryName,
    pub points: Vec<Point>,
}

impl NamespaceStreamEntry {
    fn key(&self) -> (&TableName, &RowName, &EntryName) {
        (&self.table, &self.row, &self.entry)
    }
}

/// The links recorded for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStreamEntry {
    pub table: TableName,
    pub links: Vec<Link>,
}

/// Sort by `(table, row, entry)`, merge cells with the same key and drop cells
/// without points. Points within a cell end up sorted by text, with their
/// signatures sorted and unique.
pub fn normalize_namespace_stream(
    mut entries: Vec<NamespaceStreamEntry>,
) -> Vec<NamespaceStreamEntry> {
    entries.sort_by(|a, b| a.key().cmp(&b.key()));
    let mut out: Vec<NamespaceStreamEntry> = Vec::with_capacity(entries.len());
    for item in entries {
        if item.points.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.key() == item.key() => {
                let joined = Entry::new(std::mem::take(&mut last.points)).join(&Entry::new(item.points));
                last.points = joined.points().to_vec();
            }
            _ => {
                let points = Entry::new(item.points).points().to_vec();
                out.push(NamespaceStreamEntry { points, ..item });
            }
        }
    }
    out
}

/// Sort by table, merge entries for the same table and drop tables without
/// links. Links end up sorted by path with their signatures sorted and unique.
pub fn normalize_index_stream(mut entries: Vec<IndexStreamEntry>) -> Vec<IndexStreamEntry> {
    entries.sort_by(|a, b| a.table.cmp(&b.table));
    let mut out: Vec<IndexStreamEntry> = Vec::with_capacity(entries.len());
    for item in entries {
        if item.links.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.table == item.table => {
                last.links.extend(item.links);
                last.links = Link::coalesce(std::mem::take(&mut last.links));
            }
            _ => {
                let links = Link::coalesce(item.links);
                out.push(IndexStreamEntry {
                    table: item.table,
                    links,
                });
            }
        }
    }
    out
}

/// Join two namespace streams, keeping every signature from both.
pub fn merge_namespace_streams(
    a: &[NamespaceStreamEntry],
    b: &[NamespaceStreamEntry],
) -> Vec<NamespaceStreamEntry> {
    normalize_namespace_stream(a.iter().chain(b).cloned().collect())
}

/// Join two index streams, keeping every signature from both.
pub fn merge_index_streams(a: &[IndexStreamEntry], b: &[IndexStreamEntry]) -> Vec<IndexStreamEntry> {
    normalize_index_stream(a.iter().chain(b).cloned().collect())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::crdt::{Namespace, proptests};

    fn cell(table: &str, row: &str, entry: &str, points: Vec<Point>) -> NamespaceStreamEntry {
        NamespaceStreamEntry {
            table: table.into(),
            row: row.into(),
            entry: entry.into(),
            points,
        }
    }

    #[test]
    fn normalize_sorts_and_merges() {
        let stream = vec![
            cell("t", "r2", "e", vec![Point::unsigned("x")]),
            cell("t", "r1", "e", vec![Point::unsigned("b")]),
            cell("t", "r1", "e", vec![Point::unsigned("a"), Point::unsigned("b")]),
            cell("s", "r", "e", vec![]),
        ];
        let normalized = normalize_namespace_stream(stream);
        assert_eq!(
            normalized,
            vec![
                cell("t", "r1", "e", vec![Point::unsigned("a"), Point::unsigned("b")]),
                cell("t", "r2", "e", vec![Point::unsigned("x")]),
            ]
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn merge_agrees_with_join(a in proptests::namespace(), b in proptests::namespace()) {
            let merged = merge_namespace_streams(&a.to_stream(), &b.to_stream());
            prop_assert_eq!(merged, a.join(&b).to_stream());
        }

        #[test]
        fn index_merge_agrees_with_join(a in proptests::index(), b in proptests::index()) {
            let merged = merge_index_streams(&a.to_stream(), &b.to_stream());
            prop_assert_eq!(merged, a.join(&b).to_stream());
        }

        #[test]
        fn from_stream_ignores_order(stream in proptests::namespace_stream()) {
            let mut reversed = stream.clone();
            reversed.reverse();
            prop_assert_eq!(Namespace::from_stream(stream), Namespace::from_stream(reversed));
        }
    }
}
