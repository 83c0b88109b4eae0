use std::{
    collections::{BTreeMap, btree_map},
    sync::Arc,
};

use super::{
    EntryName, Lattice, RowName, TableName,
    point::Entry,
    stream::{self, NamespaceStreamEntry},
};
use crate::keys::PublicKey;

/// A mapping from entry name to [`Entry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    entries: BTreeMap<EntryName, Entry>,
}

impl Row {
    pub fn entries(&self) -> impl Iterator<Item = (&EntryName, &Entry)> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn join_entry(&mut self, name: EntryName, entry: &Entry) {
        match self.entries.entry(name) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
            }
            btree_map::Entry::Occupied(mut slot) => {
                let joined = slot.get().join(entry);
                slot.insert(joined);
            }
        }
    }

    /// Builder variant of [`Row::join_entry`].
    pub fn with_entry(mut self, name: impl Into<EntryName>, entry: Entry) -> Self {
        self.join_entry(name.into(), &entry);
        self
    }

    fn filter_verified(&self, keys: &[PublicKey]) -> Row {
        let entries = self
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.filter_verified(keys)))
            .filter(|(_, entry)| !entry.is_empty())
            .collect();
        Row { entries }
    }
}

impl Lattice for Row {
    fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (name, entry) in &other.entries {
            out.join_entry(name.clone(), entry);
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.entries.values().all(Entry::is_empty)
    }
}

/// A mapping from row key to [`Row`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    rows: BTreeMap<RowName, Row>,
}

impl Table {
    pub fn rows(&self) -> impl Iterator<Item = (&RowName, &Row)> {
        self.rows.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Row> {
        self.rows.get(name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn join_row(&mut self, name: RowName, row: &Row) {
        match self.rows.entry(name) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(row.clone());
            }
            btree_map::Entry::Occupied(mut slot) => {
                let joined = slot.get().join(row);
                slot.insert(joined);
            }
        }
    }

    /// Builder variant of [`Table::join_row`].
    pub fn with_row(mut self, name: impl Into<RowName>, row: Row) -> Self {
        self.join_row(name.into(), &row);
        self
    }

    /// Keep the rows for which `f` returns true.
    pub fn filter_rows(&self, mut f: impl FnMut(&RowName, &Row) -> bool) -> Table {
        let rows = self
            .rows
            .iter()
            .filter(|(name, row)| f(name, row))
            .map(|(name, row)| (name.clone(), row.clone()))
            .collect();
        Table { rows }
    }

    fn filter_verified(&self, keys: &[PublicKey]) -> Table {
        let rows = self
            .rows
            .iter()
            .map(|(name, row)| (name.clone(), row.filter_verified(keys)))
            .filter(|(_, row)| !row.is_empty())
            .collect();
        Table { rows }
    }
}

impl Lattice for Table {
    fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (name, row) in &other.rows {
            out.join_row(name.clone(), row);
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.rows.values().all(Row::is_empty)
    }
}

/// The user visible data: a mapping from table name to [`Table`].
///
/// Tables are shared between clones, so cloning a namespace is shallow and a
/// join only copies the tables it modifies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    tables: BTreeMap<TableName, Arc<Table>>,
}

impl Namespace {
    pub fn tables(&self) -> impl Iterator<Item = (&TableName, &Table)> {
        self.tables.iter().map(|(name, table)| (name, table.as_ref()))
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(AsRef::as_ref)
    }

    /// Names of the tables that hold at least one point.
    pub fn table_names(&self) -> impl Iterator<Item = &TableName> {
        self.tables
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(name, _)| name)
    }

    /// Every non-empty entry in `(table, row, entry)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&TableName, &RowName, &EntryName, &Entry)> {
        self.tables.iter().flat_map(|(table_name, table)| {
            table.rows.iter().flat_map(move |(row_name, row)| {
                row.entries
                    .iter()
                    .filter(|(_, entry)| !entry.is_empty())
                    .map(move |(entry_name, entry)| (table_name, row_name, entry_name, entry))
            })
        })
    }

    /// Join `table` into a copy of this namespace.
    pub fn join_table(&self, name: TableName, table: &Table) -> Namespace {
        let mut out = self.clone();
        out.join_table_mut(name, table);
        out
    }

    /// Join `table` into this namespace in place, copying the shared table
    /// first if another namespace still refers to it.
    pub fn join_table_mut(&mut self, name: TableName, table: &Table) {
        match self.tables.entry(name) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(Arc::new(table.clone()));
            }
            btree_map::Entry::Occupied(mut slot) => {
                let current = Arc::make_mut(slot.get_mut());
                *current = current.join(table);
            }
        }
    }

    fn join_shared(&mut self, name: &TableName, table: &Arc<Table>) {
        match self.tables.get_mut(name) {
            None => {
                self.tables.insert(name.clone(), Arc::clone(table));
            }
            Some(current) if Arc::ptr_eq(current, table) => {}
            Some(current) => {
                let current = Arc::make_mut(current);
                *current = current.join(table);
            }
        }
    }

    /// The canonical form: the namespace re-read from its own stream.
    ///
    /// Drops empty tables, rows and entries.
    pub fn strip(&self) -> Namespace {
        Namespace::from_stream(self.to_stream())
    }

    /// Keep only the points verified by at least one of `keys`.
    ///
    /// An empty key set yields an empty namespace.
    pub fn filter_verified(&self, keys: &[PublicKey]) -> Namespace {
        if keys.is_empty() {
            return Namespace::default();
        }
        let tables = self
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.filter_verified(keys)))
            .filter(|(_, table)| !table.is_empty())
            .map(|(name, table)| (name, Arc::new(table)))
            .collect();
        Namespace { tables }
    }

    /// The sorted stream form of this namespace.
    pub fn to_stream(&self) -> Vec<NamespaceStreamEntry> {
        self.iter()
            .map(|(table, row, entry, points)| NamespaceStreamEntry {
                table: table.clone(),
                row: row.clone(),
                entry: entry.clone(),
                points: points.points().to_vec(),
            })
            .collect()
    }

    /// Rebuild a namespace from stream entries in any order.
    pub fn from_stream(entries: impl IntoIterator<Item = NamespaceStreamEntry>) -> Namespace {
        let entries = stream::normalize_namespace_stream(entries.into_iter().collect());
        let mut tables: BTreeMap<TableName, Table> = BTreeMap::new();
        for item in entries {
            tables
                .entry(item.table)
                .or_default()
                .rows
                .entry(item.row)
                .or_default()
                .join_entry(item.entry, &Entry::new(item.points));
        }
        let tables = tables
            .into_iter()
            .map(|(name, table)| (name, Arc::new(table)))
            .collect();
        Namespace { tables }
    }
}

impl Lattice for Namespace {
    fn join(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (name, table) in &other.tables {
            out.join_shared(name, table);
        }
        out
    }

    fn is_empty(&self) -> bool {
        self.tables.values().all(|table| table.is_empty())
    }
}
