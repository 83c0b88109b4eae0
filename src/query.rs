//! The query AST consumed by the replica engine.
//!
//! Queries are built programmatically or decoded from the wire; there is no
//! text syntax. A [`Query::Select`] reads rows from a table, a [`Query::Join`]
//! writes rows into it.

use std::collections::BTreeMap;

use crate::{
    crdt::{Entry, EntryName, PointText, Row, RowName, TableName},
    keys::PublicKey,
};

/// Structural problems found by [`Query::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("query has no table")]
    MissingTable,
    #[error("join query has no rows")]
    NoRows,
    #[error("join row has no key")]
    MissingRowKey,
    #[error("join row {0} has no entries")]
    NoEntries(RowName),
    #[error("join row {0} has an entry without a name")]
    MissingEntryName(RowName),
    #[error("predicate needs at least two values to compare")]
    TooFewValues,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Select(SelectQuery),
    Join(JoinQuery),
}

impl From<SelectQuery> for Query {
    fn from(value: SelectQuery) -> Self {
        Self::Select(value)
    }
}

impl From<JoinQuery> for Query {
    fn from(value: JoinQuery) -> Self {
        Self::Join(value)
    }
}

impl Query {
    /// The table the query reads or writes.
    pub fn table(&self) -> &TableName {
        match self {
            Query::Select(select) => &select.table,
            Query::Join(join) => &join.table,
        }
    }

    pub fn public_keys(&self) -> &[PublicKey] {
        match self {
            Query::Select(select) => &select.public_keys,
            Query::Join(join) => &join.public_keys,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Query::Join(_))
    }

    pub fn accept<V: QueryVisitor>(&self, visitor: &mut V) -> V::Output {
        match self {
            Query::Select(select) => visitor.visit_select(select),
            Query::Join(join) => visitor.visit_join(join),
        }
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        self.accept(&mut Validator)
    }
}

/// Double dispatch over the query variants.
pub trait QueryVisitor {
    type Output;

    fn visit_select(&mut self, select: &SelectQuery) -> Self::Output;
    fn visit_join(&mut self, join: &JoinQuery) -> Self::Output;
}

struct Validator;

impl QueryVisitor for Validator {
    type Output = Result<(), QueryError>;

    fn visit_select(&mut self, select: &SelectQuery) -> Self::Output {
        if select.table.is_empty() {
            return Err(QueryError::MissingTable);
        }
        select.filter.validate()
    }

    fn visit_join(&mut self, join: &JoinQuery) -> Self::Output {
        if join.table.is_empty() {
            return Err(QueryError::MissingTable);
        }
        if join.rows.is_empty() {
            return Err(QueryError::NoRows);
        }
        for row in &join.rows {
            if row.row.is_empty() {
                return Err(QueryError::MissingRowKey);
            }
            if row.entries.is_empty() {
                return Err(QueryError::NoEntries(row.row.clone()));
            }
            if row.entries.keys().any(EntryName::is_empty) {
                return Err(QueryError::MissingEntryName(row.row.clone()));
            }
        }
        Ok(())
    }
}

/// Read rows of `table` matching `filter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    pub table: TableName,
    pub filter: Where,
    /// Maximum number of stream entries returned. `None` is unlimited.
    pub limit: Option<u32>,
    /// When non-empty, only points signed by one of these keys are returned.
    pub public_keys: Vec<PublicKey>,
}

impl SelectQuery {
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            filter: Where::All,
            limit: None,
            public_keys: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = filter;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn public_keys(mut self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.public_keys = keys.into_iter().collect();
        self
    }
}

/// Write `rows` into `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinQuery {
    pub table: TableName,
    pub rows: Vec<RowJoin>,
    /// Keys to sign the written points with. Empty means every private key
    /// in the node's key store.
    pub public_keys: Vec<PublicKey>,
}

impl JoinQuery {
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            rows: Vec::new(),
            public_keys: Vec::new(),
        }
    }

    pub fn row(mut self, row: RowJoin) -> Self {
        self.rows.push(row);
        self
    }

    pub fn public_keys(mut self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        self.public_keys = keys.into_iter().collect();
        self
    }
}

/// One row of a [`JoinQuery`]: a point text per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowJoin {
    pub row: RowName,
    pub entries: BTreeMap<EntryName, PointText>,
}

impl RowJoin {
    pub fn new(row: impl Into<RowName>) -> Self {
        Self {
            row: row.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn entry(mut self, name: impl Into<EntryName>, text: impl Into<PointText>) -> Self {
        self.entries.insert(name.into(), text.into());
        self
    }
}

/// A predicate tree over the rows of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Where {
    /// Matches every row.
    All,
    /// Matches when every clause matches. An empty list matches nothing.
    And(Vec<Where>),
    /// Matches when any clause matches.
    Or(Vec<Where>),
    Predicate(Predicate),
}

impl Where {
    /// Row key equals `literal`.
    pub fn row_key_eq(literal: impl Into<String>) -> Self {
        Self::Predicate(Predicate {
            op: PredicateOp::StrEq,
            keys: Vec::new(),
            literals: vec![literal.into()],
            include_row_key: true,
        })
    }

    /// Entry `name` holds a point with text `literal`.
    pub fn entry_eq(name: impl Into<EntryName>, literal: impl Into<String>) -> Self {
        Self::Predicate(Predicate {
            op: PredicateOp::StrEq,
            keys: vec![name.into()],
            literals: vec![literal.into()],
            include_row_key: false,
        })
    }

    /// Entry `name` holds no point with text `literal`.
    pub fn entry_neq(name: impl Into<EntryName>, literal: impl Into<String>) -> Self {
        Self::Predicate(Predicate {
            op: PredicateOp::StrNeq,
            keys: vec![name.into()],
            literals: vec![literal.into()],
            include_row_key: false,
        })
    }

    pub fn matches(&self, row_key: &RowName, row: &Row) -> bool {
        match self {
            Where::All => true,
            Where::And(clauses) => {
                !clauses.is_empty() && clauses.iter().all(|c| c.matches(row_key, row))
            }
            Where::Or(clauses) => clauses.iter().any(|c| c.matches(row_key, row)),
            Where::Predicate(predicate) => predicate.matches(row_key, row),
        }
    }

    fn validate(&self) -> Result<(), QueryError> {
        match self {
            Where::All => Ok(()),
            Where::And(clauses) | Where::Or(clauses) => {
                clauses.iter().try_for_each(Where::validate)
            }
            Where::Predicate(predicate) => predicate.validate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[repr(u8)]
pub enum PredicateOp {
    StrEq = 1,
    StrNeq = 2,
}

/// Compares the values of some entries, some literals and optionally the row
/// key.
///
/// `StrEq` holds when there is a single string equal to every literal, to the
/// row key if included, and to the text of some point in every named entry.
/// `StrNeq` is its negation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub op: PredicateOp,
    pub keys: Vec<EntryName>,
    pub literals: Vec<String>,
    pub include_row_key: bool,
}

impl Predicate {
    pub fn matches(&self, row_key: &RowName, row: &Row) -> bool {
        let equal = self.str_eq(row_key, row);
        match self.op {
            PredicateOp::StrEq => equal,
            PredicateOp::StrNeq => !equal,
        }
    }

    fn str_eq(&self, row_key: &RowName, row: &Row) -> bool {
        let mut values: Vec<&str> = self.literals.iter().map(String::as_str).collect();
        if self.include_row_key {
            values.push(row_key.as_str());
        }
        let mut entries = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            match row.get(key.as_str()) {
                Some(entry) => entries.push(entry),
                None => return false,
            }
        }
        let in_all = |text: &str| entries.iter().all(|e: &&Entry| e.contains_text(text));
        match values.split_first() {
            Some((first, rest)) => rest.iter().all(|v| v == first) && in_all(*first),
            None => match entries.split_first() {
                Some((first, _)) => first
                    .points()
                    .iter()
                    .any(|point| in_all(point.text().as_str())),
                None => false,
            },
        }
    }

    fn validate(&self) -> Result<(), QueryError> {
        let count = self.keys.len() + self.literals.len() + usize::from(self.include_row_key);
        if count < 2 {
            return Err(QueryError::TooFewValues);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Point;

    fn row(pairs: &[(&str, &[&str])]) -> Row {
        let mut row = Row::default();
        for (name, texts) in pairs {
            let entry = Entry::new(texts.iter().map(|t| Point::unsigned(*t)));
            row.join_entry(EntryName::new(*name), &entry);
        }
        row
    }

    #[test]
    fn row_key_predicate() {
        let key = RowName::new("alice");
        let r = row(&[("email", &["a@x"])]);
        assert!(Where::row_key_eq("alice").matches(&key, &r));
        assert!(!Where::row_key_eq("bob").matches(&key, &r));
    }

    #[test]
    fn entry_predicates() {
        let key = RowName::new("alice");
        let r = row(&[("email", &["a@x", "alice@x"]), ("alt", &["alice@x"])]);
        assert!(Where::entry_eq("email", "a@x").matches(&key, &r));
        assert!(!Where::entry_eq("email", "b@x").matches(&key, &r));
        assert!(!Where::entry_eq("missing", "a@x").matches(&key, &r));
        assert!(Where::entry_neq("email", "b@x").matches(&key, &r));

        // two entries sharing a value, no literals
        let shared = Where::Predicate(Predicate {
            op: PredicateOp::StrEq,
            keys: vec!["email".into(), "alt".into()],
            literals: vec![],
            include_row_key: false,
        });
        assert!(shared.matches(&key, &r));
    }

    #[test]
    fn conflicting_literals_never_match() {
        let key = RowName::new("a");
        let p = Where::Predicate(Predicate {
            op: PredicateOp::StrEq,
            keys: vec![],
            literals: vec!["a".into(), "b".into()],
            include_row_key: false,
        });
        assert!(!p.matches(&key, &Row::default()));
    }

    #[test]
    fn boolean_tree() {
        let key = RowName::new("alice");
        let r = row(&[("email", &["a@x"])]);
        let yes = Where::row_key_eq("alice");
        let no = Where::row_key_eq("bob");
        assert!(Where::All.matches(&key, &r));
        assert!(!Where::And(vec![]).matches(&key, &r));
        assert!(!Where::Or(vec![]).matches(&key, &r));
        assert!(Where::And(vec![yes.clone(), yes.clone()]).matches(&key, &r));
        assert!(!Where::And(vec![yes.clone(), no.clone()]).matches(&key, &r));
        assert!(Where::Or(vec![no.clone(), yes]).matches(&key, &r));
        assert!(!Where::Or(vec![no]).matches(&key, &r));
    }

    #[test]
    fn validation() {
        assert_eq!(Query::from(SelectQuery::new("users")).validate(), Ok(()));
        assert_eq!(
            Query::from(SelectQuery::new("")).validate(),
            Err(QueryError::MissingTable)
        );
        let lonely = Where::Predicate(Predicate {
            op: PredicateOp::StrEq,
            keys: vec![],
            literals: vec!["x".into()],
            include_row_key: false,
        });
        assert_eq!(
            Query::from(SelectQuery::new("users").filter(Where::Or(vec![lonely]))).validate(),
            Err(QueryError::TooFewValues)
        );

        assert_eq!(
            Query::from(JoinQuery::new("users")).validate(),
            Err(QueryError::NoRows)
        );
        assert_eq!(
            Query::from(JoinQuery::new("users").row(RowJoin::new("alice"))).validate(),
            Err(QueryError::NoEntries("alice".into()))
        );
        let ok = JoinQuery::new("users").row(RowJoin::new("alice").entry("email", "a@x"));
        assert_eq!(Query::from(ok).validate(), Ok(()));
    }
}
