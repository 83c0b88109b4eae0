//! Join semi-lattices for the replicated data.
//!
//! A [`Namespace`] maps table names to [`Table`]s of [`Row`]s of [`Entry`]s,
//! and each entry is a set of signed [`Point`]s. An [`Index`] maps table names
//! to the [`Link`]s of the namespace fragments that contain the table.
//!
//! Every type grows monotonically under [`Lattice::join`]; nothing is ever
//! removed from a value by a join.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::peer::Address;

mod index;
mod namespace;
mod point;
pub mod stream;

pub use self::{
    index::{Index, Link},
    namespace::{Namespace, Row, Table},
    point::{Entry, Point},
};

/// A join semi-lattice.
///
/// `join` must be commutative, associative and idempotent, with
/// [`Lattice::empty`] as its identity.
pub trait Lattice: Default + PartialEq + Sized {
    /// The bottom element.
    fn empty() -> Self {
        Self::default()
    }

    /// The least upper bound of `self` and `other`.
    fn join(&self, other: &Self) -> Self;

    /// Whether the value holds no points or links.
    fn is_empty(&self) -> bool;
}

/// Errors from joining two values with different identities.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("cannot join points with different text: {0:?} != {1:?}")]
    TextMismatch(PointText, PointText),
    #[error("cannot join links with different paths: {0} != {1}")]
    PathMismatch(Address, Address),
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

name_type!(
    /// Name of a table in a [`Namespace`].
    TableName
);
name_type!(
    /// Key of a row within a [`Table`].
    RowName
);
name_type!(
    /// Name of an entry within a [`Row`].
    EntryName
);
name_type!(
    /// The value carried by a [`Point`].
    PointText
);
