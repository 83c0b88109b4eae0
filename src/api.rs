//! Request and response envelopes exchanged with clients.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    crdt::{Index, Link, Namespace},
    query::{Query, QueryError},
};

/// What a [`Request`] asks for.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::FromRepr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum RequestKind {
    #[default]
    Noop = 0,
    Query = 1,
    Reflect = 2,
    Replicate = 3,
}

/// The kind of introspection a reflection request asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u16)]
pub enum ReflectionKind {
    #[default]
    Noop = 0,
    HeadPath = 1,
    DumpNamespace = 2,
    Index = 3,
}

/// Why a request was rejected before reaching the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown request type")]
    UnknownKind,
    #[error("query request without a query")]
    MissingQuery,
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),
    #[error("unknown reflection type")]
    UnknownReflection,
    #[error("replicate request without links")]
    NoLinks,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub reflection: ReflectionKind,
    pub query: Option<Query>,
    pub replicate: Vec<Link>,
}

impl Request {
    pub fn query(query: impl Into<Query>) -> Self {
        Self {
            kind: RequestKind::Query,
            query: Some(query.into()),
            ..Default::default()
        }
    }

    pub fn reflect(reflection: ReflectionKind) -> Self {
        Self {
            kind: RequestKind::Reflect,
            reflection,
            ..Default::default()
        }
    }

    pub fn replicate(links: impl IntoIterator<Item = Link>) -> Self {
        Self {
            kind: RequestKind::Replicate,
            replicate: links.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.kind {
            RequestKind::Noop => Err(ValidationError::UnknownKind),
            RequestKind::Query => {
                let query = self.query.as_ref().ok_or(ValidationError::MissingQuery)?;
                query.validate()?;
                Ok(())
            }
            RequestKind::Reflect => match self.reflection {
                ReflectionKind::Noop => Err(ValidationError::UnknownReflection),
                _ => Ok(()),
            },
            RequestKind::Replicate if self.replicate.is_empty() => Err(ValidationError::NoLinks),
            RequestKind::Replicate => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub msg: String,
    pub err: Option<String>,
    pub kind: RequestKind,
    /// The head address, for head reflections.
    pub path: String,
    pub namespace: Option<Namespace>,
    pub index: Option<Index>,
}

impl Response {
    pub fn ok(kind: RequestKind) -> Self {
        Self {
            msg: "ok".to_string(),
            kind,
            ..Default::default()
        }
    }

    pub fn error(kind: RequestKind, err: impl fmt::Display) -> Self {
        Self {
            msg: "error".to_string(),
            err: Some(err.to_string()),
            kind,
            ..Default::default()
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = Some(namespace);
        self
    }

    pub fn with_index(mut self, index: Index) -> Self {
        self.index = Some(index);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.err.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        peer::Address,
        query::{JoinQuery, SelectQuery},
    };

    #[test]
    fn validation() {
        assert_eq!(
            Request::default().validate(),
            Err(ValidationError::UnknownKind)
        );
        assert_eq!(
            Request {
                kind: RequestKind::Query,
                ..Default::default()
            }
            .validate(),
            Err(ValidationError::MissingQuery)
        );
        assert!(matches!(
            Request::query(JoinQuery::new("t")).validate(),
            Err(ValidationError::InvalidQuery(_))
        ));
        assert_eq!(Request::query(SelectQuery::new("t")).validate(), Ok(()));
        assert_eq!(
            Request::reflect(ReflectionKind::Noop).validate(),
            Err(ValidationError::UnknownReflection)
        );
        assert_eq!(Request::reflect(ReflectionKind::Index).validate(), Ok(()));
        assert_eq!(
            Request::replicate(Vec::<Link>::new()).validate(),
            Err(ValidationError::NoLinks)
        );
        assert_eq!(
            Request::replicate([Link::new(Address::new("a"))]).validate(),
            Ok(())
        );
    }

    #[test]
    fn kind_codes() {
        assert_eq!(RequestKind::from_repr(2), Some(RequestKind::Reflect));
        assert_eq!(RequestKind::from_repr(9), None);
        assert_eq!(ReflectionKind::from_repr(3), Some(ReflectionKind::Index));
        assert_eq!(RequestKind::Replicate.to_string(), "replicate");
    }
}
