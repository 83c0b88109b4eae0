//! Protobuf messages of the wire format.
//!
//! Field tags are part of the format and must never be renumbered.

use std::collections::BTreeMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct PointMessage {
    #[prost(string, tag = "1")]
    pub text: String,
    #[prost(string, repeated, tag = "2")]
    pub signatures: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NamespaceEntryMessage {
    #[prost(string, tag = "1")]
    pub table: String,
    #[prost(string, tag = "2")]
    pub row: String,
    #[prost(string, tag = "3")]
    pub entry: String,
    #[prost(message, repeated, tag = "4")]
    pub points: Vec<PointMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NamespaceMessage {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<NamespaceEntryMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LinkMessage {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, repeated, tag = "2")]
    pub signatures: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexEntryMessage {
    #[prost(string, tag = "1")]
    pub table: String,
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<LinkMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexMessage {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<IndexEntryMessage>,
}

pub const QUERY_SELECT: u32 = 1;
pub const QUERY_JOIN: u32 = 2;

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryMessage {
    #[prost(uint32, tag = "1")]
    pub op_code: u32,
    #[prost(string, tag = "2")]
    pub table: String,
    #[prost(message, optional, tag = "3")]
    pub join: Option<QueryJoinMessage>,
    #[prost(message, optional, tag = "4")]
    pub select: Option<QuerySelectMessage>,
    #[prost(string, repeated, tag = "5")]
    pub public_keys: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QuerySelectMessage {
    #[prost(message, optional, tag = "1")]
    pub filter: Option<QueryWhereMessage>,
    /// Zero means unlimited.
    #[prost(uint32, tag = "2")]
    pub limit: u32,
}

pub const WHERE_ALL: u32 = 0;
pub const WHERE_AND: u32 = 1;
pub const WHERE_OR: u32 = 2;
pub const WHERE_PREDICATE: u32 = 3;

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryWhereMessage {
    #[prost(uint32, tag = "1")]
    pub op_code: u32,
    #[prost(message, repeated, tag = "2")]
    pub clauses: Vec<QueryWhereMessage>,
    #[prost(message, optional, tag = "3")]
    pub predicate: Option<QueryPredicateMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryPredicateMessage {
    #[prost(uint32, tag = "1")]
    pub op_code: u32,
    #[prost(string, repeated, tag = "2")]
    pub keys: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub literals: Vec<String>,
    #[prost(bool, tag = "4")]
    pub include_row_key: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryJoinMessage {
    #[prost(message, repeated, tag = "1")]
    pub rows: Vec<QueryRowJoinMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueryRowJoinMessage {
    #[prost(string, tag = "1")]
    pub row: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub entries: BTreeMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestMessage {
    #[prost(uint32, tag = "1")]
    pub kind: u32,
    #[prost(uint32, tag = "2")]
    pub reflection: u32,
    #[prost(message, optional, tag = "3")]
    pub query: Option<QueryMessage>,
    #[prost(message, repeated, tag = "4")]
    pub replicate: Vec<LinkMessage>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseMessage {
    #[prost(string, tag = "1")]
    pub msg: String,
    #[prost(string, optional, tag = "2")]
    pub err: Option<String>,
    #[prost(uint32, tag = "3")]
    pub kind: u32,
    #[prost(string, tag = "4")]
    pub path: String,
    #[prost(message, optional, tag = "5")]
    pub namespace: Option<NamespaceMessage>,
    #[prost(message, optional, tag = "6")]
    pub index: Option<IndexMessage>,
}
