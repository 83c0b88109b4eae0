//! The canonical codec.
//!
//! Lattice values are encoded from their stream form, so equal values always
//! encode to the same bytes and therefore the same CAS address. Decoding is
//! lenient below the message level: a point or link carrying a malformed
//! signature is skipped and reported as an [`InvalidEntry`], and the rest of
//! the value is still produced. Only a message that cannot be parsed at all is
//! an error.

use std::fmt;

use bytes::Bytes;
use prost::Message;

use crate::{
    api::{ReflectionKind, Request, RequestKind, Response},
    crdt::{
        Index, Link, Namespace, Point,
        stream::{IndexStreamEntry, NamespaceStreamEntry},
    },
    keys::{PublicKey, Signature},
    peer::Address,
    query::{JoinQuery, Predicate, PredicateOp, Query, RowJoin, SelectQuery, Where},
};

pub mod pb;

/// Structural decode failures.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("malformed text: {0}")]
    Text(#[from] serde_json::Error),
}

impl DecodeError {
    fn invalid(field: &'static str, reason: impl fmt::Display) -> Self {
        Self::InvalidField {
            field,
            reason: reason.to_string(),
        }
    }
}

/// A sub-entry that was dropped while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntry {
    /// Where in the value the entry was found, e.g. `users/alice/email`.
    pub location: String,
    pub reason: String,
}

impl fmt::Display for InvalidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.reason)
    }
}

pub fn encode_namespace(namespace: &Namespace) -> Bytes {
    pb::NamespaceMessage::from(namespace).encode_to_vec().into()
}

pub fn decode_namespace(bytes: &[u8]) -> Result<(Namespace, Vec<InvalidEntry>), DecodeError> {
    let message = pb::NamespaceMessage::decode(bytes)?;
    let mut decoder = Decoder::default();
    let namespace = decoder.namespace(message);
    Ok((namespace, decoder.invalid))
}

pub fn encode_index(index: &Index) -> Bytes {
    pb::IndexMessage::from(index).encode_to_vec().into()
}

pub fn decode_index(bytes: &[u8]) -> Result<(Index, Vec<InvalidEntry>), DecodeError> {
    let message = pb::IndexMessage::decode(bytes)?;
    let mut decoder = Decoder::default();
    let index = decoder.index(message);
    Ok((index, decoder.invalid))
}

/// Encode a single link, as published on topics and kept in the memory image.
pub fn encode_link(link: &Link) -> Bytes {
    pb::LinkMessage::from(link).encode_to_vec().into()
}

/// Decode a single link. Unlike links inside an index, a standalone link with
/// a malformed signature or an empty path is rejected as a whole.
pub fn decode_link(bytes: &[u8]) -> Result<Link, DecodeError> {
    let message = pb::LinkMessage::decode(bytes)?;
    if message.path.is_empty() {
        return Err(DecodeError::invalid("link", "empty path"));
    }
    let signatures =
        parse_signatures(&message.signatures).map_err(|err| DecodeError::invalid("link", err))?;
    Ok(Link::new(Address::new(message.path)).with_signatures(signatures))
}

/// Encode a request envelope, length-prefixed.
pub fn encode_request(request: &Request) -> Bytes {
    pb::RequestMessage::from(request)
        .encode_length_delimited_to_vec()
        .into()
}

pub fn decode_request(bytes: &[u8]) -> Result<(Request, Vec<InvalidEntry>), DecodeError> {
    let message = pb::RequestMessage::decode_length_delimited(bytes)?;
    let mut decoder = Decoder::default();
    let request = decoder.request(message)?;
    Ok((request, decoder.invalid))
}

/// Encode a response envelope, length-prefixed.
pub fn encode_response(response: &Response) -> Bytes {
    pb::ResponseMessage::from(response)
        .encode_length_delimited_to_vec()
        .into()
}

pub fn decode_response(bytes: &[u8]) -> Result<(Response, Vec<InvalidEntry>), DecodeError> {
    let message = pb::ResponseMessage::decode_length_delimited(bytes)?;
    let mut decoder = Decoder::default();
    let response = decoder.response(message);
    Ok((response, decoder.invalid))
}

/// The debug text form of a namespace: pretty JSON of its stream form.
pub fn namespace_to_text(namespace: &Namespace) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&namespace.to_stream())
}

pub fn namespace_from_text(text: &str) -> Result<Namespace, DecodeError> {
    let stream: Vec<NamespaceStreamEntry> = serde_json::from_str(text)?;
    Ok(Namespace::from_stream(stream))
}

/// The debug text form of an index: pretty JSON of its stream form.
pub fn index_to_text(index: &Index) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&index.to_stream())
}

pub fn index_from_text(text: &str) -> Result<Index, DecodeError> {
    let stream: Vec<IndexStreamEntry> = serde_json::from_str(text)?;
    Ok(Index::from_stream(stream))
}

fn parse_signatures(texts: &[String]) -> Result<Vec<Signature>, crate::keys::KeyError> {
    texts.iter().map(|text| text.parse()).collect()
}

fn signature_texts(signatures: &[Signature]) -> Vec<String> {
    signatures.iter().map(Signature::to_text).collect()
}

impl From<&Point> for pb::PointMessage {
    fn from(point: &Point) -> Self {
        pb::PointMessage {
            text: point.text().to_string(),
            signatures: signature_texts(point.signatures()),
        }
    }
}

impl From<&Namespace> for pb::NamespaceMessage {
    fn from(namespace: &Namespace) -> Self {
        let entries = namespace
            .iter()
            .map(|(table, row, entry, points)| pb::NamespaceEntryMessage {
                table: table.to_string(),
                row: row.to_string(),
                entry: entry.to_string(),
                points: points.points().iter().map(Into::into).collect(),
            })
            .collect();
        pb::NamespaceMessage { entries }
    }
}

impl From<&Link> for pb::LinkMessage {
    fn from(link: &Link) -> Self {
        pb::LinkMessage {
            path: link.path().to_string(),
            signatures: signature_texts(link.signatures()),
        }
    }
}

impl From<&Index> for pb::IndexMessage {
    fn from(index: &Index) -> Self {
        let entries = index
            .tables()
            .filter(|(_, links)| !links.is_empty())
            .map(|(table, links)| pb::IndexEntryMessage {
                table: table.to_string(),
                links: links.iter().map(Into::into).collect(),
            })
            .collect();
        pb::IndexMessage { entries }
    }
}

impl From<&Predicate> for pb::QueryPredicateMessage {
    fn from(predicate: &Predicate) -> Self {
        pb::QueryPredicateMessage {
            op_code: predicate.op as u32,
            keys: predicate.keys.iter().map(ToString::to_string).collect(),
            literals: predicate.literals.clone(),
            include_row_key: predicate.include_row_key,
        }
    }
}

impl From<&Where> for pb::QueryWhereMessage {
    fn from(filter: &Where) -> Self {
        let (op_code, clauses, predicate) = match filter {
            Where::All => (pb::WHERE_ALL, Vec::new(), None),
            Where::And(clauses) => (pb::WHERE_AND, clauses.iter().map(Into::into).collect(), None),
            Where::Or(clauses) => (pb::WHERE_OR, clauses.iter().map(Into::into).collect(), None),
            Where::Predicate(predicate) => (pb::WHERE_PREDICATE, Vec::new(), Some(predicate.into())),
        };
        pb::QueryWhereMessage {
            op_code,
            clauses,
            predicate,
        }
    }
}

impl From<&Query> for pb::QueryMessage {
    fn from(query: &Query) -> Self {
        let public_keys = query.public_keys().iter().map(PublicKey::to_text).collect();
        match query {
            Query::Select(select) => pb::QueryMessage {
                op_code: pb::QUERY_SELECT,
                table: select.table.to_string(),
                join: None,
                select: Some(pb::QuerySelectMessage {
                    filter: Some((&select.filter).into()),
                    limit: select.limit.unwrap_or(0),
                }),
                public_keys,
            },
            Query::Join(join) => pb::QueryMessage {
                op_code: pb::QUERY_JOIN,
                table: join.table.to_string(),
                join: Some(pb::QueryJoinMessage {
                    rows: join
                        .rows
                        .iter()
                        .map(|row| pb::QueryRowJoinMessage {
                            row: row.row.to_string(),
                            entries: row
                                .entries
                                .iter()
                                .map(|(name, text)| (name.to_string(), text.to_string()))
                                .collect(),
                        })
                        .collect(),
                }),
                select: None,
                public_keys,
            },
        }
    }
}

impl From<&Request> for pb::RequestMessage {
    fn from(request: &Request) -> Self {
        pb::RequestMessage {
            kind: request.kind as u32,
            reflection: request.reflection as u32,
            query: request.query.as_ref().map(Into::into),
            replicate: request.replicate.iter().map(Into::into).collect(),
        }
    }
}

impl From<&Response> for pb::ResponseMessage {
    fn from(response: &Response) -> Self {
        pb::ResponseMessage {
            msg: response.msg.clone(),
            err: response.err.clone(),
            kind: response.kind as u32,
            path: response.path.clone(),
            namespace: response.namespace.as_ref().map(Into::into),
            index: response.index.as_ref().map(Into::into),
        }
    }
}

/// Collects the invalid entries found while decoding one value.
#[derive(Debug, Default)]
struct Decoder {
    invalid: Vec<InvalidEntry>,
}

impl Decoder {
    fn skip(&mut self, location: String, reason: impl fmt::Display) {
        self.invalid.push(InvalidEntry {
            location,
            reason: reason.to_string(),
        });
    }

    fn namespace(&mut self, message: pb::NamespaceMessage) -> Namespace {
        let mut stream = Vec::with_capacity(message.entries.len());
        for entry in message.entries {
            let location = format!("{}/{}/{}", entry.table, entry.row, entry.entry);
            if entry.table.is_empty() || entry.row.is_empty() || entry.entry.is_empty() {
                self.skip(location, "empty name");
                continue;
            }
            let mut points = Vec::with_capacity(entry.points.len());
            for point in entry.points {
                match parse_signatures(&point.signatures) {
                    Ok(signatures) => points.push(Point::new(point.text, signatures)),
                    Err(err) => self.skip(format!("{location}/{}", point.text), err),
                }
            }
            stream.push(NamespaceStreamEntry {
                table: entry.table.into(),
                row: entry.row.into(),
                entry: entry.entry.into(),
                points,
            });
        }
        Namespace::from_stream(stream)
    }

    fn links(&mut self, table: &str, messages: Vec<pb::LinkMessage>) -> Vec<Link> {
        let mut links = Vec::with_capacity(messages.len());
        for message in messages {
            let location = format!("{table}/{}", message.path);
            if message.path.is_empty() {
                self.skip(location, "empty path");
                continue;
            }
            match parse_signatures(&message.signatures) {
                Ok(signatures) => {
                    links.push(Link::new(Address::new(message.path)).with_signatures(signatures))
                }
                Err(err) => self.skip(location, err),
            }
        }
        links
    }

    fn index(&mut self, message: pb::IndexMessage) -> Index {
        let mut stream = Vec::with_capacity(message.entries.len());
        for entry in message.entries {
            if entry.table.is_empty() {
                self.skip(String::new(), "empty table name");
                continue;
            }
            let links = self.links(&entry.table, entry.links);
            stream.push(IndexStreamEntry {
                table: entry.table.into(),
                links,
            });
        }
        Index::from_stream(stream)
    }

    fn request(&mut self, message: pb::RequestMessage) -> Result<Request, DecodeError> {
        let kind = u8::try_from(message.kind)
            .ok()
            .and_then(RequestKind::from_repr)
            .unwrap_or_default();
        let reflection = u16::try_from(message.reflection)
            .ok()
            .and_then(ReflectionKind::from_repr)
            .unwrap_or_default();
        let query = message.query.map(decode_query).transpose()?;
        let replicate = self.links("replicate", message.replicate);
        Ok(Request {
            kind,
            reflection,
            query,
            replicate,
        })
    }

    fn response(&mut self, message: pb::ResponseMessage) -> Response {
        let kind = u8::try_from(message.kind)
            .ok()
            .and_then(RequestKind::from_repr)
            .unwrap_or_default();
        Response {
            msg: message.msg,
            err: message.err,
            kind,
            path: message.path,
            namespace: message.namespace.map(|ns| self.namespace(ns)),
            index: message.index.map(|index| self.index(index)),
        }
    }
}

fn decode_query(message: pb::QueryMessage) -> Result<Query, DecodeError> {
    let public_keys = message
        .public_keys
        .iter()
        .map(|text| text.parse::<PublicKey>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| DecodeError::invalid("public key", err))?;
    match message.op_code {
        pb::QUERY_SELECT => {
            let select = message.select.unwrap_or_default();
            let filter = select.filter.map(decode_where).transpose()?.unwrap_or(Where::All);
            let mut query = SelectQuery::new(message.table)
                .filter(filter)
                .public_keys(public_keys);
            if select.limit > 0 {
                query = query.limit(select.limit);
            }
            Ok(query.into())
        }
        pb::QUERY_JOIN => {
            let mut query = JoinQuery::new(message.table).public_keys(public_keys);
            for row in message.join.unwrap_or_default().rows {
                let row = row
                    .entries
                    .into_iter()
                    .fold(RowJoin::new(row.row), |acc, (name, text)| acc.entry(name, text));
                query = query.row(row);
            }
            Ok(query.into())
        }
        other => Err(DecodeError::invalid("query op code", other)),
    }
}

fn decode_where(message: pb::QueryWhereMessage) -> Result<Where, DecodeError> {
    let clauses = |clauses: Vec<pb::QueryWhereMessage>| {
        clauses
            .into_iter()
            .map(decode_where)
            .collect::<Result<Vec<_>, _>>()
    };
    match message.op_code {
        pb::WHERE_ALL => Ok(Where::All),
        pb::WHERE_AND => Ok(Where::And(clauses(message.clauses)?)),
        pb::WHERE_OR => Ok(Where::Or(clauses(message.clauses)?)),
        pb::WHERE_PREDICATE => {
            let predicate = message
                .predicate
                .ok_or_else(|| DecodeError::invalid("where", "predicate missing"))?;
            let op = u8::try_from(predicate.op_code)
                .ok()
                .and_then(PredicateOp::from_repr)
                .ok_or_else(|| DecodeError::invalid("predicate op code", predicate.op_code))?;
            Ok(Where::Predicate(Predicate {
                op,
                keys: predicate.keys.into_iter().map(Into::into).collect(),
                literals: predicate.literals,
                include_row_key: predicate.include_row_key,
            }))
        }
        other => Err(DecodeError::invalid("where op code", other)),
    }
}
