//! A peer-to-peer, eventually consistent key-value store.
//!
//! Every node holds a replica of a namespace of tables. Writes are joined
//! into the replica as lattice values, persisted to a content addressed
//! store and announced on pubsub topics; nodes replicate by joining the
//! indices announced by the keys they trust.

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod crdt;
pub mod engine;
pub mod http;
pub mod keys;
pub mod memory_image;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod query;
pub mod queue;
pub mod service;
mod util;

pub use self::{
    engine::{Engine, EngineOptions},
    node::Node,
    service::RequestService,
};
