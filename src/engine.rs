//! The replica engine.
//!
//! The engine owns one node's view of the data: the head [`Link`], the index
//! and the working namespace of writes not yet persisted. All of it lives in a
//! single actor task; [`Engine`] is a cheap handle that talks to the actor
//! over a channel.
//!
//! Writes are joined into the working namespace. Every pulse, a dirty engine
//! persists: the working namespace and the updated index are added to the
//! CAS, the new head is signed, logged to the memory image and published on
//! every topic. Remote heads arrive through topic subscriptions and are
//! replicated by joining the index they point to.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, error, error_span};

use crate::{
    api::{ReflectionKind, Request, RequestKind, Response},
    cache::Cache,
    crdt::Link,
    keys::KeyStore,
    memory_image::MemoryImage,
    metrics::Metrics,
    peer::{Address, DataPeer, Topic},
    query::Query,
};

mod actor;
mod content;
mod persist;
mod subscribe;

use self::{
    actor::{Actor, Command},
    content::Content,
};

/// Capacity of the command channel.
const COMMAND_CAP: usize = 1024;
/// Capacity of the event broadcast channel.
const EVENT_CAP: usize = 256;

/// Options consumed by [`Engine::spawn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Interval of the persist ticker.
    #[serde(with = "humantime_serde")]
    pub pulse: Duration,
    /// Interval at which the current head is re-published.
    #[serde(with = "humantime_serde")]
    pub replicate_interval: Duration,
    /// Topics to publish heads on and to replicate from.
    pub topics: Vec<Topic>,
    /// Accept links from anyone instead of only the trust set.
    pub public_server: bool,
    /// An index to join at startup.
    pub index_hash: Option<Address>,
    /// Abort startup when `index_hash` cannot be loaded.
    pub fail_early: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pulse: Duration::from_secs(1),
            replicate_interval: Duration::from_secs(30),
            topics: Vec::new(),
            public_server: false,
            index_hash: None,
            fail_early: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EngineState {
    /// Nothing to persist.
    Idle,
    /// There are changes waiting for the next pulse.
    Working,
    /// A persist cycle is running.
    Persisting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub head: Option<Link>,
    /// Whether the working namespace or the index hold unpersisted changes.
    pub dirty: bool,
}

/// The result of [`Engine::persist_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// There was nothing to persist.
    Clean,
    /// A new head was published.
    Published(Link),
    /// The cycle failed; the changes stay dirty and are retried.
    Failed(String),
}

/// Notable things happening inside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Persisted { head: Link },
    PersistFailed { error: String },
    Replicated { link: Link, changed: bool },
    Dropped { link: Option<Link>, reason: String },
}

/// Handle to a running replica engine.
///
/// Clones share the same actor. Once the last clone is dropped the actor is
/// aborted; call [`Engine::shutdown`] first to stop it cleanly.
#[derive(Debug, Clone)]
pub struct Engine {
    tx: flume::Sender<Command>,
    events: broadcast::Sender<Event>,
    metrics: Arc<Metrics>,
    _actor_handle: Arc<AbortOnDropHandle<()>>,
}

impl Engine {
    /// Recover state and spawn the engine actor.
    ///
    /// Joins the index of the cached head, every index in the memory image and
    /// the index at `opts.index_hash`. Only a failure to load the latter with
    /// `opts.fail_early` set is fatal.
    pub async fn spawn<P: DataPeer>(
        opts: EngineOptions,
        peer: P,
        cache: Arc<dyn Cache>,
        memory_image: Arc<dyn MemoryImage>,
        keys: KeyStore,
    ) -> Result<Self> {
        let metrics = Arc::new(Metrics::default());
        let (tx, rx) = flume::bounded(COMMAND_CAP);
        let (events, _) = broadcast::channel(EVENT_CAP);
        let content = Content::new(peer, cache, metrics.clone());
        let mut actor = Actor::new(opts, content, memory_image, keys, rx, events.clone());
        actor.recover().await?;
        actor.subscribe(tx.downgrade()).await?;
        let handle = tokio::task::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    error!("engine actor failed: {err:?}");
                }
            }
            .instrument(error_span!("engine")),
        );
        Ok(Self {
            tx,
            events,
            metrics,
            _actor_handle: Arc::new(AbortOnDropHandle::new(handle)),
        })
    }

    /// Dispatch a validated request to the matching command.
    pub async fn handle(&self, request: Request) -> Result<Response> {
        match request.kind {
            RequestKind::Query => match request.query {
                Some(query) => self.run_query(query).await,
                None => Ok(Response::error(RequestKind::Query, "query missing")),
            },
            RequestKind::Reflect => self.run_reflection(request.reflection).await,
            RequestKind::Replicate => self.replicate(request.replicate).await,
            RequestKind::Noop => Ok(Response::error(RequestKind::Noop, "unknown request type")),
        }
    }

    /// Evaluate a select against the replica, or apply a join to the working
    /// namespace.
    pub async fn run_query(&self, query: Query) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Query { query, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn run_reflection(&self, kind: ReflectionKind) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reflect { kind, reply }).await?;
        Ok(rx.await?)
    }

    /// Verify `links` against the trust set, fetch the indices they point to
    /// and join them into the local index.
    pub async fn replicate(&self, links: Vec<Link>) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Replicate {
            links,
            reply: Some(reply),
        })
        .await?;
        Ok(rx.await?)
    }

    /// Run a persist cycle now instead of waiting for the next pulse.
    pub async fn persist_now(&self) -> Result<PersistOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Persist { reply: Some(reply) }).await?;
        Ok(rx.await?)
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        Ok(rx.await?)
    }

    /// Subscribe to engine events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop the subscriptions and the actor, waiting for both.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply: Some(reply) }).await?;
        rx.await?;
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send_async(command)
            .await
            .context("sending to engine actor failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        cache::{HeadCache, MemoryCache},
        crdt::Lattice,
        keys::PrivateKey,
        memory_image::{MemoryImage, MemoryImageLog},
        peer::MemPeer,
        query::{JoinQuery, RowJoin, SelectQuery, Where},
    };

    /// Options that never persist on their own.
    fn quiet_opts() -> EngineOptions {
        EngineOptions {
            pulse: Duration::from_secs(3600),
            replicate_interval: Duration::from_secs(3600),
            topics: vec![Topic::new("t")],
            ..Default::default()
        }
    }

    fn signing_keys() -> TestResult<KeyStore> {
        let keys = KeyStore::new();
        keys.put_private_key(PrivateKey::generate())?;
        Ok(keys)
    }

    async fn spawn_engine(peer: &MemPeer, keys: KeyStore) -> Result<Engine> {
        Engine::spawn(
            quiet_opts(),
            peer.clone(),
            Arc::new(MemoryCache::default()),
            Arc::new(MemoryImageLog::new()),
            keys,
        )
        .await
    }

    fn write_alice() -> Query {
        JoinQuery::new("users")
            .row(RowJoin::new("alice").entry("age", "30"))
            .into()
    }

    fn point_texts(response: &Response, row: &str, entry: &str) -> Vec<String> {
        response
            .namespace
            .as_ref()
            .and_then(|ns| ns.table("users"))
            .and_then(|table| table.get(row))
            .and_then(|row| row.get(entry))
            .map(|entry| entry.points().iter().map(|p| p.text().to_string()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    #[traced_test]
    async fn select_sees_unpersisted_writes() -> TestResult {
        let engine = spawn_engine(&MemPeer::new(), signing_keys()?).await?;
        let res = engine.run_query(write_alice()).await?;
        assert!(res.is_ok(), "{res:?}");

        let res = engine
            .run_query(SelectQuery::new("users").filter(Where::row_key_eq("alice")).into())
            .await?;
        assert!(res.is_ok(), "{res:?}");
        assert_eq!(point_texts(&res, "alice", "age"), vec!["30".to_string()]);

        let status = engine.status().await?;
        assert_eq!(status.state, EngineState::Working);
        assert!(status.dirty);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_query_is_an_error_response() -> TestResult {
        let engine = spawn_engine(&MemPeer::new(), signing_keys()?).await?;
        let res = engine.run_query(JoinQuery::new("users").into()).await?;
        assert!(!res.is_ok());
        assert!(!engine.status().await?.dirty);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn join_with_unknown_key_is_rejected() -> TestResult {
        let engine = spawn_engine(&MemPeer::new(), signing_keys()?).await?;
        let stranger = PrivateKey::generate().public_key();
        let query = JoinQuery::new("users")
            .row(RowJoin::new("alice").entry("age", "30"))
            .public_keys([stranger]);
        let res = engine.run_query(query.into()).await?;
        assert!(res.err.as_deref().is_some_and(|e| e.contains("no private key")));
        assert!(!engine.status().await?.dirty);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn persist_publishes_signed_head() -> TestResult {
        let peer = MemPeer::new();
        let keys = signing_keys()?;
        let mut records = peer.subscribe(&Topic::new("t")).await?;
        let engine = spawn_engine(&peer, keys.clone()).await?;
        assert_eq!(engine.persist_now().await?, PersistOutcome::Clean);

        engine.run_query(write_alice()).await?;
        let PersistOutcome::Published(head) = engine.persist_now().await? else {
            panic!("expected a new head");
        };
        assert!(head.is_verified_by_any(&keys.public_keys()));
        assert!(peer.contains(head.path()));

        let record = records.recv().await?;
        assert_eq!(crate::codec::decode_link(&record)?, head);

        let status = engine.status().await?;
        assert_eq!(status.state, EngineState::Idle);
        assert_eq!(status.head.as_ref(), Some(&head));
        assert!(!status.dirty);

        let res = engine.run_reflection(ReflectionKind::HeadPath).await?;
        assert_eq!(res.path, head.path().to_string());
        let res = engine.run_reflection(ReflectionKind::Index).await?;
        assert_eq!(res.index.map(|i| i.links("users").len()), Some(1));

        // persisted rows are read back from the fragment
        let res = engine.run_query(SelectQuery::new("users").into()).await?;
        assert_eq!(point_texts(&res, "alice", "age"), vec!["30".to_string()]);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_persist_stays_dirty() -> TestResult {
        let peer = MemPeer::new();
        let engine = spawn_engine(&peer, signing_keys()?).await?;
        let mut events = engine.subscribe_events();
        engine.run_query(write_alice()).await?;

        peer.set_fail_add(true);
        assert!(matches!(
            engine.persist_now().await?,
            PersistOutcome::Failed(_)
        ));
        assert!(matches!(events.recv().await?, Event::PersistFailed { .. }));
        let status = engine.status().await?;
        assert!(status.dirty);
        assert_eq!(status.head, None);

        // the write survives the failed cycle
        let res = engine.run_query(SelectQuery::new("users").into()).await?;
        assert_eq!(point_texts(&res, "alice", "age"), vec!["30".to_string()]);

        peer.set_fail_add(false);
        assert!(matches!(
            engine.persist_now().await?,
            PersistOutcome::Published(_)
        ));
        assert_eq!(engine.metrics().persist_failures.get(), 1);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn select_limit_truncates_entries() -> TestResult {
        let engine = spawn_engine(&MemPeer::new(), signing_keys()?).await?;
        let query = JoinQuery::new("users")
            .row(RowJoin::new("alice").entry("age", "30").entry("city", "berlin"))
            .row(RowJoin::new("bob").entry("age", "40"));
        engine.run_query(query.into()).await?;

        let res = engine
            .run_query(SelectQuery::new("users").limit(2).into())
            .await?;
        assert_eq!(res.namespace.map(|ns| ns.to_stream().len()), Some(2));
        let res = engine
            .run_query(SelectQuery::new("users").limit(0).into())
            .await?;
        assert_eq!(res.namespace.map(|ns| ns.to_stream().len()), Some(3));
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn replicate_drops_untrusted_links() -> TestResult {
        let peer = MemPeer::new();
        let engine = spawn_engine(&peer, signing_keys()?).await?;
        let mut events = engine.subscribe_events();

        let stranger = PrivateKey::generate();
        let link = Link::new(Address::new("somewhere")).signed(&[stranger])?;
        let res = engine.replicate(vec![link.clone()]).await?;
        assert!(!res.is_ok());
        assert_eq!(
            events.recv().await?,
            Event::Dropped {
                link: Some(link),
                reason: "not signed by a trusted key".to_string(),
            }
        );
        assert_eq!(engine.metrics().links_dropped.get(), 1);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn recovers_from_cached_head() -> TestResult {
        let peer = MemPeer::new();
        let keys = signing_keys()?;
        let cache = Arc::new(MemoryCache::default());
        let image = Arc::new(MemoryImageLog::new());
        let engine = Engine::spawn(
            quiet_opts(),
            peer.clone(),
            cache.clone(),
            image.clone(),
            keys.clone(),
        )
        .await?;
        engine.run_query(write_alice()).await?;
        let PersistOutcome::Published(head) = engine.persist_now().await? else {
            panic!("expected a new head");
        };
        engine.shutdown().await?;
        assert_eq!(cache.head()?, Some(head.clone()));

        let engine = Engine::spawn(quiet_opts(), peer, cache, image, keys).await?;
        let status = engine.status().await?;
        assert_eq!(status.head, Some(head));
        assert!(!status.dirty);
        let res = engine.run_query(SelectQuery::new("users").into()).await?;
        assert_eq!(point_texts(&res, "alice", "age"), vec!["30".to_string()]);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn fail_early_on_missing_index() -> TestResult {
        let opts = EngineOptions {
            index_hash: Some(Address::new("missing")),
            fail_early: true,
            ..quiet_opts()
        };
        let res = Engine::spawn(
            opts.clone(),
            MemPeer::new(),
            Arc::new(MemoryCache::default()),
            Arc::new(MemoryImageLog::new()),
            KeyStore::new(),
        )
        .await;
        assert!(res.is_err());

        let opts = EngineOptions {
            fail_early: false,
            ..opts
        };
        let engine = Engine::spawn(
            opts,
            MemPeer::new(),
            Arc::new(MemoryCache::default()),
            Arc::new(MemoryImageLog::new()),
            KeyStore::new(),
        )
        .await?;
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn head_index_grows_monotonically() -> TestResult {
        let engine = spawn_engine(&MemPeer::new(), signing_keys()?).await?;
        engine.run_query(write_alice()).await?;
        engine.persist_now().await?;
        let first = engine
            .run_reflection(ReflectionKind::Index)
            .await?
            .index
            .ok_or("no index")?;

        let write_bob = JoinQuery::new("users").row(RowJoin::new("bob").entry("age", "40"));
        engine.run_query(write_bob.into()).await?;
        engine.persist_now().await?;
        let second = engine
            .run_reflection(ReflectionKind::Index)
            .await?
            .index
            .ok_or("no index")?;

        assert_ne!(first, second);
        assert_eq!(second.join(&first), second);
        assert_eq!(second.links("users").len(), 2);
        engine.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn republished_head_is_logged_once() -> TestResult {
        let peer = MemPeer::new();
        let key_a = PrivateKey::generate();
        let keys_a = KeyStore::new();
        keys_a.put_private_key(key_a.clone())?;
        let opts_a = EngineOptions {
            topics: vec![Topic::new("elsewhere")],
            ..quiet_opts()
        };
        let a = Engine::spawn(
            opts_a,
            peer.clone(),
            Arc::new(MemoryCache::default()),
            Arc::new(MemoryImageLog::new()),
            keys_a,
        )
        .await?;
        a.run_query(write_alice()).await?;
        let PersistOutcome::Published(head) = a.persist_now().await? else {
            panic!("expected a new head");
        };

        let keys_b = KeyStore::new();
        keys_b.put_public_key(key_a.public_key())?;
        let image = Arc::new(MemoryImageLog::new());
        let b = Engine::spawn(
            quiet_opts(),
            peer,
            Arc::new(MemoryCache::default()),
            image.clone(),
            keys_b,
        )
        .await?;
        for _ in 0..3 {
            let res = b.replicate(vec![head.clone()]).await?;
            assert!(res.is_ok(), "{res:?}");
        }
        assert_eq!(image.indices()?, vec![head]);
        assert_eq!(b.metrics().replications.get(), 3);

        a.shutdown().await?;
        b.shutdown().await?;
        Ok(())
    }
}
