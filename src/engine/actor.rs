use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use super::{
    EngineOptions, EngineState, EngineStatus, Event, PersistOutcome,
    content::Content,
    persist::{self, PersistJob, Persisted},
    subscribe::Subscriber,
};
use crate::{
    api::{ReflectionKind, RequestKind, Response},
    crdt::{Entry, Index, Lattice, Link, Namespace, Point, Row, Table},
    keys::{KeyError, KeyStore, PrivateKey},
    memory_image::MemoryImage,
    peer::{Address, DataPeer},
    query::{JoinQuery, Query, QueryVisitor, SelectQuery},
    util::Closer,
};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(derive_more::Debug, derive_more::Display)]
pub(super) enum Command {
    #[display("Query")]
    Query {
        query: Query,
        #[debug("reply")]
        reply: oneshot::Sender<Response>,
    },
    #[display("Reflect")]
    Reflect {
        kind: ReflectionKind,
        #[debug("reply")]
        reply: oneshot::Sender<Response>,
    },
    #[display("Replicate")]
    Replicate {
        links: Vec<Link>,
        #[debug("reply")]
        reply: Option<oneshot::Sender<Response>>,
    },
    #[display("Persist")]
    Persist {
        #[debug("reply")]
        reply: Option<oneshot::Sender<PersistOutcome>>,
    },
    #[display("Status")]
    Status {
        #[debug("reply")]
        reply: oneshot::Sender<EngineStatus>,
    },
    #[display("Shutdown")]
    Shutdown {
        #[debug("reply")]
        reply: Option<oneshot::Sender<()>>,
    },
}

impl Command {
    /// Commands that change the replica wait while a persist cycle runs.
    fn is_deferred_while_persisting(&self) -> bool {
        match self {
            Command::Query { query, .. } => query.is_write(),
            Command::Replicate { .. } | Command::Persist { .. } => true,
            Command::Reflect { .. } | Command::Status { .. } | Command::Shutdown { .. } => false,
        }
    }
}

/// The indices fetched for one replicate command.
struct Fetched {
    results: Vec<(Link, Result<Index>)>,
    dropped: usize,
    reply: Option<oneshot::Sender<Response>>,
}

pub(super) struct Actor<P> {
    opts: EngineOptions,
    content: Content<P>,
    memory_image: Arc<dyn MemoryImage>,
    keys: KeyStore,
    inbox: flume::Receiver<Command>,
    events: broadcast::Sender<Event>,
    closer: Closer,

    head: Option<Link>,
    index: Index,
    working: Namespace,
    state: EngineState,
    /// Bumped on every change to the index or the working namespace.
    generation: u64,
    /// The generation last written out by a persist cycle.
    persisted_generation: u64,

    deferred: VecDeque<Command>,
    persist_waiters: Vec<oneshot::Sender<PersistOutcome>>,
    persist_task: JoinSet<(u64, Result<Persisted>)>,
    fetch_tasks: JoinSet<Fetched>,
    /// Reads and republishes; each replies on its own.
    tasks: JoinSet<()>,
}

impl<P: DataPeer> Actor<P> {
    pub(super) fn new(
        mut opts: EngineOptions,
        content: Content<P>,
        memory_image: Arc<dyn MemoryImage>,
        keys: KeyStore,
        inbox: flume::Receiver<Command>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        opts.pulse = opts.pulse.max(MIN_INTERVAL);
        opts.replicate_interval = opts.replicate_interval.max(MIN_INTERVAL);
        Self {
            opts,
            content,
            memory_image,
            keys,
            inbox,
            events,
            closer: Closer::new(),
            head: None,
            index: Index::default(),
            working: Namespace::default(),
            state: EngineState::Idle,
            generation: 0,
            persisted_generation: 0,
            deferred: VecDeque::new(),
            persist_waiters: Vec::new(),
            persist_task: JoinSet::new(),
            fetch_tasks: JoinSet::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Rebuild the index from the head cache, the memory image and the
    /// configured index hash.
    pub(super) async fn recover(&mut self) -> Result<()> {
        let mut links = match self.memory_image.indices() {
            Ok(links) => links,
            Err(err) => {
                warn!("failed to read memory image: {err:#}");
                Vec::new()
            }
        };
        match self.content.cache().head() {
            Ok(Some(head)) => {
                links.push(head.clone());
                self.head = Some(head);
            }
            Ok(None) => {}
            Err(err) => warn!("failed to read cached head: {err:#}"),
        }
        links.sort();
        links.dedup_by(|a, b| a.path() == b.path());
        let mut head_index = Index::default();
        for link in &links {
            match self.content.index(link.path()).await {
                Ok(index) => {
                    if self.head.as_ref().is_some_and(|head| head.path() == link.path()) {
                        head_index = index.clone();
                    }
                    self.index = self.index.join(&index);
                }
                Err(err) => warn!(path = %link.path().fmt_short(), "failed to recover index: {err:#}"),
            }
        }
        // replicated indices that never made it into a published head
        if self.index != head_index {
            self.touch();
        }
        if let Some(path) = self.opts.index_hash.clone() {
            match self.content.index(&path).await {
                Ok(index) => {
                    let joined = self.index.join(&index);
                    // not part of any published head yet
                    if joined != self.index {
                        self.index = joined;
                        self.touch();
                    }
                }
                Err(err) if self.opts.fail_early => {
                    return Err(err).with_context(|| format!("failed to load index {path}"));
                }
                Err(err) => warn!(path = %path.fmt_short(), "failed to load index: {err:#}"),
            }
        }
        info!(
            head = %self.head.as_ref().map(|h| h.path().fmt_short()).unwrap_or_default(),
            tables = self.index.tables().count(),
            "recovered"
        );
        Ok(())
    }

    /// Subscribe to every topic and spawn the subscription loops.
    pub(super) async fn subscribe(&mut self, commands: flume::WeakSender<Command>) -> Result<()> {
        let subscriber = Subscriber {
            keys: self.keys.clone(),
            public_server: self.opts.public_server,
            events: self.events.clone(),
            metrics: self.content.metrics().clone(),
        };
        for topic in &self.opts.topics {
            let records = self
                .content
                .peer()
                .subscribe(topic)
                .await
                .with_context(|| format!("failed to subscribe to {topic}"))?;
            subscriber
                .clone()
                .spawn(&self.closer, topic.clone(), records, commands.clone());
        }
        Ok(())
    }

    pub(super) async fn run(mut self) -> Result<()> {
        let mut pulse = tokio::time::interval_at(Instant::now() + self.opts.pulse, self.opts.pulse);
        pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut republish = tokio::time::interval_at(
            Instant::now() + self.opts.replicate_interval,
            self.opts.replicate_interval,
        );
        republish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_reply = loop {
            tokio::select! {
                biased;
                command = self.inbox.recv_async() => {
                    let Ok(command) = command else {
                        debug!("all handles dropped");
                        break None;
                    };
                    trace!(%command, state = %self.state, "tick: command");
                    match command {
                        Command::Shutdown { reply } => break reply,
                        command => self.on_command(command),
                    }
                }
                Some(res) = self.persist_task.join_next(), if !self.persist_task.is_empty() => {
                    trace!("tick: persisted");
                    match res {
                        Ok((generation, res)) => self.on_persisted(generation, res),
                        Err(err) => {
                            error!("persist task panicked: {err}");
                            self.on_persisted(0, Err(err.into()));
                        }
                    }
                }
                Some(res) = self.fetch_tasks.join_next(), if !self.fetch_tasks.is_empty() => {
                    trace!("tick: fetched");
                    match res {
                        Ok(fetched) => self.on_fetched(fetched),
                        Err(err) => error!("replicate task panicked: {err}"),
                    }
                }
                Some(res) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = res {
                        error!("engine task panicked: {err}");
                    }
                }
                _ = pulse.tick() => {
                    trace!("tick: pulse");
                    if self.is_dirty() && self.state != EngineState::Persisting {
                        self.start_persist();
                    }
                }
                _ = republish.tick() => {
                    trace!("tick: republish");
                    self.republish();
                }
            }
        };

        self.closer.close().await;
        self.persist_task.shutdown().await;
        self.fetch_tasks.shutdown().await;
        self.tasks.shutdown().await;
        debug!("shutdown");
        // release the stores before acknowledging
        drop(self);
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        if self.state == EngineState::Persisting && command.is_deferred_while_persisting() {
            trace!(%command, "deferred until persisted");
            self.deferred.push_back(command);
            return;
        }
        match command {
            Command::Query { query, reply } => self.on_query(query, reply),
            Command::Reflect { kind, reply } => self.on_reflect(kind, reply),
            Command::Replicate { links, reply } => self.on_replicate(links, reply),
            Command::Persist { reply } => {
                if !self.is_dirty() {
                    if let Some(reply) = reply {
                        reply.send(PersistOutcome::Clean).ok();
                    }
                    return;
                }
                self.persist_waiters.extend(reply);
                self.start_persist();
            }
            Command::Status { reply } => {
                reply.send(self.status()).ok();
            }
            Command::Shutdown { .. } => unreachable!("handled in run"),
        }
    }

    fn on_query(&mut self, query: Query, reply: oneshot::Sender<Response>) {
        if let Err(err) = query.validate() {
            debug!("invalid query: {err}");
            reply.send(Response::error(RequestKind::Query, err)).ok();
            return;
        }
        let response = query.accept(&mut Dispatch { actor: &mut *self });
        if let Some(response) = response {
            reply.send(response).ok();
            return;
        }
        // a select, evaluated off the actor on a snapshot
        let Query::Select(select) = query else {
            unreachable!("joins always respond immediately");
        };
        self.content.metrics().queries.inc();
        let content = self.content.clone();
        let table = self.working.table(select.table.as_str()).cloned().unwrap_or_default();
        let links = self.index.links(select.table.as_str()).to_vec();
        self.tasks.spawn(
            async move {
                let response = run_select(content, select, table, links).await;
                reply.send(response).ok();
            }
            .instrument(Span::current()),
        );
    }

    fn apply_join(&mut self, join: &JoinQuery) -> Result<(), KeyError> {
        let keys = self.signing_keys(join)?;
        let mut table = Table::default();
        for row_join in &join.rows {
            let mut row = Row::default();
            for (name, text) in &row_join.entries {
                let point = Point::signed(text.clone(), &keys)?;
                row.join_entry(name.clone(), &Entry::single(point));
            }
            table.join_row(row_join.row.clone(), &row);
        }
        self.working.join_table_mut(join.table.clone(), &table);
        self.touch();
        self.content.metrics().joins.inc();
        debug!(table = %join.table, rows = join.rows.len(), "joined");
        Ok(())
    }

    /// The private keys matching the join's public keys, or all of them.
    fn signing_keys(&self, join: &JoinQuery) -> Result<Vec<PrivateKey>, KeyError> {
        if join.public_keys.is_empty() {
            return Ok(self.keys.private_keys());
        }
        join.public_keys
            .iter()
            .map(|key| {
                self.keys
                    .private_key(&key.key_hash())
                    .ok_or(KeyError::UnknownKey(key.key_hash()))
            })
            .collect()
    }

    fn on_reflect(&mut self, kind: ReflectionKind, reply: oneshot::Sender<Response>) {
        self.content.metrics().reflections.inc();
        let response = Response::ok(RequestKind::Reflect);
        match kind {
            ReflectionKind::HeadPath => {
                let path = self
                    .head
                    .as_ref()
                    .map(|head| head.path().to_string())
                    .unwrap_or_default();
                reply.send(response.with_path(path)).ok();
            }
            ReflectionKind::Index => {
                reply.send(response.with_index(self.index.clone())).ok();
            }
            ReflectionKind::DumpNamespace => {
                let content = self.content.clone();
                let working = self.working.clone();
                let paths: Vec<Address> = self.index.addresses().into_iter().cloned().collect();
                self.tasks.spawn(
                    async move {
                        let response = run_dump(content, working, paths).await;
                        reply.send(response).ok();
                    }
                    .instrument(Span::current()),
                );
            }
            ReflectionKind::Noop => {
                reply
                    .send(Response::error(RequestKind::Reflect, "unknown reflection type"))
                    .ok();
            }
        }
    }

    fn on_replicate(&mut self, links: Vec<Link>, reply: Option<oneshot::Sender<Response>>) {
        let trusted = self.keys.public_keys();
        let mut accepted = Vec::with_capacity(links.len());
        let mut dropped = 0;
        for link in links {
            if self.head.as_ref().is_some_and(|head| head.path() == link.path()) {
                trace!(path = %link.path().fmt_short(), "own head, skipping");
                continue;
            }
            if !self.opts.public_server && !link.is_verified_by_any(&trusted) {
                dropped += 1;
                self.drop_link(link, "not signed by a trusted key".to_string());
                continue;
            }
            accepted.push(link);
        }
        let content = self.content.clone();
        self.fetch_tasks.spawn(
            async move {
                let mut results = Vec::with_capacity(accepted.len());
                for link in accepted {
                    let index = content.index(link.path()).await;
                    results.push((link, index));
                }
                Fetched {
                    results,
                    dropped,
                    reply,
                }
            }
            .instrument(Span::current()),
        );
    }

    fn on_fetched(&mut self, fetched: Fetched) {
        let Fetched {
            results,
            mut dropped,
            reply,
        } = fetched;
        let mut joined = 0;
        for (link, res) in results {
            match res {
                Ok(remote) => {
                    let index = self.index.join(&remote);
                    let changed = index != self.index;
                    // a republished head that adds nothing is not logged again
                    if changed {
                        self.index = index;
                        self.touch();
                        if let Err(err) = self.memory_image.push_index(&link) {
                            warn!("failed to log link to memory image: {err:#}");
                        }
                    }
                    self.content.metrics().replications.inc();
                    debug!(path = %link.path().fmt_short(), changed, "replicated");
                    self.events.send(Event::Replicated { link, changed }).ok();
                    joined += 1;
                }
                Err(err) => {
                    dropped += 1;
                    self.drop_link(link, format!("{err:#}"));
                }
            }
        }
        let Some(reply) = reply else {
            return;
        };
        let response = if joined == 0 && dropped > 0 {
            Response::error(RequestKind::Replicate, format!("all {dropped} links dropped"))
        } else {
            Response::ok(RequestKind::Replicate)
                .with_msg(format!("replicated {joined} links, dropped {dropped}"))
        };
        reply.send(response).ok();
    }

    fn drop_link(&self, link: Link, reason: String) {
        self.content.metrics().links_dropped.inc();
        warn!(path = %link.path().fmt_short(), "dropping link: {reason}");
        self.events
            .send(Event::Dropped {
                link: Some(link),
                reason,
            })
            .ok();
    }

    fn start_persist(&mut self) {
        self.content.metrics().persist_cycles.inc();
        self.state = EngineState::Persisting;
        let job = PersistJob {
            content: self.content.clone(),
            memory_image: self.memory_image.clone(),
            private_keys: self.keys.private_keys(),
            topics: self.opts.topics.clone(),
            working: self.working.clone(),
            index: self.index.clone(),
        };
        let generation = self.generation;
        debug!(generation, "persisting");
        self.persist_task.spawn(
            async move { (generation, job.run().await) }.instrument(Span::current()),
        );
    }

    fn on_persisted(&mut self, generation: u64, res: Result<Persisted>) {
        let outcome = match res {
            Ok(Persisted { head, index }) => {
                // writes are deferred while persisting, so the working
                // namespace is exactly what was written out
                self.working = Namespace::default();
                self.index = self.index.join(&index);
                self.persisted_generation = generation;
                if let Err(err) = self.content.cache().set_head(&head) {
                    warn!("failed to cache head: {err:#}");
                }
                info!(head = %head.path().fmt_short(), "published");
                self.head = Some(head.clone());
                self.events.send(Event::Persisted { head: head.clone() }).ok();
                PersistOutcome::Published(head)
            }
            Err(err) => {
                self.content.metrics().persist_failures.inc();
                warn!("persist failed: {err:#}");
                let error = format!("{err:#}");
                self.events
                    .send(Event::PersistFailed {
                        error: error.clone(),
                    })
                    .ok();
                PersistOutcome::Failed(error)
            }
        };
        self.state = if self.is_dirty() {
            EngineState::Working
        } else {
            EngineState::Idle
        };
        for waiter in self.persist_waiters.drain(..) {
            waiter.send(outcome.clone()).ok();
        }
        while let Some(command) = self.deferred.pop_front() {
            if self.state == EngineState::Persisting {
                self.deferred.push_front(command);
                break;
            }
            self.on_command(command);
        }
    }

    fn republish(&mut self) {
        let Some(head) = self.head.clone() else {
            return;
        };
        if self.opts.topics.is_empty() {
            return;
        }
        let content = self.content.clone();
        let topics = self.opts.topics.clone();
        self.tasks.spawn(
            async move { persist::publish(&content, &topics, &head).await }
                .instrument(Span::current()),
        );
    }

    fn touch(&mut self) {
        self.generation += 1;
        if self.state == EngineState::Idle {
            self.state = EngineState::Working;
        }
    }

    fn is_dirty(&self) -> bool {
        self.generation != self.persisted_generation
    }

    fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            head: self.head.clone(),
            dirty: self.is_dirty(),
        }
    }
}

/// Applies joins in place; selects are left to the caller.
struct Dispatch<'a, P> {
    actor: &'a mut Actor<P>,
}

impl<P: DataPeer> QueryVisitor for Dispatch<'_, P> {
    type Output = Option<Response>;

    fn visit_select(&mut self, _select: &SelectQuery) -> Self::Output {
        None
    }

    fn visit_join(&mut self, join: &JoinQuery) -> Self::Output {
        let response = match self.actor.apply_join(join) {
            Ok(()) => Response::ok(RequestKind::Query),
            Err(err) => {
                debug!("join rejected: {err}");
                Response::error(RequestKind::Query, err)
            }
        };
        Some(response)
    }
}

/// Evaluate `select` over the working table and the fragments behind `links`.
async fn run_select<P: DataPeer>(
    content: Content<P>,
    select: SelectQuery,
    mut table: Table,
    links: Vec<Link>,
) -> Response {
    let name = select.table.as_str();
    let failures = content
        .join_fragments(links.iter().map(Link::path), |fragment| {
            if let Some(fragment) = fragment.table(name) {
                table = table.join(fragment);
            }
        })
        .await;

    let mut namespace = Namespace::default().join_table(select.table.clone(), &table);
    if !select.public_keys.is_empty() {
        namespace = namespace.filter_verified(&select.public_keys);
    }
    let matching = namespace
        .table(name)
        .map(|table| table.filter_rows(|key, row| select.filter.matches(key, row)))
        .unwrap_or_default();
    let mut stream = Namespace::default()
        .join_table(select.table.clone(), &matching)
        .to_stream();
    if let Some(limit) = select.limit.filter(|limit| *limit > 0) {
        stream.truncate(limit as usize);
    }
    let response = Response::ok(RequestKind::Query).with_namespace(Namespace::from_stream(stream));
    with_failures(response, failures, links.len())
}

/// Join every fragment in the index with the working namespace.
async fn run_dump<P: DataPeer>(
    content: Content<P>,
    mut namespace: Namespace,
    paths: Vec<Address>,
) -> Response {
    let failures = content
        .join_fragments(&paths, |fragment| namespace = namespace.join(&fragment))
        .await;
    let response = Response::ok(RequestKind::Reflect).with_namespace(namespace.strip());
    with_failures(response, failures, paths.len())
}

fn with_failures(response: Response, failures: usize, total: usize) -> Response {
    if failures == 0 {
        return response;
    }
    response.with_msg(format!("ok, {failures} of {total} fragments unavailable"))
}
