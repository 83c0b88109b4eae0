//! The request service: a fixed pool of workers draining the priority queue
//! into the replica engine.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::oneshot,
    time::{Instant, timeout_at},
};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    api::{Request, Response, ValidationError},
    engine::Engine,
    queue::{QueueConfig, QueueError, RequestPriorityQueue},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Number of requests run against the engine at the same time.
    pub api_concurrency: usize,
    pub queue: QueueConfig,
    /// Deadline for a request, measured from submission.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_concurrency: 4,
            queue: QueueConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("request queue is full")]
    QueueFull,
    #[error("request service is closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("request was cancelled")]
    Cancelled,
}

impl From<QueueError> for ServiceError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Full => Self::QueueFull,
            QueueError::Closed => Self::Closed,
        }
    }
}

#[derive(derive_more::Debug)]
struct Job {
    request: Request,
    deadline: Instant,
    #[debug("reply")]
    reply: oneshot::Sender<Response>,
}

/// Handle to the worker pool. Clones share the same queue and workers.
#[derive(Debug, Clone)]
pub struct RequestService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    engine: Engine,
    queue: RequestPriorityQueue<Job>,
    request_timeout: Duration,
    workers: TaskTracker,
}

impl RequestService {
    /// Spawn `config.api_concurrency` workers (at least one) for `engine`.
    pub fn spawn(config: &ServiceConfig, engine: Engine) -> Self {
        let inner = Arc::new(Inner {
            engine,
            queue: RequestPriorityQueue::new(&config.queue),
            request_timeout: config.request_timeout,
            workers: TaskTracker::new(),
        });
        for id in 0..config.api_concurrency.max(1) {
            let inner2 = inner.clone();
            inner
                .workers
                .spawn(async move { inner2.work().await }.instrument(error_span!("worker", id)));
        }
        inner.workers.close();
        Self { inner }
    }

    /// Validate and enqueue `request`.
    ///
    /// The returned channel yields the response. It closes without a value if
    /// the request times out or the service shuts down first.
    pub fn submit(&self, request: Request) -> Result<oneshot::Receiver<Response>, ServiceError> {
        let deadline = Instant::now() + self.inner.request_timeout;
        self.enqueue(request, deadline)
    }

    /// Submit `request` and wait for its response.
    pub async fn call(&self, request: Request) -> Result<Response, ServiceError> {
        let deadline = Instant::now() + self.inner.request_timeout;
        let rx = self.enqueue(request, deadline)?;
        match rx.await {
            Ok(response) => Ok(response),
            Err(_) if Instant::now() >= deadline => Err(ServiceError::Timeout),
            Err(_) => Err(ServiceError::Cancelled),
        }
    }

    /// Stop accepting requests, drop the queued ones and wait for the
    /// in-flight ones to finish.
    pub async fn shutdown(&self) {
        let dropped = self.inner.queue.close();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "dropped queued requests");
        }
        drop(dropped);
        self.inner.workers.wait().await;
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    fn enqueue(
        &self,
        request: Request,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Response>, ServiceError> {
        let metrics = self.inner.engine.metrics();
        if let Err(err) = request.validate() {
            debug!("rejecting request: {err}");
            return Err(err.into());
        }
        let (reply, rx) = oneshot::channel();
        let kind = request.kind;
        let job = Job {
            request,
            deadline,
            reply,
        };
        match self.inner.queue.enqueue(kind, job) {
            Ok(()) => {
                metrics.requests_accepted.inc();
                trace!(%kind, "request queued");
                Ok(rx)
            }
            Err(err) => {
                if err == QueueError::Full {
                    metrics.requests_rejected.inc();
                }
                debug!(%kind, "rejecting request: {err}");
                Err(err.into())
            }
        }
    }
}

impl Inner {
    async fn work(&self) {
        while let Some(job) = self.queue.drain().await {
            let Job {
                request,
                deadline,
                reply,
            } = job;
            let kind = request.kind;
            match timeout_at(deadline, self.engine.handle(request)).await {
                Ok(Ok(response)) => {
                    reply.send(response).ok();
                }
                Ok(Err(err)) => {
                    warn!(%kind, "engine failed: {err:#}");
                    reply.send(Response::error(kind, format!("{err:#}"))).ok();
                }
                Err(_) => {
                    self.engine.metrics().requests_timed_out.inc();
                    debug!(%kind, "request timed out");
                }
            }
        }
        trace!("queue closed");
    }
}
