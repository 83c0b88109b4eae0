//! HTTP surface: a single `POST /api` endpoint carrying binary envelopes.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::post,
};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Level, debug, info, span, warn};

mod error;

use self::error::{ApiError, ApiResult};
use crate::{codec, service::RequestService};

const OCTET_STREAM: &str = "application/octet-stream";

/// The HTTP server of a node.
#[derive(Debug)]
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Bind to `addr` and serve `service`.
    pub async fn spawn(addr: SocketAddr, service: RequestService) -> Result<HttpServer> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
        let http_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let app = create_app(service);
        let mut tasks = JoinSet::new();
        let shutdown = cancel.clone().cancelled_owned();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
        });
        info!("HTTP server listening on {http_addr}");
        Ok(HttpServer {
            tasks,
            http_addr,
            cancel,
        })
    }

    /// The bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stop accepting connections and wait for open ones to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.run_until_done().await
    }

    /// Wait for the server task to complete.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: anyhow::Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(anyhow::Error::from(err));
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err.into());
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(service: RequestService) -> Router {
    let trace = TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
        span!(
            Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
        )
    });
    Router::new()
        .route("/api", post(api))
        .fallback(not_found)
        .with_state(service)
        .layer(trace)
}

/// Decode a request envelope, run it and encode the response.
///
/// A response carrying an error is still returned as an envelope, with
/// status 500.
async fn api(State(service): State<RequestService>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let (request, invalid) = codec::decode_request(&body)?;
    for entry in &invalid {
        debug!(%entry, "skipped invalid entry in request");
    }
    let response = service.call(request).await.map_err(ApiError::from)?;
    let status = if response.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((
        status,
        [(header::CONTENT_TYPE, OCTET_STREAM)],
        codec::encode_response(&response),
    ))
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use testresult::TestResult;

    use super::*;
    use crate::{
        api::{ReflectionKind, Request, RequestKind},
        cache::MemoryCache,
        engine::{Engine, EngineOptions},
        keys::{KeyStore, PrivateKey},
        memory_image::MemoryImageLog,
        peer::MemPeer,
        query::{JoinQuery, RowJoin, SelectQuery},
        service::ServiceConfig,
    };

    async fn spawn_server() -> TestResult<(HttpServer, RequestService)> {
        let keys = KeyStore::new();
        keys.put_private_key(PrivateKey::generate())?;
        let opts = EngineOptions {
            pulse: Duration::from_secs(3600),
            ..Default::default()
        };
        let engine = Engine::spawn(
            opts,
            MemPeer::new(),
            Arc::new(MemoryCache::default()),
            Arc::new(MemoryImageLog::new()),
            keys,
        )
        .await?;
        let service = RequestService::spawn(&ServiceConfig::default(), engine);
        let server = HttpServer::spawn(([127, 0, 0, 1], 0).into(), service.clone()).await?;
        Ok((server, service))
    }

    async fn post(server: &HttpServer, request: &Request) -> TestResult<reqwest::Response> {
        let url = format!("http://{}/api", server.http_addr());
        let res = reqwest::Client::new()
            .post(url)
            .header(header::CONTENT_TYPE.as_str(), OCTET_STREAM)
            .body(codec::encode_request(request).to_vec())
            .send()
            .await?;
        Ok(res)
    }

    #[tokio::test]
    async fn api_roundtrip() -> TestResult {
        let (server, service) = spawn_server().await?;
        let write = JoinQuery::new("users").row(RowJoin::new("alice").entry("age", "30"));
        let res = post(&server, &Request::query(write)).await?;
        assert_eq!(res.status().as_u16(), 200);

        let res = post(&server, &Request::query(SelectQuery::new("users"))).await?;
        assert_eq!(res.status().as_u16(), 200);
        let (response, invalid) = codec::decode_response(&res.bytes().await?)?;
        assert!(invalid.is_empty());
        assert_eq!(response.kind, RequestKind::Query);
        assert_eq!(response.namespace.map(|ns| ns.to_stream().len()), Some(1));

        let res = post(&server, &Request::reflect(ReflectionKind::HeadPath)).await?;
        assert_eq!(res.status().as_u16(), 200);

        server.shutdown().await?;
        service.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn errors_are_plain_text() -> TestResult {
        let (server, service) = spawn_server().await?;

        let res = post(&server, &Request::default()).await?;
        assert_eq!(res.status().as_u16(), 500);
        assert!(res.text().await?.contains("invalid request"));

        let url = format!("http://{}/api", server.http_addr());
        let res = reqwest::Client::new()
            .post(url)
            .body(vec![0xff, 0xff, 0xff])
            .send()
            .await?;
        assert_eq!(res.status().as_u16(), 500);

        let url = format!("http://{}/nope", server.http_addr());
        let res = reqwest::Client::new().get(url).send().await?;
        assert_eq!(res.status().as_u16(), 404);

        server.shutdown().await?;
        service.shutdown().await;
        Ok(())
    }
}
