// Axum request handlers: client POSTs become relay and pipe sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::engine::session::{RelayRequest, StreamRelay};
use crate::error::RelayError;
use crate::pipe::command::MuxRequest;
use crate::pipe::relay::ProcessPipeRelay;
use crate::resolver::{DirectResolver, Resolver};
use super::registry::{RelayGuard, SessionRegistry};

/// Informational header carrying the probed origin size.
pub const SOURCE_LENGTH_HEADER: HeaderName = HeaderName::from_static("x-source-length");

pub struct AppState {
    pub relay: StreamRelay,
    pub pipe: ProcessPipeRelay,
    pub resolver: Arc<dyn Resolver>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: &RelayConfig, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            relay: StreamRelay::new(config.fetch.clone()),
            pipe: ProcessPipeRelay::new(config.mux.clone()),
            resolver,
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy", post(proxy_handler))
        .route("/combine", post(combine_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub struct RelayServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    serve_task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `config.server` and serve with the direct resolver.
    pub async fn start(config: &RelayConfig) -> Result<Self> {
        Self::start_with_resolver(config, Arc::new(DirectResolver)).await
    }

    pub async fn start_with_resolver(
        config: &RelayConfig,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        config.validate()?;
        let bind = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding {bind}"))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(Arc::new(AppState::new(config, resolver)));

        let serve_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("relay server stopped: {}", e);
            }
        });

        info!("relay server listening on {}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            serve_task,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build a loopback URL for `path` on this server.
    pub fn url_for(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port(), path)
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop accepting, then wait for in-flight responses to finish.
    pub async fn shutdown_and_wait(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.serve_task).await;
    }
}

/// Reduce a client-supplied name to something safe inside a quoted header value.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | '\\' | '/'))
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').trim();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `attachment; filename="<ascii>"; filename*=UTF-8''<encoded>`
pub fn content_disposition(name: &str) -> HeaderValue {
    let name = sanitize_filename(name);
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(&name)
    );
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download\""))
}

fn stream_headers(content_type: &str, filename: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(filename));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers
}

/// Keep `guard` alive exactly as long as the response body.
fn guarded<S: Stream>(stream: S, guard: RelayGuard) -> impl Stream<Item = S::Item> {
    stream.map(move |item| {
        let _held = &guard;
        item
    })
}

fn rejection_to_error(rejection: JsonRejection) -> RelayError {
    RelayError::InvalidRequest(rejection.body_text())
}

/// POST /proxy: relay one remote resource as an ordered parallel download.
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return rejection_to_error(rejection).into_response(),
    };
    if let Err(e) = request.validate() {
        return e.into_response();
    }

    let streams = match state.resolver.resolve(&request.url).await {
        Ok(streams) => streams,
        Err(e) => return RelayError::InvalidRequest(e.to_string()).into_response(),
    };
    let Some(stream) = streams.into_iter().next() else {
        return RelayError::InvalidRequest("no stream found for url".into()).into_response();
    };
    let resolved = RelayRequest {
        url: stream.url,
        filename: request.filename,
    };

    match state.relay.open(&resolved).await {
        Ok(session) => {
            let guard = state
                .registry
                .track_relay(&session.session_id, session.stats());
            let mut headers = stream_headers(session.content_type(), session.filename());
            headers.insert(SOURCE_LENGTH_HEADER, HeaderValue::from(session.total_size()));
            info!(
                "{} streaming {} bytes as {}",
                session.session_id,
                session.total_size(),
                session.content_type()
            );
            (
                StatusCode::OK,
                headers,
                Body::from_stream(guarded(session.into_stream(), guard)),
            )
                .into_response()
        }
        Err(e) => {
            error!("relay open failed for {}: {}", resolved.url, e);
            e.into_response()
        }
    }
}

/// POST /combine: mux remote inputs through the external process.
async fn combine_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MuxRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return rejection_to_error(rejection).into_response(),
    };

    match state.pipe.relay_mux(&request).await {
        Ok(session) => {
            state
                .registry
                .track_pipe(&session.pipe_id, session.pid(), session.exit_watch());
            let headers = stream_headers(request.content_type(), &request.output_filename());
            (
                StatusCode::OK,
                headers,
                Body::from_stream(session.into_stream()),
            )
                .into_response()
        }
        Err(e) => {
            error!("mux relay failed: {}", e);
            e.into_response()
        }
    }
}

/// GET /health, with live session counters.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(serde_json::json!({
        "status": "ok",
        "relay_sessions": snapshot.relay_sessions,
        "active_workers": snapshot.active_workers,
        "mux_processes": snapshot.mux_processes,
    }))
}
