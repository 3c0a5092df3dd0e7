// Fake origin shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use tokio::net::TcpListener;

pub const MIB: usize = 1024 * 1024;

/// Deterministic content: byte `i` is `i % 251`.
pub fn generate_content(size: usize) -> Bytes {
    Bytes::from((0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

#[derive(Clone, Default)]
pub struct OriginOptions {
    /// Range requests starting at these offsets always answer 500.
    pub fail_starts: Vec<u64>,
    /// Answer HEAD with 405 so the client must fall back to a range probe.
    pub reject_head: bool,
    /// Answer every range request with 416, hiding the size entirely.
    pub reject_ranges: bool,
    /// Ignore `Range` and send the whole resource with a 200.
    pub ignore_ranges: bool,
    /// Send full-resource bodies chunked, without `Content-Length`.
    pub chunked: bool,
    /// Leave `Accept-Ranges` out of the HEAD response.
    pub hide_accept_ranges: bool,
    /// Range requests at or beyond this offset sleep for `slow_delay` first.
    pub slow_from: Option<u64>,
    pub slow_delay: Duration,
}

#[derive(Clone)]
struct OriginState {
    content: Bytes,
    options: OriginOptions,
}

pub struct FakeOrigin {
    pub addr: SocketAddr,
    pub content: Bytes,
}

impl FakeOrigin {
    pub async fn start(size: usize, options: OriginOptions) -> Self {
        let content = generate_content(size);
        let state = OriginState {
            content: content.clone(),
            options,
        };
        let app = Router::new()
            .route("/file.mp4", get(get_handler).head(head_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { addr, content }
    }

    pub fn url(&self) -> String {
        format!("http://{}/file.mp4", self.addr)
    }
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        end.parse().ok()?
    };
    Some((start, end.min(total - 1)))
}

async fn head_handler(State(state): State<OriginState>) -> Response {
    if state.options.reject_head {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let mut resp = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_LENGTH, state.content.len().to_string()),
        ],
    )
        .into_response();
    if !state.options.hide_accept_ranges {
        resp.headers_mut().insert(
            header::ACCEPT_RANGES,
            header::HeaderValue::from_static("bytes"),
        );
    }
    resp
}

fn full_response(state: &OriginState) -> Response {
    if state.options.chunked {
        let chunks: Vec<Result<Bytes, std::io::Error>> = state
            .content
            .chunks(64 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "video/mp4".to_string())],
            Body::from_stream(futures::stream::iter(chunks)),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_LENGTH, state.content.len().to_string()),
        ],
        Body::from(state.content.clone()),
    )
        .into_response()
}

async fn get_handler(State(state): State<OriginState>, req: Request) -> Response {
    let total = state.content.len() as u64;

    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let Some(range) = range else {
        return full_response(&state);
    };
    if state.options.ignore_ranges {
        return full_response(&state);
    }

    if state.options.reject_ranges {
        return (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, "bytes */*".to_string())],
        )
            .into_response();
    }

    let Some((start, end)) = parse_range(&range, total) else {
        return (StatusCode::BAD_REQUEST, "bad range").into_response();
    };

    if state.options.fail_starts.contains(&start) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }
    if let Some(from) = state.options.slow_from {
        if start >= from {
            tokio::time::sleep(state.options.slow_delay).await;
        }
    }

    let slice = state.content.slice(start as usize..=end as usize);
    (
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total)),
            (header::CONTENT_LENGTH, slice.len().to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        Body::from(slice),
    )
        .into_response()
}
