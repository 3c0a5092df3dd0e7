// Integration tests for the RelayServer HTTP surface.

mod common;

use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use serde_json::{json, Value};

use relay_engine::config::RelayConfig;
use relay_engine::server::handler::RelayServer;

use common::{FakeOrigin, OriginOptions, MIB};

const CONTENT_SIZE: usize = 10 * MIB;

async fn health(server: &RelayServer) -> Value {
    json_body(reqwest::get(server.url_for("/health")).await.unwrap()).await
}

/// Poll /health until `done` holds, for at most `limit`.
async fn wait_for_health(
    server: &RelayServer,
    limit: Duration,
    done: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let status = health(server).await;
        if done(&status) || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.fetch.part_size = MIB as u64;
    config.fetch.concurrency = 4;
    config.fetch.retry_backoff_ms = 10;
    config
}

async fn post_json(url: &str, body: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
}

async fn json_body(resp: reqwest::Response) -> Value {
    serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap()
}

#[tokio::test]
async fn test_proxy_full_download() {
    let origin = FakeOrigin::start(CONTENT_SIZE, OriginOptions::default()).await;
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": origin.url(), "filename": "Holiday clip.mp4" }),
    )
    .await;

    assert_eq!(resp.status(), 200);
    let headers = resp.headers().clone();
    assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "video/mp4");
    assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-store");
    assert_eq!(
        headers.get("x-source-length").unwrap().to_str().unwrap(),
        CONTENT_SIZE.to_string()
    );
    let disposition = headers.get(CONTENT_DISPOSITION).unwrap().to_str().unwrap();
    assert!(disposition.starts_with("attachment; filename=\"Holiday clip.mp4\""));

    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), CONTENT_SIZE);
    assert!(body == origin.content, "proxied body differs from origin");

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_mime_follows_filename() {
    let origin = FakeOrigin::start(MIB, OriginOptions::default()).await;
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": origin.url(), "filename": "song.m4a" }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "audio/mp4");
    assert_eq!(resp.bytes().await.unwrap().len(), MIB);

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_rejects_malformed_json() {
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = reqwest::Client::new()
        .post(server.url_for("/proxy"))
        .header(CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(json_body(resp).await["error"], "invalid_request");

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_rejects_empty_filename() {
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": "http://127.0.0.1:1/a.mp4", "filename": "" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "invalid_request");
    assert!(body["details"].as_str().unwrap().contains("filename"));

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_rejects_non_http_url() {
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": "file:///etc/passwd", "filename": "x.bin" }),
    )
    .await;
    assert_eq!(resp.status(), 400);

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_size_unknown_is_bad_gateway() {
    let origin = FakeOrigin::start(
        MIB,
        OriginOptions {
            reject_head: true,
            reject_ranges: true,
            ..OriginOptions::default()
        },
    )
    .await;
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": origin.url(), "filename": "movie.mp4" }),
    )
    .await;
    assert_eq!(resp.status(), 502);
    assert_eq!(json_body(resp).await["error"], "size_unknown");

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_mid_stream_failure_truncates_body() {
    let origin = FakeOrigin::start(
        4 * MIB,
        OriginOptions {
            fail_starts: vec![2 * MIB as u64],
            ..OriginOptions::default()
        },
    )
    .await;
    let server = RelayServer::start(&test_config()).await.unwrap();

    let mut resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": origin.url(), "filename": "movie.mp4" }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let mut received = Vec::new();
    let mut cut = false;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => received.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(_) => {
                cut = true;
                break;
            }
        }
    }
    assert!(cut, "body should end with a transport error");
    assert_eq!(received.len(), 2 * MIB);
    assert!(received[..] == origin.content[..2 * MIB]);

    server.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn test_combine_streams_process_output() {
    let mut config = test_config();
    // echo prints its argument vector, which stands in for mux output.
    config.mux.program = "echo".to_string();
    let server = RelayServer::start(&config).await.unwrap();

    let resp = post_json(
        &server.url_for("/combine"),
        &json!({
            "videoURL": "http://origin/v.mp4",
            "audioURL": "http://origin/a.m4a",
            "filename": "clip",
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "video/mp4");
    let disposition = resp.headers().get(CONTENT_DISPOSITION).unwrap().clone();
    assert!(disposition.to_str().unwrap().contains("clip.mp4"));

    let text = String::from_utf8(resp.bytes().await.unwrap().to_vec()).unwrap();
    assert!(text.contains("-i http://origin/v.mp4 -i http://origin/a.m4a"));
    assert!(text.trim_end().ends_with("pipe:1"));

    server.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn test_combine_process_failure_is_json() {
    let mut config = test_config();
    config.mux.program = "false".to_string();
    let server = RelayServer::start(&config).await.unwrap();

    let resp = post_json(
        &server.url_for("/combine"),
        &json!({ "url": "http://origin/v.mp4", "filename": "clip" }),
    )
    .await;
    assert_eq!(resp.status(), 502);
    assert_eq!(json_body(resp).await["error"], "process_execution_failure");

    server.shutdown();
}

#[tokio::test]
async fn test_combine_launch_failure_is_json() {
    let mut config = test_config();
    config.mux.program = "/nonexistent/ffmpeg".to_string();
    let server = RelayServer::start(&config).await.unwrap();

    let resp = post_json(
        &server.url_for("/combine"),
        &json!({ "url": "http://origin/v.mp4", "filename": "clip" }),
    )
    .await;
    assert_eq!(resp.status(), 500);
    assert_eq!(json_body(resp).await["error"], "process_launch_failure");

    server.shutdown();
}

#[tokio::test]
async fn test_combine_requires_an_input() {
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = post_json(&server.url_for("/combine"), &json!({ "filename": "clip" })).await;
    assert_eq!(resp.status(), 400);

    server.shutdown();
}

#[tokio::test]
async fn test_health() {
    let server = RelayServer::start(&test_config()).await.unwrap();

    let resp = reqwest::get(server.url_for("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["relay_sessions"], 0);
    assert_eq!(body["active_workers"], 0);
    assert_eq!(body["mux_processes"], 0);

    server.shutdown();
}

#[tokio::test]
async fn test_combine_rejects_local_inputs() {
    let server = RelayServer::start(&test_config()).await.unwrap();

    for body in [
        json!({ "url": "/etc/passwd", "filename": "clip" }),
        json!({ "url": "file:///etc/passwd", "filename": "clip" }),
        json!({ "videoURL": "concat:/etc/passwd|/etc/group", "filename": "clip" }),
        json!({
            "url": "http://origin/v.mp4",
            "thumbnailURL": "file:///etc/hosts",
            "filename": "clip",
        }),
    ] {
        let resp = post_json(&server.url_for("/combine"), &body).await;
        assert_eq!(resp.status(), 400, "accepted {body}");
        assert_eq!(json_body(resp).await["error"], "invalid_request");
    }
    assert_eq!(health(&server).await["mux_processes"], 0);

    server.shutdown();
}

#[tokio::test]
async fn test_proxy_client_disconnect_stops_workers() {
    let origin = FakeOrigin::start(
        40 * MIB,
        OriginOptions {
            slow_from: Some(2 * MIB as u64),
            slow_delay: Duration::from_millis(200),
            ..OriginOptions::default()
        },
    )
    .await;
    let mut config = test_config();
    config.fetch.part_size = 512 * 1024;
    let server = RelayServer::start(&config).await.unwrap();

    let mut resp = post_json(
        &server.url_for("/proxy"),
        &json!({ "url": origin.url(), "filename": "movie.mp4" }),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let mut received = 0usize;
    while received < 2 * MIB {
        received += resp.chunk().await.unwrap().unwrap().len();
    }
    let busy = wait_for_health(&server, Duration::from_secs(2), |h| {
        h["active_workers"].as_u64().unwrap_or(0) > 0
    })
    .await;
    assert_eq!(busy["relay_sessions"], 1);
    assert!(busy["active_workers"].as_u64().unwrap() > 0);

    // Client goes away mid-body.
    drop(resp);

    let idle = wait_for_health(&server, Duration::from_secs(2), |h| {
        h["relay_sessions"] == 0 && h["active_workers"] == 0
    })
    .await;
    assert_eq!(idle["relay_sessions"], 0, "session survived the disconnect");
    assert_eq!(idle["active_workers"], 0, "workers survived the disconnect");

    server.shutdown();
}

#[cfg(unix)]
#[tokio::test]
async fn test_combine_client_disconnect_reaps_process() {
    let mut config = test_config();
    // yes repeats its arguments forever, a mux process that never finishes.
    config.mux.program = "yes".to_string();
    config.mux.grace_period_ms = 200;
    let server = RelayServer::start(&config).await.unwrap();

    let mut resp = post_json(
        &server.url_for("/combine"),
        &json!({ "url": "http://origin/v.mp4", "filename": "clip" }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let first = resp.chunk().await.unwrap().unwrap();
    assert!(!first.is_empty());
    assert_eq!(health(&server).await["mux_processes"], 1);

    drop(resp);

    let status = wait_for_health(&server, Duration::from_millis(1500), |h| {
        h["mux_processes"] == 0
    })
    .await;
    assert_eq!(status["mux_processes"], 0, "mux process outlived the client");

    server.shutdown();
}
