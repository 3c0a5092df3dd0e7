use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::{debug, warn};

use super::traits::{MediaSource, SourceInfo};
use crate::config::FetchConfig;

/// Cap on the up-front allocation for one range body.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

pub struct HttpSource {
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpSource {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        let defaults = FetchConfig::default();
        Self {
            client: Client::new(),
            url,
            headers,
            request_timeout: defaults.request_timeout(),
            probe_timeout: defaults.probe_timeout(),
        }
    }

    /// Build a source using the timeouts and user agent from `config`.
    pub fn from_config(url: String, config: &FetchConfig) -> Self {
        let mut headers = HashMap::new();
        if let Some(ua) = &config.user_agent {
            headers.insert("User-Agent".to_string(), ua.clone());
        }
        Self {
            request_timeout: config.request_timeout(),
            probe_timeout: config.probe_timeout(),
            ..Self::new(url, headers)
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Build a request with the custom headers and an optional Range header.
    fn build_request(&self, method: Method, range_header: Option<&str>) -> RequestBuilder {
        let mut req = self.client.request(method, &self.url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(range) = range_header {
            req = req.header(RANGE, range);
        }
        req
    }

    /// Header-only probe. `None` when the origin rejects HEAD or hides the length.
    async fn probe_head(&self) -> Result<Option<SourceInfo>> {
        let resp = self
            .build_request(Method::HEAD, None)
            .timeout(self.probe_timeout)
            .send()
            .await?;

        let status = resp.status();
        debug!("http head probe status={}", status.as_u16());
        if !status.is_success() {
            return Ok(None);
        }

        let content_length = header_u64(&resp, CONTENT_LENGTH.as_str()).unwrap_or(0);
        if content_length == 0 {
            return Ok(None);
        }

        let supports_range = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        Ok(Some(SourceInfo {
            content_length,
            content_type: content_type_of(&resp),
            supports_range,
        }))
    }

    /// Fallback probe: request byte 0 and read the total from `Content-Range`.
    async fn probe_first_byte(&self) -> Result<SourceInfo> {
        let resp = self
            .build_request(Method::GET, Some("bytes=0-0"))
            .timeout(self.probe_timeout)
            .send()
            .await?;

        let status = resp.status();
        debug!("http range probe status={}", status.as_u16());
        if status.as_u16() != 206 {
            warn!("http range probe failed status={}", status.as_u16());
            return Err(anyhow!("range probe failed: HTTP {}", status.as_u16()));
        }

        // Content-Range: bytes 0-0/<total>
        let content_length = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| anyhow!("range probe returned no total size"))?;

        Ok(SourceInfo {
            content_length,
            content_type: content_type_of(&resp),
            supports_range: true,
        })
    }
}

fn header_u64(resp: &Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn content_type_of(resp: &Response) -> String {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Extract the total from `bytes <start>-<end>/<total>`; `*` totals yield `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let total = value.trim().rsplit('/').next()?;
    total.trim().parse::<u64>().ok().filter(|t| *t > 0)
}

#[async_trait]
impl MediaSource for HttpSource {
    async fn probe(&self) -> Result<SourceInfo> {
        match self.probe_head().await {
            Ok(Some(info)) if info.supports_range => return Ok(info),
            // Plenty of origins serve ranges without advertising them; ask directly.
            Ok(Some(info)) => {
                debug!("head probe did not advertise byte ranges, checking with a range probe");
                return Ok(self.probe_first_byte().await.unwrap_or(info));
            }
            Ok(None) => debug!("head probe gave no length, falling back to range probe"),
            Err(e) => warn!("head probe failed, falling back to range probe: {}", e),
        }
        self.probe_first_byte().await
    }

    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let range = format!("bytes={}-{}", start, end);
        let mut resp = self
            .build_request(Method::GET, Some(&range))
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = resp.status();
        // A plain 200 is only the right bytes when the range starts at zero;
        // the length check below rejects it if the body is longer.
        let accepted = status.as_u16() == 206 || (status.as_u16() == 200 && start == 0);
        if !accepted {
            warn!(
                "http fetch failed status={} range={}",
                status.as_u16(),
                range
            );
            return Err(anyhow!("fetch_range failed: HTTP {}", status.as_u16()));
        }

        let expected = end - start + 1;
        // An origin that ignored Range answers with the whole resource; refuse
        // it up front instead of reading it.
        if let Some(len) = resp.content_length() {
            if len != expected {
                return Err(anyhow!(
                    "fetch_range content-length {} does not match {} bytes for {}",
                    len,
                    expected,
                    range
                ));
            }
        }

        let mut body = BytesMut::with_capacity(expected.min(MAX_PREALLOC) as usize);
        while let Some(chunk) = resp.chunk().await? {
            if (body.len() + chunk.len()) as u64 > expected {
                return Err(anyhow!(
                    "fetch_range body exceeds {} bytes for {}",
                    expected,
                    range
                ));
            }
            body.extend_from_slice(&chunk);
        }
        if body.len() as u64 != expected {
            return Err(anyhow!(
                "fetch_range short body: got {} bytes, expected {} for {}",
                body.len(),
                expected,
                range
            ));
        }
        Ok(body.freeze())
    }
}
