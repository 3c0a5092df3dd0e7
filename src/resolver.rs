// Stream resolution seam: a page or media URL becomes concrete stream descriptors.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::mime::extension_of;

/// One candidate stream behind a source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    pub url: String,
    pub extension: String,
    pub approx_size: Option<u64>,
    pub codec_hint: Option<String>,
}

/// Metadata extraction lives outside the relay. Implementations are called
/// once per request, before any bytes are relayed.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Vec<StreamDescriptor>>;
}

/// Treats the URL as a direct media link.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectResolver;

#[async_trait]
impl Resolver for DirectResolver {
    async fn resolve(&self, url: &str) -> Result<Vec<StreamDescriptor>> {
        let parsed = Url::parse(url).map_err(|e| anyhow!("invalid url {}: {}", url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("unsupported scheme {}", parsed.scheme()));
        }
        let extension = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(extension_of)
            .unwrap_or_default();
        Ok(vec![StreamDescriptor {
            url: parsed.to_string(),
            extension,
            approx_size: None,
            codec_hint: None,
        }])
    }
}
