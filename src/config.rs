// Relay configuration loaded from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Size of each byte range requested from the origin (1 MB).
pub const DEFAULT_PART_SIZE: u64 = 1024 * 1024;

/// Number of range requests in flight per session.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Parts that may sit fetched-but-unsent before the dispatcher pauses.
pub const DEFAULT_MAX_BUFFERED_PARTS: usize = 32;

/// Retries per range after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between range attempts; attempt `n` waits `n + 1` times this.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Size of each read from the mux process stdout (64 KB).
pub const DEFAULT_PIPE_CHUNK_SIZE: usize = 64 * 1024;

/// How much of the mux process stderr is kept for diagnostics.
pub const DEFAULT_STDERR_TAIL_BYTES: usize = 8 * 1024;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 14032;

/// Top-level configuration, usually read from a TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub mux: MuxConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Range fetcher settings, one copy per session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Size of each byte range in bytes.
    pub part_size: u64,
    /// Maximum number of concurrent range requests.
    pub concurrency: usize,
    /// Upper bound on completed parts waiting to be emitted.
    pub max_buffered_parts: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Timeout applied to every single range request.
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// Sent as `User-Agent` to the origin when set.
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            max_buffered_parts: DEFAULT_MAX_BUFFERED_PARTS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            request_timeout_secs: 30,
            probe_timeout_secs: 15,
            user_agent: None,
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// External mux process settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Program launched for the mux path.
    pub program: String,
    pub chunk_size: usize,
    /// Timeout for a single stdout read.
    pub read_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL on teardown.
    pub grace_period_ms: u64,
    pub stderr_tail_bytes: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            chunk_size: DEFAULT_PIPE_CHUNK_SIZE,
            read_timeout_secs: 60,
            grace_period_ms: 1000,
            stderr_tail_bytes: DEFAULT_STDERR_TAIL_BYTES,
        }
    }
}

impl MuxConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl RelayConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("invalid relay config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise return the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml_str(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch.part_size == 0 {
            return Err(anyhow!("fetch.part_size must be > 0"));
        }
        if self.fetch.concurrency == 0 {
            return Err(anyhow!("fetch.concurrency must be > 0"));
        }
        if self.fetch.max_buffered_parts == 0 {
            return Err(anyhow!("fetch.max_buffered_parts must be > 0"));
        }
        if self.mux.chunk_size == 0 {
            return Err(anyhow!("mux.chunk_size must be > 0"));
        }
        if self.mux.program.trim().is_empty() {
            return Err(anyhow!("mux.program must not be empty"));
        }
        Ok(())
    }
}
