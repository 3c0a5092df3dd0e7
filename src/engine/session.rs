// Relay session lifecycle, from probe to teardown on disconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::RangeFetcher;
use super::partition::partition;
use super::reassembler::OrderedReassembler;
use super::stats::{StatsCollector, StatsSnapshot};
use super::store::ReassemblyStore;
use crate::config::FetchConfig;
use crate::error::{RelayError, Result};
use crate::mime::mime_for_filename;
use crate::source::http_source::HttpSource;
use crate::source::traits::{MediaSource, SourceInfo};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Body of a fetch-path request.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayRequest {
    pub url: String,
    pub filename: String,
}

impl RelayRequest {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(RelayError::InvalidRequest("url must not be empty".into()));
        }
        if self.filename.trim().is_empty() {
            return Err(RelayError::InvalidRequest("filename must not be empty".into()));
        }
        Ok(())
    }
}

/// Entry point of the fetch path: opens one [`RelaySession`] per request.
#[derive(Debug, Clone)]
pub struct StreamRelay {
    config: FetchConfig,
}

impl StreamRelay {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Validate, probe the origin over HTTP and start relaying.
    pub async fn open(&self, request: &RelayRequest) -> Result<RelaySession> {
        request.validate()?;
        let source = Arc::new(HttpSource::from_config(request.url.clone(), &self.config));
        self.open_source(source, request).await
    }

    /// Same as [`StreamRelay::open`] for an arbitrary source.
    ///
    /// Returns once the first part is in hand, so every failure up to that
    /// point still reaches the caller as an error instead of a cut stream.
    pub async fn open_source(
        &self,
        source: Arc<dyn MediaSource>,
        request: &RelayRequest,
    ) -> Result<RelaySession> {
        request.validate()?;

        let session_id = format!("relay-{}", NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        let info = source.probe().await.map_err(|e| {
            warn!("session {} probe failed: {}", session_id, e);
            RelayError::SizeUnknown {
                url: request.url.clone(),
            }
        })?;
        if info.content_length == 0 {
            return Err(RelayError::SizeUnknown {
                url: request.url.clone(),
            });
        }
        if !info.supports_range {
            warn!("session {} origin does not serve byte ranges", session_id);
            return Err(RelayError::Upstream(format!(
                "{} does not serve byte ranges",
                request.url
            )));
        }

        info!(
            "session {} probed: {} bytes, type={}, part_size={}, concurrency={}",
            session_id,
            info.content_length,
            info.content_type,
            self.config.part_size,
            self.config.concurrency
        );

        let mut session = RelaySession::start(
            session_id,
            source,
            info,
            request.filename.clone(),
            &self.config,
        );
        session.prime().await?;
        Ok(session)
    }
}

/// One client request on the fetch path.
///
/// Owns the worker pool, the store and the cursor. Dropping it (for example
/// when the response body is dropped after a disconnect) cancels every worker
/// and discards buffered parts.
pub struct RelaySession {
    pub session_id: String,
    info: SourceInfo,
    filename: String,
    content_type: String,
    store: Arc<ReassemblyStore>,
    stats: Arc<StatsCollector>,
    reassembler: OrderedReassembler,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    first: Option<Bytes>,
    started: Instant,
}

impl RelaySession {
    fn start(
        session_id: String,
        source: Arc<dyn MediaSource>,
        info: SourceInfo,
        filename: String,
        config: &FetchConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let store = Arc::new(ReassemblyStore::new());
        let stats = Arc::new(StatsCollector::new());

        let fetcher = RangeFetcher::new(
            source,
            Arc::clone(&store),
            Arc::clone(&stats),
            config,
            cancel.clone(),
        );
        let reassembler =
            OrderedReassembler::new(Arc::clone(&store), info.content_length, cancel.clone())
                .with_window(fetcher.window())
                .with_stats(Arc::clone(&stats));
        let dispatcher = fetcher.spawn(partition(info.content_length, config.part_size));

        Self {
            session_id,
            content_type: mime_for_filename(&filename),
            info,
            filename,
            store,
            stats,
            reassembler,
            cancel,
            dispatcher,
            first: None,
            started: Instant::now(),
        }
    }

    /// Wait for offset zero so the caller can still fail cleanly.
    async fn prime(&mut self) -> Result<()> {
        match self.reassembler.next_part().await {
            Some(Ok(data)) => {
                debug!(
                    "session {} first part ready after {} ms",
                    self.session_id,
                    self.started.elapsed().as_millis()
                );
                self.first = Some(data);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Next chunk of the ordered body; `None` once the resource is complete.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        self.reassembler.next_part().await
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            session.next_chunk().await.map(|item| (item, session))
        })
    }

    pub fn total_size(&self) -> u64 {
        self.info.content_length
    }

    /// Content type derived from the requested filename.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot(self.store.len())
    }

    /// Stop all workers and drop buffered parts.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let discarded = self.store.clear();
        if discarded > 0 {
            debug!(
                "session {} discarded {} buffered parts",
                self.session_id, discarded
            );
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        let emitted = self.stats.total_emitted();
        if emitted < self.info.content_length && !self.reassembler.is_finished() {
            info!(
                "session {} closed early after {} of {} bytes (origin type {})",
                self.session_id, emitted, self.info.content_length, self.info.content_type
            );
        } else {
            debug!(
                "session {} done: {} bytes in {} ms",
                self.session_id,
                emitted,
                self.started.elapsed().as_millis()
            );
        }
        self.shutdown();
        if !self.dispatcher.is_finished() {
            debug!("session {} workers unwinding", self.session_id);
        }
    }
}
