// Multi-connection range fetcher, pulls byte ranges from the source in parallel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::partition::ByteRange;
use super::stats::StatsCollector;
use super::store::{FetchedPart, ReassemblyStore};
use crate::config::FetchConfig;
use crate::source::traits::MediaSource;

/// Dispatches ranges to a bounded pool of workers and parks the results in
/// the shared [`ReassemblyStore`].
///
/// Two semaphores bound the work: `workers` caps requests in flight and
/// `window` caps parts that are fetched but not yet emitted. Window permits
/// are taken here in ascending offset order and handed back by the consumer
/// once a part leaves the store, so a stalled head part cannot let the rest
/// of the resource pile up in memory.
pub struct RangeFetcher {
    source: Arc<dyn MediaSource>,
    store: Arc<ReassemblyStore>,
    stats: Arc<StatsCollector>,
    workers: Arc<Semaphore>,
    window: Arc<Semaphore>,
    cancel: CancellationToken,
    max_retries: u32,
    retry_backoff: Duration,
    request_timeout: Duration,
}

impl RangeFetcher {
    pub fn new(
        source: Arc<dyn MediaSource>,
        store: Arc<ReassemblyStore>,
        stats: Arc<StatsCollector>,
        config: &FetchConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            stats,
            workers: Arc::new(Semaphore::new(config.concurrency.max(1))),
            window: Arc::new(Semaphore::new(config.max_buffered_parts.max(1))),
            cancel,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Semaphore the consumer refills after emitting each part.
    pub fn window(&self) -> Arc<Semaphore> {
        Arc::clone(&self.window)
    }

    /// Start dispatching `ranges` in the background.
    ///
    /// The returned handle finishes once every range has reached a terminal
    /// state or the session was cancelled. Cancelling also aborts workers that
    /// are still mid-request.
    pub fn spawn(self, ranges: Vec<ByteRange>) -> JoinHandle<()> {
        tokio::spawn(self.dispatch(ranges))
    }

    async fn dispatch(self, ranges: Vec<ByteRange>) {
        let total = ranges.len();
        let mut in_flight = JoinSet::new();

        for range in ranges {
            let window_permit = tokio::select! {
                permit = Arc::clone(&self.window).acquire_owned() => permit,
                _ = self.cancel.cancelled() => break,
            };
            match window_permit {
                // Returned through `add_permits` by the reassembler.
                Ok(permit) => permit.forget(),
                Err(_) => break,
            }

            let worker_permit = tokio::select! {
                permit = Arc::clone(&self.workers).acquire_owned() => permit,
                _ = self.cancel.cancelled() => break,
            };
            let Ok(worker_permit) = worker_permit else {
                break;
            };

            in_flight.spawn(Self::fetch_part(
                range,
                Arc::clone(&self.source),
                Arc::clone(&self.store),
                Arc::clone(&self.stats),
                self.cancel.clone(),
                worker_permit,
                self.max_retries,
                self.retry_backoff,
                self.request_timeout,
            ));

            while in_flight.try_join_next().is_some() {}
        }

        tokio::select! {
            _ = async { while in_flight.join_next().await.is_some() {} } => {
                debug!("fetcher dispatched and finished {} ranges", total);
            }
            _ = self.cancel.cancelled() => {
                debug!("fetcher cancelled, aborting {} in-flight workers", in_flight.len());
                in_flight.abort_all();
                while in_flight.join_next().await.is_some() {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_part(
        range: ByteRange,
        source: Arc<dyn MediaSource>,
        store: Arc<ReassemblyStore>,
        stats: Arc<StatsCollector>,
        cancel: CancellationToken,
        _permit: OwnedSemaphorePermit,
        max_retries: u32,
        retry_backoff: Duration,
        request_timeout: Duration,
    ) {
        let _active = stats.worker_started();

        let payload = Self::fetch_with_retry(
            range,
            &source,
            &stats,
            &cancel,
            max_retries,
            retry_backoff,
            request_timeout,
        )
        .await;

        // Results that land after cancellation are discarded here.
        let Some(payload) = payload else {
            return;
        };
        if cancel.is_cancelled() {
            debug!("part {} dropped: session cancelled", range.start);
            return;
        }
        if !store.insert(FetchedPart {
            start: range.start,
            payload,
        }) {
            warn!("part {} completed twice, keeping the first", range.start);
        }
    }

    /// `None` means the session was cancelled before the part reached a
    /// terminal state.
    async fn fetch_with_retry(
        range: ByteRange,
        source: &Arc<dyn MediaSource>,
        stats: &Arc<StatsCollector>,
        cancel: &CancellationToken,
        max_retries: u32,
        retry_backoff: Duration,
        request_timeout: Duration,
    ) -> Option<Result<Bytes, String>> {
        for attempt in 0..=max_retries {
            if cancel.is_cancelled() {
                debug!("part {} cancelled before fetch", range.start);
                return None;
            }

            let result = tokio::select! {
                r = Self::fetch_once(range, source, request_timeout) => r,
                _ = cancel.cancelled() => {
                    debug!("part {} cancelled mid-request", range.start);
                    return None;
                }
            };

            match result {
                Ok(data) => {
                    stats.record_fetched(data.len() as u64);
                    debug!("part {} fetched ({} bytes)", range.start, data.len());
                    return Some(Ok(data));
                }
                Err(e) if attempt < max_retries => {
                    warn!(
                        "part {} fetch failed (attempt {}): {}",
                        range.start, attempt, e
                    );
                    stats.record_retry();
                    let delay = retry_backoff * (attempt + 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return None,
                    }
                }
                Err(e) => {
                    warn!(
                        "part {} fetch failed after {} retries: {}",
                        range.start, max_retries, e
                    );
                    stats.record_failed_part();
                    return Some(Err(e.to_string()));
                }
            }
        }

        None
    }

    async fn fetch_once(
        range: ByteRange,
        source: &Arc<dyn MediaSource>,
        request_timeout: Duration,
    ) -> Result<Bytes> {
        let data = tokio::time::timeout(
            request_timeout,
            source.fetch_range(range.start, range.last_byte()),
        )
        .await
        .map_err(|_| anyhow!("range {}-{} timed out", range.start, range.last_byte()))??;

        if data.len() as u64 != range.len() {
            return Err(anyhow!(
                "range {}-{} returned {} bytes, expected {}",
                range.start,
                range.last_byte(),
                data.len(),
                range.len()
            ));
        }
        Ok(data)
    }
}
