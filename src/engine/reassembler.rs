// Ordered reassembly: out-of-order parts become one ascending byte stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::stats::StatsCollector;
use super::store::ReassemblyStore;
use crate::error::RelayError;

/// Upper bound on how long the consumer sleeps without re-checking the store.
pub const REASSEMBLY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Single consumer of a [`ReassemblyStore`].
///
/// Emits parts strictly by offset starting at zero. The first part that ended
/// in error terminates the sequence, so nothing after a gap is ever emitted.
pub struct OrderedReassembler {
    store: Arc<ReassemblyStore>,
    total_size: u64,
    next_offset: u64,
    cancel: CancellationToken,
    window: Option<Arc<Semaphore>>,
    stats: Option<Arc<StatsCollector>>,
    finished: bool,
}

impl OrderedReassembler {
    pub fn new(store: Arc<ReassemblyStore>, total_size: u64, cancel: CancellationToken) -> Self {
        Self {
            store,
            total_size,
            next_offset: 0,
            cancel,
            window: None,
            stats: None,
            finished: total_size == 0,
        }
    }

    /// Give back one permit on `window` for every emitted part.
    pub fn with_window(mut self, window: Arc<Semaphore>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// True once the sequence ended, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for and emit the part at the cursor.
    ///
    /// `None` marks the successful end. After an `Err` the sequence is over
    /// and every later call returns `None`.
    pub async fn next_part(&mut self) -> Option<Result<Bytes, RelayError>> {
        if self.finished {
            return None;
        }

        loop {
            if let Some(part) = self.store.take(self.next_offset) {
                return Some(self.emit(part.payload));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("reassembly cancelled at offset {}", self.next_offset);
                    self.finished = true;
                    return Some(Err(RelayError::ClientDisconnected));
                }
                _ = self.store.notified() => {}
                _ = tokio::time::sleep(REASSEMBLY_POLL_INTERVAL) => {}
            }
        }
    }

    fn emit(&mut self, payload: Result<Bytes, String>) -> Result<Bytes, RelayError> {
        let offset = self.next_offset;
        let data = match payload {
            Ok(data) if !data.is_empty() => data,
            Ok(_) => {
                self.finished = true;
                return Err(RelayError::PartialTransferFailure {
                    offset,
                    reason: "empty part".to_string(),
                });
            }
            Err(reason) => {
                warn!("part at offset {} failed, ending stream: {}", offset, reason);
                self.finished = true;
                return Err(RelayError::PartialTransferFailure { offset, reason });
            }
        };

        self.next_offset += data.len() as u64;
        if self.next_offset >= self.total_size {
            self.finished = true;
        }
        if let Some(window) = &self.window {
            window.add_permits(1);
        }
        if let Some(stats) = &self.stats {
            stats.record_emitted(data.len() as u64);
        }
        Ok(data)
    }

    /// Consume the reassembler as a stream. Not restartable.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, RelayError>> + Send + 'static {
        futures::stream::unfold(self, |mut reassembler| async move {
            reassembler
                .next_part()
                .await
                .map(|item| (item, reassembler))
        })
    }
}
