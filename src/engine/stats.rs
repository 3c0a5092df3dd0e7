// Live statistics for one relay session.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

struct StatsSample {
    at: Instant,
    fetched_bytes: u64,
    emitted_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub fetch_bps: u64,
    pub emit_bps: u64,
    pub fetched_bytes: u64,
    pub emitted_bytes: u64,
    pub buffered_parts: usize,
    pub active_workers: u32,
    pub retries: u64,
    pub failed_parts: u64,
}

pub struct StatsCollector {
    fetched_bytes_total: AtomicU64,
    emitted_bytes_total: AtomicU64,
    active_workers: AtomicU32,
    retries: AtomicU64,
    failed_parts: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

/// Counts one running worker for as long as it is alive, including when the
/// task is aborted mid-request.
pub struct WorkerGuard {
    stats: Arc<StatsCollector>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.stats.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            fetched_bytes_total: AtomicU64::new(0),
            emitted_bytes_total: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            retries: AtomicU64::new(0),
            failed_parts: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                fetched_bytes: 0,
                emitted_bytes: 0,
            }),
        }
    }

    pub fn record_fetched(&self, bytes: u64) {
        self.fetched_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, bytes: u64) {
        self.emitted_bytes_total.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_part(&self) {
        self.failed_parts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_started(self: &Arc<Self>) -> WorkerGuard {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        WorkerGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, buffered_parts: usize) -> StatsSnapshot {
        let now = Instant::now();
        let current_fetched = self.fetched_bytes_total.load(Ordering::Relaxed);
        let current_emitted = self.emitted_bytes_total.load(Ordering::Relaxed);

        let (fetch_bps, emit_bps) = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();

            let rates = if elapsed > 0.1 {
                let f = ((current_fetched - sample.fetched_bytes) as f64 / elapsed) as u64;
                let e = ((current_emitted - sample.emitted_bytes) as f64 / elapsed) as u64;
                (f, e)
            } else {
                (0, 0)
            };

            // Update sample for next call
            sample.at = now;
            sample.fetched_bytes = current_fetched;
            sample.emitted_bytes = current_emitted;

            rates
        };

        StatsSnapshot {
            fetch_bps,
            emit_bps,
            fetched_bytes: current_fetched,
            emitted_bytes: current_emitted,
            buffered_parts,
            active_workers: self.active_workers(),
            retries: self.retries.load(Ordering::Relaxed),
            failed_parts: self.failed_parts.load(Ordering::Relaxed),
        }
    }

    pub fn total_fetched(&self) -> u64 {
        self.fetched_bytes_total.load(Ordering::Relaxed)
    }

    pub fn total_emitted(&self) -> u64 {
        self.emitted_bytes_total.load(Ordering::Relaxed)
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
