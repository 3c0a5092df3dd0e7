// Live sessions behind the server, reported by /health.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;

use crate::engine::stats::StatsCollector;

struct RelayEntry {
    stats: Arc<StatsCollector>,
    /// Set once the response body is gone; workers may still be unwinding.
    closed: bool,
}

struct PipeEntry {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Relay responses still being streamed.
    pub relay_sessions: usize,
    /// Range workers still running, including those of closed sessions.
    pub active_workers: u32,
    /// Mux processes not yet reaped.
    pub mux_processes: usize,
}

/// Entries stay until their resources are gone, not just until the response
/// ends: closed relays until their workers stopped, pipes until the process
/// was reaped.
#[derive(Default)]
pub struct SessionRegistry {
    relays: RwLock<HashMap<String, RelayEntry>>,
    pipes: RwLock<HashMap<String, PipeEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a relay session until the returned guard is dropped with the body.
    pub fn track_relay(
        self: &Arc<Self>,
        session_id: &str,
        stats: Arc<StatsCollector>,
    ) -> RelayGuard {
        self.relays.write().insert(
            session_id.to_string(),
            RelayEntry {
                stats,
                closed: false,
            },
        );
        RelayGuard {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        }
    }

    /// Track a mux process until its exit watch reports it reaped.
    pub fn track_pipe(&self, pipe_id: &str, pid: Option<u32>, exited: watch::Receiver<bool>) {
        debug!("{} tracking mux process pid {:?}", pipe_id, pid);
        self.pipes
            .write()
            .insert(pipe_id.to_string(), PipeEntry { pid, exited });
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let (relay_sessions, active_workers) = {
            let mut relays = self.relays.write();
            relays.retain(|_, entry| !entry.closed || entry.stats.active_workers() > 0);
            let open = relays.values().filter(|entry| !entry.closed).count();
            let workers = relays
                .values()
                .map(|entry| entry.stats.active_workers())
                .sum::<u32>();
            (open, workers)
        };

        let mux_processes = {
            let mut pipes = self.pipes.write();
            pipes.retain(|pipe_id, entry| {
                let reaped = *entry.exited.borrow();
                if reaped {
                    debug!("{} mux process {:?} reaped", pipe_id, entry.pid);
                }
                !reaped
            });
            pipes.len()
        };

        RegistrySnapshot {
            relay_sessions,
            active_workers,
            mux_processes,
        }
    }
}

/// Marks a relay session closed when dropped.
pub struct RelayGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.relays.write().get_mut(&self.session_id) {
            entry.closed = true;
        }
    }
}
