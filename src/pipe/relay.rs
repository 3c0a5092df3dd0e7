// Live subprocess relay. Forwards a mux process's stdout and reaps it on every exit path.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::{MuxCommand, MuxRequest};
use crate::config::MuxConfig;
use crate::error::{RelayError, Result};

static NEXT_PIPE: AtomicU64 = AtomicU64::new(1);

/// Launches the external mux process and hands back a [`PipeSession`].
#[derive(Debug, Clone)]
pub struct ProcessPipeRelay {
    config: MuxConfig,
}

impl ProcessPipeRelay {
    pub fn new(config: MuxConfig) -> Self {
        Self { config }
    }

    /// Validate a mux request and relay the configured program for it.
    pub async fn relay_mux(&self, request: &MuxRequest) -> Result<PipeSession> {
        let cmd = MuxCommand::from_request(&self.config.program, request)?;
        self.relay(&cmd.program, &cmd.args).await
    }

    /// Start `program` and wait until it either produced output or exited.
    ///
    /// Launch errors and non-zero exits with no output are returned here, before
    /// the caller has committed to a response.
    pub async fn relay(&self, program: &str, args: &[String]) -> Result<PipeSession> {
        let pipe_id = format!("pipe-{}", NEXT_PIPE.fetch_add(1, Ordering::Relaxed));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!("{} failed to spawn {}: {}", pipe_id, program, e);
                RelayError::ProcessLaunchFailure(format!("{program}: {e}"))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            RelayError::ProcessLaunchFailure("mux process has no stdout handle".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RelayError::ProcessLaunchFailure("mux process has no stderr handle".into())
        })?;

        info!(
            "{} launched {} (pid {:?}) with {} args",
            pipe_id,
            program,
            child.id(),
            args.len()
        );

        let stderr_tail = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = tokio::spawn(drain_stderr(
            stderr,
            Arc::clone(&stderr_tail),
            self.config.stderr_tail_bytes,
        ));
        let (exit_tx, _) = watch::channel(false);

        let mut session = PipeSession {
            pipe_id,
            pid: child.id(),
            child: Some(child),
            stdout: Some(stdout),
            stderr_tail,
            stderr_task: Some(stderr_task),
            exit_tx: Arc::new(exit_tx),
            cancel: CancellationToken::new(),
            chunk_size: self.config.chunk_size.max(1),
            read_timeout: self.config.read_timeout(),
            grace_period: self.config.grace_period(),
            produced: 0,
            first: None,
            finished: false,
        };
        session.prime().await?;
        Ok(session)
    }
}

/// Keep the last `limit` bytes the process wrote to stderr.
async fn drain_stderr(mut stderr: ChildStderr, tail: Arc<Mutex<Vec<u8>>>, limit: usize) {
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut tail = tail.lock();
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > limit {
                    let excess = tail.len() - limit;
                    tail.drain(..excess);
                }
            }
        }
    }
}

/// One client request on the mux path.
///
/// Owns the process handle and its stdout. Dropping the session closes stdout
/// and terminates the process: SIGTERM first, SIGKILL after the grace period.
pub struct PipeSession {
    pub pipe_id: String,
    pid: Option<u32>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<Vec<u8>>>,
    stderr_task: Option<JoinHandle<()>>,
    exit_tx: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
    chunk_size: usize,
    read_timeout: Duration,
    grace_period: Duration,
    produced: u64,
    first: Option<Bytes>,
    finished: bool,
}

impl PipeSession {
    async fn prime(&mut self) -> Result<()> {
        match self.read_chunk().await? {
            Some(data) => {
                self.first = Some(data);
                Ok(())
            }
            None => {
                self.finished = true;
                let status = self.reap().await;
                match status {
                    Some(status) if !status.success() => {
                        let stderr = self.stderr_text().await;
                        warn!(
                            "{} exited with {} before any output: {}",
                            self.pipe_id,
                            status,
                            stderr.trim()
                        );
                        Err(RelayError::ProcessExecutionFailure { stderr })
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// One read from stdout; `None` at EOF. The handle is closed on EOF and error.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.chunk_size];
        let read = tokio::select! {
            r = tokio::time::timeout(self.read_timeout, stdout.read(&mut buf)) => r,
            _ = self.cancel.cancelled() => {
                self.stdout = None;
                return Err(RelayError::ClientDisconnected);
            }
        };
        match read {
            Ok(Ok(0)) => {
                self.stdout = None;
                Ok(None)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                self.produced += n as u64;
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(e)) => {
                self.stdout = None;
                Err(RelayError::PartialTransferFailure {
                    offset: self.produced,
                    reason: format!("stdout read failed: {e}"),
                })
            }
            Err(_) => {
                self.stdout = None;
                Err(RelayError::PartialTransferFailure {
                    offset: self.produced,
                    reason: format!("no output for {:?}", self.read_timeout),
                })
            }
        }
    }

    /// Next chunk of process output; `None` after a clean exit.
    ///
    /// A non-zero exit after output was sent is reported as an error so the
    /// transport cuts the body instead of finishing it.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if let Some(first) = self.first.take() {
            return Some(Ok(first));
        }
        if self.finished {
            return None;
        }
        match self.read_chunk().await {
            Ok(Some(data)) => Some(Ok(data)),
            Ok(None) => {
                self.finished = true;
                match self.reap().await {
                    Some(status) if !status.success() => {
                        let stderr = self.stderr_text().await;
                        warn!(
                            "{} exited with {} after {} bytes, stream truncated: {}",
                            self.pipe_id,
                            status,
                            self.produced,
                            stderr.trim()
                        );
                        Some(Err(RelayError::PartialTransferFailure {
                            offset: self.produced,
                            reason: format!("mux process exited with {status}"),
                        }))
                    }
                    _ => {
                        info!("{} finished after {} bytes", self.pipe_id, self.produced);
                        None
                    }
                }
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut session| async move {
            session.next_chunk().await.map(|item| (item, session))
        })
    }

    /// Wait for the process to exit after stdout closed.
    async fn reap(&mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let status = match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("{} wait failed: {}", self.pipe_id, e);
                None
            }
            Err(_) => {
                // stdout is closed but the process lingers.
                terminate(child, self.grace_period, Arc::clone(&self.exit_tx)).await;
                return None;
            }
        };
        self.exit_tx.send_replace(true);
        status
    }

    async fn stderr_text(&mut self) -> String {
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(self.grace_period, task).await;
        }
        String::from_utf8_lossy(&self.stderr_tail.lock()).to_string()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn bytes_produced(&self) -> u64 {
        self.produced
    }

    /// Flips to `true` once the process has been reaped.
    pub fn exit_watch(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }
}

impl Drop for PipeSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.stdout = None;
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        let Some(child) = self.child.take() else {
            return;
        };
        debug!("{} dropped with live process, terminating", self.pipe_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(terminate(
                    child,
                    self.grace_period,
                    Arc::clone(&self.exit_tx),
                ));
            }
            // No runtime left: kill_on_drop takes care of it.
            Err(_) => drop(child),
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
async fn terminate(mut child: Child, grace: Duration, exited: Arc<watch::Sender<bool>>) {
    if let Ok(Some(status)) = child.try_wait() {
        debug!("mux process already exited: {}", status);
        exited.send_replace(true);
        return;
    }

    if send_sigterm(&child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("mux process exited after SIGTERM: {}", status);
                exited.send_replace(true);
                return;
            }
            Ok(Err(e)) => warn!("waiting for mux process failed: {}", e),
            Err(_) => warn!("mux process ignored SIGTERM for {:?}, killing", grace),
        }
    }

    if let Err(e) = child.kill().await {
        warn!("failed to kill mux process: {}", e);
    }
    exited.send_replace(true);
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}
