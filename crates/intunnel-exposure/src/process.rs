//! Supervision of external tunnel processes
//!
//! Each running tunnel is owned by one tokio task that watches for a shutdown
//! signal, the process output, and process exit. The adapter only keeps the
//! shutdown sender in its [`TunnelSlot`]; the child never leaves the task.

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Reporter;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long to keep collecting output after the process exits
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Adapter-private holder for the current tunnel's shutdown signal
#[derive(Debug, Default)]
pub(crate) struct TunnelSlot {
    inner: Mutex<SlotInner>,
}

#[derive(Debug, Default)]
struct SlotInner {
    next_id: u64,
    current: Option<TunnelHandle>,
}

#[derive(Debug)]
struct TunnelHandle {
    id: u64,
    shutdown_tx: oneshot::Sender<()>,
}

impl TunnelSlot {
    /// Stop any previous tunnel, then run `launch` under the slot lock
    ///
    /// `launch` receives the new tunnel id and the shutdown receiver its
    /// supervising task must watch. Holding the lock guarantees the task's
    /// [`TunnelSlot::release`] cannot run before the handle is stored.
    pub(crate) fn launch<F>(&self, launch: F) -> ProviderResult<()>
    where
        F: FnOnce(u64, oneshot::Receiver<()>) -> ProviderResult<()>,
    {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = inner.current.take() {
            debug!("Replacing tunnel {}", previous.id);
            let _ = previous.shutdown_tx.send(());
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        launch(id, shutdown_rx)?;
        inner.current = Some(TunnelHandle { id, shutdown_tx });
        Ok(())
    }

    /// Signal the current tunnel to shut down; returns whether one was running
    pub(crate) fn stop(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.current.take() {
            Some(handle) => {
                debug!("Stopping tunnel {}", handle.id);
                let _ = handle.shutdown_tx.send(());
                true
            }
            None => false,
        }
    }

    /// Forget tunnel `id` after its task finished on its own
    pub(crate) fn release(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.current.as_ref().is_some_and(|h| h.id == id) {
            inner.current = None;
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .is_some()
    }
}

/// Spawn a provider process with piped output, killed when dropped
pub(crate) fn spawn(command: &mut Command, name: &str) -> ProviderResult<Child> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command.spawn().map_err(|e| match e.kind() {
        ErrorKind::NotFound => ProviderError::Unavailable(format!("{} not found in PATH", name)),
        ErrorKind::PermissionDenied => {
            ProviderError::Unavailable(format!("{} is not executable", name))
        }
        _ => ProviderError::Unavailable(format!("failed to launch {}: {}", name, e)),
    })
}

/// Merge stdout and stderr of `child` into one line stream
pub(crate) fn output_lines(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }
    rx
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Kill the process and reap it
pub(crate) async fn terminate(child: &mut Child, name: &str) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill {}: {}", name, e);
    } else {
        debug!("{} terminated", name);
    }
}

/// What a line of provider output means
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineVerdict {
    /// The line announces the public URL
    Ready(String),
    /// The provider needs the user to sign in or enable something
    AuthRequired(String),
    /// Nothing of interest
    Ignore,
}

/// When the tunnel counts as up
#[derive(Debug, Clone)]
pub(crate) enum Readiness {
    /// A line of output carries the URL; give up after `timeout`
    FromOutput { timeout: Duration },
    /// The URL is known up front; report it once the process survived `delay`
    AfterSettle { delay: Duration, public_url: String },
}

/// Everything the supervising task needs for one tunnel process
pub(crate) struct Supervision {
    pub name: &'static str,
    pub child: Child,
    pub lines: mpsc::UnboundedReceiver<String>,
    pub shutdown_rx: oneshot::Receiver<()>,
    pub reporter: Reporter,
    pub readiness: Readiness,
    pub classify: fn(&str) -> LineVerdict,
}

/// Drive one tunnel process until shutdown, failure or exit
///
/// Reports exactly one of: ready (possibly followed by one failure when the
/// tunnel later dies), or a single failure. Nothing is reported after a
/// shutdown signal. Sign-in prompts only fail a tunnel that is not up yet;
/// once ready, only process exit ends it.
pub(crate) async fn supervise(mut s: Supervision) {
    let wait = match &s.readiness {
        Readiness::FromOutput { timeout } => *timeout,
        Readiness::AfterSettle { delay, .. } => *delay,
    };
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    let mut ready = false;
    let mut lines_open = true;

    loop {
        tokio::select! {
            _ = &mut s.shutdown_rx => {
                terminate(&mut s.child, s.name).await;
                return;
            }
            _ = &mut deadline, if !ready => {
                match &s.readiness {
                    Readiness::FromOutput { timeout } => {
                        terminate(&mut s.child, s.name).await;
                        s.reporter.failed(ProviderError::Unavailable(format!(
                            "{} did not report a public URL within {}s",
                            s.name,
                            timeout.as_secs()
                        )));
                        return;
                    }
                    Readiness::AfterSettle { public_url, .. } => {
                        info!("{} tunnel up at {}", s.name, public_url);
                        ready = true;
                        s.reporter.ready(public_url.clone());
                    }
                }
            }
            line = s.lines.recv(), if lines_open => {
                let Some(line) = line else {
                    lines_open = false;
                    continue;
                };
                match (s.classify)(&line) {
                    LineVerdict::Ready(url) if !ready => {
                        if matches!(s.readiness, Readiness::FromOutput { .. }) {
                            info!("{} tunnel up at {}", s.name, url);
                            ready = true;
                            s.reporter.ready(url);
                        }
                    }
                    LineVerdict::AuthRequired(message) if !ready => {
                        warn!("{}: {}", s.name, line);
                        terminate(&mut s.child, s.name).await;
                        s.reporter.failed(ProviderError::AuthRequired(message));
                        return;
                    }
                    _ => debug!("{}: {}", s.name, line),
                }
            }
            status = s.child.wait() => {
                let detail = match status {
                    Ok(status) => format!("{} exited unexpectedly ({})", s.name, status),
                    Err(e) => format!("{} could not be monitored: {}", s.name, e),
                };
                let auth = if ready {
                    None
                } else {
                    drain_for_auth(&mut s.lines, s.classify).await
                };
                let error = match auth {
                    Some(message) => ProviderError::AuthRequired(message),
                    None => ProviderError::Crashed(detail),
                };
                warn!("{}", error);
                s.reporter.failed(error);
                return;
            }
        }
    }
}

/// Collect trailing output after exit, looking for a sign-in request
async fn drain_for_auth(
    lines: &mut mpsc::UnboundedReceiver<String>,
    classify: fn(&str) -> LineVerdict,
) -> Option<String> {
    let drain = async {
        while let Some(line) = lines.recv().await {
            if let LineVerdict::AuthRequired(message) = classify(&line) {
                return Some(message);
            }
            debug!("{}", line);
        }
        None
    };
    tokio::time::timeout(EXIT_DRAIN_TIMEOUT, drain)
        .await
        .ok()
        .flatten()
}
