//! The heartbeater: a background task per reserved job that keeps its
//! lease alive while the handler runs.
//!
//! Needs only three shared pieces with the runloop — a monotonic `stop`
//! signal, a write-once `lost` flag, and a `done` completion signal — per
//! the design notes' "prefer a small channel/signal primitive over shared
//! mutable state" guidance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};

use crate::ops::Ops;

/// Handle to a running heartbeater task.
pub struct Heartbeater {
    stop_tx: watch::Sender<bool>,
    lost: Arc<AtomicBool>,
    done_rx: AsyncMutex<Option<oneshot::Receiver<()>>>,
}

impl Heartbeater {
    /// Spawns the background task. Performs one immediate `heartbeat`
    /// call before returning control to the caller's event loop, then
    /// repeats on a `interval_s` timer (spec §4.5.1).
    pub fn spawn(
        ops: Arc<Ops>,
        queue: String,
        job_id: String,
        lease_token: String,
        timeout_ms: i64,
        interval_s: f64,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let lost = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let lost_for_task = lost.clone();

        tokio::spawn(async move {
            if do_heartbeat(&ops, &queue, &job_id, &lease_token, timeout_ms, &lost_for_task).await {
                let mut ticker = tokio::time::interval(Duration::from_secs_f64(interval_s.max(0.01)));
                ticker.tick().await; // first tick fires immediately; we already did the immediate call above
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = ticker.tick() => {
                            if !do_heartbeat(&ops, &queue, &job_id, &lease_token, timeout_ms, &lost_for_task).await {
                                break;
                            }
                        }
                    }
                }
            }
            let _ = done_tx.send(());
        });

        Heartbeater {
            stop_tx,
            lost,
            done_rx: AsyncMutex::new(Some(done_rx)),
        }
    }

    /// Idempotent: cancels the timer. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// True once a `NOT_ACTIVE`/`TOKEN_MISMATCH` reply has been observed.
    /// Write-once and terminal: once set it never clears.
    pub fn lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the task to settle after [`Self::stop`].
    pub async fn join(&self, timeout: Duration) {
        let mut guard = self.done_rx.lock().await;
        if let Some(rx) = guard.take() {
            let _ = tokio::time::timeout(timeout, rx).await;
        }
    }
}

/// Runs one heartbeat call. Returns `false` if the timer should stop
/// (lease already lost); swallows every other error per spec §4.5.1/§7.
async fn do_heartbeat(
    ops: &Ops,
    queue: &str,
    job_id: &str,
    lease_token: &str,
    timeout_ms: i64,
    lost: &AtomicBool,
) -> bool {
    match ops.heartbeat(queue, job_id, lease_token, timeout_ms, 0).await {
        Ok(_) => true,
        Err(e) if e.is_lease_loss() => {
            log::warn!("heartbeat for {queue}/{job_id} lost the lease: {e}");
            lost.store(true, Ordering::SeqCst);
            false
        }
        Err(e) => {
            log::debug!("heartbeat for {queue}/{job_id} failed, will retry: {e}");
            true
        }
    }
}
