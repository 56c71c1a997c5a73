//! The consumer runloop: a single cooperative loop per call to
//! [`crate::Client::consume`] that interleaves polling, delayed-job
//! promotion, expired-lease reaping, lease heartbeating, and handler
//! execution, per spec §4.5.

mod heartbeat;
mod signals;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value as Json;

use crate::clock;
use crate::config::ConsumeOptions;
use crate::exec::Exec;
use crate::ops::{AckFailOutcome, Ops, ReserveOutcome};

pub use signals::StopToken;

/// The error a handler reports on failure. Rendered into the `ack_fail`
/// error argument as `"<name>: <message>"` per spec §4.5 step 12.
#[derive(Clone, Debug)]
pub struct HandlerFailure {
    pub name: String,
    pub message: String,
}

impl HandlerFailure {
    /// Builds a failure with the generic name `"HandlerError"`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "HandlerError".to_string(),
            message: message.into(),
        }
    }

    /// Builds a failure with an explicit name, e.g. the concrete error
    /// type a handler caught.
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    fn formatted(&self) -> String {
        format!("{}: {}", self.name, self.message)
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

impl std::error::Error for HandlerFailure {}

/// Everything a handler sees about the job it was invoked for (spec §6.3).
#[derive(Clone)]
pub struct HandlerContext {
    pub queue: String,
    pub job_id: String,
    /// Original JSON text as stored, unparsed.
    pub payload_raw: String,
    /// Parsed payload, or the raw string wrapped in [`Json::String`] if
    /// parsing failed (spec §4.5 step 9).
    pub payload: Json,
    pub attempt: i64,
    pub lock_until_ms: i64,
    pub lease_token: String,
    pub gid: String,
    pub exec: Exec,
}

/// A fallible, possibly-suspending job handler.
pub type Handler =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, Result<(), HandlerFailure>> + Send + Sync>;

/// Drives one `consume` invocation to completion. Returns once a stop has
/// been requested and the drain/no-drain rules say to exit.
pub async fn run(ops: Arc<Ops>, queue: String, handler: Handler, opts: ConsumeOptions) {
    let stop = StopToken::new();
    let signal_task = if opts.stop_on_ctrl_c {
        Some(signals::install(stop.clone(), opts.drain))
    } else {
        None
    };

    let promote_interval = Duration::from_secs_f64(opts.promote_interval_s.max(0.0));
    let reap_interval = Duration::from_secs_f64(opts.reap_interval_s.max(0.0));
    let mut last_promote = Instant::now()
        .checked_sub(promote_interval)
        .unwrap_or_else(Instant::now);
    let mut last_reap = Instant::now()
        .checked_sub(reap_interval)
        .unwrap_or_else(Instant::now);

    loop {
        // 1. stop + idle => return
        if stop.is_set() {
            break;
        }

        // 2. promote delayed jobs, swallow errors
        if last_promote.elapsed() >= promote_interval {
            if let Err(e) = ops.promote_delayed(&queue, opts.promote_batch, 0).await {
                if opts.verbose {
                    log::debug!("promote_delayed on {queue} failed: {e}");
                }
            }
            last_promote = Instant::now();
        }

        // 3. reap expired leases, swallow errors
        if last_reap.elapsed() >= reap_interval {
            if let Err(e) = ops.reap_expired(&queue, opts.reap_batch, 0).await {
                if opts.verbose {
                    log::debug!("reap_expired on {queue} failed: {e}");
                }
            }
            last_reap = Instant::now();
        }

        // 4. reserve
        let reserved = match ops.reserve(&queue, 0).await {
            Ok(r) => r,
            Err(e) => {
                if opts.verbose {
                    log::warn!("reserve on {queue} failed: {e}");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }
        };

        let job = match reserved {
            // 5. EMPTY
            ReserveOutcome::Empty => {
                tokio::time::sleep(Duration::from_secs_f64(opts.poll_interval_s.max(0.0))).await;
                continue;
            }
            // 6. PAUSED
            ReserveOutcome::Paused => {
                let backoff = clock::paused_backoff_s(opts.poll_interval_s);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                continue;
            }
            ReserveOutcome::Job(job) => job,
        };

        // 7. defensive: a JOB result must carry a lease token
        if job.lease_token.is_empty() {
            log::error!("reserve on {queue} returned job {} with no lease token", job.job_id);
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        }

        // 8. stop requested and non-draining => bail before running the handler
        if stop.is_set() && !opts.drain {
            break;
        }

        // 9. parse payload, falling back to the raw string
        let payload: Json =
            serde_json::from_str(&job.payload_raw).unwrap_or_else(|_| Json::String(job.payload_raw.clone()));

        // 10. heartbeat interval: explicit override, else derived from job_timeout_ms
        let timeout_ms = match ops.job_timeout_ms(&queue, &job.job_id, 60_000).await {
            Ok(v) => v,
            Err(e) => {
                log::debug!("job_timeout_ms lookup failed for {}, using default: {e}", job.job_id);
                60_000
            }
        };
        let interval_s = opts
            .heartbeat_interval_s
            .unwrap_or_else(|| clock::derive_heartbeat_interval_s(timeout_ms));

        let exec = Exec::new(ops.clone(), job.job_id.clone());
        let ctx = HandlerContext {
            queue: queue.clone(),
            job_id: job.job_id.clone(),
            payload_raw: job.payload_raw.clone(),
            payload,
            attempt: job.attempt,
            lock_until_ms: job.lock_until_ms,
            lease_token: job.lease_token.clone(),
            gid: job.gid.clone(),
            exec,
        };

        // 11. start the heartbeater
        let heartbeater = Arc::new(heartbeat::Heartbeater::spawn(
            ops.clone(),
            queue.clone(),
            job.job_id.clone(),
            job.lease_token.clone(),
            timeout_ms,
            interval_s,
        ));

        // 12. run the handler, then ack (unless the lease was already lost)
        let handler_result = handler(ctx).await;
        heartbeater.stop();

        if heartbeater.lost() {
            log::warn!("lease for {queue}/{} was lost during handling; skipping ack", job.job_id);
        } else {
            match handler_result {
                Ok(()) => {
                    if let Err(e) = ops.ack_success(&queue, &job.job_id, &job.lease_token).await {
                        log::warn!("ack_success failed for {queue}/{}: {e}", job.job_id);
                    }
                }
                Err(failure) => {
                    let message = failure.formatted();
                    match ops
                        .ack_fail(&queue, &job.job_id, &job.lease_token, Some(&message), 0)
                        .await
                    {
                        Ok(AckFailOutcome::Retry { due_ms }) => {
                            log::info!("job {queue}/{} scheduled for retry at {due_ms}", job.job_id);
                        }
                        Ok(AckFailOutcome::Failed) => {
                            log::info!("job {queue}/{} moved to the failed set: {message}", job.job_id);
                        }
                        Err(e) => {
                            log::warn!("ack_fail failed for {queue}/{}: {e}", job.job_id);
                        }
                    }
                }
            }
        }

        // 13. wait briefly for any in-flight heartbeat tick to settle
        heartbeater.join(Duration::from_millis(100)).await;

        // 14. stop requested and draining => return now that the job is done
        if stop.is_set() && opts.drain {
            break;
        }
    }

    if let Some(task) = signal_task {
        task.abort();
    }
}
