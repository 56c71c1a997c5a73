//! Signal handling scoped to one `consume` call (spec §4.5.2).
//!
//! Installed only for the lifetime of the owning [`crate::Client::consume`]
//! invocation and torn down on return, so a second `consume` call (or a
//! process hosting several) does not fight over the same signal. In a
//! runtime without cheap OS signal handlers, [`StopToken`] is itself a
//! perfectly good cancellation token to drive from elsewhere.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag the runloop polls between iterations.
#[derive(Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Installs interrupt/terminate handlers for as long as the returned task
/// is not aborted. Terminate always sets `stop`. Interrupt: with
/// `drain=true` the first interrupt sets `stop` ("drain then exit"); a
/// second interrupt exits the process immediately with status 130. With
/// `drain=false`, a single interrupt sets `stop`.
pub fn install(stop: StopToken, drain: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if result.is_err() {
                            return;
                        }
                        if drain && stop.is_set() {
                            log::warn!("second interrupt received while draining, exiting immediately");
                            std::process::exit(130);
                        }
                        stop.set();
                    }
                    _ = terminate.recv() => {
                        stop.set();
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if drain && stop.is_set() {
                    std::process::exit(130);
                }
                stop.set();
            }
        }
    })
}
