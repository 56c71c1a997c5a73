//! Handler-facing execution context: the safe subset of [`Ops`] a job
//! handler is allowed to touch. Never exposes lease-token-bearing
//! operations (spec §4.4) — handlers ack through the runloop, not Exec.

use std::sync::Arc;

use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::ops::{Ops, PublishOptions};

/// Passed to every handler invocation as part of the [`crate::HandlerContext`].
///
/// Carries a `default_child_id` (the current job's own id) so
/// `child_ack(key, None)` does the expected thing inside a fan-out leaf
/// job without the handler having to thread its own id through.
#[derive(Clone)]
pub struct Exec {
    ops: Arc<Ops>,
    default_child_id: String,
}

impl Exec {
    pub(crate) fn new(ops: Arc<Ops>, default_child_id: String) -> Self {
        Self {
            ops,
            default_child_id,
        }
    }

    /// Publishes a new job, same contract as [`crate::Client::publish`].
    pub async fn publish(&self, queue: &str, payload: &Json, opts: &PublishOptions) -> Result<String> {
        self.ops.publish(queue, payload, opts).await
    }

    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.ops.pause(queue).await
    }

    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.ops.resume(queue).await
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool> {
        self.ops.is_paused(queue).await
    }

    pub async fn childs_init(&self, key: &str, expected: u32) -> Result<()> {
        self.ops.childs_init(key, expected).await
    }

    /// Decrements the counter for `key`. `child_id` defaults to this
    /// handler's own job id when `None`; fails validation if both the
    /// default and the supplied id would be empty.
    pub async fn child_ack(&self, key: &str, child_id: Option<&str>) -> Result<i64> {
        let id = child_id.unwrap_or(&self.default_child_id);
        if id.is_empty() {
            return Err(Error::validation(
                "child_ack requires a non-empty child id (none was supplied and the default child id is empty)",
            ));
        }
        Ok(self.ops.child_ack(key, id).await)
    }
}
