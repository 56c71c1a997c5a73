//! The typed operation surface: one method per server-side script,
//! argument marshalling, response parsing, and the NOSCRIPT-recovery
//! `invoke` helper described in spec §4.3.
//!
//! Every mutating call here goes through [`Ops::invoke`], which mirrors
//! the teacher's `Script::key(..).arg(..).invoke_async(&mut conn)` call
//! shape but adds the explicit process-wide recovery mutex spec §5
//! requires beyond what the `redis` crate's own script cache gives for
//! free.

use std::sync::Arc;

use once_cell::sync::Lazy;
use redis::Value;
use serde_json::Value as Json;
use tokio::sync::Mutex as AsyncMutex;

use crate::clock;
use crate::conn::StoreConnection;
use crate::error::{Error, Result};
use crate::keys;
use crate::scripts::ScriptBundle;

/// Serializes to decimal strings, as spec §4.3 requires for integer args.
fn arg_i64(n: i64) -> Vec<u8> {
    n.to_string().into_bytes()
}

fn arg_str(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

/// Guards the single recovery `EVAL` issued after a NOSCRIPT reply.
/// Process-wide and shared across every [`Ops`]/[`crate::Client`] in the
/// program, per spec §5 — not per-connection, not per-client.
static RECOVERY_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

/// Outcome of a successful `reserve` call.
#[derive(Clone, Debug)]
pub struct ReservedJob {
    pub job_id: String,
    pub payload_raw: String,
    pub lock_until_ms: i64,
    pub attempt: i64,
    pub gid: String,
    pub lease_token: String,
}

/// Result of [`Ops::reserve`].
#[derive(Clone, Debug)]
pub enum ReserveOutcome {
    Empty,
    Paused,
    Job(ReservedJob),
}

/// Result of [`Ops::ack_fail`].
#[derive(Clone, Debug)]
pub enum AckFailOutcome {
    Retry { due_ms: i64 },
    Failed,
}

/// Per-id outcome in a batch call ([`Ops::retry_failed_batch`],
/// [`Ops::remove_jobs_batch`]).
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub job_id: String,
    pub ok: bool,
    pub reason: Option<String>,
}

/// Input to [`Ops::publish`]. Defaults match spec §4.3.
#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub job_id: Option<String>,
    pub max_attempts: u32,
    pub timeout_ms: i64,
    pub backoff_ms: i64,
    pub due_ms: i64,
    pub gid: String,
    pub group_limit: u32,
    /// Pins the server's notion of "now" for deterministic testing. Zero
    /// means "use the local wall clock".
    pub now_ms_override: i64,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            max_attempts: 3,
            timeout_ms: 30_000,
            backoff_ms: 5_000,
            due_ms: 0,
            gid: String::new(),
            group_limit: 0,
            now_ms_override: 0,
        }
    }
}

/// The typed operation surface invoked by [`crate::Client`],
/// [`crate::exec::Exec`], and the consumer runloop.
#[derive(Clone)]
pub struct Ops {
    conn: StoreConnection,
    scripts: Arc<ScriptBundle>,
}

impl Ops {
    pub(crate) fn new(conn: StoreConnection, scripts: Arc<ScriptBundle>) -> Self {
        Self { conn, scripts }
    }

    /// Current wall-clock ms, honoring `now_ms_override` when non-zero.
    fn effective_now(now_ms_override: i64) -> i64 {
        if now_ms_override != 0 {
            now_ms_override
        } else {
            clock::now_ms()
        }
    }

    /// `EVALSHA`, falling back to a mutex-guarded `EVAL` on NOSCRIPT.
    /// This is the single chokepoint every script call in this module
    /// routes through, per spec §4.3.
    async fn invoke(&self, name: &'static str, key: &str, args: &[Vec<u8>]) -> Result<Value> {
        let script = self.scripts.get(name);
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(&script.sha1).arg(1).arg(key);
        for a in args {
            cmd.arg(a);
        }
        match conn.query_async::<Value>(&cmd).await {
            Ok(v) => Ok(v),
            Err(e) => {
                let wrapped = Error::Transport(e);
                if !wrapped.is_noscript() {
                    return Err(wrapped);
                }
                log::warn!("{name}: NOSCRIPT, recovering via EVAL under process-wide lock");
                let _guard = RECOVERY_LOCK.lock().await;
                let mut cmd = redis::cmd("EVAL");
                cmd.arg(&script.source).arg(1).arg(key);
                for a in args {
                    cmd.arg(a);
                }
                conn.query_async::<Value>(&cmd).await.map_err(Error::Transport)
            }
        }
    }

    // -- publish ---------------------------------------------------------

    /// Publishes a job. Rejects payloads that are not JSON objects or
    /// arrays without contacting the store (spec P2).
    pub async fn publish(&self, queue: &str, payload: &Json, opts: &PublishOptions) -> Result<String> {
        if !payload.is_object() && !payload.is_array() {
            return Err(Error::validation(
                "publish payload must be a JSON object or array; wrap primitives before publishing",
            ));
        }
        let job_id = opts.job_id.clone().unwrap_or_else(clock::new_job_id);
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| Error::validation(format!("failed to serialize payload: {e}")))?;
        let now = Self::effective_now(opts.now_ms_override);

        let args = vec![
            arg_str(&job_id),
            payload_json.into_bytes(),
            arg_i64(opts.max_attempts as i64),
            arg_i64(opts.timeout_ms),
            arg_i64(opts.backoff_ms),
            arg_i64(opts.due_ms),
            arg_str(&opts.gid),
            arg_i64(opts.group_limit as i64),
            arg_i64(now),
        ];

        let reply = self.invoke("enqueue", &keys::queue_anchor(queue), &args).await?;
        let items = expect_array("enqueue", &reply)?;
        match items.first() {
            Some(v) if value_discriminant(v) == "OK" => Ok(job_id),
            _ => Err(Error::protocol("enqueue", &reply)),
        }
    }

    // -- reserve / lease lifecycle ----------------------------------------

    pub async fn reserve(&self, queue: &str, now_ms_override: i64) -> Result<ReserveOutcome> {
        let now = Self::effective_now(now_ms_override);
        let lease_token = clock::new_job_id();
        let args = vec![arg_i64(now), arg_str(&lease_token)];
        let reply = self.invoke("reserve", &keys::queue_anchor(queue), &args).await?;
        let items = expect_array("reserve", &reply)?;

        match items.first().map(value_discriminant).as_deref() {
            Some("EMPTY") => Ok(ReserveOutcome::Empty),
            Some("PAUSED") => Ok(ReserveOutcome::Paused),
            Some("JOB") if items.len() == 7 => {
                let job_id = value_to_string("reserve", &items[1])?;
                let payload_raw = value_to_string("reserve", &items[2])?;
                let lock_until_ms = value_to_i64("reserve", &items[3])?;
                let attempt = value_to_i64("reserve", &items[4])?;
                let gid = value_to_string("reserve", &items[5])?;
                let lease_token = value_to_string("reserve", &items[6])?;
                Ok(ReserveOutcome::Job(ReservedJob {
                    job_id,
                    payload_raw,
                    lock_until_ms,
                    attempt,
                    gid,
                    lease_token,
                }))
            }
            _ => Err(Error::protocol("reserve", &reply)),
        }
    }

    pub async fn heartbeat(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
        timeout_ms: i64,
        now_ms_override: i64,
    ) -> Result<i64> {
        let now = Self::effective_now(now_ms_override);
        let args = vec![
            arg_str(job_id),
            arg_str(lease_token),
            arg_i64(now),
            arg_i64(timeout_ms),
        ];
        let reply = self.invoke("heartbeat", &keys::queue_anchor(queue), &args).await?;
        ok_with_i64("heartbeat", &reply)
    }

    pub async fn ack_success(&self, queue: &str, job_id: &str, lease_token: &str) -> Result<()> {
        let args = vec![arg_str(job_id), arg_str(lease_token)];
        let reply = self.invoke("ack_success", &keys::queue_anchor(queue), &args).await?;
        ok_unit("ack_success", &reply)
    }

    pub async fn ack_fail(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
        error: Option<&str>,
        now_ms_override: i64,
    ) -> Result<AckFailOutcome> {
        let now = Self::effective_now(now_ms_override);
        let args = vec![
            arg_str(job_id),
            arg_str(lease_token),
            arg_i64(now),
            arg_str(error.unwrap_or("")),
        ];
        let reply = self.invoke("ack_fail", &keys::queue_anchor(queue), &args).await?;
        let items = expect_array("ack_fail", &reply)?;
        match items.first().map(value_discriminant).as_deref() {
            Some("RETRY") if items.len() >= 2 => Ok(AckFailOutcome::Retry {
                due_ms: value_to_i64("ack_fail", &items[1])?,
            }),
            Some("FAILED") => Ok(AckFailOutcome::Failed),
            Some("ERR") if items.len() >= 2 => Err(Error::script(
                "ack_fail",
                value_to_string("ack_fail", &items[1])?,
            )),
            _ => Err(Error::protocol("ack_fail", &reply)),
        }
    }

    // -- background maintenance -------------------------------------------

    pub async fn promote_delayed(&self, queue: &str, batch: u32, now_ms_override: i64) -> Result<i64> {
        let now = Self::effective_now(now_ms_override);
        let args = vec![arg_i64(now), arg_i64(batch as i64)];
        let reply = self
            .invoke("promote_delayed", &keys::queue_anchor(queue), &args)
            .await?;
        ok_with_i64("promote_delayed", &reply)
    }

    pub async fn reap_expired(&self, queue: &str, batch: u32, now_ms_override: i64) -> Result<i64> {
        let now = Self::effective_now(now_ms_override);
        let args = vec![arg_i64(now), arg_i64(batch as i64)];
        let reply = self
            .invoke("reap_expired", &keys::queue_anchor(queue), &args)
            .await?;
        ok_with_i64("reap_expired", &reply)
    }

    // -- pause / resume ----------------------------------------------------

    pub async fn pause(&self, queue: &str) -> Result<()> {
        self.invoke("pause", &keys::queue_anchor(queue), &[]).await?;
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> Result<()> {
        self.invoke("resume", &keys::queue_anchor(queue), &[]).await?;
        Ok(())
    }

    pub async fn is_paused(&self, queue: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .query_async(redis::cmd("EXISTS").arg(keys::paused_flag(queue)))
            .await?;
        Ok(exists)
    }

    // -- administrative retry/remove ---------------------------------------

    pub async fn retry_failed(&self, queue: &str, job_id: &str, now_ms_override: i64) -> Result<()> {
        let now = Self::effective_now(now_ms_override);
        let args = vec![arg_str(job_id), arg_i64(now)];
        let reply = self.invoke("retry_failed", &keys::queue_anchor(queue), &args).await?;
        ok_unit("retry_failed", &reply)
    }

    pub async fn retry_failed_batch(
        &self,
        queue: &str,
        job_ids: &[String],
        now_ms_override: i64,
    ) -> Result<Vec<BatchItem>> {
        check_batch_size(job_ids)?;
        let now = Self::effective_now(now_ms_override);
        let mut args = vec![arg_i64(now)];
        args.extend(job_ids.iter().map(|id| arg_str(id)));
        let reply = self
            .invoke("retry_failed_batch", &keys::queue_anchor(queue), &args)
            .await?;
        parse_batch_reply("retry_failed_batch", &reply)
    }

    pub async fn remove_job(&self, queue: &str, job_id: &str) -> Result<()> {
        let args = vec![arg_str(job_id)];
        let reply = self.invoke("remove_job", &keys::queue_anchor(queue), &args).await?;
        ok_unit("remove_job", &reply)
    }

    pub async fn remove_jobs_batch(&self, queue: &str, job_ids: &[String]) -> Result<Vec<BatchItem>> {
        check_batch_size(job_ids)?;
        let args: Vec<Vec<u8>> = job_ids.iter().map(|id| arg_str(id)).collect();
        let reply = self
            .invoke("remove_jobs_batch", &keys::queue_anchor(queue), &args)
            .await?;
        parse_batch_reply("remove_jobs_batch", &reply)
    }

    // -- child counters -----------------------------------------------------

    pub async fn childs_init(&self, key: &str, expected: u32) -> Result<()> {
        let anchor = keys::childs_anchor(key)?;
        let args = vec![arg_i64(expected as i64)];
        let reply = self.invoke("childs_init", &anchor, &args).await?;
        ok_unit("childs_init", &reply)
    }

    /// Decrements the counter for `child_id`. Swallows every error
    /// (transport included) and returns `-1`, per spec §7/§9: this
    /// conflates "already exhausted" with "server unreachable" by design,
    /// to stay idempotent under retries.
    pub async fn child_ack(&self, key: &str, child_id: &str) -> i64 {
        let result: Result<i64> = async {
            let anchor = keys::childs_anchor(key)?;
            let args = vec![arg_str(child_id)];
            let reply = self.invoke("child_ack", &anchor, &args).await?;
            let items = expect_array("child_ack", &reply)?;
            match items.first().map(value_discriminant).as_deref() {
                Some("OK") if items.len() >= 2 => value_to_i64("child_ack", &items[1]),
                _ => Ok(-1),
            }
        }
        .await;

        match result {
            Ok(remaining) => remaining,
            Err(e) => {
                log::warn!("child_ack({key}, {child_id}) failed, returning sentinel: {e}");
                -1
            }
        }
    }

    // -- direct store reads (spec §6.1) --------------------------------------

    /// Reads `timeout_ms` straight from the job hash; falls back to
    /// `default` if the field is absent or non-positive.
    pub async fn job_timeout_ms(&self, queue: &str, job_id: &str, default: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .query_async(redis::cmd("HGET").arg(keys::job_hash(queue, job_id)).arg("timeout_ms"))
            .await?;
        Ok(match raw.and_then(|s| s.parse::<i64>().ok()) {
            Some(v) if v > 0 => v,
            _ => default,
        })
    }
}

fn check_batch_size(ids: &[String]) -> Result<()> {
    if ids.len() > 100 {
        return Err(Error::validation(format!(
            "batch size {} exceeds the 100-id cap",
            ids.len()
        )));
    }
    Ok(())
}

/// A loose "what is this value's type tag" helper used for discriminant
/// matching (`"OK"`, `"ERR"`, `"EMPTY"`, ...) regardless of whether the
/// script returned a simple string or a bulk string for it.
fn value_discriminant(v: &Value) -> String {
    value_to_string("<discriminant>", v).unwrap_or_default()
}

fn expect_array<'a>(op: &'static str, v: &'a Value) -> Result<&'a Vec<Value>> {
    match v {
        Value::Array(items) => Ok(items),
        _ => Err(Error::protocol(op, v)),
    }
}

fn value_to_string(op: &'static str, v: &Value) -> Result<String> {
    match v {
        Value::BulkString(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Ok(s.clone()),
        Value::Okay => Ok("OK".to_string()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Nil => Ok(String::new()),
        _ => Err(Error::protocol(op, v)),
    }
}

fn value_to_i64(op: &'static str, v: &Value) -> Result<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes)
            .parse::<i64>()
            .map_err(|_| Error::protocol(op, v)),
        Value::SimpleString(s) => s.parse::<i64>().map_err(|_| Error::protocol(op, v)),
        _ => Err(Error::protocol(op, v)),
    }
}

/// Parses the common `["OK"]` / `["ERR", reason]` shape shared by several
/// operations into `Result<()>`.
fn ok_unit(op: &'static str, v: &Value) -> Result<()> {
    let items = expect_array(op, v)?;
    match items.first().map(value_discriminant).as_deref() {
        Some("OK") => Ok(()),
        Some("ERR") if items.len() >= 2 => Err(Error::script(op, value_to_string(op, &items[1])?)),
        _ => Err(Error::protocol(op, v)),
    }
}

/// Parses `["OK", n]` into `Result<i64>`, used by `heartbeat`,
/// `promote_delayed`, and `reap_expired`.
fn ok_with_i64(op: &'static str, v: &Value) -> Result<i64> {
    let items = expect_array(op, v)?;
    match items.first().map(value_discriminant).as_deref() {
        Some("OK") if items.len() >= 2 => value_to_i64(op, &items[1]),
        Some("ERR") if items.len() >= 2 => Err(Error::script(op, value_to_string(op, &items[1])?)),
        _ => Err(Error::protocol(op, v)),
    }
}

/// Parses the flat `[job_id, status, reason?]*N` batch reply shape shared
/// by `retry_failed_batch` and `remove_jobs_batch`.
fn parse_batch_reply(op: &'static str, v: &Value) -> Result<Vec<BatchItem>> {
    let items = expect_array(op, v)?;
    if let Some(first) = items.first() {
        if value_discriminant(first) == "ERR" {
            let reason = items
                .get(1)
                .map(|r| value_to_string(op, r))
                .transpose()?
                .unwrap_or_default();
            return Err(Error::script(op, reason));
        }
    }

    let mut out = Vec::new();
    let mut i = 0;
    while i < items.len() {
        let job_id = value_to_string(op, &items[i])?;
        let status = items
            .get(i + 1)
            .map(|s| value_to_string(op, s))
            .transpose()?
            .ok_or_else(|| Error::protocol(op, v))?;
        let ok = status == "OK";
        let (reason, advance) = if ok {
            (None, 2)
        } else {
            let reason = items.get(i + 2).map(|r| value_to_string(op, r)).transpose()?;
            (reason, 3)
        };
        out.push(BatchItem { job_id, ok, reason });
        i += advance;
    }
    Ok(out)
}
