//! End-to-end tests against a live Redis-compatible store.
//!
//! Needs `REDIS_URL` pointed at a disposable instance/db; each test flushes
//! the db on the way out. Because a `ConnectionManager` cannot be shared
//! across the per-test tokio runtimes, every test builds (and tears down)
//! its own `Client`, and tests that touch the same keyspace should not be
//! run concurrently with `--test-threads` > 1.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use omniq::{Client, ClientOptions, ConsumeOptions, HandlerFailure, PublishOptions, ReserveOutcome};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStdout, Command};
use tokio::sync::mpsc;

async fn setup() -> Client {
    let _ = env_logger::builder().is_test(true).try_init();
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for integration tests");
    Client::create(ClientOptions::from_url(redis_url))
        .await
        .expect("failed to create client")
}

/// Flushes the db the test ran against. Mirrors the teacher's `cleanup`
/// helper, which issues a raw `FLUSHDB` after each test.
async fn cleanup(client: Client) {
    let redis_url = std::env::var("REDIS_URL").unwrap();
    let raw = redis::Client::open(redis_url.as_str()).unwrap();
    let mut conn = raw.get_connection_manager().await.unwrap();
    let _resp: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.expect("failed to flushdb");
    client.close().await.ok();
}

fn queue_name(suffix: &str) -> String {
    format!("omniq-it-{suffix}")
}

/// Flushes the db without going through a [`Client`], for tests whose
/// store activity happens inside a spawned `signal_probe` process rather
/// than a `Client` this test holds directly.
async fn flush_db() {
    let redis_url = std::env::var("REDIS_URL").unwrap();
    let raw = redis::Client::open(redis_url.as_str()).unwrap();
    let mut conn = raw.get_connection_manager().await.unwrap();
    let _resp: String = redis::cmd("FLUSHDB").query_async(&mut conn).await.expect("failed to flushdb");
}

#[tokio::test]
async fn test_publish_and_consume_happy_path() {
    let client = setup().await;
    let queue = queue_name("happy");

    let job_id = client
        .publish(&queue, &json!({"kind": "welcome_email", "to": "a@example.com"}), &PublishOptions::default())
        .await
        .expect("publish should succeed");

    let (tx, mut rx) = mpsc::channel(1);
    let handler = Arc::new(move |ctx: omniq::HandlerContext| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ctx.job_id).await;
            Ok(())
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerFailure>> + Send>>
    });

    let consume_queue = queue.clone();
    let consume_client = client.clone();
    let task = tokio::spawn(async move {
        consume_client
            .consume(&consume_queue, handler, ConsumeOptions::default())
            .await;
    });

    let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler should run within 5s")
        .expect("channel should yield the job id");
    assert_eq!(seen, job_id);

    task.abort();
    cleanup(client).await;
}

#[tokio::test]
async fn test_retry_then_dead_letter() {
    let client = setup().await;
    let queue = queue_name("retry");

    let job_id = client
        .publish(
            &queue,
            &json!({"kind": "flaky"}),
            &PublishOptions {
                max_attempts: 2,
                backoff_ms: 50,
                ..Default::default()
            },
        )
        .await
        .expect("publish should succeed");

    let (tx, mut rx) = mpsc::channel(4);
    let handler = Arc::new(move |ctx: omniq::HandlerContext| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ctx.attempt).await;
            Err(HandlerFailure::new("synthetic failure"))
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerFailure>> + Send>>
    });

    let consume_queue = queue.clone();
    let consume_client = client.clone();
    let task = tokio::spawn(async move {
        consume_client
            .consume(
                &consume_queue,
                handler,
                ConsumeOptions {
                    poll_interval_s: 0.02,
                    promote_interval_s: 0.02,
                    ..Default::default()
                },
            )
            .await;
    });

    let first_attempt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("first attempt should run")
        .unwrap();
    assert_eq!(first_attempt, 1);

    let second_attempt = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("retried attempt should run")
        .unwrap();
    assert_eq!(second_attempt, 2);

    task.abort();

    // the job has now exhausted its attempts and landed in the failed set;
    // retry_failed only succeeds against a job actually sitting there.
    client
        .retry_failed(&queue, &job_id)
        .await
        .expect("job should have moved to the failed set after exhausting attempts");

    cleanup(client).await;
}

#[tokio::test]
async fn test_pause_blocks_consumption_until_resumed() {
    let client = setup().await;
    let queue = queue_name("pause");

    client.pause(&queue).await.expect("pause should succeed");
    assert!(client.is_paused(&queue).await.unwrap());

    client
        .publish(&queue, &json!({"kind": "noop"}), &PublishOptions::default())
        .await
        .expect("publish should succeed even while paused");

    let (tx, mut rx) = mpsc::channel(1);
    let handler = Arc::new(move |ctx: omniq::HandlerContext| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(ctx.job_id).await;
            Ok(())
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HandlerFailure>> + Send>>
    });

    let consume_queue = queue.clone();
    let consume_client = client.clone();
    let task = tokio::spawn(async move {
        consume_client
            .consume(
                &consume_queue,
                handler,
                ConsumeOptions {
                    poll_interval_s: 0.02,
                    ..Default::default()
                },
            )
            .await;
    });

    // while paused, nothing should be handed to the handler
    let saw_nothing = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(saw_nothing.is_err(), "handler ran while the queue was paused");

    client.resume(&queue).await.expect("resume should succeed");
    assert!(!client.is_paused(&queue).await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler should run once resumed")
        .expect("channel should yield the job id");

    task.abort();
    cleanup(client).await;
}

#[tokio::test]
async fn test_fanout_child_ack_reaches_zero_then_sentinel() {
    let client = setup().await;
    let key = "fanout-test-doc";

    client.childs_init(key, 3).await.expect("childs_init should succeed");

    assert_eq!(client.child_ack(key, "child-a").await, 2);
    assert_eq!(client.child_ack(key, "child-b").await, 1);
    assert_eq!(client.child_ack(key, "child-c").await, 0);
    // the counter anchor is gone now; further acks return the sentinel.
    assert_eq!(client.child_ack(key, "child-d").await, -1);
    assert_eq!(client.child_ack(key, "child-a").await, -1);

    cleanup(client).await;
}

#[tokio::test]
async fn test_batch_remove_reports_per_job_outcomes() {
    let client = setup().await;
    let queue = queue_name("batch-remove");

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = client
            .publish(&queue, &json!({"i": i}), &PublishOptions::default())
            .await
            .unwrap();
        ids.push(id);
    }

    let results = client
        .remove_jobs_batch(&queue, &ids)
        .await
        .expect("remove_jobs_batch should succeed");
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.ok), "every job should have been removed cleanly");

    // removing the same ids again should report failures, not an error
    let results_again = client.remove_jobs_batch(&queue, &ids).await.unwrap();
    assert!(results_again.iter().all(|r| !r.ok), "already-removed jobs should report ok=false");
    assert!(results_again.iter().all(|r| r.reason.is_some()));

    cleanup(client).await;
}

#[tokio::test]
async fn test_publish_rejects_non_object_payload() {
    let client = setup().await;
    let queue = queue_name("validation");

    let err = client
        .publish(&queue, &json!("just a string"), &PublishOptions::default())
        .await
        .expect_err("scalar payloads must be rejected before touching the store");
    assert!(matches!(err, omniq::Error::Validation(_)));

    cleanup(client).await;
}

#[tokio::test]
async fn test_noscript_recovery_after_script_flush() {
    let client = setup().await;
    let queue = queue_name("noscript");

    let redis_url = std::env::var("REDIS_URL").unwrap();
    let raw = redis::Client::open(redis_url.as_str()).unwrap();
    let mut conn = raw.get_connection_manager().await.unwrap();
    let _resp: String = redis::cmd("SCRIPT")
        .arg("FLUSH")
        .query_async(&mut conn)
        .await
        .expect("SCRIPT FLUSH should succeed");

    // the store no longer has any script cached under its sha1; the next
    // publish must still succeed via the EVAL fallback in Ops::invoke.
    let job_id = client
        .publish(&queue, &json!({"kind": "post-flush"}), &PublishOptions::default())
        .await
        .expect("publish should recover from NOSCRIPT transparently");
    assert!(!job_id.is_empty());

    cleanup(client).await;
}

/// P4: a lease holder that presents the wrong token is rejected with
/// `TOKEN_MISMATCH` rather than being allowed to ack someone else's lease.
#[tokio::test]
async fn test_ack_with_mismatched_lease_token_is_rejected() {
    let client = setup().await;
    let queue = queue_name("token-mismatch");

    client
        .publish(&queue, &json!({"kind": "solo"}), &PublishOptions::default())
        .await
        .expect("publish should succeed");

    let reserved = match client.reserve(&queue).await.expect("reserve should succeed") {
        ReserveOutcome::Job(job) => job,
        other => panic!("expected a reserved job, got {other:?}"),
    };

    let err = client
        .ack_success(&queue, &reserved.job_id, "not-the-real-token")
        .await
        .expect_err("a mismatched lease token must be rejected");
    assert!(matches!(&err, omniq::Error::Script { reason, .. } if reason == "TOKEN_MISMATCH"));

    // the real lease holder can still ack normally afterwards
    client
        .ack_success(&queue, &reserved.job_id, &reserved.lease_token)
        .await
        .expect("the real lease token should still be able to ack");

    cleanup(client).await;
}

/// Scenario 4 ("lease loss"): `reap_expired` reclaims a job whose lease
/// timed out, after which the original holder's heartbeat and ack are both
/// rejected as `NOT_ACTIVE`, and the job is reservable again under a fresh
/// lease token.
#[tokio::test]
async fn test_scenario_lease_loss_via_reap_then_stale_ack_is_rejected() {
    let client = setup().await;
    let queue = queue_name("lease-loss");

    let job_id = client
        .publish(
            &queue,
            &json!({"kind": "slow"}),
            &PublishOptions {
                timeout_ms: 100,
                ..Default::default()
            },
        )
        .await
        .expect("publish should succeed");

    let reserved = match client.reserve(&queue).await.expect("reserve should succeed") {
        ReserveOutcome::Job(job) => job,
        other => panic!("expected a reserved job, got {other:?}"),
    };
    assert_eq!(reserved.job_id, job_id);

    // let the lease expire, then let the maintenance sweep reclaim it
    tokio::time::sleep(Duration::from_millis(200)).await;
    let reaped = client
        .reap_expired(&queue, 100)
        .await
        .expect("reap_expired should succeed");
    assert_eq!(reaped, 1, "the expired lease should have been reaped exactly once");

    // the original holder's heartbeat and ack must both be rejected now
    // that reap_expired has moved the job out of the active lane
    let heartbeat_err = client
        .heartbeat(&queue, &job_id, &reserved.lease_token, 30_000)
        .await
        .expect_err("a heartbeat against a reaped lease must fail");
    assert!(matches!(&heartbeat_err, omniq::Error::Script { reason, .. } if reason == "NOT_ACTIVE"));

    let ack_err = client
        .ack_success(&queue, &job_id, &reserved.lease_token)
        .await
        .expect_err("an ack against a reaped lease must fail");
    assert!(matches!(&ack_err, omniq::Error::Script { reason, .. } if reason == "NOT_ACTIVE"));

    // the job is back in the ready lane; a fresh reserve sees it as a new attempt
    let reserved_again = match client.reserve(&queue).await.expect("reserve should succeed") {
        ReserveOutcome::Job(job) => job,
        other => panic!("expected the requeued job to be reservable again, got {other:?}"),
    };
    assert_eq!(reserved_again.job_id, job_id);
    assert_eq!(reserved_again.attempt, 2);
    assert_ne!(reserved_again.lease_token, reserved.lease_token);

    client
        .ack_success(&queue, &job_id, &reserved_again.lease_token)
        .await
        .expect("the new lease holder should be able to ack normally");

    cleanup(client).await;
}

/// Builds a `signal_probe` child process wired to the live store, with its
/// stdout piped so the test can watch for `READY`/`HANDLING`/`DONE`.
fn probe_command(queue: &str, handler_sleep_ms: u64) -> Command {
    let redis_url = std::env::var("REDIS_URL").unwrap();
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_signal_probe"));
    cmd.env("REDIS_URL", redis_url)
        .env("OMNIQ_PROBE_QUEUE", queue)
        .env("OMNIQ_PROBE_SLEEP_MS", handler_sleep_ms.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    cmd
}

/// Reads lines from the probe's stdout until one starts with `prefix`.
async fn wait_for_line(lines: &mut Lines<BufReader<ChildStdout>>, prefix: &str) {
    loop {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("probe should print a line before the timeout")
            .expect("reading probe stdout should not fail")
            .expect("probe stdout closed before printing the expected line");
        if line.starts_with(prefix) {
            return;
        }
    }
}

/// P9 (first half): a single interrupt during handling sets the stop flag,
/// the runloop finishes the in-flight handler and acks it, then exits with
/// status 0 rather than forcing an immediate shutdown.
#[tokio::test]
async fn test_single_interrupt_drains_then_exits_cleanly() {
    let queue = queue_name("signal-drain");
    let mut child = probe_command(&queue, 300).spawn().expect("failed to spawn signal_probe");
    let mut lines = BufReader::new(child.stdout.take().expect("piped stdout")).lines();

    wait_for_line(&mut lines, "READY").await;
    wait_for_line(&mut lines, "HANDLING").await;

    let pid = Pid::from_raw(child.id().expect("child should have a pid").try_into().unwrap());
    kill(pid, Signal::SIGINT).expect("failed to send SIGINT");

    wait_for_line(&mut lines, "DONE").await;

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("process should exit shortly after printing DONE")
        .expect("failed to wait on child");
    assert!(status.success(), "a single interrupt should drain and exit cleanly");

    flush_db().await;
}

/// P9 (second half): a second interrupt received while still draining the
/// first forces an immediate `std::process::exit(130)`, per spec, rather
/// than waiting for the in-flight handler.
#[tokio::test]
async fn test_second_interrupt_forces_immediate_exit() {
    let queue = queue_name("signal-force-exit");
    let mut child = probe_command(&queue, 5000).spawn().expect("failed to spawn signal_probe");
    let mut lines = BufReader::new(child.stdout.take().expect("piped stdout")).lines();

    wait_for_line(&mut lines, "READY").await;
    wait_for_line(&mut lines, "HANDLING").await;

    let pid = Pid::from_raw(child.id().expect("child should have a pid").try_into().unwrap());
    kill(pid, Signal::SIGINT).expect("failed to send the first SIGINT");
    // give the runloop a moment to observe the first interrupt and start draining
    tokio::time::sleep(Duration::from_millis(150)).await;
    kill(pid, Signal::SIGINT).expect("failed to send the second SIGINT");

    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .expect("the process should exit immediately on the second interrupt")
        .expect("failed to wait on child");

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.code(), Some(130), "second interrupt must hard-exit with status 130");
    }

    flush_db().await;
}
