//! Standalone probe driven by the P9 integration tests: publishes one job,
//! prints `READY`, then runs `consume` against it with a handler that
//! sleeps so the tests can deliver SIGINT mid-handler and observe the
//! drain-vs-hard-exit behavior in `src/runloop/signals.rs` from outside
//! the process that owns it — `tokio::signal::ctrl_c` installs a
//! process-wide handler, so the two interrupt cases can't be exercised
//! against a spawned task within the test binary itself.

use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;

use omniq::{Client, ClientOptions, ConsumeOptions, HandlerContext, HandlerFailure, PublishOptions};

fn print_line(line: &str) {
    println!("{line}");
    std::io::stdout().flush().ok();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let queue = std::env::var("OMNIQ_PROBE_QUEUE").unwrap_or_else(|_| "omniq-signal-probe".to_string());
    let handler_sleep_ms: u64 = std::env::var("OMNIQ_PROBE_SLEEP_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2000);

    let client = Client::create(ClientOptions::from_url(redis_url))
        .await
        .expect("failed to create client");

    client
        .publish(&queue, &serde_json::json!({"probe": true}), &PublishOptions::default())
        .await
        .expect("publish should succeed");

    let handler = Arc::new(move |ctx: HandlerContext| {
        Box::pin(async move {
            print_line(&format!("HANDLING {}", ctx.job_id));
            tokio::time::sleep(std::time::Duration::from_millis(handler_sleep_ms)).await;
            Ok(())
        }) as Pin<Box<dyn std::future::Future<Output = Result<(), HandlerFailure>> + Send>>
    });

    print_line("READY");

    client
        .consume(
            &queue,
            handler,
            ConsumeOptions {
                poll_interval_s: 0.02,
                promote_interval_s: 0.02,
                reap_interval_s: 0.02,
                drain: true,
                stop_on_ctrl_c: true,
                ..Default::default()
            },
        )
        .await;

    print_line("DONE");
}
