#![warn(missing_debug_implementations, rust_2018_idioms)]
//! OmniQ: a distributed job-queue client backed by a Redis-compatible
//! key-value store.
//!
//! Producers publish JSON jobs onto named queues with [`Client::publish`];
//! consumers reserve jobs under a time-bounded lease, heartbeat while
//! processing, and acknowledge success or failure by driving
//! [`Client::consume`] with a handler. Every state transition — enqueue,
//! reserve, heartbeat, ack, retry scheduling, dead-letter, pause/resume,
//! fan-out child counters, administrative retry/remove — executes as a
//! server-side atomic script; this crate is a thin, well-typed driver plus
//! a consumer runloop.
//!
//! ```no_run
//! use omniq::{Client, ClientOptions, ConsumeOptions, HandlerFailure};
//! use std::sync::Arc;
//!
//! # async fn run() -> omniq::Result<()> {
//! let client = Client::create(ClientOptions::from_url("redis://127.0.0.1/")).await?;
//!
//! client
//!     .publish(
//!         "demo",
//!         &serde_json::json!({"hello": "world"}),
//!         &Default::default(),
//!     )
//!     .await?;
//!
//! client
//!     .consume(
//!         "demo",
//!         Arc::new(|ctx| {
//!             Box::pin(async move {
//!                 println!("got job {} with payload {}", ctx.job_id, ctx.payload);
//!                 Ok(())
//!             })
//!         }),
//!         ConsumeOptions::default(),
//!     )
//!     .await;
//! # Ok(())
//! # }
//! ```

mod client;
mod clock;
pub mod config;
mod conn;
mod error;
mod exec;
pub mod keys;
mod ops;
mod runloop;
mod scripts;

pub use client::{Client, ClientOptions};
pub use config::{ClusterOpts, ConnectOpts, ConsumeOptions, NodeAddr, StandaloneOpts};
pub use error::{Error, Result};
pub use exec::Exec;
pub use ops::{AckFailOutcome, BatchItem, PublishOptions, ReserveOutcome, ReservedJob};
pub use runloop::{Handler, HandlerContext, HandlerFailure};
pub use scripts::SCRIPT_NAMES;
