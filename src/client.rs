//! Client facade: assembles a store connection, script bundle, and Ops
//! layer into one object, per spec §4.6. All public operations are
//! pass-throughs to [`Ops`] except [`Client::consume`], which applies
//! defaults and drives the runloop.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::cluster::ClusterClientBuilder;
use serde_json::Value as Json;

use crate::config::{looks_like_cluster_unsupported, ClusterOpts, ConnectOpts, ConsumeOptions};
use crate::conn::StoreConnection;
use crate::error::{Error, Result};
use crate::exec::Exec;
use crate::ops::{AckFailOutcome, BatchItem, Ops, PublishOptions, ReserveOutcome};
use crate::runloop::{self, Handler};
use crate::scripts::{self, ScriptBundle};

/// Input to [`Client::create`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect: ConnectOpts,
}

impl ClientOptions {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            connect: ConnectOpts::Url(url.into()),
        }
    }
}

/// The top-level OmniQ client: publish jobs, consume a queue, and
/// administer the store-side lanes.
#[derive(Clone)]
pub struct Client {
    conn: StoreConnection,
    ops: Arc<Ops>,
}

impl Client {
    /// Builds or accepts a store connection, resolves the scripts
    /// directory, loads the bundle, and constructs the Ops layer.
    pub async fn create(opts: ClientOptions) -> Result<Self> {
        let mut conn = connect(&opts.connect).await?;
        let dir = scripts::resolve_scripts_dir()?;
        let bundle = ScriptBundle::load(&mut conn, &dir).await?;
        let ops = Arc::new(Ops::new(conn.clone(), Arc::new(bundle)));
        Ok(Client { conn, ops })
    }

    /// Builds a client around an already-connected [`ConnectionManager`],
    /// useful for tests (mirrors the teacher's `connect()` + `setup()`
    /// pattern).
    pub async fn with_connection(conn: ConnectionManager) -> Result<Self> {
        let mut conn = StoreConnection::Standalone(conn);
        let dir = scripts::resolve_scripts_dir()?;
        let bundle = ScriptBundle::load(&mut conn, &dir).await?;
        let ops = Arc::new(Ops::new(conn.clone(), Arc::new(bundle)));
        Ok(Client { conn, ops })
    }

    /// Quits the underlying store connection. Cluster connections have no
    /// equivalent clean-shutdown command across every routed node, so this
    /// is a no-op in cluster mode.
    pub async fn close(self) -> Result<()> {
        let mut conn = match self.conn {
            StoreConnection::Standalone(conn) => conn,
            StoreConnection::Cluster(_) => return Ok(()),
        };
        redis::cmd("QUIT")
            .query_async::<_, ()>(&mut conn)
            .await
            .or_else(|e| match e.kind() {
                redis::ErrorKind::IoError => Ok(()),
                _ => Err(e),
            })?;
        Ok(())
    }

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

    pub async fn retry_failed(&self, queue: &str, job_id: &str) -> Result<()> {
        self.ops.retry_failed(queue, job_id, 0).await
    }

    pub async fn retry_failed_batch(&self, queue: &str, job_ids: &[String]) -> Result<Vec<BatchItem>> {
        self.ops.retry_failed_batch(queue, job_ids, 0).await
    }

    pub async fn remove_job(&self, queue: &str, job_id: &str) -> Result<()> {
        self.ops.remove_job(queue, job_id).await
    }

    pub async fn remove_jobs_batch(&self, queue: &str, job_ids: &[String]) -> Result<Vec<BatchItem>> {
        self.ops.remove_jobs_batch(queue, job_ids).await
    }

    pub async fn childs_init(&self, key: &str, expected: u32) -> Result<()> {
        self.ops.childs_init(key, expected).await
    }

    pub async fn child_ack(&self, key: &str, child_id: &str) -> i64 {
        self.ops.child_ack(key, child_id).await
    }

    /// Reserves the next eligible job on `queue` under a fresh lease.
    /// Ordinarily driven by the runloop; exposed directly for tests that
    /// need to observe the lease lifecycle without a full `consume` loop.
    pub async fn reserve(&self, queue: &str) -> Result<ReserveOutcome> {
        self.ops.reserve(queue, 0).await
    }

    pub async fn heartbeat(&self, queue: &str, job_id: &str, lease_token: &str, timeout_ms: i64) -> Result<i64> {
        self.ops.heartbeat(queue, job_id, lease_token, timeout_ms, 0).await
    }

    pub async fn ack_success(&self, queue: &str, job_id: &str, lease_token: &str) -> Result<()> {
        self.ops.ack_success(queue, job_id, lease_token).await
    }

    pub async fn ack_fail(
        &self,
        queue: &str,
        job_id: &str,
        lease_token: &str,
        error: Option<&str>,
    ) -> Result<AckFailOutcome> {
        self.ops.ack_fail(queue, job_id, lease_token, error, 0).await
    }

    pub async fn promote_delayed(&self, queue: &str, batch: u32) -> Result<i64> {
        self.ops.promote_delayed(queue, batch, 0).await
    }

    pub async fn reap_expired(&self, queue: &str, batch: u32) -> Result<i64> {
        self.ops.reap_expired(queue, batch, 0).await
    }

    pub async fn job_timeout_ms(&self, queue: &str, job_id: &str, default: i64) -> Result<i64> {
        self.ops.job_timeout_ms(queue, job_id, default).await
    }

    /// Returns an [`Exec`] facade bound to `default_child_id`, useful for
    /// calling handler-safe operations outside of a running handler (e.g.
    /// from a producer that also wants to drive fan-in bookkeeping).
    pub fn exec(&self, default_child_id: impl Into<String>) -> Exec {
        Exec::new(self.ops.clone(), default_child_id.into())
    }

    /// Applies `opts` and drives the consumer runloop against `queue`
    /// until a stop condition is met (spec §4.5).
    pub async fn consume(&self, queue: &str, handler: Handler, opts: ConsumeOptions) {
        runloop::run(self.ops.clone(), queue.to_string(), handler, opts).await
    }
}

async fn connect(opts: &ConnectOpts) -> Result<StoreConnection> {
    match opts {
        ConnectOpts::Url(url) => {
            let info = redis::Client::open(url.as_str())
                .map_err(Error::Transport)?
                .get_connection_info()
                .clone();
            connect_standalone_info(info, None).await.map(StoreConnection::Standalone)
        }
        ConnectOpts::Standalone(standalone) => {
            connect_standalone_info(standalone.to_connection_info(), standalone.connect_timeout())
                .await
                .map(StoreConnection::Standalone)
        }
        ConnectOpts::Cluster(cluster) => connect_cluster(cluster).await,
    }
}

async fn connect_standalone_info(
    info: redis::ConnectionInfo,
    connect_timeout: Option<Duration>,
) -> Result<ConnectionManager> {
    let client = redis::Client::open(info).map_err(Error::Transport)?;
    let connect_fut = client.get_connection_manager();
    match connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connect_fut)
            .await
            .map_err(|_| Error::configuration("connection to the store timed out"))?
            .map_err(Error::Transport),
        None => connect_fut.await.map_err(Error::Transport),
    }
}

/// Builds a genuine slot-routing cluster connection via `redis`'s
/// `cluster-async` client, falling back to a standalone connection against
/// `cluster_nodes[0]` only if the server rejects cluster-mode commands
/// entirely, detected by message-sniffing per spec §6.4. Unlike a bare
/// `ConnectionManager` pinned to one node, a `ClusterConnection` discovers
/// the slot map from `CLUSTER SLOTS`/`CLUSTER SHARDS` and re-routes each
/// command to the node that actually owns the hash tag's slot, including
/// following `MOVED`/`ASK` redirects transparently.
///
/// Per-node socket/connect timeouts (`socket_timeout_ms`,
/// `socket_connect_timeout_ms`) are not wired into the cluster builder:
/// `ClusterClientBuilder` exposes retry and read-from-replica tuning but no
/// per-socket timeout setters as of the pinned `redis` version, so OmniQ
/// leaves the cluster client on its default connect/command timeouts
/// rather than guess at an unstable API surface. Standalone connections are
/// unaffected — `connect_standalone_info` still honors both.
async fn connect_cluster(cluster: &ClusterOpts) -> Result<StoreConnection> {
    if cluster.cluster_nodes.is_empty() {
        return Err(Error::configuration("cluster_nodes must not be empty"));
    }

    let scheme = if cluster.ssl { "rediss" } else { "redis" };
    let node_urls: Vec<String> = cluster
        .cluster_nodes
        .iter()
        .map(|n| format!("{scheme}://{}:{}", n.host, n.port))
        .collect();

    let mut builder = ClusterClientBuilder::new(node_urls.clone());
    if let Some(username) = &cluster.username {
        builder = builder.username(username.clone());
    }
    if let Some(password) = &cluster.password {
        builder = builder.password(password.clone());
    }

    let attempt: std::result::Result<_, redis::RedisError> = async {
        let client = builder.build()?;
        client.get_async_connection().await
    }
    .await;

    match attempt {
        Ok(conn) => Ok(StoreConnection::Cluster(conn)),
        Err(e) if looks_like_cluster_unsupported(&e.to_string()) => {
            log::warn!(
                "cluster mode requested against {node_urls:?} but unsupported ({e}); falling back to standalone"
            );
            let standalone = cluster
                .fallback_standalone()
                .ok_or_else(|| Error::configuration("cluster_nodes must not be empty"))?;
            connect_standalone_info(standalone.to_connection_info(), standalone.connect_timeout())
                .await
                .map(StoreConnection::Standalone)
        }
        Err(e) => Err(Error::Transport(e)),
    }
}
