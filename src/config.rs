//! Connection and runloop configuration surfaces.
//!
//! Mirrors the teacher crate's `Config` (builder-style setters returning
//! `Self`) but splits it in two: [`ConnectOpts`] describes how to reach the
//! store (spec §6.4), and [`ConsumeOptions`] describes the per-call
//! tunables accepted by [`crate::Client::consume`] (spec §4.5).

use std::time::Duration;

/// A single cluster node address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddr {
    pub host: String,
    pub port: u16,
}

/// How to connect to the backing store.
///
/// Either a bare connection URL, a fully-typed standalone description, or
/// a cluster description. Cluster mode that the server rejects (detected
/// by message-sniffing per spec §6.4) falls back to standalone
/// automatically; see [`crate::client::Client::create`].
#[derive(Clone, Debug)]
pub enum ConnectOpts {
    /// A `redis://` (or `rediss://`) connection string.
    Url(String),
    /// A fully-typed standalone connection.
    Standalone(StandaloneOpts),
    /// A cluster connection, attempted first, falling back to standalone
    /// against `cluster_nodes[0]` if the server rejects cluster commands.
    Cluster(ClusterOpts),
}

/// Substrings that indicate a server rejected cluster-mode commands and a
/// standalone fallback should be attempted. Heuristic by design (spec
/// §6.4/§9); re-evaluate this list when upgrading the transport driver.
pub const CLUSTER_UNSUPPORTED_MARKERS: &[&str] = &[
    "cluster support disabled",
    "cluster mode is not enabled",
    "this instance has cluster support disabled",
    "moved",
    "ask",
];

#[derive(Clone, Debug)]
pub struct StandaloneOpts {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    pub socket_timeout_ms: Option<u64>,
    pub socket_connect_timeout_ms: Option<u64>,
}

impl Default for StandaloneOpts {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            ssl: false,
            socket_timeout_ms: None,
            socket_connect_timeout_ms: None,
        }
    }
}

impl StandaloneOpts {
    pub fn to_connection_info(&self) -> redis::ConnectionInfo {
        let addr = if self.ssl {
            redis::ConnectionAddr::TcpTls {
                host: self.host.clone(),
                port: self.port,
                insecure: false,
                tls_params: None,
            }
        } else {
            redis::ConnectionAddr::Tcp(self.host.clone(), self.port)
        };
        redis::ConnectionInfo {
            addr,
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
                protocol: Default::default(),
            },
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.socket_connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.socket_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug)]
pub struct ClusterOpts {
    pub cluster_nodes: Vec<NodeAddr>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    pub socket_timeout_ms: Option<u64>,
    pub socket_connect_timeout_ms: Option<u64>,
}

impl ClusterOpts {
    /// The node OmniQ falls back to for a standalone connection if the
    /// server rejects cluster-mode commands.
    pub fn fallback_standalone(&self) -> Option<StandaloneOpts> {
        let node = self.cluster_nodes.first()?;
        Some(StandaloneOpts {
            host: node.host.clone(),
            port: node.port,
            db: 0,
            username: self.username.clone(),
            password: self.password.clone(),
            ssl: self.ssl,
            socket_timeout_ms: self.socket_timeout_ms,
            socket_connect_timeout_ms: self.socket_connect_timeout_ms,
        })
    }
}

/// Returns true if `message` contains one of [`CLUSTER_UNSUPPORTED_MARKERS`]
/// (case-insensitive).
pub fn looks_like_cluster_unsupported(message: &str) -> bool {
    let lower = message.to_lowercase();
    CLUSTER_UNSUPPORTED_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Environment variable overriding the resolved scripts directory.
pub const SCRIPTS_DIR_ENV_VAR: &str = "OMNIQ_SCRIPTS_DIR";

/// Tunables for [`crate::Client::consume`], all defaulted per spec §4.5.
#[derive(Clone, Debug)]
pub struct ConsumeOptions {
    pub poll_interval_s: f64,
    pub promote_interval_s: f64,
    pub promote_batch: u32,
    pub reap_interval_s: f64,
    pub reap_batch: u32,
    /// `None` means "derive from the job's `timeout_ms`" (spec
    /// `derive_heartbeat_interval_s`); `Some(_)` pins an explicit interval.
    pub heartbeat_interval_s: Option<f64>,
    pub verbose: bool,
    pub drain: bool,
    pub stop_on_ctrl_c: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            poll_interval_s: 0.05,
            promote_interval_s: 1.0,
            promote_batch: 1000,
            reap_interval_s: 1.0,
            reap_batch: 1000,
            heartbeat_interval_s: None,
            verbose: false,
            drain: true,
            stop_on_ctrl_c: true,
        }
    }
}
