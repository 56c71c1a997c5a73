//! The store connection OmniQ actually issues commands over: either a
//! single-node [`ConnectionManager`] or a real slot-routing
//! [`ClusterConnection`]. Every script call in [`crate::ops::Ops`] and the
//! bundle load in [`crate::scripts::ScriptBundle`] goes through
//! [`StoreConnection::query_async`] rather than holding one concrete
//! connection type, so cluster mode gets genuine multi-node routing instead
//! of a connection pinned to whichever node answered first.

use redis::aio::ConnectionManager;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, RedisResult};

/// Either side of OmniQ's two supported transports. `Cmd::query_async`
/// takes the concrete connection type by trait bound, so this can't be a
/// bare `dyn` object — dispatch by hand instead, same as the teacher's own
/// connection-manager-vs-raw-connection split in its older pre-0.27
/// history.
#[derive(Clone)]
pub(crate) enum StoreConnection {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
}

impl StoreConnection {
    pub(crate) async fn query_async<T: FromRedisValue>(&mut self, cmd: &Cmd) -> RedisResult<T> {
        match self {
            StoreConnection::Standalone(conn) => cmd.query_async(conn).await,
            StoreConnection::Cluster(conn) => cmd.query_async(conn).await,
        }
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreConnection::Standalone(_) => f.write_str("StoreConnection::Standalone(..)"),
            StoreConnection::Cluster(_) => f.write_str("StoreConnection::Cluster(..)"),
        }
    }
}
