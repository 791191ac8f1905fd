//! Routes an RPC to the storage server that owns a coid (`oid_serverid`,
//! spec.md §4.A) over whichever transport that server was registered
//! with, reusing `server::transport`'s framing so an in-process test and
//! a real deployment drive identical wire bytes.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
};

use errors::ErrorMetadata;
use parking_lot::RwLock;
use server::{
    rpc::{
        Request,
        Response,
        ServerId,
    },
    transport::{
        InMemoryConn,
        TcpConn,
    },
    ServerState,
};

use crate::retry::with_backoff;

/// One connection to a storage server, either an in-memory duplex to a
/// server running in this process (tests, single-binary demos) or a real
/// TCP connection.
pub enum ServerConn {
    InMemory(InMemoryConn),
    Tcp(TcpConn),
}

impl ServerConn {
    async fn call_once(&self, req: Request) -> anyhow::Result<Response> {
        match self {
            ServerConn::InMemory(conn) => conn.call(req).await,
            ServerConn::Tcp(conn) => conn.call(&req).await,
        }
    }
}

/// Every server a client has a connection to, keyed by [`ServerId`].
/// Cheap to clone; safe to share across concurrently running
/// transactions.
#[derive(Clone, Default)]
pub struct Cluster {
    conns: Arc<RwLock<HashMap<ServerId, Arc<ServerConn>>>>,
}

impl Cluster {
    pub fn new() -> Self {
        Cluster::default()
    }

    pub fn add_in_memory(&self, serverid: ServerId, state: Arc<ServerState>) {
        self.conns.write().insert(serverid, Arc::new(ServerConn::InMemory(InMemoryConn::connect(state))));
    }

    pub async fn add_tcp(&self, serverid: ServerId, addr: SocketAddr) -> anyhow::Result<()> {
        let conn = TcpConn::connect(addr).await?;
        self.conns.write().insert(serverid, Arc::new(ServerConn::Tcp(conn)));
        Ok(())
    }

    fn conn(&self, serverid: ServerId) -> Result<Arc<ServerConn>, ErrorMetadata> {
        self.conns
            .read()
            .get(&serverid)
            .cloned()
            .ok_or_else(|| ErrorMetadata::server_down(format!("no connection registered for server {serverid}")))
    }

    /// Sends `req` to `serverid`, retrying transport failures with
    /// backoff (spec.md §7's `Transient` tier) and translating a
    /// connection error into `SERVER_DOWN`.
    pub async fn call(&self, serverid: ServerId, req: Request) -> Result<Response, ErrorMetadata> {
        with_backoff(|| {
            let req = req.clone();
            async move {
                let conn = self.conn(serverid)?;
                conn.call_once(req).await.map_err(|err| ErrorMetadata::server_down(format!("server {serverid} unreachable: {err:#}")))
            }
        })
        .await
    }
}
