//! TCP transport for raft RPCs.
//!
//! One listener per node dispatches framed requests to the local raft
//! handle; the [`RaftTransport`] factory hands out per-target clients that
//! pool a few connections and bound every exchange with a timeout.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::types::{Node, NodeId, Raft, TypeConfig};

/// Connect and exchange timeout for raft RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Connections pooled per peer.
const POOL_SIZE: usize = 3;

/// Upper bound on a single RPC frame (snapshot chunks included).
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Raft RPC requests that cross the wire.
#[derive(Debug, Serialize, Deserialize)]
enum RaftRequest {
    Vote(VoteRequest<NodeId>),
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// Raft RPC replies.
#[derive(Debug, Serialize, Deserialize)]
enum RaftReply {
    Vote(VoteResponse<NodeId>),
    AppendEntries(AppendEntriesResponse<NodeId>),
    InstallSnapshot(InstallSnapshotResponse<NodeId>),
    Error(String),
}

/// Serves the local raft instance on its consensus endpoint.
pub struct RaftListener {
    shutdown_tx: broadcast::Sender<()>,
}

impl RaftListener {
    /// Bind `addr` and serve `raft` until [`RaftListener::shutdown`].
    pub async fn spawn(raft: Raft, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!(%addr, "raft transport listening");

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let raft = raft.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(raft, stream).await {
                                    debug!(%peer, "raft connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("raft accept failed: {e}"),
                    },
                    _ = shutdown_rx.recv() => {
                        debug!("raft listener shutting down");
                        break;
                    }
                }
            }
        });

        Ok(Self { shutdown_tx })
    }

    /// Stop accepting raft connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn serve_connection(raft: Raft, mut stream: TcpStream) -> io::Result<()> {
    loop {
        let request: RaftRequest = match read_frame(&mut stream).await {
            Ok(request) => request,
            // Peers keep connections open; EOF ends the session.
            Err(_) => return Ok(()),
        };

        let reply = match request {
            RaftRequest::Vote(rpc) => match raft.vote(rpc).await {
                Ok(resp) => RaftReply::Vote(resp),
                Err(e) => RaftReply::Error(e.to_string()),
            },
            RaftRequest::AppendEntries(rpc) => match raft.append_entries(rpc).await {
                Ok(resp) => RaftReply::AppendEntries(resp),
                Err(e) => RaftReply::Error(e.to_string()),
            },
            RaftRequest::InstallSnapshot(rpc) => match raft.install_snapshot(rpc).await {
                Ok(resp) => RaftReply::InstallSnapshot(resp),
                Err(e) => RaftReply::Error(e.to_string()),
            },
        };

        write_frame(&mut stream, &reply).await?;
    }
}

/// Factory handing out per-target raft RPC clients.
#[derive(Clone, Default)]
pub struct RaftTransport {
    pools: Arc<DashMap<NodeId, Arc<ConnectionPool>>>,
}

impl RaftTransport {
    /// A transport with no connections yet.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftTransport {
    type Network = RaftClient;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        let pool = self
            .pools
            .entry(target.clone())
            .or_insert_with(|| Arc::new(ConnectionPool::new(node.addr.clone())))
            .clone();
        RaftClient { target, pool }
    }
}

/// A small pool of connections to one peer.
struct ConnectionPool {
    addr: String,
    streams: Mutex<Vec<TcpStream>>,
}

impl ConnectionPool {
    fn new(addr: String) -> Self {
        Self {
            addr,
            streams: Mutex::new(Vec::new()),
        }
    }

    async fn acquire(&self) -> io::Result<TcpStream> {
        if let Some(stream) = self.streams.lock().await.pop() {
            return Ok(stream);
        }
        timeout(RPC_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "raft connect timed out"))?
    }

    async fn release(&self, stream: TcpStream) {
        let mut streams = self.streams.lock().await;
        if streams.len() < POOL_SIZE {
            streams.push(stream);
        }
    }

    /// One request/reply exchange. Broken connections are dropped instead
    /// of being returned to the pool.
    async fn exchange(&self, request: &RaftRequest) -> io::Result<RaftReply> {
        let mut stream = self.acquire().await?;

        let result = timeout(RPC_TIMEOUT, async {
            write_frame(&mut stream, request).await?;
            read_frame::<RaftReply>(&mut stream).await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "raft rpc timed out"))?;

        match result {
            Ok(reply) => {
                self.release(stream).await;
                Ok(reply)
            }
            Err(e) => Err(e),
        }
    }
}

/// RPC client for a single target node.
pub struct RaftClient {
    target: NodeId,
    pool: Arc<ConnectionPool>,
}

impl RaftNetwork<TypeConfig> for RaftClient {
    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        debug!(target = %self.target, "sending vote request");
        match self.pool.exchange(&RaftRequest::Vote(rpc)).await {
            Ok(RaftReply::Vote(resp)) => Ok(resp),
            Ok(other) => Err(unexpected_reply(other)),
            Err(e) => Err(RPCError::Network(NetworkError::new(&e))),
        }
    }

    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        match self.pool.exchange(&RaftRequest::AppendEntries(rpc)).await {
            Ok(RaftReply::AppendEntries(resp)) => Ok(resp),
            Ok(other) => Err(unexpected_reply(other)),
            Err(e) => Err(RPCError::Network(NetworkError::new(&e))),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>,
    > {
        debug!(target = %self.target, "sending install snapshot request");
        match self.pool.exchange(&RaftRequest::InstallSnapshot(rpc)).await {
            Ok(RaftReply::InstallSnapshot(resp)) => Ok(resp),
            Ok(other) => Err(unexpected_reply(other)),
            Err(e) => Err(RPCError::Network(NetworkError::new(&e))),
        }
    }
}

fn unexpected_reply<E: std::error::Error>(reply: RaftReply) -> RPCError<NodeId, Node, E> {
    let message = match reply {
        RaftReply::Error(message) => message,
        other => format!("unexpected raft reply: {other:?}"),
    };
    RPCError::Network(NetworkError::new(&io::Error::new(
        io::ErrorKind::InvalidData,
        message,
    )))
}

async fn write_frame<T: Serialize>(stream: &mut TcpStream, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

async fn read_frame<T: DeserializeOwned>(stream: &mut TcpStream) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "raft frame too large",
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
