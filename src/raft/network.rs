//! Network transport for Raft communication.
//!
//! Peers talk over plain TCP. Every frame is a big-endian `u32` length
//! followed by a bincode body; a connection carries any number of
//! request/response pairs in sequence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::Raft;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{KvNode, RaftNodeId, TypeConfig};

/// Timeout for RPC connection establishment.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for one request/response exchange.
const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of RPC retry attempts.
const RPC_MAX_RETRIES: u32 = 3;

const RPC_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RPC_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Consecutive failed RPCs before the circuit breaker opens.
const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// How long an open circuit rejects RPCs before letting one through again.
const CIRCUIT_BREAKER_RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest frame accepted from a peer.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Requests exchanged between Raft peers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// Responses to [`RaftRpcMessage`].
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    /// The receiving engine rejected the request.
    Error(String),
}

/// Write one length-prefixed bincode frame.
pub(crate) async fn write_frame<W, T>(stream: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&data).await?;
    stream.flush().await
}

/// Read one length-prefixed bincode frame.
pub(crate) async fn read_frame<R, T>(stream: &mut R) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Factory for creating Raft network connections.
///
/// Peer addresses come from the replicated membership, so the factory keeps no
/// state of its own.
#[derive(Clone, Debug, Default)]
pub struct RaftNetworkFactoryImpl;

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: RaftNodeId, node: &KvNode) -> Self::Network {
        RaftNetworkConnection {
            target,
            target_addr: node.addr.clone(),
            cached_conn: Mutex::new(None),
            circuit_breaker: Mutex::new(CircuitBreakerState::new()),
        }
    }
}

/// Circuit breaker state for a connection.
struct CircuitBreakerState {
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            last_failure_time: None,
        }
    }

    /// Whether RPCs should be rejected without trying the peer.
    fn is_open(&self) -> bool {
        if self.consecutive_failures < CIRCUIT_BREAKER_THRESHOLD {
            return false;
        }
        self.last_failure_time
            .is_some_and(|t| t.elapsed() < CIRCUIT_BREAKER_RESET_TIMEOUT)
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_time = None;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_time = Some(Instant::now());
    }
}

/// A connection to a remote Raft node.
pub struct RaftNetworkConnection {
    target: RaftNodeId,
    target_addr: String,
    cached_conn: Mutex<Option<TcpStream>>,
    circuit_breaker: Mutex<CircuitBreakerState>,
}

impl RaftNetworkConnection {
    /// Send an RPC with retries, backoff and the circuit breaker.
    async fn send_rpc(&self, message: RaftRpcMessage) -> std::io::Result<RaftRpcResponse> {
        {
            let cb = self.circuit_breaker.lock().await;
            if cb.is_open() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!(
                        "circuit breaker open for node {} at {} ({} consecutive failures)",
                        self.target, self.target_addr, cb.consecutive_failures
                    ),
                ));
            }
        }

        let mut last_error = None;
        for attempt in 0..=RPC_MAX_RETRIES {
            if attempt > 0 {
                let delay = std::cmp::min(
                    RPC_RETRY_BASE_DELAY * (1 << (attempt - 1)),
                    RPC_RETRY_MAX_DELAY,
                );
                // +/-25% jitter
                let jitter_factor = 0.75 + (fastrand::f64() * 0.5);
                let delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor);
                debug!(
                    target_node = self.target,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying RPC after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            match self.try_send_rpc(&message).await {
                Ok(response) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(response);
                }
                Err(e) => last_error = Some(e),
            }
        }

        let mut cb = self.circuit_breaker.lock().await;
        cb.record_failure();
        if cb.consecutive_failures == CIRCUIT_BREAKER_THRESHOLD {
            warn!(
                target_node = self.target,
                target_addr = %self.target_addr,
                "Circuit breaker opened due to consecutive failures"
            );
        }

        Err(last_error.unwrap_or_else(|| std::io::Error::other("RPC failed with no error")))
    }

    /// One attempt, reusing the cached connection when it is still healthy.
    async fn try_send_rpc(&self, message: &RaftRpcMessage) -> std::io::Result<RaftRpcResponse> {
        let mut guard = self.cached_conn.lock().await;
        if let Some(stream) = guard.as_mut() {
            match Self::exchange(stream, message).await {
                Ok(response) => return Ok(response),
                Err(_) => *guard = None,
            }
        }

        let stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(&self.target_addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection timeout to {}", self.target_addr),
                )
            })??;
        stream.set_nodelay(true)?;
        let mut stream = stream;

        let response = Self::exchange(&mut stream, message).await?;
        *guard = Some(stream);
        Ok(response)
    }

    async fn exchange(
        stream: &mut TcpStream,
        message: &RaftRpcMessage,
    ) -> std::io::Result<RaftRpcResponse> {
        timeout(RPC_OPERATION_TIMEOUT, async {
            write_frame(stream, message).await?;
            read_frame(stream).await
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "RPC operation timeout"))?
    }
}

fn network_error<E: std::error::Error>(e: std::io::Error) -> RPCError<RaftNodeId, KvNode, E> {
    RPCError::Network(NetworkError::new(&e))
}

fn unexpected<E: std::error::Error>(response: RaftRpcResponse) -> RPCError<RaftNodeId, KvNode, E> {
    let e = match response {
        RaftRpcResponse::Error(msg) => std::io::Error::other(msg),
        other => std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected response type: {:?}", other),
        ),
    };
    network_error(e)
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<RaftNodeId>, RPCError<RaftNodeId, KvNode, RaftError<RaftNodeId>>>
    {
        match self
            .send_rpc(RaftRpcMessage::AppendEntries(req))
            .await
            .map_err(network_error)?
        {
            RaftRpcResponse::AppendEntries(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, KvNode, RaftError<RaftNodeId>>> {
        match self
            .send_rpc(RaftRpcMessage::Vote(req))
            .await
            .map_err(network_error)?
        {
            RaftRpcResponse::Vote(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, KvNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        match self
            .send_rpc(RaftRpcMessage::InstallSnapshot(req))
            .await
            .map_err(network_error)?
        {
            RaftRpcResponse::InstallSnapshot(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }
}

/// Server for incoming Raft RPCs.
pub struct RaftRpcServer {
    raft: Arc<Raft<TypeConfig>>,
    listener: TcpListener,
}

impl RaftRpcServer {
    /// Serve RPCs for `raft` on an already bound listener.
    pub fn new(raft: Arc<Raft<TypeConfig>>, listener: TcpListener) -> Self {
        Self { raft, listener }
    }

    /// Accept peer connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "Raft RPC server listening");
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Raft RPC server shutting down");
                    return;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let raft = self.raft.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(raft, stream).await {
                                    warn!(peer = %peer_addr, error = %e, "Error handling Raft RPC");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "Failed to accept Raft RPC connection"),
                    }
                }
            }
        }
    }

    /// Serve requests on one connection until the peer closes it.
    async fn handle_connection(
        raft: Arc<Raft<TypeConfig>>,
        mut stream: TcpStream,
    ) -> std::io::Result<()> {
        stream.set_nodelay(true)?;

        loop {
            let message: RaftRpcMessage = match read_frame(&mut stream).await {
                Ok(message) => message,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };

            let response = match message {
                RaftRpcMessage::AppendEntries(req) => match raft.append_entries(req).await {
                    Ok(resp) => RaftRpcResponse::AppendEntries(resp),
                    Err(e) => RaftRpcResponse::Error(e.to_string()),
                },
                RaftRpcMessage::Vote(req) => match raft.vote(req).await {
                    Ok(resp) => RaftRpcResponse::Vote(resp),
                    Err(e) => RaftRpcResponse::Error(e.to_string()),
                },
                RaftRpcMessage::InstallSnapshot(req) => match raft.install_snapshot(req).await {
                    Ok(resp) => RaftRpcResponse::InstallSnapshot(resp),
                    Err(e) => RaftRpcResponse::Error(e.to_string()),
                },
            };

            write_frame(&mut stream, &response).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_targets_membership_address() {
        let mut factory = RaftNetworkFactoryImpl;

        let conn = factory
            .new_client(1, &KvNode::new("node1", "127.0.0.1:4002"))
            .await;
        assert_eq!(conn.target, 1);
        assert_eq!(conn.target_addr, "127.0.0.1:4002");

        let moved = factory
            .new_client(1, &KvNode::new("node1", "10.0.0.1:4002"))
            .await;
        assert_eq!(moved.target_addr, "10.0.0.1:4002");
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let message = RaftRpcMessage::Vote(VoteRequest::new(openraft::Vote::new(1, 42), None));

        write_frame(&mut client, &message).await.unwrap();
        let decoded: RaftRpcMessage = read_frame(&mut server).await.unwrap();
        match decoded {
            RaftRpcMessage::Vote(req) => assert_eq!(req.vote, openraft::Vote::new(1, 42)),
            other => panic!("Expected Vote, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        let err = read_frame::<_, RaftRpcResponse>(&mut server)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let mut cb = CircuitBreakerState::new();
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD - 1 {
            cb.record_failure();
            assert!(!cb.is_open());
        }
        cb.record_failure();
        assert!(cb.is_open());

        cb.record_success();
        assert!(!cb.is_open());
        assert_eq!(cb.consecutive_failures, 0);
    }

    #[test]
    fn test_circuit_breaker_allows_retry_after_reset_timeout() {
        let mut cb = CircuitBreakerState::new();
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD {
            cb.record_failure();
        }
        cb.last_failure_time = Some(Instant::now() - CIRCUIT_BREAKER_RESET_TIMEOUT);
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn test_send_rpc_to_unreachable_peer_fails() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut factory = RaftNetworkFactoryImpl;
        let conn = factory
            .new_client(9, &KvNode::new("9", addr.to_string()))
            .await;

        let result = conn
            .send_rpc(RaftRpcMessage::Vote(VoteRequest::new(
                openraft::Vote::new(1, 1),
                None,
            )))
            .await;
        assert!(result.is_err());
        assert_eq!(conn.circuit_breaker.lock().await.consecutive_failures, 1);
    }
}
