//! RPC transports
//!
//! - [`ChannelTransport`]: in-process mpsc + oneshot, for single-binary
//!   deployments and tests
//! - [`TcpTransport`]: JSON frames over a length-delimited TCP stream with
//!   request-id multiplexing; connects lazily and reconnects after loss
//! - [`serve_tcp`]: accept loop serving an [`RpcService`] over TCP

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcFault};
use crate::net::transport::framed;
use crate::rpc::{RequestFrame, ResponseFrame, RpcRequest, RpcResponse, RpcService, RpcTransport};

type Reply = Result<RpcResponse, RpcFault>;

/// Default cap on a single RPC frame
pub const MAX_RPC_FRAME: usize = 1024 * 1024;

// ============ In-process ============

struct Call {
    request: RpcRequest,
    reply: oneshot::Sender<Reply>,
}

/// In-process transport. Each request runs on its own task so a slow call
/// never holds up the next one.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Call>,
}

impl ChannelTransport {
    /// Start serving `service` and return the client end
    pub fn pair(service: Arc<dyn RpcService>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Call>(capacity.max(1));
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    let reply = service.handle(call.request).await;
                    let _ = call.reply.send(reply);
                });
            }
        });
        Self { tx }
    }
}

#[async_trait]
impl RpcTransport for ChannelTransport {
    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Call { request, reply })
            .await
            .map_err(|_| RpcError::Unavailable("service stopped".into()))?;
        match response.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(fault)) => Err(RpcError::Remote(fault)),
            Err(_) => Err(RpcError::Unavailable("service dropped the call".into())),
        }
    }
}

// ============ TCP client ============

type PendingMap = DashMap<u64, oneshot::Sender<Reply>>;

struct Connection {
    frames: mpsc::Sender<Bytes>,
    pending: Arc<PendingMap>,
    alive: CancellationToken,
}

/// Removes a pending waiter when the call finishes, times out or is cancelled
struct PendingGuard {
    pending: Arc<PendingMap>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// TCP client transport to one peer
pub struct TcpTransport {
    address: String,
    max_frame_length: usize,
    next_id: AtomicU64,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl TcpTransport {
    /// Create a transport. No connection is made until the first request.
    pub fn new(address: impl Into<String>, max_frame_length: usize) -> Self {
        Self {
            address: address.into(),
            max_frame_length,
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connection(&self) -> Result<Arc<Connection>, RpcError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.alive.is_cancelled() {
                return Ok(conn.clone());
            }
        }

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| RpcError::Unavailable(format!("{}: {}", self.address, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::Unavailable(e.to_string()))?;
        let (mut sink, mut frames) = framed(stream, self.max_frame_length).split();

        let (frame_tx, mut frame_rx) = mpsc::channel::<Bytes>(256);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let alive = CancellationToken::new();

        let writer_alive = alive.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_alive.cancelled() => break,
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            writer_alive.cancel();
        });

        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        let address = self.address.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = reader_alive.cancelled() => break,
                    frame = frames.next() => frame,
                };
                let Some(Ok(frame)) = frame else { break };
                match serde_json::from_slice::<ResponseFrame>(&frame) {
                    Ok(response) => {
                        if let Some((_, waiter)) = reader_pending.remove(&response.id) {
                            let _ = waiter.send(response.result);
                        }
                    }
                    Err(e) => warn!(peer = %address, error = %e, "Undecodable RPC response"),
                }
            }
            reader_alive.cancel();
            // Dropping the waiters fails every in-flight call on this connection
            reader_pending.clear();
            debug!(peer = %address, "RPC connection closed");
        });

        info!(peer = %self.address, "RPC connection established");
        let conn = Arc::new(Connection {
            frames: frame_tx,
            pending,
            alive,
        });
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn request(&self, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let conn = self.connection().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (reply, response) = oneshot::channel();
        conn.pending.insert(id, reply);
        let _guard = PendingGuard {
            pending: conn.pending.clone(),
            id,
        };

        let frame = serde_json::to_vec(&RequestFrame { id, request })
            .map_err(|e| RpcError::Codec(e.to_string()))?;
        conn.frames
            .send(Bytes::from(frame))
            .await
            .map_err(|_| RpcError::Unavailable("connection closed".into()))?;

        match response.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(fault)) => Err(RpcError::Remote(fault)),
            Err(_) => Err(RpcError::Unavailable("connection lost".into())),
        }
    }
}

// ============ TCP server ============

/// Serve `service` on `listener` until `shutdown` fires
pub async fn serve_tcp(
    listener: TcpListener,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
    max_frame_length: usize,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "RPC server listening");
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("RPC server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "RPC peer connected");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        stream,
                        service.clone(),
                        shutdown.child_token(),
                        max_frame_length,
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept RPC connection"),
            },
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    service: Arc<dyn RpcService>,
    shutdown: CancellationToken,
    max_frame_length: usize,
) {
    let (mut sink, mut frames) = framed(stream, max_frame_length).split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Bytes>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = reply_rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(error = %e, "RPC read error");
                break;
            }
            None => break,
        };

        let RequestFrame { id, request } = match serde_json::from_slice(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Undecodable RPC request");
                continue;
            }
        };

        let service = service.clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let operation = request.operation();
            let result = service.handle(request).await;
            match serde_json::to_vec(&ResponseFrame { id, result }) {
                Ok(bytes) => {
                    let _ = reply_tx.send(Bytes::from(bytes)).await;
                }
                Err(e) => warn!(operation = %operation, error = %e, "Unencodable RPC response"),
            }
        });
    }

    drop(reply_tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcStatus;
    use crate::rpc::{
        DisconnectRequest, DisconnectResponse, HeartbeatRequest, HeartbeatResponse,
        RpcGateway, RpcPolicies,
    };
    use std::time::Duration;

    struct TestService;

    #[async_trait]
    impl RpcService for TestService {
        async fn handle(&self, request: RpcRequest) -> Result<RpcResponse, RpcFault> {
            match request {
                RpcRequest::Heartbeat(req) => {
                    // Later sequence numbers answer first
                    tokio::time::sleep(Duration::from_millis(50 - req.sequence * 10)).await;
                    Ok(HeartbeatResponse {
                        sequence: req.sequence,
                        server: "test".into(),
                    }
                    .into())
                }
                RpcRequest::Disconnect(req) => Ok(DisconnectResponse {
                    found: req.account_id == 1,
                }
                .into()),
                _ => Err(RpcFault::new(RpcStatus::InvalidArgument, "unsupported")),
            }
        }
    }

    #[tokio::test]
    async fn test_channel_transport() {
        let transport = ChannelTransport::pair(Arc::new(TestService), 8);
        let gateway = RpcGateway::new("test", Arc::new(transport), RpcPolicies::default());

        let response = gateway
            .call(DisconnectRequest {
                account_id: 1,
                reason: "test".into(),
            })
            .await
            .unwrap();
        assert!(response.found);
    }

    #[tokio::test]
    async fn test_tcp_round_trip_pairs_by_request_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_tcp(
            listener,
            Arc::new(TestService),
            shutdown.clone(),
            MAX_RPC_FRAME,
        ));

        let transport = Arc::new(TcpTransport::new(addr.to_string(), MAX_RPC_FRAME));
        let gateway = RpcGateway::new("test", transport, RpcPolicies::default());

        let calls: Vec<_> = (1..=4)
            .map(|sequence| {
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.call(HeartbeatRequest { sequence }).await })
            })
            .collect();
        for (expected, call) in (1..=4).zip(calls) {
            assert_eq!(call.await.unwrap().unwrap().sequence, expected);
        }

        let err = gateway
            .call(crate::rpc::ClaimSessionRequest {
                account_id: 1,
                token: 1,
                machine_id: uuid::Uuid::nil(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(RpcStatus::InvalidArgument));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_tcp_unreachable_peer() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let transport = TcpTransport::new(addr.to_string(), MAX_RPC_FRAME);
        let result = transport
            .request(HeartbeatRequest { sequence: 1 }.into())
            .await;
        assert!(matches!(result, Err(RpcError::Unavailable(_))));
    }
}
