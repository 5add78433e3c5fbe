//! Connection handler module
//!
//! Drives one client connection from accept to teardown:
//! - registers the session with the session manager
//! - splits the stream into frames and envelopes
//! - feeds envelopes to the session's inbound queue
//! - drains the outbound queue to the socket in order
//! - closes the session (running its teardown hooks) when either side stops

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::net::dispatch::{DispatchTable, InboundQueue};
use crate::net::packet::Envelope;
use crate::net::session::{Session, SessionManager};
use crate::net::transport::{framed, FramedStream};

/// Connection handler for processing client connections
#[derive(Clone)]
pub struct ConnectionHandler {
    sessions: Arc<SessionManager>,
    table: Arc<DispatchTable>,
    inbound_capacity: usize,
    max_frame_length: usize,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(
        sessions: Arc<SessionManager>,
        table: Arc<DispatchTable>,
        inbound_capacity: usize,
        max_frame_length: usize,
    ) -> Self {
        Self {
            sessions,
            table,
            inbound_capacity,
            max_frame_length,
        }
    }

    /// Handle a TCP connection
    pub async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!(address = %addr, "Handling TCP connection");
        stream.set_nodelay(true)?;
        self.handle_stream(stream, addr).await
    }

    /// Handle any byte stream carrying length-delimited packets
    pub async fn handle_stream<S>(&self, stream: S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, outbound_rx) = self.sessions.create_session(addr)?;
        let (sink, frames) = framed(stream, self.max_frame_length).split();

        let writer = tokio::spawn(write_loop(
            session.id,
            sink,
            outbound_rx,
            session.disconnect_token(),
        ));
        let (inbound, worker) =
            InboundQueue::spawn(self.table.clone(), session.clone(), self.inbound_capacity);

        debug!(
            session_id = session.id,
            address = %session.address,
            "Starting connection handler"
        );

        let result = read_loop(&session, frames, &inbound).await;

        // Leaving the read loop for any reason ends the session
        session.disconnect();
        drop(inbound);
        session.close();

        if let Err(e) = worker.await {
            warn!(session_id = session.id, error = %e, "Inbound worker aborted");
        }
        if let Err(e) = writer.await {
            warn!(session_id = session.id, error = %e, "Writer task aborted");
        }

        debug!(session_id = session.id, "Connection handler ending");
        result
    }
}

async fn read_loop<S>(
    session: &Arc<Session>,
    mut frames: futures_util::stream::SplitStream<FramedStream<S>>,
    inbound: &InboundQueue,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let disconnect = session.disconnect_token();
    loop {
        tokio::select! {
            _ = disconnect.cancelled() => {
                debug!(session_id = session.id, "Disconnect requested");
                return Ok(());
            }
            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    let envelope = match Envelope::decode(frame.freeze()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(session_id = session.id, error = %e, "Undecodable frame");
                            return Err(e.into());
                        }
                    };
                    trace!(
                        session_id = session.id,
                        opcode = envelope.opcode,
                        len = envelope.payload.len(),
                        "Received packet"
                    );
                    if inbound.submit(envelope).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    debug!(session_id = session.id, error = %e, "Read error");
                    return Err(e.into());
                }
                None => {
                    debug!(session_id = session.id, "Connection closed by peer");
                    return Ok(());
                }
            },
        }
    }
}

async fn write_loop<S>(
    session_id: u64,
    mut sink: SplitSink<FramedStream<S>, Bytes>,
    mut outbound: mpsc::Receiver<Bytes>,
    disconnect: CancellationToken,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        tokio::select! {
            biased;
            packet = outbound.recv() => match packet {
                Some(packet) => {
                    if let Err(e) = sink.send(packet).await {
                        debug!(session_id = session_id, error = %e, "Write failed");
                        return;
                    }
                }
                None => break,
            },
            _ = disconnect.cancelled() => {
                // Flush whatever the handlers queued before teardown
                while let Ok(packet) = outbound.try_recv() {
                    if sink.send(packet).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = sink.close().await {
        trace!(session_id = session_id, error = %e, "Error during transport shutdown");
    }
}
