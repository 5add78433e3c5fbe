//! Packet dispatch
//!
//! Routes decoded envelopes to opcode handlers. The table is built once per
//! process at startup and is read-only afterwards.
//!
//! Every handler runs inside the session's execution lock, so packets for one
//! session never interleave while different sessions proceed in parallel.
//! Decode failures and panics are contained here and end only the offending
//! session.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, NetworkError, RealmgateError, Result, StateError};
use crate::net::buffer::PacketReader;
use crate::net::packet::Envelope;
use crate::net::session::{Session, SessionState};

/// A handler for one inbound opcode
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Opcode this handler is registered under
    fn opcode(&self) -> u16;

    /// Name used in logs and counters
    fn name(&self) -> &'static str;

    /// Session states in which the packet is accepted
    fn allowed_states(&self) -> &'static [SessionState] {
        &[SessionState::Active]
    }

    /// Handle one packet. Returning a [`crate::error::ProtocolError`] ends the
    /// session; any other error is logged and the session carries on.
    async fn handle(&self, session: &Arc<Session>, packet: &mut PacketReader) -> Result<()>;
}

/// What happened to a dispatched envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handler ran to completion
    Handled,
    /// No handler for the opcode; dropped
    Unhandled,
    /// Session was in a state the handler does not accept; dropped
    Rejected,
    /// Handler returned an error; the session survives
    Failed,
    /// Decode failure or panic; the session is disconnecting
    Terminated,
}

struct Registered {
    handler: Arc<dyn PacketHandler>,
    handled: AtomicU64,
}

/// Builder for a [`DispatchTable`]
#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<u16, Arc<dyn PacketHandler>>,
}

impl DispatchTableBuilder {
    /// Register a handler. A second handler for the same opcode is an error.
    pub fn register<H>(self, handler: H) -> std::result::Result<Self, DispatchError>
    where
        H: PacketHandler + 'static,
    {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(
        mut self,
        handler: Arc<dyn PacketHandler>,
    ) -> std::result::Result<Self, DispatchError> {
        let opcode = handler.opcode();
        if self.handlers.contains_key(&opcode) {
            return Err(DispatchError::DuplicateOpcode(opcode));
        }
        self.handlers.insert(opcode, handler);
        Ok(self)
    }

    pub fn build(self) -> DispatchTable {
        let handlers = self
            .handlers
            .into_iter()
            .map(|(opcode, handler)| {
                (
                    opcode,
                    Registered {
                        handler,
                        handled: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        DispatchTable { handlers }
    }
}

/// Immutable opcode -> handler table
pub struct DispatchTable {
    handlers: HashMap<u16, Registered>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn contains(&self, opcode: u16) -> bool {
        self.handlers.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handled packet counts, busiest first. Opcodes never seen are omitted.
    pub fn handled_counts(&self) -> Vec<(u16, &'static str, u64)> {
        let mut stats: Vec<_> = self
            .handlers
            .iter()
            .map(|(opcode, entry)| {
                (
                    *opcode,
                    entry.handler.name(),
                    entry.handled.load(Ordering::Relaxed),
                )
            })
            .filter(|(_, _, count)| *count > 0)
            .collect();
        stats.sort_by(|a, b| b.2.cmp(&a.2));
        stats
    }

    /// Route one envelope to its handler
    pub async fn dispatch(&self, session: &Arc<Session>, envelope: Envelope) -> DispatchOutcome {
        let opcode = envelope.opcode;
        let Some(entry) = self.handlers.get(&opcode) else {
            debug!(
                session_id = session.id,
                opcode = format_args!("{:#06x}", opcode),
                len = envelope.payload.len(),
                "Unhandled opcode"
            );
            return DispatchOutcome::Unhandled;
        };
        let handler = &entry.handler;

        let _exec = session.lock_exec().await;

        let state = session.state();
        if !handler.allowed_states().contains(&state) {
            let err = StateError::UnsupportedState { opcode, state };
            debug!(
                session_id = session.id,
                handler = handler.name(),
                error = %err,
                "Packet dropped"
            );
            return DispatchOutcome::Rejected;
        }

        entry.handled.fetch_add(1, Ordering::Relaxed);
        session.touch();

        let mut reader = envelope.reader();
        let result = AssertUnwindSafe(handler.handle(session, &mut reader))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(RealmgateError::Protocol(err))) => {
                warn!(
                    session_id = session.id,
                    handler = handler.name(),
                    error = %err,
                    "Malformed packet, disconnecting"
                );
                session.disconnect();
                DispatchOutcome::Terminated
            }
            Ok(Err(err)) => {
                warn!(
                    session_id = session.id,
                    handler = handler.name(),
                    error = %err,
                    "Handler failed"
                );
                DispatchOutcome::Failed
            }
            Err(panic) => {
                error!(
                    session_id = session.id,
                    handler = handler.name(),
                    panic = panic_message(&panic),
                    "Handler panicked, disconnecting"
                );
                session.disconnect();
                DispatchOutcome::Terminated
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Per-session inbound queue. One worker drains it in submission order.
pub struct InboundQueue {
    tx: mpsc::Sender<Envelope>,
}

impl InboundQueue {
    /// Start the worker for a session. It stops when the queue is dropped or
    /// the session closes.
    pub fn spawn(
        table: Arc<DispatchTable>,
        session: Arc<Session>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));

        let worker = tokio::spawn(async move {
            let scope = session.scope().clone();
            loop {
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(envelope) => {
                            table.dispatch(&session, envelope).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(session_id = session.id, "Inbound worker stopped");
        });

        (Self { tx }, worker)
    }

    /// Submit an envelope, waiting for room in the queue
    pub async fn submit(&self, envelope: Envelope) -> Result<()> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| NetworkError::ConnectionClosed.into())
    }
}
