//! RPC gateway
//!
//! Wraps a transport with the per-operation policy: a hard deadline on every
//! call, no retries, and cancellation tied to the issuing session.

use std::sync::Arc;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::RpcError;
use crate::rpc::{DeliveryMode, OperationPolicy, RpcCall, RpcPolicies, RpcTransport};

/// Typed client for one peer process
#[derive(Clone)]
pub struct RpcGateway {
    peer: Arc<str>,
    transport: Arc<dyn RpcTransport>,
    policies: Arc<RpcPolicies>,
}

impl RpcGateway {
    pub fn new(peer: &str, transport: Arc<dyn RpcTransport>, policies: RpcPolicies) -> Self {
        Self {
            peer: Arc::from(peer),
            transport,
            policies: Arc::new(policies),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn policy(&self, operation: crate::rpc::Operation) -> OperationPolicy {
        self.policies.get(operation)
    }

    /// Issue a call and wait for the typed response, bounded by the
    /// operation's timeout
    pub async fn call<C: RpcCall>(&self, request: C) -> Result<C::Response, RpcError> {
        let operation = C::OPERATION;
        let policy = self.policy(operation);
        let started = Instant::now();

        let result = match timeout(policy.timeout, self.transport.request(request.into())).await {
            Ok(Ok(response)) => {
                C::extract(response).ok_or(RpcError::UnexpectedResponse(operation))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::Timeout {
                operation,
                after: policy.timeout,
            }),
        };

        match &result {
            Ok(_) => trace!(
                peer = %self.peer,
                operation = %operation,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "RPC completed"
            ),
            Err(e) => debug!(
                peer = %self.peer,
                operation = %operation,
                elapsed_ms = started.elapsed().as_millis() as u64,
                error = %e,
                "RPC failed"
            ),
        }
        result
    }

    /// Like [`call`](Self::call), but gives up with `Cancelled` as soon as
    /// `scope` fires (the issuing session closed)
    pub async fn call_scoped<C: RpcCall>(
        &self,
        scope: &CancellationToken,
        request: C,
    ) -> Result<C::Response, RpcError> {
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                debug!(peer = %self.peer, operation = %C::OPERATION, "RPC cancelled");
                Err(RpcError::Cancelled)
            }
            result = self.call(request) => result,
        }
    }

    /// Fire-and-forget: send in the background and return immediately.
    /// Only operations declared [`DeliveryMode::FireAndForget`] are accepted;
    /// delivery failures are logged, never reported to the caller.
    pub fn notify<C: RpcCall>(&self, request: C) -> Result<(), RpcError> {
        let operation = C::OPERATION;
        if self.policy(operation).mode != DeliveryMode::FireAndForget {
            warn!(peer = %self.peer, operation = %operation, "Refusing to notify a synchronous operation");
            return Err(RpcError::NotFireAndForget(operation));
        }

        let gateway = self.clone();
        tokio::spawn(async move {
            let _ = gateway.call(request).await;
        });
        Ok(())
    }
}
