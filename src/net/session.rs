//! Session management module
//!
//! Manages client sessions including:
//! - Session state machine (connecting -> authenticating -> authenticated -> active)
//! - Serialized per-session execution (one handler at a time)
//! - Bounded FIFO outbound queue with disconnect-on-overflow
//! - Teardown hooks and a session-scoped cancellation token
//! - Thread-safe session registry with per-IP limits and idle sweeps

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AuthError, NetworkError, RealmgateError, Result, StateError};

/// Unique session identifier
pub type SessionId = u64;

/// Session state in the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Socket accepted, nothing received yet
    Connecting,
    /// Credentials or a migration token are being checked
    Authenticating,
    /// Identity established, not yet in play
    Authenticated,
    /// Fully in play
    Active,
    /// Teardown requested
    Disconnecting,
    /// Torn down
    Closed,
}

impl SessionState {
    /// States from which a session may still be driven forward
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Disconnecting | SessionState::Closed)
    }

    /// Whether `next` is a legal step from this state through `Session::transition`.
    /// `Closed` is never reachable this way; only teardown enters it.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (*self, next) {
            (Connecting, Authenticating)
            | (Authenticating, Authenticated)
            | (Authenticated, Active) => true,
            (from, Disconnecting) => from.is_live(),
            _ => false,
        }
    }

    /// Get a human-readable name for the state
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::Authenticating => "Authenticating",
            SessionState::Authenticated => "Authenticated",
            SessionState::Active => "Active",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Closed => "Closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which kind of process owns a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessTier {
    Login,
    World,
    Channel,
}

impl std::fmt::Display for ProcessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessTier::Login => write!(f, "login"),
            ProcessTier::World => write!(f, "world"),
            ProcessTier::Channel => write!(f, "channel"),
        }
    }
}

type TeardownHook = Box<dyn FnOnce() + Send + 'static>;

/// A connected client session
pub struct Session {
    /// Unique session identifier
    pub id: SessionId,
    /// Remote address of the client
    pub address: SocketAddr,
    /// Owning process tier
    pub tier: ProcessTier,
    /// Current session state
    state: RwLock<SessionState>,
    /// Account bound after authentication
    account_id: RwLock<Option<i64>>,
    /// Character selected or claimed
    character_id: RwLock<Option<i64>>,
    /// Entity bound in the entity table
    entity_id: RwLock<Option<u64>>,
    /// Display name
    username: RwLock<Option<String>>,
    /// Client machine id, checked on handoff
    machine_id: RwLock<Uuid>,
    /// Time of session creation
    pub created_at: Instant,
    /// Time of last activity
    last_activity: RwLock<Instant>,
    /// Bounded outbound queue drained by the writer task
    outbound_tx: mpsc::Sender<Bytes>,
    /// Serializes handler execution for this session
    exec_lock: tokio::sync::Mutex<()>,
    /// Fired when the session is asked to disconnect
    disconnect_signal: CancellationToken,
    /// Fired when the session closes; parent of every per-session async wait
    scope: CancellationToken,
    teardown: Mutex<Vec<TeardownHook>>,
    closed: AtomicBool,
}

impl Session {
    /// Create a new session together with the receiving end of its outbound queue
    pub fn new(
        id: SessionId,
        address: SocketAddr,
        tier: ProcessTier,
        outbound_capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity.max(1));
        let now = Instant::now();
        let session = Self {
            id,
            address,
            tier,
            state: RwLock::new(SessionState::Connecting),
            account_id: RwLock::new(None),
            character_id: RwLock::new(None),
            entity_id: RwLock::new(None),
            username: RwLock::new(None),
            machine_id: RwLock::new(Uuid::nil()),
            created_at: now,
            last_activity: RwLock::new(now),
            outbound_tx,
            exec_lock: tokio::sync::Mutex::new(()),
            disconnect_signal: CancellationToken::new(),
            scope: CancellationToken::new(),
            teardown: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        (session, outbound_rx)
    }

    /// Get the IP address as a string (without port)
    pub fn ip(&self) -> String {
        self.address.ip().to_string()
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Check if session can still be driven forward
    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Move to `next` if the transition is legal, otherwise leave the state unchanged
    pub fn transition(&self, next: SessionState) -> std::result::Result<(), StateError> {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            if !old.can_transition_to(next) {
                return Err(StateError::IllegalTransition {
                    from: old,
                    to: next,
                });
            }
            *state = next;
            old
        };
        debug!(
            session_id = self.id,
            old_state = %old_state,
            new_state = %next,
            "Session state changed"
        );
        Ok(())
    }

    /// Request teardown. Moves a live session to `Disconnecting` and wakes the
    /// connection task; a no-op for sessions already on their way out.
    pub fn disconnect(&self) {
        if self.transition(SessionState::Disconnecting).is_ok() {
            self.disconnect_signal.cancel();
        }
    }

    /// Token fired once teardown has been requested
    pub fn disconnect_token(&self) -> CancellationToken {
        self.disconnect_signal.clone()
    }

    /// Session-scoped token, cancelled when the session closes
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Whether teardown has completed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a hook to run on close. Hooks run in reverse registration
    /// order. If the session is already closed the hook runs immediately.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self.teardown.lock();
            if !self.closed.load(Ordering::SeqCst) {
                hooks.push(Box::new(hook));
                return;
            }
        }
        run_hook(self.id, Box::new(hook));
    }

    /// Tear the session down: enter `Closed`, cancel every per-session wait and
    /// run the teardown hooks. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let old_state = std::mem::replace(&mut *self.state.write(), SessionState::Closed);
        self.disconnect_signal.cancel();
        self.scope.cancel();

        let hooks = std::mem::take(&mut *self.teardown.lock());
        let hook_count = hooks.len();
        for hook in hooks.into_iter().rev() {
            run_hook(self.id, hook);
        }

        info!(
            session_id = self.id,
            old_state = %old_state,
            hooks = hook_count,
            "Session closed"
        );
        true
    }

    /// Acquire the session's execution context. Handlers for one session never
    /// overlap; waiters are served in arrival order.
    pub async fn lock_exec(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.exec_lock.lock().await
    }

    /// Queue a packet for the client. A full queue disconnects the session.
    pub fn send(&self, packet: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        match self.outbound_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = self.id,
                    capacity = self.outbound_tx.max_capacity(),
                    "Outbound queue full, disconnecting"
                );
                self.disconnect();
                Err(NetworkError::OutboundFull(self.id).into())
            }
            Err(TrySendError::Closed(_)) => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    pub fn set_account_id(&self, account_id: i64) {
        *self.account_id.write() = Some(account_id);
    }

    pub fn account_id(&self) -> Option<i64> {
        *self.account_id.read()
    }

    pub fn set_character_id(&self, character_id: i64) {
        *self.character_id.write() = Some(character_id);
    }

    pub fn character_id(&self) -> Option<i64> {
        *self.character_id.read()
    }

    pub fn set_entity_id(&self, entity_id: u64) {
        *self.entity_id.write() = Some(entity_id);
    }

    pub fn entity_id(&self) -> Option<u64> {
        *self.entity_id.read()
    }

    pub fn set_username(&self, username: String) {
        *self.username.write() = Some(username);
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().clone()
    }

    pub fn set_machine_id(&self, machine_id: Uuid) {
        *self.machine_id.write() = machine_id;
    }

    pub fn machine_id(&self) -> Uuid {
        *self.machine_id.read()
    }

    /// Update the last activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Get the last activity time
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.read()
    }

    /// Get the duration since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Check if the session has been idle too long
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        self.idle_duration() > max_idle
    }
}

fn run_hook(session_id: SessionId, hook: TeardownHook) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(session_id = session_id, "Teardown hook panicked");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("tier", &self.tier)
            .field("state", &self.state())
            .field("account_id", &self.account_id())
            .field("entity_id", &self.entity_id())
            .field("idle_duration", &self.idle_duration())
            .finish()
    }
}

/// Limits applied by the session manager
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_per_ip: usize,
    pub idle_timeout: Duration,
    pub outbound_capacity: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_per_ip: 10,
            idle_timeout: Duration::from_secs(300),
            outbound_capacity: 256,
        }
    }
}

/// Thread-safe session manager
pub struct SessionManager {
    tier: ProcessTier,
    /// Map of session ID to session
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Map of account ID to session ID (for logged-in accounts)
    account_to_session: DashMap<i64, SessionId>,
    /// Map of character ID to session ID
    character_to_session: DashMap<i64, SessionId>,
    /// Map of IP address to list of session IDs (for connection limiting)
    ip_to_sessions: DashMap<String, Vec<SessionId>>,
    /// Next session ID to assign
    next_id: AtomicU64,
    limits: SessionLimits,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(tier: ProcessTier) -> Self {
        Self::with_limits(tier, SessionLimits::default())
    }

    /// Create a session manager with custom limits
    pub fn with_limits(tier: ProcessTier, limits: SessionLimits) -> Self {
        Self {
            tier,
            sessions: DashMap::new(),
            account_to_session: DashMap::new(),
            character_to_session: DashMap::new(),
            ip_to_sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    pub fn tier(&self) -> ProcessTier {
        self.tier
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    /// Create and register a session. Closing the session removes it from the
    /// manager again.
    pub fn create_session(
        self: &Arc<Self>,
        address: SocketAddr,
    ) -> Result<(Arc<Session>, mpsc::Receiver<Bytes>)> {
        let ip = address.ip().to_string();

        // Reserve the IP slot under the entry lock so concurrent accepts
        // cannot both slip under the limit.
        let id = {
            let mut ids = self.ip_to_sessions.entry(ip.clone()).or_default();
            if ids.len() >= self.limits.max_per_ip {
                warn!(
                    ip = %ip,
                    count = ids.len(),
                    max = self.limits.max_per_ip,
                    "Connection limit exceeded for IP"
                );
                return Err(NetworkError::TooManyConnections(ip).into());
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            ids.push(id);
            id
        };

        let (session, outbound_rx) =
            Session::new(id, address, self.tier, self.limits.outbound_capacity);
        let session = Arc::new(session);
        self.sessions.insert(id, session.clone());

        let manager: Weak<SessionManager> = Arc::downgrade(self);
        session.on_close(move || {
            if let Some(manager) = manager.upgrade() {
                manager.remove(id);
            }
        });

        info!(
            session_id = id,
            address = %address,
            tier = %self.tier,
            "Session created"
        );

        Ok((session, outbound_rx))
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.clone())
    }

    /// Get the session bound to an account
    pub fn get_by_account(&self, account_id: i64) -> Option<Arc<Session>> {
        self.account_to_session
            .get(&account_id)
            .and_then(|id| self.get(*id))
    }

    /// Check if an account currently holds a session here
    pub fn is_logged_in(&self, account_id: i64) -> bool {
        self.account_to_session.contains_key(&account_id)
    }

    /// Bind an account to a session. Fails if another session holds it or
    /// the session already closed.
    pub fn bind_account(&self, session: &Session, account_id: i64) -> Result<()> {
        if session.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        match self.account_to_session.entry(account_id) {
            Entry::Occupied(existing) if *existing.get() != session.id => {
                debug!(
                    session_id = session.id,
                    account_id = account_id,
                    holder = *existing.get(),
                    "Account already bound"
                );
                return Err(AuthError::AlreadyLoggedIn.into());
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                session.set_account_id(account_id);
                slot.insert(session.id);
            }
        }
        // Teardown may have run between the check above and the insert
        if session.is_closed() {
            self.account_to_session
                .remove_if(&account_id, |_, sid| *sid == session.id);
            return Err(NetworkError::ConnectionClosed.into());
        }

        debug!(
            session_id = session.id,
            account_id = account_id,
            "Account bound to session"
        );
        Ok(())
    }

    /// Bind a character to a session. Fails if the session already closed.
    pub fn bind_character(&self, session: &Session, character_id: i64) -> Result<()> {
        if session.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        session.set_character_id(character_id);
        self.character_to_session.insert(character_id, session.id);
        if session.is_closed() {
            self.character_to_session
                .remove_if(&character_id, |_, sid| *sid == session.id);
            return Err(NetworkError::ConnectionClosed.into());
        }
        Ok(())
    }

    /// Get the session playing a character
    pub fn get_by_character(&self, character_id: i64) -> Option<Arc<Session>> {
        self.character_to_session
            .get(&character_id)
            .and_then(|id| self.get(*id))
    }

    /// Remove a session from every index
    fn remove(&self, id: SessionId) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            if let Some(account_id) = session.account_id() {
                self.account_to_session.remove_if(&account_id, |_, sid| *sid == id);
            }
            if let Some(character_id) = session.character_id() {
                self.character_to_session
                    .remove_if(&character_id, |_, sid| *sid == id);
            }

            let ip = session.ip();
            if let Some(mut sessions) = self.ip_to_sessions.get_mut(&ip) {
                sessions.retain(|&sid| sid != id);
            }
            self.ip_to_sessions.remove_if(&ip, |_, v| v.is_empty());

            debug!(
                session_id = id,
                account_id = ?session.account_id(),
                "Session removed"
            );
        }
    }

    /// Ask a session to disconnect. Its connection task performs the close.
    pub fn disconnect(&self, id: SessionId) -> Result<()> {
        let session = self
            .get(id)
            .ok_or(RealmgateError::Network(NetworkError::SessionNotFound(id)))?;
        session.disconnect();
        Ok(())
    }

    /// Close a session immediately, running its teardown
    pub fn close(&self, id: SessionId) -> bool {
        match self.get(id) {
            Some(session) => session.close(),
            None => false,
        }
    }

    /// Disconnect all sessions
    pub fn disconnect_all(&self) {
        for session in self.sessions.iter() {
            session.disconnect();
        }
    }

    /// Get the count of sessions
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the count of sessions per state
    pub fn count_by_state(&self) -> HashMap<SessionState, usize> {
        let mut counts = HashMap::new();
        for session in self.sessions.iter() {
            *counts.entry(session.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Disconnect sessions idle for longer than the configured timeout.
    /// Returns the ids that were asked to leave.
    pub fn sweep_idle(&self) -> Vec<SessionId> {
        let mut expired = Vec::new();

        for session in self.sessions.iter() {
            if session.is_live() && session.is_idle(self.limits.idle_timeout) {
                debug!(
                    session_id = session.id,
                    idle_duration = ?session.idle_duration(),
                    "Session idle timeout"
                );
                expired.push(session.id);
            }
        }

        for id in &expired {
            if let Some(session) = self.get(*id) {
                session.disconnect();
            }
        }
        expired
    }

    /// Get sessions from a specific IP
    pub fn sessions_from_ip(&self, ip: &str) -> Vec<Arc<Session>> {
        self.ip_to_sessions
            .get(ip)
            .map(|ids| ids.iter().filter_map(|&id| self.get(id)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_address() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    fn test_session(capacity: usize) -> (Session, mpsc::Receiver<Bytes>) {
        Session::new(1, test_address(), ProcessTier::Channel, capacity)
    }

    #[test]
    fn test_session_creation() {
        let (session, _rx) = test_session(4);
        assert_eq!(session.id, 1);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.is_live());
        assert!(!session.is_closed());
    }

    #[test]
    fn test_forward_transitions() {
        let (session, _rx) = test_session(4);
        session.transition(SessionState::Authenticating).unwrap();
        session.transition(SessionState::Authenticated).unwrap();
        session.transition(SessionState::Active).unwrap();
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_illegal_transition_keeps_state() {
        let (session, _rx) = test_session(4);

        let err = session.transition(SessionState::Active).unwrap_err();
        assert_eq!(
            err,
            StateError::IllegalTransition {
                from: SessionState::Connecting,
                to: SessionState::Active
            }
        );
        assert_eq!(session.state(), SessionState::Connecting);

        // Closed is only reachable through teardown
        session.transition(SessionState::Disconnecting).unwrap();
        assert!(session.transition(SessionState::Closed).is_err());
        assert_eq!(session.state(), SessionState::Disconnecting);
    }

    #[test]
    fn test_close_runs_hooks_once_in_reverse() {
        let (session, _rx) = test_session(4);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            session.on_close(move || order.lock().push(i));
        }

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.scope().is_cancelled());
        assert!(session.disconnect_token().is_cancelled());
    }

    #[test]
    fn test_hook_after_close_runs_immediately() {
        let (session, _rx) = test_session(4);
        session.close();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        session.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_hook_does_not_stop_teardown() {
        let (session, _rx) = test_session(4);
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        session.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        session.on_close(|| panic!("hook failure"));

        session.close();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outbound_fifo() {
        let (session, mut rx) = test_session(8);
        for i in 0u8..5 {
            session.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(rx.recv().await.unwrap()[0], i);
        }
    }

    #[test]
    fn test_outbound_overflow_disconnects() {
        let (session, _rx) = test_session(2);
        session.transition(SessionState::Authenticating).unwrap();

        session.send(Bytes::from_static(b"a")).unwrap();
        session.send(Bytes::from_static(b"b")).unwrap();
        let err = session.send(Bytes::from_static(b"c")).unwrap_err();

        assert!(matches!(
            err,
            RealmgateError::Network(NetworkError::OutboundFull(1))
        ));
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert!(session.disconnect_token().is_cancelled());
    }

    #[test]
    fn test_session_manager_create_and_close() {
        let manager = Arc::new(SessionManager::new(ProcessTier::Login));
        let (session, _rx) = manager.create_session(test_address()).unwrap();
        let id = session.id;

        assert_eq!(id, 1);
        assert_eq!(manager.count(), 1);
        assert!(manager.get(id).is_some());

        assert!(manager.close(id));
        assert!(manager.get(id).is_none());
        assert_eq!(manager.count(), 0);
        assert!(manager.sessions_from_ip("127.0.0.1").is_empty());
    }

    #[test]
    fn test_session_manager_ip_limit() {
        let limits = SessionLimits {
            max_per_ip: 2,
            ..SessionLimits::default()
        };
        let manager = Arc::new(SessionManager::with_limits(ProcessTier::Login, limits));
        let addr1: SocketAddr = "192.168.1.1:12345".parse().unwrap();
        let addr2: SocketAddr = "192.168.1.1:12346".parse().unwrap();
        let addr3: SocketAddr = "192.168.1.1:12347".parse().unwrap();

        let (first, _rx1) = manager.create_session(addr1).unwrap();
        assert!(manager.create_session(addr2).is_ok());
        assert!(manager.create_session(addr3).is_err());

        // Closing one frees a slot
        first.close();
        assert!(manager.create_session(addr3).is_ok());
    }

    #[test]
    fn test_bind_account_rejects_second_session() {
        let manager = Arc::new(SessionManager::new(ProcessTier::Channel));
        let (s1, _rx1) = manager.create_session("127.0.0.1:1".parse().unwrap()).unwrap();
        let (s2, _rx2) = manager.create_session("127.0.0.1:2".parse().unwrap()).unwrap();

        manager.bind_account(&s1, 42).unwrap();
        // Rebinding the same session is fine
        manager.bind_account(&s1, 42).unwrap();
        assert!(matches!(
            manager.bind_account(&s2, 42),
            Err(RealmgateError::Auth(AuthError::AlreadyLoggedIn))
        ));
        assert_eq!(manager.get_by_account(42).unwrap().id, s1.id);

        s1.close();
        assert!(!manager.is_logged_in(42));
        manager.bind_account(&s2, 42).unwrap();
    }

    #[test]
    fn test_bind_after_close_leaves_no_index() {
        let manager = Arc::new(SessionManager::new(ProcessTier::Channel));
        let (s1, _rx1) = manager.create_session("127.0.0.1:1".parse().unwrap()).unwrap();

        // Client hung up while the handler was still awaiting
        s1.close();
        assert!(matches!(
            manager.bind_account(&s1, 42),
            Err(RealmgateError::Network(NetworkError::ConnectionClosed))
        ));
        assert!(matches!(
            manager.bind_character(&s1, 7),
            Err(RealmgateError::Network(NetworkError::ConnectionClosed))
        ));
        assert!(!manager.is_logged_in(42));
        assert!(manager.get_by_character(7).is_none());

        let (s2, _rx2) = manager.create_session("127.0.0.1:2".parse().unwrap()).unwrap();
        manager.bind_account(&s2, 42).unwrap();
        manager.bind_character(&s2, 7).unwrap();
        assert_eq!(manager.get_by_account(42).unwrap().id, s2.id);
        assert_eq!(manager.get_by_character(7).unwrap().id, s2.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bind_racing_close_never_leaks() {
        let manager = Arc::new(SessionManager::with_limits(
            ProcessTier::Channel,
            SessionLimits {
                max_per_ip: usize::MAX,
                ..SessionLimits::default()
            },
        ));

        for account_id in 0..200i64 {
            let (session, _rx) = manager.create_session(test_address()).unwrap();
            let closer = session.clone();
            let close = tokio::spawn(async move {
                closer.close();
            });
            let _ = manager.bind_account(&session, account_id);
            close.await.unwrap();

            assert!(session.is_closed());
            assert!(
                !manager.is_logged_in(account_id),
                "account {} left bound to a closed session",
                account_id
            );
        }
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_idle() {
        let limits = SessionLimits {
            idle_timeout: Duration::from_secs(30),
            ..SessionLimits::default()
        };
        let manager = Arc::new(SessionManager::with_limits(ProcessTier::Channel, limits));
        let (idle, _rx1) = manager.create_session("127.0.0.1:1".parse().unwrap()).unwrap();
        let (busy, _rx2) = manager.create_session("127.0.0.1:2".parse().unwrap()).unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        busy.touch();
        tokio::time::advance(Duration::from_secs(15)).await;

        let swept = manager.sweep_idle();
        assert_eq!(swept, vec![idle.id]);
        assert_eq!(idle.state(), SessionState::Disconnecting);
        assert_eq!(busy.state(), SessionState::Connecting);
    }

    #[test]
    fn test_session_count_by_state() {
        let manager = Arc::new(SessionManager::new(ProcessTier::Login));
        let (s1, _rx1) = manager.create_session("127.0.0.1:1".parse().unwrap()).unwrap();
        let (s2, _rx2) = manager.create_session("127.0.0.1:2".parse().unwrap()).unwrap();
        let (_s3, _rx3) = manager.create_session("127.0.0.1:3".parse().unwrap()).unwrap();

        s1.transition(SessionState::Authenticating).unwrap();
        s2.transition(SessionState::Authenticating).unwrap();

        let counts = manager.count_by_state();
        assert_eq!(counts.get(&SessionState::Authenticating), Some(&2));
        assert_eq!(counts.get(&SessionState::Connecting), Some(&1));
    }
}
