//! World module
//!
//! The per-process tick loop:
//! - advances every entity's task scheduler
//! - sweeps idle sessions

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ai::{EntityTable, Tick};
use crate::error::Result;
use crate::net::session::SessionManager;

/// Standard tick rate in milliseconds
pub const TICK_RATE_MS: u64 = 600;

/// Idle-session sweep interval in ticks (30 seconds at 600ms)
pub const SWEEP_INTERVAL_TICKS: u64 = 50;

/// World settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    pub name: String,
    /// Channel this process serves
    pub channel: u16,
    pub tick_rate_ms: u64,
    /// Sweep interval in ticks (0 to disable)
    pub sweep_interval: u64,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            name: "Realmgate".to_string(),
            channel: 1,
            tick_rate_ms: TICK_RATE_MS,
            sweep_interval: SWEEP_INTERVAL_TICKS,
        }
    }
}

/// World state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldState {
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Game world - drives the tick for one process
pub struct GameWorld {
    pub settings: WorldSettings,
    state: RwLock<WorldState>,
    tick: AtomicU64,
    running: AtomicBool,
    start_time: RwLock<Option<Instant>>,
    entities: Arc<EntityTable>,
    sessions: Arc<SessionManager>,
}

impl GameWorld {
    pub fn new(
        settings: WorldSettings,
        entities: Arc<EntityTable>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        info!(
            name = %settings.name,
            channel = settings.channel,
            tick_rate_ms = settings.tick_rate_ms,
            "Creating game world"
        );

        Self {
            settings,
            state: RwLock::new(WorldState::Initializing),
            tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
            start_time: RwLock::new(None),
            entities,
            sessions,
        }
    }

    pub fn state(&self) -> WorldState {
        *self.state.read()
    }

    fn set_state(&self, new_state: WorldState) {
        let mut state = self.state.write();
        let old_state = *state;
        *state = new_state;
        debug!(old_state = ?old_state, new_state = ?new_state, "World state changed");
    }

    /// Current tick number
    pub fn tick(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn entities(&self) -> &Arc<EntityTable> {
        &self.entities
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Stop the loop after the current tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run the tick loop until `shutdown` fires or [`stop`](Self::stop) is called
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_rate_ms = self.settings.tick_rate_ms,
            channel = self.settings.channel,
            "Starting game world"
        );

        self.running.store(true, Ordering::SeqCst);
        *self.start_time.write() = Some(Instant::now());
        self.set_state(WorldState::Running);

        let mut tick_interval = interval(Duration::from_millis(self.settings.tick_rate_ms.max(1)));
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    if let Err(e) = self.process_tick().await {
                        error!(error = %e, "Error processing tick");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.set_state(WorldState::ShuttingDown);
        self.running.store(false, Ordering::SeqCst);
        self.set_state(WorldState::Stopped);
        info!(
            total_ticks = self.tick(),
            uptime_secs = self.uptime_secs(),
            "Game world stopped"
        );
    }

    /// Process a single tick
    pub async fn process_tick(&self) -> Result<()> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;

        let busy = self.entities.tick_all(tick);

        if self.settings.sweep_interval > 0 && tick % self.settings.sweep_interval == 0 {
            let swept = self.sessions.sweep_idle();
            if !swept.is_empty() {
                info!(tick = tick, count = swept.len(), "Swept idle sessions");
            }
        }

        if tick % 1000 == 0 {
            debug!(
                tick = tick,
                entities = self.entities.len(),
                busy = busy,
                sessions = self.sessions.count(),
                "Tick milestone"
            );
        }

        Ok(())
    }
}
