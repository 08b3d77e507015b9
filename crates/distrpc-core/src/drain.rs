//! Graceful server shutdown: stop accepting new flows and give in-flight
//! handlers a bounded grace period before forcing a close.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Represents the current state of the drain process.
pub enum DrainState {
    /// Normal operation, accepting new requests.
    Active = 0,
    /// Rejecting new requests, waiting for in-flight to complete.
    Draining = 1,
    /// All in-flight completed, ready to shut down.
    Drained = 2,
    /// Timeout exceeded, forcefully closed.
    ForceClosed = 3,
}

impl From<u8> for DrainState {
    fn from(value: u8) -> Self {
        match value {
            0 => DrainState::Active,
            1 => DrainState::Draining,
            2 => DrainState::Drained,
            3 => DrainState::ForceClosed,
            _ => DrainState::Active,
        }
    }
}

#[derive(Debug, Clone)]
/// Configuration for the drain controller.
pub struct DrainConfig {
    /// Maximum time to wait for in-flight requests to complete.
    pub drain_timeout: Duration,
    /// Interval between checking if draining is complete.
    pub check_interval: Duration,
    /// Time after which connections are forcefully closed.
    pub force_close_after: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            check_interval: Duration::from_millis(100),
            force_close_after: Duration::from_secs(60),
        }
    }
}

/// Callback listener for drain events.
#[derive(Default)]
pub struct DrainListener {
    /// Callback invoked when drain starts.
    pub on_drain_start: Option<Box<dyn Fn() + Send + Sync>>,
    /// Callback invoked when drain completes (all in-flight requests finished).
    pub on_drained: Option<Box<dyn Fn() + Send + Sync>>,
    /// Callback invoked when force close is triggered.
    pub on_force_close: Option<Box<dyn Fn() + Send + Sync>>,
}

impl std::fmt::Debug for DrainListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainListener")
            .field("on_drain_start", &self.on_drain_start.is_some())
            .field("on_drained", &self.on_drained.is_some())
            .field("on_force_close", &self.on_force_close.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
/// Snapshot of current drain state and statistics.
pub struct DrainStats {
    /// Current drain state.
    pub state: DrainState,
    /// Number of in-flight requests.
    pub inflight_count: usize,
    /// Duration since drain started, if applicable.
    pub drain_duration: Option<Duration>,
}

/// Controller for managing connection draining during node removal.
pub struct DrainController {
    config: DrainConfig,
    state: AtomicU8,
    inflight_count: AtomicUsize,
    drain_started_at: Mutex<Option<Instant>>,
    listeners: Mutex<Vec<DrainListener>>,
}

/// RAII guard that tracks in-flight requests. Decrements the count on drop.
pub struct DrainGuard<'a> {
    controller: &'a DrainController,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.controller
            .inflight_count
            .fetch_sub(1, Ordering::SeqCst);
        debug!("DrainGuard dropped, inflight decremented");
    }
}

impl DrainController {
    /// Creates a new DrainController with the given configuration.
    #[must_use]
    pub fn new(config: DrainConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(DrainState::Active as u8),
            inflight_count: AtomicUsize::new(0),
            drain_started_at: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current drain state.
    pub fn state(&self) -> DrainState {
        DrainState::from(self.state.load(Ordering::SeqCst))
    }

    /// Returns true if the controller is accepting new requests (i.e., state is Active).
    pub fn is_accepting(&self) -> bool {
        self.state() == DrainState::Active
    }

    /// Begins the drain process. Transitions from Active to Draining.
    /// Returns false if already draining or drained.
    pub fn begin_drain(&self) -> bool {
        let current_state = self.state.load(Ordering::SeqCst);
        if current_state != DrainState::Active as u8 {
            return false;
        }

        let success = self
            .state
            .compare_exchange(
                DrainState::Active as u8,
                DrainState::Draining as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if success {
            let now = Instant::now();
            *self.drain_started_at.lock().unwrap() = Some(now);

            info!("Drain started: Active -> Draining");

            for listener in self.listeners.lock().unwrap().iter() {
                if let Some(ref callback) = listener.on_drain_start {
                    callback();
                }
            }
        }

        success
    }

    /// Tries to acquire a guard for a new request. Returns None if not in Active state.
    /// Increments the in-flight count on success.
    pub fn try_acquire(&self) -> Option<DrainGuard<'_>> {
        let current_state = self.state.load(Ordering::SeqCst);
        if current_state != DrainState::Active as u8 {
            return None;
        }

        self.inflight_count.fetch_add(1, Ordering::SeqCst);
        debug!("DrainGuard acquired");
        Some(DrainGuard { controller: self })
    }

    /// Returns the current number of in-flight requests.
    pub fn inflight_count(&self) -> usize {
        self.inflight_count.load(Ordering::SeqCst)
    }

    /// Returns the interval a watchdog should poll `check_drained` at.
    pub fn check_interval(&self) -> Duration {
        self.config.check_interval
    }

    /// Returns the duration after which a stalled drain should be force closed.
    pub fn force_close_after(&self) -> Duration {
        self.config.force_close_after
    }

    /// Checks if all in-flight requests have completed.
    /// If in Draining state and inflight_count is 0, transitions to Drained.
    /// Returns true if now in Drained state.
    pub fn check_drained(&self) -> bool {
        if self.state() != DrainState::Draining {
            return false;
        }

        if self.inflight_count() == 0 {
            let old_state = self.state.swap(DrainState::Drained as u8, Ordering::SeqCst);

            if old_state == DrainState::Draining as u8 {
                info!("Drain completed: Draining -> Drained");

                for listener in self.listeners.lock().unwrap().iter() {
                    if let Some(ref callback) = listener.on_drained {
                        callback();
                    }
                }
            }
            true
        } else {
            false
        }
    }

    /// Forcefully transitions to ForceClosed state, regardless of in-flight count.
    pub fn force_close(&self) {
        let old_state = self
            .state
            .swap(DrainState::ForceClosed as u8, Ordering::SeqCst);

        if old_state != DrainState::ForceClosed as u8 {
            info!(
                "Force close: {:?} -> ForceClosed",
                DrainState::from(old_state)
            );

            for listener in self.listeners.lock().unwrap().iter() {
                if let Some(ref callback) = listener.on_force_close {
                    callback();
                }
            }
        }
    }

    /// Resets the controller to Active state. Used when node rejoins the cluster.
    pub fn reset(&self) {
        let old_state = self.state.load(Ordering::SeqCst);
        self.state.store(DrainState::Active as u8, Ordering::SeqCst);
        self.inflight_count.store(0, Ordering::SeqCst);
        *self.drain_started_at.lock().unwrap() = None;

        info!("Reset from {:?} to Active", DrainState::from(old_state));
    }

    /// Adds a listener for drain events.
    pub fn add_listener(&self, listener: DrainListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Returns the elapsed time since drain started, if applicable.
    pub fn elapsed_since_drain(&self) -> Option<Duration> {
        let guard = self.drain_started_at.lock().unwrap();
        guard.map(|start| start.elapsed())
    }

    /// Returns a snapshot of current drain statistics.
    pub fn stats(&self) -> DrainStats {
        DrainStats {
            state: self.state(),
            inflight_count: self.inflight_count(),
            drain_duration: self.elapsed_since_drain(),
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new(DrainConfig::default())
    }
}
