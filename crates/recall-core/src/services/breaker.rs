//! Circuit breaker guarding calls to the vector index.
//!
//! Closed admits calls and tracks outcomes over a rolling window; Open
//! rejects calls until a cooldown elapses; HalfOpen admits exactly one
//! probe whose outcome decides the next state. Rejections are cheap
//! and never block, so context assembly can fall back to recency
//! without waiting on a dead index.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use recall_models::IndexHealth;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state, exposed through the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Tuning knobs; see `ResilienceConfig` for the environment mapping.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub failure_rate: f32,
    pub min_calls: usize,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub unreachable_trips: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            failure_rate: 0.5,
            min_calls: 4,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            unreachable_trips: 3,
        }
    }
}

/// Permission to make one guarded call. Hand it back through
/// `record_success` or `record_failure`. A permit dropped without a
/// verdict (a cancelled request future, for instance) is released via
/// `Drop`, so an abandoned probe can never wedge the breaker in
/// `HalfOpen`.
pub struct Call<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    recorded: bool,
}

impl Drop for Call<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.abandon(self.probe);
        }
    }
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    state: CircuitState,
    /// (when, succeeded) per completed call, pruned to the window.
    outcomes: VecDeque<(Instant, bool)>,
    /// Current cooldown; doubles per failed probe, bounded.
    cooldown: Duration,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    consecutive_unreachable: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                cooldown,
                opened_at: None,
                probe_in_flight: false,
                consecutive_unreachable: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to make one guarded call. `None` means rejected: the caller
    /// must not touch the index and should fall back immediately.
    pub fn try_acquire(&self) -> Option<Call<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(self.call(false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= inner.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    info!("Circuit cooldown elapsed - admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Some(self.call(true))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                // One probe at a time.
                if inner.probe_in_flight {
                    None
                } else {
                    inner.probe_in_flight = true;
                    Some(self.call(true))
                }
            }
        }
    }

    pub fn record_success(&self, mut call: Call<'_>) {
        call.recorded = true;
        let probe = call.probe;
        drop(call);

        let mut inner = self.lock();
        inner.consecutive_unreachable = 0;
        if probe {
            info!("Probe succeeded - closing circuit");
            Self::close(&mut inner, self.config.cooldown);
        } else {
            Self::push_outcome(&mut inner, self.config.window, true);
        }
    }

    pub fn record_failure(&self, mut call: Call<'_>) {
        call.recorded = true;
        let probe = call.probe;
        drop(call);

        let mut inner = self.lock();
        if probe {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
            warn!(
                cooldown_secs = inner.cooldown.as_secs(),
                "Probe failed - circuit stays open"
            );
        } else {
            Self::push_outcome(&mut inner, self.config.window, false);
            self.maybe_trip(&mut inner);
        }
    }

    /// A permit was dropped without a verdict. That proves nothing
    /// about the index, so no outcome is counted - but an abandoned
    /// probe must release `HalfOpen`, otherwise no later call could
    /// ever probe again and the circuit would never close.
    fn abandon(&self, probe: bool) {
        if !probe {
            return;
        }
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            debug!("Probe abandoned - reopening circuit");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        }
    }

    fn call(&self, probe: bool) -> Call<'_> {
        Call {
            breaker: self,
            probe,
            recorded: false,
        }
    }

    /// Feed a background health probe result into the breaker.
    ///
    /// Repeated unreachable probes open the circuit even when no
    /// request traffic is exercising the index.
    pub fn record_health(&self, health: IndexHealth) {
        let mut inner = self.lock();
        match health {
            IndexHealth::Healthy | IndexHealth::Degraded => {
                inner.consecutive_unreachable = 0;
            }
            IndexHealth::Unreachable => {
                inner.consecutive_unreachable += 1;
                debug!(
                    count = inner.consecutive_unreachable,
                    "Index unreachable in health probe"
                );
                if inner.consecutive_unreachable >= self.config.unreachable_trips
                    && inner.state == CircuitState::Closed
                {
                    warn!(
                        trips = self.config.unreachable_trips,
                        "Consecutive unreachable probes - opening circuit"
                    );
                    Self::trip(&mut inner, self.config.cooldown);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning cannot leave Inner inconsistent; every
        // critical section completes without panicking code paths.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_outcome(inner: &mut Inner, window: Duration, succeeded: bool) {
        let now = Instant::now();
        inner.outcomes.push_back((now, succeeded));
        while let Some(&(at, _)) = inner.outcomes.front() {
            if now.duration_since(at) > window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn maybe_trip(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Closed || inner.outcomes.len() < self.config.min_calls {
            return;
        }
        let failures = inner.outcomes.iter().filter(|(_, ok)| !ok).count();
        let rate = failures as f32 / inner.outcomes.len() as f32;
        if rate >= self.config.failure_rate {
            warn!(
                failures,
                calls = inner.outcomes.len(),
                "Failure rate exceeded - opening circuit"
            );
            Self::trip(inner, self.config.cooldown);
        }
    }

    fn trip(inner: &mut Inner, cooldown: Duration) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.cooldown = cooldown;
        inner.outcomes.clear();
        inner.probe_in_flight = false;
    }

    fn close(inner: &mut Inner, cooldown: Duration) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.cooldown = cooldown;
        inner.outcomes.clear();
        inner.probe_in_flight = false;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
