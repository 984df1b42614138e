// ── Reconnection controller ──
//
// Tracks where the session is in its recovery cycle and how long to wait
// before the next attempt. The session actor drives the transitions; this
// type only keeps the bookkeeping honest.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Exponential backoff configuration for upstream reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,

    /// How many times a single category is re-subscribed after a
    /// reconnect before it is marked degraded. Default: 3.
    pub resubscribe_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
            resubscribe_attempts: 3,
        }
    }
}

/// Where the session is in its recovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ReconnectPhase {
    /// Connected and settled, or never lost.
    Idle,
    /// Waiting out the backoff delay before `attempt`.
    BackingOff { attempt: u32 },
    /// Handshake in flight for `attempt`.
    Connecting { attempt: u32 },
    /// Socket is back; re-arming subscriptions.
    Resubscribing,
    /// Retries exhausted or credentials rejected. Terminal.
    GivenUp,
}

impl fmt::Display for ReconnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::BackingOff { attempt } => write!(f, "backing off (attempt {attempt})"),
            Self::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            Self::Resubscribing => f.write_str("resubscribing"),
            Self::GivenUp => f.write_str("given up"),
        }
    }
}

/// Recovery state machine for one session.
#[derive(Debug)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    phase: ReconnectPhase,
    attempt: u32,
    seed: f64,
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy) -> Self {
        // Per-session offset so many bridges restarted together do not
        // retry in lockstep.
        let seed = f64::from(uuid::Uuid::new_v4().as_bytes()[0]);
        Self {
            policy,
            phase: ReconnectPhase::Idle,
            attempt: 0,
            seed,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    /// Attempts made since the connection was last settled.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start the next attempt and return how long to wait before it, or
    /// `None` once `max_retries` attempts have been spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = calculate_backoff(self.attempt, &self.policy, self.seed);
        self.attempt += 1;
        self.phase = ReconnectPhase::BackingOff {
            attempt: self.attempt,
        };
        Some(delay)
    }

    pub fn connecting(&mut self) {
        self.phase = ReconnectPhase::Connecting {
            attempt: self.attempt,
        };
    }

    pub fn resubscribing(&mut self) {
        self.phase = ReconnectPhase::Resubscribing;
    }

    /// Every subscription is re-armed; the next loss starts from scratch.
    pub fn settled(&mut self) {
        if self.attempt > 0 {
            tracing::info!(attempts = self.attempt, "upstream recovered");
        }
        self.phase = ReconnectPhase::Idle;
        self.attempt = 0;
    }

    pub fn give_up(&mut self) {
        self.phase = ReconnectPhase::GivenUp;
    }

    pub fn is_given_up(&self) -> bool {
        self.phase == ReconnectPhase::GivenUp
    }
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 ± 0.25)`, clamped to `max`.
///
/// The jitter is deterministic in `attempt` and `seed`; it only has to
/// spread reconnection storms, not be unpredictable.
pub fn calculate_backoff(attempt: u32, policy: &ReconnectPolicy, seed: f64) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = policy.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let max = policy.max_delay.as_secs_f64();
    let capped = base.min(max);

    let jitter_factor = 1.0 + 0.25 * ((f64::from(attempt) * 7.3 + seed).sin());
    let with_jitter = (capped * jitter_factor).clamp(0.0, max);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
