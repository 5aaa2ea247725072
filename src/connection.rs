//! # Connection State
//!
//! The lifecycle states of the client session plus the two timers that drive it outside of
//! packet handling: reconnect backoff and keep-alive.

use core::fmt;

use embassy_time::{Duration, Instant};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::options::ConnectOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    /// No session and none being established.
    Disconnected,
    /// Transport opening or CONNECT sent, waiting for CONNACK.
    Connecting,
    Connected,
    /// DISCONNECT sent, transport about to close.
    Disconnecting,
    /// Waiting out the backoff delay before the next automatic attempt.
    Reconnecting,
    /// Shut down for good.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        })
    }
}

/// Exponential reconnect backoff with equal jitter.
///
/// Attempt `n` (from 0) waits `min(base * 2^n, max)`, half of it fixed and half drawn
/// uniformly at random, so retries of many clients spread out without ever collapsing to 0.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
    rng: SmallRng,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: Option<u32>, seed: u64) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn from_options(options: &ConnectOptions) -> Self {
        Self::new(
            options.reconnect_base,
            options.reconnect_max,
            options.max_reconnect_attempts,
            options.jitter_seed ^ fnv1a(options.client_id.as_bytes()),
        )
    }

    /// Attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        let ceiling = self
            .base
            .as_millis()
            .saturating_mul(1 << self.attempt.min(16))
            .min(self.max.as_millis());
        let fixed = ceiling / 2;
        let jitter = self.rng.gen_range(0..=ceiling - fixed);
        self.attempt += 1;
        Some(Duration::from_millis(fixed + jitter))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ *byte as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepAliveAction {
    Idle,
    SendPing,
    TimedOut,
}

/// PINGREQ scheduling for one connection. A zero interval disables it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeepAlive {
    interval: Duration,
    grace: Duration,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, grace: Duration) -> Self {
        Self {
            interval,
            grace,
            ping_sent_at: None,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::from_ticks(0), Duration::from_ticks(0))
    }

    fn enabled(&self) -> bool {
        self.interval.as_ticks() > 0
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    /// What to do at `now` given the time of the last frame written.
    pub fn poll(&self, last_write: Instant, now: Instant) -> KeepAliveAction {
        if !self.enabled() {
            return KeepAliveAction::Idle;
        }
        match self.ping_sent_at {
            Some(sent) if now >= sent + self.grace => KeepAliveAction::TimedOut,
            Some(_) => KeepAliveAction::Idle,
            None if now >= last_write + self.interval => KeepAliveAction::SendPing,
            None => KeepAliveAction::Idle,
        }
    }

    pub fn deadline(&self, last_write: Instant) -> Option<Instant> {
        if !self.enabled() {
            return None;
        }
        Some(match self.ping_sent_at {
            Some(sent) => sent + self.grace,
            None => last_write + self.interval,
        })
    }

    pub fn ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
    }

    pub fn pong_received(&mut self) {
        self.ping_sent_at = None;
    }
}
