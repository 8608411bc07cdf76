//! Shared rate gate in front of the enhancement backend.
//!
//! Two triggers put the gate down: a run of consecutive failures, and a
//! burst of attempts (successful or not) inside a short window.  The local
//! backend serves one consumer at a time, so rapid-fire automatic requests
//! are throttled even when they all succeed.

use std::time::Duration;

use mu_proto::config::CooldownConfig;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::EnhanceError;

#[derive(Debug, Clone)]
pub struct Cooldown {
    cfg: CooldownConfig,
    down_until: Option<Instant>,
    consecutive_failures: u32,
    burst_count: u32,
    burst_window_start: Option<Instant>,
    last_attempt: Option<Instant>,
    last_failure: Option<Instant>,
    /// Incremented every time the gate goes down from up.
    episode: u64,
    noticed_episode: u64,
    resume_armed: bool,
}

impl Cooldown {
    pub fn new(cfg: CooldownConfig) -> Self {
        Self {
            cfg,
            down_until: None,
            consecutive_failures: 0,
            burst_count: 0,
            burst_window_start: None,
            last_attempt: None,
            last_failure: None,
            episode: 0,
            noticed_episode: 0,
            resume_armed: false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn down_until(&self) -> Option<Instant> {
        self.down_until
    }

    pub fn is_cooling_down(&self) -> bool {
        self.is_cooling_down_at(Instant::now())
    }

    pub fn is_cooling_down_at(&self, now: Instant) -> bool {
        self.down_until.map_or(false, |t| now < t)
    }

    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.down_until
            .filter(|t| now < *t)
            .map(|t| t.duration_since(now))
    }

    /// Reject the request outright while the gate is down.
    pub fn check_at(&self, now: Instant) -> Result<(), EnhanceError> {
        match self.remaining_at(now) {
            Some(remaining) => Err(EnhanceError::CoolingDown { remaining }),
            None => Ok(()),
        }
    }

    /// Record a failed request.  Returns true when this failure put the
    /// gate down.
    pub fn on_failure_at(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        if self.consecutive_failures >= self.cfg.failure_threshold {
            info!(
                "cooldown: {} consecutive failures, pausing {}s",
                self.consecutive_failures, self.cfg.cooldown_secs
            );
            self.consecutive_failures = 0;
            self.engage(now, Duration::from_secs(self.cfg.cooldown_secs));
            return true;
        }
        false
    }

    /// Record a request attempt, whatever its outcome.  Returns true when the
    /// burst threshold put the gate down.
    pub fn on_attempt_at(&mut self, now: Instant, heavy: bool) -> bool {
        let idle = self.last_attempt.map_or(false, |t| {
            now.duration_since(t) >= Duration::from_secs(self.cfg.burst_idle_reset_secs)
        });
        let window_over = self.burst_window_start.map_or(false, |t| {
            now.duration_since(t) >= Duration::from_secs(self.cfg.burst_window_secs)
        });
        if idle || window_over || self.burst_window_start.is_none() {
            self.burst_count = 0;
            self.burst_window_start = Some(now);
        }
        self.burst_count += 1;
        self.last_attempt = Some(now);

        let threshold = if heavy {
            self.cfg.burst_threshold_heavy
        } else {
            self.cfg.burst_threshold
        };
        if self.burst_count >= threshold {
            info!(
                "cooldown: burst of {} requests, pausing {}s",
                self.burst_count, self.cfg.burst_cooldown_secs
            );
            self.burst_count = 0;
            self.burst_window_start = None;
            self.engage(now, Duration::from_secs(self.cfg.burst_cooldown_secs));
            return true;
        }
        false
    }

    /// A success after enough quiet time clears the failure history and
    /// lifts the gate.
    pub fn on_success_at(&mut self, now: Instant) {
        let quiet = self.last_failure.map_or(true, |t| {
            now.duration_since(t) >= Duration::from_secs(self.cfg.quiet_reset_secs)
        });
        if quiet && !self.is_cooling_down_at(now) {
            if self.consecutive_failures > 0 || self.down_until.is_some() {
                debug!("cooldown: quiet success, resetting");
            }
            self.consecutive_failures = 0;
            self.down_until = None;
            self.last_failure = None;
        }
    }

    fn engage(&mut self, now: Instant, window: Duration) {
        let until = now + window;
        if !self.is_cooling_down_at(now) {
            self.episode += 1;
        }
        // Never move the deadline backwards.
        self.down_until = Some(self.down_until.map_or(until, |t| t.max(until)));
    }

    /// True exactly once per cooldown episode.
    pub fn take_notice_at(&mut self, now: Instant) -> bool {
        if self.is_cooling_down_at(now) && self.noticed_episode != self.episode {
            self.noticed_episode = self.episode;
            return true;
        }
        false
    }

    /// Arm the single deferred retry for this episode.  Returns the delay
    /// until the gate lifts, or `None` when a retry is already pending or
    /// the gate is up.
    pub fn arm_resume_at(&mut self, now: Instant) -> Option<Duration> {
        if self.resume_armed {
            return None;
        }
        let remaining = self.remaining_at(now)?;
        self.resume_armed = true;
        Some(remaining)
    }

    pub fn resume_fired(&mut self) {
        self.resume_armed = false;
    }
}
