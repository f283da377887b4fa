// SPDX-License-Identifier: MIT
//! Exam countdown state machine.
//!
//! # State machine
//!
//! ```text
//! Idle ──start()──► Running ──(elapsed ≥ total)──► Expired
//!                     │  ▲
//!              pause()│  │resume()
//!                     ▼  │
//!                    Paused
//!
//! Running/Paused ──submit() (unlock gate)──► Submitted
//! Idle/Running/Paused ──abandon()──► Abandoned
//! ```
//!
//! Elapsed time accrues one second per `tick()` while `Running` — never
//! while `Paused`. `resume()` re-derives the accrual origin from the elapsed
//! total so paused wall-time cannot leak into the count. The submit gate is
//! a derived predicate, recomputed from `elapsed_secs` on every call, so it
//! can never go stale against the counter.

use chrono::{DateTime, Duration, Utc};

/// Observable state of a session timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Created, not yet started.
    Idle,
    /// Accruing elapsed time.
    Running,
    /// Accrual suspended; wall-clock time does not count.
    Paused,
    /// Total duration reached. Terminal.
    Expired,
    /// Submitted through the unlock gate. Terminal.
    Submitted,
    /// Abandoned by the subject or the host. Terminal.
    Abandoned,
}

impl TimerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Submitted | Self::Abandoned)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Expired => "expired",
            Self::Submitted => "submitted",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for TimerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from timer transitions. Programmer errors — fail fast, never
/// silently corrected.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("invalid transition: {op}() while {state}")]
    InvalidTransition { op: &'static str, state: &'static str },
    #[error("submit locked: {unlock_in_secs}s until the unlock threshold")]
    SubmitLocked { unlock_in_secs: u32 },
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Advanced,
    /// The total duration was reached on this tick. Yielded exactly once.
    Expired,
}

/// Countdown state machine for one timed session.
#[derive(Debug, Clone)]
pub struct SessionTimer {
    total_secs: u32,
    elapsed_secs: u32,
    unlock_fraction: f64,
    state: TimerState,
    /// Accrual origin — `now - elapsed` whenever the timer is running.
    started_at: Option<DateTime<Utc>>,
}

impl SessionTimer {
    /// Create an idle timer. `total_secs` is frozen here — there is no
    /// setter, so the unlock threshold can never move after `start()`.
    pub fn new(total_secs: u32, unlock_fraction: f64) -> Self {
        Self {
            total_secs,
            elapsed_secs: 0,
            unlock_fraction,
            state: TimerState::Idle,
            started_at: None,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn total_secs(&self) -> u32 {
        self.total_secs
    }

    pub fn elapsed_secs(&self) -> u32 {
        self.elapsed_secs
    }

    /// Remaining seconds, floored at 0.
    pub fn remaining_secs(&self) -> u32 {
        self.total_secs.saturating_sub(self.elapsed_secs)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Derived submit gate — true once the configured fraction of the total
    /// duration has elapsed.
    pub fn submit_unlocked(&self) -> bool {
        self.elapsed_secs as f64 >= self.total_secs as f64 * self.unlock_fraction
    }

    /// First elapsed second at which the submit gate opens.
    pub fn unlock_threshold_secs(&self) -> u32 {
        (self.total_secs as f64 * self.unlock_fraction).ceil() as u32
    }

    /// Seconds until the submit gate opens (0 once open).
    pub fn time_until_submit_unlock(&self) -> u32 {
        self.unlock_threshold_secs().saturating_sub(self.elapsed_secs)
    }

    /// Begin accrual. Valid only from `Idle`.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TimerError> {
        if self.state != TimerState::Idle {
            return Err(self.invalid("start"));
        }
        self.started_at = Some(now);
        self.state = TimerState::Running;
        Ok(())
    }

    /// Advance one second. Valid only while `Running`.
    ///
    /// Returns [`Tick::Expired`] on the tick that reaches the total; the
    /// timer is terminal afterwards, so the expiry outcome cannot repeat.
    pub fn tick(&mut self) -> Result<Tick, TimerError> {
        if self.state != TimerState::Running {
            return Err(self.invalid("tick"));
        }
        self.elapsed_secs = (self.elapsed_secs + 1).min(self.total_secs);
        if self.elapsed_secs >= self.total_secs {
            self.state = TimerState::Expired;
            return Ok(Tick::Expired);
        }
        Ok(Tick::Advanced)
    }

    /// Suspend accrual. Idempotent when already paused.
    pub fn pause(&mut self) -> Result<(), TimerError> {
        match self.state {
            TimerState::Running => {
                self.state = TimerState::Paused;
                Ok(())
            }
            TimerState::Paused => Ok(()),
            _ => Err(self.invalid("pause")),
        }
    }

    /// Resume accrual. Valid only from `Paused`.
    ///
    /// The accrual origin becomes `now - elapsed`, so subsequent ticks
    /// continue from the correct elapsed value — total accrued time equals
    /// wall-clock time spent running, never time spent paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TimerError> {
        if self.state != TimerState::Paused {
            return Err(self.invalid("resume"));
        }
        self.started_at = Some(now - Duration::seconds(self.elapsed_secs as i64));
        self.state = TimerState::Running;
        Ok(())
    }

    /// Submit through the unlock gate. Valid from `Running` or `Paused`
    /// once the gate is open.
    pub fn submit(&mut self) -> Result<(), TimerError> {
        if !matches!(self.state, TimerState::Running | TimerState::Paused) {
            return Err(self.invalid("submit"));
        }
        if !self.submit_unlocked() {
            return Err(TimerError::SubmitLocked {
                unlock_in_secs: self.time_until_submit_unlock(),
            });
        }
        self.state = TimerState::Submitted;
        Ok(())
    }

    /// Abandon the session. Valid from any non-terminal state.
    pub fn abandon(&mut self) -> Result<(), TimerError> {
        if self.state.is_terminal() {
            return Err(self.invalid("abandon"));
        }
        self.state = TimerState::Abandoned;
        Ok(())
    }

    fn invalid(&self, op: &'static str) -> TimerError {
        TimerError::InvalidTransition {
            op,
            state: self.state.name(),
        }
    }
}

// ── Display formatting ───────────────────────────────────────────────────────

/// Zero-padded `HH:MM:SS`. Floor semantics throughout.
pub fn format_hms(total_secs: u32) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Whole seconds for a millisecond countdown, rounded **up** so the display
/// never reads 0 while time is still remaining.
pub fn countdown_secs(remaining_ms: i64) -> i64 {
    if remaining_ms <= 0 {
        return 0;
    }
    (remaining_ms + 999) / 1000
}
