// SPDX-License-Identifier: MIT
//! Focus-loss violation gate.
//!
//! # State machine
//!
//! ```text
//! Clean ──focus lost──► Violating ──returned in time──► Clean
//!                           │
//!                   grace deadline passes
//!                           ▼
//!                       Penalized ──rearm() (quota remains)──► Clean
//! ```
//!
//! The host environment detects focus loss and reports it as an edge
//! trigger; this gate only reacts. A bypassed subject never enters
//! `Violating` — the event is ignored entirely. Grace expiry is observed by
//! `poll()` from the session tick, which yields the expiry exactly once;
//! the penalty itself (the quota deduction) is applied by the session layer.

use chrono::{DateTime, Duration, Utc};

use crate::notify::ViolationOverlay;

/// What kind of focus loss the host reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    TabSwitch,
    FullscreenExit,
    WindowBlur,
}

impl ViolationKind {
    /// Overlay message shown while the grace countdown runs.
    pub fn message(self, grace_secs: i64) -> String {
        match self {
            Self::TabSwitch => format!(
                "Return to the exam tab within {grace_secs} seconds or a life will be deducted."
            ),
            Self::FullscreenExit => format!(
                "Return to fullscreen within {grace_secs} seconds or a life will be deducted."
            ),
            Self::WindowBlur => "Keep the exam window focused.".to_string(),
        }
    }
}

/// Observable state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No violation in progress.
    Clean,
    /// A violation is open and the grace countdown is running.
    Violating,
    /// The grace period expired; a penalty was escalated.
    Penalized,
}

impl GateState {
    fn name(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Violating => "violating",
            Self::Penalized => "penalized",
        }
    }
}

impl std::fmt::Display for GateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from gate transitions. Programmer errors — fail fast.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid transition: {op}() while {state}")]
    InvalidTransition { op: &'static str, state: &'static str },
}

/// Externally observable gate transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateSignal {
    /// A violation opened; the overlay payload carries the grace deadline.
    Opened(ViolationOverlay),
    /// The subject returned before the deadline. No side effect.
    Cleared,
    /// The deadline passed without a return. Yielded exactly once per
    /// violation; the caller applies the quota deduction.
    GraceExpired,
}

/// Grace-period gate wrapped around one monitored session.
#[derive(Debug, Clone)]
pub struct ViolationGate {
    state: GateState,
    grace_period: Duration,
    grace_deadline: Option<DateTime<Utc>>,
    kind: Option<ViolationKind>,
    bypassed: bool,
}

impl ViolationGate {
    pub fn new(grace_period: Duration, bypassed: bool) -> Self {
        Self {
            state: GateState::Clean,
            grace_period,
            grace_deadline: None,
            kind: None,
            bypassed,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn grace_deadline(&self) -> Option<DateTime<Utc>> {
        self.grace_deadline
    }

    /// Grace time left, recomputed from the deadline — never stored.
    pub fn grace_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.grace_deadline
            .map(|deadline| (deadline - now).max(Duration::zero()))
    }

    /// Current overlay payload for the host surface.
    pub fn overlay(&self) -> ViolationOverlay {
        match (self.state, self.kind) {
            (GateState::Violating, Some(kind)) => ViolationOverlay {
                is_open: true,
                message: kind.message(self.grace_period.num_seconds()),
                grace_deadline: self.grace_deadline,
            },
            _ => ViolationOverlay::closed(),
        }
    }

    /// React to a focus-loss edge from the host.
    ///
    /// Ignored entirely for bypassed subjects, and while a violation is
    /// already open or penalized.
    pub fn on_focus_lost(&mut self, kind: ViolationKind, now: DateTime<Utc>) -> Option<GateSignal> {
        if self.bypassed || self.state != GateState::Clean {
            return None;
        }
        self.state = GateState::Violating;
        self.grace_deadline = Some(now + self.grace_period);
        self.kind = Some(kind);
        Some(GateSignal::Opened(self.overlay()))
    }

    /// Subject-initiated return. Clears the violation if the deadline has
    /// not passed; a late return is ignored (the pending `poll` escalates).
    pub fn on_return(&mut self, now: DateTime<Utc>) -> Option<GateSignal> {
        if self.state != GateState::Violating {
            return None;
        }
        match self.grace_deadline {
            Some(deadline) if now < deadline => {
                self.state = GateState::Clean;
                self.grace_deadline = None;
                self.kind = None;
                Some(GateSignal::Cleared)
            }
            _ => None,
        }
    }

    /// Observe the clock. Yields [`GateSignal::GraceExpired`] exactly once
    /// when the deadline has passed without a return.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<GateSignal> {
        match (self.state, self.grace_deadline) {
            (GateState::Violating, Some(deadline)) if now >= deadline => {
                self.state = GateState::Penalized;
                self.grace_deadline = None;
                self.kind = None;
                Some(GateSignal::GraceExpired)
            }
            _ => None,
        }
    }

    /// Cancel an open violation without penalty — the session is being
    /// paused, submitted, abandoned, or destroyed, so the pending grace
    /// countdown must not outlive it. Returns `true` if a violation was open.
    pub fn cancel(&mut self) -> bool {
        if self.state == GateState::Violating {
            self.state = GateState::Clean;
            self.grace_deadline = None;
            self.kind = None;
            true
        } else {
            false
        }
    }

    /// Explicitly return a penalized gate to `Clean` so monitoring resumes —
    /// used by the session after applying a deduction when quota remains.
    pub fn rearm(&mut self) -> Result<(), GateError> {
        if self.state != GateState::Penalized {
            return Err(GateError::InvalidTransition {
                op: "rearm",
                state: self.state.name(),
            });
        }
        self.state = GateState::Clean;
        Ok(())
    }
}
