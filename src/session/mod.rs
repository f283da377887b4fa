//! Exam session instances.
//!
//! An [`ExamSession`] owns one [`SessionTimer`], one [`ViolationGate`], and a
//! handle to the subject's [`QuotaCache`]. Each session drives its own 1 s
//! tick task — there is no process-wide timer, so sessions (and tests) never
//! interfere with each other. The tick loop never awaits a store round trip:
//! quota persistence is fire-and-forget inside the cache.
//!
//! Ordering: all timer and gate transitions for one session serialize behind
//! the session lock. Across sessions for the same subject no ordering is
//! promised; the cache's timestamp-identity merge makes divergence
//! self-healing.

pub mod gate;
pub mod timer;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExamConfig;
use crate::notify::ViolationOverlay;
use crate::policy::BypassList;
use crate::quota::cache::QuotaCache;
use crate::quota::QuotaError;
use gate::{GateSignal, GateState, ViolationGate, ViolationKind};
use timer::{SessionTimer, Tick, TimerError, TimerState};

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Quota(#[from] QuotaError),
    /// The session was destroyed; no further operations are valid.
    #[error("session destroyed")]
    Destroyed,
}

/// What a grace expiry cost the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyOutcome {
    /// Units remaining after the deduction.
    pub remaining: u8,
    /// The quota hit zero — downstream eligibility changes (new session
    /// starts are blocked). Distinct from an ordinary deduction.
    pub exhausted: bool,
}

/// Host callbacks. All methods have empty defaults — implement what the
/// surface needs. Called outside the session lock, never after `destroy()`.
pub trait SessionHooks: Send + Sync {
    /// A violation opened; render the overlay and its grace countdown.
    fn on_violation_opened(&self, _overlay: ViolationOverlay) {}
    /// The subject returned in time (or the violation was cancelled).
    fn on_violation_cleared(&self) {}
    /// The grace period expired and a deduction was applied.
    fn on_grace_expired(&self, _outcome: PenaltyOutcome) {}
    /// The session reached its total duration. Fired exactly once.
    fn on_time_up(&self) {}
}

/// Hook implementation that ignores everything.
pub struct NoHooks;
impl SessionHooks for NoHooks {}

// ── Session ──────────────────────────────────────────────────────────────────

struct SessionInner {
    timer: SessionTimer,
    gate: ViolationGate,
    destroyed: bool,
}

/// Point-in-time view of a session for host rendering.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub timer_state: TimerState,
    pub gate_state: GateState,
    pub elapsed_secs: u32,
    pub remaining_secs: u32,
    pub remaining_display: String,
    pub submit_unlocked: bool,
    pub bypassed: bool,
    pub overlay: ViolationOverlay,
}

/// One timed, monitored exam session.
///
/// Construct with [`ExamSession::new`] — the bypass decision and the frozen
/// total duration are both resolved there, before `start()`, so the unlock
/// threshold can never shift mid-session.
pub struct ExamSession {
    id: Uuid,
    identity: Option<String>,
    bypassed: bool,
    quota: Arc<QuotaCache>,
    hooks: Arc<dyn SessionHooks>,
    tick_interval: std::time::Duration,
    inner: Mutex<SessionInner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ExamSession {
    pub fn new(
        identity: Option<String>,
        exam: &ExamConfig,
        bypass: &BypassList,
        quota: Arc<QuotaCache>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let bypassed = bypass.is_bypassed(identity.as_deref());
        let total_secs = exam.resolved_duration_secs(bypassed);
        let timer = SessionTimer::new(total_secs, exam.unlock_fraction);
        let gate = ViolationGate::new(exam.grace_period(), bypassed);
        let id = Uuid::new_v4();
        debug!(session = %id, bypassed, total_secs, "exam session created");
        Self {
            id,
            identity,
            bypassed,
            quota,
            hooks,
            tick_interval: std::time::Duration::from_millis(exam.tick_interval_ms),
            inner: Mutex::new(SessionInner {
                timer,
                gate,
                destroyed: false,
            }),
            ticker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn bypassed(&self) -> bool {
        self.bypassed
    }

    /// Start the session and its tick task.
    ///
    /// Entry is gated: a non-bypassed subject with an exhausted quota cannot
    /// start a new session.
    pub async fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        if !self.bypassed {
            let eval = self.quota.read(Utc::now()).await;
            if eval.record.count == 0 {
                return Err(QuotaError::Exhausted {
                    owner: self.quota.owner().to_string(),
                }
                .into());
            }
        }

        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(SessionError::Destroyed);
            }
            inner.timer.start(Utc::now())?;
        }
        info!(session = %self.id, "exam session started");
        self.spawn_ticker().await;
        Ok(())
    }

    /// Suspend accrual and cancel the tick task and any pending grace
    /// countdown. Idempotent when already paused.
    pub async fn pause(&self) -> Result<(), SessionError> {
        let cleared = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(SessionError::Destroyed);
            }
            inner.timer.pause()?;
            inner.gate.cancel()
        };
        self.abort_ticker().await;
        if cleared {
            self.hooks.on_violation_cleared();
        }
        debug!(session = %self.id, "exam session paused");
        Ok(())
    }

    /// Resume accrual and restart the tick task.
    pub async fn resume(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(SessionError::Destroyed);
            }
            inner.timer.resume(Utc::now())?;
        }
        self.spawn_ticker().await;
        debug!(session = %self.id, "exam session resumed");
        Ok(())
    }

    /// Submit through the unlock gate and stop the session.
    pub async fn submit(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(SessionError::Destroyed);
            }
            inner.timer.submit()?;
            inner.gate.cancel();
        }
        self.abort_ticker().await;
        info!(session = %self.id, "exam session submitted");
        Ok(())
    }

    /// Abandon the session.
    pub async fn abandon(&self) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(SessionError::Destroyed);
            }
            inner.timer.abandon()?;
            inner.gate.cancel();
        }
        self.abort_ticker().await;
        info!(session = %self.id, "exam session abandoned");
        Ok(())
    }

    /// Tear the session down. The tick task is aborted and no callback
    /// fires afterwards. Idempotent.
    pub async fn destroy(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.destroyed = true;
            inner.gate.cancel();
        }
        self.abort_ticker().await;
        debug!(session = %self.id, "exam session destroyed");
    }

    /// Host-reported focus loss (edge trigger). Ignored for bypassed
    /// subjects and outside `Running`.
    pub async fn focus_lost(&self, kind: ViolationKind) {
        let opened = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed || inner.timer.state() != TimerState::Running {
                None
            } else {
                inner.gate.on_focus_lost(kind, Utc::now())
            }
        };
        if let Some(GateSignal::Opened(overlay)) = opened {
            warn!(session = %self.id, kind = ?kind, "violation opened");
            self.hooks.on_violation_opened(overlay);
        }
    }

    /// Subject-initiated return (the overlay's designated input).
    pub async fn return_to_exam(&self) {
        let cleared = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return;
            }
            inner.gate.on_return(Utc::now())
        };
        if cleared == Some(GateSignal::Cleared) {
            info!(session = %self.id, "subject returned within grace period");
            self.hooks.on_violation_cleared();
        }
    }

    /// Point-in-time view for host rendering.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        SessionSnapshot {
            id: self.id,
            timer_state: inner.timer.state(),
            gate_state: inner.gate.state(),
            elapsed_secs: inner.timer.elapsed_secs(),
            remaining_secs: inner.timer.remaining_secs(),
            remaining_display: timer::format_hms(inner.timer.remaining_secs()),
            submit_unlocked: inner.timer.submit_unlocked(),
            bypassed: self.bypassed,
            overlay: inner.gate.overlay(),
        }
    }

    // ── Tick task ────────────────────────────────────────────────────────────

    async fn spawn_ticker(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().await;
        if let Some(handle) = ticker.take() {
            handle.abort();
        }
        let session = Arc::clone(self);
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(session.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick completes immediately; skip it so the
            // first elapsed second lands one interval after start.
            interval.tick().await;
            loop {
                interval.tick().await;
                if !session.tick_once().await {
                    break;
                }
            }
        }));
    }

    async fn abort_ticker(&self) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// One tick: advance the timer, observe the grace deadline. Returns
    /// `false` when the loop should stop.
    ///
    /// Exposed to integration tests so tick handling can be driven
    /// deterministically without waiting on the interval.
    pub async fn tick_once(self: &Arc<Self>) -> bool {
        enum Outcome {
            TimeUp,
            GraceExpired,
            Nothing,
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return false;
            }
            if inner.timer.state() != TimerState::Running {
                return false;
            }
            match inner.timer.tick() {
                Ok(Tick::Expired) => Outcome::TimeUp,
                Ok(Tick::Advanced) => match inner.gate.poll(Utc::now()) {
                    Some(GateSignal::GraceExpired) => Outcome::GraceExpired,
                    _ => Outcome::Nothing,
                },
                Err(e) => {
                    // Racing teardown — the timer left Running between the
                    // state check and the tick. Stop the loop.
                    warn!(session = %self.id, err = %e, "tick after transition — stopping");
                    return false;
                }
            }
        };

        match outcome {
            Outcome::TimeUp => {
                info!(session = %self.id, "exam time up");
                self.hooks.on_time_up();
                false
            }
            Outcome::GraceExpired => {
                let outcome = self.apply_penalty().await;
                self.hooks.on_grace_expired(outcome);
                !outcome.exhausted
            }
            Outcome::Nothing => true,
        }
    }

    /// Deduct one unit after a grace expiry. On exhaustion the session ends;
    /// otherwise the gate re-arms and monitoring continues.
    async fn apply_penalty(&self) -> PenaltyOutcome {
        let outcome = match self.quota.deduct(Utc::now()).await {
            Ok(eval) => PenaltyOutcome {
                remaining: eval.record.count,
                exhausted: eval.record.count == 0,
            },
            // Already at zero — concurrent deduction from another instance.
            Err(QuotaError::Exhausted { .. }) => PenaltyOutcome {
                remaining: 0,
                exhausted: true,
            },
        };

        let mut inner = self.inner.lock().await;
        if outcome.exhausted {
            warn!(session = %self.id, "quota exhausted — ending session");
            // Best-effort: the timer may already be terminal.
            let _ = inner.timer.abandon();
        } else if inner.gate.rearm().is_err() {
            debug!(session = %self.id, "gate not penalized — skip rearm");
        }
        outcome
    }
}
