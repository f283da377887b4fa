//! Integration tests for exam sessions: timer gating, violations, penalties.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;

use proctord::config::{ExamConfig, ProctorConfig, QuotaConfig};
use proctord::quota::engine::QuotaEngine;
use proctord::quota::store::{MemoryQuotaStore, QuotaStore};
use proctord::quota::QuotaError;
use proctord::session::gate::{GateState, ViolationKind};
use proctord::session::timer::TimerState;
use proctord::session::{PenaltyOutcome, SessionError, SessionHooks};
use proctord::ProctorContext;

// ── Harness ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct CountingHooks {
    opened: AtomicUsize,
    cleared: AtomicUsize,
    time_up: AtomicUsize,
    penalties: std::sync::Mutex<Vec<PenaltyOutcome>>,
}

impl SessionHooks for CountingHooks {
    fn on_violation_opened(&self, _overlay: proctord::notify::ViolationOverlay) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }
    fn on_violation_cleared(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
    fn on_grace_expired(&self, outcome: PenaltyOutcome) {
        self.penalties.lock().unwrap().push(outcome);
    }
    fn on_time_up(&self) {
        self.time_up.fetch_add(1, Ordering::SeqCst);
    }
}

/// Config with a manual tick cadence: the interval is set so far out that
/// tests drive `tick_once` deterministically instead.
fn test_config(exam: ExamConfig) -> ProctorConfig {
    ProctorConfig {
        data_dir: std::path::PathBuf::from("."),
        log: "info".to_string(),
        log_format: "pretty".to_string(),
        slow_query_threshold_ms: 0,
        quota: QuotaConfig {
            max_quota: 3,
            restore_window_secs: 600,
            cache_ttl_ms: 5_000,
        },
        exam,
    }
}

fn manual_exam(duration_secs: u32, grace_period_secs: u64) -> ExamConfig {
    ExamConfig {
        duration_secs,
        grace_period_secs,
        tick_interval_ms: 3_600_000,
        ..Default::default()
    }
}

fn context(exam: ExamConfig) -> ProctorContext {
    let config = test_config(exam);
    let engine = QuotaEngine::new(config.quota.policy());
    let store: Arc<dyn QuotaStore> = Arc::new(MemoryQuotaStore::new(engine));
    ProctorContext::with_store(config, store)
}

/// Seed the store so `owner` has `deductions` outstanding.
async fn seed_deductions(ctx: &ProctorContext, owner: &str, deductions: u8) {
    let engine = ctx.engine();
    let mut record = engine.fresh_record(Some(owner.to_string()));
    let now = Utc::now();
    for _ in 0..deductions {
        record = engine.deduct(&record, now).unwrap();
    }
    ctx.store.save(owner, &record).await.unwrap();
}

// ── Violations and penalties ─────────────────────────────────────────────────

#[tokio::test]
async fn grace_expiry_deducts_exactly_once_and_rearms() {
    let ctx = context(manual_exam(100, 0));
    let quota = ctx.quota_cache("carol");
    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("carol".into()), quota.clone(), hooks.clone());

    session.start().await.unwrap();
    session.focus_lost(ViolationKind::TabSwitch).await;
    assert_eq!(hooks.opened.load(Ordering::SeqCst), 1);

    // The zero-length grace period expires on the next tick.
    assert!(session.tick_once().await, "session continues after penalty");

    let penalties = hooks.penalties.lock().unwrap().clone();
    assert_eq!(
        penalties,
        vec![PenaltyOutcome {
            remaining: 2,
            exhausted: false
        }]
    );

    let eval = quota.read(Utc::now()).await;
    assert_eq!(eval.record.count, 2);
    assert_eq!(eval.record.deducted_at.len(), 1, "exactly one deduction");

    // Gate re-armed — monitoring continues, timer kept running.
    let snap = session.snapshot().await;
    assert_eq!(snap.gate_state, GateState::Clean);
    assert_eq!(snap.timer_state, TimerState::Running);
    session.destroy().await;
}

#[tokio::test]
async fn return_within_grace_clears_without_penalty() {
    let ctx = context(manual_exam(100, 60));
    let quota = ctx.quota_cache("dave");
    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("dave".into()), quota.clone(), hooks.clone());

    session.start().await.unwrap();
    session.focus_lost(ViolationKind::FullscreenExit).await;
    let snap = session.snapshot().await;
    assert_eq!(snap.gate_state, GateState::Violating);
    assert!(snap.overlay.is_open);
    assert!(snap.overlay.grace_deadline.is_some());

    session.return_to_exam().await;
    assert_eq!(hooks.cleared.load(Ordering::SeqCst), 1);

    session.tick_once().await;
    assert!(hooks.penalties.lock().unwrap().is_empty());
    assert_eq!(quota.read(Utc::now()).await.record.count, 3);
    session.destroy().await;
}

#[tokio::test]
async fn exhaustion_mid_session_ends_the_session() {
    let ctx = context(manual_exam(100, 0));
    seed_deductions(&ctx, "erin", 2).await;

    let quota = ctx.quota_cache("erin");
    quota.refresh(Utc::now()).await;

    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("erin".into()), quota.clone(), hooks.clone());
    session.start().await.unwrap();

    session.focus_lost(ViolationKind::TabSwitch).await;
    assert!(!session.tick_once().await, "exhaustion stops the tick loop");

    let penalties = hooks.penalties.lock().unwrap().clone();
    assert_eq!(
        penalties,
        vec![PenaltyOutcome {
            remaining: 0,
            exhausted: true
        }]
    );
    assert_eq!(session.snapshot().await.timer_state, TimerState::Abandoned);
    session.destroy().await;
}

// ── Entry gating and bypass ──────────────────────────────────────────────────

#[tokio::test]
async fn exhausted_subject_cannot_start_a_session() {
    let ctx = context(manual_exam(100, 10));
    seed_deductions(&ctx, "frank", 3).await;

    let quota = ctx.quota_cache("frank");
    quota.refresh(Utc::now()).await;

    let session = ctx.exam_session(Some("frank".into()), quota, Arc::new(CountingHooks::default()));
    let err = session.start().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Quota(QuotaError::Exhausted { .. })
    ));
    assert_eq!(session.snapshot().await.timer_state, TimerState::Idle);
}

#[tokio::test]
async fn bypassed_subject_ignores_violations_and_gets_bypass_duration() {
    let exam = ExamConfig {
        duration_secs: 100,
        bypass_duration_secs: 7_200,
        bypass_identities: vec!["Staff@Example.com".to_string()],
        grace_period_secs: 0,
        tick_interval_ms: 3_600_000,
        ..Default::default()
    };
    let ctx = context(exam);
    // Even an exhausted quota does not block a bypassed identity.
    seed_deductions(&ctx, "staff@example.com", 3).await;

    let quota = ctx.quota_cache("staff@example.com");
    quota.refresh(Utc::now()).await;

    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(
        Some("staff@example.com".into()),
        quota.clone(),
        hooks.clone(),
    );
    assert!(session.bypassed());
    session.start().await.unwrap();

    // Bypass duration substituted at construction, before start().
    assert_eq!(session.snapshot().await.remaining_secs, 7_200);

    session.focus_lost(ViolationKind::TabSwitch).await;
    session.focus_lost(ViolationKind::WindowBlur).await;
    session.tick_once().await;

    assert_eq!(hooks.opened.load(Ordering::SeqCst), 0);
    assert!(hooks.penalties.lock().unwrap().is_empty());
    assert_eq!(session.snapshot().await.gate_state, GateState::Clean);
    session.destroy().await;
}

// ── Timer behavior through the session ───────────────────────────────────────

#[tokio::test]
async fn time_up_fires_exactly_once() {
    let ctx = context(manual_exam(3, 10));
    let quota = ctx.quota_cache("gina");
    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("gina".into()), quota, hooks.clone());

    session.start().await.unwrap();
    assert!(session.tick_once().await);
    assert!(session.tick_once().await);
    assert!(!session.tick_once().await, "third tick expires the session");

    assert_eq!(hooks.time_up.load(Ordering::SeqCst), 1);
    assert_eq!(session.snapshot().await.timer_state, TimerState::Expired);

    // Terminal — later ticks are inert.
    assert!(!session.tick_once().await);
    assert_eq!(hooks.time_up.load(Ordering::SeqCst), 1);
    session.destroy().await;
}

#[tokio::test]
async fn pause_conserves_elapsed_and_cancels_open_violation() {
    let ctx = context(manual_exam(100, 60));
    let quota = ctx.quota_cache("hana");
    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("hana".into()), quota.clone(), hooks.clone());

    session.start().await.unwrap();
    session.tick_once().await;
    session.tick_once().await;

    session.focus_lost(ViolationKind::TabSwitch).await;
    session.pause().await.unwrap();
    // Pausing cancels the pending grace countdown.
    assert_eq!(hooks.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(session.snapshot().await.gate_state, GateState::Clean);

    session.resume().await.unwrap();
    session.tick_once().await;
    session.tick_once().await;
    session.tick_once().await;

    let snap = session.snapshot().await;
    assert_eq!(snap.elapsed_secs, 5, "pause added nothing to elapsed");
    assert!(hooks.penalties.lock().unwrap().is_empty());
    session.destroy().await;
}

#[tokio::test]
async fn submit_respects_the_unlock_gate() {
    let ctx = context(manual_exam(4, 10));
    let quota = ctx.quota_cache("ivan");
    let session = ctx.exam_session(Some("ivan".into()), quota, Arc::new(CountingHooks::default()));

    session.start().await.unwrap();
    assert!(session.submit().await.is_err(), "locked before half time");

    session.tick_once().await;
    session.tick_once().await;
    let snap = session.snapshot().await;
    assert!(snap.submit_unlocked, "unlocked at 2 of 4");
    assert_eq!(snap.remaining_display, "00:00:02");

    session.submit().await.unwrap();
    assert_eq!(session.snapshot().await.timer_state, TimerState::Submitted);
}

#[tokio::test]
async fn destroyed_session_fires_no_callbacks() {
    let ctx = context(manual_exam(100, 0));
    let quota = ctx.quota_cache("judy");
    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("judy".into()), quota.clone(), hooks.clone());

    session.start().await.unwrap();
    session.focus_lost(ViolationKind::TabSwitch).await;
    assert_eq!(hooks.opened.load(Ordering::SeqCst), 1);

    session.destroy().await;

    assert!(!session.tick_once().await);
    session.focus_lost(ViolationKind::TabSwitch).await;
    session.return_to_exam().await;
    assert!(matches!(
        session.pause().await,
        Err(SessionError::Destroyed)
    ));

    assert_eq!(hooks.opened.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.cleared.load(Ordering::SeqCst), 0);
    assert!(hooks.penalties.lock().unwrap().is_empty());
    assert_eq!(quota.read(Utc::now()).await.record.count, 3);
}

#[tokio::test]
async fn background_ticker_drives_the_timer() {
    let exam = ExamConfig {
        duration_secs: 2,
        grace_period_secs: 10,
        tick_interval_ms: 20,
        ..Default::default()
    };
    let ctx = context(exam);
    let quota = ctx.quota_cache("kate");
    let hooks = Arc::new(CountingHooks::default());
    let session = ctx.exam_session(Some("kate".into()), quota, hooks.clone());

    session.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    assert_eq!(hooks.time_up.load(Ordering::SeqCst), 1);
    assert_eq!(session.snapshot().await.timer_state, TimerState::Expired);
    session.destroy().await;
}
