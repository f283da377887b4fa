//! Pure quota computation.
//!
//! `QuotaEngine` derives the effective record for a given instant: which
//! deductions have expired, how many units come back, and when the next
//! restoration lands. All operations are deterministic in `(record, now)` —
//! no wall-clock capture, no hidden state — so both the local cache and the
//! remote sync path compute identical results.

use chrono::{DateTime, Duration, Utc};

use super::{QuotaError, QuotaRecord};

// ── Policy ───────────────────────────────────────────────────────────────────

/// Tunable quota policy. Defaults: 3 units, 24 h restore window.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    /// Quota ceiling per subject.
    pub max_quota: u8,
    /// Age at which a deduction expires and its unit is restored.
    pub restore_window: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_quota: 3,
            restore_window: Duration::hours(24),
        }
    }
}

/// Result of evaluating a record at an instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// The record with expired deductions restored.
    pub record: QuotaRecord,
    /// When the next unit comes back. `None` when the quota is full.
    pub next_restore_at: Option<DateTime<Utc>>,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Pure quota arithmetic over [`QuotaRecord`] values.
#[derive(Debug, Clone, Default)]
pub struct QuotaEngine {
    policy: QuotaPolicy,
}

impl QuotaEngine {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    /// A full record for a subject observed for the first time.
    pub fn fresh_record(&self, owner: Option<String>) -> QuotaRecord {
        QuotaRecord {
            count: self.policy.max_quota,
            deducted_at: Vec::new(),
            owner,
        }
    }

    /// Restore expired deductions and compute the next restoration instant.
    ///
    /// Idempotent: evaluating an already-evaluated record at the same
    /// instant is a no-op.
    pub fn evaluate(&self, record: &QuotaRecord, now: DateTime<Utc>) -> Evaluation {
        let (expired, active): (Vec<_>, Vec<_>) = record
            .deducted_at
            .iter()
            .copied()
            .partition(|t| now - *t >= self.policy.restore_window);

        let count = (record.count as usize + expired.len()).min(self.policy.max_quota as usize);
        let effective = QuotaRecord {
            count: count as u8,
            deducted_at: active,
            owner: record.owner.clone(),
        };

        let next_restore_at = if effective.count < self.policy.max_quota {
            effective
                .deducted_at
                .iter()
                .min()
                .map(|oldest| *oldest + self.policy.restore_window)
        } else {
            None
        };

        Evaluation {
            record: effective,
            next_restore_at,
        }
    }

    /// Record one deduction at `now`.
    ///
    /// Errors with [`QuotaError::Exhausted`] when no units remain — the
    /// caller sees the refusal; it is never silently ignored.
    pub fn deduct(&self, record: &QuotaRecord, now: DateTime<Utc>) -> Result<QuotaRecord, QuotaError> {
        if record.count == 0 {
            return Err(QuotaError::Exhausted {
                owner: record.owner.clone().unwrap_or_else(|| "anonymous".into()),
            });
        }
        let mut next = record.clone();
        next.count -= 1;
        next.deducted_at.push(now);
        Ok(next)
    }

    /// Reconcile two divergent views of the same subject's record.
    ///
    /// Deduction events are merged by timestamp identity (not counter
    /// arithmetic), so a deduction recorded twice collapses to one and a
    /// deduction seen by only one writer is never lost. The count is
    /// re-derived from the invariant and the result evaluated at `now`.
    /// Outstanding deductions are capped at `max_quota` — when the union
    /// exceeds the ceiling, the newest timestamps win.
    pub fn merge(&self, a: &QuotaRecord, b: &QuotaRecord, now: DateTime<Utc>) -> Evaluation {
        let mut union: Vec<DateTime<Utc>> = a
            .deducted_at
            .iter()
            .chain(b.deducted_at.iter())
            .copied()
            .collect();
        union.sort_unstable();
        union.dedup_by_key(|t| t.timestamp_millis());

        let max = self.policy.max_quota as usize;
        if union.len() > max {
            union.drain(..union.len() - max);
        }

        let merged = QuotaRecord {
            count: (max - union.len()) as u8,
            deducted_at: union,
            owner: a.owner.clone().or_else(|| b.owner.clone()),
        };
        self.evaluate(&merged, now)
    }
}

// ── Restore-ETA text ─────────────────────────────────────────────────────────

/// Human-readable time-to-restore, tiered like the host UI expects:
/// `"2h 3m"`, `"4m 10s"`, or `"30s"`.
pub fn format_restore_eta(remaining: Duration) -> String {
    let total_secs = remaining.num_seconds().max(0);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_window(minutes: i64) -> QuotaEngine {
        QuotaEngine::new(QuotaPolicy {
            max_quota: 3,
            restore_window: Duration::minutes(minutes),
        })
    }

    #[test]
    fn fresh_record_is_full_and_consistent() {
        let engine = QuotaEngine::default();
        let record = engine.fresh_record(Some("alice".into()));
        assert_eq!(record.count, 3);
        assert!(record.deducted_at.is_empty());
        assert!(record.is_consistent(3));
    }

    #[test]
    fn deduct_appends_timestamp_and_decrements() {
        let engine = QuotaEngine::default();
        let now = Utc::now();
        let record = engine.fresh_record(None);

        let after = engine.deduct(&record, now).unwrap();
        assert_eq!(after.count, 2);
        assert_eq!(after.deducted_at, vec![now]);
        assert!(after.is_consistent(3));
    }

    #[test]
    fn deduct_at_zero_errors_and_leaves_record_unchanged() {
        let engine = engine_with_window(10);
        let now = Utc::now();
        let mut record = engine.fresh_record(Some("bob".into()));
        for _ in 0..3 {
            record = engine.deduct(&record, now).unwrap();
        }
        assert_eq!(record.count, 0);

        let err = engine.deduct(&record, now).unwrap_err();
        assert!(matches!(err, QuotaError::Exhausted { .. }));
        // The caller keeps the unchanged record.
        assert_eq!(record.count, 0);
        assert_eq!(record.deducted_at.len(), 3);
    }

    #[test]
    fn restoration_boundary_is_exact() {
        let engine = engine_with_window(10);
        let t0 = Utc::now();
        let record = engine.deduct(&engine.fresh_record(None), t0).unwrap();

        // One tick before the window: nothing restored.
        let before = engine.evaluate(&record, t0 + Duration::minutes(10) - Duration::seconds(1));
        assert_eq!(before.record.count, 2);

        // At the window: exactly one unit back.
        let at = engine.evaluate(&record, t0 + Duration::minutes(10));
        assert_eq!(at.record.count, 3);
        assert!(at.record.deducted_at.is_empty());
        assert_eq!(at.next_restore_at, None);
    }

    #[test]
    fn evaluate_is_idempotent() {
        let engine = engine_with_window(10);
        let t0 = Utc::now();
        let mut record = engine.fresh_record(None);
        record = engine.deduct(&record, t0).unwrap();
        record = engine.deduct(&record, t0 + Duration::minutes(5)).unwrap();

        let later = t0 + Duration::minutes(12);
        let once = engine.evaluate(&record, later);
        let twice = engine.evaluate(&once.record, later);
        assert_eq!(once.record, twice.record);
        assert_eq!(once.next_restore_at, twice.next_restore_at);
    }

    #[test]
    fn next_restore_tracks_oldest_active_deduction() {
        let engine = engine_with_window(10);
        let t0 = Utc::now();
        let mut record = engine.fresh_record(None);
        record = engine.deduct(&record, t0).unwrap();
        record = engine.deduct(&record, t0 + Duration::minutes(3)).unwrap();

        let eval = engine.evaluate(&record, t0 + Duration::minutes(4));
        assert_eq!(eval.next_restore_at, Some(t0 + Duration::minutes(10)));
    }

    #[test]
    fn merge_unions_by_timestamp_identity() {
        let engine = engine_with_window(10);
        let t0 = Utc::now();
        let base = engine.fresh_record(Some("carol".into()));

        // Two tabs each observed the same first deduction; one recorded a second.
        let tab_a = engine.deduct(&base, t0).unwrap();
        let tab_b = engine
            .deduct(&engine.deduct(&base, t0).unwrap(), t0 + Duration::minutes(1))
            .unwrap();

        let merged = engine.merge(&tab_a, &tab_b, t0 + Duration::minutes(2));
        // The shared deduction collapses to one; two distinct events remain.
        assert_eq!(merged.record.deducted_at.len(), 2);
        assert_eq!(merged.record.count, 1);
        assert!(merged.record.is_consistent(3));
    }

    #[test]
    fn merge_caps_outstanding_deductions_at_ceiling() {
        let engine = engine_with_window(10);
        let t0 = Utc::now();
        let mut a = engine.fresh_record(None);
        let mut b = engine.fresh_record(None);
        for i in 0..3 {
            a = engine.deduct(&a, t0 + Duration::seconds(i)).unwrap();
            b = engine.deduct(&b, t0 + Duration::seconds(10 + i)).unwrap();
        }

        let merged = engine.merge(&a, &b, t0 + Duration::minutes(1));
        assert_eq!(merged.record.count, 0);
        assert_eq!(merged.record.deducted_at.len(), 3);
        // Newest events win the cap.
        assert!(merged
            .record
            .deducted_at
            .iter()
            .all(|t| *t >= t0 + Duration::seconds(10)));
    }

    #[test]
    fn restore_eta_text_tiers() {
        assert_eq!(
            format_restore_eta(Duration::hours(2) + Duration::minutes(3)),
            "2h 3m"
        );
        assert_eq!(
            format_restore_eta(Duration::minutes(4) + Duration::seconds(10)),
            "4m 10s"
        );
        assert_eq!(format_restore_eta(Duration::seconds(30)), "30s");
        assert_eq!(format_restore_eta(Duration::seconds(-5)), "0s");
    }
}
