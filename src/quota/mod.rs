//! Lives quota — a bounded counter whose deductions individually expire.
//!
//! Each deduction is timestamped; once a deduction's age reaches the restore
//! window the unit is returned to the counter. Restoration is evaluated
//! lazily on read — there is no background clock.

pub mod cache;
pub mod engine;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-owner quota state.
///
/// Invariant: `count + deducted_at.len() == max_quota` for the policy that
/// produced the record. One timestamp per outstanding deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    /// Units currently available.
    pub count: u8,
    /// One instant per deduction that has not yet expired.
    pub deducted_at: Vec<DateTime<Utc>>,
    /// Subject identity. `None` for anonymous/local-only subjects.
    pub owner: Option<String>,
}

impl QuotaRecord {
    /// Returns `true` if the record satisfies the count/timestamp invariant
    /// for the given quota ceiling.
    pub fn is_consistent(&self, max_quota: u8) -> bool {
        self.count as usize + self.deducted_at.len() == max_quota as usize
    }
}

/// Errors surfaced by quota operations.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// A deduction was attempted with no units remaining. The record is
    /// returned unchanged; callers signal exhaustion upward instead of
    /// throwing past the boundary.
    #[error("quota exhausted for {owner}: no units remaining")]
    Exhausted { owner: String },
}
