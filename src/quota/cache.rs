// SPDX-License-Identifier: MIT
//! Device-local quota mirror — stale-while-revalidate over the durable store.
//!
//! Reads are served from the cached record whenever it is younger than the
//! TTL; a stale read returns the cached value immediately and kicks off a
//! single-flight background refresh. Deductions apply to the cache first
//! (optimistic) and persist fire-and-forget — a failed save keeps the record
//! dirty and is retried after the next successful refresh. The caller is
//! never blocked on a store round trip.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use super::engine::{format_restore_eta, Evaluation, QuotaEngine};
use super::store::QuotaStore;
use super::{QuotaError, QuotaRecord};
use crate::notify::{Notification, NotificationSink};

/// Toast duration for an ordinary deduction warning.
const DEDUCT_TOAST_MS: u64 = 3_000;
/// Toast duration for the exhaustion error.
const EXHAUSTED_TOAST_MS: u64 = 5_000;

// ── Events ───────────────────────────────────────────────────────────────────

/// What changed in a subject's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaEventKind {
    /// One unit deducted; at least one remains.
    Deducted,
    /// One or more units restored by window expiry.
    Restored,
    /// The last unit was deducted.
    Exhausted,
}

/// Broadcast to subscribers whenever the local record changes.
#[derive(Debug, Clone)]
pub struct QuotaEvent {
    pub owner: String,
    pub kind: QuotaEventKind,
    pub record: QuotaRecord,
    pub next_restore_at: Option<DateTime<Utc>>,
}

// ── Cache ────────────────────────────────────────────────────────────────────

struct CacheInner {
    record: QuotaRecord,
    /// When the record was last reconciled with the store. `None` = never.
    fetched_at: Option<DateTime<Utc>>,
    /// Local changes not yet durably persisted.
    dirty: bool,
    /// A background refresh is already running.
    refresh_inflight: bool,
    /// Bumped on every local mutation; persist tasks use it to detect that
    /// the record moved underneath them.
    version: u64,
}

/// Per-subject local mirror of a [`QuotaStore`] record.
///
/// Cheap to share — hold it in an `Arc` and clone the handle. All methods
/// take `&Arc<Self>` so they can spawn background refresh/persist tasks.
pub struct QuotaCache {
    owner: String,
    engine: QuotaEngine,
    store: Arc<dyn QuotaStore>,
    ttl: Duration,
    notifier: Arc<dyn NotificationSink>,
    events: broadcast::Sender<QuotaEvent>,
    inner: Mutex<CacheInner>,
}

impl QuotaCache {
    pub fn new(
        owner: impl Into<String>,
        engine: QuotaEngine,
        store: Arc<dyn QuotaStore>,
        ttl: Duration,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let owner = owner.into();
        let (events, _) = broadcast::channel(64);
        let record = engine.fresh_record(Some(owner.clone()));
        Self {
            owner,
            engine,
            store,
            ttl,
            notifier,
            events,
            inner: Mutex::new(CacheInner {
                record,
                fetched_at: None,
                dirty: false,
                refresh_inflight: false,
                version: 0,
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn engine(&self) -> &QuotaEngine {
        &self.engine
    }

    /// Subscribe to quota change events. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.events.subscribe()
    }

    /// Read the effective record at `now`.
    ///
    /// Always returns immediately. A stale cache (older than the TTL) is
    /// still returned as-is while a background refresh is spawned
    /// (single-flight). Expired deductions are restored in place.
    pub async fn read(self: &Arc<Self>, now: DateTime<Utc>) -> Evaluation {
        let mut inner = self.inner.lock().await;
        let eval = self.engine.evaluate(&inner.record, now);

        if eval.record != inner.record {
            // Lazy restoration changed the record — keep it and write back.
            inner.record = eval.record.clone();
            inner.dirty = true;
            inner.version += 1;
            let _ = self.events.send(QuotaEvent {
                owner: self.owner.clone(),
                kind: QuotaEventKind::Restored,
                record: eval.record.clone(),
                next_restore_at: eval.next_restore_at,
            });
            self.spawn_persist(inner.version);
        }

        let stale = match inner.fetched_at {
            Some(at) => now - at >= self.ttl,
            None => true,
        };
        if stale && !inner.refresh_inflight {
            inner.refresh_inflight = true;
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                cache.refresh(Utc::now()).await;
            });
        }

        eval
    }

    /// Apply one deduction at `now`, optimistically.
    ///
    /// The cache updates immediately and persistence happens in the
    /// background. Errors with [`QuotaError::Exhausted`] when no units
    /// remain, leaving the record untouched.
    pub async fn deduct(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Evaluation, QuotaError> {
        let mut inner = self.inner.lock().await;

        // Restore first so a deduction never races an expired unit.
        let current = self.engine.evaluate(&inner.record, now);
        let deducted = self.engine.deduct(&current.record, now)?;
        let eval = self.engine.evaluate(&deducted, now);

        inner.record = eval.record.clone();
        inner.dirty = true;
        inner.version += 1;
        self.spawn_persist(inner.version);
        drop(inner);

        let exhausted = eval.record.count == 0;
        let kind = if exhausted {
            QuotaEventKind::Exhausted
        } else {
            QuotaEventKind::Deducted
        };
        let _ = self.events.send(QuotaEvent {
            owner: self.owner.clone(),
            kind,
            record: eval.record.clone(),
            next_restore_at: eval.next_restore_at,
        });

        let eta = eval
            .next_restore_at
            .map(|at| format_restore_eta(at - now))
            .unwrap_or_else(|| "soon".to_string());
        if exhausted {
            self.notifier.notify(Notification::error(
                format!("No lives remaining. Next life in {eta}."),
                EXHAUSTED_TOAST_MS,
            ));
        } else {
            let max = self.engine.policy().max_quota;
            self.notifier.notify(Notification::warning(
                format!(
                    "Violation recorded — {} of {max} lives remain. Next life in {eta}.",
                    eval.record.count
                ),
                DEDUCT_TOAST_MS,
            ));
        }

        Ok(eval)
    }

    /// Reconcile with the durable store once.
    ///
    /// Public so tests and the admin CLI can force a deterministic sync; the
    /// read path calls it from a spawned task.
    pub async fn refresh(self: &Arc<Self>, now: DateTime<Utc>) {
        let loaded = self.store.load(&self.owner).await;

        let (persist_version, record_to_save) = {
            let mut inner = self.inner.lock().await;
            inner.refresh_inflight = false;
            match loaded {
                Ok(remote) => {
                    let merged = self.engine.merge(&inner.record, &remote, now);
                    if merged.record != inner.record {
                        inner.version += 1;
                    }
                    // Write back when the merge knows something the remote
                    // row lacks (a local deduction, a lazy restoration) or
                    // when a failed save is still owed.
                    let diverged = merged.record != remote;
                    inner.record = merged.record;
                    inner.fetched_at = Some(now);
                    if inner.dirty || diverged {
                        inner.dirty = true;
                        (Some(inner.version), Some(inner.record.clone()))
                    } else {
                        (None, None)
                    }
                }
                Err(e) => {
                    warn!(owner = %self.owner, err = %e, "quota store unavailable — serving cached record");
                    (None, None)
                }
            }
        };

        if let (Some(version), Some(record)) = (persist_version, record_to_save) {
            self.persist(version, record).await;
        }
    }

    /// Fire-and-forget persistence of the current record.
    fn spawn_persist(self: &Arc<Self>, version: u64) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let record = cache.inner.lock().await.record.clone();
            cache.persist(version, record).await;
        });
    }

    async fn persist(self: &Arc<Self>, version: u64, record: QuotaRecord) {
        match self.store.save(&self.owner, &record).await {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                // Only clear the dirty flag if nothing moved mid-save.
                if inner.version == version {
                    inner.dirty = false;
                    debug!(owner = %self.owner, count = record.count, "quota record persisted");
                }
            }
            Err(e) => {
                warn!(owner = %self.owner, err = %e, "quota save failed — will retry after next refresh");
            }
        }
    }

    /// `true` if a local change is still awaiting durable persistence.
    pub async fn is_dirty(&self) -> bool {
        self.inner.lock().await.dirty
    }
}
