pub mod config;
pub mod notify;
pub mod policy;
pub mod quota;
pub mod session;
pub mod storage;

use std::sync::Arc;

use config::ProctorConfig;
use notify::{BroadcastNotifier, NotificationSink};
use policy::BypassList;
use quota::cache::QuotaCache;
use quota::engine::QuotaEngine;
use quota::store::{QuotaStore, SqliteQuotaStore};
use session::{ExamSession, SessionHooks};
use storage::Storage;

/// Shared wiring for one host process: config, the durable store, the
/// notification fan-out, and the bypass policy. Sessions and per-subject
/// caches are created through this so every instance sees the same policy.
#[derive(Clone)]
pub struct ProctorContext {
    pub config: Arc<ProctorConfig>,
    pub store: Arc<dyn QuotaStore>,
    pub notifier: Arc<BroadcastNotifier>,
    engine: QuotaEngine,
    bypass: BypassList,
}

impl ProctorContext {
    /// Open the SQLite-backed context at `config.data_dir`.
    pub async fn open(config: ProctorConfig) -> anyhow::Result<Self> {
        let storage =
            Storage::new_with_slow_query(&config.data_dir, config.slow_query_threshold_ms).await?;
        let engine = QuotaEngine::new(config.quota.policy());
        let store: Arc<dyn QuotaStore> = Arc::new(SqliteQuotaStore::new(storage, engine.clone()));
        Ok(Self::with_store(config, store))
    }

    /// Build a context over any store implementation (in-memory for tests).
    pub fn with_store(config: ProctorConfig, store: Arc<dyn QuotaStore>) -> Self {
        let engine = QuotaEngine::new(config.quota.policy());
        let bypass = config.exam.bypass_list();
        Self {
            config: Arc::new(config),
            store,
            notifier: Arc::new(BroadcastNotifier::new()),
            engine,
            bypass,
        }
    }

    pub fn engine(&self) -> &QuotaEngine {
        &self.engine
    }

    pub fn bypass(&self) -> &BypassList {
        &self.bypass
    }

    /// The local quota mirror for one subject.
    pub fn quota_cache(&self, owner: impl Into<String>) -> Arc<QuotaCache> {
        let sink: Arc<dyn NotificationSink> = self.notifier.clone();
        Arc::new(QuotaCache::new(
            owner,
            self.engine.clone(),
            Arc::clone(&self.store),
            self.config.quota.cache_ttl(),
            sink,
        ))
    }

    /// A new exam session for `identity`, wired to the subject's cache.
    pub fn exam_session(
        &self,
        identity: Option<String>,
        quota: Arc<QuotaCache>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Arc<ExamSession> {
        Arc::new(ExamSession::new(
            identity,
            &self.config.exam,
            &self.bypass,
            quota,
            hooks,
        ))
    }
}
