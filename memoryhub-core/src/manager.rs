//! Public façade: owns every substore and the cross-tier tag index.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Instant;

use chrono::Utc;
use serde_json::Map;
use tokio::sync::RwLock;

use crate::config::MemoryHubConfig;
use crate::error::{Error, Result};
use crate::router;
use crate::stats::{HubStats, LatencyTracker};
use crate::tiers::{CoreTier, LogTier, SessionTier};
use crate::types::{RecallOp, Record, Tier};

/// Result of `load_tier`: whether the named tier's in-memory structures are
/// populated, and how many records it holds.
#[derive(Debug, Clone)]
pub struct LoadTierReport {
    pub tier: Tier,
    pub count: usize,
    pub loaded: bool,
    pub ids: Vec<String>,
}

/// Diagnostic snapshot of one tier's on-disk footprint and index health, as
/// reported by the maintenance CLI's `info` command (spec.md §6: "per-tier
/// file sizes, line counts, sidecar freshness").
#[derive(Debug, Clone)]
pub struct TierDiagnostics {
    pub tier: Tier,
    pub record_count: usize,
    /// Backing file size in bytes. `None` for the session tier, which has
    /// no backing file.
    pub file_size_bytes: Option<u64>,
    /// Whether the sidecar's mtime and line count agree with the log.
    /// `None` for tiers with no sidecar (core, session).
    pub sidecar_fresh: Option<bool>,
}

/// Hashes an opaque string id into the 32-bit space the tag bitmap index
/// operates over.
fn hash_id(id: &str) -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() & 0xFFFF_FFFF) as u32
}

struct HubState {
    session: SessionTier,
    core: CoreTier,
    application: LogTier,
    archive: LogTier,
    tag_index: crate::bitmap::TagBitmapIndex,
    id_counter: u64,
    id_tier: HashMap<String, Tier>,
    id_by_hash: HashMap<u32, String>,
    latency: LatencyTracker,
    total_stored: u64,
    total_recalled: u64,
}

/// The embeddable four-tier memory store.
///
/// Internally guarded by a single coarse `tokio::sync::RwLock`. `recall`,
/// `remember`, `recall_by_tags`, `flush_pending_updates`, `load_tier`, and
/// `close` all take the exclusive (write) side, since every one of them
/// mutates either a counter, a pending-update buffer, or an in-memory index
/// as a side effect; only `stats` takes the shared (read) side. There is no
/// lock-upgrade path.
pub struct MemoryHub {
    state: RwLock<HubState>,
    config: MemoryHubConfig,
}

impl MemoryHub {
    /// Opens (creating if absent) a store rooted at `config.data_path`.
    pub async fn open(config: MemoryHubConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_path)?;

        let core = CoreTier::open(&config.core_db_path()).await?;
        let mut application = LogTier::open_with_fsync_policy(
            "application",
            config.log_path("application"),
            config.sidecar_path("application"),
            config.flush_batch_size,
            config.query_cache_size,
            config.fsync_policy,
        )?;
        let mut archive = LogTier::open_with_fsync_policy(
            "archive",
            config.log_path("archive"),
            config.sidecar_path("archive"),
            config.flush_batch_size,
            config.query_cache_size,
            config.fsync_policy,
        )?;

        let mut id_tier = HashMap::new();
        let mut id_by_hash = HashMap::new();
        let mut tag_index = crate::bitmap::TagBitmapIndex::new();

        for record in core.load_all().await? {
            id_tier.insert(record.id.clone(), Tier::Core);
            let h = hash_id(&record.id);
            id_by_hash.insert(h, record.id.clone());
            tag_index.add(h, &record.tags);
        }
        let application_ids = application.ids();
        for record in application.get_many(&application_ids) {
            id_tier.insert(record.id.clone(), Tier::Application);
            let h = hash_id(&record.id);
            id_by_hash.insert(h, record.id.clone());
            tag_index.add(h, &record.tags);
        }
        let archive_ids = archive.ids();
        for record in archive.get_many(&archive_ids) {
            id_tier.insert(record.id.clone(), Tier::Archive);
            let h = hash_id(&record.id);
            id_by_hash.insert(h, record.id.clone());
            tag_index.add(h, &record.tags);
        }

        let state = HubState {
            session: SessionTier::new(),
            core,
            application,
            archive,
            tag_index,
            id_counter: 0,
            id_tier,
            id_by_hash,
            latency: LatencyTracker::new(config.max_latency_samples),
            total_stored: 0,
            total_recalled: 0,
        };

        Ok(Self {
            state: RwLock::new(state),
            config,
        })
    }

    /// Stores `content` with `tags` and `context_path`, returning the
    /// persisted record including its assigned id and tier.
    pub async fn remember(
        &self,
        content: impl Into<String>,
        tags: Vec<String>,
        context_path: impl Into<String>,
    ) -> Result<Record> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("content must not be empty".into()));
        }
        let context_path = context_path.into();

        let mut guard = self.state.write().await;

        guard.id_counter += 1;
        let id = format!("mem_{}", guard.id_counter);
        let tier = router::classify(&content, &tags);

        let record = Record {
            id: id.clone(),
            content,
            tags,
            context_path,
            tier,
            created_at: Utc::now(),
            recalled_count: 0,
            last_recalled: None,
            stored_at: None,
            updated_at: None,
            extra: Map::new(),
        };

        let stored = match tier {
            Tier::Session => {
                guard.session.store(record.clone());
                record
            }
            Tier::Core => {
                guard.core.store(&record).await?;
                record
            }
            Tier::Application => guard.application.store(record)?,
            Tier::Archive => guard.archive.store(record)?,
        };

        let h = hash_id(&stored.id);
        guard.tag_index.add(h, &stored.tags);
        guard.id_tier.insert(stored.id.clone(), tier);
        guard.id_by_hash.insert(h, stored.id.clone());
        guard.total_stored += 1;

        tracing::debug!(id = %stored.id, %tier, "stored record");

        Ok(stored)
    }

    /// Queries every tier in priority order core → application → archive →
    /// session, incrementing `recalled_count` for every record returned,
    /// and returns up to `limit` results sorted by `created_at` descending.
    pub async fn recall(&self, query: &str, limit: usize) -> Result<Vec<Record>> {
        tracing::debug!(query, limit, "recall starting");
        let started = Instant::now();
        let mut guard = self.state.write().await;

        let mut results = Vec::new();
        for tier in Tier::RECALL_PRIORITY {
            if results.len() >= limit {
                break;
            }
            let remaining = limit - results.len();
            let batch = match tier {
                Tier::Core => guard.core.search(query, remaining).await?,
                Tier::Application => guard.application.search(query, remaining),
                Tier::Archive => guard.archive.search(query, remaining),
                Tier::Session => guard.session.search(query, remaining),
            };
            for record in batch {
                Self::bump_recall(&mut guard, tier, &record.id).await?;
                results.push(record);
            }
        }

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        guard.total_recalled += results.len() as u64;
        guard.latency.record(started.elapsed());

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(hits = results.len(), elapsed_ms, "recall finished");

        Ok(results)
    }

    /// Looks up candidate ids via the tag bitmap index, then materializes
    /// and recall-bumps each from whichever tier owns it.
    pub async fn recall_by_tags(
        &self,
        tags: &[String],
        op: RecallOp,
        limit: usize,
    ) -> Result<Vec<Record>> {
        tracing::debug!(?tags, ?op, limit, "recall_by_tags starting");
        let started = Instant::now();
        let mut guard = self.state.write().await;

        let candidate_hashes = guard.tag_index.query(tags, op);
        let mut candidate_ids = Vec::new();
        for h in candidate_hashes {
            if let Some(id) = guard.id_by_hash.get(&h).cloned() {
                candidate_ids.push(id);
            }
        }

        let mut results = Vec::new();
        for id in candidate_ids {
            if results.len() >= limit {
                break;
            }
            let Some(tier) = guard.id_tier.get(&id).copied() else {
                continue;
            };
            let record = match tier {
                Tier::Core => guard.core.get(&id).await?,
                Tier::Application => guard.application.get(&id),
                Tier::Archive => guard.archive.get(&id),
                Tier::Session => guard.session.get(&id),
            };
            if let Some(record) = record {
                Self::bump_recall(&mut guard, tier, &id).await?;
                results.push(record);
            }
        }

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);
        guard.total_recalled += results.len() as u64;
        guard.latency.record(started.elapsed());

        tracing::debug!(hits = results.len(), "recall_by_tags finished");

        Ok(results)
    }

    async fn bump_recall(guard: &mut HubState, tier: Tier, id: &str) -> Result<()> {
        match tier {
            Tier::Core => {
                guard.core.increment_recall(id).await?;
            }
            Tier::Application => guard.application.update_recall_count(id)?,
            Tier::Archive => guard.archive.update_recall_count(id)?,
            Tier::Session => {
                guard.session.increment_recall(id);
            }
        }
        Ok(())
    }

    /// Ensures the named tier's in-memory structures are populated,
    /// optionally forcing a reload from disk, and reports its cardinality.
    pub async fn load_tier(&self, name: &str, force_reload: bool) -> Result<LoadTierReport> {
        let tier: Tier = name.parse()?;
        let mut guard = self.state.write().await;

        if force_reload {
            tracing::info!(%tier, "forcing tier rebuild from disk");
            match tier {
                Tier::Application => guard.application.build_index(true)?,
                Tier::Archive => guard.archive.build_index(true)?,
                Tier::Core | Tier::Session => {}
            }
        }

        let (count, ids) = match tier {
            Tier::Session => (guard.session.len(), guard.session.ids()),
            Tier::Core => {
                let count = guard.core.count().await? as usize;
                (count, Vec::new())
            }
            Tier::Application => (guard.application.len(), guard.application.ids()),
            Tier::Archive => (guard.archive.len(), guard.archive.ids()),
        };

        Ok(LoadTierReport {
            tier,
            count,
            loaded: true,
            ids,
        })
    }

    /// Reports the named tier's on-disk file size, record count, and (for
    /// log tiers) sidecar freshness, without mutating anything.
    pub async fn tier_diagnostics(&self, name: &str) -> Result<TierDiagnostics> {
        let tier: Tier = name.parse()?;
        let guard = self.state.read().await;

        let (record_count, file_size_bytes, sidecar_fresh) = match tier {
            Tier::Session => (guard.session.len(), None, None),
            Tier::Core => {
                let count = guard.core.count().await? as usize;
                let size = std::fs::metadata(self.config.core_db_path()).ok().map(|m| m.len());
                (count, size, None)
            }
            Tier::Application => {
                let size = std::fs::metadata(guard.application.log_path()).ok().map(|m| m.len());
                (guard.application.len(), size, Some(guard.application.sidecar_is_fresh()))
            }
            Tier::Archive => {
                let size = std::fs::metadata(guard.archive.log_path()).ok().map(|m| m.len());
                (guard.archive.len(), size, Some(guard.archive.sidecar_is_fresh()))
            }
        };

        Ok(TierDiagnostics {
            tier,
            record_count,
            file_size_bytes,
            sidecar_fresh,
        })
    }

    /// The configuration this store was opened with.
    #[must_use]
    pub fn config(&self) -> &MemoryHubConfig {
        &self.config
    }

    /// Store-wide counters and recall-latency aggregates.
    pub async fn stats(&self) -> Result<HubStats> {
        let guard = self.state.read().await;

        let mut per_tier_counts = std::collections::BTreeMap::new();
        per_tier_counts.insert(Tier::Session, guard.session.len() as u64);
        per_tier_counts.insert(Tier::Core, guard.core.count().await?);
        per_tier_counts.insert(Tier::Application, guard.application.len() as u64);
        per_tier_counts.insert(Tier::Archive, guard.archive.len() as u64);

        Ok(HubStats {
            per_tier_counts,
            total_stored: guard.total_stored,
            total_recalled: guard.total_recalled,
            recall_latency: guard.latency.stats(),
        })
    }

    /// Attaches a `windows` row to a core-tier record. Thin insert-only
    /// helper over a satellite table the recall path never reads.
    pub async fn attach_window(&self, record_id: &str, pid: Option<i64>) -> Result<i64> {
        let guard = self.state.read().await;
        guard.core.attach_window(record_id, pid).await
    }

    /// Attaches a `review_logs` row to a core-tier record. Thin insert-only
    /// helper over a satellite table the recall path never reads.
    pub async fn attach_review(
        &self,
        record_id: &str,
        agent: &str,
        verdict: &str,
        score: f64,
        comments: &str,
    ) -> Result<i64> {
        let guard = self.state.read().await;
        guard.core.attach_review(record_id, agent, verdict, score, comments).await
    }

    /// Force-flushes both log tiers' pending recall-count buffers.
    pub async fn flush_pending_updates(&self) -> Result<()> {
        tracing::debug!("flushing pending recall-count updates");
        let mut guard = self.state.write().await;
        guard.application.flush()?;
        guard.archive.flush()?;
        Ok(())
    }

    /// Flushes pending updates and releases mmap handles. Idempotent; safe
    /// to call more than once.
    pub async fn close(&self) -> Result<()> {
        tracing::info!("closing memory hub");
        let mut guard = self.state.write().await;
        guard.application.close()?;
        guard.archive.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_hub(dir: &std::path::Path) -> MemoryHub {
        let config = MemoryHubConfig {
            data_path: dir.to_path_buf(),
            ..Default::default()
        };
        MemoryHub::open(config).await.unwrap()
    }

    fn tags(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn scenario_1_routing_matches_spec_examples() {
        let dir = tempfile::tempdir().unwrap();
        let hub = open_hub(dir.path()).await;

        let core = hub.remember("task_id: ABC123", tags(&["task"]), "/t/1").await.unwrap();
        assert!(matches!(core.tier, Tier::Core));

        let app = hub.remember("Log: started", tags(&["sys"]), "/logs/a").await.unwrap();
        assert!(matches!(app.tier, Tier::Application));

        let archive = hub.remember("historical note", tags(&["archive"]), "/arc/a").await.unwrap();
        assert!(matches!(archive.tier, Tier::Archive));

        let session = hub.remember("hello", tags(&["x"]), "").await.unwrap();
        assert!(matches!(session.tier, Tier::Session));
    }

    #[tokio::test]
    async fn scenario_3_tag_intersection_returns_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let hub = open_hub(dir.path()).await;
        hub.remember("A", tags(&["python", "ai"]), "").await.unwrap();
        hub.remember("B", tags(&["python", "web"]), "").await.unwrap();
        hub.remember("C", tags(&["ai", "ml"]), "").await.unwrap();

        let results = hub
            .recall_by_tags(&tags(&["python", "ai"]), RecallOp::Intersection, 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "A");
    }

    #[tokio::test]
    async fn recall_bumps_counts_through_the_pending_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryHubConfig {
            data_path: dir.path().to_path_buf(),
            flush_batch_size: 8,
            ..Default::default()
        };
        let hub = MemoryHub::open(config).await.unwrap();
        let stored = hub.remember("Log: m", tags(&[]), "").await.unwrap();

        for _ in 0..7 {
            let results = hub.recall("Log", 10).await.unwrap();
            assert_eq!(results[0].id, stored.id);
        }
        hub.flush_pending_updates().await.unwrap();

        // The 7 recalls above each returned the record before that same
        // call's own pending bump was applied, so the flushed on-disk count
        // is 7, not 8; this recall then buffers its own (8th) increment,
        // which it does not see in its own return value.
        let results = hub.recall("Log", 10).await.unwrap();
        assert_eq!(results[0].recalled_count, 7);
    }

    #[tokio::test]
    async fn remember_rejects_empty_content() {
        let dir = tempfile::tempdir().unwrap();
        let hub = open_hub(dir.path()).await;
        let err = hub.remember("   ", tags(&[]), "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn stats_report_per_tier_counts() {
        let dir = tempfile::tempdir().unwrap();
        let hub = open_hub(dir.path()).await;
        hub.remember("task_id: a", tags(&[]), "").await.unwrap();
        hub.remember("hello", tags(&[]), "").await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.per_tier_counts.get(&Tier::Core), Some(&1));
        assert_eq!(stats.per_tier_counts.get(&Tier::Session), Some(&1));
        assert_eq!(stats.total_stored, 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let hub = open_hub(dir.path()).await;
        hub.remember("Log: x", tags(&[]), "").await.unwrap();
        hub.close().await.unwrap();
        hub.close().await.unwrap();
    }
}
