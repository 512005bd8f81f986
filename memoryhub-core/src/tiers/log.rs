//! Append-only log tier shared by the `application` and `archive` stores.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use lru::LruCache;
use memmap2::Mmap;

use crate::config::FsyncPolicy;
use crate::error::{Error, Result};
use crate::types::Record;

/// Offset/length sidecar plus in-memory tag pre-index over an append-only
/// JSONL log. One instance backs the `application` tier and another the
/// `archive` tier; both are the same type per the spec's single-tier-kind
/// design.
pub struct LogTier {
    name: String,
    log_path: PathBuf,
    sidecar_path: PathBuf,
    offsets: Vec<u64>,
    lengths: Vec<u64>,
    tag_index: BTreeMap<String, BTreeSet<usize>>,
    id_index: HashMap<String, usize>,
    pending: HashMap<String, u64>,
    flush_batch_size: usize,
    cache: LruCache<(String, usize), Vec<Record>>,
    mmap: Option<Mmap>,
    fsync_policy: FsyncPolicy,
}

impl LogTier {
    /// Opens (or creates) the log and its sidecar, rebuilding the sidecar
    /// and tag pre-index if the sidecar is missing, truncated, or stale.
    pub fn open(
        name: impl Into<String>,
        log_path: impl Into<PathBuf>,
        sidecar_path: impl Into<PathBuf>,
        flush_batch_size: usize,
        cache_size: usize,
    ) -> Result<Self> {
        Self::open_with_fsync_policy(
            name,
            log_path,
            sidecar_path,
            flush_batch_size,
            cache_size,
            FsyncPolicy::default(),
        )
    }

    /// Opens the log and its sidecar with an explicit fsync policy. `Always`
    /// calls `sync_all` on the log file after every append and on every
    /// rewrite; `Never` leaves flushing to the OS (still calling the
    /// buffered `flush`, which is the spec's minimum requirement).
    pub fn open_with_fsync_policy(
        name: impl Into<String>,
        log_path: impl Into<PathBuf>,
        sidecar_path: impl Into<PathBuf>,
        flush_batch_size: usize,
        cache_size: usize,
        fsync_policy: FsyncPolicy,
    ) -> Result<Self> {
        let name = name.into();
        let mut log_path = log_path.into();
        let mut sidecar_path = sidecar_path.into();

        if !log_path.exists() {
            if let Some((alias_log, alias_sidecar)) = historical_alias(&name, &log_path) {
                if alias_log.exists() {
                    tracing::info!(
                        tier = %name,
                        path = %alias_log.display(),
                        "canonical log missing, found historical filename alias"
                    );
                    log_path = alias_log;
                    sidecar_path = alias_sidecar;
                }
            }
        }

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !log_path.exists() {
            File::create(&log_path)?;
        }

        let mut tier = Self {
            name,
            log_path,
            sidecar_path,
            offsets: Vec::new(),
            lengths: Vec::new(),
            tag_index: BTreeMap::new(),
            id_index: HashMap::new(),
            pending: HashMap::new(),
            flush_batch_size: flush_batch_size.max(1),
            cache: LruCache::new(
                std::num::NonZeroUsize::new(cache_size.max(1)).unwrap_or(std::num::NonZeroUsize::MIN),
            ),
            mmap: None,
            fsync_policy,
        };

        tier.build_index(false)?;
        Ok(tier)
    }

    /// Whether the sidecar's mtime is at least as new as the log's and its
    /// line count matches the log's non-blank line count. Exposed so
    /// diagnostics (the maintenance CLI's `info` command) can report sidecar
    /// staleness without duplicating the check.
    #[must_use]
    pub fn sidecar_is_fresh(&self) -> bool {
        let (Ok(log_meta), Ok(sidecar_meta)) =
            (std::fs::metadata(&self.log_path), std::fs::metadata(&self.sidecar_path))
        else {
            return false;
        };
        let (Ok(log_mtime), Ok(sidecar_mtime)) = (log_meta.modified(), sidecar_meta.modified()) else {
            return false;
        };
        if sidecar_mtime < log_mtime {
            return false;
        }
        let Ok(sidecar_text) = std::fs::read_to_string(&self.sidecar_path) else {
            return false;
        };
        let sidecar_lines = sidecar_text.lines().count();
        let Ok(log_text) = std::fs::read_to_string(&self.log_path) else {
            return false;
        };
        let log_lines = log_text.lines().filter(|l| !l.trim().is_empty()).count();
        sidecar_lines == log_lines
    }

    /// Rebuilds offsets, lengths, the id and tag pre-indexes, and the
    /// sidecar from a single forward scan of the log. Skips the scan when
    /// `force` is false and the sidecar already looks fresh -- in that case
    /// the sidecar's offsets/lengths are trusted but the tag/id indexes are
    /// still rebuilt from content, since they are never persisted.
    pub fn build_index(&mut self, force: bool) -> Result<()> {
        let bytes = std::fs::read(&self.log_path)?;

        if !force && self.sidecar_is_fresh() {
            tracing::debug!(tier = %self.name, "sidecar fresh, skipping rebuild scan");
            let sidecar_text = std::fs::read_to_string(&self.sidecar_path)?;
            let mut offsets = Vec::new();
            let mut lengths = Vec::new();
            for line in sidecar_text.lines() {
                let Some((off, len)) = line.split_once(',') else {
                    continue;
                };
                let (Ok(off), Ok(len)) = (off.parse::<u64>(), len.parse::<u64>()) else {
                    continue;
                };
                offsets.push(off);
                lengths.push(len);
            }
            self.offsets = offsets;
            self.lengths = lengths;
        } else {
            if force {
                tracing::info!(tier = %self.name, "rebuilding index from a forced full scan");
            } else {
                tracing::warn!(tier = %self.name, "sidecar missing or stale, rebuilding from full scan");
            }
            let mut offsets = Vec::new();
            let mut lengths = Vec::new();
            let mut cursor: u64 = 0;
            for raw_line in bytes.split(|&b| b == b'\n') {
                if raw_line.is_empty() {
                    continue;
                }
                let length = raw_line.len() as u64 + 1;
                offsets.push(cursor);
                lengths.push(length);
                cursor += length;
            }
            self.offsets = offsets;
            self.lengths = lengths;
            self.rewrite_sidecar()?;
        }

        self.rebuild_memory_indexes(&bytes)?;
        self.mmap = None;
        self.cache.clear();
        Ok(())
    }

    fn rebuild_memory_indexes(&mut self, bytes: &[u8]) -> Result<()> {
        self.tag_index.clear();
        self.id_index.clear();
        for (idx, (&offset, &length)) in self.offsets.iter().zip(self.lengths.iter()).enumerate() {
            let start = offset as usize;
            let end = (start + length as usize).min(bytes.len());
            if start >= bytes.len() || start >= end {
                continue;
            }
            let line = &bytes[start..end];
            let trimmed = trim_newline(line);
            match serde_json::from_slice::<Record>(trimmed) {
                Ok(record) => {
                    self.id_index.insert(record.id.clone(), idx);
                    for tag in record.lowercase_tags() {
                        self.tag_index.entry(tag).or_default().insert(idx);
                    }
                }
                Err(_) => {
                    // Skip an unparseable line: SerializationError is recoverable,
                    // never fatal to the index rebuild.
                }
            }
        }
        Ok(())
    }

    fn rewrite_sidecar(&self) -> Result<()> {
        let mut out = String::new();
        for (offset, length) in self.offsets.iter().zip(self.lengths.iter()) {
            out.push_str(&format!("{offset},{length}\n"));
        }
        std::fs::write(&self.sidecar_path, out)?;
        Ok(())
    }

    fn ensure_mmap(&mut self) -> Result<()> {
        if self.mmap.is_some() {
            return Ok(());
        }
        let file = File::open(&self.log_path)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        // SAFETY: the log file is owned exclusively by this tier and never
        // truncated concurrently with a live mmap; ensure_mmap is only called
        // while holding the manager's exclusive or shared guard.
        let mmap = unsafe { Mmap::map(&file)? };
        self.mmap = Some(mmap);
        Ok(())
    }

    fn read_record_at(&mut self, idx: usize) -> Option<Record> {
        let offset = *self.offsets.get(idx)?;
        let length = *self.lengths.get(idx)?;
        if self.ensure_mmap().is_err() {
            return self.read_record_at_fallback(idx);
        }
        let mmap = self.mmap.as_ref()?;
        let start = offset as usize;
        let end = (start + length as usize).min(mmap.len());
        if start >= mmap.len() || start >= end {
            return None;
        }
        let line = trim_newline(&mmap[start..end]);
        serde_json::from_slice(line).ok()
    }

    fn read_record_at_fallback(&self, idx: usize) -> Option<Record> {
        tracing::warn!(tier = %self.name, idx, "mmap unavailable, falling back to buffered read");
        let file = File::open(&self.log_path).ok()?;
        let mut reader = BufReader::new(file);
        for (i, line) in reader.by_ref().lines().enumerate() {
            let line = line.ok()?;
            if i == idx {
                return serde_json::from_str(&line).ok();
            }
        }
        None
    }

    fn apply_pending(&self, mut record: Record) -> Record {
        if let Some(&extra) = self.pending.get(&record.id) {
            record.recalled_count += extra;
            record.last_recalled = Some(Utc::now());
        }
        record
    }

    /// Serializes and appends `record` to the log, then appends its
    /// offset/length to the sidecar and updates in-memory indexes. The log
    /// write happens before the sidecar write so a crash in between never
    /// leaves the sidecar ahead of the log.
    pub fn store(&mut self, mut record: Record) -> Result<Record> {
        if record.stored_at.is_none() {
            record.stored_at = Some(Utc::now());
        }
        let line = serde_json::to_string(&record)?;

        let mut log_file = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        let offset = log_file.metadata()?.len();
        log_file.write_all(line.as_bytes())?;
        log_file.write_all(b"\n")?;
        log_file.flush()?;
        if self.fsync_policy == FsyncPolicy::Always {
            log_file.sync_all()?;
        }
        let length = line.len() as u64 + 1;

        let mut sidecar_file =
            OpenOptions::new().create(true).append(true).open(&self.sidecar_path)?;
        writeln!(sidecar_file, "{offset},{length}")?;
        sidecar_file.flush()?;
        if self.fsync_policy == FsyncPolicy::Always {
            sidecar_file.sync_all()?;
        }

        let idx = self.offsets.len();
        self.offsets.push(offset);
        self.lengths.push(length);
        self.id_index.insert(record.id.clone(), idx);
        for tag in record.lowercase_tags() {
            self.tag_index.entry(tag).or_default().insert(idx);
        }

        self.mmap = None;
        self.cache.clear();
        Ok(record)
    }

    /// Case-insensitive substring search over content, tags, and context
    /// path. The tag pre-filter unions candidates from every indexed tag
    /// that contains `q` as a substring; if that union is empty, falls back
    /// to a full scan of the log, since content itself is not indexed.
    pub fn search(&mut self, query: &str, limit: usize) -> Vec<Record> {
        let query_lower = query.to_lowercase();
        let cache_key = (query_lower.clone(), limit);
        if let Some(hit) = self.cache.get(&cache_key) {
            return hit.clone();
        }

        let candidates: BTreeSet<usize> = if query_lower.is_empty() {
            (0..self.offsets.len()).collect()
        } else {
            let mut union = BTreeSet::new();
            for (tag, indices) in &self.tag_index {
                if tag.contains(&query_lower) {
                    union.extend(indices);
                }
            }
            if union.is_empty() {
                (0..self.offsets.len()).collect()
            } else {
                union
            }
        };

        let mut results = Vec::new();
        for idx in candidates {
            let Some(record) = self.read_record_at(idx) else {
                continue;
            };
            if record.matches(&query_lower) {
                results.push(self.apply_pending(record));
            }
        }

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.truncate(limit);

        self.cache.put(cache_key, results.clone());
        results
    }

    /// Fetches one record by id, applying any pending recall-count overlay.
    pub fn get(&mut self, id: &str) -> Option<Record> {
        let idx = *self.id_index.get(id)?;
        let record = self.read_record_at(idx)?;
        Some(self.apply_pending(record))
    }

    /// Materializes the records at `indices`, in the order given, applying
    /// the pending overlay. Used by tag-bitmap recall.
    pub fn get_many(&mut self, ids: &[String]) -> Vec<Record> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Buffers a recall-count increment, flushing once the batch threshold
    /// is reached.
    pub fn update_recall_count(&mut self, id: &str) -> Result<()> {
        *self.pending.entry(id.to_string()).or_insert(0) += 1;
        self.cache.clear();
        if self.pending.len() >= self.flush_batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Applies every pending recall-count increment by rewriting the log in
    /// full, then rebuilds the sidecar and tag/id indexes (record byte
    /// lengths can change once `recalled_count` grows).
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        tracing::info!(tier = %self.name, pending = self.pending.len(), "flushing pending recall-count updates");

        let file = File::open(&self.log_path)?;
        let reader = BufReader::new(file);
        let mut rewritten = String::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut record: Record = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(_) => {
                    rewritten.push_str(&line);
                    rewritten.push('\n');
                    continue;
                }
            };
            if let Some(&increment) = self.pending.get(&record.id) {
                record.recalled_count += increment;
                record.last_recalled = Some(Utc::now());
            }
            rewritten.push_str(&serde_json::to_string(&record)?);
            rewritten.push('\n');
        }

        std::fs::write(&self.log_path, rewritten)?;
        self.pending.clear();
        self.build_index(true)
    }

    /// Number of records currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.id_index.keys().cloned().collect()
    }

    /// Path to the append-only log file, for diagnostics.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Path to the offset/length sidecar, for diagnostics.
    #[must_use]
    pub fn sidecar_path(&self) -> &Path {
        &self.sidecar_path
    }

    /// Sidecar (offset, length) pairs, exposed for crash-recovery tests (P2).
    #[must_use]
    pub fn sidecar_entries(&self) -> Vec<(u64, u64)> {
        self.offsets.iter().copied().zip(self.lengths.iter().copied()).collect()
    }

    /// Releases the mmap handle and flushes pending updates. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.mmap = None;
        self.cache.clear();
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\n").unwrap_or(bytes)
}

/// Historical filename alias recognized on open when the canonical log file
/// is absent. The `application` tier's log was named `app_logs.jsonl` in the
/// original source (`jsonl_dao.py`'s `self.app_logs_file`); a store created
/// before the rename is still opened in place rather than silently starting
/// a second, empty canonical log beside it.
fn historical_alias(name: &str, canonical_log_path: &Path) -> Option<(PathBuf, PathBuf)> {
    if name != "application" {
        return None;
    }
    let dir = canonical_log_path.parent()?;
    Some((dir.join("app_logs.jsonl"), dir.join("app_logs.idx")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;
    use serde_json::Map;

    fn record(id: &str, content: &str, tags: &[&str]) -> Record {
        Record {
            id: id.into(),
            content: content.into(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            context_path: String::new(),
            tier: Tier::Application,
            created_at: Utc::now(),
            recalled_count: 0,
            last_recalled: None,
            stored_at: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    fn open_tier(dir: &Path) -> LogTier {
        LogTier::open(
            "application",
            dir.join("application.jsonl"),
            dir.join("application.idx"),
            10,
            500,
        )
        .unwrap()
    }

    #[test]
    fn store_then_search_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = open_tier(dir.path());
        tier.store(record("mem_1", "Log: started", &["sys"])).unwrap();
        let results = tier.search("started", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mem_1");
    }

    #[test]
    fn sidecar_contiguity_holds_after_several_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = open_tier(dir.path());
        for i in 0..5 {
            tier.store(record(&format!("mem_{i}"), "log line", &[])).unwrap();
        }
        let entries = tier.sidecar_entries();
        assert_eq!(entries[0].0, 0);
        for pair in entries.windows(2) {
            let (off0, len0) = pair[0];
            let (off1, _) = pair[1];
            assert_eq!(off0 + len0, off1);
        }
    }

    #[test]
    fn batched_recall_counts_flush_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = LogTier::open(
            "application",
            dir.path().join("application.jsonl"),
            dir.path().join("application.idx"),
            3,
            500,
        )
        .unwrap();
        tier.store(record("mem_1", "log entry", &[])).unwrap();

        tier.update_recall_count("mem_1").unwrap();
        tier.update_recall_count("mem_1").unwrap();
        let on_disk = std::fs::read_to_string(dir.path().join("application.jsonl")).unwrap();
        assert!(on_disk.contains("\"recalled_count\":0"));

        tier.update_recall_count("mem_1").unwrap();
        let on_disk = std::fs::read_to_string(dir.path().join("application.jsonl")).unwrap();
        assert!(on_disk.contains("\"recalled_count\":3"));
    }

    #[test]
    fn pending_overlay_is_visible_before_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = open_tier(dir.path());
        tier.store(record("mem_1", "log entry", &[])).unwrap();
        tier.update_recall_count("mem_1").unwrap();
        let results = tier.search("log", 10);
        assert_eq!(results[0].recalled_count, 1);
    }

    #[test]
    fn rebuild_after_missing_sidecar_recovers_correctly() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tier = open_tier(dir.path());
            for i in 0..100 {
                tier.store(record(&format!("mem_{i}"), "log line", &[])).unwrap();
            }
        }
        std::fs::remove_file(dir.path().join("application.idx")).unwrap();

        let mut tier = open_tier(dir.path());
        let results = tier.search("log", 1000);
        assert_eq!(results.len(), 100);

        tier.build_index(false).unwrap();
        assert_eq!(tier.sidecar_entries().len(), 100);
    }

    #[test]
    fn close_releases_handles_so_directory_can_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut tier = open_tier(dir.path());
            for i in 0..5 {
                tier.store(record(&format!("mem_{i}"), "log", &[])).unwrap();
            }
            tier.close().unwrap();
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn tag_prefilter_matches_full_scan_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = open_tier(dir.path());
        tier.store(record("mem_1", "nothing special", &["python"])).unwrap();
        tier.store(record("mem_2", "also nothing", &["web"])).unwrap();
        let results = tier.search("python", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mem_1");
    }

    #[test]
    fn tag_prefilter_unions_tags_containing_the_query_as_a_substring() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = open_tier(dir.path());
        tier.store(record("mem_1", "nothing special", &["python3"])).unwrap();
        tier.store(record("mem_2", "also nothing", &["web"])).unwrap();
        let results = tier.search("py", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mem_1");
    }

    #[test]
    fn always_fsync_policy_still_stores_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut tier = LogTier::open_with_fsync_policy(
            "application",
            dir.path().join("application.jsonl"),
            dir.path().join("application.idx"),
            10,
            500,
            FsyncPolicy::Always,
        )
        .unwrap();
        tier.store(record("mem_1", "log entry", &[])).unwrap();
        let results = tier.search("log", 10);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn historical_app_logs_filename_is_opened_in_place() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut legacy = LogTier::open(
                "application",
                dir.path().join("app_logs.jsonl"),
                dir.path().join("app_logs.idx"),
                10,
                500,
            )
            .unwrap();
            legacy.store(record("mem_1", "Log: from before the rename", &["sys"])).unwrap();
            legacy.close().unwrap();
        }
        assert!(!dir.path().join("application.jsonl").exists());

        let mut tier = open_tier(dir.path());
        let results = tier.search("rename", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mem_1");
        assert_eq!(tier.log_path(), dir.path().join("app_logs.jsonl"));
    }

    #[test]
    fn canonical_filename_is_preferred_once_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut legacy = LogTier::open(
                "application",
                dir.path().join("app_logs.jsonl"),
                dir.path().join("app_logs.idx"),
                10,
                500,
            )
            .unwrap();
            legacy.store(record("mem_1", "legacy entry", &[])).unwrap();
        }
        {
            let mut canonical = open_tier(dir.path());
            canonical.store(record("mem_2", "canonical entry", &[])).unwrap();
        }

        let tier = open_tier(dir.path());
        assert_eq!(tier.log_path(), dir.path().join("application.jsonl"));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn archive_tier_has_no_historical_alias() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app_logs.jsonl"), "").unwrap();
        std::fs::write(dir.path().join("app_logs.idx"), "").unwrap();

        let tier = LogTier::open(
            "archive",
            dir.path().join("archive.jsonl"),
            dir.path().join("archive.idx"),
            10,
            500,
        )
        .unwrap();
        assert_eq!(tier.log_path(), dir.path().join("archive.jsonl"));
    }
}
