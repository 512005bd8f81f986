use std::collections::BTreeMap;

use colored::Colorize;
use memoryhub_core::{HubStats, LoadTierReport, MemoryHub, Tier};
use serde::Serialize;

fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

use crate::output::Output;

#[derive(Debug, Serialize)]
pub struct BuildIndexReport {
    pub layer: String,
    pub line_count: usize,
    pub forced: bool,
}

impl Output for BuildIndexReport {
    fn write_human<W: std::io::Write>(&self, mut writer: W) -> anyhow::Result<()> {
        writeln!(
            writer,
            "{} rebuilt layer {} — {} lines (force={})",
            "ok".green(),
            self.layer.bold(),
            self.line_count,
            self.forced
        )?;
        Ok(())
    }
}

/// Rebuilds the sidecar and tag pre-index for one or both log layers.
pub async fn build_index(hub: &MemoryHub, layer: Option<&str>, force: bool) -> anyhow::Result<Vec<BuildIndexReport>> {
    let layers: Vec<&str> = match layer {
        Some(l) => vec![l],
        None => vec!["application", "archive"],
    };

    let mut reports = Vec::new();
    for layer in layers {
        let report = hub.load_tier(layer, force).await?;
        reports.push(build_index_report(&report, force));
    }
    Ok(reports)
}

fn build_index_report(report: &LoadTierReport, forced: bool) -> BuildIndexReport {
    BuildIndexReport {
        layer: report.tier.to_string(),
        line_count: report.count,
        forced,
    }
}

#[derive(Debug, Serialize)]
pub struct LatencyReport {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_ms: f64,
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub per_tier_counts: BTreeMap<String, u64>,
    pub total_stored: u64,
    pub total_recalled: u64,
    pub recall_latency: LatencyReport,
}

impl From<HubStats> for StatsReport {
    fn from(stats: HubStats) -> Self {
        let per_tier_counts = stats
            .per_tier_counts
            .into_iter()
            .map(|(tier, count)| (tier.to_string(), count))
            .collect();
        Self {
            per_tier_counts,
            total_stored: stats.total_stored,
            total_recalled: stats.total_recalled,
            recall_latency: LatencyReport {
                mean_ms: stats.recall_latency.mean_ms,
                min_ms: stats.recall_latency.min_ms,
                max_ms: stats.recall_latency.max_ms,
                total_ms: stats.recall_latency.total_ms,
                count: stats.recall_latency.count,
            },
        }
    }
}

impl Output for StatsReport {
    fn write_human<W: std::io::Write>(&self, mut writer: W) -> anyhow::Result<()> {
        writeln!(writer, "{}", "memoryhub stats".bold())?;
        for (tier, count) in &self.per_tier_counts {
            writeln!(writer, "  {tier:<12} {count}")?;
        }
        writeln!(writer, "  {:<12} {}", "total", self.total_stored)?;
        writeln!(writer, "  {:<12} {}", "recalled", self.total_recalled)?;
        writeln!(
            writer,
            "  recall latency: mean={:.2}ms min={:.2}ms max={:.2}ms count={}",
            self.recall_latency.mean_ms,
            self.recall_latency.min_ms,
            self.recall_latency.max_ms,
            self.recall_latency.count
        )?;
        Ok(())
    }
}

pub async fn stats(hub: &MemoryHub) -> anyhow::Result<StatsReport> {
    Ok(hub.stats().await?.into())
}

#[derive(Debug, Serialize)]
pub struct FlushReport {
    pub flushed: bool,
}

impl Output for FlushReport {
    fn write_human<W: std::io::Write>(&self, mut writer: W) -> anyhow::Result<()> {
        writeln!(writer, "{} pending recall-count updates flushed", "ok".green())?;
        Ok(())
    }
}

pub async fn flush(hub: &MemoryHub) -> anyhow::Result<FlushReport> {
    hub.flush_pending_updates().await?;
    Ok(FlushReport { flushed: true })
}

#[derive(Debug, Serialize)]
pub struct InfoReport {
    pub tiers: Vec<TierInfo>,
}

#[derive(Debug, Serialize)]
pub struct TierInfo {
    pub tier: String,
    pub record_count: usize,
    pub file_size_bytes: Option<u64>,
    pub sidecar_fresh: Option<bool>,
}

impl Output for InfoReport {
    fn write_human<W: std::io::Write>(&self, mut writer: W) -> anyhow::Result<()> {
        writeln!(writer, "{}", "memoryhub info".bold())?;
        for tier in &self.tiers {
            let size = tier.file_size_bytes.map_or_else(|| "-".to_string(), human_bytes);
            let sidecar = match tier.sidecar_fresh {
                Some(true) => "fresh".green().to_string(),
                Some(false) => "stale".yellow().to_string(),
                None => "-".to_string(),
            };
            writeln!(
                writer,
                "  {:<12} {:>8} lines  {:>10} on disk  sidecar={}",
                tier.tier, tier.record_count, size, sidecar
            )?;
        }
        Ok(())
    }
}

/// Per-tier file sizes, record counts, and sidecar freshness (spec.md §6).
pub async fn info(hub: &MemoryHub) -> anyhow::Result<InfoReport> {
    let mut tiers = Vec::new();
    for tier in [Tier::Session, Tier::Core, Tier::Application, Tier::Archive] {
        let diagnostics = hub.tier_diagnostics(tier.as_str()).await?;
        tiers.push(TierInfo {
            tier: tier.to_string(),
            record_count: diagnostics.record_count,
            file_size_bytes: diagnostics.file_size_bytes,
            sidecar_fresh: diagnostics.sidecar_fresh,
        });
    }
    Ok(InfoReport { tiers })
}

#[derive(Debug, Serialize)]
pub struct BenchmarkReport {
    pub memories: usize,
    pub recalls: usize,
    pub mean_latency_ms: f64,
    pub within_target: bool,
}

impl Output for BenchmarkReport {
    fn write_human<W: std::io::Write>(&self, mut writer: W) -> anyhow::Result<()> {
        let verdict = if self.within_target { "PASS".green() } else { "FAIL".red() };
        writeln!(
            writer,
            "benchmark: {} memories, {} recalls, mean={:.2}ms target=35ms [{}]",
            self.memories, self.recalls, self.mean_latency_ms, verdict
        )?;
        Ok(())
    }
}

const RECALL_LATENCY_TARGET_MS: f64 = 35.0;

/// Ingests `memories` synthetic records then issues `recalls` recalls,
/// reporting whether the mean recall latency stayed under the target.
pub async fn benchmark(hub: &MemoryHub, memories: usize, recalls: usize) -> anyhow::Result<BenchmarkReport> {
    for i in 0..memories {
        let content = match i % 4 {
            0 => format!("task_id benchmark {i}"),
            1 => format!("Log: benchmark entry {i}"),
            2 => format!("archive note {i}"),
            _ => format!("benchmark memory {i}"),
        };
        let tags = if i % 4 == 2 {
            vec!["archive".to_string()]
        } else {
            vec!["benchmark".to_string()]
        };
        hub.remember(content, tags, String::new()).await?;
    }

    for _ in 0..recalls {
        hub.recall("benchmark", 10).await?;
    }

    let stats = hub.stats().await?;
    let mean = stats.recall_latency.mean_ms;

    Ok(BenchmarkReport {
        memories,
        recalls,
        mean_latency_ms: mean,
        within_target: mean < RECALL_LATENCY_TARGET_MS,
    })
}
