//! Post-run metrics and CSV artifacts.
//!
//! Aggregation happens after workers join; nothing here is on a hot path.
//! The three CSV files mirror what the sweep tooling downstream expects:
//! per-workflow rows, per-tier rows, and a single summary row.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::types::WorkflowId;

/// Per-workflow outcome row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: WorkflowId,
    pub makespan_ms: f64,
    pub cost: f64,
    pub retries: u32,
    pub cancellations: u32,
    pub hedges_launched: u32,
    /// Simulated time burned by attempts whose result was discarded
    /// (hedge losers, post-prune stragglers).
    pub wasted_ms: f64,
}

/// Per-tier utilization row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierStats {
    pub provider: String,
    pub tier_id: u32,
    /// Busy time divided by wall time times the concurrency cap.
    pub utilization: f64,
    pub queue_wait_p95_ms: f64,
    /// Time-averaged number of executing attempts.
    pub in_flight_avg: f64,
}

/// Aggregate summary over completed workflows.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SummaryMetrics {
    pub makespan_mean_ms: f64,
    pub makespan_p50_ms: f64,
    pub makespan_p95_ms: f64,
    pub makespan_p99_ms: f64,
    pub cost_mean: f64,
    pub cost_p50: f64,
}

/// Summarize makespans and costs. Empty input yields a zeroed summary.
pub fn summarize(metrics: &[WorkflowMetrics]) -> SummaryMetrics {
    if metrics.is_empty() {
        return SummaryMetrics::default();
    }
    let mut makespans: Vec<f64> = metrics.iter().map(|m| m.makespan_ms).collect();
    let mut costs: Vec<f64> = metrics.iter().map(|m| m.cost).collect();
    makespans.sort_by(f64::total_cmp);
    costs.sort_by(f64::total_cmp);

    let n = makespans.len();
    let idx = |q: f64| ((q * n as f64) as usize).min(n - 1);
    SummaryMetrics {
        makespan_mean_ms: makespans.iter().sum::<f64>() / n as f64,
        makespan_p50_ms: makespans[idx(0.50)],
        makespan_p95_ms: makespans[idx(0.95)],
        makespan_p99_ms: makespans[idx(0.99)],
        cost_mean: costs.iter().sum::<f64>() / n as f64,
        cost_p50: costs[idx(0.50)],
    }
}

fn open_csv(out_dir: &Path, name: &str) -> Result<BufWriter<File>, SimError> {
    let path = out_dir.join(name);
    let file = File::create(&path).map_err(|e| SimError::io(path.clone(), e))?;
    Ok(BufWriter::new(file))
}

fn finish_csv(mut w: BufWriter<File>, out_dir: &Path, name: &str) -> Result<(), SimError> {
    w.flush().map_err(|e| SimError::io(out_dir.join(name), e))
}

pub fn write_workflows_csv(out_dir: &Path, rows: &[WorkflowMetrics]) -> Result<(), SimError> {
    let name = "workflows.csv";
    let mut w = open_csv(out_dir, name)?;
    let io_err = |e| SimError::io(out_dir.join(name), e);
    writeln!(
        w,
        "workflow_id,makespan_ms,cost,retries,cancellations,hedges_launched,wasted_ms"
    )
    .map_err(io_err)?;
    for m in rows {
        writeln!(
            w,
            "{},{},{},{},{},{},{}",
            m.workflow_id,
            m.makespan_ms,
            m.cost,
            m.retries,
            m.cancellations,
            m.hedges_launched,
            m.wasted_ms
        )
        .map_err(io_err)?;
    }
    finish_csv(w, out_dir, name)
}

pub fn write_tiers_csv(out_dir: &Path, rows: &[TierStats]) -> Result<(), SimError> {
    let name = "tiers.csv";
    let mut w = open_csv(out_dir, name)?;
    let io_err = |e| SimError::io(out_dir.join(name), e);
    writeln!(w, "provider,tier_id,utilization,queue_wait_p95_ms,in_flight_avg").map_err(io_err)?;
    for s in rows {
        writeln!(
            w,
            "{},{},{},{},{}",
            s.provider, s.tier_id, s.utilization, s.queue_wait_p95_ms, s.in_flight_avg
        )
        .map_err(io_err)?;
    }
    finish_csv(w, out_dir, name)
}

pub fn write_summary_csv(out_dir: &Path, summary: &SummaryMetrics) -> Result<(), SimError> {
    let name = "summary.csv";
    let mut w = open_csv(out_dir, name)?;
    let io_err = |e| SimError::io(out_dir.join(name), e);
    writeln!(
        w,
        "makespan_mean_ms,makespan_p50_ms,makespan_p95_ms,makespan_p99_ms,cost_mean,cost_p50"
    )
    .map_err(io_err)?;
    writeln!(
        w,
        "{},{},{},{},{},{}",
        summary.makespan_mean_ms,
        summary.makespan_p50_ms,
        summary.makespan_p95_ms,
        summary.makespan_p99_ms,
        summary.cost_mean,
        summary.cost_p50
    )
    .map_err(io_err)?;
    finish_csv(w, out_dir, name)
}
