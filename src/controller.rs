//! Run controller: owns the workflows, the worker threads, and the
//! scheduling loop.
//!
//! # Thread Set
//!
//! ```text
//!                 ┌────────────────────────────────────────────────────┐
//!                 │                    Controller                      │
//!                 │                                                    │
//!  scheduler ─────┼─► dispatch pass ──► tier queues ──► tier workers   │
//!  tick (50ms)    │        │            cpu/io queues ─► local workers │
//!                 │        ▼                    │                      │
//!  straggler ─────┼─► hedge launch              ▼                      │
//!  monitor (100ms)│                      result channel                │
//!                 │                             │                      │
//!                 │   result loop ◄─────────────┘                      │
//!                 │   (apply to DAG, expand, record latency)           │
//!                 └────────────────────────────────────────────────────┘
//! ```
//!
//! All workflow mutation is serialized under one mutex ([`ControlState`]),
//! taken by the scheduler tick, the monitor scan, and the result loop.
//! Workers never touch it; they only observe cancellation flags and push
//! results.
//!
//! # Completion
//!
//! The run ends when every workflow is either done or permanently blocked
//! behind a Failed node (failures are not retried, so a Failed node simply
//! blocks its descendants). A live workflow with no active nodes and no
//! failure to blame trips the deadlock sanity check and aborts the run:
//! that would be a bug in DAG expansion, not a workload outcome.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{unbounded, Receiver};

use crate::config::{ControllerConfig, ProviderConfig, SchedulerPolicy};
use crate::error::SimError;
use crate::estimates::LatencyEstimateStore;
use crate::metrics::{self, SummaryMetrics, TierStats, WorkflowMetrics};
use crate::provider::{LatencyContext, LatencySampler, QueuedAttempt, TierDirectory};
use crate::rng::SeededRng;
use crate::scheduler::Scheduler;
use crate::trace::{TraceKind, TraceWriter};
use crate::types::{attempt_key, AttemptError, AttemptResult, NodeState, NodeType, ResourceClass, WorkflowId};
use crate::worker::{self, HeavyTail, WorkerShared};
use crate::workflow::Workflow;

/// Interval between straggler-monitor scans.
const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// Sleep between result-drain waves.
const RESULT_WAVE_SLEEP: Duration = Duration::from_millis(10);

/// Critical-path predicate: the node types whose latency gates workflow
/// completion. Used by escalation and hedging.
pub fn on_critical_path(kind: NodeType) -> bool {
    matches!(
        kind,
        NodeType::Plan | NodeType::Aggregate | NodeType::DecideNext | NodeType::ExtractEvidence
    )
}

/// Per-workflow bookkeeping that outlives individual results.
#[derive(Clone, Debug, Default)]
pub struct WorkflowCounters {
    pub cancellations: u32,
    pub hedges_launched: u32,
    pub wasted_ms: f64,
    /// Set exactly once, at the done transition.
    pub makespan_ms: Option<f64>,
}

/// Everything guarded by the controller's workflows mutex. The scheduler
/// dispatch pass, the monitor scan, and the result loop each take the
/// whole lock, which serializes DAG mutation and keeps node state
/// transitions linearizable.
pub struct ControlState {
    pub workflows: AHashMap<WorkflowId, Workflow>,
    /// Simulated ms of first dispatch; negative until then.
    pub workflow_start_ms: AHashMap<WorkflowId, f64>,
    pub workflow_cost: AHashMap<WorkflowId, f64>,
    /// Wall instant of the most recent dispatch per attempt slot.
    pub attempt_start: AHashMap<u64, Instant>,
    /// Cancellation flags for in-flight attempts of a slot. A hedge
    /// appends a second flag; success sets them all.
    pub cancel_flags: AHashMap<u64, Vec<Arc<AtomicBool>>>,
    /// Slots that have already been hedged; one hedge per node, ever.
    pub hedged: AHashSet<u64>,
    pub counters: AHashMap<WorkflowId, WorkflowCounters>,
    pub workflows_done: usize,
}

impl ControlState {
    pub fn new(workflows: Vec<Workflow>) -> Self {
        let mut state = Self {
            workflows: AHashMap::new(),
            workflow_start_ms: AHashMap::new(),
            workflow_cost: AHashMap::new(),
            attempt_start: AHashMap::new(),
            cancel_flags: AHashMap::new(),
            hedged: AHashSet::new(),
            counters: AHashMap::new(),
            workflows_done: 0,
        };
        for wf in workflows {
            let id = wf.id();
            state.workflow_start_ms.insert(id, -1.0);
            state.workflow_cost.insert(id, 0.0);
            state.counters.insert(id, WorkflowCounters::default());
            state.workflows.insert(id, wf);
        }
        state
    }
}

/// Clonable handle to stop a run from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of a completed run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub summary: SummaryMetrics,
    pub workflows: Vec<WorkflowMetrics>,
    pub tiers: Vec<TierStats>,
    /// Workflows that reached done (as opposed to blocking on a failure
    /// or being cut off by an external shutdown).
    pub completed: usize,
}

/// Owns workflows, providers, and the worker thread team for one run.
pub struct Controller {
    config: ControllerConfig,
    tiers: Arc<TierDirectory>,
    estimates: Arc<LatencyEstimateStore>,
    sampler: Arc<LatencySampler>,
    trace: Arc<TraceWriter<File>>,
    state: Arc<Mutex<ControlState>>,
    shutdown: Arc<AtomicBool>,
    next_attempt_id: Arc<AtomicU64>,
}

impl Controller {
    /// Build a controller with the built-in provider table.
    pub fn new(config: ControllerConfig) -> Result<Self, SimError> {
        Self::with_provider_config(config, ProviderConfig::default())
    }

    /// Build a controller with an injected provider table; tests use this
    /// to pin failure rates and latency shapes.
    pub fn with_provider_config(
        config: ControllerConfig,
        provider_config: ProviderConfig,
    ) -> Result<Self, SimError> {
        config.validate()?;

        let trace_path = Path::new(&config.out_dir).join("trace.json");
        let trace_file =
            File::create(&trace_path).map_err(|e| SimError::io(trace_path.clone(), e))?;
        let trace = Arc::new(
            TraceWriter::new(trace_file).map_err(|e| SimError::io(trace_path, e))?,
        );

        let provider_config = Arc::new(provider_config);
        let tiers = Arc::new(TierDirectory::new(&provider_config));
        let sampler = Arc::new(LatencySampler::new(provider_config.latency.clone()));

        let workload = config.workload_params();
        let workflows: Vec<Workflow> = (1..=config.workflows)
            .map(|id| Workflow::new(id, workload, Arc::clone(&provider_config)))
            .collect();

        Ok(Self {
            config,
            tiers,
            estimates: Arc::new(LatencyEstimateStore::default()),
            sampler,
            trace,
            state: Arc::new(Mutex::new(ControlState::new(workflows))),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_attempt_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Execute the simulation to completion (or external shutdown) and
    /// write the output artifacts.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        let run_start = Instant::now();
        let time_scale = self.config.time_scale;

        // Seed the trace with the initially runnable roots.
        {
            let state = self.state.lock().expect("workflows mutex poisoned");
            for wf in state.workflows.values() {
                for id in wf.runnable_nodes() {
                    self.trace.emit(TraceKind::NodeRunnable, 0.0, wf.id(), id, "");
                }
            }
        }

        let (result_tx, result_rx) = unbounded::<AttemptResult>();
        let (cpu_tx, cpu_rx) = unbounded();
        let (io_tx, io_rx) = unbounded();

        let heavy_tail = HeavyTail {
            prob: self.config.heavy_tail_prob,
            multiplier: self.config.heavy_tail_multiplier,
        };
        let shared = WorkerShared {
            sampler: Arc::clone(&self.sampler),
            estimates: Arc::clone(&self.estimates),
            results: result_tx,
            trace: Arc::clone(&self.trace),
            run_start,
            time_scale,
            shutdown: Arc::clone(&self.shutdown),
            heavy_tail,
        };

        // One worker per concurrency slot per tier, plus the local pools.
        let mut worker_threads = Vec::new();
        let mut lane = 0u64;
        for tier in self.tiers.tiers() {
            for _ in 0..tier.config().concurrency_cap {
                let tier = Arc::clone(tier);
                let rng = SeededRng::fork(self.config.seed, lane);
                let shared = shared.clone();
                worker_threads.push(std::thread::spawn(move || {
                    worker::tier_worker_loop(tier, rng, shared);
                }));
                lane += 1;
            }
        }
        for _ in 0..4 {
            let rx = cpu_rx.clone();
            let rng = SeededRng::fork(self.config.seed, lane);
            let shared = shared.clone();
            worker_threads.push(std::thread::spawn(move || {
                worker::local_worker_loop(rx, ResourceClass::Cpu, rng, shared);
            }));
            lane += 1;
        }
        for _ in 0..2 {
            let rx = io_rx.clone();
            let rng = SeededRng::fork(self.config.seed, lane);
            let shared = shared.clone();
            worker_threads.push(std::thread::spawn(move || {
                worker::local_worker_loop(rx, ResourceClass::Io, rng, shared);
            }));
            lane += 1;
        }

        let scheduler_thread = {
            let scheduler = Scheduler::new(
                self.config.scheduler_config(),
                Arc::clone(&self.tiers),
                Arc::clone(&self.estimates),
                cpu_tx,
                io_tx,
                Arc::clone(&self.trace),
            );
            let state = Arc::clone(&self.state);
            let shutdown = Arc::clone(&self.shutdown);
            let next_attempt_id = Arc::clone(&self.next_attempt_id);
            let interval = Duration::from_millis(self.config.scheduler_interval_ms);
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    let now_ms = worker::sim_now_ms(run_start, time_scale);
                    {
                        let mut state = state.lock().expect("workflows mutex poisoned");
                        scheduler.dispatch(&mut state, now_ms, &next_attempt_id, on_critical_path);
                    }
                    std::thread::sleep(interval);
                }
            })
        };

        let monitor_thread = {
            let hedging_active = self.config.policy == SchedulerPolicy::Full
                && !self.config.disable_hedging;
            let state = Arc::clone(&self.state);
            let shutdown = Arc::clone(&self.shutdown);
            let tiers = Arc::clone(&self.tiers);
            let estimates = Arc::clone(&self.estimates);
            let trace = Arc::clone(&self.trace);
            let next_attempt_id = Arc::clone(&self.next_attempt_id);
            let threshold = self.config.straggler_stretch_threshold;
            std::thread::spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    if hedging_active {
                        let now_ms = worker::sim_now_ms(run_start, time_scale);
                        let mut state = state.lock().expect("workflows mutex poisoned");
                        monitor_pass(
                            &mut state,
                            &tiers,
                            &estimates,
                            &trace,
                            &next_attempt_id,
                            now_ms,
                            time_scale,
                            threshold,
                        );
                    }
                    std::thread::sleep(MONITOR_INTERVAL);
                }
            })
        };

        // Result loop on this thread.
        let loop_outcome = self.result_loop(&result_rx, run_start);

        self.shutdown.store(true, Ordering::Release);
        scheduler_thread.join().expect("scheduler thread panicked");
        monitor_thread.join().expect("monitor thread panicked");
        for th in worker_threads {
            th.join().expect("worker thread panicked");
        }

        let report = self.assemble_report(run_start);
        self.trace
            .finish()
            .map_err(|e| SimError::io(Path::new(&self.config.out_dir).join("trace.json"), e))?;
        self.write_outputs(&report)?;

        loop_outcome?;
        Ok(report)
    }

    /// Drain results until every workflow settles or shutdown is
    /// requested.
    fn result_loop(
        &self,
        results: &Receiver<AttemptResult>,
        run_start: Instant,
    ) -> Result<(), SimError> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(());
            }
            while let Ok(res) = results.try_recv() {
                self.apply_result(res, run_start);
            }

            // Completion / deadlock check, only meaningful once the
            // channel is drained: node states cannot change under us
            // because workers never mutate them.
            {
                let state = self.state.lock().expect("workflows mutex poisoned");
                let mut settled = true;
                for wf in state.workflows.values() {
                    if wf.done() {
                        continue;
                    }
                    if wf.nodes().any(|n| n.state.is_active()) {
                        settled = false;
                        continue;
                    }
                    if wf.nodes().any(|n| n.state == NodeState::Failed) {
                        // Blocked behind an unretried failure; terminal
                        // for this run.
                        continue;
                    }
                    return Err(SimError::StalledWorkflow(wf.id()));
                }
                if settled {
                    return Ok(());
                }
            }
            std::thread::sleep(RESULT_WAVE_SLEEP);
        }
    }

    /// Apply one attempt result to its workflow under the state lock.
    fn apply_result(&self, res: AttemptResult, run_start: Instant) {
        let mut state = self.state.lock().expect("workflows mutex poisoned");
        let state = &mut *state;
        let now_ms = worker::sim_now_ms(run_start, self.config.time_scale);

        let Some(wf) = state.workflows.get_mut(&res.workflow_id) else {
            return;
        };

        // Count cancellations and their burned time even when the node
        // already settled (the common case for hedge losers).
        if res.error == Some(AttemptError::Cancelled) {
            let counters = state.counters.entry(res.workflow_id).or_default();
            counters.cancellations += 1;
            counters.wasted_ms += res.duration_ms;
        }

        if wf.done() {
            return;
        }
        let node_state = wf.node(res.node_id).state;
        if node_state.is_terminal() {
            return;
        }

        let kind = wf.node(res.node_id).kind;
        self.estimates
            .record_service(kind, &res.provider, res.tier_id, res.duration_ms);
        *state.workflow_cost.entry(res.workflow_id).or_insert(0.0) += res.cost;

        let key = attempt_key(res.workflow_id, res.node_id);
        let newly_runnable = match res.error {
            None => {
                // First success wins: cancel every sibling attempt.
                if let Some(flags) = state.cancel_flags.get(&key) {
                    for flag in flags {
                        flag.store(true, Ordering::Release);
                    }
                }
                let newly = wf.mark_succeeded(res.node_id);
                self.trace
                    .emit(TraceKind::AttemptFinish, now_ms, res.workflow_id, res.node_id, "ok");
                newly
            }
            Some(AttemptError::Cancelled) => {
                let newly = wf.cancel(res.node_id);
                self.trace.emit(
                    TraceKind::AttemptCancel,
                    now_ms,
                    res.workflow_id,
                    res.node_id,
                    "cancelled",
                );
                newly
            }
            Some(err) => {
                let newly = wf.mark_failed(res.node_id);
                self.trace.emit(
                    TraceKind::AttemptFail,
                    now_ms,
                    res.workflow_id,
                    res.node_id,
                    err.as_str(),
                );
                newly
            }
        };
        for id in newly_runnable {
            self.trace
                .emit(TraceKind::NodeRunnable, now_ms, res.workflow_id, id, "");
        }

        state.attempt_start.remove(&key);
        if wf.node(res.node_id).state.is_terminal() {
            // Workers still holding flag clones keep them alive via Arc.
            state.cancel_flags.remove(&key);
        }

        if wf.done() {
            state.workflows_done += 1;
            let start_ms = state
                .workflow_start_ms
                .get(&res.workflow_id)
                .copied()
                .unwrap_or(-1.0);
            let makespan = if start_ms >= 0.0 { now_ms - start_ms } else { now_ms };
            state
                .counters
                .entry(res.workflow_id)
                .or_default()
                .makespan_ms = Some(makespan);
            self.trace
                .emit(TraceKind::WorkflowDone, now_ms, res.workflow_id, 0, "");
        }
    }

    fn assemble_report(&self, run_start: Instant) -> RunReport {
        let state = self.state.lock().expect("workflows mutex poisoned");
        let wall_ms = run_start.elapsed().as_secs_f64() * 1_000.0;

        let mut workflows: Vec<WorkflowMetrics> = Vec::with_capacity(state.counters.len());
        for (&wf_id, counters) in &state.counters {
            let Some(makespan) = counters.makespan_ms else {
                continue; // never completed
            };
            workflows.push(WorkflowMetrics {
                workflow_id: wf_id,
                makespan_ms: makespan,
                cost: state.workflow_cost.get(&wf_id).copied().unwrap_or(0.0),
                retries: 0,
                cancellations: counters.cancellations,
                hedges_launched: counters.hedges_launched,
                wasted_ms: counters.wasted_ms,
            });
        }
        workflows.sort_unstable_by_key(|m| m.workflow_id);

        let tiers = self
            .tiers
            .tiers()
            .iter()
            .map(|tier| {
                let busy = tier.busy_wall_ms();
                let cap = tier.config().concurrency_cap as f64;
                TierStats {
                    provider: tier.provider().to_string(),
                    tier_id: tier.tier_id(),
                    utilization: if wall_ms > 0.0 { busy / (wall_ms * cap) } else { 0.0 },
                    queue_wait_p95_ms: self
                        .estimates
                        .queue_wait_p95(tier.provider(), tier.tier_id()),
                    in_flight_avg: if wall_ms > 0.0 { busy / wall_ms } else { 0.0 },
                }
            })
            .collect();

        RunReport {
            summary: metrics::summarize(&workflows),
            workflows,
            tiers,
            completed: state.workflows_done,
        }
    }

    fn write_outputs(&self, report: &RunReport) -> Result<(), SimError> {
        let out_dir = Path::new(&self.config.out_dir);
        metrics::write_workflows_csv(out_dir, &report.workflows)?;
        metrics::write_tiers_csv(out_dir, &report.tiers)?;
        metrics::write_summary_csv(out_dir, &report.summary)?;
        Ok(())
    }
}

/// One straggler scan: find a queued critical-path node whose observed
/// runtime stretches past the P95 estimate, and launch a single hedge on
/// its second-cheapest option. At most one hedge per pass, one per node
/// over its lifetime.
#[allow(clippy::too_many_arguments)]
fn monitor_pass(
    state: &mut ControlState,
    tiers: &TierDirectory,
    estimates: &LatencyEstimateStore,
    trace: &TraceWriter<File>,
    next_attempt_id: &AtomicU64,
    now_ms: f64,
    time_scale: u64,
    stretch_threshold: f64,
) {
    let mut candidate = None;
    'scan: for wf in state.workflows.values() {
        if wf.done() {
            continue;
        }
        for node in wf.nodes() {
            if node.state != NodeState::Queued || !on_critical_path(node.kind) {
                continue;
            }
            let key = attempt_key(wf.id(), node.id);
            if state.hedged.contains(&key) {
                continue;
            }
            let Some(started) = state.attempt_start.get(&key) else {
                continue;
            };
            if node.preference_list.len() < 2 {
                continue;
            }
            let pref = &node.preference_list[0];
            let est_p95 = estimates.p95(node.kind, &pref.provider, pref.tier_id);
            if est_p95 <= 0.0 {
                continue;
            }
            let runtime_ms = started.elapsed().as_secs_f64() * 1_000.0 * time_scale as f64;
            if runtime_ms / est_p95 > stretch_threshold {
                let hedge_opt = node.preference_list[1].clone();
                candidate = Some((wf.id(), node.id, node.kind, node.output_size_est, hedge_opt));
                break 'scan;
            }
        }
    }

    let Some((wf_id, node_id, kind, output_size_est, opt)) = candidate else {
        return;
    };
    let Some(tier) = tiers.get(&opt.provider, opt.tier_id) else {
        return;
    };
    if !tier.can_accept() {
        return;
    }

    let key = attempt_key(wf_id, node_id);
    let flag = Arc::new(AtomicBool::new(false));
    state.cancel_flags.entry(key).or_default().push(Arc::clone(&flag));
    state.hedged.insert(key);
    state.counters.entry(wf_id).or_default().hedges_launched += 1;

    let mut ctx = LatencyContext::new(kind);
    ctx.token_length_est = output_size_est;
    tier.enqueue(QueuedAttempt {
        node_id,
        workflow_id: wf_id,
        node_type: kind,
        provider: opt.provider.clone(),
        tier_id: opt.tier_id,
        tokens_needed: 1.0,
        timeout_ms: opt.timeout_ms,
        max_retries: opt.max_retries,
        latency_ctx: ctx,
        attempt_id: next_attempt_id.fetch_add(1, Ordering::Relaxed),
        cancelled: Some(flag),
        enqueued_at: Instant::now(),
    });
    trace.emit(
        TraceKind::HedgeLaunched,
        now_ms,
        wf_id,
        node_id,
        &format!("{}_{}", opt.provider, opt.tier_id),
    );
}
