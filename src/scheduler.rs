//! Dispatch pass: score runnable nodes, pick an execution option, enqueue.
//!
//! # Scoring
//!
//! Under DAG-aware policies a runnable node scores
//! `alpha * remaining_critical_path + beta / (1 + slack) + gamma * age`,
//! where the remaining critical path is the longest chain of P50 estimates
//! through live descendants. FIFO policies score by age alone. Scores are
//! recomputed every tick; the critical-path recursion is memoized per
//! workflow per pass.
//!
//! # Admission
//!
//! Dispatch stops once the global count of Queued/Running nodes reaches
//! `max_in_flight_global`. Per-tier admission is advisory: a node whose
//! chosen tier has no free slot is skipped this pass and stays Runnable,
//! rather than being routed to a pricier tier it did not earn.
//!
//! # Escalation
//!
//! Only critical-path nodes may escalate, and only to the next affordable
//! option past the baseline: the candidate wins iff its estimated-completion
//! advantage per extra dollar clears the configured threshold.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use crossbeam_channel::Sender;

use crate::config::{SchedulerConfig, SchedulerPolicy, EMBED_PROVIDER, LLM_PROVIDER, LOCAL_PROVIDER};
use crate::controller::ControlState;
use crate::estimates::LatencyEstimateStore;
use crate::provider::{LatencyContext, QueuedAttempt, TierDirectory};
use crate::trace::{TraceKind, TraceWriter};
use crate::types::{attempt_key, ExecutionOption, Node, NodeId, NodeState, NodeType, ResourceClass, WorkflowId};
use crate::worker::LocalTask;
use crate::workflow::Workflow;

/// P50 estimate used before any measurement exists for a node's cheapest
/// option, and for local nodes with no preference list.
const DEFAULT_ESTIMATE_MS: f64 = 100.0;

/// Timeout applied to local cpu/io attempts.
const LOCAL_TIMEOUT_MS: u64 = 5_000;

/// Chunk-count estimate fed to similarity-search latency for local tasks.
const LOCAL_NUM_CHUNKS_EST: u32 = 50;

#[derive(Clone, Copy, Debug)]
struct ScoredNode {
    node_id: NodeId,
    workflow_id: WorkflowId,
    score: f64,
}

/// Scores runnable nodes and dispatches them to tier or local queues.
pub struct Scheduler<W: Write> {
    config: SchedulerConfig,
    tiers: Arc<TierDirectory>,
    estimates: Arc<LatencyEstimateStore>,
    cpu_queue: Sender<LocalTask>,
    io_queue: Sender<LocalTask>,
    trace: Arc<TraceWriter<W>>,
}

impl<W: Write> Scheduler<W> {
    pub fn new(
        config: SchedulerConfig,
        tiers: Arc<TierDirectory>,
        estimates: Arc<LatencyEstimateStore>,
        cpu_queue: Sender<LocalTask>,
        io_queue: Sender<LocalTask>,
        trace: Arc<TraceWriter<W>>,
    ) -> Self {
        Self {
            config,
            tiers,
            estimates,
            cpu_queue,
            io_queue,
            trace,
        }
    }

    /// P50 service-time estimate for a node on its cheapest option.
    fn node_estimate(&self, node: &Node) -> f64 {
        match node.preference_list.first() {
            Some(opt) => self.estimates.p50(node.kind, &opt.provider, opt.tier_id),
            None => DEFAULT_ESTIMATE_MS,
        }
    }

    /// Longest remaining chain of estimates from `id` through non-terminal
    /// descendants, memoized per dispatch pass.
    fn remaining_critical_path(
        &self,
        wf: &Workflow,
        id: NodeId,
        memo: &mut AHashMap<NodeId, f64>,
    ) -> f64 {
        if let Some(&v) = memo.get(&id) {
            return v;
        }
        let node = wf.node(id);
        let est = self.node_estimate(node);
        let mut max_child = 0.0f64;
        for &child in &node.children {
            if wf.node(child).state.is_terminal() {
                continue;
            }
            max_child = max_child.max(self.remaining_critical_path(wf, child, memo));
        }
        let total = est + max_child;
        memo.insert(id, total);
        total
    }

    fn score_nodes(&self, state: &ControlState, now_ms: f64) -> Vec<ScoredNode> {
        let fifo = self.config.disable_dag_priority
            || self.config.policy == SchedulerPolicy::FifoCheapest;

        let mut scored = Vec::new();
        for wf in state.workflows.values() {
            if wf.done() {
                continue;
            }
            let start_ms = state
                .workflow_start_ms
                .get(&wf.id())
                .copied()
                .unwrap_or(-1.0);
            let age_ms = if start_ms >= 0.0 { now_ms - start_ms } else { now_ms };

            let mut memo = AHashMap::new();
            for id in wf.runnable_nodes() {
                let score = if fifo {
                    age_ms
                } else {
                    let node = wf.node(id);
                    let rem_cp = self.remaining_critical_path(wf, id, &mut memo);
                    let slack = self.slack(wf, node, &mut memo);
                    self.config.alpha * rem_cp
                        + self.config.beta * (1.0 / (1.0 + slack))
                        + self.config.gamma * age_ms
                };
                scored.push(ScoredNode {
                    node_id: id,
                    workflow_id: wf.id(),
                    score,
                });
            }
        }
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    /// How much this node can be delayed before it gates its most urgent
    /// active child.
    fn slack(&self, wf: &Workflow, node: &Node, memo: &mut AHashMap<NodeId, f64>) -> f64 {
        let mut min_child_cp = f64::INFINITY;
        for &child in &node.children {
            if !wf.node(child).state.is_active() {
                continue;
            }
            min_child_cp = min_child_cp.min(self.remaining_critical_path(wf, child, memo));
        }
        if min_child_cp.is_finite() {
            (min_child_cp - self.node_estimate(node)).max(0.0)
        } else {
            0.0
        }
    }

    /// Pick an execution option for a provider-backed node, or `None` to
    /// skip the node this pass (over budget, or no free slot it is
    /// entitled to).
    fn select_option(
        &self,
        node: &Node,
        budget_left: f64,
        is_critical: bool,
    ) -> Option<ExecutionOption> {
        let affordable: Vec<&ExecutionOption> = node
            .preference_list
            .iter()
            .filter(|o| o.price_per_call <= budget_left)
            .collect();
        let baseline = *affordable.first()?;

        let escalation_active = !self.config.disable_escalation
            && !matches!(
                self.config.policy,
                SchedulerPolicy::FifoCheapest | SchedulerPolicy::DagCheapest
            );

        if escalation_active && is_critical {
            if let Some(&candidate) = affordable.get(1) {
                if let Some(cand_tier) = self.tiers.get(&candidate.provider, candidate.tier_id) {
                    let delta_cost = candidate.price_per_call - baseline.price_per_call;
                    if cand_tier.can_accept() && delta_cost > 0.0 {
                        let ect_cheap = self
                            .estimates
                            .queue_wait_p95(&baseline.provider, baseline.tier_id)
                            + self
                                .estimates
                                .p50(node.kind, &baseline.provider, baseline.tier_id);
                        let ect_fast = self
                            .estimates
                            .queue_wait_p95(&candidate.provider, candidate.tier_id)
                            + self
                                .estimates
                                .p50(node.kind, &candidate.provider, candidate.tier_id);
                        let benefit = ect_cheap - ect_fast;
                        if benefit / delta_cost >= self.config.escalation_benefit_cost_threshold {
                            return Some(candidate.clone());
                        }
                    }
                }
            }
        }

        let tier = self.tiers.get(&baseline.provider, baseline.tier_id)?;
        if tier.can_accept() {
            Some(baseline.clone())
        } else {
            None
        }
    }

    /// Routing disabled: first tier with a free slot whose provider serves
    /// the node's resource class.
    fn select_by_class(&self, class: ResourceClass) -> Option<ExecutionOption> {
        let wanted = match class {
            ResourceClass::Embed => EMBED_PROVIDER,
            ResourceClass::Llm => LLM_PROVIDER,
            _ => return None,
        };
        for tier in self.tiers.tiers() {
            if tier.provider() == wanted && tier.can_accept() {
                let cfg = tier.config();
                return Some(ExecutionOption {
                    provider: cfg.provider.clone(),
                    tier_id: cfg.tier_id,
                    price_per_call: cfg.price_per_call,
                    timeout_ms: cfg.default_timeout_ms,
                    max_retries: cfg.default_max_retries,
                });
            }
        }
        None
    }

    /// One dispatch pass over every active workflow. Returns the number of
    /// nodes dispatched.
    pub fn dispatch(
        &self,
        state: &mut ControlState,
        now_ms: f64,
        next_attempt_id: &AtomicU64,
        is_critical: fn(NodeType) -> bool,
    ) -> usize {
        let scored = self.score_nodes(state, now_ms);

        let mut in_flight: usize = state
            .workflows
            .values()
            .filter(|wf| !wf.done())
            .flat_map(|wf| wf.nodes())
            .filter(|n| matches!(n.state, NodeState::Queued | NodeState::Running))
            .count();

        let mut dispatched = 0;
        for sn in scored {
            if in_flight >= self.config.max_in_flight_global {
                break;
            }
            let Some(wf) = state.workflows.get(&sn.workflow_id) else {
                continue;
            };
            if wf.done() {
                continue;
            }
            let node = wf.node(sn.node_id);
            if node.state != NodeState::Runnable {
                continue;
            }

            let kind = node.kind;
            let class = node.resource_class;
            let output_size_est = node.output_size_est;

            if !class.is_provider_backed() {
                let mut ctx = LatencyContext::new(kind);
                ctx.pdf_size_est = output_size_est;
                ctx.num_chunks_est = LOCAL_NUM_CHUNKS_EST;
                let task = LocalTask {
                    node_id: sn.node_id,
                    workflow_id: sn.workflow_id,
                    node_type: kind,
                    resource_class: class,
                    latency_ctx: ctx,
                    timeout_ms: LOCAL_TIMEOUT_MS,
                    attempt_id: next_attempt_id.fetch_add(1, Ordering::Relaxed),
                    cancelled: None,
                };

                let wf = state.workflows.get_mut(&sn.workflow_id).expect("workflow");
                wf.mark_queued(sn.node_id);
                let queue = if class == ResourceClass::Cpu {
                    &self.cpu_queue
                } else {
                    &self.io_queue
                };
                let _ = queue.send(task);
                self.trace.emit(
                    TraceKind::NodeQueued,
                    now_ms,
                    sn.workflow_id,
                    sn.node_id,
                    LOCAL_PROVIDER,
                );
                self.note_dispatch(state, sn.workflow_id, sn.node_id, now_ms);
                in_flight += 1;
                dispatched += 1;
                continue;
            }

            let budget_left = self.config.budget_per_workflow
                - state.workflow_cost.get(&sn.workflow_id).copied().unwrap_or(0.0);

            let option = if self.config.enable_model_routing && !node.preference_list.is_empty() {
                self.select_option(node, budget_left, is_critical(kind))
            } else {
                self.select_by_class(class)
            };
            let Some(option) = option else {
                continue;
            };
            let Some(tier) = self.tiers.get(&option.provider, option.tier_id) else {
                continue;
            };
            if !tier.can_accept() {
                continue;
            }

            // A live flag for this slot means an attempt is already in
            // flight; leave the node alone.
            let key = attempt_key(sn.workflow_id, sn.node_id);
            if state.cancel_flags.get(&key).is_some_and(|v| !v.is_empty()) {
                continue;
            }
            let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
            state.cancel_flags.entry(key).or_default().push(Arc::clone(&flag));

            let mut ctx = LatencyContext::new(kind);
            ctx.token_length_est = output_size_est;
            let attempt = QueuedAttempt {
                node_id: sn.node_id,
                workflow_id: sn.workflow_id,
                node_type: kind,
                provider: option.provider.clone(),
                tier_id: option.tier_id,
                tokens_needed: 1.0,
                timeout_ms: option.timeout_ms,
                max_retries: option.max_retries,
                latency_ctx: ctx,
                attempt_id: next_attempt_id.fetch_add(1, Ordering::Relaxed),
                cancelled: Some(flag),
                enqueued_at: Instant::now(),
            };

            let wf = state.workflows.get_mut(&sn.workflow_id).expect("workflow");
            wf.mark_queued(sn.node_id);
            tier.enqueue(attempt);
            self.trace.emit(
                TraceKind::NodeQueued,
                now_ms,
                sn.workflow_id,
                sn.node_id,
                &format!("{}_{}", option.provider, option.tier_id),
            );
            self.note_dispatch(state, sn.workflow_id, sn.node_id, now_ms);
            in_flight += 1;
            dispatched += 1;
        }
        dispatched
    }

    fn note_dispatch(
        &self,
        state: &mut ControlState,
        wf_id: WorkflowId,
        node_id: NodeId,
        now_ms: f64,
    ) {
        let start = state.workflow_start_ms.entry(wf_id).or_insert(-1.0);
        if *start < 0.0 {
            *start = now_ms;
        }
        state
            .attempt_start
            .insert(attempt_key(wf_id, node_id), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, WorkloadParams};
    use crate::controller::{on_critical_path, ControlState};
    use crossbeam_channel::unbounded;

    struct Rig {
        scheduler: Scheduler<Vec<u8>>,
        state: ControlState,
        cpu_rx: crossbeam_channel::Receiver<LocalTask>,
        io_rx: crossbeam_channel::Receiver<LocalTask>,
        estimates: Arc<LatencyEstimateStore>,
        tiers: Arc<TierDirectory>,
        next_attempt_id: AtomicU64,
    }

    fn rig_with(config: SchedulerConfig, workflow_count: u32) -> Rig {
        let provider_config = Arc::new(ProviderConfig::default());
        let tiers = Arc::new(TierDirectory::new(&provider_config));
        let estimates = Arc::new(LatencyEstimateStore::default());
        let (cpu_tx, cpu_rx) = unbounded();
        let (io_tx, io_rx) = unbounded();
        let trace = Arc::new(TraceWriter::new(Vec::new()).unwrap());
        let scheduler = Scheduler::new(
            config,
            Arc::clone(&tiers),
            Arc::clone(&estimates),
            cpu_tx,
            io_tx,
            trace,
        );

        let params = WorkloadParams {
            pdfs: 1,
            subqueries_per_iter: 1,
            max_iters: 2,
            seed: 1,
        };
        let workflows = (1..=workflow_count)
            .map(|id| Workflow::new(id, params, Arc::clone(&provider_config)))
            .collect();
        Rig {
            scheduler,
            state: ControlState::new(workflows),
            cpu_rx,
            io_rx,
            estimates,
            tiers,
            next_attempt_id: AtomicU64::new(1),
        }
    }

    fn dispatch(rig: &mut Rig, now_ms: f64) -> usize {
        rig.scheduler.dispatch(
            &mut rig.state,
            now_ms,
            &rig.next_attempt_id,
            on_critical_path,
        )
    }

    #[test]
    fn initial_plan_dispatches_to_cheapest_llm_tier() {
        let mut rig = rig_with(
            SchedulerConfig {
                enable_model_routing: true,
                ..SchedulerConfig::default()
            },
            1,
        );
        assert_eq!(dispatch(&mut rig, 0.0), 1);

        let wf = rig.state.workflows.get(&1).unwrap();
        let plan = wf.nodes().find(|n| n.kind == NodeType::Plan).unwrap();
        assert_eq!(plan.state, NodeState::Queued);
        let tier0 = rig.tiers.get(LLM_PROVIDER, 0).unwrap();
        assert_eq!(tier0.queued_len(), 1);
        // Flag allocated, start time recorded.
        assert!(rig.state.cancel_flags.contains_key(&attempt_key(1, plan.id)));
        assert_eq!(rig.state.workflow_start_ms[&1], 0.0);
    }

    #[test]
    fn redispatch_of_queued_node_is_skipped() {
        let mut rig = rig_with(
            SchedulerConfig {
                enable_model_routing: true,
                ..SchedulerConfig::default()
            },
            1,
        );
        assert_eq!(dispatch(&mut rig, 0.0), 1);
        assert_eq!(dispatch(&mut rig, 10.0), 0);
    }

    #[test]
    fn zero_budget_blocks_provider_dispatch() {
        let mut rig = rig_with(
            SchedulerConfig {
                enable_model_routing: true,
                budget_per_workflow: 0.0,
                ..SchedulerConfig::default()
            },
            2,
        );
        assert_eq!(dispatch(&mut rig, 0.0), 0);
        for wf in rig.state.workflows.values() {
            assert!(wf
                .nodes()
                .all(|n| n.state == NodeState::Runnable || n.state == NodeState::WaitingDeps));
        }
        assert!(rig.state.cancel_flags.is_empty());
    }

    #[test]
    fn admission_cap_bounds_dispatch() {
        let mut rig = rig_with(
            SchedulerConfig {
                enable_model_routing: true,
                max_in_flight_global: 2,
                ..SchedulerConfig::default()
            },
            5,
        );
        assert_eq!(dispatch(&mut rig, 0.0), 2);
    }

    #[test]
    fn local_nodes_go_to_their_resource_queue() {
        let mut rig = rig_with(SchedulerConfig::default(), 1);
        // Succeed the plan so the pdf chain materializes.
        {
            let wf = rig.state.workflows.get_mut(&1).unwrap();
            let plan = wf.runnable_nodes()[0];
            wf.mark_queued(plan);
            wf.mark_succeeded(plan);
        }
        let n = dispatch(&mut rig, 0.0);
        assert!(n >= 1);
        // LoadPDF is io-bound.
        let task = rig.io_rx.try_recv().expect("io task");
        assert_eq!(task.node_type, NodeType::LoadPdf);
        assert_eq!(task.latency_ctx.num_chunks_est, LOCAL_NUM_CHUNKS_EST);
        assert!(rig.cpu_rx.try_recv().is_err());
    }

    #[test]
    fn cheapest_policy_waits_instead_of_upgrading() {
        let mut rig = rig_with(
            SchedulerConfig {
                policy: SchedulerPolicy::DagCheapest,
                enable_model_routing: true,
                ..SchedulerConfig::default()
            },
            1,
        );
        // Saturate the cheap llm tier's execution slots.
        let tier0 = Arc::clone(rig.tiers.get(LLM_PROVIDER, 0).unwrap());
        for i in 0..2 {
            tier0.enqueue(crate::provider::QueuedAttempt {
                node_id: 100 + i,
                workflow_id: 99,
                node_type: NodeType::Plan,
                provider: LLM_PROVIDER.to_string(),
                tier_id: 0,
                tokens_needed: 0.0,
                timeout_ms: 1_000,
                max_retries: 0,
                latency_ctx: LatencyContext::new(NodeType::Plan),
                attempt_id: 1_000 + i,
                cancelled: None,
                enqueued_at: Instant::now(),
            });
            tier0.try_dequeue().unwrap();
        }
        assert!(!tier0.can_accept());

        assert_eq!(dispatch(&mut rig, 0.0), 0);
        let tier1 = rig.tiers.get(LLM_PROVIDER, 1).unwrap();
        assert_eq!(tier1.queued_len(), 0);
    }

    #[test]
    fn escalation_upgrades_critical_nodes_when_benefit_justifies_cost() {
        let mut rig = rig_with(
            SchedulerConfig {
                policy: SchedulerPolicy::Full,
                enable_model_routing: true,
                escalation_benefit_cost_threshold: 0.5,
                ..SchedulerConfig::default()
            },
            1,
        );
        // The cheap tier looks slow and congested; the fast tier is idle.
        for _ in 0..20 {
            rig.estimates.record_service(NodeType::Plan, LLM_PROVIDER, 0, 2_000.0);
            rig.estimates.record_service(NodeType::Plan, LLM_PROVIDER, 1, 100.0);
            rig.estimates.record_queue_wait(LLM_PROVIDER, 0, 500.0);
            rig.estimates.record_queue_wait(LLM_PROVIDER, 1, 10.0);
        }
        assert_eq!(dispatch(&mut rig, 0.0), 1);
        // benefit = (500 + 2000) - (10 + 100) = 2390; delta_cost = 0.04;
        // ratio is far above the threshold, so the Plan lands on tier 1.
        let tier1 = rig.tiers.get(LLM_PROVIDER, 1).unwrap();
        assert_eq!(tier1.queued_len(), 1);
    }

    #[test]
    fn escalation_skips_non_critical_nodes() {
        let mut rig = rig_with(
            SchedulerConfig {
                policy: SchedulerPolicy::Full,
                enable_model_routing: true,
                ..SchedulerConfig::default()
            },
            1,
        );
        // Expand, then drive the chain so the Embed node is runnable.
        {
            let wf = rig.state.workflows.get_mut(&1).unwrap();
            let plan = wf.runnable_nodes()[0];
            wf.mark_queued(plan);
            wf.mark_succeeded(plan);
            for kind in [NodeType::LoadPdf, NodeType::Chunk] {
                let id = wf
                    .nodes()
                    .find(|n| n.kind == kind)
                    .map(|n| n.id)
                    .unwrap();
                wf.mark_queued(id);
                wf.mark_succeeded(id);
            }
        }
        // Make the cheap embed tier look terrible.
        for _ in 0..20 {
            rig.estimates.record_service(NodeType::Embed, EMBED_PROVIDER, 0, 5_000.0);
            rig.estimates.record_queue_wait(EMBED_PROVIDER, 0, 1_000.0);
        }
        assert!(dispatch(&mut rig, 0.0) >= 1);
        // Embed is off the critical path, so it stays on the cheap tier.
        let tier0 = rig.tiers.get(EMBED_PROVIDER, 0).unwrap();
        let tier1 = rig.tiers.get(EMBED_PROVIDER, 1).unwrap();
        assert_eq!(tier0.queued_len(), 1);
        assert_eq!(tier1.queued_len(), 0);
    }

    #[test]
    fn fifo_scores_by_age_alone() {
        let mut rig = rig_with(
            SchedulerConfig {
                policy: SchedulerPolicy::FifoCheapest,
                enable_model_routing: true,
                max_in_flight_global: 1,
                ..SchedulerConfig::default()
            },
            2,
        );
        // Workflow 2 started earlier, so it is older and goes first.
        rig.state.workflow_start_ms.insert(1, 500.0);
        rig.state.workflow_start_ms.insert(2, 0.0);
        assert_eq!(dispatch(&mut rig, 1_000.0), 1);
        let wf2 = rig.state.workflows.get(&2).unwrap();
        assert!(wf2.nodes().any(|n| n.state == NodeState::Queued));
        let wf1 = rig.state.workflows.get(&1).unwrap();
        assert!(wf1.nodes().all(|n| n.state != NodeState::Queued));
    }

    #[test]
    fn dag_priority_prefers_longer_remaining_chains() {
        let rig = rig_with(SchedulerConfig::default(), 1);
        let wf = rig.state.workflows.get(&1).unwrap();
        let plan = wf.runnable_nodes()[0];
        let mut memo = AHashMap::new();
        let cp = rig
            .scheduler
            .remaining_critical_path(wf, plan, &mut memo);
        // A lone plan with no children scores exactly its own estimate.
        assert_eq!(cp, DEFAULT_ESTIMATE_MS);
    }

    #[test]
    fn routing_disabled_uses_class_matched_tier() {
        let mut rig = rig_with(SchedulerConfig::default(), 1);
        assert_eq!(dispatch(&mut rig, 0.0), 1);
        let tier0 = rig.tiers.get(LLM_PROVIDER, 0).unwrap();
        assert_eq!(tier0.queued_len(), 1);
    }
}
