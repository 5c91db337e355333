//! Workflow DAG: lazy iteration expansion and the node state machine.
//!
//! # Graph Shape
//!
//! ```text
//! Plan(k) ─┬─> LoadPDF(p) ─> Chunk(p) ─> Embed(p) ─┬─> SimSearch(p,q) ─> Extract(p,q) ─┐
//!          │   (one chain per pdf p)               │   (one pair per subquery q)       │
//!          │                                       └─> ...                             │
//!          └──────────────(no subqueries)──────────────────────────┐                   │
//!                                                                  ▼                   ▼
//!                                                             Aggregate(k) ──> DecideNext(k)
//!                                                                                      │
//!                                                              Continue: ──> Plan(k+1) ┘
//! ```
//!
//! Iterations materialize lazily: a succeeded Plan expands its iteration,
//! a succeeded DecideNext either stops the workflow or creates the next
//! Plan. Edges always point from an existing node to a newly created one,
//! so the graph is acyclic by construction.
//!
//! # Correctness Invariants
//!
//! - Expansion is guarded per (workflow, iteration): re-entry is a no-op.
//! - Terminal states are absorbing; `done` is monotonic.
//! - A node is Runnable iff every parent is Succeeded.
//! - The continue/stop decision is a pure function of (coverage,
//!   confidence, seed, workflow id, iteration).
//!
//! All mutation happens on the controller thread under its workflows
//! mutex; this type itself is not synchronized.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::config::{ProviderConfig, WorkloadParams, EMBED_PROVIDER, LLM_PROVIDER};
use crate::rng::mix64;
use crate::types::{ExecutionOption, Node, NodeId, NodeState, NodeType, ResourceClass, WorkflowId};

/// Outcome of the stop heuristic at the end of an iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecideAction {
    Stop,
    Continue,
}

/// One workflow: an identified DAG of typed nodes plus iteration state.
pub struct Workflow {
    id: WorkflowId,
    params: WorkloadParams,
    provider_config: Arc<ProviderConfig>,

    nodes: AHashMap<NodeId, Node>,
    next_node_id: NodeId,

    done: bool,
    completed_iters: u32,
    stop_iter: Option<u32>,
}

impl Workflow {
    /// Seed a workflow with a single runnable Plan at iteration 0.
    ///
    /// # Panics
    ///
    /// Panics on a degenerate workload (zero pdfs or iterations); callers
    /// validate configuration before constructing workflows.
    pub fn new(id: WorkflowId, params: WorkloadParams, provider_config: Arc<ProviderConfig>) -> Self {
        assert!(params.pdfs > 0, "workload pdfs must be > 0");
        assert!(params.max_iters > 0, "workload max_iters must be > 0");
        let mut wf = Self {
            id,
            params,
            provider_config,
            nodes: AHashMap::new(),
            next_node_id: 1,
            done: false,
            completed_iters: 0,
            stop_iter: None,
        };

        let mut plan = Node::new(wf.alloc_node_id(), id, NodeType::Plan, 0);
        plan.state = NodeState::Runnable; // root has no deps
        plan.output_size_est =
            (200 + 10 * wf.params.subqueries_per_iter + 3 * wf.params.pdfs) as u64;
        wf.populate_preferences(&mut plan);
        wf.insert_node(plan);
        wf
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn params(&self) -> &WorkloadParams {
        &self.params
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn completed_iters(&self) -> u32 {
        self.completed_iters
    }

    pub fn stop_iter(&self) -> Option<u32> {
        self.stop_iter
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Look up a node that must exist.
    ///
    /// # Panics
    ///
    /// Panics on an unknown id; node ids never leave the workflow they
    /// were allocated in.
    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("unknown node id {id}"))
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Runnable node ids in ascending id order.
    pub fn runnable_nodes(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Runnable)
            .map(|n| n.id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Recompute Runnable/WaitingDeps for every non-terminal, non-active
    /// node. Returns the ids that newly became runnable. Idempotent.
    pub fn refresh_runnable(&mut self) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        let mut newly = Vec::new();
        for id in ids {
            let state = self.nodes[&id].state;
            if state.is_terminal() || state == NodeState::Queued || state == NodeState::Running {
                continue;
            }
            let ready = self.deps_satisfied(id);
            let node = self.nodes.get_mut(&id).expect("node exists");
            if ready && node.state != NodeState::Runnable {
                node.state = NodeState::Runnable;
                newly.push(id);
            } else if !ready && node.state != NodeState::WaitingDeps {
                node.state = NodeState::WaitingDeps;
            }
        }
        newly.sort_unstable();
        newly
    }

    pub fn mark_queued(&mut self, id: NodeId) {
        self.set_state(id, NodeState::Queued);
    }

    pub fn mark_running(&mut self, id: NodeId) {
        self.set_state(id, NodeState::Running);
    }

    /// Mark a node succeeded, expanding the DAG when the node is a Plan or
    /// DecideNext. Returns the ids that newly became runnable.
    pub fn mark_succeeded(&mut self, id: NodeId) -> Vec<NodeId> {
        let (kind, iter) = {
            let n = self.node(id);
            (n.kind, n.iter)
        };

        self.set_state(id, NodeState::Succeeded);

        match kind {
            NodeType::Plan => self.expand_iteration(id),
            NodeType::DecideNext => {
                self.on_decide_next(id);
                self.completed_iters = self.completed_iters.max(iter + 1);
            }
            _ => {}
        }

        self.refresh_runnable()
    }

    pub fn mark_failed(&mut self, id: NodeId) -> Vec<NodeId> {
        self.set_state(id, NodeState::Failed);
        self.refresh_runnable()
    }

    /// Best-effort cancellation: no-op on already-terminal nodes.
    pub fn cancel(&mut self, id: NodeId) -> Vec<NodeId> {
        if self.node(id).state.is_terminal() {
            return Vec::new();
        }
        self.set_state(id, NodeState::Cancelled);
        self.refresh_runnable()
    }

    fn deps_satisfied(&self, id: NodeId) -> bool {
        self.nodes[&id]
            .deps
            .iter()
            .all(|d| self.nodes[d].state == NodeState::Succeeded)
    }

    /// Apply a state transition, enforcing the legal-transition table.
    ///
    /// # Panics
    ///
    /// Panics on an illegal transition; that is a bug in the caller, not a
    /// workload condition.
    fn set_state(&mut self, id: NodeId, next: NodeState) {
        let current = self.node(id).state;
        if current == next {
            return;
        }
        assert!(
            !current.is_terminal(),
            "node {id}: terminal state {current:?} cannot transition to {next:?}"
        );

        match next {
            NodeState::WaitingDeps => assert!(
                !self.deps_satisfied(id),
                "node {id}: cannot wait on satisfied deps"
            ),
            NodeState::Runnable => assert!(
                self.deps_satisfied(id),
                "node {id}: runnable before deps satisfied"
            ),
            NodeState::Queued => assert!(
                current == NodeState::Runnable,
                "node {id}: Queued only from Runnable, was {current:?}"
            ),
            NodeState::Running => assert!(
                matches!(current, NodeState::Queued | NodeState::Runnable),
                "node {id}: Running only from Queued/Runnable, was {current:?}"
            ),
            NodeState::Succeeded | NodeState::Failed => assert!(
                current.is_active(),
                "node {id}: {next:?} only from an active state, was {current:?}"
            ),
            NodeState::Cancelled => {} // any non-terminal
        }

        self.nodes.get_mut(&id).expect("node exists").state = next;
    }

    // ------------------------------------------------------------------
    // DAG generation
    // ------------------------------------------------------------------

    fn alloc_node_id(&mut self) -> NodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    fn insert_node(&mut self, node: Node) -> NodeId {
        let id = node.id;
        let prev = self.nodes.insert(id, node);
        assert!(prev.is_none(), "duplicate node id {id}");
        id
    }

    /// Add a dependency edge `from -> to`. Edges may only target nodes
    /// created after their source, which both rejects back edges and keeps
    /// the graph acyclic.
    fn add_edge(&mut self, from: NodeId, to: NodeId) {
        assert!(from < to, "edge {from} -> {to} targets an earlier node");
        self.nodes
            .get_mut(&from)
            .expect("edge source exists")
            .children
            .push(to);
        self.nodes
            .get_mut(&to)
            .expect("edge target exists")
            .deps
            .push(from);
    }

    fn make_node(&mut self, kind: NodeType, iter: u32) -> Node {
        let mut n = Node::new(self.alloc_node_id(), self.id, kind, iter);
        self.populate_preferences(&mut n);
        n
    }

    fn populate_preferences(&self, node: &mut Node) {
        let wanted = match node.resource_class {
            ResourceClass::Embed => EMBED_PROVIDER,
            ResourceClass::Llm => LLM_PROVIDER,
            _ => return,
        };
        node.preference_list = self
            .provider_config
            .tiers
            .iter()
            .filter(|t| t.provider == wanted)
            .map(|t| ExecutionOption {
                provider: t.provider.clone(),
                tier_id: t.tier_id,
                price_per_call: t.price_per_call,
                timeout_ms: t.default_timeout_ms,
                max_retries: t.default_max_retries,
            })
            .collect();
        node.preference_list
            .sort_by(|a, b| a.price_per_call.total_cmp(&b.price_per_call));
    }

    /// Deterministic evidence estimate for an ExtractEvidence node,
    /// derived from (seed, workflow, iteration, pdf, subquery) so the stop
    /// decision never depends on provider results.
    fn evidence_estimate(&self, iter: u32, pdf: u32, subquery: u32) -> u32 {
        let h = mix64(
            self.params.seed
                ^ ((self.id as u64) << 32)
                ^ (iter as u64).wrapping_mul(0x9e3779b97f4a7c15)
                ^ ((pdf as u64) << 8)
                ^ subquery as u64,
        );
        (h % 4) as u32 // 0..=3
    }

    /// Materialize iteration `k` below a succeeded Plan. Guarded: a second
    /// call for the same iteration is a no-op.
    fn expand_iteration(&mut self, plan_id: NodeId) {
        let iter = self.node(plan_id).iter;
        if iter >= self.params.max_iters {
            return;
        }
        // Replayed success: the iteration already exists.
        if self
            .nodes
            .values()
            .any(|n| n.kind == NodeType::Aggregate && n.iter == iter)
        {
            return;
        }

        let subqueries = self.params.subqueries_per_iter;
        let mut extract_ids =
            Vec::with_capacity((self.params.pdfs * subqueries.max(1)) as usize);

        for p in 0..self.params.pdfs {
            let mut load = self.make_node(NodeType::LoadPdf, iter);
            load.pdf_idx = Some(p);
            let load_id = self.insert_node(load);

            let mut chunk = self.make_node(NodeType::Chunk, iter);
            chunk.pdf_idx = Some(p);
            let chunk_id = self.insert_node(chunk);

            let mut embed = self.make_node(NodeType::Embed, iter);
            embed.pdf_idx = Some(p);
            let embed_id = self.insert_node(embed);

            self.add_edge(plan_id, load_id);
            self.add_edge(load_id, chunk_id);
            self.add_edge(chunk_id, embed_id);

            for q in 0..subqueries {
                let mut search = self.make_node(NodeType::SimilaritySearch, iter);
                search.pdf_idx = Some(p);
                search.subquery_idx = Some(q);
                let search_id = self.insert_node(search);

                let mut extract = self.make_node(NodeType::ExtractEvidence, iter);
                extract.pdf_idx = Some(p);
                extract.subquery_idx = Some(q);
                extract.evidence_count_est = self.evidence_estimate(iter, p, q);
                let extract_id = self.insert_node(extract);

                self.add_edge(embed_id, search_id);
                self.add_edge(search_id, extract_id);
                extract_ids.push(extract_id);
            }
        }

        let agg = self.make_node(NodeType::Aggregate, iter);
        let agg_id = self.insert_node(agg);
        let decide = self.make_node(NodeType::DecideNext, iter);
        let decide_id = self.insert_node(decide);

        if extract_ids.is_empty() {
            // No subqueries: the iteration yields no evidence but still
            // reaches its aggregate/decide pair.
            self.add_edge(plan_id, agg_id);
        } else {
            for ex in extract_ids {
                self.add_edge(ex, agg_id);
            }
        }
        self.add_edge(agg_id, decide_id);
    }

    fn iter_evidence_total(&self, iter: u32) -> u32 {
        self.nodes
            .values()
            .filter(|n| n.iter == iter && n.kind == NodeType::ExtractEvidence)
            .map(|n| n.evidence_count_est)
            .sum()
    }

    fn iter_pdf_coverage(&self, iter: u32) -> u32 {
        let covered: AHashSet<u32> = self
            .nodes
            .values()
            .filter(|n| {
                n.iter == iter && n.kind == NodeType::ExtractEvidence && n.evidence_count_est > 0
            })
            .filter_map(|n| n.pdf_idx)
            .collect();
        covered.len() as u32
    }

    /// Pure stop heuristic for iteration `k`: stop on the iteration cap,
    /// on strong coverage and confidence, or on a borderline signal with a
    /// deterministic tie-breaker.
    pub fn compute_decide_action(&self, iter: u32) -> DecideAction {
        if iter + 1 >= self.params.max_iters {
            return DecideAction::Stop;
        }

        let total = self.iter_evidence_total(iter);
        let covered = self.iter_pdf_coverage(iter);

        let coverage = covered as f64 / self.params.pdfs.max(1) as f64;
        let denom = (self.params.pdfs.max(1) * self.params.subqueries_per_iter.max(1) * 2) as f64;
        let confidence = (total as f64 / denom).min(1.0);

        let h = mix64(
            self.params.seed
                ^ ((self.id as u64) << 1)
                ^ (iter as u64).wrapping_mul(0xd1b54a32d192ed03),
        );
        let u01 = (h & 0xffff) as f64 / 65535.0;

        let strong = coverage >= 0.60 && confidence >= 0.50;
        let borderline = coverage >= 0.45 && confidence >= 0.35 && u01 > 0.70;
        if strong || borderline {
            DecideAction::Stop
        } else {
            DecideAction::Continue
        }
    }

    fn on_decide_next(&mut self, decide_id: NodeId) {
        let iter = self.node(decide_id).iter;
        match self.compute_decide_action(iter) {
            DecideAction::Stop => {
                self.done = true;
                self.stop_iter = Some(iter);
                self.prune_after_stop(iter);
            }
            DecideAction::Continue => {
                let next_iter = iter + 1;
                let mut plan = self.make_node(NodeType::Plan, next_iter);
                plan.output_size_est = (220
                    + 15 * self.params.subqueries_per_iter
                    + 4 * self.params.pdfs) as u64;
                let plan_id = self.insert_node(plan);
                self.add_edge(decide_id, plan_id);
            }
        }
    }

    /// Cancel every non-terminal node past the stop iteration.
    pub fn prune_after_stop(&mut self, stop_iter: u32) {
        for node in self.nodes.values_mut() {
            if !node.state.is_terminal() && node.iter > stop_iter {
                node.state = NodeState::Cancelled;
            }
        }
        self.refresh_runnable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(
        id: WorkflowId,
        pdfs: u32,
        subqueries: u32,
        max_iters: u32,
        seed: u64,
    ) -> Workflow {
        let params = WorkloadParams {
            pdfs,
            subqueries_per_iter: subqueries,
            max_iters,
            seed,
        };
        Workflow::new(id, params, Arc::new(ProviderConfig::default()))
    }

    /// Drive every runnable node to success until the workflow finishes.
    fn run_instant_success(wf: &mut Workflow) {
        let mut guard = 0;
        while !wf.done() {
            let runnable = wf.runnable_nodes();
            assert!(!runnable.is_empty(), "live workflow with nothing runnable");
            for id in runnable {
                if wf.node(id).state == NodeState::Runnable {
                    wf.mark_queued(id);
                    wf.mark_succeeded(id);
                }
            }
            guard += 1;
            assert!(guard < 10_000, "workflow failed to converge");
        }
    }

    #[test]
    fn single_iteration_no_subqueries_builds_six_nodes() {
        let mut wf = make(1, 1, 0, 1, 1);
        assert_eq!(wf.node_count(), 1);
        run_instant_success(&mut wf);

        // Plan + LoadPDF + Chunk + Embed + Aggregate + DecideNext.
        assert_eq!(wf.node_count(), 6);
        assert!(wf.done());
        assert_eq!(wf.stop_iter(), Some(0));
        assert_eq!(wf.completed_iters(), 1);
        // With no subqueries the Embed leaf is off the Aggregate path and
        // may still be live when the stop decision lands; nothing gets
        // cancelled either way.
        assert!(wf
            .nodes()
            .all(|n| n.state != NodeState::Cancelled && n.state != NodeState::Failed));
        assert_eq!(
            wf.nodes()
                .filter(|n| n.kind == NodeType::DecideNext)
                .map(|n| n.state)
                .next(),
            Some(NodeState::Succeeded)
        );
    }

    #[test]
    fn expansion_creates_full_retrieval_graph() {
        let mut wf = make(1, 2, 1, 2, 1);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);

        let count = |kind: NodeType| wf.nodes().filter(|n| n.kind == kind).count();
        assert_eq!(count(NodeType::LoadPdf), 2);
        assert_eq!(count(NodeType::Chunk), 2);
        assert_eq!(count(NodeType::Embed), 2);
        assert_eq!(count(NodeType::SimilaritySearch), 2);
        assert_eq!(count(NodeType::ExtractEvidence), 2);
        assert_eq!(count(NodeType::Aggregate), 1);
        assert_eq!(count(NodeType::DecideNext), 1);

        run_instant_success(&mut wf);
        if wf.stop_iter() == Some(0) {
            // Stopped at iteration 0: nothing beyond it may be live.
            assert!(wf
                .nodes()
                .filter(|n| n.iter > 0)
                .all(|n| n.state == NodeState::Cancelled));
        } else {
            // Continued: a second Plan and its iteration were created.
            assert!(wf
                .nodes()
                .any(|n| n.kind == NodeType::Plan && n.iter == 1));
        }
    }

    #[test]
    fn expansion_is_guarded_per_iteration() {
        let mut wf = make(1, 2, 2, 3, 7);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);
        let count = wf.node_count();

        // Replayed expansion for the same iteration changes nothing.
        wf.expand_iteration(plan);
        assert_eq!(wf.node_count(), count);
    }

    #[test]
    fn refresh_runnable_is_idempotent() {
        let mut wf = make(1, 2, 1, 2, 1);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);

        let snapshot: Vec<(NodeId, NodeState)> = {
            let mut v: Vec<_> = wf.nodes().map(|n| (n.id, n.state)).collect();
            v.sort_unstable_by_key(|(id, _)| *id);
            v
        };
        let newly = wf.refresh_runnable();
        assert!(newly.is_empty());
        let mut after: Vec<_> = wf.nodes().map(|n| (n.id, n.state)).collect();
        after.sort_unstable_by_key(|(id, _)| *id);
        assert_eq!(snapshot, after);
    }

    #[test]
    fn decide_action_is_pure() {
        let wf = make(3, 4, 2, 5, 42);
        let first = wf.compute_decide_action(0);
        for _ in 0..10 {
            assert_eq!(wf.compute_decide_action(0), first);
        }
    }

    #[test]
    fn no_evidence_continues_until_iteration_cap() {
        // With zero subqueries there is never any evidence, so the
        // workflow runs all iterations and stops on the cap.
        let mut wf = make(1, 1, 0, 3, 1);
        run_instant_success(&mut wf);
        assert_eq!(wf.stop_iter(), Some(2));
        assert_eq!(wf.completed_iters(), 3);
    }

    #[test]
    fn prune_cancels_everything_past_stop_iter() {
        let mut wf = make(1, 1, 0, 3, 1);
        // Finish iteration 0 and let DecideNext create Plan(1).
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);
        run_nodes_of_iter(&mut wf, 0);
        assert!(wf.nodes().any(|n| n.iter == 1));

        wf.prune_after_stop(0);
        assert!(wf
            .nodes()
            .filter(|n| n.iter > 0)
            .all(|n| n.state == NodeState::Cancelled));
    }

    fn run_nodes_of_iter(wf: &mut Workflow, iter: u32) {
        loop {
            let runnable: Vec<NodeId> = wf
                .runnable_nodes()
                .into_iter()
                .filter(|id| wf.node(*id).iter == iter)
                .collect();
            if runnable.is_empty() {
                break;
            }
            for id in runnable {
                wf.mark_queued(id);
                wf.mark_succeeded(id);
            }
        }
    }

    #[test]
    fn preference_lists_sort_ascending_by_price() {
        let wf = make(1, 1, 1, 1, 1);
        for node in wf.nodes() {
            let prices: Vec<f64> = node
                .preference_list
                .iter()
                .map(|o| o.price_per_call)
                .collect();
            let mut sorted = prices.clone();
            sorted.sort_by(f64::total_cmp);
            assert_eq!(prices, sorted, "node {:?}", node.kind);
            if node.resource_class.is_provider_backed() {
                assert_eq!(node.preference_list.len(), 2);
            } else {
                assert!(node.preference_list.is_empty());
            }
        }
    }

    #[test]
    fn edges_always_point_to_later_nodes() {
        let mut wf = make(1, 3, 2, 2, 5);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);
        for node in wf.nodes() {
            for &child in &node.children {
                assert!(node.id < child);
            }
            for &dep in &node.deps {
                assert!(dep < node.id);
            }
        }
    }

    #[test]
    fn terminal_parents_behind_every_terminal_node() {
        let mut wf = make(1, 2, 1, 2, 9);
        run_instant_success(&mut wf);
        for node in wf.nodes().filter(|n| n.state == NodeState::Succeeded) {
            for dep in &node.deps {
                assert!(wf.node(*dep).state.is_terminal());
            }
        }
    }

    #[test]
    #[should_panic(expected = "Queued only from Runnable")]
    fn queued_requires_runnable() {
        let mut wf = make(1, 1, 1, 2, 1);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);
        // A WaitingDeps node cannot jump straight to Queued.
        let waiting = wf
            .nodes()
            .find(|n| n.state == NodeState::WaitingDeps)
            .map(|n| n.id)
            .expect("some node still waits on deps");
        wf.mark_queued(waiting);
    }

    #[test]
    #[should_panic(expected = "terminal state")]
    fn terminal_states_are_absorbing() {
        let mut wf = make(1, 1, 0, 1, 1);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);
        wf.mark_failed(plan);
    }

    #[test]
    fn cancel_is_a_noop_on_terminal_nodes() {
        let mut wf = make(1, 1, 0, 1, 1);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        wf.mark_succeeded(plan);
        wf.cancel(plan);
        assert_eq!(wf.node(plan).state, NodeState::Succeeded);
    }

    #[test]
    fn mark_succeeded_reports_newly_runnable_children() {
        let mut wf = make(1, 1, 0, 2, 1);
        let plan = wf.runnable_nodes()[0];
        wf.mark_queued(plan);
        let newly = wf.mark_succeeded(plan);
        // The pdf chain root becomes runnable once the plan succeeds.
        assert!(!newly.is_empty());
        for id in newly {
            assert_eq!(wf.node(id).state, NodeState::Runnable);
        }
    }
}
