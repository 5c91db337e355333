//! Core identifiers and the typed node model for workflow DAGs.
//!
//! # Why Typed Nodes
//!
//! Every unit of work in a workflow is a [`Node`] with a fixed [`NodeType`].
//! Typed nodes (rather than boxed closures) keep the graph inspectable: the
//! scheduler can score pending work, the straggler monitor can reason about
//! expected service times per type, and tests can assert on graph shape.
//!
//! # State Machine
//!
//! ```text
//! WaitingDeps ──> Runnable ──> Queued ──> Running ──┬──> Succeeded
//!                     │           │          │      ├──> Failed
//!                     └───────────┴──────────┘      └──> Cancelled
//! ```
//!
//! Terminal states are absorbing. `Cancelled` is reachable from any
//! non-terminal state (best-effort pruning).

use serde::{Deserialize, Serialize};

/// Workflow identifier, unique within a run.
pub type WorkflowId = u32;

/// Node identifier, unique within a workflow.
pub type NodeId = u64;

/// Attempt identifier, unique across the whole run.
pub type AttemptId = u64;

/// Composite key identifying the in-flight attempt slot for a node.
///
/// Workflow ids fit in 32 bits and node ids stay well below 2^32 in
/// practice, so the pair packs into one u64 for map keys.
#[inline]
pub fn attempt_key(workflow_id: WorkflowId, node_id: NodeId) -> u64 {
    ((workflow_id as u64) << 32) | node_id
}

/// The eight node types of the mocked retrieval graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Plan,
    LoadPdf,
    Chunk,
    Embed,
    SimilaritySearch,
    ExtractEvidence,
    Aggregate,
    DecideNext,
}

impl NodeType {
    /// Resource class a node of this type executes on.
    pub fn resource_class(self) -> ResourceClass {
        match self {
            NodeType::LoadPdf => ResourceClass::Io,
            NodeType::Chunk => ResourceClass::Cpu,
            NodeType::Embed => ResourceClass::Embed,
            NodeType::SimilaritySearch => ResourceClass::Cpu,
            NodeType::ExtractEvidence => ResourceClass::Llm,
            NodeType::Plan => ResourceClass::Llm,
            NodeType::Aggregate => ResourceClass::Cpu,
            NodeType::DecideNext => ResourceClass::Llm,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Plan => "Plan",
            NodeType::LoadPdf => "LoadPDF",
            NodeType::Chunk => "Chunk",
            NodeType::Embed => "Embed",
            NodeType::SimilaritySearch => "SimilaritySearch",
            NodeType::ExtractEvidence => "ExtractEvidence",
            NodeType::Aggregate => "Aggregate",
            NodeType::DecideNext => "DecideNext",
        }
    }
}

/// Execution substrate a node runs on.
///
/// `Cpu` and `Io` map to local worker pools; `Embed` and `Llm` map to
/// provider tiers with pricing, rate limits, and failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceClass {
    Cpu,
    Io,
    Embed,
    Llm,
}

impl ResourceClass {
    /// Stable ordinal, used as the tier id for local attempts.
    pub fn ordinal(self) -> u32 {
        match self {
            ResourceClass::Cpu => 0,
            ResourceClass::Io => 1,
            ResourceClass::Embed => 2,
            ResourceClass::Llm => 3,
        }
    }

    /// Whether attempts of this class go to a provider tier.
    pub fn is_provider_backed(self) -> bool {
        matches!(self, ResourceClass::Embed | ResourceClass::Llm)
    }
}

/// Lifecycle state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    WaitingDeps,
    Runnable,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl NodeState {
    /// Terminal states are absorbing.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Cancelled
        )
    }

    /// Active states hold or are about to hold an execution slot.
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            NodeState::Runnable | NodeState::Queued | NodeState::Running
        )
    }
}

/// One way to execute a provider-backed node: a (provider, tier) pair with
/// its price and defaults. Preference lists hold these sorted ascending by
/// price, so position 0 is the cheapest and position 1 the hedge target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOption {
    pub provider: String,
    pub tier_id: u32,
    pub price_per_call: f64,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

/// A single unit of work in a workflow DAG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub workflow_id: WorkflowId,
    pub kind: NodeType,
    pub resource_class: ResourceClass,
    pub state: NodeState,

    /// Iteration index for multi-iteration workflows.
    pub iter: u32,

    /// Position within the mocked retrieval graph, where applicable.
    pub pdf_idx: Option<u32>,
    pub subquery_idx: Option<u32>,

    /// Dependency edges within the same workflow. Edges always point from a
    /// lower node id to a higher one, which keeps the graph acyclic by
    /// construction.
    pub deps: Vec<NodeId>,
    pub children: Vec<NodeId>,

    /// Execution options sorted ascending by price. Empty for local nodes.
    pub preference_list: Vec<ExecutionOption>,

    /// Deterministic estimates driving latency contexts and the stop
    /// decision, assigned at node creation.
    pub output_size_est: u64,
    pub evidence_count_est: u32,
}

impl Node {
    pub fn new(id: NodeId, workflow_id: WorkflowId, kind: NodeType, iter: u32) -> Self {
        Self {
            id,
            workflow_id,
            kind,
            resource_class: kind.resource_class(),
            state: NodeState::WaitingDeps,
            iter,
            pdf_idx: None,
            subquery_idx: None,
            deps: Vec::new(),
            children: Vec::new(),
            preference_list: Vec::new(),
            output_size_est: 0,
            evidence_count_est: 0,
        }
    }
}

/// Terminal disposition of an attempt that did not succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptError {
    Failed,
    Timeout,
    Cancelled,
}

impl AttemptError {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptError::Failed => "failed",
            AttemptError::Timeout => "timeout",
            AttemptError::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one dispatched attempt, produced by a worker and consumed by
/// the controller's result loop. Workers never report errors out of band;
/// every outcome, including cancellation, becomes one of these.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptResult {
    pub node_id: NodeId,
    pub workflow_id: WorkflowId,
    pub attempt_id: AttemptId,
    /// Simulated milliseconds the attempt occupied its execution slot.
    pub duration_ms: f64,
    pub cost: f64,
    pub provider: String,
    pub tier_id: u32,
    pub error: Option<AttemptError>,
}

impl AttemptResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
