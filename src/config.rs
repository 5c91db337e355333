//! Run configuration: latency distributions, provider tiers, workload
//! shape, and scheduler/controller knobs.
//!
//! The built-in provider table (two embed tiers, two llm tiers) and the
//! per-type latency parameters are plain data. Callers can replace them
//! wholesale; nothing in the simulator mutates configuration after
//! startup.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::types::NodeType;

/// Provider name serving `ResourceClass::Embed` nodes.
pub const EMBED_PROVIDER: &str = "embed_provider";
/// Provider name serving `ResourceClass::Llm` nodes.
pub const LLM_PROVIDER: &str = "llm_provider";
/// Provider name reported for local cpu/io attempts.
pub const LOCAL_PROVIDER: &str = "local";

/// Service-time distribution family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyDist {
    Lognormal,
    Gamma,
    Linear,
}

/// Distribution parameters for one node type.
///
/// `param1`/`param2` are (mu, sigma) for lognormal, (shape, scale) for
/// gamma, and (base_ms, coeff) for linear. The tail pair models occasional
/// per-type latency inflation such as cache misses.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LatencyParams {
    pub dist: LatencyDist,
    pub param1: f64,
    pub param2: f64,
    pub tail_multiplier: f64,
    pub tail_prob: f64,
}

impl LatencyParams {
    pub fn lognormal(mu: f64, sigma: f64) -> Self {
        Self {
            dist: LatencyDist::Lognormal,
            param1: mu,
            param2: sigma,
            tail_multiplier: 1.0,
            tail_prob: 0.0,
        }
    }

    pub fn gamma(shape: f64, scale: f64) -> Self {
        Self {
            dist: LatencyDist::Gamma,
            param1: shape,
            param2: scale,
            tail_multiplier: 1.0,
            tail_prob: 0.0,
        }
    }

    pub fn linear(base_ms: f64, coeff: f64) -> Self {
        Self {
            dist: LatencyDist::Linear,
            param1: base_ms,
            param2: coeff,
            tail_multiplier: 1.0,
            tail_prob: 0.0,
        }
    }

    pub fn with_tail(mut self, multiplier: f64, prob: f64) -> Self {
        self.tail_multiplier = multiplier;
        self.tail_prob = prob;
        self
    }
}

/// Per-type latency parameters with a fallback for unknown types.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LatencyConfig {
    by_type: AHashMap<NodeType, LatencyParams>,
    fallback: LatencyParams,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        let mut by_type = AHashMap::new();
        // LoadPDF: lognormal with an occasional cache-miss tail.
        by_type.insert(
            NodeType::LoadPdf,
            LatencyParams::lognormal(5.0, 0.8).with_tail(3.0, 0.1),
        );
        // Chunk: base + coeff * pdf_size, small jitter.
        by_type.insert(NodeType::Chunk, LatencyParams::linear(50.0, 0.5));
        // Embed: gamma with a moderate tail (mean = shape * scale).
        by_type.insert(
            NodeType::Embed,
            LatencyParams::gamma(4.0, 25.0).with_tail(2.0, 0.05),
        );
        // SimilaritySearch: base + coeff * num_chunks.
        by_type.insert(NodeType::SimilaritySearch, LatencyParams::linear(20.0, 2.0));
        // LLM-shaped work: lognormal, token-length dependent at sampling.
        let llm = LatencyParams::lognormal(6.0, 0.8);
        by_type.insert(NodeType::Plan, llm);
        by_type.insert(NodeType::ExtractEvidence, llm);
        by_type.insert(NodeType::Aggregate, llm);
        by_type.insert(NodeType::DecideNext, llm);

        Self {
            by_type,
            fallback: LatencyParams::lognormal(5.0, 0.8),
        }
    }
}

impl LatencyConfig {
    pub fn get(&self, kind: NodeType) -> &LatencyParams {
        self.by_type.get(&kind).unwrap_or(&self.fallback)
    }

    pub fn set(&mut self, kind: NodeType, params: LatencyParams) {
        self.by_type.insert(kind, params);
    }
}

/// One provider tier: token bucket, concurrency cap, pricing, and failure
/// injection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierConfig {
    pub provider: String,
    pub tier_id: u32,
    /// Token bucket refill rate.
    pub rate_per_sec: f64,
    /// Token bucket capacity.
    pub capacity: f64,
    /// Max concurrently executing attempts.
    pub concurrency_cap: usize,
    pub price_per_call: f64,
    /// Bernoulli transient failure probability per attempt.
    pub p_fail: f64,
    pub default_timeout_ms: u64,
    pub default_max_retries: u32,
}

/// Provider tiers plus the latency model. Immutable for the duration of a
/// run; preference lists are snapshots taken from this at node creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub tiers: Vec<TierConfig>,
    pub latency: LatencyConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let tiers = vec![
            // Embed: cheap and slow, then fast and pricier.
            TierConfig {
                provider: EMBED_PROVIDER.to_string(),
                tier_id: 0,
                rate_per_sec: 20.0,
                capacity: 50.0,
                concurrency_cap: 4,
                price_per_call: 0.0001,
                p_fail: 0.02,
                default_timeout_ms: 10_000,
                default_max_retries: 3,
            },
            TierConfig {
                provider: EMBED_PROVIDER.to_string(),
                tier_id: 1,
                rate_per_sec: 100.0,
                capacity: 200.0,
                concurrency_cap: 8,
                price_per_call: 0.0005,
                p_fail: 0.01,
                default_timeout_ms: 5_000,
                default_max_retries: 3,
            },
            // LLM: same shape, higher prices and tighter caps.
            TierConfig {
                provider: LLM_PROVIDER.to_string(),
                tier_id: 0,
                rate_per_sec: 5.0,
                capacity: 20.0,
                concurrency_cap: 2,
                price_per_call: 0.01,
                p_fail: 0.03,
                default_timeout_ms: 30_000,
                default_max_retries: 3,
            },
            TierConfig {
                provider: LLM_PROVIDER.to_string(),
                tier_id: 1,
                rate_per_sec: 20.0,
                capacity: 50.0,
                concurrency_cap: 4,
                price_per_call: 0.05,
                p_fail: 0.02,
                default_timeout_ms: 15_000,
                default_max_retries: 3,
            },
        ];
        Self {
            tiers,
            latency: LatencyConfig::default(),
        }
    }
}

/// Shape of one workflow's retrieval graph.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WorkloadParams {
    pub pdfs: u32,
    pub subqueries_per_iter: u32,
    pub max_iters: u32,
    pub seed: u64,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self {
            pdfs: 10,
            subqueries_per_iter: 4,
            max_iters: 3,
            seed: 1,
        }
    }
}

/// Scheduling policy under comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPolicy {
    /// Oldest workflow first, cheapest tier, no hedging or escalation.
    FifoCheapest,
    /// DAG-aware priority, cheapest tier only.
    DagCheapest,
    /// DAG-aware priority plus benefit/cost tier escalation.
    DagEscalation,
    /// Everything on: DAG priority, escalation, straggler hedging.
    Full,
}

impl SchedulerPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerPolicy::FifoCheapest => "fifo_cheapest",
            SchedulerPolicy::DagCheapest => "dag_cheapest",
            SchedulerPolicy::DagEscalation => "dag_escalation",
            SchedulerPolicy::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Result<Self, SimError> {
        match s {
            "fifo_cheapest" => Ok(SchedulerPolicy::FifoCheapest),
            "dag_cheapest" => Ok(SchedulerPolicy::DagCheapest),
            "dag_escalation" => Ok(SchedulerPolicy::DagEscalation),
            "full" => Ok(SchedulerPolicy::Full),
            other => Err(SimError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Knobs consumed by the dispatch pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub policy: SchedulerPolicy,
    pub disable_escalation: bool,
    pub disable_dag_priority: bool,
    pub enable_model_routing: bool,
    /// Global cap on nodes in {Queued, Running} across all workflows.
    pub max_in_flight_global: usize,
    pub budget_per_workflow: f64,
    pub escalation_benefit_cost_threshold: f64,
    /// Score weights: remaining critical path, slack, age.
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulerPolicy::Full,
            disable_escalation: false,
            disable_dag_priority: false,
            enable_model_routing: false,
            max_in_flight_global: 200,
            budget_per_workflow: 10.0,
            escalation_benefit_cost_threshold: 0.5,
            alpha: 1.0,
            beta: 0.5,
            gamma: 0.1,
        }
    }
}

/// Top-level run configuration, assembled by the CLI or by tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub workflows: u32,
    pub pdfs: u32,
    pub iters: u32,
    pub subqueries: u32,
    pub seed: u64,
    /// Divisor applied to simulated sleeps; higher runs faster in wall
    /// time while preserving relative durations.
    pub time_scale: u64,
    pub out_dir: String,

    pub policy: SchedulerPolicy,
    pub enable_model_routing: bool,
    pub disable_hedging: bool,
    pub disable_escalation: bool,
    pub disable_dag_priority: bool,

    pub scheduler_interval_ms: u64,
    pub straggler_stretch_threshold: f64,
    pub max_in_flight_global: usize,
    pub budget_per_workflow: f64,

    /// Workload-level heavy-tail injection applied by workers on top of
    /// the per-type tail model.
    pub heavy_tail_prob: f64,
    pub heavy_tail_multiplier: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workflows: 100,
            pdfs: 10,
            iters: 3,
            subqueries: 4,
            seed: 1,
            time_scale: 50,
            out_dir: "out".to_string(),
            policy: SchedulerPolicy::Full,
            enable_model_routing: false,
            disable_hedging: false,
            disable_escalation: false,
            disable_dag_priority: false,
            scheduler_interval_ms: 50,
            straggler_stretch_threshold: 1.5,
            max_in_flight_global: 200,
            budget_per_workflow: 10.0,
            heavy_tail_prob: 0.02,
            heavy_tail_multiplier: 50.0,
        }
    }
}

impl ControllerConfig {
    /// Validate before setup. Rejects degenerate values that would hang or
    /// divide by zero instead of producing a misleading run.
    pub fn validate(&self) -> Result<(), SimError> {
        fn require_pos(v: u64, name: &str) -> Result<(), SimError> {
            if v == 0 {
                return Err(SimError::InvalidConfig(format!("{name} must be > 0")));
            }
            Ok(())
        }
        require_pos(self.workflows as u64, "workflows")?;
        require_pos(self.pdfs as u64, "pdfs")?;
        require_pos(self.iters as u64, "iters")?;
        require_pos(self.time_scale, "time_scale")?;
        if self.out_dir.is_empty() {
            return Err(SimError::InvalidConfig("out_dir must be non-empty".into()));
        }
        if self.heavy_tail_prob < 0.0 || self.heavy_tail_prob > 1.0 {
            return Err(SimError::InvalidConfig(
                "heavy_tail_prob must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Derive the dispatch-pass view of this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            policy: self.policy,
            disable_escalation: self.disable_escalation,
            disable_dag_priority: self.disable_dag_priority,
            enable_model_routing: self.enable_model_routing,
            max_in_flight_global: self.max_in_flight_global,
            budget_per_workflow: self.budget_per_workflow,
            ..SchedulerConfig::default()
        }
    }

    /// Derive one workflow's workload shape.
    pub fn workload_params(&self) -> WorkloadParams {
        WorkloadParams {
            pdfs: self.pdfs,
            subqueries_per_iter: self.subqueries,
            max_iters: self.iters,
            seed: self.seed,
        }
    }
}
