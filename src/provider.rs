//! Mocked provider substrate: latency sampling and per-tier admission.
//!
//! A [`Tier`] is one (provider, tier id) pair with its own FIFO queue,
//! token bucket, and concurrency cap. Tiers never retry or reorder; all
//! policy lives in the scheduler and the controller. The [`LatencySampler`]
//! turns a node's latency context plus tier failure/timeout parameters
//! into a service-time outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::bucket::TokenBucket;
use crate::config::{LatencyConfig, LatencyDist, ProviderConfig, TierConfig};
use crate::rng::SeededRng;
use crate::types::{AttemptId, NodeId, NodeType, WorkflowId};

/// Node-type-specific inputs to service-time formulas.
#[derive(Clone, Copy, Debug)]
pub struct LatencyContext {
    pub node_type: NodeType,
    pub pdf_size_est: u64,
    pub num_chunks_est: u32,
    pub token_length_est: u64,
}

impl LatencyContext {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            pdf_size_est: 0,
            num_chunks_est: 0,
            token_length_est: 100,
        }
    }
}

/// Outcome of sampling one attempt.
#[derive(Clone, Copy, Debug, Default)]
pub struct LatencySample {
    pub service_time_ms: f64,
    pub failed: bool,
    pub timeout: bool,
}

/// Stateless sampler over a latency configuration. Callers pass their own
/// RNG so each worker thread keeps an independent stream.
pub struct LatencySampler {
    config: LatencyConfig,
}

impl LatencySampler {
    pub fn new(config: LatencyConfig) -> Self {
        Self { config }
    }

    /// Sample a raw service time for the context, before failure and
    /// timeout are applied. Always at least 1 ms.
    pub fn sample_service_time(&self, rng: &mut SeededRng, ctx: &LatencyContext) -> f64 {
        let params = self.config.get(ctx.node_type);
        let mut raw = match params.dist {
            LatencyDist::Lognormal => {
                let mut mu = params.param1;
                // Token-dependent LLM calls take longer to stream out.
                if matches!(
                    ctx.node_type,
                    NodeType::Plan | NodeType::ExtractEvidence | NodeType::DecideNext
                ) {
                    mu += 0.001 * ctx.token_length_est as f64;
                }
                rng.lognormal(mu, params.param2)
            }
            LatencyDist::Gamma => rng.gamma(params.param1, params.param2),
            LatencyDist::Linear => {
                let base = params.param1;
                let coeff = params.param2;
                let v = match ctx.node_type {
                    NodeType::Chunk => {
                        base + coeff * ctx.pdf_size_est as f64 + rng.uniform(-5.0, 5.0)
                    }
                    NodeType::SimilaritySearch => base + coeff * ctx.num_chunks_est as f64,
                    _ => base + rng.uniform(-2.0, 2.0),
                };
                v.max(1.0)
            }
        };

        if params.tail_prob > 0.0 {
            if rng.bernoulli(params.tail_prob) {
                raw *= params.tail_multiplier;
            }
        } else if params.tail_multiplier != 1.0 {
            // A multiplier with zero probability is treated as a constant
            // inflation factor.
            raw *= params.tail_multiplier;
        }
        raw.max(1.0)
    }

    /// Full attempt sampling: service time, transient failure, timeout
    /// clamping. A failed attempt is not additionally checked against the
    /// timeout.
    pub fn sample(
        &self,
        rng: &mut SeededRng,
        ctx: &LatencyContext,
        timeout_ms: u64,
        p_fail: f64,
    ) -> LatencySample {
        let mut out = LatencySample {
            service_time_ms: self.sample_service_time(rng, ctx),
            ..LatencySample::default()
        };
        if rng.bernoulli(p_fail) {
            out.failed = true;
            return out;
        }
        if timeout_ms > 0 && out.service_time_ms > timeout_ms as f64 {
            out.timeout = true;
            out.service_time_ms = timeout_ms as f64;
        }
        out
    }
}

/// Work item enqueued on a tier.
#[derive(Clone, Debug)]
pub struct QueuedAttempt {
    pub node_id: NodeId,
    pub workflow_id: WorkflowId,
    pub node_type: NodeType,
    pub provider: String,
    pub tier_id: u32,
    pub tokens_needed: f64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub latency_ctx: LatencyContext,
    pub attempt_id: AttemptId,
    /// Cooperative cancellation flag shared with the controller. Local
    /// attempts carry none.
    pub cancelled: Option<Arc<AtomicBool>>,
    /// Wall instant of enqueue, for queue-wait measurement.
    pub enqueued_at: Instant,
}

/// Bounded admission surface for one provider tier.
///
/// `in_flight` counts executing attempts and is the only shared counter
/// outside the queue lock; `try` dequeues refuse work while it is at the
/// concurrency cap, which is how the cap is enforced.
pub struct Tier {
    config: TierConfig,
    bucket: TokenBucket,
    queue: Mutex<std::collections::VecDeque<QueuedAttempt>>,
    cv: Condvar,
    in_flight: AtomicUsize,
    /// Accumulated execution wall time in microseconds, for utilization.
    busy_us: AtomicU64,
}

impl Tier {
    pub fn new(config: TierConfig) -> Self {
        let bucket = TokenBucket::new(config.rate_per_sec, config.capacity);
        Self {
            config,
            bucket,
            queue: Mutex::new(std::collections::VecDeque::new()),
            cv: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            busy_us: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    pub fn tier_id(&self) -> u32 {
        self.config.tier_id
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Advisory: whether the tier has a free execution slot. The scheduler
    /// uses this to avoid piling dispatch onto a saturated tier.
    pub fn can_accept(&self) -> bool {
        self.in_flight() < self.config.concurrency_cap
    }

    pub fn enqueue(&self, attempt: QueuedAttempt) {
        {
            let mut q = self.queue.lock().expect("Tier queue mutex poisoned");
            q.push_back(attempt);
        }
        self.cv.notify_one();
    }

    /// Pop the front attempt if one is queued and a slot is free,
    /// incrementing `in_flight`.
    pub fn try_dequeue(&self) -> Option<QueuedAttempt> {
        let mut q = self.queue.lock().expect("Tier queue mutex poisoned");
        if q.is_empty() || self.in_flight() >= self.config.concurrency_cap {
            return None;
        }
        let attempt = q.pop_front();
        if attempt.is_some() {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        attempt
    }

    /// Like [`Tier::try_dequeue`] but waits up to `timeout` for work and a
    /// free slot. Workers poll with a short timeout so they can observe
    /// the shutdown flag.
    pub fn timed_dequeue(&self, timeout: Duration) -> Option<QueuedAttempt> {
        let deadline = Instant::now() + timeout;
        let mut q = self.queue.lock().expect("Tier queue mutex poisoned");
        loop {
            if !q.is_empty() && self.in_flight() < self.config.concurrency_cap {
                let attempt = q.pop_front();
                if attempt.is_some() {
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                }
                return attempt;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _timeout) = self
                .cv
                .wait_timeout(q, deadline - now)
                .expect("Tier queue condvar poisoned");
            q = next;
        }
    }

    /// Block on the token bucket for this attempt's token cost.
    pub fn acquire_tokens(&self, attempt: &QueuedAttempt) {
        self.bucket.acquire(attempt.tokens_needed);
    }

    /// Release the execution slot and record its busy time.
    pub fn on_attempt_finish(&self, busy: Duration) {
        self.busy_us
            .fetch_add(busy.as_micros() as u64, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.cv.notify_one();
    }

    /// Total execution wall time accumulated so far.
    pub fn busy_wall_ms(&self) -> f64 {
        self.busy_us.load(Ordering::Relaxed) as f64 / 1_000.0
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().expect("Tier queue mutex poisoned").len()
    }
}

/// Immutable directory of all tiers for a run.
pub struct TierDirectory {
    tiers: Vec<Arc<Tier>>,
    index: AHashMap<(String, u32), usize>,
}

impl TierDirectory {
    pub fn new(config: &ProviderConfig) -> Self {
        let mut tiers = Vec::with_capacity(config.tiers.len());
        let mut index = AHashMap::new();
        for tc in &config.tiers {
            index.insert((tc.provider.clone(), tc.tier_id), tiers.len());
            tiers.push(Arc::new(Tier::new(tc.clone())));
        }
        Self { tiers, index }
    }

    pub fn get(&self, provider: &str, tier_id: u32) -> Option<&Arc<Tier>> {
        self.index
            .get(&(provider.to_string(), tier_id))
            .map(|&i| &self.tiers[i])
    }

    pub fn tiers(&self) -> &[Arc<Tier>] {
        &self.tiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LatencyParams, EMBED_PROVIDER};

    fn test_tier(cap: usize) -> Tier {
        Tier::new(TierConfig {
            provider: EMBED_PROVIDER.to_string(),
            tier_id: 0,
            rate_per_sec: 1_000.0,
            capacity: 1_000.0,
            concurrency_cap: cap,
            price_per_call: 0.001,
            p_fail: 0.0,
            default_timeout_ms: 1_000,
            default_max_retries: 3,
        })
    }

    fn test_attempt(node_id: NodeId) -> QueuedAttempt {
        QueuedAttempt {
            node_id,
            workflow_id: 1,
            node_type: NodeType::Embed,
            provider: EMBED_PROVIDER.to_string(),
            tier_id: 0,
            tokens_needed: 1.0,
            timeout_ms: 1_000,
            max_retries: 3,
            latency_ctx: LatencyContext::new(NodeType::Embed),
            attempt_id: node_id,
            cancelled: None,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn dequeue_preserves_fifo_order() {
        let tier = test_tier(8);
        for id in 1..=4 {
            tier.enqueue(test_attempt(id));
        }
        for expect in 1..=4 {
            let a = tier.try_dequeue().expect("attempt");
            assert_eq!(a.node_id, expect);
        }
        assert!(tier.try_dequeue().is_none());
    }

    #[test]
    fn concurrency_cap_gates_dequeue() {
        let tier = test_tier(2);
        for id in 1..=3 {
            tier.enqueue(test_attempt(id));
        }
        assert!(tier.try_dequeue().is_some());
        assert!(tier.try_dequeue().is_some());
        assert_eq!(tier.in_flight(), 2);
        assert!(!tier.can_accept());
        // Third attempt stays queued until a slot frees.
        assert!(tier.try_dequeue().is_none());
        tier.on_attempt_finish(Duration::from_millis(5));
        assert!(tier.can_accept());
        assert!(tier.try_dequeue().is_some());
    }

    #[test]
    fn timed_dequeue_times_out_when_empty() {
        let tier = test_tier(2);
        let start = Instant::now();
        assert!(tier.timed_dequeue(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn busy_time_accumulates() {
        let tier = test_tier(1);
        tier.enqueue(test_attempt(1));
        let _ = tier.try_dequeue().unwrap();
        tier.on_attempt_finish(Duration::from_millis(12));
        assert!(tier.busy_wall_ms() >= 12.0);
    }

    #[test]
    fn directory_indexes_by_provider_and_tier() {
        let cfg = ProviderConfig::default();
        let dir = TierDirectory::new(&cfg);
        assert_eq!(dir.tiers().len(), 4);
        assert!(dir.get(EMBED_PROVIDER, 0).is_some());
        assert!(dir.get(EMBED_PROVIDER, 7).is_none());
        assert!(dir.get("unknown", 0).is_none());
    }

    #[test]
    fn sampler_failure_short_circuits_timeout() {
        let sampler = LatencySampler::new(LatencyConfig::default());
        let mut rng = SeededRng::new(1);
        let ctx = LatencyContext::new(NodeType::Plan);
        let s = sampler.sample(&mut rng, &ctx, 1, 1.0);
        assert!(s.failed);
        assert!(!s.timeout);
    }

    #[test]
    fn sampler_clamps_to_timeout() {
        let sampler = LatencySampler::new(LatencyConfig::default());
        let mut rng = SeededRng::new(2);
        let ctx = LatencyContext::new(NodeType::Plan);
        // Timeout of 1 ms is always below lognormal(6, 0.8) samples.
        let s = sampler.sample(&mut rng, &ctx, 1, 0.0);
        assert!(s.timeout);
        assert_eq!(s.service_time_ms, 1.0);
    }

    #[test]
    fn linear_service_time_scales_with_context() {
        let mut cfg = LatencyConfig::default();
        cfg.set(NodeType::Chunk, LatencyParams::linear(10.0, 1.0));
        let sampler = LatencySampler::new(cfg);
        let mut rng = SeededRng::new(3);
        let mut small = LatencyContext::new(NodeType::Chunk);
        small.pdf_size_est = 0;
        let mut big = LatencyContext::new(NodeType::Chunk);
        big.pdf_size_est = 10_000;
        let t_small = sampler.sample_service_time(&mut rng, &small);
        let t_big = sampler.sample_service_time(&mut rng, &big);
        assert!(t_big > t_small);
        assert!(t_small >= 1.0);
    }

    #[test]
    fn token_length_shifts_llm_latency_mu() {
        let sampler = LatencySampler::new(LatencyConfig::default());
        // Same seed, same draw; only the context differs.
        let mut short_ctx = LatencyContext::new(NodeType::Plan);
        short_ctx.token_length_est = 0;
        let mut long_ctx = LatencyContext::new(NodeType::Plan);
        long_ctx.token_length_est = 2_000;

        let t_short = sampler.sample_service_time(&mut SeededRng::new(9), &short_ctx);
        let t_long = sampler.sample_service_time(&mut SeededRng::new(9), &long_ctx);
        assert!(t_long > t_short);
    }
}
