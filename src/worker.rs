//! Worker loops that turn queued attempts into results.
//!
//! One tier worker runs per concurrency slot per tier; local cpu/io pools
//! drain their own channels. Workers never touch workflow state and never
//! fail out of the loop: every outcome, including cooperative
//! cancellation, is translated into an [`AttemptResult`] and pushed to the
//! shared result channel. Dequeues use short timeouts so the shutdown flag
//! is observed promptly.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::config::LOCAL_PROVIDER;
use crate::estimates::LatencyEstimateStore;
use crate::provider::{LatencyContext, LatencySampler, Tier};
use crate::rng::SeededRng;
use crate::trace::{TraceKind, TraceWriter};
use crate::types::{AttemptError, AttemptId, AttemptResult, NodeId, NodeType, ResourceClass, WorkflowId};

/// How long dequeues block before re-checking the shutdown flag.
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Granularity of cancellable sleeps.
pub const SLEEP_CHUNK_MS: u64 = 20;

/// Task for the local cpu/io pools; no tier, no pricing.
#[derive(Clone, Debug)]
pub struct LocalTask {
    pub node_id: NodeId,
    pub workflow_id: WorkflowId,
    pub node_type: NodeType,
    pub resource_class: ResourceClass,
    pub latency_ctx: LatencyContext,
    pub timeout_ms: u64,
    pub attempt_id: AttemptId,
    pub cancelled: Option<Arc<AtomicBool>>,
}

/// Workload-level heavy-tail injection, applied by workers on top of the
/// per-type tail model. This is the tail the scheduling policies exist to
/// mitigate.
#[derive(Clone, Copy, Debug)]
pub struct HeavyTail {
    pub prob: f64,
    pub multiplier: f64,
}

impl HeavyTail {
    pub fn none() -> Self {
        Self {
            prob: 0.0,
            multiplier: 1.0,
        }
    }

    fn apply(&self, rng: &mut SeededRng, service_time_ms: f64) -> f64 {
        if self.prob > 0.0 && rng.bernoulli(self.prob) {
            service_time_ms * self.multiplier
        } else {
            service_time_ms
        }
    }
}

/// Dependencies shared by every worker thread.
pub struct WorkerShared<W: Write> {
    pub sampler: Arc<LatencySampler>,
    pub estimates: Arc<LatencyEstimateStore>,
    pub results: Sender<AttemptResult>,
    pub trace: Arc<TraceWriter<W>>,
    pub run_start: Instant,
    pub time_scale: u64,
    pub shutdown: Arc<AtomicBool>,
    pub heavy_tail: HeavyTail,
}

impl<W: Write> Clone for WorkerShared<W> {
    fn clone(&self) -> Self {
        Self {
            sampler: Arc::clone(&self.sampler),
            estimates: Arc::clone(&self.estimates),
            results: self.results.clone(),
            trace: Arc::clone(&self.trace),
            run_start: self.run_start,
            time_scale: self.time_scale,
            shutdown: Arc::clone(&self.shutdown),
            heavy_tail: self.heavy_tail,
        }
    }
}

/// Current simulated time for a run.
#[inline]
pub fn sim_now_ms(run_start: Instant, time_scale: u64) -> f64 {
    run_start.elapsed().as_secs_f64() * 1_000.0 * time_scale as f64
}

/// Sleep `total_ms` in chunks of up to `chunk_ms`, checking the
/// cancellation flag between chunks. Returns true if cancellation was ever
/// observed.
pub fn cancellable_sleep(total_ms: u64, cancelled: Option<&AtomicBool>, chunk_ms: u64) -> bool {
    let chunk = chunk_ms.max(1);
    let mut remaining = total_ms;
    while remaining > 0 {
        if let Some(flag) = cancelled {
            if flag.load(Ordering::Acquire) {
                return true;
            }
        }
        let step = remaining.min(chunk);
        std::thread::sleep(Duration::from_millis(step));
        remaining -= step;
    }
    cancelled.is_some_and(|flag| flag.load(Ordering::Acquire))
}

/// Worker loop for one provider-tier concurrency slot.
pub fn tier_worker_loop<W: Write>(tier: Arc<Tier>, mut rng: SeededRng, shared: WorkerShared<W>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let Some(attempt) = tier.timed_dequeue(DEQUEUE_TIMEOUT) else {
            continue;
        };

        let wait_ms =
            attempt.enqueued_at.elapsed().as_secs_f64() * 1_000.0 * shared.time_scale as f64;
        shared
            .estimates
            .record_queue_wait(&attempt.provider, attempt.tier_id, wait_ms);

        tier.acquire_tokens(&attempt);

        shared.trace.emit(
            TraceKind::AttemptStart,
            sim_now_ms(shared.run_start, shared.time_scale),
            attempt.workflow_id,
            attempt.node_id,
            &format!("{}_{}", attempt.provider, attempt.tier_id),
        );

        let exec_start = Instant::now();
        let mut sample = shared.sampler.sample(
            &mut rng,
            &attempt.latency_ctx,
            attempt.timeout_ms,
            tier.config().p_fail,
        );
        sample.service_time_ms = shared.heavy_tail.apply(&mut rng, sample.service_time_ms);

        let scaled_ms = ((sample.service_time_ms as u64) / shared.time_scale).max(1);
        let was_cancelled =
            cancellable_sleep(scaled_ms, attempt.cancelled.as_deref(), SLEEP_CHUNK_MS);

        let busy = exec_start.elapsed();
        tier.on_attempt_finish(busy);

        let error = if was_cancelled {
            Some(AttemptError::Cancelled)
        } else if sample.failed {
            Some(AttemptError::Failed)
        } else if sample.timeout {
            Some(AttemptError::Timeout)
        } else {
            None
        };

        let result = AttemptResult {
            node_id: attempt.node_id,
            workflow_id: attempt.workflow_id,
            attempt_id: attempt.attempt_id,
            duration_ms: busy.as_secs_f64() * 1_000.0 * shared.time_scale as f64,
            cost: tier.config().price_per_call,
            provider: attempt.provider,
            tier_id: attempt.tier_id,
            error,
        };
        // A send failure means the controller is gone; nothing to do.
        let _ = shared.results.send(result);
    }
}

/// Worker loop for a local cpu or io pool.
pub fn local_worker_loop<W: Write>(
    queue: Receiver<LocalTask>,
    resource_class: ResourceClass,
    mut rng: SeededRng,
    shared: WorkerShared<W>,
) {
    while !shared.shutdown.load(Ordering::Acquire) {
        let task = match queue.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        shared.trace.emit(
            TraceKind::AttemptStart,
            sim_now_ms(shared.run_start, shared.time_scale),
            task.workflow_id,
            task.node_id,
            LOCAL_PROVIDER,
        );

        let mut raw_ms = shared.sampler.sample_service_time(&mut rng, &task.latency_ctx);
        raw_ms = shared.heavy_tail.apply(&mut rng, raw_ms);

        let scaled_ms = ((raw_ms as u64) / shared.time_scale).max(1);
        let was_cancelled = cancellable_sleep(scaled_ms, task.cancelled.as_deref(), SLEEP_CHUNK_MS);

        let result = AttemptResult {
            node_id: task.node_id,
            workflow_id: task.workflow_id,
            attempt_id: task.attempt_id,
            // Local attempts report the sampled simulated time directly.
            duration_ms: raw_ms,
            cost: 0.0,
            provider: LOCAL_PROVIDER.to_string(),
            tier_id: resource_class.ordinal(),
            error: was_cancelled.then_some(AttemptError::Cancelled),
        };
        let _ = shared.results.send(result);
    }
}
