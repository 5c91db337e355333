//! Rolling latency estimates feeding scheduling decisions.
//!
//! The store keeps two families of windows: observed service times keyed
//! by (node type, provider, tier) and observed queue waits keyed by
//! (provider, tier). Quantiles over an empty window return documented
//! defaults so that bootstrap decisions (escalation, straggler stretch)
//! are well-defined before any measurements exist.
//!
//! Quantile computation sorts a copy of the window. Windows are small
//! (1000 samples) and reads happen at scheduler-tick cadence, so the
//! simplicity beats a streaming sketch here.

use std::collections::VecDeque;
use std::sync::Mutex;

use ahash::AHashMap;

use crate::types::NodeType;

/// Default quantiles reported before any sample exists.
pub const DEFAULT_P50_MS: f64 = 100.0;
pub const DEFAULT_P90_MS: f64 = 200.0;
pub const DEFAULT_P95_MS: f64 = 300.0;
pub const DEFAULT_QUEUE_WAIT_P95_MS: f64 = 50.0;

/// Fixed-capacity window of recent samples with index-based quantiles.
#[derive(Clone, Debug, Default)]
pub struct QuantileWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl QuantileWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.samples.push_back(value);
        if self.samples.len() > self.cap {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Quantile by sorted index `floor(q * len)`, clamped to the last
    /// element. Returns `None` on an empty window.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let idx = ((q * sorted.len() as f64) as usize).min(sorted.len() - 1);
        Some(sorted[idx])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ServiceKey {
    kind: NodeType,
    provider: String,
    tier_id: u32,
}

#[derive(Default)]
struct Windows {
    service: AHashMap<ServiceKey, QuantileWindow>,
    queue_wait: AHashMap<(String, u32), QuantileWindow>,
}

/// Thread-safe store of rolling latency and queue-wait windows.
///
/// Writers are workers and the controller's result loop; readers are the
/// scheduler and the straggler monitor. One mutex over both maps keeps the
/// store simple; contention is negligible at simulation rates.
pub struct LatencyEstimateStore {
    window_cap: usize,
    inner: Mutex<Windows>,
}

impl Default for LatencyEstimateStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl LatencyEstimateStore {
    pub fn new(window_cap: usize) -> Self {
        Self {
            window_cap,
            inner: Mutex::new(Windows::default()),
        }
    }

    pub fn record_service(&self, kind: NodeType, provider: &str, tier_id: u32, duration_ms: f64) {
        let mut inner = self
            .inner
            .lock()
            .expect("LatencyEstimateStore mutex poisoned");
        let cap = self.window_cap;
        inner
            .service
            .entry(ServiceKey {
                kind,
                provider: provider.to_string(),
                tier_id,
            })
            .or_insert_with(|| QuantileWindow::new(cap))
            .push(duration_ms);
    }

    pub fn record_queue_wait(&self, provider: &str, tier_id: u32, wait_ms: f64) {
        let mut inner = self
            .inner
            .lock()
            .expect("LatencyEstimateStore mutex poisoned");
        let cap = self.window_cap;
        inner
            .queue_wait
            .entry((provider.to_string(), tier_id))
            .or_insert_with(|| QuantileWindow::new(cap))
            .push(wait_ms);
    }

    fn service_quantile(
        &self,
        kind: NodeType,
        provider: &str,
        tier_id: u32,
        q: f64,
        default: f64,
    ) -> f64 {
        let inner = self
            .inner
            .lock()
            .expect("LatencyEstimateStore mutex poisoned");
        inner
            .service
            .get(&ServiceKey {
                kind,
                provider: provider.to_string(),
                tier_id,
            })
            .and_then(|w| w.quantile(q))
            .unwrap_or(default)
    }

    pub fn p50(&self, kind: NodeType, provider: &str, tier_id: u32) -> f64 {
        self.service_quantile(kind, provider, tier_id, 0.50, DEFAULT_P50_MS)
    }

    pub fn p90(&self, kind: NodeType, provider: &str, tier_id: u32) -> f64 {
        self.service_quantile(kind, provider, tier_id, 0.90, DEFAULT_P90_MS)
    }

    pub fn p95(&self, kind: NodeType, provider: &str, tier_id: u32) -> f64 {
        self.service_quantile(kind, provider, tier_id, 0.95, DEFAULT_P95_MS)
    }

    pub fn queue_wait_p95(&self, provider: &str, tier_id: u32) -> f64 {
        let inner = self
            .inner
            .lock()
            .expect("LatencyEstimateStore mutex poisoned");
        inner
            .queue_wait
            .get(&(provider.to_string(), tier_id))
            .and_then(|w| w.quantile(0.95))
            .unwrap_or(DEFAULT_QUEUE_WAIT_P95_MS)
    }
}
