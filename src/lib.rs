//! Discrete-event-style simulator for DAG-structured research agent
//! workflows over mocked provider tiers.
//!
//! The simulator exists to compare scheduling policies (FIFO,
//! critical-path-first, tier escalation, straggler hedging) against
//! makespan, cost, and tail-latency metrics under heavy-tailed service
//! times. Nothing real is called: providers are latency distributions
//! with failure injection, and "execution" is a cancellable sleep.
//!
//! High-level flow:
//! 1) The [`controller::Controller`] seeds workflows, each a lazily
//!    expanding retrieval DAG ([`workflow::Workflow`]).
//! 2) A scheduler tick scores runnable nodes and enqueues attempts on
//!    provider tiers or local cpu/io pools ([`scheduler::Scheduler`]).
//! 3) Workers sleep for a sampled service time and push an
//!    [`types::AttemptResult`] ([`worker`]).
//! 4) The controller applies results, possibly expanding the DAG, while a
//!    monitor thread hedges critical-path stragglers.
//!
//! Reproducibility is at the level of the seeded random stream
//! ([`rng::SeededRng`]): exact for single-threaded sampling, best-effort
//! across worker threads.

pub mod bucket;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod estimates;
pub mod metrics;
pub mod provider;
pub mod rng;
pub mod scheduler;
pub mod trace;
pub mod types;
pub mod worker;
pub mod workflow;

pub use config::{ControllerConfig, ProviderConfig, SchedulerPolicy};
pub use controller::{Controller, RunReport, ShutdownHandle};
pub use error::SimError;
pub use types::{AttemptResult, NodeState, NodeType, ResourceClass};
pub use workflow::Workflow;
