//! Command-line parser for the simulator binary.
//!
//! Hand-rolled (no clap dependency) to keep the binary small and boot
//! fast.
//!
//! # Grammar
//!
//! ```text
//! agentsim-rs [--workflows N] [--pdfs N] [--iters N] [--subqueries N]
//!             [--policy NAME] [--seed N] [--time_scale N] [--out_dir PATH]
//!             [--enable_model_routing] [--disable_hedging]
//!             [--disable_escalation] [--disable_dag_priority]
//!             [--heavy_tail_prob P] [--heavy_tail_mult M]
//! ```
//!
//! Invalid arguments print a diagnostic plus usage to stderr and exit
//! with code 2.

use std::str::FromStr;

use crate::config::{ControllerConfig, SchedulerPolicy};
use crate::error::SimError;

pub fn print_usage(out: &mut dyn std::io::Write, exe: &str) {
    let _ = writeln!(
        out,
        "Usage:\n  {exe} [options] [flags]\n\n\
         Options:\n\
         \x20 --workflows N         Number of workflows (default: 100)\n\
         \x20 --pdfs N              PDFs per workflow (default: 10)\n\
         \x20 --iters N             Max iterations (default: 3)\n\
         \x20 --subqueries N        Subqueries per iteration (default: 4)\n\
         \x20 --policy NAME         One of: fifo_cheapest, dag_cheapest, dag_escalation, full (default: full)\n\
         \x20 --seed N              RNG seed (default: 1)\n\
         \x20 --time_scale N        Divide all sleeps by N, N >= 1 (default: 50)\n\
         \x20 --out_dir PATH        Output directory (default: out)\n\
         \x20 --heavy_tail_prob P   Fraction of attempts with heavy-tail latency (default: 0.02)\n\
         \x20 --heavy_tail_mult M   Latency multiplier for heavy-tail attempts (default: 50)\n\n\
         Flags:\n\
         \x20 --enable_model_routing   Preference-list routing, escalation, hedging inputs\n\
         \x20 --disable_hedging\n\
         \x20 --disable_escalation\n\
         \x20 --disable_dag_priority\n\
         \x20 -h, --help            Show this help"
    );
}

fn parse_value<T: FromStr>(args: &[String], i: usize) -> Result<T, SimError> {
    let flag = &args[i];
    let raw = args
        .get(i + 1)
        .ok_or_else(|| SimError::InvalidConfig(format!("missing value for {flag}")))?;
    raw.parse::<T>()
        .map_err(|_| SimError::InvalidConfig(format!("invalid value for {flag}: {raw}")))
}

/// Parse arguments (without the program name) into a validated
/// [`ControllerConfig`]. Returns `Ok(None)` when help was requested.
pub fn parse_args(args: &[String]) -> Result<Option<ControllerConfig>, SimError> {
    let mut cfg = ControllerConfig::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(None),

            "--enable_model_routing" => cfg.enable_model_routing = true,
            "--disable_hedging" => cfg.disable_hedging = true,
            "--disable_escalation" => cfg.disable_escalation = true,
            "--disable_dag_priority" => cfg.disable_dag_priority = true,

            "--workflows" => {
                cfg.workflows = parse_value(args, i)?;
                i += 1;
            }
            "--pdfs" => {
                cfg.pdfs = parse_value(args, i)?;
                i += 1;
            }
            "--iters" => {
                cfg.iters = parse_value(args, i)?;
                i += 1;
            }
            "--subqueries" => {
                cfg.subqueries = parse_value(args, i)?;
                i += 1;
            }
            "--seed" => {
                cfg.seed = parse_value(args, i)?;
                i += 1;
            }
            "--time_scale" => {
                cfg.time_scale = parse_value(args, i)?;
                i += 1;
            }
            "--out_dir" => {
                cfg.out_dir = parse_value::<String>(args, i)?;
                i += 1;
            }
            "--policy" => {
                let name: String = parse_value(args, i)?;
                cfg.policy = SchedulerPolicy::parse(&name)?;
                i += 1;
            }
            "--heavy_tail_prob" => {
                cfg.heavy_tail_prob = parse_value(args, i)?;
                i += 1;
            }
            "--heavy_tail_mult" => {
                cfg.heavy_tail_multiplier = parse_value(args, i)?;
                i += 1;
            }
            other => {
                return Err(SimError::InvalidConfig(format!("unknown argument: {other}")));
            }
        }
        i += 1;
    }

    cfg.validate()?;
    Ok(Some(cfg))
}
