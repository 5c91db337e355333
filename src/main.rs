use std::process::ExitCode;

use agentsim_rs::cli;
use agentsim_rs::{Controller, SimError};

fn run() -> Result<(), SimError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(config) = cli::parse_args(&args)? else {
        cli::print_usage(&mut std::io::stdout(), "agentsim-rs");
        return Ok(());
    };

    std::fs::create_dir_all(&config.out_dir)
        .map_err(|e| SimError::io(config.out_dir.clone(), e))?;

    println!("agentsim-rs config:");
    println!("  workflows={}", config.workflows);
    println!("  pdfs={}", config.pdfs);
    println!("  iters={}", config.iters);
    println!("  subqueries={}", config.subqueries);
    println!("  policy={}", config.policy.as_str());
    println!("  seed={}", config.seed);
    println!("  time_scale={}", config.time_scale);
    println!("  out_dir={}", config.out_dir);
    println!("  enable_model_routing={}", config.enable_model_routing);
    println!("  disable_hedging={}", config.disable_hedging);
    println!("  disable_escalation={}", config.disable_escalation);
    println!("  disable_dag_priority={}", config.disable_dag_priority);

    let out_dir = config.out_dir.clone();
    let mut controller = Controller::new(config)?;
    let report = controller.run()?;

    println!("summary:");
    println!("  workflows_completed={}", report.completed);
    println!("  makespan_mean_ms={}", report.summary.makespan_mean_ms);
    println!("  makespan_p95_ms={}", report.summary.makespan_p95_ms);
    println!("  cost_mean={}", report.summary.cost_mean);
    println!(
        "  outputs: {out_dir}/workflows.csv, {out_dir}/tiers.csv, {out_dir}/summary.csv, {out_dir}/trace.json"
    );
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!();
            cli::print_usage(&mut std::io::stderr(), "agentsim-rs");
            ExitCode::from(2)
        }
    }
}
