//! spawn-dag: generate and run a random spawn/pipe workload.
//!
//! Usage:
//! ```bash
//! # Random seed, default shape
//! spawn-dag
//!
//! # Reproduce a run, driving the scheduler 1000 steps at a time
//! spawn-dag --seed 42 --spawns 8 --writes 12 --steps-per-iteration 1000
//!
//! # Give up after 10k steps
//! spawn-dag --seed 42 --max-steps 10000
//!
//! # Keep the generated graph
//! spawn-dag --seed 42 --output-graph graph.json
//! ```

use anyhow::Context as _;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vmspawn::config::SchedulerConfig;
use vmspawn::testing::{generate_data_graph, run_data_graph};

#[derive(Parser, Debug)]
#[command(name = "spawn-dag")]
#[command(about = "Run a seeded random spawn/pipe workload through the scheduler")]
#[command(version)]
struct Args {
    /// Generator seed; derived from the clock when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Number of instances spawned below the root
    #[arg(long, default_value_t = 5)]
    spawns: u32,

    /// Number of writes between instances
    #[arg(long, default_value_t = 5)]
    writes: u32,

    /// Attempts per write to find an edge that keeps the write graph acyclic
    #[arg(long, default_value_t = 2)]
    converging_threshold: u32,

    /// Drive the scheduler with step-limited runs of this size
    #[arg(long)]
    steps_per_iteration: Option<u64>,

    /// Stop the session once this many steps were consumed
    #[arg(long, default_value_t = 100_000_000)]
    max_steps: u64,

    /// Write the generated graph as JSON
    #[arg(long)]
    output_graph: Option<PathBuf>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Maximum concurrently running instances
    #[arg(long, default_value_t = 16)]
    max_instances: usize,

    /// Maximum open pipe endpoints
    #[arg(long, default_value_t = 64)]
    max_endpoints: usize,

    /// Maximum spawn depth
    #[arg(long, default_value_t = 8)]
    max_depth: u32,

    /// Bytes buffered per pipe direction
    #[arg(long, default_value_t = 4096)]
    pipe_capacity: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let seed = args
        .seed
        .unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().unsigned_abs());
    println!("Seed: {seed}");

    let graph = generate_data_graph(seed, args.spawns, args.writes, args.converging_threshold);
    print!("{graph}");

    if let Some(path) = &args.output_graph {
        let json = serde_json::to_vec_pretty(&graph)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(path = %path.display(), "Wrote graph");
    }

    let config = SchedulerConfig::new()
        .with_max_instances(args.max_instances)
        .with_max_endpoints(args.max_endpoints)
        .with_max_depth(args.max_depth)
        .with_pipe_capacity(args.pipe_capacity);
    let report = run_data_graph(Arc::new(graph), config, args.steps_per_iteration, Some(args.max_steps))
        .context("scheduler stopped before the root exited")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Root exited with code {} after {} steps in {} run(s)",
            report.exit_code, report.consumed_steps, report.iterations
        );
        println!("Fingerprint: {}", report.fingerprint);
    }

    if report.exit_code != 0 {
        anyhow::bail!("root instance exited with code {}", report.exit_code);
    }
    Ok(())
}
