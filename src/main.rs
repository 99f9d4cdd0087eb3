use std::{fs, io::BufReader, path::PathBuf};

use anyhow::{Context, Result};
use autoshard::{
    device_mesh::CommProfile, graph::fx::TraceBuilder, plan, DeviceMesh, HandlerRegistry, PlanReport,
    SolverOptions,
};
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Serialized traced graph (.pb)
    #[clap(short, long)]
    trace: PathBuf,
    /// Mesh shape, e.g. "2,4"
    #[clap(short, long, default_value = "2,2")]
    mesh: String,
    /// CSV of per-axis alpha/beta link parameters
    #[clap(short, long)]
    comm_profile: Option<PathBuf>,
    /// JSON solver options
    #[clap(short, long)]
    options: Option<PathBuf>,
    #[clap(long)]
    memory_budget_gb: Option<f64>,
    #[clap(long)]
    forward_only: bool,
    /// Write the plan as JSON here
    #[clap(long)]
    out: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut mesh: DeviceMesh = args.mesh.parse().context("Invalid mesh")?;
    if let Some(path) = &args.comm_profile {
        let profile = CommProfile::from_file(path)
            .with_context(|| format!("Failed to read communication profile {}", path.display()))?;
        mesh = mesh.with_profile(profile)?;
    }

    let mut options = match &args.options {
        Some(path) => SolverOptions::from_file(path)
            .with_context(|| format!("Failed to read options {}", path.display()))?,
        None => SolverOptions::default(),
    };
    if let Some(gb) = args.memory_budget_gb {
        options.memory_budget = Some((gb * 1e9) as u64);
    }
    options.forward_only |= args.forward_only;

    let file = fs::File::open(&args.trace)
        .with_context(|| format!("Failed to open {}", args.trace.display()))?;
    let graph = TraceBuilder::parse(&mut BufReader::new(file))?
        .build_graph()
        .context("Failed to build graph")?;

    let registry = HandlerRegistry::from_options(&options);
    let plan = plan(&graph, &mesh, &registry, &options)?;
    let report = PlanReport::new(&plan, &mesh, options.forward_only);

    println!("{}", format!("Mesh {:?}, {} nodes", report.mesh, report.nodes.len()).bold());
    for node in &report.nodes {
        println!(
            "  {:<24} {:<18} {:<28} {:>10.2}us ({} candidates)",
            node.name,
            node.family.dimmed(),
            node.strategy.green(),
            node.cost_us,
            node.candidates
        );
    }
    for reshard in &report.reshards {
        println!(
            "  {} {} -> {} ({} {} -> {}, {:.2}us)",
            "reshard".yellow(),
            reshard.tensor,
            reshard.consumer,
            reshard.operand,
            reshard.from,
            reshard.to,
            reshard.cost_us
        );
    }
    let optimal = if report.proven_optimal {
        "optimal".green()
    } else {
        "budget exhausted".red()
    };
    println!(
        "Total cost: {:.2}us, critical path: {:.2}us, peak memory: {:.2}GB [{}]",
        report.total_cost_us,
        report.estimated_time_us,
        report.peak_memory_bytes / 1e9,
        optimal
    );

    if let Some(out) = &args.out {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(out, json).with_context(|| format!("Unable to write {}", out.display()))?;
    }
    Ok(())
}
