use std::{fs, io::BufReader, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use autoshard::{graph::fx::TraceBuilder, plan, ComputationGraph, DeviceMesh, HandlerRegistry, SolverOptions};
use clap::Parser;
use itertools::Itertools;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing_subscriber::EnvFilter;

/// Plans every trace in a directory on every mesh and reports the cheapest.
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Directory of .pb traces
    #[clap(short, long)]
    traces: PathBuf,
    /// Semicolon separated mesh shapes, e.g. "8;2,4;2,2,2"
    #[clap(short, long, default_value = "8;2,4")]
    meshes: String,
    #[clap(long)]
    memory_budget_gb: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let meshes = args
        .meshes
        .split(';')
        .map(|m| m.parse::<DeviceMesh>().with_context(|| format!("Invalid mesh '{}'", m)))
        .collect::<Result<Vec<_>>>()?;
    let mut options = SolverOptions::default();
    options.memory_budget = args.memory_budget_gb.map(|gb| (gb * 1e9) as u64);
    let registry = HandlerRegistry::from_options(&options);

    let pattern = args.traces.join("*.pb");
    let pattern = pattern.to_str().ok_or_else(|| anyhow!("Trace path is not UTF-8"))?;
    let paths = glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
    let graphs = paths
        .par_iter()
        .map(|path| {
            fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))
                .map(BufReader::new)
                .and_then(|mut buf| Ok(TraceBuilder::parse(&mut buf)?.build_graph()?))
                .map(|graph| (path.clone(), graph))
        })
        .collect::<Result<Vec<(PathBuf, ComputationGraph)>>>()?;

    let jobs = graphs.iter().cartesian_product(meshes.iter()).collect_vec();
    let results: Vec<(String, Vec<usize>, f64)> = jobs
        .par_iter()
        .filter_map(|((path, graph), mesh)| match plan(graph, mesh, &registry, &options) {
            Ok(plan) => Some((
                path.display().to_string(),
                mesh.shape().to_vec(),
                plan.sharded.estimated_time_us(options.forward_only),
            )),
            Err(e) => {
                eprintln!("Failed to plan {} on {:?}: {}", path.display(), mesh.shape(), e);
                None
            }
        })
        .collect();

    let mut hist = histo::Histogram::with_buckets(10);
    for (_, _, time) in &results {
        hist.add(*time as u64);
    }
    println!("Critical path distribution (us):\n{}", hist);

    let (trace, mesh, time) = results
        .into_iter()
        .min_by(|a, b| a.2.total_cmp(&b.2))
        .ok_or_else(|| anyhow!("No trace could be planned"))?;
    println!("Best: {} on mesh {:?}", trace, mesh);
    println!("Time: {:.2} us", time);
    Ok(())
}
