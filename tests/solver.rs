use autoshard::cost_graph::CostGraph;
use autoshard::error::AutoShardError;
use autoshard::graph::NodeId;
use autoshard::graph_analysis::{LiveStage, MemoryTable};
use autoshard::options::SolverOptions;
use autoshard::solver::{DenseSolver, Solver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

struct Case {
    graph: CostGraph,
    stages: Vec<LiveStage>,
    memory: MemoryTable,
}

fn cost(rng: &mut StdRng) -> f64 {
    rng.random_range(0..1000u32) as f64 / 10.0
}

/// Up to six vertices with up to four strategies each, random edges.
fn random_case(seed: u64) -> Case {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = rng.random_range(1..=6);
    let lens: Vec<usize> = (0..n).map(|_| rng.random_range(1..=4)).collect();
    let node_costs: Vec<Vec<f64>> = lens.iter().map(|&len| (0..len).map(|_| cost(&mut rng)).collect()).collect();
    let mut edges = Vec::new();
    for u in 0..n {
        for v in u + 1..n {
            if rng.random_bool(0.5) {
                let table: Vec<Vec<f64>> = (0..lens[u]).map(|_| (0..lens[v]).map(|_| cost(&mut rng)).collect()).collect();
                edges.push(((u, v), table));
            }
        }
    }
    // each tensor stays live for the step after it is produced
    let stages = (0..n)
        .map(|i| LiveStage {
            step: i,
            node: NodeId::new(i),
            live: (i.saturating_sub(1)..=i).map(NodeId::new).collect(),
        })
        .collect();
    let memory = MemoryTable {
        activation: lens.iter().map(|&len| (0..len).map(|_| cost(&mut rng)).collect()).collect(),
        parameters: lens.iter().map(|&len| (0..len).map(|_| cost(&mut rng) / 10.0).collect()).collect(),
    };
    Case {
        graph: CostGraph::from_tables(node_costs, edges).unwrap(),
        stages,
        memory,
    }
}

#[rstest]
fn test_simplified_solve_matches_brute_force(#[values(1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12)] seed: u64) {
    let case = random_case(seed);
    let dense = DenseSolver::solve(&case.graph, &case.stages, &case.memory, None).unwrap();

    let mut reduced = case.graph.clone();
    reduced.simplify_graph();
    let options = SolverOptions::default();
    let solution = Solver::new(&reduced, &case.stages, &case.memory, &options).solve().unwrap();

    assert!(
        (solution.total_cost - dense.total_cost).abs() < 1e-6,
        "seed {}: {} vs {}",
        seed,
        solution.total_cost,
        dense.total_cost
    );
    assert!((case.graph.evaluate(&solution.assignment) - solution.total_cost).abs() < 1e-6);
    assert!(solution.proven_optimal);
}

#[rstest]
fn test_simplification_preserves_core_cost(#[values(21, 22, 23, 24, 25)] seed: u64) {
    let case = random_case(seed);
    let mut reduced = case.graph.clone();
    reduced.simplify_graph();
    let core = vec![0; reduced.node_count()];
    let full = reduced.reconstruct(&core).unwrap();
    // eliminated vertices are recovered at exactly the folded cost
    assert!((reduced.core_cost(&core) - case.graph.evaluate(&full)).abs() < 1e-6);
}

#[rstest]
fn test_memory_budget_matches_brute_force(#[values(31, 32, 33, 34, 35, 36)] seed: u64) {
    let case = random_case(seed);
    let unconstrained = DenseSolver::solve(&case.graph, &case.stages, &case.memory, None).unwrap();
    let budget = (unconstrained.peak_memory * 0.8) as u64;

    let options = SolverOptions::default().with_memory_budget(budget);
    let dense = DenseSolver::solve(&case.graph, &case.stages, &case.memory, Some(budget));
    let solution = Solver::new(&case.graph, &case.stages, &case.memory, &options).solve();
    match (dense, solution) {
        (Ok(dense), Ok(solution)) => {
            assert!((solution.total_cost - dense.total_cost).abs() < 1e-6, "seed {}", seed);
            assert!(solution.peak_memory <= budget as f64);
        }
        (Err(_), Err(err)) => assert!(matches!(err, AutoShardError::InfeasibleSolution(_))),
        (dense, solution) => panic!("seed {}: dense {:?}, solver {:?}", seed, dense.is_ok(), solution.is_ok()),
    }
}

#[test]
fn test_solve_is_deterministic() {
    let case = random_case(42);
    let options = SolverOptions::default();
    let mut reduced = case.graph.clone();
    reduced.simplify_graph();
    let first = Solver::new(&reduced, &case.stages, &case.memory, &options).solve().unwrap();
    let second = Solver::new(&reduced, &case.stages, &case.memory, &options).solve().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_ties_prefer_lowest_index() {
    let graph = CostGraph::from_tables(
        vec![vec![1.0, 1.0, 1.0], vec![2.0, 2.0]],
        vec![((0, 1), vec![vec![0.0, 0.0], vec![0.0, 0.0], vec![0.0, 0.0]])],
    )
    .unwrap();
    let stages: Vec<LiveStage> = vec![];
    let memory = MemoryTable {
        activation: vec![vec![0.0; 3], vec![0.0; 2]],
        parameters: vec![vec![0.0; 3], vec![0.0; 2]],
    };
    let options = SolverOptions::default();
    let mut reduced = graph.clone();
    reduced.simplify_graph();
    let solution = Solver::new(&reduced, &stages, &memory, &options).solve().unwrap();
    assert_eq!(solution.assignment, vec![0, 0]);
}

#[test]
fn test_budget_below_parameters_is_infeasible() {
    let graph = CostGraph::from_tables(vec![vec![0.0]], vec![]).unwrap();
    let stages = vec![LiveStage {
        step: 0,
        node: NodeId::new(0),
        live: vec![NodeId::new(0)],
    }];
    let memory = MemoryTable {
        activation: vec![vec![8.0]],
        parameters: vec![vec![64.0]],
    };
    let options = SolverOptions::default().with_memory_budget(32);
    let err = Solver::new(&graph, &stages, &memory, &options).solve().unwrap_err();
    assert!(matches!(err, AutoShardError::InfeasibleSolution(_)));
    assert!(err.is_retryable());
}
