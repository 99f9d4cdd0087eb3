use autoshard::device_mesh::DeviceMesh;
use autoshard::graph::{ComputationGraph, NodeId};
use autoshard::handlers::{LinearHandler, NodeHandler};
use autoshard::strategy::{OperationDataType, StrategiesVector};
use itertools::Itertools;
use rstest::{fixture, rstest};

struct Setup {
    graph: ComputationGraph,
    linear: NodeId,
    mesh: DeviceMesh,
}

#[fixture]
fn setup() -> Setup {
    let mut graph = ComputationGraph::new();
    let x = graph.placeholder("x", [2, 2, 4, 16]).unwrap();
    let linear = graph.linear("linear", x, 16, 32, false).unwrap();
    graph.output(linear).unwrap();
    Setup {
        graph,
        linear,
        mesh: DeviceMesh::new([2, 2]).unwrap(),
    }
}

fn strategies(s: &Setup) -> StrategiesVector {
    LinearHandler.register_strategies(&s.graph, s.linear, &s.mesh).unwrap()
}

#[rstest]
fn test_operation_data_mapping(setup: Setup) {
    let mapping = LinearHandler.operation_data_mapping(&setup.graph, setup.linear).unwrap();
    assert!(!mapping.contains("bias"));

    let input = mapping.get("input").unwrap();
    assert_eq!(input.name, "x");
    assert_eq!(input.role, OperationDataType::Argument);
    assert_eq!(input.logical_shape, vec![16, 16]);
    assert_eq!(input.concrete_shape, vec![2, 2, 4, 16]);

    let other = mapping.get("other").unwrap();
    assert_eq!(other.name, "linear_weight");
    assert_eq!(other.role, OperationDataType::Parameter);
    assert_eq!(other.logical_shape, vec![16, 32]);
    assert_eq!(other.concrete_shape, vec![32, 16]);

    let output = mapping.get("output").unwrap();
    assert_eq!(output.role, OperationDataType::Output);
    assert_eq!(output.logical_shape, vec![16, 32]);
    assert_eq!(output.concrete_shape, vec![2, 2, 4, 32]);
}

#[rstest]
#[case("S0S1 = S0R x RS1")]
#[case("S1S0 = S1R x RS0")]
#[case("S0R = S0S1 x S1R")]
#[case("S1R = S1S0 x S0R")]
#[case("RS0 = RS1 x S1S0")]
#[case("RS1 = RS0 x S0S1")]
#[case("RR = RS0 x S0R")]
#[case("RR = RS1 x S1R")]
#[case("RS0 = RR x RS0")]
#[case("RS1 = RR x RS1")]
fn test_expected_strategy_present(setup: Setup, #[case] name: &str) {
    let vector = strategies(&setup);
    assert!(vector.len() > 8);
    assert!(vector.position(name).is_some(), "missing {}", name);
}

#[rstest]
fn test_strategy_names_are_unique(setup: Setup) {
    let vector = strategies(&setup);
    let names = vector.names();
    assert_eq!(names.iter().unique().count(), names.len());
}

#[rstest]
fn test_layouts_are_consistent(setup: Setup) {
    let vector = strategies(&setup);
    for strategy in &vector {
        let input = strategy.spec("input").unwrap();
        let other = strategy.spec("other").unwrap();
        let output = strategy.spec("output").unwrap();
        assert!(strategy.spec("bias").is_none());

        assert_eq!(input.entire_shape(), &[2, 2, 4, 16]);
        assert_eq!(other.entire_shape(), &[32, 16]);
        assert_eq!(output.entire_shape(), &[2, 2, 4, 32]);

        // contracted features: input's last dim against the weight's in_features
        assert_eq!(input.axes_of(3), other.axes_of(1), "{}", strategy.name);
        // output features against the weight's out_features
        assert_eq!(output.axes_of(3), other.axes_of(0), "{}", strategy.name);
        // batch dims are shared by input and output
        for dim in 0..3 {
            assert_eq!(input.axes_of(dim), output.axes_of(dim), "{}", strategy.name);
        }
        // the folded row dim lands on at most one batch dim
        assert!((0..3).filter(|&d| !input.axes_of(d).is_empty()).count() <= 1);
    }
}

#[rstest]
fn test_sharded_dims_divide_evenly(setup: Setup) {
    let vector = strategies(&setup);
    let mesh = &setup.mesh;
    for strategy in &vector {
        for spec in strategy.sharding_specs.values() {
            let local = spec.local_shape(mesh);
            for (dim, (&whole, &part)) in spec.entire_shape().iter().zip(&local).enumerate() {
                assert_eq!(part * spec.shard_factor(dim, mesh), whole, "{} {}", strategy.name, spec);
            }
        }
    }
}

#[rstest]
fn test_row_axes_realized_per_batch_dim(setup: Setup) {
    let vector = strategies(&setup);
    // S0 divides every batch dim, so the first realization keeps the bare name
    let first = vector.position("S0S1 = S0R x RS1").unwrap();
    assert_eq!(vector[first].spec("input").unwrap().axes_of(0), &[0]);
    let on_dim_2 = vector.position("S0S1 = S0R x RS1_2").unwrap();
    assert_eq!(vector[on_dim_2].spec("input").unwrap().axes_of(2), &[0]);

    // S01 needs a factor of 4, which only the size-4 batch dim offers
    for strategy in vector.iter().filter(|s| s.name.starts_with("S01R")) {
        assert_eq!(strategy.spec("input").unwrap().axes_of(2), &[0, 1]);
    }
}

#[test]
fn test_vocab_sized_linear_prices_without_overflow() {
    let mut graph = ComputationGraph::new();
    let x = graph.placeholder("hidden", [64, 4096, 4096]).unwrap();
    let lm_head = graph.linear("lm_head", x, 4096, 128256, false).unwrap();
    graph.output(lm_head).unwrap();
    let mesh = DeviceMesh::new([2, 2]).unwrap();

    let vector = LinearHandler.register_strategies(&graph, lm_head, &mesh).unwrap();
    let replicated = &vector[vector.position("RR = RR x RR").unwrap()];
    let expected = mesh.compute_cost(2 * 64 * 4096 * 4096 * 128256);
    assert!((replicated.compute_cost.fwd - expected).abs() / expected < 1e-9);
    for strategy in &vector {
        assert!(strategy.compute_cost.fwd.is_finite() && strategy.compute_cost.fwd > 0.0, "{}", strategy.name);
        assert!(strategy.compute_cost.fwd <= expected * (1.0 + 1e-9), "{}", strategy.name);
    }
}
