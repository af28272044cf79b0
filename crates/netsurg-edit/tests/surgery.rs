//! End-to-end tests for the graph edits.
//!
//! Each test builds a small model with the `ModelGraph` builder API, applies
//! one or more edits through the public functions of `netsurg_edit`, and
//! checks the structure and weights of the result.

use std::collections::BTreeSet;

use ndarray::{Array1, Array2, Array4, ArrayD, Axis};

use netsurg_core::graph::ModelGraph;
use netsurg_core::id::OpId;
use netsurg_core::ops::{ActivationFn, ConvOptions, DataFormat, Operation};
use netsurg_edit::{
    delete_channels, delete_operation, insert, prune_channels, replace, EditError, EditOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A dense layer whose weights are all distinct, so row and column
/// selections are easy to check.
fn dense(name: &str, inputs: usize, units: usize) -> Operation {
    let kernel = Array2::from_shape_fn((inputs, units), |(r, c)| (r * 100 + c) as f32);
    let bias = Array1::from_iter((0..units).map(|c| c as f32 * 0.5));
    Operation::dense(name, kernel, Some(bias), ActivationFn::Relu).unwrap()
}

fn conv(name: &str, in_channels: usize, filters: usize, format: DataFormat) -> Operation {
    let kernel = Array4::from_shape_fn((3, 3, in_channels, filters), |(a, b, c, d)| {
        (a * 1000 + b * 100 + c * 10 + d) as f32
    });
    let options = ConvOptions {
        data_format: format,
        ..ConvOptions::new()
    };
    Operation::conv2d(name, kernel, Some(Array1::zeros(filters)), options).unwrap()
}

/// x[3] -> dense_1(5) -> dense_2(4) -> dense_3(2)
fn mlp() -> ModelGraph {
    ModelGraph::sequential(
        Operation::input("x", vec![3]),
        [
            dense("dense_1", 3, 5),
            dense("dense_2", 5, 4),
            dense("dense_3", 4, 2),
        ],
    )
    .unwrap()
}

fn op_id(graph: &ModelGraph, name: &str) -> OpId {
    graph
        .find_operation(name)
        .unwrap_or_else(|| panic!("no operation named {name}"))
}

fn kernel(graph: &ModelGraph, name: &str) -> ArrayD<f32> {
    graph
        .operation(op_id(graph, name))
        .unwrap()
        .kernel()
        .unwrap()
        .clone()
}

/// Operation names from the first output back to the input, following the
/// first inbound tensor of each node.
fn path_to_input(graph: &ModelGraph) -> Vec<String> {
    let mut names = Vec::new();
    let mut current = Some(graph.outputs()[0]);
    while let Some(t) = current {
        names.push(graph.node_operation(t.node).unwrap().name.clone());
        current = graph.inbound(t.node).first().copied();
    }
    names
}

fn snapshot(graph: &ModelGraph) -> serde_json::Value {
    serde_json::to_value(graph).unwrap()
}

// ---------------------------------------------------------------------------
// Insert, replace, delete
// ---------------------------------------------------------------------------

#[test]
fn insert_leaves_other_weights_untouched() {
    let graph = mlp();
    let edited = insert(
        &graph,
        op_id(&graph, "dense_2"),
        Operation::activation("gate", ActivationFn::Sigmoid),
        &EditOptions::default(),
    )
    .unwrap();

    assert_eq!(
        path_to_input(&edited),
        vec!["dense_3", "dense_2", "gate", "dense_1", "x"]
    );
    for name in ["dense_1", "dense_2", "dense_3"] {
        assert_eq!(kernel(&edited, name), kernel(&graph, name), "{name}");
    }
    edited.validate().unwrap();
    assert_eq!(edited.tensor_shape(edited.outputs()[0]), Some(&[2][..]));
}

#[test]
fn insert_directly_after_graph_input() {
    let graph = mlp();
    let edited = insert(
        &graph,
        op_id(&graph, "dense_1"),
        Operation::activation("pre", ActivationFn::Tanh),
        &EditOptions::default(),
    )
    .unwrap();
    assert_eq!(
        path_to_input(&edited),
        vec!["dense_3", "dense_2", "dense_1", "pre", "x"]
    );
}

#[test]
fn replace_swaps_weights_in_place() {
    let graph = mlp();
    let mut swapped = dense("dense_2b", 5, 4);
    swapped.weights[0].fill(7.0);
    let edited = replace(
        &graph,
        op_id(&graph, "dense_2"),
        swapped,
        &EditOptions::default(),
    )
    .unwrap();

    assert_eq!(
        path_to_input(&edited),
        vec!["dense_3", "dense_2b", "dense_1", "x"]
    );
    assert!(kernel(&edited, "dense_2b").iter().all(|w| *w == 7.0));
    assert!(edited.find_operation("dense_2").is_none());
}

#[test]
fn delete_operation_reconnects_consumers() {
    let graph = ModelGraph::sequential(
        Operation::input("x", vec![3]),
        [
            dense("dense_1", 3, 4),
            Operation::activation("relu", ActivationFn::Relu),
            dense("dense_2", 4, 2),
        ],
    )
    .unwrap();
    let edited =
        delete_operation(&graph, op_id(&graph, "relu"), &EditOptions::default()).unwrap();
    assert_eq!(path_to_input(&edited), vec!["dense_2", "dense_1", "x"]);
    assert_eq!(edited.node_count(), 3);
    assert_eq!(graph.node_count(), 4);
}

// ---------------------------------------------------------------------------
// Shared operations
// ---------------------------------------------------------------------------

/// x[4] -> shared -> relu -> shared
fn shared_twice() -> ModelGraph {
    let mut graph = ModelGraph::new();
    let x = graph.add_input(Operation::input("x", vec![4])).unwrap();
    let shared = graph.add_operation(dense("shared", 4, 4));
    let relu = graph.add_operation(Operation::activation("relu", ActivationFn::Relu));
    let a = graph.apply(shared, &[x]).unwrap();
    let b = graph.apply(relu, &[a]).unwrap();
    let c = graph.apply(shared, &[b]).unwrap();
    graph.set_outputs(vec![c]).unwrap();
    graph
}

#[test]
fn insert_before_every_instance_of_a_shared_operation() {
    let graph = shared_twice();
    let edited = insert(
        &graph,
        op_id(&graph, "shared"),
        Operation::activation("gate", ActivationFn::Sigmoid),
        &EditOptions::default(),
    )
    .unwrap();

    assert_eq!(
        path_to_input(&edited),
        vec!["shared", "gate", "relu", "shared", "gate", "x"]
    );
    // Both applications still refer to one operation of each kind.
    assert_eq!(edited.operation_count(), 4);
    assert_eq!(edited.instances_of(op_id(&edited, "shared")).len(), 2);
    assert_eq!(edited.instances_of(op_id(&edited, "gate")).len(), 2);
}

#[test]
fn insert_before_selected_instance_only() {
    let graph = shared_twice();
    let shared = op_id(&graph, "shared");
    let second = graph.instances_of(shared)[1];
    let edited = insert(
        &graph,
        shared,
        Operation::activation("gate", ActivationFn::Sigmoid),
        &EditOptions::at_nodes([second]),
    )
    .unwrap();
    assert_eq!(
        path_to_input(&edited),
        vec!["shared", "gate", "relu", "shared", "x"]
    );
}

// ---------------------------------------------------------------------------
// Channel deletion
// ---------------------------------------------------------------------------

#[test]
fn deleting_units_removes_consumer_rows() {
    let graph = ModelGraph::sequential(
        Operation::input("x", vec![3]),
        [dense("dense_a", 3, 8), dense("dense_b", 8, 4)],
    )
    .unwrap();
    let edited = delete_channels(
        &graph,
        op_id(&graph, "dense_a"),
        &[1, 3],
        &EditOptions::default(),
    )
    .unwrap();

    let a = kernel(&edited, "dense_a");
    assert_eq!(a.shape(), &[3, 6]);
    assert_eq!(a, kernel(&graph, "dense_a").select(Axis(1), &[0, 2, 4, 5, 6, 7]));

    let b = kernel(&edited, "dense_b");
    assert_eq!(b.shape(), &[6, 4]);
    assert_eq!(b, kernel(&graph, "dense_b").select(Axis(0), &[0, 2, 4, 5, 6, 7]));

    assert_eq!(edited.tensor_shape(edited.outputs()[0]), Some(&[4][..]));
}

#[test]
fn channel_deletion_stops_at_first_weighted_consumer() {
    let graph = mlp();
    let edited = delete_channels(
        &graph,
        op_id(&graph, "dense_1"),
        &[0],
        &EditOptions::default(),
    )
    .unwrap();
    assert_eq!(kernel(&edited, "dense_2").shape(), &[4, 4]);
    assert_eq!(kernel(&edited, "dense_3"), kernel(&graph, "dense_3"));
    let bias_3 = edited.operation(op_id(&edited, "dense_3")).unwrap().bias().cloned();
    let original_bias_3 = graph.operation(op_id(&graph, "dense_3")).unwrap().bias().cloned();
    assert_eq!(bias_3, original_bias_3);
}

#[test]
fn duplicate_channel_indices_are_ignored() {
    let graph = mlp();
    let edited = delete_channels(
        &graph,
        op_id(&graph, "dense_1"),
        &[2, 2, 4],
        &EditOptions::default(),
    )
    .unwrap();
    assert_eq!(kernel(&edited, "dense_1").shape(), &[3, 3]);
    assert_eq!(kernel(&edited, "dense_2").shape(), &[3, 4]);
}

#[test]
fn out_of_range_channel_fails_before_any_change() {
    let graph = mlp();
    let before = snapshot(&graph);
    let err = delete_channels(
        &graph,
        op_id(&graph, "dense_1"),
        &[10],
        &EditOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        EditError::ChannelIndexOutOfRange {
            index: 10,
            count: 5,
            ..
        }
    ));
    insta::assert_snapshot!(
        err.to_string(),
        @"channel index 10 out of range: operation 'dense_1' has 5 channels"
    );
    assert_eq!(snapshot(&graph), before);
}

#[test]
fn deleting_into_an_activation_is_unsupported() {
    let graph = ModelGraph::sequential(
        Operation::input("x", vec![3]),
        [
            dense("dense_1", 3, 4),
            Operation::activation("relu", ActivationFn::Relu),
            dense("dense_2", 4, 2),
        ],
    )
    .unwrap();
    let err = delete_channels(
        &graph,
        op_id(&graph, "dense_1"),
        &[1],
        &EditOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        EditError::UnsupportedOperationKind { kind: "Activation", .. }
    ));
}

#[test]
fn conv_filters_propagate_through_flatten() {
    // x[6,6,1] -> conv_1(4 filters) -> [4,4,4] -> flatten -> [64] -> dense(3)
    let graph = ModelGraph::sequential(
        Operation::input("x", vec![6, 6, 1]),
        [
            conv("conv_1", 1, 4, DataFormat::ChannelsLast),
            Operation::flatten("flatten"),
            dense("dense", 64, 3),
        ],
    )
    .unwrap();
    let edited = delete_channels(
        &graph,
        op_id(&graph, "conv_1"),
        &[1],
        &EditOptions::default(),
    )
    .unwrap();

    assert_eq!(kernel(&edited, "conv_1").shape(), &[3, 3, 1, 3]);
    let kept: Vec<usize> = (0..64).filter(|i| i % 4 != 1).collect();
    assert_eq!(kernel(&edited, "dense"), kernel(&graph, "dense").select(Axis(0), &kept));
    assert_eq!(edited.tensor_shape(edited.outputs()[0]), Some(&[3][..]));
}

#[test]
fn conv_filters_trim_next_conv_channels_first() {
    // x[1,8,8] -> conv_1(4) -> [4,6,6] -> conv_2(2) -> [2,4,4]
    let graph = ModelGraph::sequential(
        Operation::input("x", vec![1, 8, 8]),
        [
            conv("conv_1", 1, 4, DataFormat::ChannelsFirst),
            conv("conv_2", 4, 2, DataFormat::ChannelsFirst),
        ],
    )
    .unwrap();
    let edited = delete_channels(
        &graph,
        op_id(&graph, "conv_1"),
        &[0, 2],
        &EditOptions::default(),
    )
    .unwrap();

    assert_eq!(kernel(&edited, "conv_1").shape(), &[3, 3, 1, 2]);
    assert_eq!(
        kernel(&edited, "conv_2"),
        kernel(&graph, "conv_2").select(Axis(2), &[1, 3])
    );
    assert_eq!(edited.tensor_shape(edited.outputs()[0]), Some(&[2, 4, 4][..]));
}

#[test]
fn pruning_with_a_caller_policy() {
    let graph = mlp();
    // Deletes the channels whose kernel column has the smallest L1 norm.
    let weakest_two = |graph: &ModelGraph, op: OpId| {
        let kernel = graph.operation(op).unwrap().kernel().unwrap();
        let mut ranked: Vec<(f32, usize)> = kernel
            .axis_iter(Axis(1))
            .map(|col| col.iter().map(|w| w.abs()).sum::<f32>())
            .zip(0..)
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok::<_, EditError>(ranked.iter().take(2).map(|&(_, c)| c).collect::<BTreeSet<usize>>())
    };
    let edited = prune_channels(
        &graph,
        op_id(&graph, "dense_1"),
        &weakest_two,
        &EditOptions::default(),
    )
    .unwrap();
    assert_eq!(
        kernel(&edited, "dense_1"),
        kernel(&graph, "dense_1").select(Axis(1), &[2, 3, 4])
    );
    assert_eq!(kernel(&edited, "dense_2").shape(), &[3, 4]);
}

// ---------------------------------------------------------------------------
// Isolation and rejection
// ---------------------------------------------------------------------------

#[test]
fn isolated_edits_share_nothing() {
    let graph = mlp();
    let target = op_id(&graph, "dense_2");
    let first = replace(&graph, target, dense("r1", 5, 4), &EditOptions::default()).unwrap();
    let mut second = replace(&graph, target, dense("r2", 5, 4), &EditOptions::default()).unwrap();

    assert!(!first.shares_operations_with(&graph));
    assert!(!second.shares_operations_with(&graph));
    assert!(!first.shares_operations_with(&second));

    let d1 = op_id(&second, "dense_1");
    second.operation_mut(d1).unwrap().weights[0].fill(0.0);
    assert_eq!(kernel(&first, "dense_1"), kernel(&graph, "dense_1"));
    assert!(kernel(&graph, "dense_1").iter().any(|w| *w != 0.0));
}

/// x[3] -> {left, right} -> add -> out
fn branching() -> ModelGraph {
    let mut graph = ModelGraph::new();
    let x = graph.add_input(Operation::input("x", vec![3])).unwrap();
    let left = graph.add_operation(dense("left", 3, 4));
    let right = graph.add_operation(dense("right", 3, 4));
    let add = graph.add_operation(Operation::add("add"));
    let out = graph.add_operation(dense("out", 4, 1));
    let l = graph.apply(left, &[x]).unwrap();
    let r = graph.apply(right, &[x]).unwrap();
    let sum = graph.apply(add, &[l, r]).unwrap();
    let y = graph.apply(out, &[sum]).unwrap();
    graph.set_outputs(vec![y]).unwrap();
    graph
}

#[test]
fn multi_input_targets_are_rejected() {
    let graph = branching();
    let add = op_id(&graph, "add");

    let err = insert(
        &graph,
        add,
        Operation::activation("gate", ActivationFn::Sigmoid),
        &EditOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, EditError::MultiInputUnsupported { inbound: 2, .. }));

    let err = delete_operation(&graph, add, &EditOptions::default()).unwrap_err();
    assert!(matches!(err, EditError::MultiInputUnsupported { inbound: 2, .. }));

    // Replacing keeps every input, so it is allowed.
    let edited = replace(&graph, add, Operation::add("sum"), &EditOptions::default()).unwrap();
    assert_eq!(edited.inbound(edited.instances_of(op_id(&edited, "sum"))[0]).len(), 2);
}

#[test]
fn channel_deletion_into_add_is_unsupported() {
    let graph = branching();
    let err = delete_channels(
        &graph,
        op_id(&graph, "left"),
        &[0],
        &EditOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, EditError::UnsupportedOperationKind { kind: "Add", .. }));
}

#[test]
fn selector_outside_target_is_rejected() {
    let graph = mlp();
    let foreign = graph.instances_of(op_id(&graph, "dense_3"))[0];
    let err = delete_operation(
        &graph,
        op_id(&graph, "dense_2"),
        &EditOptions::at_nodes([foreign]),
    )
    .unwrap_err();
    assert!(matches!(err, EditError::NodeNotInstance { .. }));
}

#[test]
fn deleting_channels_from_weightless_operation_fails() {
    let graph = ModelGraph::sequential(
        Operation::input("x", vec![3]),
        [
            Operation::activation("relu", ActivationFn::Relu),
            dense("dense_1", 3, 2),
        ],
    )
    .unwrap();
    let err = delete_channels(
        &graph,
        op_id(&graph, "relu"),
        &[0],
        &EditOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, EditError::MissingChannelDimension { .. }));
}
