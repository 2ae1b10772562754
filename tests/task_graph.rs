// tests/task_graph.rs

mod common;

use std::collections::{BTreeSet, HashMap};

use mcuflow::errors::McuflowError;
use mcuflow::setup::TaskGraph;
use proptest::prelude::*;

use common::{registry_of, simple_task};

#[test]
fn install_order_respects_providers() {
    let registry = registry_of(vec![
        simple_task("tvm", &["llvm.install_dir"], &["tvm.src_dir"]),
        simple_task("llvm", &[], &["llvm.install_dir"]),
        simple_task("mlif", &["tvm.src_dir", "llvm.install_dir"], &["mlif.src_dir"]),
    ]);

    let graph = TaskGraph::build(&registry).unwrap();
    let order = graph.install_order();
    let pos = |name: &str| order.iter().position(|n| n == name).unwrap();

    assert_eq!(order.len(), 3);
    assert!(pos("llvm") < pos("tvm"));
    assert!(pos("tvm") < pos("mlif"));
    assert_eq!(graph.provider_of("tvm.src_dir"), Some("tvm"));
    assert_eq!(graph.dependencies_of("mlif").len(), 2);
}

#[test]
fn duplicate_edges_are_collapsed() {
    let registry = registry_of(vec![
        simple_task("llvm", &[], &["llvm.install_dir", "llvm.version"]),
        simple_task("tvm", &["llvm.install_dir", "llvm.version"], &[]),
    ]);

    let graph = TaskGraph::build(&registry).unwrap();
    let edges: Vec<(&str, &str)> = graph.edges().collect();
    assert_eq!(edges, vec![("llvm", "tvm")]);
    assert_eq!(graph.dependents_of("llvm"), &["tvm".to_string()]);
}

#[test]
fn unresolved_dependency_is_reported() {
    let registry = registry_of(vec![simple_task("tvm", &["llvm.install_dir"], &[])]);

    match TaskGraph::build(&registry) {
        Err(McuflowError::UnresolvedDependency { task, key }) => {
            assert_eq!(task, "tvm");
            assert_eq!(key, "llvm.install_dir");
        }
        other => panic!("expected UnresolvedDependency, got {other:?}"),
    }
}

#[test]
fn two_providers_for_one_key_are_rejected() {
    let registry = registry_of(vec![
        simple_task("a", &[], &["shared.key"]),
        simple_task("b", &[], &["shared.key"]),
    ]);

    assert!(matches!(
        TaskGraph::build(&registry),
        Err(McuflowError::AmbiguousProvider { key, .. }) if key == "shared.key"
    ));
}

#[test]
fn duplicate_task_names_are_rejected() {
    let mut registry = registry_of(vec![simple_task("llvm", &[], &["x"])]);
    let err = registry.register(simple_task("llvm", &[], &["y"])).unwrap_err();
    assert!(matches!(err, McuflowError::DuplicateTask(name) if name == "llvm"));
    assert_eq!(registry.len(), 1);
}

#[test]
fn dependency_cycle_is_rejected() {
    let registry = registry_of(vec![
        simple_task("a", &["b.out"], &["a.out"]),
        simple_task("b", &["a.out"], &["b.out"]),
    ]);

    assert!(matches!(
        TaskGraph::build(&registry),
        Err(McuflowError::DagCycle(_))
    ));
}

#[test]
fn dot_output_lists_nodes_and_edges() {
    let registry = registry_of(vec![
        simple_task("llvm", &[], &["llvm.install_dir"]),
        simple_task("tvm", &["llvm.install_dir"], &[]),
    ]);
    let dot = TaskGraph::build(&registry).unwrap().to_dot();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("\"llvm\" -> \"tvm\";"));
}

// Task i may only need keys of tasks 0..i, which keeps the graph acyclic.
fn acyclic_deps_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<BTreeSet<usize>>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        proptest::collection::vec(
            proptest::collection::vec(any::<usize>(), 0..num_tasks),
            num_tasks,
        )
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, picks)| {
                    if i == 0 {
                        BTreeSet::new()
                    } else {
                        picks.into_iter().map(|p| p % i).collect()
                    }
                })
                .collect()
        })
    })
}

proptest! {
    #[test]
    fn every_task_follows_its_providers(deps in acyclic_deps_strategy(12)) {
        let tasks = deps
            .iter()
            .enumerate()
            .map(|(i, needs)| {
                let needs: Vec<String> = needs.iter().map(|d| format!("key_{d}")).collect();
                let needs: Vec<&str> = needs.iter().map(String::as_str).collect();
                let provides = format!("key_{i}");
                simple_task(&format!("task_{i}"), &needs, &[provides.as_str()])
            })
            .collect();
        let graph = TaskGraph::build(&registry_of(tasks)).unwrap();

        let order = graph.install_order();
        prop_assert_eq!(order.len(), deps.len());
        let pos: HashMap<&str, usize> =
            order.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        for (from, to) in graph.edges() {
            prop_assert!(pos[from] < pos[to], "{} must come before {}", from, to);
        }
    }
}
