#![allow(dead_code)]

use std::path::Path;

use mcuflow::setup::{Task, TaskBuilder, TaskEnv, TaskOutcome, TaskRegistry};

pub use mcuflow_test_utils::init_tracing;

/// A task whose body sets every provided key to `<task>:<key>`.
pub fn simple_task(name: &str, needs: &[&str], provides: &[&str]) -> Task {
    let provided: Vec<String> = provides.iter().map(|k| k.to_string()).collect();
    let task_name = name.to_string();
    TaskBuilder::new(name)
        .needs(needs.iter().copied())
        .provides(provides.iter().copied())
        .body(move |call| {
            for key in &provided {
                call.set(key, format!("{task_name}:{key}"));
            }
            Ok(TaskOutcome::Changed)
        })
        .build()
        .expect("valid task")
}

pub fn registry_of(tasks: Vec<Task>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for task in tasks {
        registry.register(task).expect("unique task names");
    }
    registry
}

pub fn task_env(dir: &Path) -> TaskEnv {
    TaskEnv {
        home: dir.to_path_buf(),
        deps_dir: dir.join("deps"),
        ..TaskEnv::default()
    }
}
