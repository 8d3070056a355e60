mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::Harness;
use deploygraph::{TaskContext, TaskStatus};
use proptest::prelude::*;

// Acyclic by construction: task i may only depend on tasks 0..i.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<bool>)> {
    (1..=max_tasks)
        .prop_flat_map(|n| {
            (
                proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n),
                proptest::collection::vec(proptest::bool::weighted(0.2), n),
            )
        })
        .prop_map(|(raw, failing)| {
            let deps = raw
                .into_iter()
                .enumerate()
                .map(|(i, candidates)| {
                    let mut deps: Vec<usize> = if i == 0 {
                        Vec::new()
                    } else {
                        candidates.into_iter().map(|c| c % i).collect()
                    };
                    deps.sort_unstable();
                    deps.dedup();
                    deps
                })
                .collect();
            (deps, failing)
        })
}

fn task_name(i: usize) -> String {
    format!("task_{i}")
}

fn run_graph(deps: &[Vec<usize>], failing: &[bool]) -> Vec<(TaskStatus, usize)> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let h = Harness::new();
        let mut graph = h.graph("dep-property").await;
        let calls: Vec<Arc<AtomicUsize>> =
            (0..deps.len()).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        for (i, task_deps) in deps.iter().enumerate() {
            let dep_names: Vec<String> = task_deps.iter().map(|&d| task_name(d)).collect();
            let dep_refs: Vec<&str> = dep_names.iter().map(String::as_str).collect();
            let counter = calls[i].clone();
            let fail = failing[i];
            graph.add_task(
                task_name(i),
                move |_ctx: TaskContext| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if fail {
                            anyhow::bail!("injected failure");
                        }
                        Ok::<usize, anyhow::Error>(i)
                    }
                },
                &dep_refs,
            );
        }

        let outcome = tokio::time::timeout(Duration::from_secs(10), graph.run()).await;
        assert!(outcome.is_ok(), "graph did not terminate");

        (0..deps.len())
            .map(|i| {
                let status = graph.node(&task_name(i)).unwrap().status();
                (status, calls[i].load(Ordering::SeqCst))
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn failures_cascade_to_every_transitive_dependent(
        (deps, failing) in dag_strategy(10)
    ) {
        let results = run_graph(&deps, &failing);

        let mut doomed = vec![false; deps.len()];
        for i in 0..deps.len() {
            let upstream_failed = deps[i].iter().any(|&d| doomed[d]);
            doomed[i] = failing[i] || upstream_failed;

            let (status, calls) = results[i];
            prop_assert!(status.is_terminal());
            if upstream_failed {
                prop_assert_eq!(status, TaskStatus::Failed);
                prop_assert_eq!(calls, 0);
            } else {
                prop_assert_eq!(calls, 1);
                let expected = if failing[i] { TaskStatus::Failed } else { TaskStatus::Completed };
                prop_assert_eq!(status, expected);
            }
        }
    }
}
