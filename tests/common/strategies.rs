use flowrun_core::models::{Edge, Step};
use proptest::prelude::*;

/// Step ids "s0".."s{n-1}"; distinct after template-name derivation
fn steps(n: usize) -> Vec<Step> {
    (0..n)
        .map(|i| Step::new(format!("s{i}"), format!("x{i} = {i}")))
        .collect()
}

/// Strategy for generating acyclic flows: edges only point from lower to higher index
pub fn acyclic_flow_strategy() -> impl Strategy<Value = (Vec<Step>, Vec<Edge>)> {
    (1usize..8)
        .prop_flat_map(|n| {
            let pairs = n * n.saturating_sub(1) / 2;
            (Just(n), prop::collection::vec(any::<bool>(), pairs))
        })
        .prop_map(|(n, include)| {
            let mut edges = Vec::new();
            let mut k = 0;
            for i in 0..n {
                for j in (i + 1)..n {
                    if include[k] {
                        edges.push(Edge::new(format!("s{i}"), format!("s{j}")));
                    }
                    k += 1;
                }
            }
            (steps(n), edges)
        })
}

/// Strategy for generating flows that contain at least one cycle or self-loop
pub fn cyclic_flow_strategy() -> impl Strategy<Value = (Vec<Step>, Vec<Edge>)> {
    acyclic_flow_strategy()
        .prop_flat_map(|(steps, edges)| {
            let n = steps.len();
            (Just(steps), Just(edges), 0..n, 0..n)
        })
        .prop_map(|(steps, mut edges, a, b)| {
            let (low, high) = (a.min(b), a.max(b));
            edges.push(Edge::new(format!("s{low}"), format!("s{high}")));
            edges.push(Edge::new(format!("s{high}"), format!("s{low}")));
            (steps, edges)
        })
}

/// Strategy for generating an edge endpoint that names no step
pub fn unknown_step_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,6}_missing"
}
