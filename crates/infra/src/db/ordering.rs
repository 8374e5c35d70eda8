//! Dependency ordering of flush operations.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

/// A node to order: `depends_on` lists keys that must come first.
#[derive(Debug, Clone)]
pub struct Node<K> {
    pub key: K,
    pub rank: u64,
    pub depends_on: Vec<K>,
}

/// Kahn's topological sort, breaking ties by ascending `rank`.
///
/// Dependencies on keys outside `nodes` are ignored. Nodes caught in a cycle
/// are appended in rank order so flushing still makes progress (the store then
/// reports whatever constraint the cycle violates).
pub fn topological_order<K>(nodes: Vec<Node<K>>) -> Vec<K>
where
    K: Clone + Eq + Hash,
{
    let index: HashMap<K, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.key.clone(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let unique: HashSet<usize> = node
            .depends_on
            .iter()
            .filter_map(|dep| index.get(dep).copied())
            .filter(|&d| d != i)
            .collect();
        in_degree[i] = unique.len();
        for d in unique {
            dependents[d].push(i);
        }
    }

    let mut ready: BTreeSet<(u64, usize)> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, n)| (n.rank, i))
        .collect();

    let mut emitted = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        let (_, i) = next;
        emitted[i] = true;
        order.push(i);
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((nodes[dependent].rank, dependent));
            }
        }
    }

    if order.len() < nodes.len() {
        let mut rest: Vec<usize> = (0..nodes.len()).filter(|&i| !emitted[i]).collect();
        rest.sort_by_key(|&i| nodes[i].rank);
        order.extend(rest);
    }

    order.into_iter().map(|i| nodes[i].key.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(key: &'static str, rank: u64, deps: &[&'static str]) -> Node<&'static str> {
        Node {
            key,
            rank,
            depends_on: deps.to_vec(),
        }
    }

    #[test]
    fn independent_nodes_keep_rank_order() {
        let order = topological_order(vec![node("c", 3, &[]), node("a", 1, &[]), node("b", 2, &[])]);
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn dependencies_come_first() {
        // job (rank 1) points at its stacktrace bytes (rank 2).
        let order = topological_order(vec![node("job", 1, &["bytes"]), node("bytes", 2, &[])]);
        assert_eq!(order, vec!["bytes", "job"]);
    }

    #[test]
    fn external_dependencies_are_ignored() {
        let order = topological_order(vec![node("incident", 1, &["job-elsewhere"])]);
        assert_eq!(order, vec!["incident"]);
    }

    #[test]
    fn cycles_still_emit_every_node() {
        let order = topological_order(vec![
            node("a", 1, &["b"]),
            node("b", 2, &["a"]),
            node("c", 3, &[]),
        ]);
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any acyclic graph (edges only point to lower indices),
        /// every dependency is emitted before its dependent and no node is lost.
        #[test]
        fn respects_every_edge(
            edges in prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), 1..24)
        ) {
            let nodes: Vec<Node<usize>> = edges
                .iter()
                .enumerate()
                .map(|(i, deps)| Node {
                    key: i,
                    rank: (edges.len() - i) as u64,
                    depends_on: if i == 0 {
                        Vec::new()
                    } else {
                        deps.iter().map(|d| d.index(i)).collect()
                    },
                })
                .collect();

            let order = topological_order(nodes.clone());
            prop_assert_eq!(order.len(), nodes.len());

            let position: HashMap<usize, usize> =
                order.iter().enumerate().map(|(pos, k)| (*k, pos)).collect();
            for n in &nodes {
                for dep in &n.depends_on {
                    prop_assert!(position[dep] < position[&n.key]);
                }
            }
        }
    }
}
