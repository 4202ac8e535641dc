//! Strongly connected components of the proc call graph. Analysis runs
//! bottom-up over these, so the components are produced callee-first; an
//! explicit work stack keeps pathological call chains from overflowing the
//! real stack.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::middle::prim::{Prim, ProcBody, ProcSpec};

/// Collects the procs a body calls. Only `Call` prims contribute edges;
/// foreign instructions are leaves by definition.
pub fn callees_of(body: &ProcBody) -> Vec<ProcSpec> {
    let mut callees = Vec::new();
    body.visit_prims(&mut |prim| {
        if let Prim::Call { callee, .. } = &prim.value {
            callees.push(callee.clone());
        }
    });
    callees.sort();
    callees.dedup();
    callees
}

/// Tarjan's algorithm, iteratively. Components come out in reverse
/// topological order: every callee's component appears before any of its
/// callers' (mutual recursion lands both in one component).
pub fn call_graph_sccs(graph: &BTreeMap<ProcSpec, Vec<ProcSpec>>) -> Vec<Vec<ProcSpec>> {
    let nodes: Vec<&ProcSpec> = graph.keys().collect();
    let index_of: HashMap<&ProcSpec, usize> =
        nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let successors: Vec<Vec<usize>> = nodes
        .iter()
        .map(|node| {
            graph[*node]
                .iter()
                .filter_map(|callee| index_of.get(callee).copied())
                .collect()
        })
        .collect();

    const UNVISITED: usize = usize::MAX;

    let mut discovery = vec![UNVISITED; nodes.len()];
    let mut lowlink = vec![0usize; nodes.len()];
    let mut on_stack = vec![false; nodes.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    // (node, next successor position) frames replace recursion.
    let mut work: Vec<(usize, usize)> = Vec::new();

    for root in 0..nodes.len() {
        if discovery[root] != UNVISITED {
            continue;
        }

        work.push((root, 0));
        while let Some((node, child_pos)) = work.pop() {
            if child_pos == 0 {
                discovery[node] = next_index;
                lowlink[node] = next_index;
                next_index += 1;
                stack.push(node);
                on_stack[node] = true;
            } else {
                // Returning from a child: fold its lowlink in.
                let child = successors[node][child_pos - 1];
                lowlink[node] = lowlink[node].min(lowlink[child]);
            }

            let mut deferred = false;
            for pos in child_pos..successors[node].len() {
                let child = successors[node][pos];
                if discovery[child] == UNVISITED {
                    work.push((node, pos + 1));
                    work.push((child, 0));
                    deferred = true;
                    break;
                }
                if on_stack[child] {
                    lowlink[node] = lowlink[node].min(discovery[child]);
                }
            }
            if deferred {
                continue;
            }

            if lowlink[node] == discovery[node] {
                let mut component = Vec::new();
                loop {
                    let member = stack.pop().expect("scc stack underflow");
                    on_stack[member] = false;
                    component.push(nodes[member].clone());
                    if member == node {
                        break;
                    }
                }
                component.sort();
                components.push(component);
            }
        }
    }

    components
}

/// Whether a single-proc component actually calls itself (self-recursion
/// needs fixed-point iteration just like mutual recursion does).
pub fn is_self_recursive(spec: &ProcSpec, graph: &BTreeMap<ProcSpec, Vec<ProcSpec>>) -> bool {
    graph
        .get(spec)
        .is_some_and(|callees| callees.contains(spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::ModSpec;
    use crate::frontend::intern::InternedSymbol;

    fn spec(name: &str) -> ProcSpec {
        ProcSpec::new(
            ModSpec::from_segments(&["m"]),
            InternedSymbol::new(name),
            0,
        )
    }

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<ProcSpec, Vec<ProcSpec>> {
        edges
            .iter()
            .map(|(from, tos)| (spec(from), tos.iter().map(|t| spec(t)).collect()))
            .collect()
    }

    #[test]
    fn callees_come_before_callers() {
        // a -> b -> c, all acyclic
        let graph = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        let sccs = call_graph_sccs(&graph);

        assert_eq!(sccs.len(), 3);
        let position = |name: &str| {
            sccs.iter()
                .position(|scc| scc.contains(&spec(name)))
                .unwrap()
        };
        assert!(position("c") < position("b"));
        assert!(position("b") < position("a"));
    }

    #[test]
    fn mutual_recursion_forms_one_component() {
        let graph = graph(&[("even", &["odd"]), ("odd", &["even"]), ("main", &["even"])]);
        let sccs = call_graph_sccs(&graph);

        assert_eq!(sccs.len(), 2);
        assert_eq!(sccs[0].len(), 2);
        assert!(sccs[0].contains(&spec("even")) && sccs[0].contains(&spec("odd")));
        assert_eq!(sccs[1], vec![spec("main")]);
    }

    #[test]
    fn self_recursion_is_detected() {
        let graph = graph(&[("loopy", &["loopy"]), ("plain", &[])]);
        assert!(is_self_recursive(&spec("loopy"), &graph));
        assert!(!is_self_recursive(&spec("plain"), &graph));

        let sccs = call_graph_sccs(&graph);
        assert_eq!(sccs.len(), 2);
    }

    #[test]
    fn edges_to_unknown_procs_are_ignored() {
        let graph = graph(&[("a", &["external"])]);
        let sccs = call_graph_sccs(&graph);
        assert_eq!(sccs, vec![vec![spec("a")]]);
    }
}
