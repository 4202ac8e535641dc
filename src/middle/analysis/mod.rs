//! Bottom-up alias analysis over the call graph. Procs are grouped into
//! strongly connected components, processed callee-first; cyclic components
//! iterate until no member's parameter alias map changes between rounds.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use log::debug;
use serde::{Deserialize, Serialize};

pub mod alias;
pub mod callgraph;
pub mod union_find;

use crate::middle::prim::{PrimArg, PrimFork, PrimParam, PrimProto, PrimVarName, ProcBody, ProcSpec};
use union_find::AliasMap;

/// The analysis result attached to a lowered proc: how its non-phantom
/// formal parameters may alias one another.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcAnalysis {
    pub arg_alias_map: AliasMap,
}

/// A proc as the analysis sees it.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub proto: PrimProto,
    pub body: ProcBody,
    pub analysis: ProcAnalysis,
}

/// Analyses a set of procs in place: bodies get their destructive-mutate
/// rewrites, and each proc's `analysis` converges to its fixed point.
/// `external` answers for callees outside the set (earlier module SCCs).
pub fn analyse_procs(
    procs: &mut BTreeMap<ProcSpec, ProcInfo>,
    external: &dyn Fn(&ProcSpec) -> Option<(Vec<PrimParam>, AliasMap)>,
) {
    let graph: BTreeMap<ProcSpec, Vec<ProcSpec>> = procs
        .iter()
        .map(|(spec, info)| (spec.clone(), callgraph::callees_of(&info.body)))
        .collect();

    for scc in callgraph::call_graph_sccs(&graph) {
        let cyclic = scc.len() > 1
            || scc
                .first()
                .is_some_and(|only| callgraph::is_self_recursive(only, &graph));

        debug!(
            target: "analysis",
            "analysing component of {} proc(s){}",
            scc.len(),
            if cyclic { " to a fixed point" } else { "" }
        );

        let mut changed = true;
        while changed {
            changed = false;

            for spec in &scc {
                let before = procs[spec].analysis.arg_alias_map.canonical_pairs();

                let (map, body) = {
                    let lookup = |callee: &ProcSpec| -> Option<(Vec<PrimParam>, AliasMap)> {
                        match procs.get(callee) {
                            Some(info) => Some((
                                info.proto.params.clone(),
                                info.analysis.arg_alias_map.clone(),
                            )),
                            None => external(callee),
                        }
                    };

                    let info = &procs[spec];
                    let params = info.proto.real_param_names();
                    let (raw_map, body) =
                        alias::analyse_proc_body(&params, &info.body, &lookup);
                    (raw_map.restricted_to(&params), body)
                };

                let after = map.canonical_pairs();

                let info = procs.get_mut(spec).expect("proc in component");
                info.body = body;
                info.analysis.arg_alias_map = map;

                // First-time population does not count as a change; only a
                // later refinement keeps the iteration going.
                if after != before && !before.is_empty() {
                    changed = true;
                }
            }

            if !cyclic {
                break;
            }
        }
    }
}

/// Marks the last read of each variable along every root-to-leaf path.
/// Lowering produces bodies with the flag unset; this backward scan supplies
/// what the alias analysis assumes is already correct.
pub fn mark_final_uses(body: &mut ProcBody) {
    mark_body(body);
}

/// Returns the variables read anywhere in the subtree, marking final uses
/// on the way back up.
fn mark_body(body: &mut ProcBody) -> HashSet<PrimVarName> {
    let mut used_later: HashSet<PrimVarName> = HashSet::new();

    if let PrimFork::Fork { var, branches, .. } = &mut body.fork {
        for branch in branches {
            used_later.extend(mark_body(branch));
        }
        used_later.insert(*var);
    }

    for placed in body.prims.iter_mut().rev() {
        // Everything this prim reads that nothing later on this path reads
        // is a final use here.
        let fresh: Vec<PrimVarName> = placed
            .value
            .inputs()
            .filter_map(|arg| arg.var_name())
            .filter(|name| !used_later.contains(name))
            .collect();

        if let Some(args) = placed.value.args_mut() {
            for arg in args.iter_mut() {
                if let PrimArg::Var {
                    name,
                    flow: crate::middle::prim::PrimFlow::In,
                    final_use,
                    ..
                } = arg
                {
                    if fresh.contains(name) {
                        *final_use = true;
                    }
                    used_later.insert(*name);
                }
            }
        }
    }

    used_later
}
