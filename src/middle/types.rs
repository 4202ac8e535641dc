//! Structural type propagation over lowered procs. There is no inference
//! engine here: types flow from prototypes, literals, and the built-in
//! operations outward until nothing changes, which is enough to discharge
//! the code generator's no-unspecified-types requirement for well-formed
//! programs. Generated continuation and loop procs pick their parameter
//! types up from their call sites.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use log::trace;

use crate::{
    frontend::ast::TypeSpec,
    middle::{
        analysis::ProcInfo,
        prim::{Prim, PrimArg, PrimFork, PrimVarName, ProcBody, ProcSpec},
    },
};

/// Fills unspecified argument and parameter types across the proc set.
/// `external` supplies parameter types for callees outside the set.
pub fn propagate_types(
    procs: &mut BTreeMap<ProcSpec, ProcInfo>,
    external: &dyn Fn(&ProcSpec) -> Option<Vec<TypeSpec>>,
) {
    let mut changed = true;
    while changed {
        changed = false;

        // Parameter types discovered at call sites, applied after the scan
        // of each round.
        let mut param_updates: Vec<(ProcSpec, usize, TypeSpec)> = Vec::new();

        let specs: Vec<ProcSpec> = procs.keys().cloned().collect();
        for spec in &specs {
            // Call arguments pick up types from the callee's parameters and
            // vice versa.
            let callee_types = |callee: &ProcSpec| -> Option<Vec<TypeSpec>> {
                match procs.get(callee) {
                    Some(info) => Some(
                        info.proto
                            .params
                            .iter()
                            .map(|p| p.ty.clone())
                            .collect(),
                    ),
                    None => external(callee),
                }
            };

            let mut known: HashMap<PrimVarName, TypeSpec> = HashMap::new();
            let info = &procs[spec];
            for param in &info.proto.params {
                if !param.ty.is_unspecified() {
                    known.insert(param.name, param.ty.clone());
                }
            }
            collect_known(&info.body, &mut known);

            let mut body = info.body.clone();
            if fill_body(&mut body, &known, &callee_types, &mut param_updates) {
                changed = true;
            }

            let info = procs.get_mut(spec).expect("proc in set");
            info.body = body;

            // Parameters whose types the body itself reveals.
            for param in info.proto.params.iter_mut() {
                if param.ty.is_unspecified() {
                    if let Some(ty) = known.get(&param.name) {
                        trace!(target: "driver", "typed parameter {} of {spec}", param.name);
                        param.ty = ty.clone();
                        changed = true;
                    }
                }
            }
        }

        for (spec, index, ty) in param_updates {
            let info = procs.get_mut(&spec).expect("update targets known proc");
            let param = &mut info.proto.params[index];
            if param.ty.is_unspecified() {
                trace!(target: "driver", "typed parameter {} of {spec} from call site", param.name);
                param.ty = ty;
                changed = true;
            }
        }
    }
}

/// Records every variable whose type some argument already states.
fn collect_known(body: &ProcBody, known: &mut HashMap<PrimVarName, TypeSpec>) {
    body.visit_prims(&mut |prim| {
        for arg in prim.value.args() {
            if let PrimArg::Var { name, ty, .. } = arg {
                if !ty.is_unspecified() {
                    known.entry(*name).or_insert_with(|| ty.clone());
                }
            }
        }
    });
}

fn fill_body(
    body: &mut ProcBody,
    known: &HashMap<PrimVarName, TypeSpec>,
    callee_types: &dyn Fn(&ProcSpec) -> Option<Vec<TypeSpec>>,
    param_updates: &mut Vec<(ProcSpec, usize, TypeSpec)>,
) -> bool {
    let mut changed = false;

    for placed in &mut body.prims {
        if let Prim::Call { callee, args } = &placed.value {
            if let Some(param_tys) = callee_types(callee) {
                for (index, (arg, param_ty)) in args.iter().zip(param_tys.iter()).enumerate() {
                    if param_ty.is_unspecified() && !arg.ty().is_unspecified() {
                        param_updates.push((callee.clone(), index, arg.ty().clone()));
                    }
                }
            }
        }

        let callee_param_tys = match &placed.value {
            Prim::Call { callee, .. } => callee_types(callee),
            _ => None,
        };

        if let Some(args) = placed.value.args_mut() {
            for (index, arg) in args.iter_mut().enumerate() {
                if !arg.ty().is_unspecified() {
                    continue;
                }

                let from_var = match arg {
                    PrimArg::Var { name, .. } => known.get(name).cloned(),
                    _ => None,
                };
                let from_callee = callee_param_tys
                    .as_ref()
                    .and_then(|tys| tys.get(index))
                    .filter(|ty| !ty.is_unspecified())
                    .cloned();

                if let Some(ty) = from_var.or(from_callee) {
                    *arg = retyped(arg.clone(), ty);
                    changed = true;
                }
            }
        }
    }

    if let PrimFork::Fork { branches, .. } = &mut body.fork {
        for branch in branches {
            if fill_body(branch, known, callee_types, param_updates) {
                changed = true;
            }
        }
    }

    changed
}

fn retyped(arg: PrimArg, ty: TypeSpec) -> PrimArg {
    match arg {
        PrimArg::Var {
            name,
            flow,
            flow_type,
            final_use,
            ..
        } => PrimArg::Var {
            name,
            ty,
            flow,
            flow_type,
            final_use,
        },
        other => other,
    }
}
