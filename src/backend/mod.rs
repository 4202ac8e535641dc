//! The boundary between the middle end and code generation. The emitter
//! consumes alias-annotated primitive form and is deterministic given three
//! guarantees, checked here: every argument carries a concrete type, every
//! called proc resolves, and bodies are well-formed SSA trees.

use hashbrown::HashSet;

use crate::{
    frontend::ast::TypeSpec,
    middle::prim::{Prim, PrimFork, PrimProto, PrimVarName, ProcBody},
};

pub mod llvm;

/// Checks the code generator's input contract on one proc. Returns the
/// problems found; an empty list means the proc is safe to emit. Also
/// enforces the structural invariants of the primitive form: single static
/// assignment along every path, no reads of undefined variables, and forks
/// with at least two branches.
pub fn verify_proc(proto: &PrimProto, body: &ProcBody) -> Vec<String> {
    let mut problems = Vec::new();

    for param in &proto.params {
        if param.ty.is_unspecified() {
            problems.push(format!(
                "parameter {} of {} has no concrete type",
                param.name, proto.name
            ));
        }
    }

    let defined: HashSet<PrimVarName> = proto
        .params
        .iter()
        .filter(|p| p.flow == crate::middle::prim::PrimFlow::In)
        .map(|p| p.name)
        .collect();

    verify_body(proto, body, &defined, &mut problems);
    problems
}

fn verify_body(
    proto: &PrimProto,
    body: &ProcBody,
    defined: &HashSet<PrimVarName>,
    problems: &mut Vec<String>,
) {
    let mut defined = defined.clone();

    for placed in &body.prims {
        let prim = &placed.value;

        for arg in prim.args() {
            if arg.ty().is_unspecified() {
                problems.push(format!(
                    "argument {arg} of `{prim}` in {} has no concrete type",
                    proto.name
                ));
            }
        }

        // Reads must see an earlier definition on this path.
        for arg in prim.inputs() {
            if let Some(name) = arg.var_name() {
                if !defined.contains(&name) {
                    problems.push(format!(
                        "variable {name} read before assignment in {}",
                        proto.name
                    ));
                }
            }
        }

        // Single static assignment along the path.
        for arg in prim.outputs() {
            if let Some(name) = arg.var_name() {
                if !defined.insert(name) {
                    problems.push(format!(
                        "variable {name} assigned twice in {}",
                        proto.name
                    ));
                }
            }
        }

        if let Prim::Guard { var, .. } = prim {
            if !defined.contains(var) {
                problems.push(format!(
                    "guard variable {var} read before assignment in {}",
                    proto.name
                ));
            }
        }
    }

    match &body.fork {
        PrimFork::NoFork => {}
        PrimFork::Fork { var, branches, .. } => {
            if !defined.contains(var) {
                problems.push(format!(
                    "fork variable {var} read before assignment in {}",
                    proto.name
                ));
            }
            if branches.len() < 2 {
                problems.push(format!(
                    "fork on {var} in {} has fewer than two branches",
                    proto.name
                ));
            }
            for branch in branches {
                verify_body(proto, branch, &defined, problems);
            }
        }
    }
}

/// The LLVM-level type of a value. Everything boxed (constructor values,
/// strings, raw addresses) is a pointer.
pub fn llvm_type(ty: &TypeSpec) -> &'static str {
    if *ty == TypeSpec::boolean() {
        "i1"
    } else if *ty == TypeSpec::int() {
        "i64"
    } else if *ty == TypeSpec::float() {
        "double"
    } else if *ty == TypeSpec::char() {
        "i8"
    } else {
        "ptr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::intern::InternedSymbol;
    use crate::frontend::Placed;
    use crate::middle::prim::{ArgFlowType, PrimArg, PrimFlow, PrimParam};

    fn v(name: &str, suffix: i32) -> PrimVarName {
        PrimVarName::new(InternedSymbol::new(name), suffix)
    }

    fn proto(params: Vec<PrimParam>) -> PrimProto {
        PrimProto {
            name: InternedSymbol::new("p"),
            params,
        }
    }

    fn in_param(name: &str) -> PrimParam {
        PrimParam {
            name: v(name, 0),
            ty: TypeSpec::int(),
            flow: PrimFlow::In,
            flow_type: ArgFlowType::Ordinary,
        }
    }

    #[test]
    fn read_before_assignment_is_flagged() {
        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::move_prim(
                PrimArg::input_var(v("ghost", 0), TypeSpec::int()),
                PrimArg::output_var(v("y", 0), TypeSpec::int()),
            ))],
            PrimFork::NoFork,
        );

        let problems = verify_proc(&proto(vec![]), &body);
        assert!(problems.iter().any(|p| p.contains("read before assignment")));
    }

    #[test]
    fn double_assignment_is_flagged() {
        let assign = |src: i64| {
            Placed::unplaced(Prim::move_prim(
                PrimArg::int(src),
                PrimArg::output_var(v("y", 0), TypeSpec::int()),
            ))
        };
        let body = ProcBody::new(vec![assign(1), assign(2)], PrimFork::NoFork);

        let problems = verify_proc(&proto(vec![]), &body);
        assert!(problems.iter().any(|p| p.contains("assigned twice")));
    }

    #[test]
    fn sibling_branches_may_assign_the_same_variable() {
        let branch = ProcBody::new(
            vec![Placed::unplaced(Prim::move_prim(
                PrimArg::int(1),
                PrimArg::output_var(v("y", 0), TypeSpec::int()),
            ))],
            PrimFork::NoFork,
        );
        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::move_prim(
                PrimArg::int(0),
                PrimArg::output_var(v("c", 0), TypeSpec::boolean()),
            ))],
            PrimFork::Fork {
                var: v("c", 0),
                is_final: true,
                branches: vec![branch.clone(), branch],
            },
        );

        let problems = verify_proc(&proto(vec![]), &body);
        assert!(problems.is_empty(), "{problems:?}");
    }

    #[test]
    fn unspecified_type_is_flagged() {
        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::move_prim(
                PrimArg::input_var(v("x", 0), TypeSpec::Unspecified),
                PrimArg::output_var(v("y", 0), TypeSpec::int()),
            ))],
            PrimFork::NoFork,
        );

        let problems = verify_proc(&proto(vec![in_param("x")]), &body);
        assert!(problems.iter().any(|p| p.contains("no concrete type")));
    }

    #[test]
    fn single_branch_fork_is_flagged() {
        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::move_prim(
                PrimArg::int(0),
                PrimArg::output_var(v("c", 0), TypeSpec::boolean()),
            ))],
            PrimFork::Fork {
                var: v("c", 0),
                is_final: true,
                branches: vec![ProcBody::empty()],
            },
        );

        let problems = verify_proc(&proto(vec![]), &body);
        assert!(problems.iter().any(|p| p.contains("fewer than two branches")));
    }
}
