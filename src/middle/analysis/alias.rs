//! Per-proc alias analysis. Walks a body top-down maintaining a union-find
//! of possibly-aliased variables: the escapable foreign operations unite
//! their in/out pairs, calls replay the callee's parameter-level aliasing
//! through the actual arguments, and final uses of non-parameters drop out
//! of the map as the walk passes them. Along the way, `mutate` instructions
//! whose reference is provably unaliased and finally used are rewritten with
//! the destructive flag set.

use log::trace;

use crate::middle::{
    analysis::union_find::AliasMap,
    prim::{Prim, PrimArg, PrimFork, PrimParam, PrimVarName, ProcBody, ProcSpec},
};

/// Position of the destructive flag in a `mutate`'s argument list:
/// `mutate(inRef, outRef, size, offset, destructive, newVal)`.
const MUTATE_DESTRUCTIVE_ARG: usize = 4;
const MUTATE_NEW_VALUE_ARG: usize = 5;

/// Resolver for callee parameter lists and alias maps. Within an SCC the
/// driver answers from the current iteration's working set, so the fixed
/// point sees its own partial results.
pub type CalleeLookup<'a> = &'a dyn Fn(&ProcSpec) -> Option<(Vec<PrimParam>, AliasMap)>;

/// Analyses one proc body. Returns the alias map as of the end of the walk
/// (unfiltered) and the body with destructive flags rewritten.
pub fn analyse_proc_body(
    params: &[PrimVarName],
    body: &ProcBody,
    lookup: CalleeLookup,
) -> (AliasMap, ProcBody) {
    let analyser = Analyser { params, lookup };
    let mut map = AliasMap::new();
    let body = analyser.walk(body, &mut map);
    (map, body)
}

struct Analyser<'a> {
    params: &'a [PrimVarName],
    lookup: CalleeLookup<'a>,
}

impl<'a> Analyser<'a> {
    fn walk(&self, body: &ProcBody, map: &mut AliasMap) -> ProcBody {
        let mut prims = Vec::with_capacity(body.prims.len());

        for placed in &body.prims {
            let mut prim = placed.value.clone();

            // Destructive-update detection consults the state established by
            // everything before this prim, not the prim's own aliasing.
            if prim.is_foreign_named(crate::middle::prim::LPVM, "mutate") {
                self.try_make_destructive(&mut prim, map);
            }

            self.apply_prim(&prim, map);
            self.drop_final_uses(&prim, map);

            prims.push(placed.rewrap(prim));
        }

        let fork = match &body.fork {
            PrimFork::NoFork => PrimFork::NoFork,
            PrimFork::Fork {
                var,
                is_final,
                branches,
            } => {
                // Branches are analysed independently from fresh maps, then
                // joined: aliased anywhere means aliased afterwards.
                let mut new_branches = Vec::with_capacity(branches.len());
                for branch in branches {
                    let mut branch_map = AliasMap::new();
                    new_branches.push(self.walk(branch, &mut branch_map));
                    map.absorb(&branch_map);
                }
                PrimFork::Fork {
                    var: *var,
                    is_final: *is_final,
                    branches: new_branches,
                }
            }
        };

        ProcBody::new(prims, fork)
    }

    fn apply_prim(&self, prim: &Prim, map: &mut AliasMap) {
        if prim.escapable_name().is_some() {
            for input in prim.inputs() {
                let Some(in_name) = input.var_name() else {
                    continue;
                };
                for output in prim.outputs() {
                    if let Some(out_name) = output.var_name() {
                        map.unite(in_name, out_name);
                    }
                }
            }
            return;
        }

        if let Prim::Call { callee, args } = prim {
            let Some((callee_params, callee_map)) = (self.lookup)(callee) else {
                return;
            };

            // Replay each unification of callee formals onto the actual
            // arguments at the matching positions. Literal actuals carry no
            // aliasing.
            for (p, q) in callee_map.canonical_pairs() {
                let Some(a) = actual_for(&callee_params, args, p) else {
                    continue;
                };
                let Some(b) = actual_for(&callee_params, args, q) else {
                    continue;
                };
                trace!(target: "analysis", "call {callee}: {p} ~ {q} maps to {a} ~ {b}");
                map.unite(a, b);
            }
        }
    }

    /// After a prim, variables read for the last time stop mattering unless
    /// they are formal parameters (whose aliasing is the analysis result).
    fn drop_final_uses(&self, prim: &Prim, map: &mut AliasMap) {
        for arg in prim.args() {
            if let PrimArg::Var {
                name,
                final_use: true,
                ..
            } = arg
            {
                if !self.params.contains(name) {
                    map.remove(*name);
                }
            }
        }
    }

    /// `mutate(inRef, outRef, size, offset, destructive, newVal)`: the
    /// update may reuse the structure in place when the reference is its
    /// own class and this is its last use. A pointer-valued new value
    /// (a raw address or any constructor-typed value, both of which lower
    /// to heap references) must satisfy the same conditions, or the old
    /// structure could be reached through it.
    fn try_make_destructive(&self, prim: &mut Prim, map: &mut AliasMap) {
        let Prim::Foreign { args, .. } = prim else {
            return;
        };

        let already_destructive = matches!(
            args.get(MUTATE_DESTRUCTIVE_ARG),
            Some(PrimArg::Int { value: 1, .. })
        );
        if already_destructive {
            return;
        }

        let Some(PrimArg::Var {
            name: in_ref,
            final_use,
            ..
        }) = args.first()
        else {
            return;
        };

        if !final_use || !map.is_singleton(*in_ref) {
            return;
        }

        if let Some(PrimArg::Var {
            name: new_val,
            ty,
            final_use,
            ..
        }) = args.get(MUTATE_NEW_VALUE_ARG)
        {
            if ty.is_heap_reference() && (!final_use || !map.is_singleton(*new_val)) {
                return;
            }
        }

        if let Some(flag @ PrimArg::Int { .. }) = args.get_mut(MUTATE_DESTRUCTIVE_ARG) {
            trace!(target: "analysis", "marking mutate destructive");
            *flag = PrimArg::Int {
                value: 1,
                ty: flag.ty().clone(),
            };
        }
    }
}

/// Maps a callee formal parameter name to the caller-side variable bound at
/// its argument position.
fn actual_for(
    callee_params: &[PrimParam],
    args: &[PrimArg],
    formal: PrimVarName,
) -> Option<PrimVarName> {
    let position = callee_params.iter().position(|p| p.name == formal)?;
    args.get(position)?.var_name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::ast::{ModSpec, TypeSpec};
    use crate::frontend::intern::InternedSymbol;
    use crate::frontend::Placed;
    use crate::middle::prim::{ArgFlowType, PrimFlow, LPVM};

    fn v(name: &str, suffix: i32) -> PrimVarName {
        PrimVarName::new(InternedSymbol::new(name), suffix)
    }

    fn in_var(name: &str, suffix: i32, final_use: bool) -> PrimArg {
        PrimArg::Var {
            name: v(name, suffix),
            ty: TypeSpec::address(),
            flow: PrimFlow::In,
            flow_type: ArgFlowType::Ordinary,
            final_use,
        }
    }

    fn out_var(name: &str, suffix: i32) -> PrimArg {
        PrimArg::output_var(v(name, suffix), TypeSpec::address())
    }

    fn mutate(in_ref: PrimArg, out_ref: PrimArg, new_val: PrimArg) -> Prim {
        Prim::Foreign {
            lang: LPVM.into(),
            name: "mutate".into(),
            flags: Vec::new(),
            args: vec![
                in_ref,
                out_ref,
                PrimArg::int(16),
                PrimArg::int(0),
                PrimArg::int(0),
                new_val,
            ],
        }
    }

    fn no_callees(_: &ProcSpec) -> Option<(Vec<PrimParam>, AliasMap)> {
        None
    }

    fn destructive_flag(body: &ProcBody, index: usize) -> i64 {
        let Prim::Foreign { args, .. } = &body.prims[index].value else {
            panic!("expected a foreign prim");
        };
        let PrimArg::Int { value, .. } = &args[MUTATE_DESTRUCTIVE_ARG] else {
            panic!("expected the destructive flag");
        };
        *value
    }

    #[test]
    fn unaliased_final_mutate_becomes_destructive() {
        let body = ProcBody::new(
            vec![Placed::unplaced(mutate(
                in_var("r", 0, true),
                out_var("r", 1),
                PrimArg::int(7),
            ))],
            PrimFork::NoFork,
        );

        let (_, rewritten) = analyse_proc_body(&[], &body, &no_callees);
        assert_eq!(destructive_flag(&rewritten, 0), 1);
    }

    #[test]
    fn aliased_reference_is_not_destructive() {
        // y = move(r); mutate(r, r2, ...): r is aliased by y at the mutate.
        let body = ProcBody::new(
            vec![
                Placed::unplaced(Prim::move_prim(in_var("r", 0, false), out_var("y", 0))),
                Placed::unplaced(mutate(
                    in_var("r", 0, true),
                    out_var("r", 1),
                    PrimArg::int(7),
                )),
            ],
            PrimFork::NoFork,
        );

        let (map, rewritten) = analyse_proc_body(&[v("r", 0)], &body, &no_callees);
        assert_eq!(destructive_flag(&rewritten, 1), 0);
        assert!(map.aliased(v("r", 0), v("y", 0)));
    }

    #[test]
    fn non_final_use_is_not_destructive() {
        let body = ProcBody::new(
            vec![Placed::unplaced(mutate(
                in_var("r", 0, false),
                out_var("r", 1),
                PrimArg::int(7),
            ))],
            PrimFork::NoFork,
        );

        let (_, rewritten) = analyse_proc_body(&[], &body, &no_callees);
        assert_eq!(destructive_flag(&rewritten, 0), 0);
    }

    #[test]
    fn pointer_new_value_must_also_be_unaliased() {
        // The new value is address-typed and still used later, so the
        // mutate must stay non-destructive even though inRef qualifies.
        let body = ProcBody::new(
            vec![Placed::unplaced(mutate(
                in_var("r", 0, true),
                out_var("r", 1),
                in_var("p", 0, false),
            ))],
            PrimFork::NoFork,
        );

        let (_, rewritten) = analyse_proc_body(&[], &body, &no_callees);
        assert_eq!(destructive_flag(&rewritten, 0), 0);
    }

    #[test]
    fn constructor_typed_new_value_counts_as_pointer() {
        // The new value has a user constructor type, which lowers to a heap
        // reference just like a raw address; while it is still in use the
        // mutate must stay non-destructive.
        let pair_ty = TypeSpec::simple(ModSpec::from_segments(&["m"]), "pair");
        let new_val = PrimArg::Var {
            name: v("p", 0),
            ty: pair_ty,
            flow: PrimFlow::In,
            flow_type: ArgFlowType::Ordinary,
            final_use: false,
        };
        let body = ProcBody::new(
            vec![Placed::unplaced(mutate(
                in_var("r", 0, true),
                out_var("r", 1),
                new_val,
            ))],
            PrimFork::NoFork,
        );

        let (_, rewritten) = analyse_proc_body(&[], &body, &no_callees);
        assert_eq!(destructive_flag(&rewritten, 0), 0);
    }

    #[test]
    fn callee_aliasing_maps_through_arguments() {
        // Callee q(a, b) unites its two parameters; calling q(u, v) must
        // unite u and v in the caller.
        let q = ProcSpec::new(ModSpec::from_segments(&["m"]), InternedSymbol::new("q"), 0);
        let q_params = vec![
            PrimParam {
                name: v("a", 0),
                ty: TypeSpec::address(),
                flow: PrimFlow::In,
                flow_type: ArgFlowType::Ordinary,
            },
            PrimParam {
                name: v("b", 0),
                ty: TypeSpec::address(),
                flow: PrimFlow::In,
                flow_type: ArgFlowType::Ordinary,
            },
        ];
        let mut q_map = AliasMap::new();
        q_map.unite(v("a", 0), v("b", 0));

        let lookup = move |spec: &ProcSpec| {
            (*spec == q).then(|| (q_params.clone(), q_map.clone()))
        };

        let body = ProcBody::new(
            vec![Placed::unplaced(Prim::Call {
                callee: ProcSpec::new(
                    ModSpec::from_segments(&["m"]),
                    InternedSymbol::new("q"),
                    0,
                ),
                args: vec![in_var("u", 0, false), in_var("v", 0, false)],
            })],
            PrimFork::NoFork,
        );

        let (map, _) = analyse_proc_body(&[v("u", 0), v("v", 0)], &body, &lookup);
        assert!(map.aliased(v("u", 0), v("v", 0)));
    }

    #[test]
    fn final_use_of_non_parameter_leaves_the_map() {
        // t aliases r through a move, but t's final use is that same move's
        // consumer; afterwards only parameters remain.
        let body = ProcBody::new(
            vec![
                Placed::unplaced(Prim::move_prim(in_var("r", 0, false), out_var("t", 0))),
                Placed::unplaced(Prim::move_prim(in_var("t", 0, true), out_var("s", 0))),
            ],
            PrimFork::NoFork,
        );

        let (map, _) = analyse_proc_body(&[v("r", 0)], &body, &no_callees);

        // t was removed after its final use; r and s remain aliased via the
        // chain through t.
        assert!(map.aliased(v("r", 0), v("s", 0)));
        assert!(map.is_singleton(v("t", 0)));
    }

    #[test]
    fn branch_aliasing_joins_into_the_parent() {
        let branch = ProcBody::new(
            vec![Placed::unplaced(Prim::move_prim(
                in_var("r", 0, false),
                out_var("y", 0),
            ))],
            PrimFork::NoFork,
        );
        let empty_branch = ProcBody::empty();
        let body = ProcBody::new(
            Vec::new(),
            PrimFork::Fork {
                var: v("c", 0),
                is_final: true,
                branches: vec![empty_branch, branch],
            },
        );

        let (map, _) = analyse_proc_body(&[v("r", 0)], &body, &no_callees);
        assert!(map.aliased(v("r", 0), v("y", 0)));
    }
}
