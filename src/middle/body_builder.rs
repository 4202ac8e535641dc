//! Assembles procedure bodies in primitive form. The builder is a stateful
//! writer: prims are pushed through `instr`, which applies the running input
//! substitution, folds constants, elides moves, and deduplicates repeated
//! computations before anything reaches the body. Forks are built from
//! copies of the builder state, one per branch.
//!
//! A builder instance is single-owner; it is never shared between branches
//! being built concurrently.

use hashbrown::{HashMap, HashSet};
use log::trace;

use crate::{
    error::{CompileError, Result},
    frontend::{ast::TypeSpec, OptPos, Placed},
    middle::prim::{Prim, PrimArg, PrimFork, PrimVarName, ProcBody, LLVM},
};

/// What a fork variable resolves to under the current substitution.
#[derive(Debug, Clone, PartialEq)]
pub enum ForkTarget {
    /// The variable is known at compile time; only the branch with this
    /// index can run.
    Literal(i64),
    Var(PrimVarName),
}

#[derive(Debug, Clone)]
pub struct BodyBuilder {
    /// Prims emitted so far, in order.
    prims: Vec<Placed<Prim>>,
    /// Set once the body has been sealed with a fork; no prim may follow.
    fork: Option<BuiltFork>,
    /// Input substitution: reads of a key resolve to the mapped argument.
    curr_subst: HashMap<PrimVarName, PrimArg>,
    /// Output renaming: an elided `move v ?out` records out -> v here; the
    /// defining occurrence of v is renamed to out when the body is taken.
    out_subst: HashMap<PrimVarName, PrimVarName>,
    /// Internal variables already claimed as the source of an output rename.
    claimed: HashSet<PrimVarName>,
    /// CSE table: canonical input-only skeleton to the outputs it produced.
    sub_exprs: HashMap<String, Vec<PrimArg>>,
    /// Formal parameter names of the proc under construction. Parameters are
    /// never renamed or substituted away.
    params: HashSet<PrimVarName>,
    /// Variables defined by a prim emitted into *this* builder (not an
    /// ancestor); only these may be renamed to an output.
    defined_here: HashSet<PrimVarName>,
}

#[derive(Debug, Clone)]
struct BuiltFork {
    var: PrimVarName,
    is_final: bool,
    branches: Vec<ProcBody>,
}

impl BodyBuilder {
    pub fn new(params: impl IntoIterator<Item = PrimVarName>) -> Self {
        Self {
            prims: Vec::new(),
            fork: None,
            curr_subst: HashMap::new(),
            out_subst: HashMap::new(),
            claimed: HashSet::new(),
            sub_exprs: HashMap::new(),
            params: params.into_iter().collect(),
            defined_here: HashSet::new(),
        }
    }

    /// A copy of this builder for lowering one branch of a fork. The branch
    /// sees everything established so far but nothing its siblings do.
    pub fn branch_builder(&self) -> Self {
        Self {
            prims: Vec::new(),
            fork: None,
            curr_subst: self.curr_subst.clone(),
            out_subst: HashMap::new(),
            claimed: HashSet::new(),
            sub_exprs: self.sub_exprs.clone(),
            params: self.params.clone(),
            defined_here: HashSet::new(),
        }
    }

    /// The current input substitution entry for a variable, if any.
    pub fn current_subst(&self, var: &PrimVarName) -> Option<&PrimArg> {
        self.curr_subst.get(var)
    }

    pub fn is_sealed(&self) -> bool {
        self.fork.is_some()
    }

    /* Emission */

    pub fn instr(&mut self, prim: Prim, pos: OptPos) -> Result<()> {
        if self.fork.is_some() {
            return Err(CompileError::internal(format!(
                "instruction after fork: {prim}"
            )));
        }

        if matches!(prim, Prim::Nop) {
            return Ok(());
        }

        let prim = self.substitute_inputs(prim);
        let prim = match fold_constant(&prim) {
            Some(folded) => {
                trace!(target: "body_builder", "folded {prim} to {folded}");
                folded
            }
            None => prim,
        };

        // Move elision: a move into a variable either becomes part of the
        // substitution state or is renamed onto its source's definition.
        if let Prim::Foreign { lang, name, args, .. } = &prim {
            if lang == LLVM && name == "move" && args.len() == 2 && args[1].is_output() {
                let source = args[0].clone();
                let dest = args[1]
                    .var_name()
                    .expect("move output must be a variable");

                if !self.params.contains(&dest) {
                    // Internal target: future reads of it see the source.
                    trace!(target: "body_builder", "subst {dest} -> {source}");
                    self.curr_subst.insert(dest, source);
                    return Ok(());
                }

                if let Some(src_name) = source.var_name() {
                    if !self.params.contains(&src_name)
                        && self.defined_here.contains(&src_name)
                        && !self.claimed.contains(&src_name)
                    {
                        // Rename the defining occurrence of the source to the
                        // output parameter rather than emitting a copy.
                        trace!(target: "body_builder", "rename {src_name} -> {dest}");
                        self.out_subst.insert(dest, src_name);
                        self.claimed.insert(src_name);
                        return Ok(());
                    }
                }
                // Literal source or non-renameable variable: keep the move.
            }
        }

        if matches!(prim, Prim::Guard { .. } | Prim::Fail) {
            self.prims.push(Placed::new(prim, pos));
            return Ok(());
        }

        let key = skeleton_key(&prim);
        let outputs: Vec<PrimArg> = prim.outputs().cloned().collect();

        if let Some(old_outputs) = self.sub_exprs.get(&key) {
            if old_outputs.len() == outputs.len() {
                trace!(target: "body_builder", "cse hit for {prim}");
                let old_outputs = old_outputs.clone();
                self.reuse_outputs(&outputs, &old_outputs, pos)?;
                return Ok(());
            }
        }

        self.sub_exprs.insert(key, outputs.clone());
        for output in &outputs {
            if let Some(name) = output.var_name() {
                self.defined_here.insert(name);
            }
        }

        trace!(target: "body_builder", "emit {prim}");
        self.prims.push(Placed::new(prim, pos));
        Ok(())
    }

    /// Binds the outputs of a repeated computation to the outputs of its
    /// first occurrence.
    fn reuse_outputs(
        &mut self,
        new_outputs: &[PrimArg],
        old_outputs: &[PrimArg],
        pos: OptPos,
    ) -> Result<()> {
        for (new_out, old_out) in new_outputs.iter().zip(old_outputs.iter()) {
            let Some(new_name) = new_out.var_name() else {
                continue;
            };

            if self.params.contains(&new_name) {
                // Output parameters must actually be assigned; copy instead
                // of substituting.
                let move_prim = Prim::move_prim(old_out.as_input(), new_out.clone());
                self.prims.push(Placed::new(move_prim, pos.clone()));
            } else {
                self.curr_subst.insert(new_name, old_out.as_input());
            }
        }
        Ok(())
    }

    /* Substitution */

    fn substitute_inputs(&self, mut prim: Prim) -> Prim {
        if let Some(args) = prim.args_mut() {
            for arg in args.iter_mut() {
                if arg.is_input() {
                    *arg = self.resolve_arg(arg.clone());
                }
            }
        }
        prim
    }

    /// Chases the input substitution to a fixpoint. The substitution is
    /// acyclic by construction (entries are recorded fully resolved), so the
    /// chase terminates.
    fn resolve_arg(&self, mut arg: PrimArg) -> PrimArg {
        let mut seen = HashSet::new();
        while let PrimArg::Var { name, .. } = &arg {
            if !seen.insert(*name) {
                break;
            }
            match self.curr_subst.get(name) {
                Some(mapped) => arg = mapped.clone(),
                None => break,
            }
        }
        arg
    }

    /// Resolves the variable a fork will switch on. A literal result means
    /// the fork can be folded away at compile time.
    pub fn resolve_fork_var(&self, var: PrimVarName) -> ForkTarget {
        match self.resolve_arg(PrimArg::input_var(var, TypeSpec::Unspecified)) {
            PrimArg::Int { value, .. } => ForkTarget::Literal(value),
            PrimArg::Var { name, .. } => ForkTarget::Var(name),
            // Non-integer literals cannot be switched on; leave the variable
            // for the verifier to reject.
            _ => ForkTarget::Var(var),
        }
    }

    /* Fork construction */

    /// Seals the body with a fork over already-built branches. After this no
    /// further instruction may be emitted.
    pub fn complete_fork(
        &mut self,
        var: PrimVarName,
        is_final: bool,
        branches: Vec<ProcBody>,
    ) -> Result<()> {
        if self.fork.is_some() {
            return Err(CompileError::internal("fork after fork without seal"));
        }
        if branches.len() < 2 {
            return Err(CompileError::internal(format!(
                "fork on {var} with {} branch(es)",
                branches.len()
            )));
        }

        self.fork = Some(BuiltFork {
            var,
            is_final,
            branches,
        });
        Ok(())
    }

    /* Completion */

    /// Finishes the body: applies the accumulated output renamings and
    /// returns the assembled tree.
    pub fn into_body(self) -> ProcBody {
        let rename: HashMap<PrimVarName, PrimVarName> = self
            .out_subst
            .iter()
            .map(|(out, v)| (*v, *out))
            .collect();

        let mut prims = self.prims;
        if !rename.is_empty() {
            for prim in &mut prims {
                if let Some(args) = prim.value.args_mut() {
                    for arg in args.iter_mut() {
                        if let PrimArg::Var { name, .. } = arg {
                            if let Some(renamed) = rename.get(name) {
                                *name = *renamed;
                            }
                        }
                    }
                }
            }
        }

        let fork = match self.fork {
            None => PrimFork::NoFork,
            Some(BuiltFork {
                var,
                is_final,
                branches,
            }) => PrimFork::Fork {
                var: rename.get(&var).copied().unwrap_or(var),
                is_final,
                branches,
            },
        };

        ProcBody::new(prims, fork)
    }

    /// Replays an existing body through this builder. Used to re-lower an
    /// already-lowered body, which must be a fixpoint of the optimisation.
    pub fn append_body(&mut self, body: &ProcBody) -> Result<()> {
        for prim in &body.prims {
            self.instr(prim.value.clone(), prim.pos.clone())?;
        }

        match &body.fork {
            PrimFork::NoFork => Ok(()),
            PrimFork::Fork {
                var,
                is_final,
                branches,
            } => match self.resolve_fork_var(*var) {
                ForkTarget::Literal(value) => {
                    let index = usize::try_from(value).unwrap_or(0).min(branches.len() - 1);
                    self.append_body(&branches[index])
                }
                ForkTarget::Var(var) => {
                    let built = branches
                        .iter()
                        .map(|branch| {
                            let mut builder = self.branch_builder();
                            builder.append_body(branch)?;
                            Ok(builder.into_body())
                        })
                        .collect::<Result<Vec<_>>>()?;
                    self.complete_fork(var, *is_final, built)
                }
            },
        }
    }
}

/// The canonical input-only form of a prim, as a table key. Two prims with
/// the same key compute the same outputs from the same inputs. Arguments
/// are rendered with their types so an integer 5 and a float 5 never
/// collide.
fn skeleton_key(prim: &Prim) -> String {
    let render_inputs = |args: &[PrimArg]| -> String {
        args.iter()
            .filter(|a| a.is_input())
            .map(|a| format!("{a}:{}", a.ty()))
            .collect::<Vec<_>>()
            .join(",")
    };

    match prim {
        Prim::Call { callee, args } => {
            format!("call {callee}({})", render_inputs(args))
        }
        Prim::Foreign {
            lang,
            name,
            flags,
            args,
        } => format!(
            "foreign {lang} {name} [{}]({})",
            flags.join(","),
            render_inputs(args)
        ),
        Prim::Guard { var, value } => format!("guard {var} {value}"),
        Prim::Fail => "fail".into(),
        Prim::Nop => "nop".into(),
    }
}

/// Evaluates an `"llvm"` arithmetic or comparison prim whose inputs are all
/// literals, rewriting it to a move of the result. Division by zero never
/// folds; the call is emitted unchanged and traps at runtime.
fn fold_constant(prim: &Prim) -> Option<Prim> {
    let Prim::Foreign {
        lang,
        name,
        flags,
        args,
    } = prim
    else {
        return None;
    };

    if lang != LLVM {
        return None;
    }

    let inputs: Vec<&PrimArg> = args.iter().filter(|a| a.is_input()).collect();
    let outputs: Vec<&PrimArg> = args.iter().filter(|a| a.is_output()).collect();

    if inputs.len() != 2 || outputs.len() != 1 {
        return None;
    }
    let output = outputs[0].clone();

    match name.as_str() {
        "add" | "sub" | "mul" | "div" => {
            let (lhs, rhs) = match (inputs[0], inputs[1]) {
                (PrimArg::Int { value: l, .. }, PrimArg::Int { value: r, .. }) => (*l, *r),
                _ => return None,
            };
            let value = match name.as_str() {
                "add" => lhs.wrapping_add(rhs),
                "sub" => lhs.wrapping_sub(rhs),
                "mul" => lhs.wrapping_mul(rhs),
                "div" => {
                    if rhs == 0 {
                        return None;
                    }
                    lhs.wrapping_div(rhs)
                }
                _ => unreachable!(),
            };
            Some(Prim::move_prim(
                PrimArg::Int {
                    value,
                    ty: output.ty().clone(),
                },
                output,
            ))
        }
        "fadd" | "fsub" | "fmul" | "fdiv" => {
            let (lhs, rhs) = match (inputs[0], inputs[1]) {
                (PrimArg::Float { value: l, .. }, PrimArg::Float { value: r, .. }) => (*l, *r),
                _ => return None,
            };
            let value = match name.as_str() {
                "fadd" => lhs + rhs,
                "fsub" => lhs - rhs,
                "fmul" => lhs * rhs,
                "fdiv" => {
                    if rhs == 0.0 {
                        return None;
                    }
                    lhs / rhs
                }
                _ => unreachable!(),
            };
            Some(Prim::move_prim(
                PrimArg::Float {
                    value,
                    ty: output.ty().clone(),
                },
                output,
            ))
        }
        "icmp" => {
            let predicate = flags.first()?;
            let (lhs, rhs) = match (inputs[0], inputs[1]) {
                (PrimArg::Int { value: l, .. }, PrimArg::Int { value: r, .. }) => (*l, *r),
                _ => return None,
            };
            let holds = compare(predicate, &lhs, &rhs)?;
            Some(Prim::move_prim(
                PrimArg::Int {
                    value: holds as i64,
                    ty: TypeSpec::boolean(),
                },
                output,
            ))
        }
        "fcmp" => {
            let predicate = flags.first()?;
            let (lhs, rhs) = match (inputs[0], inputs[1]) {
                (PrimArg::Float { value: l, .. }, PrimArg::Float { value: r, .. }) => (*l, *r),
                _ => return None,
            };
            let holds = compare(predicate, &lhs, &rhs)?;
            Some(Prim::move_prim(
                PrimArg::Int {
                    value: holds as i64,
                    ty: TypeSpec::boolean(),
                },
                output,
            ))
        }
        _ => None,
    }
}

fn compare<T: PartialOrd + PartialEq>(predicate: &str, lhs: &T, rhs: &T) -> Option<bool> {
    Some(match predicate {
        "eq" => lhs == rhs,
        "ne" => lhs != rhs,
        "slt" => lhs < rhs,
        "sle" => lhs <= rhs,
        "sgt" => lhs > rhs,
        "sge" => lhs >= rhs,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{ast::Ident, Placed};
    use crate::middle::prim::{PrimFlow, ProcSpec};
    use crate::frontend::ast::ModSpec;

    fn var(name: &str, suffix: i32) -> PrimVarName {
        PrimVarName::new(Ident::new(name), suffix)
    }

    fn int_in(name: &str, suffix: i32) -> PrimArg {
        PrimArg::input_var(var(name, suffix), TypeSpec::int())
    }

    fn int_out(name: &str, suffix: i32) -> PrimArg {
        PrimArg::output_var(var(name, suffix), TypeSpec::int())
    }

    fn add(lhs: PrimArg, rhs: PrimArg, out: PrimArg) -> Prim {
        Prim::Foreign {
            lang: LLVM.into(),
            name: "add".into(),
            flags: Vec::new(),
            args: vec![lhs, rhs, out],
        }
    }

    #[test]
    fn move_to_temp_is_elided_into_substitution() {
        // x = y; z = x + 1, with x a temporary and y, z parameters
        let y = var("y", 0);
        let z = var("z", PrimVarName::OUTPUT_SUFFIX);
        let mut builder = BodyBuilder::new([y, z]);

        builder
            .instr(
                Prim::move_prim(int_in("y", 0), int_out("x", 0)),
                None,
            )
            .unwrap();

        assert_eq!(
            builder.current_subst(&var("x", 0)),
            Some(&int_in("y", 0))
        );

        builder
            .instr(add(int_in("x", 0), PrimArg::int(1), int_out("z", -1)), None)
            .unwrap();

        let body = builder.into_body();
        assert_eq!(body.prims.len(), 1);
        assert_eq!(
            body.prims[0].value,
            add(int_in("y", 0), PrimArg::int(1), int_out("z", -1))
        );
    }

    #[test]
    fn constant_fold_then_move_elision() {
        // x = 2 + 3; ?y = x
        let y = var("y", PrimVarName::OUTPUT_SUFFIX);
        let mut builder = BodyBuilder::new([y]);

        builder
            .instr(add(PrimArg::int(2), PrimArg::int(3), int_out("x", 0)), None)
            .unwrap();
        builder
            .instr(
                Prim::move_prim(int_in("x", 0), int_out("y", -1)),
                None,
            )
            .unwrap();

        let body = builder.into_body();
        assert_eq!(body.prims.len(), 1);
        assert_eq!(
            body.prims[0].value,
            Prim::move_prim(PrimArg::int(5), int_out("y", -1))
        );
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let mut builder = BodyBuilder::new([]);
        let div = Prim::Foreign {
            lang: LLVM.into(),
            name: "div".into(),
            flags: Vec::new(),
            args: vec![PrimArg::int(1), PrimArg::int(0), int_out("x", 0)],
        };

        builder.instr(div.clone(), None).unwrap();
        let body = builder.into_body();
        assert_eq!(body.prims.len(), 1);
        assert_eq!(body.prims[0].value, div);
    }

    #[test]
    fn repeated_computation_is_deduplicated() {
        // a = f(x); b = f(x); c = a + b
        let x = var("x", 0);
        let c = var("c", PrimVarName::OUTPUT_SUFFIX);
        let mut builder = BodyBuilder::new([x, c]);

        let callee = ProcSpec::new(ModSpec::from_segments(&["m"]), Ident::new("f"), 0);
        let call = |out: PrimArg| Prim::Call {
            callee: callee.clone(),
            args: vec![int_in("x", 0), out],
        };

        builder.instr(call(int_out("a", 0)), None).unwrap();
        builder.instr(call(int_out("b", 0)), None).unwrap();
        builder
            .instr(add(int_in("a", 0), int_in("b", 0), int_out("c", -1)), None)
            .unwrap();

        let body = builder.into_body();
        assert_eq!(body.prims.len(), 2);
        assert_eq!(
            body.prims[1].value,
            add(int_in("a", 0), int_in("a", 0), int_out("c", -1))
        );
    }

    #[test]
    fn fork_on_literal_resolves_to_branch_index() {
        let mut builder = BodyBuilder::new([]);
        builder
            .instr(
                Prim::move_prim(PrimArg::int(1), int_out("c", 0)),
                None,
            )
            .unwrap();

        assert_eq!(
            builder.resolve_fork_var(var("c", 0)),
            ForkTarget::Literal(1)
        );
    }

    #[test]
    fn instr_after_fork_is_an_internal_error() {
        let mut builder = BodyBuilder::new([]);
        let branch = ProcBody::empty();
        builder
            .complete_fork(var("c", 0), true, vec![branch.clone(), branch])
            .unwrap();

        let result = builder.instr(Prim::Fail, None);
        assert!(matches!(result, Err(CompileError::Internal(_))));
    }

    #[test]
    fn output_rename_lands_on_the_defining_prim() {
        // t = y + 1; ?out = t   =>   add(y, 1, ?out)
        let y = var("y", 0);
        let out = var("out", PrimVarName::OUTPUT_SUFFIX);
        let mut builder = BodyBuilder::new([y, out]);

        builder
            .instr(add(int_in("y", 0), PrimArg::int(1), int_out("t", 0)), None)
            .unwrap();
        builder
            .instr(
                Prim::move_prim(int_in("t", 0), int_out("out", -1)),
                None,
            )
            .unwrap();

        let body = builder.into_body();
        assert_eq!(body.prims.len(), 1);
        assert_eq!(
            body.prims[0].value,
            add(int_in("y", 0), PrimArg::int(1), int_out("out", -1))
        );
    }

    #[test]
    fn relowering_is_a_fixpoint() {
        let y = var("y", 0);
        let z = var("z", PrimVarName::OUTPUT_SUFFIX);
        let mut builder = BodyBuilder::new([y, z]);
        builder
            .instr(add(int_in("y", 0), PrimArg::int(1), int_out("t", 0)), None)
            .unwrap();
        builder
            .instr(add(int_in("t", 0), int_in("t", 0), int_out("z", -1)), None)
            .unwrap();
        let body = builder.into_body();

        let mut again = BodyBuilder::new([y, z]);
        again.append_body(&body).unwrap();
        let relowered = again.into_body();

        assert_eq!(body, relowered);
    }

    #[test]
    fn guard_flows_through_unchanged() {
        let mut builder = BodyBuilder::new([]);
        builder
            .instr(
                Prim::Guard {
                    var: var("c", 0),
                    value: 1,
                },
                None,
            )
            .unwrap();
        let body = builder.into_body();
        assert!(matches!(body.prims[0].value, Prim::Guard { .. }));
    }

    #[test]
    fn cse_assigns_output_params_with_a_copy() {
        // ?a = f(x); ?b = f(x) where a and b are both output params: the
        // second occurrence must still assign b.
        let x = var("x", 0);
        let a = var("a", PrimVarName::OUTPUT_SUFFIX);
        let b = var("b", PrimVarName::OUTPUT_SUFFIX);
        let mut builder = BodyBuilder::new([x, a, b]);

        let callee = ProcSpec::new(ModSpec::from_segments(&["m"]), Ident::new("f"), 0);
        builder
            .instr(
                Prim::Call {
                    callee: callee.clone(),
                    args: vec![int_in("x", 0), int_out("a", -1)],
                },
                None,
            )
            .unwrap();
        builder
            .instr(
                Prim::Call {
                    callee,
                    args: vec![int_in("x", 0), int_out("b", -1)],
                },
                None,
            )
            .unwrap();

        let body = builder.into_body();
        assert_eq!(body.prims.len(), 2);
        assert_eq!(
            body.prims[1].value,
            Prim::move_prim(int_in("a", -1), int_out("b", -1))
        );
    }
}
