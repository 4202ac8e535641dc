//! Lowers flattened statements into primitive form. Straight-line statements
//! accumulate into the current body; `if` seals it with a two-way fork
//! (branch 0 is the false branch); `do` lifts the loop body into a fresh
//! private proc that tail-calls itself, with `break` compiling to a plain
//! return and `next` to the self-call. When control continues past a fork,
//! the remaining statements are lifted into a continuation proc that every
//! branch calls with the values still live.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use log::{debug, warn};

use crate::{
    error::{Diagnostic, Result},
    frontend::{
        ast::{Exp, Ident, ModSpec, Param, ParamFlow, Stmt, TypeSpec},
        OptPos, Placed,
    },
    middle::{
        body_builder::{BodyBuilder, ForkTarget},
        prim::{
            ArgFlowType, Prim, PrimArg, PrimFlow, PrimParam, PrimProto, PrimVarName, ProcBody,
            ProcSpec, LLVM, LPVM,
        },
    },
};

/// Looks up the procedure a call statement refers to. Implemented over the
/// loaded module set by the driver; tests provide table-backed stubs.
pub trait CalleeResolver {
    /// Resolves a possibly-qualified call to a proc and its source-level
    /// parameters. Overloads are told apart by the flow shape of the
    /// arguments (a getter takes `(in, out)`, its setter `(inout, in)`).
    fn resolve(
        &self,
        module: Option<&ModSpec>,
        name: Ident,
        arg_flows: &[ParamFlow],
    ) -> Option<(ProcSpec, Vec<Param>)>;
}

/// The syntactic flow of a call argument, used to pick among overloads.
pub fn arg_flow(exp: &Exp) -> ParamFlow {
    match exp {
        Exp::Var { flow, .. } => *flow,
        Exp::Typed { exp, .. } => arg_flow(&exp.value),
        _ => ParamFlow::In,
    }
}

/// A procedure produced by lowering: either the proc being lowered or one of
/// the loop / continuation procs invented along the way.
#[derive(Debug, Clone)]
pub struct LoweredProc {
    pub name: Ident,
    pub source_params: Vec<Param>,
    pub proto: PrimProto,
    pub body: ProcBody,
}

#[derive(Debug)]
pub struct UnbrancherOutput {
    pub body: ProcBody,
    /// Generated procs, in creation order. All private to the module.
    pub new_procs: Vec<LoweredProc>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Builds the lowered prototype for a source parameter list: in parameters
/// keep suffix 0, out parameters use the reserved output suffix, and in/out
/// parameters split into an in half and an out half.
pub fn prim_proto(name: Ident, params: &[Param]) -> PrimProto {
    let mut prim_params = Vec::new();

    for param in params {
        match param.flow {
            ParamFlow::In => prim_params.push(PrimParam {
                name: PrimVarName::first(param.name),
                ty: param.ty.clone(),
                flow: PrimFlow::In,
                flow_type: ArgFlowType::Ordinary,
            }),
            ParamFlow::Out => prim_params.push(PrimParam {
                name: PrimVarName::output(param.name),
                ty: param.ty.clone(),
                flow: PrimFlow::Out,
                flow_type: ArgFlowType::Ordinary,
            }),
            ParamFlow::InOut => {
                prim_params.push(PrimParam {
                    name: PrimVarName::first(param.name),
                    ty: param.ty.clone(),
                    flow: PrimFlow::In,
                    flow_type: ArgFlowType::FirstHalf,
                });
                prim_params.push(PrimParam {
                    name: PrimVarName::output(param.name),
                    ty: param.ty.clone(),
                    flow: PrimFlow::Out,
                    flow_type: ArgFlowType::SecondHalf,
                });
            }
        }
    }

    PrimProto {
        name,
        params: prim_params,
    }
}

/// Tracks the current SSA version and type of every bound variable. Cloned
/// at forks so sibling branches number independently.
#[derive(Debug, Clone, Default)]
struct VarNamer {
    versions: HashMap<Ident, i32>,
    types: HashMap<Ident, TypeSpec>,
}

impl VarNamer {
    fn seed(&mut self, name: Ident, ty: TypeSpec) {
        self.versions.insert(name, 0);
        self.types.insert(name, ty);
    }

    fn is_bound(&self, name: Ident) -> bool {
        self.versions.contains_key(&name)
    }

    fn read(&self, name: Ident) -> Option<(PrimVarName, TypeSpec)> {
        let suffix = *self.versions.get(&name)?;
        let ty = self
            .types
            .get(&name)
            .cloned()
            .unwrap_or(TypeSpec::Unspecified);
        Some((PrimVarName::new(name, suffix), ty))
    }

    fn bind(&mut self, name: Ident, ty: TypeSpec) -> PrimVarName {
        let suffix = self
            .versions
            .get(&name)
            .map(|current| current + 1)
            .unwrap_or(0);
        self.versions.insert(name, suffix);
        if !ty.is_unspecified() || !self.types.contains_key(&name) {
            self.types.insert(name, ty);
        }
        PrimVarName::new(name, suffix)
    }
}

/// What a body must do when control falls off its last statement.
#[derive(Debug, Clone)]
enum Terminal {
    /// Bind the output parameters and return.
    Return,
    /// Call the continuation carrying the live variables.
    CallCont { spec: ProcSpec, ins: Vec<(Ident, TypeSpec)> },
    /// Tail-call the enclosing loop proc (implicit `next`).
    LoopNext,
}

#[derive(Debug, Clone)]
struct Scope {
    /// Output parameters the current proc must bind on every return path.
    outs: Vec<(Ident, TypeSpec)>,
    terminal: Terminal,
    loop_ctx: Option<LoopInfo>,
}

#[derive(Debug, Clone)]
struct LoopInfo {
    spec: ProcSpec,
    ins: Vec<(Ident, TypeSpec)>,
    outs: Vec<(Ident, TypeSpec)>,
}

pub struct Unbrancher<'r> {
    mod_spec: ModSpec,
    base_name: Ident,
    resolver: &'r dyn CalleeResolver,
    gen_count: usize,
    new_procs: Vec<LoweredProc>,
    diagnostics: Vec<Diagnostic>,
}

impl<'r> Unbrancher<'r> {
    pub fn new(mod_spec: ModSpec, proc_name: Ident, resolver: &'r dyn CalleeResolver) -> Self {
        Self {
            mod_spec,
            base_name: proc_name,
            resolver,
            gen_count: 0,
            new_procs: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Lowers a whole (already flattened) proc body.
    pub fn lower_proc(
        mut self,
        params: &[Param],
        stmts: &[Placed<Stmt>],
    ) -> Result<UnbrancherOutput> {
        let proto = prim_proto(self.base_name, params);

        let mut namer = VarNamer::default();
        let mut outs = Vec::new();
        for param in params {
            match param.flow {
                ParamFlow::In => namer.seed(param.name, param.ty.clone()),
                ParamFlow::Out => outs.push((param.name, param.ty.clone())),
                ParamFlow::InOut => {
                    namer.seed(param.name, param.ty.clone());
                    outs.push((param.name, param.ty.clone()));
                }
            }
        }

        let scope = Scope {
            outs,
            terminal: Terminal::Return,
            loop_ctx: None,
        };

        let mut builder = BodyBuilder::new(proto.params.iter().map(|p| p.name));
        self.lower_body(stmts, &scope, &mut builder, &mut namer)?;
        let body = builder.into_body();

        debug!(target: "unbranch", "lowered {} (+{} generated)", self.base_name, self.new_procs.len());

        Ok(UnbrancherOutput {
            body,
            new_procs: self.new_procs,
            diagnostics: self.diagnostics,
        })
    }

    fn error(&mut self, message: impl Into<String>, pos: OptPos) {
        self.diagnostics.push(Diagnostic::error(message, pos));
    }

    fn fresh_proc_name(&mut self) -> Ident {
        self.gen_count += 1;
        Ident::new(&format!("{}${}", self.base_name, self.gen_count))
    }

    fn proc_spec(&self, name: Ident) -> ProcSpec {
        // Generated names are unique within the module, so the overload
        // index is always 0.
        ProcSpec::new(self.mod_spec.clone(), name, 0)
    }

    /// Lowers statements into the builder, then performs the scope terminal
    /// if control falls off the end.
    fn lower_body(
        &mut self,
        stmts: &[Placed<Stmt>],
        scope: &Scope,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        let terminated = self.lower_stmts(stmts, scope, builder, namer)?;
        if !terminated {
            self.perform_terminal(scope, builder, namer)?;
        }
        Ok(())
    }

    fn perform_terminal(
        &mut self,
        scope: &Scope,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        match &scope.terminal {
            Terminal::Return => self.bind_outputs(&scope.outs, builder, namer),
            Terminal::CallCont { spec, ins } => {
                self.emit_handoff_call(spec.clone(), ins, &scope.outs, builder, namer)
            }
            Terminal::LoopNext => self.emit_loop_next(scope, builder, namer, None),
        }
    }

    /// Binds each output parameter from the current version of its name.
    fn bind_outputs(
        &mut self,
        outs: &[(Ident, TypeSpec)],
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        for (name, ty) in outs {
            match namer.read(*name) {
                Some((current, _)) => {
                    // Already the output version: bound directly by a call.
                    if current.suffix == PrimVarName::OUTPUT_SUFFIX {
                        continue;
                    }
                    builder.instr(
                        Prim::move_prim(
                            PrimArg::input_var(current, ty.clone()),
                            PrimArg::output_var(PrimVarName::output(*name), ty.clone()),
                        ),
                        None,
                    )?;
                }
                None => self.error(
                    format!("output parameter `{name}` may be unbound at return"),
                    None,
                ),
            }
        }
        Ok(())
    }

    /// A call handing control to a continuation or loop proc: live values
    /// in, the enclosing proc's outputs out.
    fn emit_handoff_call(
        &mut self,
        spec: ProcSpec,
        ins: &[(Ident, TypeSpec)],
        outs: &[(Ident, TypeSpec)],
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        let mut args = Vec::new();
        for (name, ty) in ins {
            match namer.read(*name) {
                Some((current, known_ty)) => {
                    let ty = if ty.is_unspecified() { known_ty } else { ty.clone() };
                    args.push(PrimArg::input_var(current, ty));
                }
                None => {
                    self.error(format!("variable `{name}` may be unbound here"), None);
                    args.push(PrimArg::input_var(PrimVarName::first(*name), ty.clone()));
                }
            }
        }
        for (name, ty) in outs {
            args.push(PrimArg::output_var(PrimVarName::output(*name), ty.clone()));
        }

        builder.instr(Prim::Call { callee: spec, args }, None)
    }

    fn emit_loop_next(
        &mut self,
        scope: &Scope,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
        pos: OptPos,
    ) -> Result<()> {
        let Some(loop_ctx) = scope.loop_ctx.clone() else {
            self.error("`next` outside a loop", pos);
            return Ok(());
        };
        self.emit_handoff_call(loop_ctx.spec, &loop_ctx.ins, &loop_ctx.outs, builder, namer)
    }

    /// Lowers a statement run. Returns true when the run ended with a
    /// terminal construct (fork, break, or next), in which case the caller
    /// must not emit anything further.
    fn lower_stmts(
        &mut self,
        stmts: &[Placed<Stmt>],
        scope: &Scope,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<bool> {
        let mut index = 0;

        while index < stmts.len() {
            let stmt = &stmts[index];
            let rest = &stmts[index + 1..];
            let pos = stmt.pos.clone();

            match &stmt.value {
                Stmt::Call { module, name, args } => {
                    self.lower_call(module.as_ref(), *name, args, pos, builder, namer)?;
                }
                Stmt::Foreign {
                    lang,
                    name,
                    flags,
                    args,
                } => {
                    self.lower_foreign(lang, name, flags, args, pos, builder, namer)?;
                }
                Stmt::If {
                    cond,
                    then_stmts,
                    else_stmts,
                } => {
                    return self.lower_if(
                        cond, then_stmts, else_stmts, rest, pos, scope, builder, namer,
                    );
                }
                Stmt::Loop { body } => {
                    self.lower_loop(body, rest, pos, scope, builder, namer)?;
                }
                Stmt::Break => {
                    if !rest.is_empty() {
                        warn!(target: "unbranch", "unreachable code after break");
                    }
                    let Some(loop_ctx) = scope.loop_ctx.clone() else {
                        self.error("`break` outside a loop", pos);
                        return Ok(true);
                    };
                    self.bind_outputs(&loop_ctx.outs, builder, namer)?;
                    return Ok(true);
                }
                Stmt::Next => {
                    if !rest.is_empty() {
                        warn!(target: "unbranch", "unreachable code after next");
                    }
                    self.emit_loop_next(scope, builder, namer, pos)?;
                    return Ok(true);
                }
                Stmt::Assign { lhs, .. } => {
                    self.error(
                        format!("cannot assign to {:?}", lhs.value),
                        pos,
                    );
                }
                Stmt::While { .. } | Stmt::Until { .. } => {
                    self.error("loop condition outside a loop", pos);
                }
                Stmt::Nop => {}
            }

            index += 1;
        }

        Ok(false)
    }

    /* Calls */

    fn lower_call(
        &mut self,
        module: Option<&ModSpec>,
        name: Ident,
        args: &[Placed<Exp>],
        pos: OptPos,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        let flows: Vec<ParamFlow> = args.iter().map(|a| arg_flow(&a.value)).collect();
        let Some((spec, params)) = self.resolver.resolve(module, name, &flows) else {
            self.error(format!("call to unknown proc `{name}`"), pos);
            return Ok(());
        };

        if params.len() != args.len() {
            self.error(
                format!(
                    "wrong number of arguments to `{name}`: expected {}, found {}",
                    params.len(),
                    args.len()
                ),
                pos,
            );
            return Ok(());
        }

        let mut prim_args = Vec::new();
        for (arg, param) in args.iter().zip(params.iter()) {
            match param.flow {
                ParamFlow::In => {
                    if let Some(arg) = self.input_arg(arg, &param.ty, namer) {
                        prim_args.push(arg);
                    } else {
                        return Ok(());
                    }
                }
                ParamFlow::Out => match output_target(arg) {
                    Some(target) => {
                        let bound = namer.bind(target, param.ty.clone());
                        prim_args.push(PrimArg::output_var(bound, param.ty.clone()));
                    }
                    None => {
                        self.error(
                            format!("argument to out parameter `{}` must be `?var`", param.name),
                            arg.pos.clone(),
                        );
                        return Ok(());
                    }
                },
                ParamFlow::InOut => match inout_target(arg) {
                    Some(target) => {
                        let Some((current, _)) = namer.read(target) else {
                            self.error(
                                format!("variable `{target}` used before being bound"),
                                arg.pos.clone(),
                            );
                            return Ok(());
                        };
                        prim_args.push(PrimArg::Var {
                            name: current,
                            ty: param.ty.clone(),
                            flow: PrimFlow::In,
                            flow_type: ArgFlowType::FirstHalf,
                            final_use: false,
                        });
                        let bound = namer.bind(target, param.ty.clone());
                        prim_args.push(PrimArg::Var {
                            name: bound,
                            ty: param.ty.clone(),
                            flow: PrimFlow::Out,
                            flow_type: ArgFlowType::SecondHalf,
                            final_use: false,
                        });
                    }
                    None => {
                        self.error(
                            format!(
                                "argument to in/out parameter `{}` must be `!var`",
                                param.name
                            ),
                            arg.pos.clone(),
                        );
                        return Ok(());
                    }
                },
            }
        }

        builder.instr(
            Prim::Call {
                callee: spec,
                args: prim_args,
            },
            pos,
        )
    }

    fn lower_foreign(
        &mut self,
        lang: &str,
        name: &str,
        flags: &[String],
        args: &[Placed<Exp>],
        pos: OptPos,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        let mut inputs = Vec::new();
        let mut prim_args = Vec::new();

        // Inputs are collected first so output types can depend on them.
        for arg in args {
            if !is_output_exp(arg) {
                match self.input_arg(arg, &TypeSpec::Unspecified, namer) {
                    Some(arg) => inputs.push(arg),
                    None => return Ok(()),
                }
            }
        }

        let mut input_iter = inputs.iter();
        for arg in args {
            if is_output_exp(arg) {
                let (target, ascribed) = match output_exp_parts(arg) {
                    Some(parts) => parts,
                    None => {
                        self.error("malformed foreign output argument", arg.pos.clone());
                        return Ok(());
                    }
                };
                let ty = ascribed
                    .unwrap_or_else(|| foreign_output_type(lang, name, &inputs));
                let bound = namer.bind(target, ty.clone());
                prim_args.push(PrimArg::output_var(bound, ty));
            } else {
                prim_args.push(
                    input_iter
                        .next()
                        .expect("input args collected above")
                        .clone(),
                );
            }
        }

        builder.instr(
            Prim::Foreign {
                lang: lang.to_owned(),
                name: name.to_owned(),
                flags: flags.to_vec(),
                args: prim_args,
            },
            pos,
        )
    }

    /// Converts an atomic in-flowing expression to a primitive argument.
    fn input_arg(
        &mut self,
        arg: &Placed<Exp>,
        expected_ty: &TypeSpec,
        namer: &VarNamer,
    ) -> Option<PrimArg> {
        match &arg.value {
            Exp::IntLit(value) => Some(PrimArg::Int {
                value: *value,
                ty: if expected_ty.is_unspecified() {
                    TypeSpec::int()
                } else {
                    expected_ty.clone()
                },
            }),
            Exp::FloatLit(value) => Some(PrimArg::Float {
                value: *value,
                ty: TypeSpec::float(),
            }),
            Exp::StringLit(value) => Some(PrimArg::Str {
                value: value.clone(),
                ty: TypeSpec::string(),
            }),
            Exp::CharLit(value) => Some(PrimArg::Char {
                value: *value,
                ty: TypeSpec::char(),
            }),
            Exp::Var {
                name,
                flow: ParamFlow::In,
            } => match namer.read(*name) {
                Some((current, ty)) => {
                    let ty = if ty.is_unspecified() && !expected_ty.is_unspecified() {
                        expected_ty.clone()
                    } else {
                        ty
                    };
                    Some(PrimArg::input_var(current, ty))
                }
                None => {
                    self.error(
                        format!("variable `{name}` used before being bound"),
                        arg.pos.clone(),
                    );
                    None
                }
            },
            Exp::Typed { exp, ty } => {
                let inner = self.input_arg(exp, ty, namer)?;
                Some(retype_arg(inner, ty.clone()))
            }
            other => {
                self.error(
                    format!("expected an atomic input argument, found {other:?}"),
                    arg.pos.clone(),
                );
                None
            }
        }
    }

    /* Forks */

    #[allow(clippy::too_many_arguments)]
    fn lower_if(
        &mut self,
        cond: &Placed<Exp>,
        then_stmts: &[Placed<Stmt>],
        else_stmts: &[Placed<Stmt>],
        rest: &[Placed<Stmt>],
        _pos: OptPos,
        scope: &Scope,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<bool> {
        let cond_var = match self.condition_var(cond, namer) {
            Some(var) => var,
            None => return Ok(true),
        };

        // Compile-time branch folding: a condition known to be a literal
        // selects its branch now and no fork is emitted.
        if let ForkTarget::Literal(value) = builder.resolve_fork_var(cond_var) {
            debug!(target: "unbranch", "folding branch on constant {value}");
            let taken: Vec<Placed<Stmt>> = if value != 0 {
                then_stmts.iter().chain(rest.iter()).cloned().collect()
            } else {
                else_stmts.iter().chain(rest.iter()).cloned().collect()
            };
            return self.lower_stmts(&taken, scope, builder, namer);
        }

        let (branch_scope, is_final) = if rest.is_empty() {
            (scope.clone(), true)
        } else {
            // Lift the statements after the fork into a continuation proc
            // that both branches call with the still-live values.
            let cont_ins = self.continuation_inputs(rest, scope, namer, then_stmts, else_stmts);
            let cont_name = self.fresh_proc_name();
            let cont_spec = self.proc_spec(cont_name);

            self.generate_proc(cont_name, &cont_ins, scope, rest)?;

            (
                Scope {
                    outs: scope.outs.clone(),
                    terminal: Terminal::CallCont {
                        spec: cont_spec,
                        ins: cont_ins,
                    },
                    loop_ctx: scope.loop_ctx.clone(),
                },
                false,
            )
        };

        // Branch 0 runs when the condition is false.
        let mut branches = Vec::new();
        for branch_stmts in [else_stmts, then_stmts] {
            let mut branch_builder = builder.branch_builder();
            let mut branch_namer = namer.clone();
            self.lower_body(
                branch_stmts,
                &branch_scope,
                &mut branch_builder,
                &mut branch_namer,
            )?;
            branches.push(branch_builder.into_body());
        }

        builder.complete_fork(cond_var, is_final, branches)?;
        Ok(true)
    }

    fn condition_var(&mut self, cond: &Placed<Exp>, namer: &VarNamer) -> Option<PrimVarName> {
        match &cond.value {
            Exp::Var {
                name,
                flow: ParamFlow::In,
            } => match namer.read(*name) {
                Some((current, _)) => Some(current),
                None => {
                    self.error(
                        format!("condition variable `{name}` used before being bound"),
                        cond.pos.clone(),
                    );
                    None
                }
            },
            Exp::Typed { exp, .. } => self.condition_var(exp, namer),
            // A literal condition still needs a variable for the resolver;
            // bind a fresh one through the namer-free path.
            Exp::IntLit(_) => {
                // Flattening always routes literals through a move, so this
                // only happens for hand-built input.
                self.error("literal condition must be bound to a variable", cond.pos.clone());
                None
            }
            other => {
                self.error(
                    format!("condition must be a boolean variable, found {other:?}"),
                    cond.pos.clone(),
                );
                None
            }
        }
    }

    /// Variables a continuation must receive: everything the remaining
    /// statements read that is visible here or produced by a branch, plus
    /// whatever the scope's own terminal will need.
    fn continuation_inputs(
        &self,
        rest: &[Placed<Stmt>],
        scope: &Scope,
        namer: &VarNamer,
        then_stmts: &[Placed<Stmt>],
        else_stmts: &[Placed<Stmt>],
    ) -> Vec<(Ident, TypeSpec)> {
        let mut names: BTreeSet<Ident> = BTreeSet::new();

        let branch_writes: BTreeSet<Ident> = stmt_writes(then_stmts)
            .union(&stmt_writes(else_stmts))
            .copied()
            .collect();

        for name in stmt_reads(rest) {
            if namer.is_bound(name) || branch_writes.contains(&name) {
                names.insert(name);
            }
        }

        match &scope.terminal {
            Terminal::Return => {
                for (name, _) in &scope.outs {
                    if namer.is_bound(*name) || branch_writes.contains(name) {
                        names.insert(*name);
                    }
                }
            }
            Terminal::CallCont { ins, .. } => {
                for (name, _) in ins {
                    if namer.is_bound(*name) || branch_writes.contains(name) {
                        names.insert(*name);
                    }
                }
            }
            Terminal::LoopNext => {
                if let Some(loop_ctx) = &scope.loop_ctx {
                    for (name, _) in &loop_ctx.ins {
                        names.insert(*name);
                    }
                }
            }
        }

        names
            .into_iter()
            .map(|name| {
                let ty = namer
                    .read(name)
                    .map(|(_, ty)| ty)
                    .unwrap_or(TypeSpec::Unspecified);
                (name, ty)
            })
            .collect()
    }

    /// Lowers a generated proc (loop body or continuation) and records it.
    fn generate_proc(
        &mut self,
        name: Ident,
        ins: &[(Ident, TypeSpec)],
        scope: &Scope,
        stmts: &[Placed<Stmt>],
    ) -> Result<()> {
        let source_params: Vec<Param> = ins
            .iter()
            .map(|(name, ty)| Param {
                name: *name,
                ty: ty.clone(),
                flow: ParamFlow::In,
                pos: None,
            })
            .chain(scope.outs.iter().map(|(name, ty)| Param {
                name: *name,
                ty: ty.clone(),
                flow: ParamFlow::Out,
                pos: None,
            }))
            .collect();

        let proto = prim_proto(name, &source_params);

        let mut namer = VarNamer::default();
        for (in_name, ty) in ins {
            namer.seed(*in_name, ty.clone());
        }

        let mut builder = BodyBuilder::new(proto.params.iter().map(|p| p.name));
        self.lower_body(stmts, scope, &mut builder, &mut namer)?;

        self.new_procs.push(LoweredProc {
            name,
            source_params,
            proto,
            body: builder.into_body(),
        });

        Ok(())
    }

    /* Loops */

    #[allow(clippy::too_many_arguments)]
    fn lower_loop(
        &mut self,
        body: &[Placed<Stmt>],
        rest: &[Placed<Stmt>],
        pos: OptPos,
        scope: &Scope,
        builder: &mut BodyBuilder,
        namer: &mut VarNamer,
    ) -> Result<()> {
        let loop_name = self.fresh_proc_name();
        let loop_spec = self.proc_spec(loop_name);

        // Values the code after the loop (or the enclosing outputs) need
        // from inside the loop.
        let after_reads = stmt_reads(rest);
        let body_writes = stmt_writes(body);

        let mut out_names: BTreeSet<Ident> = BTreeSet::new();
        for name in body_writes.iter() {
            let needed_after = after_reads.contains(name)
                || scope.outs.iter().any(|(out, _)| out == name);
            if needed_after {
                out_names.insert(*name);
            }
        }

        // Values flowing into the loop: whatever its body reads from outside
        // plus pass-throughs needed to bind its outputs on an early break.
        let mut in_names: BTreeSet<Ident> = BTreeSet::new();
        for name in stmt_reads(body) {
            if namer.is_bound(name) {
                in_names.insert(name);
            }
        }
        for name in out_names.iter() {
            if namer.is_bound(*name) {
                in_names.insert(*name);
            }
        }

        let loop_ins: Vec<(Ident, TypeSpec)> = in_names
            .iter()
            .map(|name| {
                let ty = namer
                    .read(*name)
                    .map(|(_, ty)| ty)
                    .unwrap_or(TypeSpec::Unspecified);
                (*name, ty)
            })
            .collect();
        let loop_outs: Vec<(Ident, TypeSpec)> = out_names
            .iter()
            .map(|name| {
                let ty = namer
                    .read(*name)
                    .map(|(_, ty)| ty)
                    .unwrap_or(TypeSpec::Unspecified);
                (*name, ty)
            })
            .collect();

        debug!(
            target: "unbranch",
            "lifting loop into {loop_name} ({} in, {} out)",
            loop_ins.len(),
            loop_outs.len()
        );

        let loop_scope = Scope {
            outs: loop_outs.clone(),
            terminal: Terminal::LoopNext,
            loop_ctx: Some(LoopInfo {
                spec: loop_spec.clone(),
                ins: loop_ins.clone(),
                outs: loop_outs.clone(),
            }),
        };

        self.generate_proc(loop_name, &loop_ins, &loop_scope, body)?;

        // The call into the loop, binding fresh versions of its outputs.
        let mut args = Vec::new();
        for (name, ty) in &loop_ins {
            let (current, _) = namer
                .read(*name)
                .expect("loop inputs are bound in the enclosing scope");
            args.push(PrimArg::input_var(current, ty.clone()));
        }
        for (name, ty) in &loop_outs {
            let bound = namer.bind(*name, ty.clone());
            args.push(PrimArg::output_var(bound, ty.clone()));
        }

        builder.instr(
            Prim::Call {
                callee: loop_spec,
                args,
            },
            pos,
        )
    }
}

/* Free variable scans over flattened statements */

fn exp_reads(exp: &Exp, written: &BTreeSet<Ident>, reads: &mut BTreeSet<Ident>) {
    match exp {
        Exp::Var {
            name,
            flow: ParamFlow::In | ParamFlow::InOut,
        } => {
            if !written.contains(name) {
                reads.insert(*name);
            }
        }
        Exp::Typed { exp, .. } => exp_reads(&exp.value, written, reads),
        _ => {}
    }
}

fn exp_writes(exp: &Exp, written: &mut BTreeSet<Ident>) {
    match exp {
        Exp::Var {
            name,
            flow: ParamFlow::Out | ParamFlow::InOut,
        } => {
            written.insert(*name);
        }
        Exp::Typed { exp, .. } => exp_writes(&exp.value, written),
        _ => {}
    }
}

fn scan_stmts(
    stmts: &[Placed<Stmt>],
    written: &mut BTreeSet<Ident>,
    reads: &mut BTreeSet<Ident>,
) {
    for stmt in stmts {
        match &stmt.value {
            Stmt::Call { args, .. } | Stmt::Foreign { args, .. } => {
                for arg in args {
                    exp_reads(&arg.value, written, reads);
                }
                for arg in args {
                    exp_writes(&arg.value, written);
                }
            }
            Stmt::Assign { lhs, rhs } => {
                exp_reads(&rhs.value, written, reads);
                exp_writes(&lhs.value, written);
            }
            Stmt::If {
                cond,
                then_stmts,
                else_stmts,
            } => {
                exp_reads(&cond.value, written, reads);

                // Branch-local writes only count as definite writes when
                // both branches perform them.
                let mut then_written = written.clone();
                scan_stmts(then_stmts, &mut then_written, reads);
                let mut else_written = written.clone();
                scan_stmts(else_stmts, &mut else_written, reads);
                *written = then_written
                    .intersection(&else_written)
                    .copied()
                    .collect();
            }
            Stmt::Loop { body } => {
                // Loop bodies may run zero times for reads, but their writes
                // are not definite either.
                let mut loop_written = written.clone();
                scan_stmts(body, &mut loop_written, reads);
            }
            Stmt::While { cond } | Stmt::Until { cond } => {
                exp_reads(&cond.value, written, reads);
            }
            Stmt::Break | Stmt::Next | Stmt::Nop => {}
        }
    }
}

/// Variables read by the statements before any write to them.
fn stmt_reads(stmts: &[Placed<Stmt>]) -> BTreeSet<Ident> {
    let mut written = BTreeSet::new();
    let mut reads = BTreeSet::new();
    scan_stmts(stmts, &mut written, &mut reads);
    reads
}

/// Variables written anywhere in the statements, including inside branches.
fn stmt_writes(stmts: &[Placed<Stmt>]) -> BTreeSet<Ident> {
    let mut writes = BTreeSet::new();
    for stmt in stmts {
        match &stmt.value {
            Stmt::Call { args, .. } | Stmt::Foreign { args, .. } => {
                for arg in args {
                    exp_writes(&arg.value, &mut writes);
                }
            }
            Stmt::Assign { lhs, .. } => exp_writes(&lhs.value, &mut writes),
            Stmt::If {
                then_stmts,
                else_stmts,
                ..
            } => {
                writes.extend(stmt_writes(then_stmts));
                writes.extend(stmt_writes(else_stmts));
            }
            Stmt::Loop { body } => writes.extend(stmt_writes(body)),
            Stmt::While { .. } | Stmt::Until { .. } | Stmt::Break | Stmt::Next | Stmt::Nop => {}
        }
    }
    writes
}

fn is_output_exp(exp: &Placed<Exp>) -> bool {
    match &exp.value {
        Exp::Var {
            flow: ParamFlow::Out,
            ..
        } => true,
        Exp::Typed { exp, .. } => is_output_exp(exp),
        _ => false,
    }
}

fn output_target(exp: &Placed<Exp>) -> Option<Ident> {
    match &exp.value {
        Exp::Var {
            name,
            flow: ParamFlow::Out,
        } => Some(*name),
        Exp::Typed { exp, .. } => output_target(exp),
        _ => None,
    }
}

fn inout_target(exp: &Placed<Exp>) -> Option<Ident> {
    match &exp.value {
        Exp::Var {
            name,
            flow: ParamFlow::InOut,
        } => Some(*name),
        Exp::Typed { exp, .. } => inout_target(exp),
        _ => None,
    }
}

/// For output arguments: the variable and any ascribed type.
fn output_exp_parts(exp: &Placed<Exp>) -> Option<(Ident, Option<TypeSpec>)> {
    match &exp.value {
        Exp::Var {
            name,
            flow: ParamFlow::Out,
        } => Some((*name, None)),
        Exp::Typed { exp, ty } => {
            let (name, _) = output_exp_parts(exp)?;
            Some((name, Some(ty.clone())))
        }
        _ => None,
    }
}

fn retype_arg(arg: PrimArg, ty: TypeSpec) -> PrimArg {
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
        PrimArg::Int { value, .. } => PrimArg::Int { value, ty },
        PrimArg::Float { value, .. } => PrimArg::Float { value, ty },
        PrimArg::Str { value, .. } => PrimArg::Str { value, ty },
        PrimArg::Char { value, .. } => PrimArg::Char { value, ty },
    }
}

/// The result type of the built-in foreign operations, derived from the
/// operation and its already-lowered inputs.
fn foreign_output_type(lang: &str, name: &str, inputs: &[PrimArg]) -> TypeSpec {
    match (lang, name) {
        (LLVM, "move") => inputs
            .first()
            .map(|arg| arg.ty().clone())
            .unwrap_or(TypeSpec::Unspecified),
        (LLVM, "add" | "sub" | "mul" | "div" | "mod") => TypeSpec::int(),
        (LLVM, "fadd" | "fsub" | "fmul" | "fdiv") => TypeSpec::float(),
        (LLVM, "icmp" | "fcmp") => TypeSpec::boolean(),
        (LPVM, "alloc") => TypeSpec::address(),
        (LPVM, "mutate") => TypeSpec::address(),
        (LPVM, "cast") => TypeSpec::Unspecified,
        (LPVM, "access") => TypeSpec::Unspecified,
        _ => TypeSpec::Unspecified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::flatten::flatten_stmts;
    use crate::middle::prim::PrimFork;

    struct NoCallees;

    impl CalleeResolver for NoCallees {
        fn resolve(
            &self,
            _module: Option<&ModSpec>,
            _name: Ident,
            _arg_flows: &[ParamFlow],
        ) -> Option<(ProcSpec, Vec<Param>)> {
            None
        }
    }

    fn param(name: &str, flow: ParamFlow) -> Param {
        Param {
            name: Ident::new(name),
            ty: TypeSpec::int(),
            flow,
            pos: None,
        }
    }

    fn lower(params: Vec<Param>, source: &str) -> UnbrancherOutput {
        use crate::frontend::{parser, SourceFile};

        // Wrap the statements in a proc so the surface parser can be used
        // to build test bodies.
        let params_src = params
            .iter()
            .map(|p| {
                let prefix = match p.flow {
                    ParamFlow::In => "",
                    ParamFlow::Out => "?",
                    ParamFlow::InOut => "!",
                };
                format!("{prefix}{}:int", p.name)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!("proc t({params_src}) {source} end");
        let file = SourceFile::from_memory(text);
        let (items, errors) = parser::parse_items(&file);
        assert!(errors.is_empty(), "parse errors: {errors:?}");

        let crate::frontend::ast::Item::Proc(decl) = items[0].value.clone() else {
            panic!("expected proc");
        };

        let (flat, _) = flatten_stmts(decl.body, 0);
        let unbrancher = Unbrancher::new(
            ModSpec::from_segments(&["test"]),
            Ident::new("t"),
            &NoCallees,
        );
        unbrancher.lower_proc(&params, &flat).unwrap()
    }

    #[test]
    fn straight_line_assignment_lowered_to_one_prim() {
        let out = lower(
            vec![param("x", ParamFlow::In), param("y", ParamFlow::Out)],
            "?y = x + 1",
        );

        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        assert_eq!(out.body.prims.len(), 1);
        let Prim::Foreign { name, args, .. } = &out.body.prims[0].value else {
            panic!("expected foreign add");
        };
        assert_eq!(name, "add");
        assert_eq!(
            args[2].var_name().unwrap(),
            PrimVarName::output(Ident::new("y"))
        );
    }

    #[test]
    fn terminal_if_forks_with_false_branch_first() {
        let out = lower(
            vec![param("x", ParamFlow::In), param("y", ParamFlow::Out)],
            "if x < 10 then ?y = 1 else ?y = 2 end",
        );

        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        let PrimFork::Fork {
            is_final, branches, ..
        } = &out.body.fork
        else {
            panic!("expected a fork");
        };
        assert!(*is_final);
        assert_eq!(branches.len(), 2);

        // Branch 0 is the false branch: y = 2
        let Prim::Foreign { name, args, .. } = &branches[0].prims[0].value else {
            panic!("expected a move");
        };
        assert_eq!(name, "move");
        assert_eq!(args[0], PrimArg::int(2));

        let Prim::Foreign { args, .. } = &branches[1].prims[0].value else {
            panic!("expected a move");
        };
        assert_eq!(args[0], PrimArg::int(1));
    }

    #[test]
    fn constant_condition_folds_the_branch_away() {
        let out = lower(
            vec![param("y", ParamFlow::Out)],
            "?c = 1 if c then ?y = 10 else ?y = 20 end",
        );

        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);
        assert!(matches!(out.body.fork, PrimFork::NoFork));
        assert_eq!(out.body.prims.len(), 1);
        let Prim::Foreign { name, args, .. } = &out.body.prims[0].value else {
            panic!("expected a move");
        };
        assert_eq!(name, "move");
        assert_eq!(args[0], PrimArg::int(10));
    }

    #[test]
    fn statements_after_fork_become_a_continuation() {
        let out = lower(
            vec![
                param("x", ParamFlow::In),
                param("y", ParamFlow::Out),
            ],
            "if x < 0 then ?t = 0 - x else ?t = x end ?y = t + 1",
        );

        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);

        // The fork is not final (control rejoins in the continuation).
        let PrimFork::Fork {
            is_final, branches, ..
        } = &out.body.fork
        else {
            panic!("expected a fork");
        };
        assert!(!*is_final);

        // One generated proc: the continuation computing y from t.
        assert_eq!(out.new_procs.len(), 1);
        let cont = &out.new_procs[0];
        assert!(cont.name.value().starts_with("t$"));

        // Both branches end by calling it.
        for branch in branches {
            let Prim::Call { callee, .. } = &branch.prims.last().unwrap().value else {
                panic!("branch must end in the continuation call");
            };
            assert_eq!(callee.name, cont.name);
        }
    }

    #[test]
    fn loop_is_lifted_to_tail_recursive_proc() {
        let out = lower(
            vec![param("n", ParamFlow::In), param("r", ParamFlow::Out)],
            "?i = 0 do until i >= n ?i = i + 1 end ?r = i",
        );

        assert!(out.diagnostics.is_empty(), "{:?}", out.diagnostics);

        // Two generated procs: the loop itself, and the continuation holding
        // the increment that follows the exit test.
        assert_eq!(out.new_procs.len(), 2);

        // The enclosing proc enters the loop; its output lands directly in r.
        let Prim::Call { callee, args } = &out.body.prims.first().unwrap().value else {
            panic!("expected the loop entry call");
        };
        let loop_proc = out
            .new_procs
            .iter()
            .find(|p| p.name == callee.name)
            .expect("entry call targets the loop proc");
        assert!(args
            .iter()
            .any(|a| a.var_name() == Some(PrimVarName::output(Ident::new("r")))));

        // The loop proc forks on the exit test. The continue branch (false)
        // hands off to the increment continuation, which tail-calls the loop.
        let PrimFork::Fork { branches, .. } = &loop_proc.body.fork else {
            panic!("expected the loop proc to fork on its condition");
        };
        let Prim::Call { callee, .. } = &branches[0].prims.last().unwrap().value else {
            panic!("continue branch must hand off to the continuation");
        };
        let cont = out
            .new_procs
            .iter()
            .find(|p| p.name == callee.name)
            .expect("continue branch targets the continuation");
        let Prim::Call { callee, .. } = &cont.body.prims.last().unwrap().value else {
            panic!("continuation must tail-call the loop");
        };
        assert_eq!(callee.name, loop_proc.name);

        // The break branch binds the loop's output from the current value.
        let Prim::Foreign { name, .. } = &branches[1].prims.last().unwrap().value else {
            panic!("break branch must bind the loop output");
        };
        assert_eq!(name, "move");
    }

    #[test]
    fn break_outside_loop_is_reported() {
        let out = lower(vec![], "break");
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.message.contains("outside a loop")));
    }

    #[test]
    fn unbound_variable_read_is_reported() {
        let out = lower(vec![param("y", ParamFlow::Out)], "?y = z + 1");
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.message.contains("before being bound")));
    }

    #[test]
    fn inout_parameter_splits_into_two_argument_halves() {
        let proto = prim_proto(
            Ident::new("p"),
            &[param("r", ParamFlow::InOut), param("x", ParamFlow::In)],
        );

        assert_eq!(proto.params.len(), 3);
        assert_eq!(proto.params[0].flow_type, ArgFlowType::FirstHalf);
        assert_eq!(proto.params[0].flow, PrimFlow::In);
        assert_eq!(proto.params[1].flow_type, ArgFlowType::SecondHalf);
        assert_eq!(proto.params[1].flow, PrimFlow::Out);
        assert_eq!(
            proto.params[1].name,
            PrimVarName::output(Ident::new("r"))
        );
    }
}
