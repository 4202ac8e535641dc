//! The three-address primitive form. A lowered procedure is a tree of
//! `ProcBody` nodes: a straight-line run of prims ending in either nothing
//! (fall through to return) or a multi-way fork on an integer-valued
//! variable. Variables are SSA: each (name, suffix) pair is assigned at most
//! once along any root-to-leaf path.

use serde::{Deserialize, Serialize};

use crate::frontend::{
    ast::{Ident, ModSpec, TypeSpec},
    intern::InternedSymbol,
    Placed,
};

/// Foreign-language tag for the built-in arithmetic / comparison / move
/// operators understood by the code generator.
pub const LLVM: &str = "llvm";
/// Foreign-language tag for the structured-memory operators (`alloc`,
/// `access`, `mutate`, `cast`).
pub const LPVM: &str = "lpvm";

/// An SSA variable: the source name plus a numeric suffix distinguishing
/// successive bindings. Suffix 0 is the first binding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PrimVarName {
    pub name: Ident,
    pub suffix: i32,
}

impl PrimVarName {
    /// The suffix reserved for the ultimate output value of a name: the
    /// version bound to an out-flowing parameter.
    pub const OUTPUT_SUFFIX: i32 = -1;

    pub fn new(name: Ident, suffix: i32) -> Self {
        Self { name, suffix }
    }

    pub fn first(name: Ident) -> Self {
        Self { name, suffix: 0 }
    }

    pub fn output(name: Ident) -> Self {
        Self {
            name,
            suffix: Self::OUTPUT_SUFFIX,
        }
    }
}

impl core::fmt::Display for PrimVarName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.suffix == Self::OUTPUT_SUFFIX {
            write!(f, "{}#out", self.name)
        } else {
            write!(f, "{}#{}", self.name, self.suffix)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimFlow {
    In,
    Out,
}

/// How an argument came to have its flow: directly, or as one half of a
/// split in/out parameter, or invented by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArgFlowType {
    #[default]
    Ordinary,
    FirstHalf,
    SecondHalf,
    Implicit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimArg {
    Var {
        name: PrimVarName,
        ty: TypeSpec,
        flow: PrimFlow,
        flow_type: ArgFlowType,
        /// Set when upstream analysis has proved this read is the last use of
        /// the variable on its branch.
        final_use: bool,
    },
    Int {
        value: i64,
        ty: TypeSpec,
    },
    Float {
        value: f64,
        ty: TypeSpec,
    },
    Str {
        value: String,
        ty: TypeSpec,
    },
    Char {
        value: char,
        ty: TypeSpec,
    },
}

impl PrimArg {
    pub fn input_var(name: PrimVarName, ty: TypeSpec) -> Self {
        PrimArg::Var {
            name,
            ty,
            flow: PrimFlow::In,
            flow_type: ArgFlowType::Ordinary,
            final_use: false,
        }
    }

    pub fn output_var(name: PrimVarName, ty: TypeSpec) -> Self {
        PrimArg::Var {
            name,
            ty,
            flow: PrimFlow::Out,
            flow_type: ArgFlowType::Ordinary,
            final_use: false,
        }
    }

    pub fn int(value: i64) -> Self {
        PrimArg::Int {
            value,
            ty: TypeSpec::int(),
        }
    }

    pub fn var_name(&self) -> Option<PrimVarName> {
        match self {
            PrimArg::Var { name, .. } => Some(*name),
            _ => None,
        }
    }

    pub fn is_input(&self) -> bool {
        match self {
            PrimArg::Var { flow, .. } => *flow == PrimFlow::In,
            _ => true,
        }
    }

    pub fn is_output(&self) -> bool {
        matches!(
            self,
            PrimArg::Var {
                flow: PrimFlow::Out,
                ..
            }
        )
    }

    pub fn is_literal(&self) -> bool {
        !matches!(self, PrimArg::Var { .. })
    }

    pub fn ty(&self) -> &TypeSpec {
        match self {
            PrimArg::Var { ty, .. }
            | PrimArg::Int { ty, .. }
            | PrimArg::Float { ty, .. }
            | PrimArg::Str { ty, .. }
            | PrimArg::Char { ty, .. } => ty,
        }
    }

    pub fn final_use(&self) -> bool {
        matches!(self, PrimArg::Var { final_use: true, .. })
    }

    /// The same variable reference flipped to an in-flow read.
    pub fn as_input(&self) -> PrimArg {
        match self {
            PrimArg::Var { name, ty, .. } => PrimArg::input_var(*name, ty.clone()),
            other => other.clone(),
        }
    }
}

impl core::fmt::Display for PrimArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimArg::Var {
                name,
                flow,
                final_use,
                ..
            } => {
                if *flow == PrimFlow::Out {
                    write!(f, "?")?;
                }
                write!(f, "{name}")?;
                if *final_use {
                    write!(f, "^")?;
                }
                Ok(())
            }
            PrimArg::Int { value, .. } => write!(f, "{value}"),
            PrimArg::Float { value, .. } => write!(f, "{value}"),
            PrimArg::Str { value, .. } => write!(f, "{value:?}"),
            PrimArg::Char { value, .. } => write!(f, "{value:?}"),
        }
    }
}

/// Fully resolved name of a procedure: its defining module, source name, and
/// the index distinguishing same-named overloads.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProcSpec {
    pub mod_spec: ModSpec,
    pub name: Ident,
    pub id: usize,
}

impl ProcSpec {
    pub fn new(mod_spec: ModSpec, name: Ident, id: usize) -> Self {
        Self { mod_spec, name, id }
    }
}

impl core::fmt::Display for ProcSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}<{}>", self.mod_spec, self.name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prim {
    Call {
        callee: ProcSpec,
        args: Vec<PrimArg>,
    },
    Foreign {
        lang: String,
        name: String,
        flags: Vec<String>,
        args: Vec<PrimArg>,
    },
    /// Succeeds iff the variable holds the given value; otherwise the
    /// enclosing semi-deterministic context fails.
    Guard { var: PrimVarName, value: i64 },
    Fail,
    Nop,
}

impl Prim {
    pub fn args(&self) -> &[PrimArg] {
        match self {
            Prim::Call { args, .. } | Prim::Foreign { args, .. } => args,
            Prim::Guard { .. } | Prim::Fail | Prim::Nop => &[],
        }
    }

    pub fn args_mut(&mut self) -> Option<&mut Vec<PrimArg>> {
        match self {
            Prim::Call { args, .. } | Prim::Foreign { args, .. } => Some(args),
            Prim::Guard { .. } | Prim::Fail | Prim::Nop => None,
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &PrimArg> {
        self.args().iter().filter(|a| a.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PrimArg> {
        self.args().iter().filter(|a| a.is_output())
    }

    /// A foreign `llvm move` copying one value into one output variable.
    pub fn move_prim(source: PrimArg, destination: PrimArg) -> Prim {
        Prim::Foreign {
            lang: LLVM.into(),
            name: "move".into(),
            flags: Vec::new(),
            args: vec![source, destination],
        }
    }

    /// The foreign operations able to create aliases between their inputs
    /// and outputs.
    pub fn escapable_name(&self) -> Option<&str> {
        match self {
            Prim::Foreign { name, .. }
                if matches!(name.as_str(), "move" | "mutate" | "access" | "cast") =>
            {
                Some(name)
            }
            _ => None,
        }
    }

    pub fn is_foreign_named(&self, lang: &str, op: &str) -> bool {
        matches!(
            self,
            Prim::Foreign { lang: l, name, .. } if l == lang && name == op
        )
    }
}

impl core::fmt::Display for Prim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Prim::Call { callee, args } => {
                write!(f, "{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Prim::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                write!(f, "foreign {lang} {name}")?;
                for flag in flags {
                    write!(f, " {flag}")?;
                }
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Prim::Guard { var, value } => write!(f, "guard {var} = {value}"),
            Prim::Fail => write!(f, "fail"),
            Prim::Nop => write!(f, "nop"),
        }
    }
}

/// One formal parameter of a lowered procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimParam {
    pub name: PrimVarName,
    pub ty: TypeSpec,
    pub flow: PrimFlow,
    pub flow_type: ArgFlowType,
}

impl PrimParam {
    pub fn is_phantom(&self) -> bool {
        self.ty.is_phantom()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimProto {
    pub name: Ident,
    pub params: Vec<PrimParam>,
}

impl PrimProto {
    pub fn inputs(&self) -> impl Iterator<Item = &PrimParam> {
        self.params.iter().filter(|p| p.flow == PrimFlow::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &PrimParam> {
        self.params.iter().filter(|p| p.flow == PrimFlow::Out)
    }

    /// Parameter names that matter to analysis: everything non-phantom.
    pub fn real_param_names(&self) -> Vec<PrimVarName> {
        self.params
            .iter()
            .filter(|p| !p.is_phantom())
            .map(|p| p.name)
            .collect()
    }
}

/// A (possibly forked) straight-line body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcBody {
    pub prims: Vec<Placed<Prim>>,
    pub fork: PrimFork,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum PrimFork {
    #[default]
    NoFork,
    Fork {
        var: PrimVarName,
        /// Set when the branches do not rejoin: each one is terminal, so a
        /// consumer may treat the fork as a tail position.
        is_final: bool,
        /// Branch index equals the tested variable's value.
        branches: Vec<ProcBody>,
    },
}

impl ProcBody {
    pub fn new(prims: Vec<Placed<Prim>>, fork: PrimFork) -> Self {
        Self { prims, fork }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Visits every prim in the tree, depth first.
    pub fn visit_prims<'a>(&'a self, visit: &mut impl FnMut(&'a Placed<Prim>)) {
        for prim in &self.prims {
            visit(prim);
        }
        if let PrimFork::Fork { branches, .. } = &self.fork {
            for branch in branches {
                branch.visit_prims(visit);
            }
        }
    }

    /// All variable names assigned anywhere in the tree.
    pub fn assigned_vars(&self) -> Vec<PrimVarName> {
        let mut vars = Vec::new();
        self.visit_prims(&mut |prim| {
            for arg in prim.value.outputs() {
                if let Some(name) = arg.var_name() {
                    vars.push(name);
                }
            }
        });
        vars
    }
}

/// Symbol generated for compiler-introduced temporaries; the grammar forbids
/// user identifiers starting with `$`, so these can never collide.
pub fn temp_var(n: usize) -> Ident {
    InternedSymbol::new(&format!("$tmp{n}"))
}
