//! The surface syntax as delivered by the parser: top level items, statement
//! forms, and expressions. Also home to the vocabulary shared by every later
//! stage: identifiers, module paths, visibility, and type specifications.

use serde::{Deserialize, Serialize};

use super::{intern::InternedSymbol, OptPos, Placed};

/// Opaque name of a module segment, variable, procedure, or type.
pub type Ident = InternedSymbol;

/// A module path: an ordered sequence of segments, written dotted.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModSpec(pub Vec<Ident>);

impl ModSpec {
    pub fn from_segments(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| InternedSymbol::new(s)).collect())
    }

    pub fn single(name: Ident) -> Self {
        Self(vec![name])
    }

    /// The path extended with one more segment, for submodules.
    pub fn child(&self, name: Ident) -> Self {
        let mut segments = self.0.clone();
        segments.push(name);
        Self(segments)
    }

    pub fn last(&self) -> Option<Ident> {
        self.0.last().copied()
    }
}

impl core::fmt::Display for ModSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(segment.value())?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for ModSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModSpec({self})")
    }
}

/// Whether a definition is visible outside its defining module. Public
/// "outranks" private, which is what makes combining import specs a simple
/// elementwise max.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Visibility {
    Private,
    Public,
}

/// A type expression. `Unspecified` marks a type still to be inferred;
/// everything else names a type constructor and its arguments. Equality is
/// structural.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TypeSpec {
    Unspecified,
    Type {
        mod_spec: ModSpec,
        name: Ident,
        params: Vec<TypeSpec>,
    },
}

impl TypeSpec {
    pub fn simple(mod_spec: ModSpec, name: &str) -> Self {
        TypeSpec::Type {
            mod_spec,
            name: InternedSymbol::new(name),
            params: Vec::new(),
        }
    }

    fn builtin(name: &str) -> Self {
        Self::simple(ModSpec::from_segments(&["wybe"]), name)
    }

    pub fn int() -> Self {
        Self::builtin("int")
    }

    pub fn float() -> Self {
        Self::builtin("float")
    }

    pub fn boolean() -> Self {
        Self::builtin("bool")
    }

    pub fn string() -> Self {
        Self::builtin("string")
    }

    pub fn char() -> Self {
        Self::builtin("char")
    }

    /// The type of raw heap references produced by `alloc` and consumed by
    /// `access`/`mutate`.
    pub fn address() -> Self {
        Self::builtin("address")
    }

    /// Phantom types carry no runtime value; parameters of phantom type are
    /// ignored by analysis and codegen.
    pub fn phantom() -> Self {
        Self::builtin("phantom")
    }

    pub fn is_unspecified(&self) -> bool {
        matches!(self, TypeSpec::Unspecified)
    }

    pub fn is_phantom(&self) -> bool {
        self == &Self::phantom()
    }

    pub fn is_address(&self) -> bool {
        self == &Self::address()
    }

    /// Values that live on the heap and can therefore be reached through
    /// more than one reference: the raw `address` builtin and every
    /// constructor type (constructed values lower to heap references). The
    /// scalar builtins are copied, never shared.
    pub fn is_heap_reference(&self) -> bool {
        if self.is_address() {
            return true;
        }
        match self {
            TypeSpec::Type { mod_spec, .. } => {
                *mod_spec != ModSpec::from_segments(&["wybe"])
            }
            TypeSpec::Unspecified => false,
        }
    }
}

impl core::fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeSpec::Unspecified => f.write_str("_"),
            TypeSpec::Type {
                mod_spec,
                name,
                params,
            } => {
                if !mod_spec.0.is_empty() {
                    write!(f, "{mod_spec}.")?;
                }
                f.write_str(name.value())?;
                if !params.is_empty() {
                    f.write_str("(")?;
                    for (i, p) in params.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{p}")?;
                    }
                    f.write_str(")")?;
                }
                Ok(())
            }
        }
    }
}

/// How a parameter or argument variable flows through a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamFlow {
    /// Passed into the callee (no prefix).
    In,
    /// Produced by the callee (`?` prefix).
    Out,
    /// Both: passed in and updated (`!` prefix).
    InOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: Ident,
    pub ty: TypeSpec,
    pub flow: ParamFlow,
    pub pos: OptPos,
}

/// A top level item in a module.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Module {
        name: Ident,
        items: Vec<Placed<Item>>,
    },
    Type(TypeDecl),
    Resource {
        name: Ident,
        ty: TypeSpec,
        visibility: Visibility,
    },
    Use {
        path: ModSpec,
        visibility: Visibility,
        /// `from path use a, b` imports only the named items; a plain
        /// `use path` imports the whole module.
        items: Option<Vec<Ident>>,
    },
    Proc(ProcDecl),
    Func(FuncDecl),
}

/// A sum type declaration; each constructor lists its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDecl {
    pub name: Ident,
    pub params: Vec<Ident>,
    pub ctors: Vec<Placed<CtorDecl>>,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CtorDecl {
    pub name: Ident,
    pub fields: Vec<Param>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcDecl {
    pub name: Ident,
    pub params: Vec<Param>,
    pub body: Vec<Placed<Stmt>>,
    pub visibility: Visibility,
    /// Semi-deterministic procedures declared with `test`; they may fail
    /// rather than producing outputs.
    pub is_test: bool,
}

/// A function declaration. Sugar: normalisation rewrites it into a procedure
/// with one extra out parameter bound to the body expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDecl {
    pub name: Ident,
    pub params: Vec<Param>,
    pub result_ty: TypeSpec,
    pub body: Placed<Exp>,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// A call to a procedure, possibly module-qualified.
    Call {
        module: Option<ModSpec>,
        name: Ident,
        args: Vec<Placed<Exp>>,
    },
    /// `?x = e` and friends. The left side must be a variable reference
    /// after flattening.
    Assign {
        lhs: Placed<Exp>,
        rhs: Placed<Exp>,
    },
    /// A direct foreign call, e.g. `foreign llvm add(x, y, ?z)`.
    Foreign {
        lang: String,
        name: String,
        flags: Vec<String>,
        args: Vec<Placed<Exp>>,
    },
    If {
        cond: Placed<Exp>,
        then_stmts: Vec<Placed<Stmt>>,
        else_stmts: Vec<Placed<Stmt>>,
    },
    /// `do ... end`: loops forever until `break`.
    Loop { body: Vec<Placed<Stmt>> },
    /// Loop generator: continue while the condition holds. Only valid inside
    /// `do`; flattening desugars it to a conditional `break`.
    While { cond: Placed<Exp> },
    /// Loop generator: exit once the condition holds.
    Until { cond: Placed<Exp> },
    Break,
    Next,
    Nop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),
    Var {
        name: Ident,
        flow: ParamFlow,
    },
    /// A function call in expression position. Flattening turns it into a
    /// procedure call with an extra out argument.
    Call {
        module: Option<ModSpec>,
        name: Ident,
        args: Vec<Placed<Exp>>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Placed<Exp>>,
        rhs: Box<Placed<Exp>>,
    },
    /// `e : Type` ascription.
    Typed {
        exp: Box<Placed<Exp>>,
        ty: TypeSpec,
    },
}

impl Exp {
    /// Atomic expressions need no flattening: they can sit directly in an
    /// argument position of a primitive.
    pub fn is_atomic(&self) -> bool {
        matches!(
            self,
            Exp::IntLit(_)
                | Exp::FloatLit(_)
                | Exp::StringLit(_)
                | Exp::CharLit(_)
                | Exp::Var { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOp {
    Add,      // +
    Subtract, // -
    Multiply, // *
    Divide,   // /
    Modulus,  // mod
    Equal,    // =  (in expression position)
    NotEqual, // ~=
    Less,     // <
    LessEq,   // <=
    Greater,  // >
    GreaterEq, // >=
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEq
                | BinaryOp::Greater
                | BinaryOp::GreaterEq
        )
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulus => "mod",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "~=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
        }
    }
}

/* Pretty printing back to concrete syntax. Reparsing printed output yields
 * the same tree (positions aside), which keeps the printer honest. */

fn write_args(f: &mut std::fmt::Formatter<'_>, args: &[Placed<Exp>]) -> std::fmt::Result {
    f.write_str("(")?;
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", arg.value)?;
    }
    f.write_str(")")
}

impl core::fmt::Display for Exp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exp::IntLit(value) => write!(f, "{value}"),
            Exp::FloatLit(value) => write!(f, "{value:?}"),
            Exp::StringLit(value) => write!(f, "{value:?}"),
            Exp::CharLit(value) => write!(f, "{value:?}"),
            Exp::Var { name, flow } => {
                let prefix = match flow {
                    ParamFlow::In => "",
                    ParamFlow::Out => "?",
                    ParamFlow::InOut => "!",
                };
                write!(f, "{prefix}{name}")
            }
            Exp::Call { module, name, args } => {
                if let Some(module) = module {
                    write!(f, "{module}.")?;
                }
                write!(f, "{name}")?;
                write_args(f, args)
            }
            Exp::Binary { op, lhs, rhs } => {
                write!(f, "({} {} {})", lhs.value, op.symbol(), rhs.value)
            }
            Exp::Typed { exp, ty } => write!(f, "{}:{ty}", exp.value),
        }
    }
}

impl core::fmt::Display for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.flow {
            ParamFlow::In => "",
            ParamFlow::Out => "?",
            ParamFlow::InOut => "!",
        };
        write!(f, "{prefix}{}", self.name)?;
        if !self.ty.is_unspecified() {
            write!(f, ":{}", self.ty)?;
        }
        Ok(())
    }
}

impl core::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stmt::Call { module, name, args } => {
                if let Some(module) = module {
                    write!(f, "{module}.")?;
                }
                write!(f, "{name}")?;
                write_args(f, args)
            }
            Stmt::Assign { lhs, rhs } => write!(f, "{} = {}", lhs.value, rhs.value),
            Stmt::Foreign {
                lang,
                name,
                flags,
                args,
            } => {
                write!(f, "foreign {lang} {name}")?;
                for flag in flags {
                    write!(f, " {flag}")?;
                }
                write_args(f, args)
            }
            Stmt::If {
                cond,
                then_stmts,
                else_stmts,
            } => {
                write!(f, "if {} then", cond.value)?;
                for stmt in then_stmts {
                    write!(f, " {}", stmt.value)?;
                }
                if !else_stmts.is_empty() {
                    write!(f, " else")?;
                    for stmt in else_stmts {
                        write!(f, " {}", stmt.value)?;
                    }
                }
                write!(f, " end")
            }
            Stmt::Loop { body } => {
                write!(f, "do")?;
                for stmt in body {
                    write!(f, " {}", stmt.value)?;
                }
                write!(f, " end")
            }
            Stmt::While { cond } => write!(f, "while {}", cond.value),
            Stmt::Until { cond } => write!(f, "until {}", cond.value),
            Stmt::Break => f.write_str("break"),
            Stmt::Next => f.write_str("next"),
            Stmt::Nop => Ok(()),
        }
    }
}

impl core::fmt::Display for ProcDecl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.visibility == Visibility::Public {
            f.write_str("pub ")?;
        }
        if self.is_test {
            f.write_str("test ")?;
        }
        write!(f, "proc {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
        }
        f.write_str(")")?;
        for stmt in &self.body {
            write!(f, " {}", stmt.value)?;
        }
        f.write_str(" end")
    }
}
