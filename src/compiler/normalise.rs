//! Normalises parsed items into the module tables. Functions become
//! procedures with an extra out parameter; type declarations expand their
//! constructors into primitive `alloc`/`access`/`mutate` procs (a
//! constructor, and a getter and setter per field of single-constructor
//! types); `test` procs gain their implicit boolean success output.

use log::debug;

use crate::{
    error::Diagnostic,
    frontend::{
        ast::{
            CtorDecl, Exp, FuncDecl, Ident, Item, ModSpec, Param, ParamFlow, ProcDecl, Stmt,
            TypeDecl, TypeSpec, Visibility,
        },
        intern::InternedSymbol,
        OptPos, Placed,
    },
};

use super::modules::{ImportSpec, Module, ProcDef, ProcImpl, ProcProto, ResourceDef, TypeDef};

/// Each heap word is eight bytes; constructor layout is word-per-field.
const WORD_SIZE: i64 = 8;

#[derive(Debug, Default)]
pub struct NormaliseOutput {
    /// Imports to load once this module's declarations are in the tables.
    pub imports: Vec<(ModSpec, ImportSpec, OptPos)>,
    /// Nested module declarations, compiled as child modules.
    pub submodules: Vec<(Ident, Vec<Placed<Item>>)>,
}

/// Files a module's items into its tables. Declarations are processed in
/// two passes so procs can refer to types declared later in the file.
pub fn normalise_items(
    module: &mut Module,
    items: Vec<Placed<Item>>,
    diagnostics: &mut Vec<Diagnostic>,
) -> NormaliseOutput {
    let mut output = NormaliseOutput::default();
    let mut callables: Vec<Placed<Item>> = Vec::new();

    for item in items {
        let pos = item.pos.clone();
        match item.value {
            Item::Module { name, items } => output.submodules.push((name, items)),
            Item::Use {
                path,
                visibility,
                items,
            } => {
                let import = match items {
                    None => ImportSpec::whole_module(visibility),
                    Some(items) => ImportSpec {
                        items: items.into_iter().map(|item| (item, visibility)).collect(),
                        whole: None,
                    },
                };
                output.imports.push((path, import, pos));
            }
            Item::Type(decl) => normalise_type(module, decl, pos, diagnostics),
            Item::Resource {
                name,
                ty,
                visibility,
            } => {
                module.add_resource(
                    name,
                    ResourceDef {
                        ty,
                        visibility,
                        pos,
                    },
                );
            }
            callable => callables.push(Placed::new(callable, pos)),
        }
    }

    for item in callables {
        let pos = item.pos.clone();
        match item.value {
            Item::Proc(decl) => normalise_proc(module, decl, pos),
            Item::Func(decl) => normalise_func(module, decl, pos),
            _ => unreachable!("only callables deferred to the second pass"),
        }
    }

    output
}

/// Qualifies bare type names that refer to types of this module.
fn resolve_local_type(module: &Module, ty: TypeSpec) -> TypeSpec {
    match ty {
        TypeSpec::Type {
            mod_spec,
            name,
            params,
        } if mod_spec.0.is_empty() => match module.local_type(name) {
            Some(resolved) => resolved,
            None => TypeSpec::Type {
                mod_spec,
                name,
                params,
            },
        },
        other => other,
    }
}

fn resolve_params(module: &Module, params: Vec<Param>) -> Vec<Param> {
    params
        .into_iter()
        .map(|mut param| {
            param.ty = resolve_local_type(module, param.ty);
            param
        })
        .collect()
}

fn normalise_proc(module: &mut Module, decl: ProcDecl, pos: OptPos) {
    let mut params = resolve_params(module, decl.params);

    // Semi-deterministic procs report success through an implicit boolean
    // output.
    if decl.is_test {
        params.push(Param {
            name: InternedSymbol::new("$success"),
            ty: TypeSpec::boolean(),
            flow: ParamFlow::Out,
            pos: None,
        });
    }

    module.add_proc(ProcDef {
        name: decl.name,
        id: 0,
        proto: ProcProto {
            name: decl.name,
            params,
        },
        impln: ProcImpl::Source { body: decl.body },
        visibility: decl.visibility,
        is_test: decl.is_test,
        pos,
        temp_count: 0,
    });
}

/// `func f(x):t = e` is sugar for `proc f(x, ?$result:t) ?$result = e end`.
fn normalise_func(module: &mut Module, decl: FuncDecl, pos: OptPos) {
    let result = InternedSymbol::new("$result");
    let mut params = resolve_params(module, decl.params);
    params.push(Param {
        name: result,
        ty: resolve_local_type(module, decl.result_ty),
        flow: ParamFlow::Out,
        pos: None,
    });

    let body = vec![Placed::new(
        Stmt::Assign {
            lhs: Placed::unplaced(Exp::Var {
                name: result,
                flow: ParamFlow::Out,
            }),
            rhs: decl.body,
        },
        pos.clone(),
    )];

    module.add_proc(ProcDef {
        name: decl.name,
        id: 0,
        proto: ProcProto {
            name: decl.name,
            params,
        },
        impln: ProcImpl::Source { body },
        visibility: decl.visibility,
        is_test: false,
        pos,
        temp_count: 0,
    });
}

fn normalise_type(
    module: &mut Module,
    decl: TypeDecl,
    pos: OptPos,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if module
        .implementation()
        .types
        .contains_key(&decl.name)
    {
        diagnostics.push(Diagnostic::error(
            format!("type `{}` declared twice", decl.name),
            pos,
        ));
        return;
    }

    let ctors = decl.ctors.clone();
    module.add_type(
        decl.name,
        TypeDef {
            params: decl.params,
            ctors: ctors.clone(),
            visibility: decl.visibility,
            pos: pos.clone(),
        },
    );

    let value_ty = TypeSpec::Type {
        mod_spec: module.spec.clone(),
        name: decl.name,
        params: Vec::new(),
    };

    // Multiple constructors need a tag word ahead of the fields.
    let tagged = ctors.len() > 1;

    for (tag, ctor) in ctors.iter().enumerate() {
        expand_ctor(
            module,
            &ctor.value,
            ctor.pos.clone(),
            &value_ty,
            tagged,
            tag as i64,
            decl.visibility,
        );
    }

    // Field access only desugars for single-constructor types; reading a
    // field of a sum value first needs a constructor test.
    if let [only] = ctors.as_slice() {
        expand_accessors(module, &only.value, &value_ty, decl.visibility);
    }

    debug!(
        target: "driver",
        "expanded type {} into {} ctor proc(s)",
        decl.name,
        ctors.len()
    );
}

fn int_exp(value: i64) -> Placed<Exp> {
    Placed::unplaced(Exp::IntLit(value))
}

fn var_exp(name: Ident, flow: ParamFlow) -> Placed<Exp> {
    Placed::unplaced(Exp::Var { name, flow })
}

fn typed_exp(exp: Placed<Exp>, ty: TypeSpec) -> Placed<Exp> {
    Placed::unplaced(Exp::Typed {
        exp: Box::new(exp),
        ty,
    })
}

fn lpvm_stmt(name: &str, args: Vec<Placed<Exp>>) -> Placed<Stmt> {
    Placed::unplaced(Stmt::Foreign {
        lang: "lpvm".into(),
        name: name.into(),
        flags: Vec::new(),
        args,
    })
}

/// The constructor proc: allocate, then initialise every slot. The mutates
/// are destructive from the start since the structure is freshly allocated.
fn expand_ctor(
    module: &mut Module,
    ctor: &CtorDecl,
    pos: OptPos,
    value_ty: &TypeSpec,
    tagged: bool,
    tag: i64,
    visibility: Visibility,
) {
    let result = InternedSymbol::new("$result");
    let field_base = if tagged { 1 } else { 0 };
    let size = WORD_SIZE * (ctor.fields.len() as i64 + field_base);

    let mut body = vec![lpvm_stmt(
        "alloc",
        vec![
            int_exp(size),
            typed_exp(var_exp(result, ParamFlow::Out), value_ty.clone()),
        ],
    )];

    if tagged {
        body.push(lpvm_stmt(
            "mutate",
            vec![
                var_exp(result, ParamFlow::In),
                typed_exp(var_exp(result, ParamFlow::Out), value_ty.clone()),
                int_exp(size),
                int_exp(0),
                int_exp(1),
                int_exp(tag),
            ],
        ));
    }

    for (index, field) in ctor.fields.iter().enumerate() {
        let offset = WORD_SIZE * (index as i64 + field_base);
        body.push(lpvm_stmt(
            "mutate",
            vec![
                var_exp(result, ParamFlow::In),
                typed_exp(var_exp(result, ParamFlow::Out), value_ty.clone()),
                int_exp(size),
                int_exp(offset),
                int_exp(1),
                var_exp(field.name, ParamFlow::In),
            ],
        ));
    }

    let mut params: Vec<Param> = ctor
        .fields
        .iter()
        .map(|field| Param {
            name: field.name,
            ty: resolve_local_type(module, field.ty.clone()),
            flow: ParamFlow::In,
            pos: field.pos.clone(),
        })
        .collect();
    params.push(Param {
        name: result,
        ty: value_ty.clone(),
        flow: ParamFlow::Out,
        pos: None,
    });

    module.add_proc(ProcDef {
        name: ctor.name,
        id: 0,
        proto: ProcProto {
            name: ctor.name,
            params,
        },
        impln: ProcImpl::Source { body },
        visibility,
        is_test: false,
        pos,
        temp_count: 0,
    });
}

/// Getter and setter for each field, named after the field: the getter is
/// `(value, ?field)`, the setter `(!value, field)`. The setter's mutate is
/// non-destructive until alias analysis proves otherwise.
fn expand_accessors(
    module: &mut Module,
    ctor: &CtorDecl,
    value_ty: &TypeSpec,
    visibility: Visibility,
) {
    let size = WORD_SIZE * ctor.fields.len() as i64;

    for (index, field) in ctor.fields.iter().enumerate() {
        let offset = WORD_SIZE * index as i64;
        let field_ty = resolve_local_type(module, field.ty.clone());
        let holder = InternedSymbol::new("$rec");
        let value = InternedSymbol::new("$field");

        let getter_body = vec![lpvm_stmt(
            "access",
            vec![
                var_exp(holder, ParamFlow::In),
                int_exp(offset),
                int_exp(WORD_SIZE),
                typed_exp(var_exp(value, ParamFlow::Out), field_ty.clone()),
            ],
        )];
        module.add_proc(ProcDef {
            name: field.name,
            id: 0,
            proto: ProcProto {
                name: field.name,
                params: vec![
                    Param {
                        name: holder,
                        ty: value_ty.clone(),
                        flow: ParamFlow::In,
                        pos: None,
                    },
                    Param {
                        name: value,
                        ty: field_ty.clone(),
                        flow: ParamFlow::Out,
                        pos: None,
                    },
                ],
            },
            impln: ProcImpl::Source { body: getter_body },
            visibility,
            is_test: false,
            pos: field.pos.clone(),
            temp_count: 0,
        });

        let setter_body = vec![lpvm_stmt(
            "mutate",
            vec![
                var_exp(holder, ParamFlow::In),
                typed_exp(var_exp(holder, ParamFlow::Out), value_ty.clone()),
                int_exp(size),
                int_exp(offset),
                int_exp(0),
                var_exp(value, ParamFlow::In),
            ],
        )];
        module.add_proc(ProcDef {
            name: field.name,
            id: 0,
            proto: ProcProto {
                name: field.name,
                params: vec![
                    Param {
                        name: holder,
                        ty: value_ty.clone(),
                        flow: ParamFlow::InOut,
                        pos: None,
                    },
                    Param {
                        name: value,
                        ty: field_ty,
                        flow: ParamFlow::In,
                        pos: None,
                    },
                ],
            },
            impln: ProcImpl::Source { body: setter_body },
            visibility,
            is_test: false,
            pos: field.pos.clone(),
            temp_count: 0,
        });
    }
}
