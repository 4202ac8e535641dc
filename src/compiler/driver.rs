//! Orchestrates compilation. A source file becomes a module: its items are
//! normalised into the tables, its imports are loaded (recursively, with
//! cycles detected through the under-compilation stack), and its procs are
//! flattened, unbranched, and typed. When a module closes its strongly
//! connected component, the whole component is alias-analysed to a fixed
//! point and handed to code generation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::debug;

use crate::{
    backend::{self, llvm},
    error::{CompileError, Diagnostic, Result},
    frontend::{
        ast::{Ident, Item, ModSpec, Param, ParamFlow, TypeSpec, Visibility},
        intern::InternedSymbol,
        parser, OptPos, Placed, SourceFile, SourceFileOrigin,
    },
    middle::{
        analysis::{self, union_find::AliasMap, ProcAnalysis, ProcInfo},
        flatten,
        prim::{PrimParam, ProcSpec},
        types,
        unbranch::{self, CalleeResolver, Unbrancher},
    },
};

use super::{
    artifact,
    modules::{ImportSpec, Module, ProcDef, ProcImpl, ProcProto},
    normalise, CompilerState,
};

pub const SOURCE_EXTENSION: &str = "wybe";

/// Compiles one source file as a top level module, loading whatever it
/// imports along the way.
pub fn compile_source_file(state: &mut CompilerState, path: &Path) -> Result<ModSpec> {
    let contents = std::fs::read_to_string(path)?;
    let source = SourceFile {
        contents,
        origin: SourceFileOrigin::File(path.to_path_buf()),
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CompileError::internal("source path has no file stem"))?;
    let spec = ModSpec::single(InternedSymbol::new(stem));
    let directory = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    compile_module_source(state, directory, spec.clone(), &source)?;
    Ok(spec)
}

/// Compiles an in-memory module. The main entry for tests and the REPL-ish
/// paths: everything the driver does flows through here.
pub fn compile_module_source(
    state: &mut CompilerState,
    directory: PathBuf,
    spec: ModSpec,
    source: &SourceFile,
) -> Result<()> {
    state.enter_module(directory, spec);

    let (items, parse_errors) = parser::parse_items(source);
    for error in parse_errors {
        state.message(Diagnostic::error(error.message, error.pos));
    }

    process_items(state, items)?;

    let scc = state.exit_module()?;
    if !scc.is_empty() {
        finish_scc(state, &scc)?;
    }
    Ok(())
}

fn process_items(state: &mut CompilerState, items: Vec<Placed<Item>>) -> Result<()> {
    let mut diagnostics = Vec::new();
    let output = normalise::normalise_items(state.current_module_mut()?, items, &mut diagnostics);
    state.messages(diagnostics);

    // Nested modules compile as children; the parent sees each like a
    // privately imported module.
    for (name, items) in output.submodules {
        let (directory, child_spec) = {
            let module = state.current_module()?;
            (module.directory.clone(), module.spec.child(name))
        };

        state.enter_module(directory, child_spec.clone());
        process_items(state, items)?;
        let scc = state.exit_module()?;
        if !scc.is_empty() {
            finish_scc(state, &scc)?;
        }

        let parent = state.current_module_mut()?;
        parent
            .implementation_mut()
            .submodules
            .insert(name, child_spec.clone());
        parent.add_import(
            child_spec.clone(),
            ImportSpec::whole_module(Visibility::Private),
        );
        note_open_dependency(state, &child_spec)?;
    }

    for (import_spec, import, pos) in output.imports {
        load_import(state, import_spec, import, pos)?;
    }

    lower_module_procs(state)
}

/// If the dependency is still open (on the stack or deferred), fold its
/// load number into the current module's lowlink.
fn note_open_dependency(state: &mut CompilerState, spec: &ModSpec) -> Result<()> {
    if let Some(num) = state.is_under_compilation(spec) {
        state.note_dependency_num(num)?;
    } else if let Some(min) = state.deferred_min_dependency(spec) {
        state.note_dependency_num(min)?;
    }
    Ok(())
}

fn load_import(
    state: &mut CompilerState,
    spec: ModSpec,
    import: ImportSpec,
    pos: OptPos,
) -> Result<()> {
    state.current_module_mut()?.add_import(spec.clone(), import);

    if state.modules.contains_key(&spec) {
        return Ok(());
    }

    // An import of something already being compiled is a module cycle; it
    // completes when its SCC root exits.
    if state.is_under_compilation(&spec).is_some()
        || state.deferred_min_dependency(&spec).is_some()
    {
        return note_open_dependency(state, &spec);
    }

    let directory = state.current_module()?.directory.clone();
    let Some(name) = spec.last() else {
        state.message(Diagnostic::error("empty module path in `use`", pos));
        return Ok(());
    };

    let source_path = directory.join(name.value()).with_extension(SOURCE_EXTENSION);
    if source_path.exists() {
        let contents = std::fs::read_to_string(&source_path)?;
        let source = SourceFile {
            contents,
            origin: SourceFileOrigin::File(source_path),
        };
        compile_module_source(state, directory, spec.clone(), &source)?;
        return note_open_dependency(state, &spec);
    }

    // Separate compilation: fall back to a previously written artifact.
    let artifact_path = artifact::artifact_path(&directory, &spec);
    if artifact_path.exists() {
        let load_num = state.next_load_num();
        let module = artifact::read_module(&artifact_path, load_num)?;
        state.modules.insert(spec, module);
        return Ok(());
    }

    state.message(Diagnostic::error(
        format!("cannot find module `{spec}`"),
        pos,
    ));
    Ok(())
}

/* Call resolution */

/// A snapshot of everything the current module's calls can resolve to:
/// its own procs and the public procs of its imports.
struct ModuleResolver {
    local: BTreeMap<Ident, Vec<(ProcSpec, Vec<Param>)>>,
    imported: BTreeMap<Ident, Vec<(ProcSpec, Vec<Param>)>>,
    by_module: BTreeMap<ModSpec, BTreeMap<Ident, Vec<(ProcSpec, Vec<Param>)>>>,
}

fn flows_match(params: &[Param], flows: &[ParamFlow]) -> bool {
    params.len() == flows.len()
        && params
            .iter()
            .zip(flows.iter())
            .all(|(param, flow)| param.flow == *flow)
}

impl CalleeResolver for ModuleResolver {
    fn resolve(
        &self,
        module: Option<&ModSpec>,
        name: Ident,
        arg_flows: &[ParamFlow],
    ) -> Option<(ProcSpec, Vec<Param>)> {
        let pick = |candidates: &Vec<(ProcSpec, Vec<Param>)>| {
            candidates
                .iter()
                .find(|(_, params)| flows_match(params, arg_flows))
                .cloned()
        };

        match module {
            Some(module) => pick(self.by_module.get(module)?.get(&name)?),
            None => self
                .local
                .get(&name)
                .and_then(pick)
                .or_else(|| self.imported.get(&name).and_then(pick)),
        }
    }
}

fn build_resolver(state: &CompilerState) -> Result<ModuleResolver> {
    let module = state.current_module()?;

    let mut local: BTreeMap<Ident, Vec<(ProcSpec, Vec<Param>)>> = BTreeMap::new();
    for (name, defs) in &module.implementation().procs {
        let entry = local.entry(*name).or_default();
        for def in defs {
            entry.push((
                ProcSpec::new(module.spec.clone(), *name, def.id),
                def.proto.params.clone(),
            ));
        }
    }

    let mut imported: BTreeMap<Ident, Vec<(ProcSpec, Vec<Param>)>> = BTreeMap::new();
    let mut by_module = BTreeMap::new();

    for (import_spec, import) in &module.implementation().imports {
        let Some(imported_module) = state.find_module(import_spec) else {
            continue;
        };

        let mut module_procs: BTreeMap<Ident, Vec<(ProcSpec, Vec<Param>)>> = BTreeMap::new();
        for (name, entries) in &imported_module.interface.public_procs {
            let visible = import.whole.is_some() || import.items.contains_key(name);
            if !visible {
                continue;
            }
            for entry in entries {
                let candidate = (
                    ProcSpec::new(import_spec.clone(), *name, entry.id),
                    entry.proto.params.clone(),
                );
                module_procs.entry(*name).or_default().push(candidate.clone());
                imported.entry(*name).or_default().push(candidate);
            }
        }
        by_module.insert(import_spec.clone(), module_procs);
    }

    Ok(ModuleResolver {
        local,
        imported,
        by_module,
    })
}

/* Lowering */

fn lower_module_procs(state: &mut CompilerState) -> Result<()> {
    let resolver = build_resolver(state)?;
    let mod_spec = state.current_module()?.spec.clone();

    let mut procs = std::mem::take(&mut state.current_module_mut()?.implementation_mut().procs);
    let mut diagnostics = Vec::new();
    let mut generated: Vec<ProcDef> = Vec::new();

    for defs in procs.values_mut() {
        for def in defs.iter_mut() {
            let ProcImpl::Source { body } = &def.impln else {
                continue;
            };

            debug!(target: "driver", "lowering {}.{}", mod_spec, def.name);

            let (flat, temp_count) = flatten::flatten_stmts(body.clone(), def.temp_count);
            def.temp_count = temp_count;

            let unbrancher = Unbrancher::new(mod_spec.clone(), def.name, &resolver);
            let lowered = unbrancher.lower_proc(&def.proto.params, &flat)?;
            diagnostics.extend(lowered.diagnostics);

            def.advance_impl(ProcImpl::Prim {
                proto: unbranch::prim_proto(def.name, &def.proto.params),
                body: lowered.body,
                analysis: ProcAnalysis::default(),
            })?;

            for new_proc in lowered.new_procs {
                generated.push(ProcDef {
                    name: new_proc.name,
                    id: 0,
                    proto: ProcProto {
                        name: new_proc.name,
                        params: new_proc.source_params,
                    },
                    impln: ProcImpl::Prim {
                        proto: new_proc.proto,
                        body: new_proc.body,
                        analysis: ProcAnalysis::default(),
                    },
                    visibility: Visibility::Private,
                    is_test: false,
                    pos: None,
                    temp_count: 0,
                });
            }
        }
    }

    {
        let module = state.current_module_mut()?;
        module.implementation_mut().procs = procs;
        for def in generated {
            module.add_proc(def);
        }
    }
    state.messages(diagnostics);

    // Types flow between the procs just lowered (continuations learn their
    // parameter types from their call sites), then final uses are marked
    // for the analysis to come.
    let mut infos = collect_proc_infos(state.current_module()?);
    {
        let external = |spec: &ProcSpec| -> Option<Vec<TypeSpec>> {
            let module = state.modules.get(&spec.mod_spec)?;
            let def = module.lookup_procs(spec.name).get(spec.id)?;
            match &def.impln {
                ProcImpl::Prim { proto, .. } | ProcImpl::Blocks { proto, .. } => {
                    Some(proto.params.iter().map(|p| p.ty.clone()).collect())
                }
                ProcImpl::Source { .. } => None,
            }
        };
        types::propagate_types(&mut infos, &external);
    }
    for info in infos.values_mut() {
        analysis::mark_final_uses(&mut info.body);
    }
    write_back_proc_infos(state.current_module_mut()?, infos)
}

/// Clones the primitive-form procs of a module into the analysis working
/// set.
fn collect_proc_infos(module: &Module) -> BTreeMap<ProcSpec, ProcInfo> {
    let mut infos = BTreeMap::new();
    for defs in module.implementation().procs.values() {
        for def in defs {
            if let ProcImpl::Prim {
                proto,
                body,
                analysis,
            } = &def.impln
            {
                infos.insert(
                    ProcSpec::new(module.spec.clone(), def.name, def.id),
                    ProcInfo {
                        proto: proto.clone(),
                        body: body.clone(),
                        analysis: analysis.clone(),
                    },
                );
            }
        }
    }
    infos
}

fn write_back_proc_infos(
    module: &mut Module,
    infos: BTreeMap<ProcSpec, ProcInfo>,
) -> Result<()> {
    for (spec, info) in infos {
        let defs = module
            .implementation_mut()
            .procs
            .get_mut(&spec.name)
            .ok_or_else(|| CompileError::internal(format!("lost proc {spec}")))?;
        let def = defs
            .get_mut(spec.id)
            .ok_or_else(|| CompileError::internal(format!("lost proc {spec}")))?;
        def.advance_impl(ProcImpl::Prim {
            proto: info.proto,
            body: info.body,
            analysis: info.analysis,
        })?;
    }
    Ok(())
}

/* SCC completion */

/// Runs alias analysis to a fixed point over every proc of a completed
/// module component, then emits code for it (unless errors were seen).
fn finish_scc(state: &mut CompilerState, specs: &[ModSpec]) -> Result<()> {
    debug!(target: "driver", "completing component: {}", specs.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", "));

    let mut procs: BTreeMap<ProcSpec, ProcInfo> = BTreeMap::new();
    for spec in specs {
        let module = state
            .modules
            .get(spec)
            .ok_or_else(|| CompileError::internal(format!("completed module {spec} not loaded")))?;
        procs.extend(collect_proc_infos(module));
    }

    {
        let external = |callee: &ProcSpec| -> Option<(Vec<PrimParam>, AliasMap)> {
            let module = state.modules.get(&callee.mod_spec)?;
            let def = module.lookup_procs(callee.name).get(callee.id)?;
            match &def.impln {
                ProcImpl::Prim { proto, analysis, .. }
                | ProcImpl::Blocks { proto, analysis, .. } => {
                    Some((proto.params.clone(), analysis.arg_alias_map.clone()))
                }
                ProcImpl::Source { .. } => None,
            }
        };
        analysis::analyse_procs(&mut procs, &external);
    }

    for (spec, info) in procs {
        let module = state
            .modules
            .get_mut(&spec.mod_spec)
            .ok_or_else(|| CompileError::internal(format!("lost module of {spec}")))?;
        let defs = module
            .implementation_mut()
            .procs
            .get_mut(&spec.name)
            .ok_or_else(|| CompileError::internal(format!("lost proc {spec}")))?;
        defs[spec.id].advance_impl(ProcImpl::Prim {
            proto: info.proto,
            body: info.body,
            analysis: info.analysis,
        })?;
    }

    // Nothing is emitted once an error has been reported; the diagnostics
    // still flush so the user sees the whole batch.
    if state.errors_seen() {
        return Ok(());
    }

    for spec in specs {
        emit_module(state, spec)?;

        if state.options.write_artifacts {
            let module = &state.modules[spec];
            let path = artifact::artifact_path(&module.directory, spec);
            if let Err(error) = artifact::write_module(module, &path) {
                state.message(Diagnostic::warning(
                    format!("could not write artifact for `{spec}`: {error}"),
                    None,
                ));
            }
        }
    }
    Ok(())
}

fn emit_module(state: &mut CompilerState, spec: &ModSpec) -> Result<()> {
    let module = &state.modules[spec];

    let mut emitted: Vec<(ProcSpec, llvm::EmittedProc)> = Vec::new();
    let mut problems: Vec<Diagnostic> = Vec::new();

    for defs in module.implementation().procs.values() {
        for def in defs {
            let ProcImpl::Prim { proto, body, .. } = &def.impln else {
                continue;
            };
            let proc_spec = ProcSpec::new(spec.clone(), def.name, def.id);

            let contract = backend::verify_proc(proto, body);
            if !contract.is_empty() {
                for problem in contract {
                    problems.push(Diagnostic::error(problem, def.pos.clone()));
                }
                continue;
            }

            emitted.push((proc_spec.clone(), llvm::emit_proc(&proc_spec, proto, body)?));
        }
    }

    if !problems.is_empty() {
        state.messages(problems);
        return Ok(());
    }

    let module = state
        .modules
        .get_mut(spec)
        .expect("module present throughout emission");
    for (proc_spec, code) in emitted {
        let defs = module
            .implementation_mut()
            .procs
            .get_mut(&proc_spec.name)
            .expect("emitted proc still present");
        let def = &mut defs[proc_spec.id];
        let ProcImpl::Prim {
            proto,
            body,
            analysis,
        } = &def.impln
        else {
            continue;
        };
        let (proto, body, analysis) = (proto.clone(), body.clone(), analysis.clone());
        def.advance_impl(ProcImpl::Blocks {
            proto,
            body,
            analysis,
            code,
        })?;
    }

    Ok(())
}

/// Renders a module's emitted procs as one textual LLVM module. Procs must
/// already be in blocks form.
pub fn llvm_module_text(state: &CompilerState, spec: &ModSpec) -> Result<String> {
    let module = state
        .modules
        .get(spec)
        .ok_or_else(|| CompileError::internal(format!("module {spec} not loaded")))?;

    let mut emitted = Vec::new();
    for defs in module.implementation().procs.values() {
        for def in defs {
            match &def.impln {
                ProcImpl::Blocks { code, .. } => emitted.push(code.clone()),
                ProcImpl::Prim { proto, body, .. } => {
                    let proc_spec = ProcSpec::new(spec.clone(), def.name, def.id);
                    emitted.push(llvm::emit_proc(&proc_spec, proto, body)?);
                }
                ProcImpl::Source { .. } => {}
            }
        }
    }

    Ok(llvm::assemble_module(&emitted))
}
